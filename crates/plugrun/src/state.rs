//! # Remote State Store
//!
//! Device storage and property state as seen by a plugin. The host owns the
//! truth; it pushes changes by calling this store over RPC, and plugin code
//! reads from it locally.
//!
//! ## Invariants
//!
//! - Device storage is keyed by native id; one device id maps to at most one
//!   native id.
//! - A device id missing from the state map means "no known state", which is
//!   different from an entry with no properties.
//! - State entries are created only by `update_device_state`. `notify` never
//!   creates one.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

use dashmap::DashMap;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::handle::Capability;
use crate::handle::Fault;
use crate::handle::Local;

/// Properties of one device, by property name.
pub type PropertyMap = HashMap<String, Value>;

/// Persistent key/value storage attached to a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceStorage {
    pub id: String,
    pub native_id: String,
    pub storage: HashMap<String, String>,
}

/// A property event accepted by `notify`, as handed to the listener.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceEvent {
    pub id: String,
    pub event_time: u64,
    pub interface_name: String,
    pub property: Option<String>,
    pub value: Value,
    pub changed: bool,
}

/// Receives device events after the store has applied them.
pub trait StateListener: Send + Sync + 'static {
    fn on_event(&self, event: &DeviceEvent);
}

/// Storage records by native id, plus the reverse index. Both change under
/// one lock so a device id never ends up with two records.
#[derive(Debug, Default)]
struct StorageTable {
    by_native_id: HashMap<String, DeviceStorage>,
    native_ids: HashMap<String, String>,
}

impl StorageTable {
    fn upsert(&mut self, native_id: &str, id: &str, storage: HashMap<String, String>) {
        if let Some(previous) = self.native_ids.insert(id.to_string(), native_id.to_string()) {
            if previous != native_id {
                self.by_native_id.remove(&previous);
            }
        }
        let record = DeviceStorage {
            id: id.to_string(),
            native_id: native_id.to_string(),
            storage,
        };
        // another device may have held this native id
        if let Some(displaced) = self.by_native_id.insert(native_id.to_string(), record) {
            if displaced.id != id {
                self.native_ids.remove(&displaced.id);
            }
        }
    }

    fn clear(&mut self, id: &str) -> Option<String> {
        let native_id = self.native_ids.remove(id)?;
        self.by_native_id.remove(&native_id);
        Some(native_id)
    }
}

/// The plugin-side mirror of device storage and state.
#[derive(Default)]
pub struct StateStore {
    storage: Mutex<StorageTable>,
    state: DashMap<String, PropertyMap>,
    listener: Option<Arc<dyn StateListener>>,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store that forwards every accepted event to `listener`.
    pub fn with_listener(listener: Arc<dyn StateListener>) -> Self {
        Self {
            listener: Some(listener),
            ..Self::default()
        }
    }

    /// Upserts the storage record for `native_id`.
    ///
    /// An absent or empty `native_id` removes whatever mapping `id` currently
    /// has. Giving `id` a new native id drops its mapping under the old one.
    pub fn set_native_id(&self, native_id: Option<&str>, id: &str, storage: Option<HashMap<String, String>>) {
        let mut table = self.table();
        match native_id.filter(|native_id| !native_id.is_empty()) {
            Some(native_id) => table.upsert(native_id, id, storage.unwrap_or_default()),
            None => {
                let removed = table.clear(id);
                tracing::debug!(id, ?removed, "native id cleared");
            }
        }
    }

    fn table(&self) -> MutexGuard<'_, StorageTable> {
        self.storage.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// `None` evicts the device's state entirely; otherwise merges the given
    /// properties into the existing entry, creating it if needed.
    pub fn update_device_state(&self, id: &str, state: Option<PropertyMap>) {
        match state {
            None => {
                self.state.remove(id);
            }
            Some(properties) => {
                self.state.entry(id.to_string()).or_default().extend(properties);
            }
        }
    }

    /// Applies a property event to a device with known state.
    ///
    /// Returns false, and changes nothing, when the device has no state entry.
    pub fn notify(
        &self,
        id: &str,
        event_time: u64,
        interface_name: &str,
        property: Option<&str>,
        value: Value,
        changed: bool,
    ) -> bool {
        let Some(mut properties) = self.state.get_mut(id) else {
            tracing::warn!(id, interface_name, "state missing for device, ignoring event");
            return false;
        };
        if let Some(property) = property {
            properties.insert(property.to_string(), value.clone());
        }
        drop(properties);

        if let Some(listener) = &self.listener {
            listener.on_event(&DeviceEvent {
                id: id.to_string(),
                event_time,
                interface_name: interface_name.to_string(),
                property: property.map(str::to_string),
                value,
                changed,
            });
        }
        true
    }

    pub fn device_state(&self, id: &str) -> Option<PropertyMap> {
        self.state.get(id).map(|entry| entry.value().clone())
    }

    pub fn device_storage(&self, native_id: &str) -> Option<DeviceStorage> {
        self.table().by_native_id.get(native_id).cloned()
    }

    pub fn native_id_of(&self, id: &str) -> Option<String> {
        self.table().native_ids.get(id).cloned()
    }

    /// Number of devices with known state.
    pub fn len(&self) -> usize {
        self.state.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.is_empty()
    }
}

// ============================================================================
//  RPC SURFACE
// ============================================================================

#[async_trait::async_trait]
impl Capability for StateStore {
    async fn call(&self, method: &str, args: Vec<Local>) -> Result<Local, Fault> {
        let args = Args::new(args)?;
        match method {
            "setNativeId" => {
                let native_id = args.opt_string(0)?;
                let id = args.string(1)?;
                let storage = args.decode(2)?;
                self.set_native_id(native_id.as_deref(), &id, storage);
                Ok(Local::null())
            }
            "updateDeviceState" => {
                let id = args.string(0)?;
                let state = args.decode(1)?;
                self.update_device_state(&id, state);
                Ok(Local::null())
            }
            "notify" => {
                let id = args.string(0)?;
                let event_time = args.timestamp(1)?;
                let interface_name = args.string(2)?;
                let property = args.opt_string(3)?;
                let value = args.get(4).clone();
                let changed = args.get(5).as_bool().unwrap_or(false);
                self.notify(&id, event_time, &interface_name, property.as_deref(), value, changed);
                Ok(Local::null())
            }
            "getDeviceState" => {
                let id = args.string(0)?;
                Ok(Local::Value(serde_json::to_value(self.device_state(&id))?))
            }
            "getDeviceStorage" => {
                let native_id = args.string(0)?;
                Ok(Local::Value(serde_json::to_value(self.device_storage(&native_id))?))
            }
            other => Err(Fault::method_not_found(other)),
        }
    }
}

/// Positional arguments; missing trailing arguments read as null.
struct Args(Vec<Value>);

impl Args {
    fn new(args: Vec<Local>) -> Result<Self, Fault> {
        args.into_iter()
            .map(|arg| arg.into_value().ok_or_else(|| Fault::bad_arguments("Handles are not accepted here")))
            .collect::<Result<Vec<_>, _>>()
            .map(Self)
    }

    fn get(&self, index: usize) -> &Value {
        self.0.get(index).unwrap_or(&Value::Null)
    }

    fn string(&self, index: usize) -> Result<String, Fault> {
        self.get(index)
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| Fault::bad_arguments(format!("Argument {} must be a string", index)))
    }

    fn opt_string(&self, index: usize) -> Result<Option<String>, Fault> {
        match self.get(index) {
            Value::Null => Ok(None),
            Value::String(s) => Ok(Some(s.clone())),
            _ => Err(Fault::bad_arguments(format!("Argument {} must be a string or null", index))),
        }
    }

    /// Event times arrive as milliseconds, integral or not.
    fn timestamp(&self, index: usize) -> Result<u64, Fault> {
        let value = self.get(index);
        value
            .as_u64()
            .or_else(|| value.as_f64().filter(|t| *t >= 0.0).map(|t| t as u64))
            .ok_or_else(|| Fault::bad_arguments(format!("Argument {} must be a timestamp", index)))
    }

    fn decode<T: serde::de::DeserializeOwned>(&self, index: usize) -> Result<T, Fault> {
        Ok(serde_json::from_value(self.get(index).clone())?)
    }
}
