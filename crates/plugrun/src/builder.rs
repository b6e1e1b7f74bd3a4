//! # Peer Builder
//!
//! Collects the root capabilities and settings of a peer before it starts.
//! Names are write-once: registering the same name twice is an error, and the
//! table is frozen once `connect` hands it to the running peer.
//!
//! ```ignore
//! let peer = PeerBuilder::new("plugin")
//!     .capability("stateStore", Arc::new(StateStore::new()))?
//!     .call_timeout(Duration::from_secs(30))
//!     .connect(StreamTransport::stdio());
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::handle::Capability;
use crate::peer::Error;
use crate::peer::Peer;
use crate::peer::Result;
use crate::transport::Transport;

/// Per-peer settings.
#[derive(Debug, Clone, Default)]
pub struct PeerConfig {
    /// Deadline for each outgoing call. `None` waits until the reply arrives or
    /// the peer closes.
    pub call_timeout: Option<Duration>,
}

pub struct PeerBuilder {
    name: String,
    config: PeerConfig,
    capabilities: HashMap<String, Arc<dyn Capability>>,
}

impl PeerBuilder {
    /// The name is only used in logs.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config: PeerConfig::default(),
            capabilities: HashMap::new(),
        }
    }

    /// Exposes `capability` under `name` to remote callers.
    pub fn capability(mut self, name: impl Into<String>, capability: Arc<dyn Capability>) -> Result<Self> {
        let name = name.into();
        if self.capabilities.contains_key(&name) {
            return Err(Error::DuplicateCapability(name));
        }
        self.capabilities.insert(name, capability);
        Ok(self)
    }

    pub fn call_timeout(mut self, limit: Duration) -> Self {
        self.config.call_timeout = Some(limit);
        self
    }

    pub fn config(mut self, config: PeerConfig) -> Self {
        self.config = config;
        self
    }

    /// Starts the peer on `transport`. Must be called inside a tokio runtime.
    pub fn connect(self, transport: impl Transport) -> Peer {
        self.connect_shared(Arc::new(transport))
    }

    pub fn connect_shared(self, transport: Arc<dyn Transport>) -> Peer {
        Peer::start(self.name, self.config, self.capabilities, transport)
    }
}
