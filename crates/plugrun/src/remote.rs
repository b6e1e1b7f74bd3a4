//! # Remote Proxies
//!
//! Local stand-ins for objects and streams owned by the other side. A proxy
//! holds only the handle id and a weak reference to its peer; every use is
//! routed through that peer, and nothing here keeps the session alive.

use std::sync::Arc;
use std::sync::Weak;

use futures::StreamExt;
use serde_json::Value;

use plugwire::CALL_METHOD;
use plugwire::CLOSE_METHOD;
use plugwire::NEXT_METHOD;
use plugwire::RELEASE_METHOD;
use plugwire::Target;

use crate::handle::Capability;
use crate::handle::Fault;
use crate::handle::Local;
use crate::handle::ValueStream;
use crate::peer::Error;
use crate::peer::Inner;
use crate::peer::Peer;
use crate::peer::Result;

/// A remote object or callable.
#[derive(Clone)]
pub struct RemoteObject {
    id: u64,
    peer: Weak<Inner>,
}

impl RemoteObject {
    pub(crate) fn new(id: u64, peer: Weak<Inner>) -> Self {
        Self { id, peer }
    }

    /// The handle id on the owning side.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> Result<Peer> {
        self.peer.upgrade().map(Peer::from_inner).ok_or(Error::PeerDropped)
    }

    pub async fn invoke(&self, method: &str, args: Vec<Local>) -> Result<Local> {
        self.peer()?.invoke(Target::Handle(self.id), method, args).await
    }

    /// Calls the object as a function.
    pub async fn apply(&self, args: Vec<Local>) -> Result<Local> {
        self.invoke(CALL_METHOD, args).await
    }

    /// Drops the object from the owning side's handle table.
    pub async fn release(self) -> Result<()> {
        self.invoke(RELEASE_METHOD, Vec::new()).await.map(|_| ())
    }
}

/// Passing a proxy back over the wire re-exports it as a forwarding handle.
#[async_trait::async_trait]
impl Capability for RemoteObject {
    async fn call(&self, method: &str, args: Vec<Local>) -> std::result::Result<Local, Fault> {
        self.invoke(method, args).await.map_err(Fault::from)
    }
}

/// The consuming end of a stream handle.
///
/// Elements are pulled one `next` call at a time, so the producer never runs
/// ahead of the consumer. A stream that is neither exhausted nor closed keeps
/// its handle alive on the other side.
pub struct RemoteStream {
    id: u64,
    peer: Weak<Inner>,
    done: bool,
}

impl RemoteStream {
    pub(crate) fn new(id: u64, peer: Weak<Inner>) -> Self {
        Self { id, peer, done: false }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// True once the end marker arrived or `close` was sent.
    pub fn is_done(&self) -> bool {
        self.done
    }

    fn inner(&self) -> Result<Arc<Inner>> {
        self.peer.upgrade().ok_or(Error::PeerDropped)
    }

    /// Pulls the next element, or `None` once the producer is exhausted.
    pub async fn next(&mut self) -> Result<Option<Value>> {
        if self.done {
            return Ok(None);
        }
        let value = self.inner()?.invoke_raw(Target::Handle(self.id), NEXT_METHOD, Vec::new()).await?;
        if plugwire::is_end_of_stream(&value) {
            self.done = true;
            return Ok(None);
        }
        Ok(Some(value))
    }

    /// Stops the stream early and releases the handle on both sides.
    pub async fn close(mut self) -> Result<()> {
        if self.done {
            return Ok(());
        }
        self.done = true;
        self.inner()?.invoke_raw(Target::Handle(self.id), CLOSE_METHOD, Vec::new()).await?;
        Ok(())
    }

    /// Adapts the proxy to a `futures::Stream`. The first error ends the stream.
    pub fn into_stream(self) -> ValueStream {
        futures::stream::unfold(self, |mut stream| async move {
            match stream.next().await {
                Ok(Some(value)) => Some((Ok(value), stream)),
                Ok(None) => None,
                Err(e) => {
                    stream.done = true;
                    Some((Err(Fault::from(e)), stream))
                }
            }
        })
        .boxed()
    }
}
