//! # plugrun
//!
//! The plugin side (and host side) of a bidirectional RPC session over a pair
//! of byte streams. Either end can expose named capabilities, call the other
//! end's capabilities, and pass objects and lazy streams by handle.

pub mod builder;
pub mod handle;
pub mod mock_transport;
pub mod peer;
pub mod remote;
pub mod state;
pub mod transport;

pub use builder::PeerBuilder;
pub use builder::PeerConfig;
pub use handle::Capability;
pub use handle::Fault;
pub use handle::Function;
pub use handle::Local;
pub use handle::ValueStream;
pub use handle::function;
pub use peer::Error;
pub use peer::Peer;
pub use remote::RemoteObject;
pub use remote::RemoteStream;
pub use state::DeviceEvent;
pub use state::DeviceStorage;
pub use state::StateListener;
pub use state::StateStore;
pub use transport::StreamTransport;
pub use transport::Transport;

#[cfg(test)]
mod tests;
