//! # plugwire
//!
//! The line-delimited record format spoken between a host and its plugins.
//!
//! ## Architecture
//!
//! Each record is one JSON object on its own line, tagged by `type`
//! (`request`, `response`, `error`) and correlated by an integer `id`.
//! Objects and streams never cross the wire directly; they travel as
//! handle markers (`{"__handle": {...}}`) that the peer runtime resolves.

pub mod codec;
pub mod error;
pub mod frame;

pub use codec::decode;
pub use codec::decode_id;
pub use codec::encode;
pub use error::Error;
pub use error::ErrorBody;
pub use error::ErrorKind;
pub use error::Result;
pub use frame::CALL_METHOD;
pub use frame::CLOSE_METHOD;
pub use frame::END_KEY;
pub use frame::HANDLE_KEY;
pub use frame::HandleKind;
pub use frame::HandleRef;
pub use frame::Message;
pub use frame::NEXT_METHOD;
pub use frame::RELEASE_METHOD;
pub use frame::Target;
pub use frame::end_of_stream;
pub use frame::is_end_of_stream;
pub use frame::is_reserved;
