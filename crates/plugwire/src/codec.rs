//! # Line Codec
//!
//! Translates between `Message` and the bytes of a single line.
//!
//! ## Invariants
//! - **No Delimiters Inside**: Encoded records never contain `\n`; the transport
//!   owns the delimiter.
//! - **Panic Safety**: Decoding returns `Result` for any input.

use crate::error::Error;
use crate::error::Result;
use crate::frame::Message;

/// Encodes a record as one line, without the trailing delimiter.
pub fn encode(msg: &Message) -> Result<Vec<u8>> {
    serde_json::to_vec(msg).map_err(|e| Error::Encode(e.to_string()))
}

/// Decodes one line. A trailing `\r\n` or `\n` is tolerated.
pub fn decode(line: &[u8]) -> Result<Message> {
    let line = trim_delimiter(line);
    if line.iter().all(u8::is_ascii_whitespace) {
        return Err(Error::EmptyRecord);
    }
    serde_json::from_slice(line).map_err(|e| Error::Malformed(e.to_string()))
}

/// Decodes just the correlation id from a raw line.
/// This is useful for answering a request whose body failed to decode.
pub fn decode_id(line: &[u8]) -> Option<u64> {
    let value: serde_json::Value = serde_json::from_slice(trim_delimiter(line)).ok()?;
    value.get("id")?.as_u64()
}

fn trim_delimiter(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}
