//! Seam for the externally supplied binary node codec.

use json::JsonValue;
use crate::errors::*;

/// Decodes the plaintext body of an encrypted frame into the nested
/// `[name, attrs, children]` array shape that dispatch operates on.
///
/// The wire format of binary nodes is deliberately not this crate's concern;
/// supply whichever implementation matches the advertised client version.
/// Closures of the right shape implement the trait directly.
pub trait BinaryDecoder: Send {
    fn decode(&mut self, payload: &[u8]) -> Result<JsonValue>;
}

impl<F> BinaryDecoder for F
    where F: FnMut(&[u8]) -> Result<JsonValue> + Send {
    fn decode(&mut self, payload: &[u8]) -> Result<JsonValue> {
        self(payload)
    }
}
