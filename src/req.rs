//! Raw requests to be made over a WhatsApp Web connection.

use std::pin::Pin;
use std::time::{Duration, Instant};
use json::JsonValue;

use crate::conn::{WebConnection, CallbackType};
use crate::errors::*;

/// An outbound frame, pushed into the connection's `Sink` side.
///
/// Both variants can register a reply expectation: the tagged response (or a
/// `Timeout`) then surfaces as a `WaEvent::Reply`.
pub enum WaRequest {
    /// A plaintext JSON frame.
    Json {
        payload: JsonValue,
        expect_reply: bool,
        timeout: Option<Duration>,
    },
    /// A pre-encoded binary node, protected with the session keys before it
    /// goes out. Fails with `InvalidSessionState` before validation.
    Binary {
        /// Correlation tag; allocated when `None`.
        tag: Option<String>,
        payload: Vec<u8>,
        expect_reply: bool,
        timeout: Option<Duration>,
    },
    /// Probe the server's liveness now instead of waiting for the ticker.
    Ping,
}
impl WaRequest {
    pub(crate) fn apply(self, conn: Pin<&mut WebConnection>) -> Result<()> {
        let conn = conn.get_mut();
        match self {
            WaRequest::Json { payload, expect_reply, timeout } => {
                let (ct, deadline) = continuation(expect_reply, timeout);
                conn.send_json_message(None, payload, ct, deadline);
                Ok(())
            }
            WaRequest::Binary { tag, payload, expect_reply, timeout } => {
                let (ct, deadline) = continuation(expect_reply, timeout);
                conn.send_binary_message(tag, &payload, ct, deadline)
            }
            WaRequest::Ping => {
                conn.send_ping();
                Ok(())
            }
        }
    }
}

fn continuation(expect_reply: bool, timeout: Option<Duration>) -> (CallbackType, Option<Instant>) {
    let ct = if expect_reply { CallbackType::Reply } else { CallbackType::Noop };
    (ct, timeout.map(|t| Instant::now() + t))
}
