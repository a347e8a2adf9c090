use std::io;
use ring;
use json;
use base64;
use qrcode;
use crypto::symmetriccipher::SymmetricCipherError;

macro_rules! impl_from_for_error {
        ($error:ident, $($var:ident => $orig:ty),*) => {
                $(
                        impl From<$orig> for $error {
                                fn from(err: $orig) -> $error {
                                        $error::$var(err)
                                }
                        }
                 )*
        }
}

#[macro_export]
macro_rules! bail_untyped {
        ($msg:expr) => {
                return Err(WaError::Untyped($msg.into()));
        };
        ($($arg:tt)*) => {
                return Err(WaError::UntypedOwned(format!($($arg)*)));
        }
}

pub trait WaErrorContext {
        fn with_context(self, ctx: &'static str) -> Self;
        fn with_owned_context<T: Into<String>>(self, ctx: T) -> Self;
}
impl<T> WaErrorContext for Result<T> {
        fn with_context(self, ctx: &'static str) -> Self {
                self.map_err(|e| {
                        WaError::Context(ctx, Box::new(e))
                })
        }
        fn with_owned_context<U: Into<String>>(self, ctx: U) -> Self {
                self.map_err(|e| {
                        WaError::OwnedContext(ctx.into(), Box::new(e))
                })
        }
}

/// Why the server told us to go away.
#[derive(Debug, Copy, Clone)]
pub enum DisconnectReason {
        /// Another web session took over this `clientID`.
        Replaced,
        /// The phone unpaired this client.
        Removed
}

#[derive(Debug, Fail)]
pub enum WaError {
        #[fail(display = "I/O error: {}", _0)]
        Io(io::Error),
        #[fail(display = "WebSocket error: {}", _0)]
        Websocket(tokio_tungstenite::tungstenite::Error),
        #[fail(display = "Crypto error: {}", _0)]
        Crypto(ring::error::Unspecified),
        #[fail(display = "Cipher error: {:?}", _0)]
        Cipher(SymmetricCipherError),
        #[fail(display = "JSON error: {}", _0)]
        Json(json::Error),
        #[fail(display = "base64 decode error: {}", _0)]
        Base64(base64::DecodeError),
        #[fail(display = "credential encoding error: {}", _0)]
        Bincode(bincode::Error),
        #[fail(display = "QR code error: {}", _0)]
        Qr(qrcode::types::QrError),
        #[fail(display = "Missing JSON field \"{}\"", _0)]
        JsonFieldMissing(&'static str),
        #[fail(display = "malformed server payload: {}", _0)]
        Malformed(&'static str),
        #[fail(display = "HMAC verification failed")]
        HmacMismatch,
        #[fail(display = "received status code {}", _0)]
        StatusCode(u16),
        #[fail(display = "unpaired from phone")]
        Unpaired,
        #[fail(display = "request denied, try reconnecting")]
        Denied,
        #[fail(display = "connection already established")]
        AlreadyConnected,
        #[fail(display = "connection timed out")]
        Timeout,
        #[fail(display = "operation cancelled")]
        Cancelled,
        #[fail(display = "transport closed: {}", _0)]
        TransportClosed(&'static str),
        #[fail(display = "disconnected from server")]
        Disconnected(DisconnectReason),
        #[fail(display = "invalid session state for message")]
        InvalidSessionState,
        #[fail(display = "while {}: {}", _0, _1)]
        Context(&'static str, Box<WaError>),
        #[fail(display = "while {}: {}", _0, _1)]
        OwnedContext(String, Box<WaError>),
        #[fail(display = "{}", _0)]
        UntypedOwned(String),
        #[fail(display = "{}", _0)]
        Untyped(&'static str)
}

pub type WaResult<T> = ::std::result::Result<T, WaError>;
pub(crate) type Result<T> = WaResult<T>;

impl_from_for_error!(WaError,
                     Io => io::Error,
                     Websocket => tokio_tungstenite::tungstenite::Error,
                     Crypto => ring::error::Unspecified,
                     Cipher => SymmetricCipherError,
                     Json => json::Error,
                     Base64 => base64::DecodeError,
                     Bincode => bincode::Error,
                     Qr => qrcode::types::QrError,
                     UntypedOwned => String,
                     Untyped => &'static str);
