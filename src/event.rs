//! Events that can occur when connected to WhatsApp Web.

use json::JsonValue;
use qrcode::QrCode;

use crate::session::{PersistentSession, UserMetaData};
use crate::errors::WaError;
use crate::{Chat, Contact};

/// An event arising from a WhatsApp Web connection.
pub enum WaEvent {
    /// The underlying websocket has connected.
    ///
    /// Note that this does not mean you can send messages yet;
    /// a session must still be negotiated!
    WebsocketConnected,
    /// A QR code is ready for the user to scan.
    ///
    /// This usually needs to be scanned within a few seconds of this
    /// message being received in order to work.
    ScanCode {
        /// The rendered code.
        code: QrCode,
        /// The raw `ref,publicKey,clientId` payload the code encodes, for
        /// callers that surface it some other way.
        payload: String,
    },
    /// A session has been successfully established, and the connection
    /// is now ready to use.
    ///
    /// You should store the value of `persistent` somewhere,
    /// and use it to avoid scanning the QR code in future.
    SessionEstablished {
        /// Persistent session data for future sessions.
        ///
        /// `None` if the server validated the session without issuing key
        /// material, in which case there is nothing worth saving.
        persistent: Option<PersistentSession>,
        /// The logged-in account.
        user: UserMetaData,
    },
    /// Initial burst of chats open in WhatsApp.
    InitialChats(Vec<Chat>),
    /// Initial burst of contacts from the user's address book.
    InitialContacts(Vec<Contact>),
    /// One decoded message node forwarded from the unread backlog.
    UnreadMessage(JsonValue),
    /// Chats, contacts and the unread backlog have all arrived.
    InitialLoadComplete,
    /// The reply to a request sent with a reply expectation, or `Timeout`
    /// if its deadline passed first.
    Reply {
        tag: String,
        result: Result<JsonValue, WaError>,
    },
    /// The connection was lost and the supervisor is about to redial.
    Reconnecting {
        attempt: u32,
    },
    /// A decoded frame nothing was waiting for.
    Unhandled {
        tag: String,
        payload: JsonValue,
    },
}
