//! Session management types.

use std::time::Instant;
use json::JsonValue;

use crate::errors::*;
use crate::Jid;

/// Stores persistent session data, used to login without scanning the QR code again.
///
/// The four server-issued fields only ever exist together: a session is
/// either fully restorable or fresh, never in between.
#[derive(Serialize, Deserialize, PartialEq, Debug, Clone)]
pub struct PersistentSession {
    pub client_token: String,
    pub server_token: String,
    pub client_id: [u8; 16],
    pub enc: [u8; 32],
    pub mac: [u8; 32]
}
impl PersistentSession {
    /// Serializes the credentials for handing to a persistence adapter.
    pub fn to_base64(&self) -> Result<String> {
        let raw = bincode::serialize(self)?;
        Ok(base64::encode(&raw))
    }
    /// Restores credentials previously produced by [`PersistentSession::to_base64`].
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let raw = base64::decode(encoded)?;
        Ok(bincode::deserialize(&raw)?)
    }
}

/// Information about the phone paired with this session, as reported in the
/// validation frame. Everything here is best-effort.
#[derive(Debug, Clone, Default)]
pub struct PhoneInfo {
    pub wa_version: Option<String>,
    pub os_version: Option<String>,
    pub device_manufacturer: Option<String>,
    pub device_model: Option<String>,
    pub os_build_number: Option<String>,
}
impl PhoneInfo {
    pub(crate) fn parse(phone: &JsonValue) -> Option<PhoneInfo> {
        if !phone.is_object() {
            return None;
        }
        let field = |name: &str| phone[name].as_str().map(|s| s.to_string());
        Some(PhoneInfo {
            wa_version: field("wa_version"),
            os_version: field("os_version"),
            device_manufacturer: field("device_manufacturer"),
            device_model: field("device_model"),
            os_build_number: field("os_build_number"),
        })
    }
}

/// Fields of interest extracted from the validation frame.
#[derive(Debug)]
pub(crate) struct ValidationInfo {
    pub jid: Jid,
    pub pushname: Option<String>,
    pub phone: Option<PhoneInfo>,
    pub client_token: Option<String>,
    pub server_token: Option<String>,
    pub secret: Option<String>,
}

/// The logged-in account, as confirmed by the server during validation.
#[derive(Debug, Clone)]
pub struct UserMetaData {
    /// Canonical JID of the account (`<digits>@s.whatsapp.net`).
    pub jid: Jid,
    /// The push name the user chose on the phone.
    pub name: Option<String>,
    pub phone: Option<PhoneInfo>,
}

/// Where the connection currently stands in its lifecycle. Exactly one phase
/// holds at any time; the keep-alive ticker only runs while `Live`.
#[derive(Debug, Clone)]
pub enum SessionPhase {
    Disconnected,
    /// The websocket upgrade is in flight.
    Opening,
    /// `init` has been sent; waiting for its tagged reply.
    AwaitingInit,
    /// Fresh session: the QR payload is out and `s1` is pending.
    AwaitingQRScan {
        qr_ref: String,
        our_public: Vec<u8>,
    },
    /// Restore path: `login ... takeover` sent as `s1`.
    AwaitingLoginAck,
    /// A challenge response went out; waiting for its status ack.
    AwaitingChallengeAck,
    /// Waiting for the validation frame on `s2`.
    AwaitingValidation,
    Live {
        since: Instant,
    },
    Reconnecting {
        attempt: u32,
    },
}
impl SessionPhase {
    pub fn is_live(&self) -> bool {
        match self {
            SessionPhase::Live { .. } => true,
            _ => false,
        }
    }
}

pub(crate) enum SessionState {
    PendingNew {
        private_key: Option<ring::agreement::EphemeralPrivateKey>,
        public_key: Vec<u8>,
        client_id: [u8; 16]
    },
    PendingPersistent {
        persistent_session: PersistentSession
    },
    /// Validated. `persistent_session` is `None` on the no-secret validation
    /// path, where the server never issued key material; such a session can
    /// not encrypt or decrypt binary frames.
    Established {
        client_id: [u8; 16],
        persistent_session: Option<PersistentSession>
    }
}
impl SessionState {
    pub(crate) fn pending_new() -> Result<Self> {
        use crate::crypto;

        let client_id = crypto::generate_client_id()?;
        let (private_key, public_key) = crypto::generate_keypair()?;
        Ok(SessionState::PendingNew {
            private_key: Some(private_key),
            public_key,
            client_id,
        })
    }
    pub(crate) fn pending_persistent(sess: PersistentSession) -> Self {
        SessionState::PendingPersistent {
            persistent_session: sess
        }
    }
    pub(crate) fn client_id(&self) -> [u8; 16] {
        match self {
            SessionState::PendingNew { client_id, .. } => *client_id,
            SessionState::PendingPersistent { persistent_session } => persistent_session.client_id,
            SessionState::Established { client_id, .. } => *client_id,
        }
    }
    pub(crate) fn persistent(&self) -> Option<&PersistentSession> {
        match self {
            SessionState::PendingNew { .. } => None,
            SessionState::PendingPersistent { persistent_session } => Some(persistent_session),
            SessionState::Established { persistent_session, .. } => persistent_session.as_ref(),
        }
    }
    /// Whether this state carries the full credential set needed to log in
    /// without a QR scan.
    pub(crate) fn is_restorable(&self) -> bool {
        match self {
            SessionState::PendingNew { .. } => false,
            _ => self.persistent().is_some(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::PersistentSession;

    #[test]
    fn credentials_survive_the_base64_adapter() {
        let sess = PersistentSession {
            client_token: "ct".into(),
            server_token: "st".into(),
            client_id: [7u8; 16],
            enc: [1u8; 32],
            mac: [2u8; 32],
        };
        let encoded = sess.to_base64().unwrap();
        assert_eq!(PersistentSession::from_base64(&encoded).unwrap(), sess);
    }

    #[test]
    fn garbage_credentials_are_rejected() {
        assert!(PersistentSession::from_base64("not base64 at all!").is_err());
    }
}
