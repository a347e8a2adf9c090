#[macro_use] extern crate log;
#[macro_use] extern crate json;
#[macro_use] extern crate serde_derive;
#[macro_use] extern crate failure;

#[macro_use] pub mod errors;
pub mod event;
pub mod conn;
pub mod req;
pub mod session;
pub mod registry;
pub mod decoder;
mod json_protocol;
mod websocket_protocol;
pub mod crypto;

use std::str::FromStr;
use std::fmt;
use crate::errors::*;

pub use conn::WebConnection;
pub use decoder::BinaryDecoder;
pub use session::PersistentSession;

/// Jid used to identify either a group or an individual.
///
/// Individuals are rendered in the canonical `@s.whatsapp.net` form; the
/// legacy `@c.us` suffix is accepted when parsing.
#[derive(Debug, Clone, PartialOrd, PartialEq, Ord, Eq, Hash)]
pub struct Jid {
    pub id: String,
    pub is_group: bool,
}
impl fmt::Display for Jid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let suffix = if self.is_group {
            "@g.us"
        }
        else {
            "@s.whatsapp.net"
        };
        write!(f, "{}{}", self.id, suffix)
    }
}

impl Jid {
    /// If the Jid is from an individual return the international phonenumber, else None
    pub fn phonenumber(&self) -> Option<String> {
        if !self.is_group {
            Some("+".to_string() + &self.id)
        } else {
            None
        }
    }

    pub fn from_phonenumber(mut phonenumber: String) -> Result<Jid> {
        if phonenumber.starts_with('+') {
            phonenumber.remove(0);
        }

        if phonenumber.chars().any(|c| !c.is_digit(10)) {
            return Err("not a valid phonenumber".into());
        }

        Ok(Jid { id: phonenumber, is_group: false })
    }
}

impl FromStr for Jid {
    type Err = errors::WaError;

    fn from_str(jid: &str) -> Result<Jid> {
        let at = jid.find('@').ok_or("jid missing @")?;

        let (id, suffix) = jid.split_at(at);
        Ok(Jid {
            id: id.to_string(),
            is_group: match suffix {
                "@c.us" => false,
                "@g.us" => true,
                "@s.whatsapp.net" => false,
                "@broadcast" => false,
                _ => return Err("invalid suffix".into())
            },
        })
    }
}

#[derive(Debug, Clone)]
pub struct Contact {
    ///name used in phonebook, set by user
    pub name: Option<String>,
    ///name used in pushnotification, set by opposite peer
    pub notify: Option<String>,
    pub jid: Jid,
}

#[derive(Debug, Clone)]
pub struct Chat {
    pub name: Option<String>,
    pub jid: Jid,
    pub last_activity: i64,
    /// Unread message counter as reported by the phone. The wire carries it
    /// as a decimal string; unparsable or negative values collapse to 0.
    pub unread: u32,
    pub pin_time: Option<i64>,
    pub mute_until: Option<i64>,
    pub spam: bool,
    pub read_only: bool,
}
