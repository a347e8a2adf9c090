//! Plaintext JSON messages exchanged during the handshake, and parsing of
//! the node-shaped payloads the binary decoder hands back.

use json::JsonValue;
use std::str::FromStr;

use crate::errors::*;
use crate::session::{PhoneInfo, ValidationInfo};
use crate::{Chat, Contact, Jid};

/// Client version advertised in the `init` frame.
const CLIENT_VERSION: [u16; 3] = [2, 2126, 14];
/// Browser description advertised in the `init` frame.
const BROWSER_DESCRIPTION: [&str; 2] = ["whatsappweb-session", "Chromium"];

pub(crate) fn build_init_request(client_id: &str) -> JsonValue {
    array!["admin", "init",
           array![CLIENT_VERSION[0], CLIENT_VERSION[1], CLIENT_VERSION[2]],
           array![BROWSER_DESCRIPTION[0], BROWSER_DESCRIPTION[1]],
           client_id,
           true]
}

pub(crate) fn build_takeover_request(client_token: &str, server_token: &str, client_id: &str) -> JsonValue {
    array!["admin", "login", client_token, server_token, client_id, "takeover"]
}

pub(crate) fn build_challenge_response(signature: &[u8], server_token: &str, client_id: &str) -> JsonValue {
    array!["admin", "challenge", base64::encode(signature), server_token, client_id]
}

/// The `status` field of a reply, tolerating both numeric and string forms.
pub(crate) fn response_status(payload: &JsonValue) -> Option<u16> {
    payload["status"].as_u16()
        .or_else(|| payload["status"].as_str().and_then(|s| s.parse().ok()))
}

/// Checks a status reply, mapping the server's well-known refusal codes.
pub(crate) fn expect_status_ok(payload: &JsonValue) -> Result<u16> {
    let status = response_status(payload).ok_or(WaError::JsonFieldMissing("status"))?;
    match status {
        200..=299 => Ok(status),
        401 => Err(WaError::Unpaired),
        429 => Err(WaError::Denied),
        other => Err(WaError::StatusCode(other)),
    }
}

/// Parses the reply to `init`, returning the `ref` to embed in the QR payload.
pub(crate) fn parse_init_response(payload: &JsonValue) -> Result<String> {
    expect_status_ok(payload)?;
    Ok(payload["ref"].as_str()
        .ok_or(WaError::JsonFieldMissing("ref"))?
        .to_string())
}

/// A `challenge` string carried in a handshake frame, already base64-decoded.
pub(crate) fn parse_challenge(payload: &JsonValue) -> Result<Option<Vec<u8>>> {
    match payload[1]["challenge"].as_str() {
        Some(challenge) => Ok(Some(base64::decode(challenge)?)),
        None => Ok(None),
    }
}

/// Parses the validation payload (`payload[1]` of the `Conn` frame).
pub(crate) fn parse_validation(v: &JsonValue) -> Result<ValidationInfo> {
    if v["connected"].as_bool() != Some(true) {
        return Err(WaError::Malformed("validation frame without connected=true"));
    }
    let jid = Jid::from_str(v["wid"].as_str().ok_or(WaError::JsonFieldMissing("wid"))?)?;
    let field = |name: &str| v[name].as_str().map(|s| s.to_string());
    Ok(ValidationInfo {
        jid,
        pushname: field("pushname"),
        phone: PhoneInfo::parse(&v["phone"]),
        client_token: field("clientToken"),
        server_token: field("serverToken"),
        secret: field("secret"),
    })
}

/// Messages the server pushes without a matching awaiter.
#[derive(Debug)]
pub(crate) enum ServerMessage {
    /// `["Conn", {..}]` — the validation frame.
    ConnectionAck(JsonValue),
    /// `["Cmd", {type: "challenge", ..}]` — prove possession of `macKey`.
    ChallengeRequest(Vec<u8>),
    /// `["Cmd", {type: "disconnect", kind?}]`.
    Disconnect(Option<String>),
}
impl ServerMessage {
    pub(crate) fn deserialize(payload: &JsonValue) -> Result<Option<ServerMessage>> {
        match payload[0].as_str() {
            Some("Conn") => Ok(Some(ServerMessage::ConnectionAck(payload[1].clone()))),
            Some("Cmd") => match payload[1]["type"].as_str() {
                Some("challenge") => {
                    let challenge = payload[1]["challenge"].as_str()
                        .ok_or(WaError::JsonFieldMissing("challenge"))?;
                    Ok(Some(ServerMessage::ChallengeRequest(base64::decode(challenge)?)))
                }
                Some("disconnect") => {
                    Ok(Some(ServerMessage::Disconnect(payload[1]["kind"].as_str().map(|s| s.to_string()))))
                }
                _ => Ok(None),
            },
            _ => Ok(None),
        }
    }
}

fn attr_i64(attrs: &JsonValue, name: &str) -> Option<i64> {
    attrs[name].as_i64()
        .or_else(|| attrs[name].as_str().and_then(|s| s.parse().ok()))
}

fn attr_flag(attrs: &JsonValue, name: &str) -> bool {
    attrs[name].as_bool()
        .or_else(|| attrs[name].as_str().map(|s| s == "true"))
        .unwrap_or(false)
}

/// Parses the chat list node `["response", {type: "chat"}, [["chat", {..}], ..]]`.
/// Chats with an unparsable jid are skipped.
pub(crate) fn parse_chat_list(payload: &JsonValue) -> Vec<Chat> {
    let mut chats = Vec::new();
    for child in payload[2].members() {
        if child[0].as_str() != Some("chat") {
            continue;
        }
        let attrs = &child[1];
        let jid = match attrs["jid"].as_str().map(Jid::from_str) {
            Some(Ok(jid)) => jid,
            _ => {
                warn!("Skipping chat with missing or invalid jid: {}", attrs["jid"]);
                continue;
            }
        };
        // `count` is a decimal string; -1 means "unknown", which we treat as
        // nothing to forward
        let unread = attr_i64(attrs, "count").filter(|c| *c > 0).unwrap_or(0) as u32;
        chats.push(Chat {
            name: attrs["name"].as_str().map(|s| s.to_string()),
            jid,
            last_activity: attr_i64(attrs, "t").unwrap_or(0),
            unread,
            pin_time: attr_i64(attrs, "pin").filter(|p| *p != 0),
            mute_until: attr_i64(attrs, "mute").filter(|m| *m != 0),
            spam: attr_flag(attrs, "spam"),
            read_only: attr_flag(attrs, "read_only"),
        });
    }
    chats
}

/// Parses the contact list node `["response", {type: "contacts"}, [["user", {..}], ..]]`.
pub(crate) fn parse_contact_list(payload: &JsonValue) -> Vec<Contact> {
    let mut contacts = Vec::new();
    for child in payload[2].members() {
        if child[0].as_str() != Some("user") {
            continue;
        }
        let attrs = &child[1];
        let jid = match attrs["jid"].as_str().map(Jid::from_str) {
            Some(Ok(jid)) => jid,
            _ => {
                warn!("Skipping contact with missing or invalid jid: {}", attrs["jid"]);
                continue;
            }
        };
        contacts.push(Contact {
            name: attrs["name"].as_str().map(|s| s.to_string()),
            notify: attrs["notify"].as_str().map(|s| s.to_string()),
            jid,
        });
    }
    contacts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_request_shape() {
        let req = build_init_request("AAAAAAAAAAAAAAAAAAAAAA");
        assert_eq!(req[0], "admin");
        assert_eq!(req[1], "init");
        assert_eq!(req[2][0].as_u16(), Some(CLIENT_VERSION[0]));
        assert_eq!(req[4], "AAAAAAAAAAAAAAAAAAAAAA");
        assert_eq!(req[5], true);
    }

    #[test]
    fn status_mapping() {
        assert_eq!(expect_status_ok(&object!{"status" => 200}).unwrap(), 200);
        match expect_status_ok(&object!{"status" => 401}) {
            Err(WaError::Unpaired) => {}
            other => panic!("expected Unpaired, got {:?}", other),
        }
        match expect_status_ok(&object!{"status" => 429}) {
            Err(WaError::Denied) => {}
            other => panic!("expected Denied, got {:?}", other),
        }
        match expect_status_ok(&object!{"status" => 500}) {
            Err(WaError::StatusCode(500)) => {}
            other => panic!("expected StatusCode, got {:?}", other),
        }
        // string-typed statuses occur in the wild
        assert_eq!(expect_status_ok(&object!{"status" => "200"}).unwrap(), 200);
    }

    #[test]
    fn init_response_carries_the_ref() {
        let payload = object!{"status" => 200, "ref" => "1@abcdef", "ttl" => 20000};
        assert_eq!(parse_init_response(&payload).unwrap(), "1@abcdef");
        assert!(parse_init_response(&object!{"status" => 200}).is_err());
    }

    #[test]
    fn validation_requires_connected() {
        let v = object!{"connected" => true, "wid" => "15551234@c.us", "pushname" => "A"};
        let info = parse_validation(&v).unwrap();
        assert_eq!(info.jid.to_string(), "15551234@s.whatsapp.net");
        assert_eq!(info.pushname.as_deref(), Some("A"));
        assert!(info.secret.is_none());

        match parse_validation(&object!{"wid" => "15551234@c.us"}) {
            Err(WaError::Malformed(_)) => {}
            other => panic!("expected Malformed, got {:?}", other),
        }
    }

    #[test]
    fn server_message_variants() {
        let conn = array!["Conn", object!{"connected" => true}];
        match ServerMessage::deserialize(&conn).unwrap() {
            Some(ServerMessage::ConnectionAck(v)) => assert_eq!(v["connected"], true),
            other => panic!("expected ConnectionAck, got {:?}", other),
        }

        let challenge = array!["Cmd", object!{"type" => "challenge", "challenge" => base64::encode(b"abc")}];
        match ServerMessage::deserialize(&challenge).unwrap() {
            Some(ServerMessage::ChallengeRequest(c)) => assert_eq!(c, b"abc"),
            other => panic!("expected ChallengeRequest, got {:?}", other),
        }

        let disconnect = array!["Cmd", object!{"type" => "disconnect", "kind" => "replaced"}];
        match ServerMessage::deserialize(&disconnect).unwrap() {
            Some(ServerMessage::Disconnect(Some(kind))) => assert_eq!(kind, "replaced"),
            other => panic!("expected Disconnect, got {:?}", other),
        }

        assert!(ServerMessage::deserialize(&array!["Props", object!{}]).unwrap().is_none());
    }

    #[test]
    fn chat_list_parses_counters_leniently() {
        let payload = array!["response", object!{"type" => "chat"}, array![
            array!["chat", object!{"jid" => "111@c.us", "name" => "One", "t" => "1500000000", "count" => "2"}],
            array!["chat", object!{"jid" => "222@c.us", "count" => "-1", "t" => 1500000001}],
            array!["chat", object!{"jid" => "333@c.us", "count" => "garbage", "spam" => "true"}],
            array!["chat", object!{"count" => "5"}]
        ]];
        let chats = parse_chat_list(&payload);
        assert_eq!(chats.len(), 3);
        assert_eq!(chats[0].unread, 2);
        assert_eq!(chats[0].last_activity, 1500000000);
        assert_eq!(chats[0].name.as_deref(), Some("One"));
        assert_eq!(chats[1].unread, 0);
        assert_eq!(chats[1].last_activity, 1500000001);
        assert_eq!(chats[2].unread, 0);
        assert!(chats[2].spam);
    }

    #[test]
    fn contact_list_parses() {
        let payload = array!["response", object!{"type" => "contacts"}, array![
            array!["user", object!{"jid" => "111@c.us", "name" => "Alice", "notify" => "allie"}],
            array!["user", object!{"jid" => "bogus"}]
        ]];
        let contacts = parse_contact_list(&payload);
        assert_eq!(contacts.len(), 1);
        assert_eq!(contacts[0].name.as_deref(), Some("Alice"));
        assert_eq!(contacts[0].notify.as_deref(), Some("allie"));
    }
}
