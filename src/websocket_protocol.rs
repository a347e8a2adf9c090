//! Outer framing of websocket traffic: `tag "," body`, with a special case
//! for the server's `!<unix-ms>` heartbeat frames.

use std::borrow::Cow;
use json::JsonValue;
use tokio_tungstenite::tungstenite::Message;

pub(crate) struct Frame<'a> {
    pub tag: Cow<'a, str>,
    pub payload: FramePayload<'a>,
}

pub(crate) enum FramePayload<'a> {
    /// Plaintext JSON, recognized by a leading `[` or `{`.
    Json(JsonValue),
    /// An encrypted body: 32 bytes of HMAC followed by AES-CBC ciphertext.
    Binary(&'a [u8]),
    /// A bare ack frame (`"<tag>,"`).
    Empty,
}

pub(crate) enum Inbound<'a> {
    /// Reply to our `?,,` keep-alive probe; value is a Unix-ms timestamp.
    Heartbeat(i64),
    Frame(Frame<'a>),
}

impl<'a> Inbound<'a> {
    pub(crate) fn deserialize(message: &'a Message) -> Option<Inbound<'a>> {
        match message {
            Message::Text(text) => {
                if let Some(rest) = text.strip_prefix('!') {
                    if let Ok(timestamp) = rest.parse::<i64>() {
                        return Some(Inbound::Heartbeat(timestamp));
                    }
                }
                let comma = text.find(',')?;
                let (tag, body) = (&text[..comma], &text[comma + 1..]);
                let payload = if body.starts_with('[') || body.starts_with('{') {
                    FramePayload::Json(json::parse(body).ok()?)
                } else {
                    FramePayload::Empty
                };
                Some(Inbound::Frame(Frame { tag: Cow::Borrowed(tag), payload }))
            }
            Message::Binary(bytes) => {
                let comma = bytes.iter().position(|b| *b == b',')?;
                let tag = ::std::str::from_utf8(&bytes[..comma]).ok()?;
                Some(Inbound::Frame(Frame {
                    tag: Cow::Borrowed(tag),
                    payload: FramePayload::Binary(&bytes[comma + 1..]),
                }))
            }
            _ => None,
        }
    }
}

pub(crate) fn serialize_json_frame(tag: &str, payload: &JsonValue) -> Message {
    Message::Text(format!("{},{}", tag, payload.dump()))
}

pub(crate) fn serialize_binary_frame(tag: &str, body: &[u8]) -> Message {
    let mut out = Vec::with_capacity(tag.len() + 1 + body.len());
    out.extend_from_slice(tag.as_bytes());
    out.push(b',');
    out.extend_from_slice(body);
    Message::Binary(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_frames_are_recognized() {
        let msg = Message::Text("!1585069948640".to_string());
        match Inbound::deserialize(&msg) {
            Some(Inbound::Heartbeat(ts)) => assert_eq!(ts, 1585069948640),
            _ => panic!("expected heartbeat"),
        }
    }

    #[test]
    fn json_frames_round_trip() {
        let payload = array!["admin", "init"];
        let msg = serialize_json_frame("1585.--7", &payload);
        match Inbound::deserialize(&msg) {
            Some(Inbound::Frame(Frame { tag, payload: FramePayload::Json(p) })) => {
                assert_eq!(tag, "1585.--7");
                assert_eq!(p, payload);
            }
            _ => panic!("expected json frame"),
        }
    }

    #[test]
    fn binary_frames_split_on_the_first_comma() {
        let msg = serialize_binary_frame("s2", &[0xde, 0xad, b',', 0xbe, 0xef]);
        match Inbound::deserialize(&msg) {
            Some(Inbound::Frame(Frame { tag, payload: FramePayload::Binary(body) })) => {
                assert_eq!(tag, "s2");
                assert_eq!(body, &[0xde, 0xad, b',', 0xbe, 0xef]);
            }
            _ => panic!("expected binary frame"),
        }
    }

    #[test]
    fn empty_payload_frames() {
        let msg = Message::Text("3EB0D1C5A52F,".to_string());
        match Inbound::deserialize(&msg) {
            Some(Inbound::Frame(Frame { tag, payload: FramePayload::Empty })) => {
                assert_eq!(tag, "3EB0D1C5A52F");
            }
            _ => panic!("expected empty frame"),
        }
    }

    #[test]
    fn garbage_is_undecodable() {
        assert!(Inbound::deserialize(&Message::Text("no comma here".into())).is_none());
        assert!(Inbound::deserialize(&Message::Binary(vec![0xff; 4])).is_none());
    }
}
