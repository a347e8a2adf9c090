//! Correlation of tagged replies and typed notifications to continuations.
//!
//! Two kinds of entries live here: one-shot awaiters keyed by the message
//! tag of a request we sent, and structural entries keyed by the shape of a
//! decoded payload (`[name, attrs, children]`). Tag matches always win and
//! are delivered at most once.

use std::collections::HashMap;
use std::time::Instant;
use json::JsonValue;

/// Structural key into a decoded payload.
///
/// `attr_key`/`attr_value` select on the payload's attribute map: a key/value
/// pair is most specific, a bare key matches any value, and no attribute at
/// all is the catch-all. `child` selects on the head of the first child node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerPath {
    pub function: String,
    pub attr_key: Option<String>,
    pub attr_value: Option<String>,
    pub child: Option<String>,
}
impl HandlerPath {
    pub fn function(function: &str) -> HandlerPath {
        HandlerPath {
            function: function.to_string(),
            attr_key: None,
            attr_value: None,
            child: None,
        }
    }
    pub fn attr(mut self, key: &str, value: &str) -> HandlerPath {
        self.attr_key = Some(key.to_string());
        self.attr_value = Some(value.to_string());
        self
    }
    pub fn attr_key(mut self, key: &str) -> HandlerPath {
        self.attr_key = Some(key.to_string());
        self.attr_value = None;
        self
    }
    pub fn child(mut self, child: &str) -> HandlerPath {
        self.child = Some(child.to_string());
        self
    }
}

/// How a given payload was resolved.
#[derive(Debug, PartialEq)]
pub enum Dispatch<C> {
    /// An exact tag awaiter matched; its entry has been removed.
    Tag(C),
    /// A structural entry matched. One-shot entries are removed on delivery.
    Handler(C),
    Unhandled,
}

struct TagEntry<C> {
    continuation: C,
    deadline: Option<Instant>,
}

struct HandlerEntry<C> {
    path: HandlerPath,
    continuation: C,
    persistent: bool,
}

pub struct CallbackRegistry<C> {
    tags: HashMap<String, TagEntry<C>>,
    // registration order; ties resolve to the earliest entry
    handlers: Vec<HandlerEntry<C>>,
}

enum AttrSelector<'a> {
    KeyValue(&'a str, &'a str),
    Key(&'a str),
    Empty,
}

impl<C: Clone> CallbackRegistry<C> {
    pub fn new() -> Self {
        CallbackRegistry {
            tags: HashMap::new(),
            handlers: Vec::new(),
        }
    }

    /// Registers a one-shot awaiter for `tag`. `deadline == None` waits
    /// indefinitely.
    pub fn expect(&mut self, tag: String, deadline: Option<Instant>, continuation: C) {
        self.tags.insert(tag, TagEntry { continuation, deadline });
    }

    pub fn register(&mut self, path: HandlerPath, continuation: C, persistent: bool) {
        self.handlers.push(HandlerEntry { path, continuation, persistent });
    }

    pub fn deregister(&mut self, path: &HandlerPath) {
        self.handlers.retain(|h| &h.path != path);
    }

    /// Resolution order: exact tag, then structural shape, then unhandled.
    pub fn dispatch(&mut self, tag: &str, payload: &JsonValue) -> Dispatch<C> {
        if let Some(entry) = self.tags.remove(tag) {
            return Dispatch::Tag(entry.continuation);
        }
        self.dispatch_structural(payload)
    }

    fn dispatch_structural(&mut self, payload: &JsonValue) -> Dispatch<C> {
        let function = match payload[0].as_str() {
            Some(f) => f,
            None => return Dispatch::Unhandled,
        };
        if !self.handlers.iter().any(|h| h.path.function == function) {
            return Dispatch::Unhandled;
        }

        let selector = match self.select_attr(function, &payload[1]) {
            Some(s) => s,
            None => return Dispatch::Unhandled,
        };
        let child_head = payload[2][0][0].as_str();

        // Most specific child key first, then the catch-all.
        let index = self.find_handler(function, &selector, child_head)
            .or_else(|| self.find_handler(function, &selector, None));
        match index {
            Some(i) => {
                if self.handlers[i].persistent {
                    Dispatch::Handler(self.handlers[i].continuation.clone())
                } else {
                    Dispatch::Handler(self.handlers.remove(i).continuation)
                }
            }
            None => Dispatch::Unhandled,
        }
    }

    /// Picks the attribute selector for `function`, scanning the payload's
    /// attributes in their original order. Key/value entries win over bare
    /// keys, which win over the catch-all.
    fn select_attr<'a>(&self, function: &str, attrs: &'a JsonValue) -> Option<AttrSelector<'a>> {
        for (key, value) in attrs.entries() {
            if let Some(value) = value.as_str() {
                let hit = self.handlers.iter().any(|h| {
                    h.path.function == function
                        && h.path.attr_key.as_ref().map(|k| k.as_str()) == Some(key)
                        && h.path.attr_value.as_ref().map(|v| v.as_str()) == Some(value)
                });
                if hit {
                    return Some(AttrSelector::KeyValue(key, value));
                }
            }
        }
        for (key, _) in attrs.entries() {
            let hit = self.handlers.iter().any(|h| {
                h.path.function == function
                    && h.path.attr_key.as_ref().map(|k| k.as_str()) == Some(key)
                    && h.path.attr_value.is_none()
            });
            if hit {
                return Some(AttrSelector::Key(key));
            }
        }
        let has_catch_all = self.handlers.iter()
            .any(|h| h.path.function == function && h.path.attr_key.is_none());
        if has_catch_all {
            Some(AttrSelector::Empty)
        } else {
            None
        }
    }

    fn find_handler(&self, function: &str, selector: &AttrSelector<'_>, child: Option<&str>) -> Option<usize> {
        self.handlers.iter().position(|h| {
            if h.path.function != function {
                return false;
            }
            let attr_matches = match selector {
                AttrSelector::KeyValue(k, v) => {
                    h.path.attr_key.as_ref().map(|x| x.as_str()) == Some(*k)
                        && h.path.attr_value.as_ref().map(|x| x.as_str()) == Some(*v)
                }
                AttrSelector::Key(k) => {
                    h.path.attr_key.as_ref().map(|x| x.as_str()) == Some(*k)
                        && h.path.attr_value.is_none()
                }
                AttrSelector::Empty => h.path.attr_key.is_none(),
            };
            attr_matches && h.path.child.as_ref().map(|c| c.as_str()) == child
        })
    }

    /// Removes and returns every tag awaiter whose deadline has passed.
    pub fn sweep_expired(&mut self, now: Instant) -> Vec<(String, C)> {
        let expired: Vec<String> = self.tags.iter()
            .filter(|(_, e)| e.deadline.map(|d| d <= now).unwrap_or(false))
            .map(|(tag, _)| tag.clone())
            .collect();
        expired.into_iter()
            .map(|tag| {
                let entry = self.tags.remove(&tag).unwrap();
                (tag, entry.continuation)
            })
            .collect()
    }

    /// The earliest pending deadline, used to arm the supervisor's timer.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.tags.values().filter_map(|e| e.deadline).min()
    }

    /// Empties the registry, returning pending tag awaiters so their owners
    /// can be told the connection went away.
    pub fn drain(&mut self) -> Vec<(String, C)> {
        self.handlers.clear();
        self.tags.drain().map(|(tag, e)| (tag, e.continuation)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn registry() -> CallbackRegistry<&'static str> {
        CallbackRegistry::new()
    }

    #[test]
    fn exact_tag_delivers_once() {
        let mut reg = registry();
        reg.expect("s1".into(), None, "reply");
        let payload = array!["Conn", object!{}];

        assert_eq!(reg.dispatch("s1", &payload), Dispatch::Tag("reply"));
        // entry is gone; the same tag now falls through to structural matching
        assert_eq!(reg.dispatch("s1", &payload), Dispatch::Unhandled);
    }

    #[test]
    fn key_value_selector_wins_over_bare_key() {
        let mut reg = registry();
        reg.register(HandlerPath::function("action").attr_key("add"), "any-add", true);
        reg.register(HandlerPath::function("action").attr("add", "last"), "add-last", true);

        let last = array!["action", object!{"add" => "last"}, array![]];
        let before = array!["action", object!{"add" => "before"}, array![]];
        assert_eq!(reg.dispatch("1", &last), Dispatch::Handler("add-last"));
        assert_eq!(reg.dispatch("2", &before), Dispatch::Handler("any-add"));
    }

    #[test]
    fn attribute_scan_follows_payload_order() {
        let mut reg = registry();
        reg.register(HandlerPath::function("response").attr("type", "chat"), "chat", true);
        reg.register(HandlerPath::function("response").attr("duplicate", "false"), "dup", true);

        // "duplicate" appears first in the payload, so it is selected first
        let payload = array!["response", object!{"duplicate" => "false", "type" => "chat"}, array![]];
        assert_eq!(reg.dispatch("1", &payload), Dispatch::Handler("dup"));
    }

    #[test]
    fn catch_all_matches_unknown_attributes() {
        let mut reg = registry();
        reg.register(HandlerPath::function("response"), "fallback", true);

        let payload = array!["response", object!{"type" => "unknown"}, array![]];
        assert_eq!(reg.dispatch("1", &payload), Dispatch::Handler("fallback"));
        assert_eq!(reg.dispatch("1", &array!["other", object!{}, array![]]), Dispatch::Unhandled);
    }

    #[test]
    fn child_head_refines_the_match() {
        let mut reg = registry();
        reg.register(HandlerPath::function("action").attr("add", "unread"), "any-child", true);
        reg.register(HandlerPath::function("action").attr("add", "unread").child("message"), "message-child", true);

        let with_messages = array!["action", object!{"add" => "unread"},
                                   array![array!["message", json::JsonValue::Null, json::JsonValue::Null]]];
        let empty = array!["action", object!{"add" => "unread"}, array![]];
        assert_eq!(reg.dispatch("1", &with_messages), Dispatch::Handler("message-child"));
        assert_eq!(reg.dispatch("2", &empty), Dispatch::Handler("any-child"));
    }

    #[test]
    fn one_shot_structural_entries_are_removed() {
        let mut reg = registry();
        reg.register(HandlerPath::function("response").attr("type", "contacts"), "contacts", false);

        let payload = array!["response", object!{"type" => "contacts"}, array![]];
        assert_eq!(reg.dispatch("1", &payload), Dispatch::Handler("contacts"));
        assert_eq!(reg.dispatch("2", &payload), Dispatch::Unhandled);
    }

    #[test]
    fn deregister_removes_the_exact_path() {
        let mut reg = registry();
        let path = HandlerPath::function("action").attr("add", "last");
        reg.register(path.clone(), "add-last", true);
        reg.deregister(&path);

        let payload = array!["action", object!{"add" => "last"}, array![]];
        assert_eq!(reg.dispatch("1", &payload), Dispatch::Unhandled);
    }

    #[test]
    fn expired_awaiters_are_swept() {
        let mut reg = registry();
        let now = Instant::now();
        reg.expect("a".into(), Some(now - Duration::from_secs(1)), "late");
        reg.expect("b".into(), Some(now + Duration::from_secs(60)), "on-time");
        reg.expect("c".into(), None, "forever");

        let expired = reg.sweep_expired(now);
        assert_eq!(expired, vec![("a".to_string(), "late")]);
        assert_eq!(reg.next_deadline(), Some(now + Duration::from_secs(60)));
        assert_eq!(reg.dispatch("b", &json::JsonValue::Null), Dispatch::Tag("on-time"));
        assert_eq!(reg.dispatch("c", &json::JsonValue::Null), Dispatch::Tag("forever"));
    }
}
