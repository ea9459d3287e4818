//! Bus messages.
//!
//! A [`Message`] is the unit carried by the [`MessageBus`](crate::bus::MessageBus):
//! a topic string, a `data` mapping and a `context` mapping.  The context
//! carries routing information (`source`, `destination`) and the session
//! descriptor, and must survive every hop of a dispatch.  Use
//! [`Message::forward`] to derive a downstream message that keeps the routing
//! pair as-is, and [`Message::reply`] to address a message back to the
//! original sender.
//!
//! The serialized form is the JSON object
//! `{"type": "...", "data": {...}, "context": {...}}`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{KernelError, Result};

/// Session id used when a message carries no session descriptor.
pub const DEFAULT_SESSION: &str = "default";

/// A message flowing through the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Topic the message is published under.
    #[serde(rename = "type")]
    pub msg_type: String,
    /// Topic-specific payload.
    #[serde(default)]
    pub data: Map<String, Value>,
    /// Routing and session metadata, propagated downstream.
    #[serde(default)]
    pub context: Map<String, Value>,
}

impl Message {
    /// Create a message with an empty context.
    ///
    /// `data` should be a JSON object; `null` yields an empty mapping and any
    /// other scalar is stored under the `value` key.
    pub fn new(msg_type: impl Into<String>, data: Value) -> Self {
        Self {
            msg_type: msg_type.into(),
            data: into_map(data),
            context: Map::new(),
        }
    }

    /// Replace the context mapping.
    #[must_use]
    pub fn with_context(mut self, context: Value) -> Self {
        self.context = into_map(context);
        self
    }

    /// Attach a session descriptor (`context.session.session_id`).
    #[must_use]
    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        let session = self
            .context
            .entry("session")
            .or_insert_with(|| Value::Object(Map::new()));
        if !session.is_object() {
            *session = Value::Object(Map::new());
        }
        if let Value::Object(map) = session {
            map.insert("session_id".into(), Value::String(session_id.into()));
        }
        self
    }

    /// Derive a downstream message that keeps this message's context,
    /// including the `source`/`destination` pair, unchanged.
    pub fn forward(&self, msg_type: impl Into<String>, data: Value) -> Self {
        Self {
            msg_type: msg_type.into(),
            data: into_map(data),
            context: self.context.clone(),
        }
    }

    /// Derive a message addressed back to whoever sent this one.
    ///
    /// The context is copied with `source` and `destination` swapped.  A role
    /// that was absent on the original is absent on the reply.
    pub fn reply(&self, msg_type: impl Into<String>, data: Value) -> Self {
        let mut context = self.context.clone();
        let source = context.remove("source");
        let destination = context.remove("destination");
        if let Some(dest) = destination {
            context.insert("source".into(), dest);
        }
        if let Some(src) = source {
            context.insert("destination".into(), src);
        }
        Self {
            msg_type: msg_type.into(),
            data: into_map(data),
            context,
        }
    }

    /// Reply on `<msg_type>.response`.
    pub fn response(&self, data: Value) -> Self {
        self.reply(format!("{}.response", self.msg_type), data)
    }

    /// The `source` routing role, if present.
    pub fn source(&self) -> Option<&str> {
        self.context.get("source").and_then(Value::as_str)
    }

    /// The `destination` routing role, if present.
    pub fn destination(&self) -> Option<&str> {
        self.context.get("destination").and_then(Value::as_str)
    }

    /// Session id from `context.session.session_id`, or [`DEFAULT_SESSION`].
    pub fn session_id(&self) -> &str {
        self.context
            .get("session")
            .and_then(|s| s.get("session_id"))
            .and_then(Value::as_str)
            .unwrap_or(DEFAULT_SESSION)
    }

    /// Language tag from `data.lang`, then `context.lang`.
    pub fn lang(&self) -> Option<&str> {
        self.data
            .get("lang")
            .or_else(|| self.context.get("lang"))
            .and_then(Value::as_str)
    }

    /// String value of a data field.
    pub fn data_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }

    /// Boolean value of a data field, `false` when absent.
    pub fn data_bool(&self, key: &str) -> bool {
        self.data.get(key).and_then(Value::as_bool).unwrap_or(false)
    }

    /// Encode to the JSON wire form.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode from the JSON wire form.
    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| KernelError::InvalidMessage {
            reason: e.to_string(),
        })
    }
}

fn into_map(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert("value".into(), other);
            map
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn routed() -> Message {
        Message::new("recognizer_loop:utterance", json!({"utterances": ["hi"]}))
            .with_context(json!({"source": "A", "destination": "B"}))
    }

    #[test]
    fn forward_keeps_routing() {
        let msg = routed().forward("complete_intent_failure", json!({}));
        assert_eq!(msg.source(), Some("A"));
        assert_eq!(msg.destination(), Some("B"));
        assert!(msg.data.is_empty());
    }

    #[test]
    fn reply_swaps_routing() {
        let msg = routed().reply("speak", json!({"utterance": "hello"}));
        assert_eq!(msg.source(), Some("B"));
        assert_eq!(msg.destination(), Some("A"));
        assert_eq!(msg.data_str("utterance"), Some("hello"));
    }

    #[test]
    fn reply_without_destination_drops_source() {
        let msg = Message::new("ping", json!({}))
            .with_context(json!({"source": "A"}))
            .reply("pong", json!({}));
        assert_eq!(msg.destination(), Some("A"));
        assert_eq!(msg.source(), None);
    }

    #[test]
    fn response_topic_suffix() {
        let msg = Message::new("question:query", json!({})).response(json!({}));
        assert_eq!(msg.msg_type, "question:query.response");
    }

    #[test]
    fn session_id_defaults() {
        let msg = Message::new("x", json!({}));
        assert_eq!(msg.session_id(), DEFAULT_SESSION);

        let msg = msg.with_session("abc");
        assert_eq!(msg.session_id(), "abc");
    }

    #[test]
    fn with_session_replaces_malformed_descriptor() {
        let msg = Message::new("x", json!({}))
            .with_context(json!({"session": "not-an-object"}))
            .with_session("s1");
        assert_eq!(msg.session_id(), "s1");
    }

    #[test]
    fn scalar_data_is_wrapped() {
        let msg = Message::new("x", json!(42));
        assert_eq!(msg.data.get("value"), Some(&json!(42)));
        assert!(Message::new("x", Value::Null).data.is_empty());
    }

    #[test]
    fn wire_form_uses_type_key() {
        let raw = r#"{"type": "speak", "data": {"utterance": "hi"}}"#;
        let msg = Message::from_json(raw).expect("decode");
        assert_eq!(msg.msg_type, "speak");
        assert!(msg.context.is_empty());

        let encoded = msg.to_json().expect("encode");
        assert!(encoded.contains(r#""type":"speak""#));
    }

    #[test]
    fn malformed_wire_form_is_rejected() {
        let err = Message::from_json("{not json").unwrap_err();
        assert!(matches!(err, KernelError::InvalidMessage { .. }));
    }
}
