//! The unit of work for one dispatch.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use skillbus_kernel::Message;

/// Topic on which recognized speech enters the pipeline.
pub const UTTERANCE_TOPIC: &str = "recognizer_loop:utterance";

/// An inbound utterance with its alternatives and routing metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UtteranceEvent {
    /// Surface strings, best alternative first.
    pub utterances: Vec<String>,
    /// Language tag.
    pub lang: String,
    /// Session the utterance belongs to.
    pub session_id: String,
    /// Sender, if the context named one.
    pub source: Option<String>,
    /// Addressee, if the context named one.
    pub destination: Option<String>,
    /// The inbound context, untouched.
    pub context: Map<String, Value>,
}

impl UtteranceEvent {
    /// Build the event from a `recognizer_loop:utterance` message.
    ///
    /// Blank alternatives are dropped.  The language comes from the message
    /// (`data.lang`, then `context.lang`) and falls back to `default_lang`.
    pub fn from_message(message: &Message, default_lang: &str) -> Self {
        let utterances = message
            .data
            .get("utterances")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::trim)
                    .filter(|u| !u.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Self {
            utterances,
            lang: message.lang().unwrap_or(default_lang).to_lowercase(),
            session_id: message.session_id().to_string(),
            source: message.source().map(str::to_string),
            destination: message.destination().map(str::to_string),
            context: message.context.clone(),
        }
    }

    /// The best alternative, if any.
    pub fn primary(&self) -> Option<&str> {
        self.utterances.first().map(String::as_str)
    }

    /// Whether there is nothing to match.
    pub fn is_empty(&self) -> bool {
        self.utterances.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn builds_from_message() {
        let message = Message::new(
            UTTERANCE_TOPIC,
            json!({"utterances": ["hello world", "  ", "yellow world"], "lang": "EN-US"}),
        )
        .with_context(json!({"source": "A", "destination": "B"}))
        .with_session("kitchen");

        let event = UtteranceEvent::from_message(&message, "pt-pt");
        assert_eq!(event.utterances, vec!["hello world", "yellow world"]);
        assert_eq!(event.lang, "en-us");
        assert_eq!(event.session_id, "kitchen");
        assert_eq!(event.source.as_deref(), Some("A"));
        assert_eq!(event.destination.as_deref(), Some("B"));
        assert_eq!(event.primary(), Some("hello world"));
    }

    #[test]
    fn missing_fields_default() {
        let event = UtteranceEvent::from_message(&Message::new(UTTERANCE_TOPIC, json!({})), "en-us");
        assert!(event.is_empty());
        assert_eq!(event.lang, "en-us");
        assert_eq!(event.session_id, "default");
        assert!(event.source.is_none());
    }
}
