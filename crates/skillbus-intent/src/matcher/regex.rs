//! Regex intent matcher.
//!
//! Intent patterns bind slots through named capture groups.  Entity patterns
//! are shared: their bindings are merged into every extraction, whichever
//! intent is selected.  Matching is case-insensitive and every captured
//! value is lowercased.
//!
//! Selection: among intents whose confidence reaches the threshold, the one
//! with the most bindings wins; ties go to the earliest registered pattern.
//! An intent's confidence is the share of its own named groups that bound
//! (1.0 for a pattern without groups).

use std::collections::HashMap;
use std::sync::RwLock;

use regex::{Regex, RegexBuilder};

use super::{IntentMatch, IntentMatcher, PatternSpec};
use crate::error::{IntentError, Result};

const MATCHER_ID: &str = "regex";

struct NamedPattern {
    name: String,
    compiled: Regex,
}

#[derive(Default)]
struct Patterns {
    intents: Vec<NamedPattern>,
    entities: Vec<NamedPattern>,
}

/// Matcher over regex intents and shared regex entities.
#[derive(Default)]
pub struct RegexMatcher {
    patterns: RwLock<Patterns>,
}

impl RegexMatcher {
    /// Create an empty matcher.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of registered intent patterns.
    pub fn intent_count(&self) -> usize {
        self.read().intents.len()
    }

    // -- Private helpers ----------------------------------------------------

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Patterns> {
        self.patterns.read().unwrap_or_else(|e| e.into_inner())
    }
}

impl IntentMatcher for RegexMatcher {
    fn id(&self) -> &str {
        MATCHER_ID
    }

    fn register_pattern(&self, name: &str, spec: &PatternSpec) -> Result<()> {
        let (raw, is_entity) = match spec {
            PatternSpec::Regex(raw) => (raw, false),
            PatternSpec::Entity(raw) => (raw, true),
            other => {
                return Err(IntentError::UnsupportedPattern {
                    matcher: MATCHER_ID.into(),
                    kind: other.kind().into(),
                });
            }
        };

        let compiled = RegexBuilder::new(raw)
            .case_insensitive(true)
            .build()
            .map_err(|e| IntentError::InvalidPattern {
                pattern: raw.clone(),
                reason: e.to_string(),
            })?;

        let mut patterns = self.patterns.write().map_err(|e| {
            IntentError::Internal(format!("failed to acquire write lock on regex patterns: {e}"))
        })?;
        let list = if is_entity {
            &mut patterns.entities
        } else {
            &mut patterns.intents
        };

        let entry = NamedPattern {
            name: name.to_string(),
            compiled,
        };
        // Re-registering keeps the original registration slot.
        match list.iter_mut().find(|p| p.name == name) {
            Some(existing) => *existing = entry,
            None => list.push(entry),
        }

        tracing::debug!(name = %name, entity = is_entity, "regex pattern registered");
        Ok(())
    }

    fn unregister(&self, name: &str) -> bool {
        let mut patterns = self.patterns.write().unwrap_or_else(|e| e.into_inner());
        let before = patterns.intents.len() + patterns.entities.len();
        patterns.intents.retain(|p| p.name != name);
        patterns.entities.retain(|p| p.name != name);
        before != patterns.intents.len() + patterns.entities.len()
    }

    fn extract_entities(&self, utterance: &str) -> HashMap<String, String> {
        let patterns = self.read();
        let mut entities = HashMap::new();
        for pattern in &patterns.entities {
            let (bound, _) = bindings(&pattern.compiled, utterance);
            for (k, v) in bound.unwrap_or_default() {
                entities.entry(k).or_insert(v);
            }
        }
        entities
    }

    fn calculate_intent(&self, utterance: &str, min_confidence: f64) -> IntentMatch {
        let shared = self.extract_entities(utterance);
        let patterns = self.read();

        let mut best: Option<(usize, f64, HashMap<String, String>, &str)> = None;
        for pattern in &patterns.intents {
            let (Some(mut bound), groups) = bindings(&pattern.compiled, utterance) else {
                continue;
            };
            let confidence = if groups == 0 {
                1.0
            } else {
                bound.len() as f64 / groups as f64
            };
            if confidence < min_confidence {
                continue;
            }
            for (k, v) in &shared {
                bound.entry(k.clone()).or_insert_with(|| v.clone());
            }
            // Strictly greater keeps the earliest registration on ties.
            if best.as_ref().is_none_or(|(count, ..)| bound.len() > *count) {
                best = Some((bound.len(), confidence, bound, pattern.name.as_str()));
            }
        }

        match best {
            Some((_, confidence, entities, name)) => {
                tracing::debug!(intent = %name, confidence, "regex intent matched");
                IntentMatch {
                    intent_name: name.to_string(),
                    confidence,
                    entities,
                    matcher: MATCHER_ID.into(),
                    utterance: utterance.to_string(),
                }
            }
            None => IntentMatch::unknown(MATCHER_ID),
        }
    }
}

/// Named-group bindings of `regex` against `text`, lowercased, and the total
/// number of named groups.  `None` when the regex does not match.
fn bindings(regex: &Regex, text: &str) -> (Option<HashMap<String, String>>, usize) {
    let groups = regex.capture_names().flatten().count();
    let Some(caps) = regex.captures(text) else {
        return (None, groups);
    };
    let mut bound = HashMap::new();
    for name in regex.capture_names().flatten() {
        if let Some(m) = caps.name(name) {
            let value = m.as_str().trim();
            if !value.is_empty() {
                bound.insert(name.to_string(), value.to_lowercase());
            }
        }
    }
    (Some(bound), groups)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn matcher() -> RegexMatcher {
        let m = RegexMatcher::new();
        m.register_pattern("play", &PatternSpec::Regex(r"^play (?P<Music>.+)$".into()))
            .unwrap();
        m.register_pattern(
            "Location",
            &PatternSpec::Entity(r".*(at|in) (?P<Location>.+)$".into()),
        )
        .unwrap();
        m
    }

    #[test]
    fn regex_intent_hit() {
        let result = matcher().calculate_intent("play metallica", 0.5);
        assert_eq!(result.intent_name, "play");
        assert_eq!(result.entities.get("Music").map(String::as_str), Some("metallica"));
        assert_eq!(result.entities.len(), 1);
        assert_eq!(result.matcher, "regex");
        assert_eq!(result.confidence, 1.0);
    }

    #[test]
    fn entity_only_extraction() {
        let m = matcher();
        let found = m.extract_entities("how is the weather in Paris");
        assert_eq!(found.get("Location").map(String::as_str), Some("paris"));
        assert!(m.extract_entities("bork the zork").is_empty());
    }

    #[test]
    fn no_match_is_unknown() {
        let result = matcher().calculate_intent("bork the zork", 0.5);
        assert!(result.is_unknown());
        assert_eq!(result.confidence, 0.0);
        assert!(result.entities.is_empty());
        assert_eq!(result.matcher, "regex");
    }

    #[test]
    fn captured_values_are_lowercased_substrings() {
        let result = matcher().calculate_intent("Play The Beatles", 0.5);
        assert_eq!(result.entities["Music"], "the beatles");
    }

    #[test]
    fn most_bindings_wins_then_registration_order() {
        let m = RegexMatcher::new();
        m.register_pattern("first", &PatternSpec::Regex(r"^set (?P<a>\w+)".into()))
            .unwrap();
        m.register_pattern("second", &PatternSpec::Regex(r"^set (?P<b>\w+)".into()))
            .unwrap();
        m.register_pattern(
            "third",
            &PatternSpec::Regex(r"^set (?P<c>\w+) to (?P<d>\w+)".into()),
        )
        .unwrap();

        assert_eq!(m.calculate_intent("set timer", 0.5).intent_name, "first");
        assert_eq!(m.calculate_intent("set volume to ten", 0.5).intent_name, "third");
    }

    #[test]
    fn shared_entities_merge_into_intent_bindings() {
        let m = matcher();
        m.register_pattern("weather", &PatternSpec::Regex(r"weather".into()))
            .unwrap();
        let result = m.calculate_intent("what is the weather in Lisbon", 0.5);
        assert_eq!(result.intent_name, "weather");
        assert_eq!(result.entities["Location"], "lisbon");
    }

    #[test]
    fn optional_groups_lower_confidence() {
        let m = RegexMatcher::new();
        m.register_pattern(
            "timer",
            &PatternSpec::Regex(r"^timer(?: for (?P<duration>\d+))?(?: named (?P<label>\w+))?$".into()),
        )
        .unwrap();

        assert_eq!(m.calculate_intent("timer for 5", 0.5).confidence, 0.5);
        assert!(m.calculate_intent("timer", 0.5).is_unknown());
        assert_eq!(m.calculate_intent("timer", 0.0).confidence, 0.0);
    }

    #[test]
    fn register_then_unregister_restores_behavior() {
        let m = matcher();
        let before = m.calculate_intent("stop the music", 0.5);

        m.register_pattern("stop", &PatternSpec::Regex(r"^stop (?P<what>.+)$".into()))
            .unwrap();
        assert_eq!(m.calculate_intent("stop the music", 0.5).intent_name, "stop");

        assert!(m.unregister("stop"));
        assert_eq!(m.calculate_intent("stop the music", 0.5), before);
        assert!(!m.unregister("stop"));
    }

    #[test]
    fn invalid_and_unsupported_patterns_rejected() {
        let m = RegexMatcher::new();
        let err = m
            .register_pattern("bad", &PatternSpec::Regex("(?P<open".into()))
            .unwrap_err();
        assert!(matches!(err, IntentError::InvalidPattern { .. }));

        let err = m
            .register_pattern("kw", &PatternSpec::Vocabulary(vec!["hi".into()]))
            .unwrap_err();
        assert!(matches!(err, IntentError::UnsupportedPattern { .. }));
        assert_eq!(m.intent_count(), 0);
    }
}
