//! Keyword intent matcher.
//!
//! Vocabulary phrases are registered per entity type and tagged in the
//! utterance with a single leftmost-longest [`AhoCorasick`] automaton; a tag
//! only counts when it sits on word boundaries.  A keyword intent matches
//! when every required entity type is tagged.  Its confidence grows with
//! how much of the utterance the intent's tags cover:
//! `0.5 + 0.5 * coverage`, where coverage is the share of non-space
//! characters inside tagged phrases.

use std::collections::HashMap;
use std::sync::RwLock;

use aho_corasick::{AhoCorasick, AhoCorasickBuilder, MatchKind};

use super::{IntentMatch, IntentMatcher, KeywordIntent, PatternSpec};
use crate::error::{IntentError, Result};

const MATCHER_ID: &str = "keyword";

#[derive(Default)]
struct Vocabulary {
    /// Unique lowercased phrases, indexed like the automaton patterns.
    phrases: Vec<String>,
    /// Entity types each phrase belongs to.
    types: Vec<Vec<String>>,
    automaton: Option<AhoCorasick>,
}

#[derive(Default)]
struct KeywordState {
    vocabulary: HashMap<String, Vec<String>>,
    intents: Vec<(String, KeywordIntent)>,
    compiled: Vocabulary,
}

struct Tag {
    entity: String,
    text: String,
    weight: usize,
}

/// Adapt-style matcher over keyword vocabulary.
#[derive(Default)]
pub struct KeywordMatcher {
    state: RwLock<KeywordState>,
}

impl KeywordMatcher {
    /// Create an empty matcher.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of registered keyword intents.
    pub fn intent_count(&self) -> usize {
        self.read().intents.len()
    }

    // -- Private helpers ----------------------------------------------------

    fn read(&self) -> std::sync::RwLockReadGuard<'_, KeywordState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn tag(state: &KeywordState, utterance: &str) -> Vec<Tag> {
        let Some(ac) = state.compiled.automaton.as_ref() else {
            return Vec::new();
        };
        let lowered = utterance.to_lowercase();
        let mut tags = Vec::new();
        for mat in ac.find_iter(&lowered) {
            if !on_word_boundary(&lowered, mat.start(), mat.end()) {
                continue;
            }
            let text = &lowered[mat.start()..mat.end()];
            let weight = text.chars().filter(|c| !c.is_whitespace()).count();
            for entity in &state.compiled.types[mat.pattern().as_usize()] {
                tags.push(Tag {
                    entity: entity.clone(),
                    text: text.to_string(),
                    weight,
                });
            }
        }
        tags
    }
}

impl KeywordState {
    fn rebuild(&mut self) -> Result<()> {
        let mut phrases: Vec<String> = Vec::new();
        let mut types: Vec<Vec<String>> = Vec::new();
        let mut entity_names: Vec<&String> = self.vocabulary.keys().collect();
        entity_names.sort();

        for entity in entity_names {
            for phrase in &self.vocabulary[entity] {
                match phrases.iter().position(|p| p == phrase) {
                    Some(i) => types[i].push(entity.clone()),
                    None => {
                        phrases.push(phrase.clone());
                        types.push(vec![entity.clone()]);
                    }
                }
            }
        }

        let automaton = if phrases.is_empty() {
            None
        } else {
            let ac = AhoCorasickBuilder::new()
                .match_kind(MatchKind::LeftmostLongest)
                .build(&phrases)
                .map_err(|e| IntentError::AutomatonBuild {
                    reason: e.to_string(),
                })?;
            tracing::trace!(count = phrases.len(), "keyword automaton rebuilt");
            Some(ac)
        };

        self.compiled = Vocabulary {
            phrases,
            types,
            automaton,
        };
        Ok(())
    }
}

impl IntentMatcher for KeywordMatcher {
    fn id(&self) -> &str {
        MATCHER_ID
    }

    fn register_pattern(&self, name: &str, spec: &PatternSpec) -> Result<()> {
        let mut state = self.state.write().map_err(|e| {
            IntentError::Internal(format!("failed to acquire write lock on keyword state: {e}"))
        })?;

        match spec {
            PatternSpec::Vocabulary(phrases) => {
                let phrases: Vec<String> = phrases
                    .iter()
                    .map(|p| p.trim().to_lowercase())
                    .filter(|p| !p.is_empty())
                    .collect();
                let entry = state.vocabulary.entry(name.to_string()).or_default();
                for phrase in phrases {
                    if !entry.contains(&phrase) {
                        entry.push(phrase);
                    }
                }
                state.rebuild()?;
                tracing::debug!(entity = %name, phrases = state.compiled.phrases.len(), "vocabulary registered");
            }
            PatternSpec::Keywords(intent) => {
                if intent.required.is_empty() {
                    return Err(IntentError::EmptyKeywordIntent {
                        intent: name.to_string(),
                    });
                }
                match state.intents.iter_mut().find(|(n, _)| n == name) {
                    Some(existing) => existing.1 = intent.clone(),
                    None => state.intents.push((name.to_string(), intent.clone())),
                }
                tracing::debug!(intent = %name, required = ?intent.required, "keyword intent registered");
            }
            other => {
                return Err(IntentError::UnsupportedPattern {
                    matcher: MATCHER_ID.into(),
                    kind: other.kind().into(),
                });
            }
        }
        Ok(())
    }

    fn unregister(&self, name: &str) -> bool {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        let before = state.intents.len();
        state.intents.retain(|(n, _)| n != name);
        let mut removed = before != state.intents.len();

        if state.vocabulary.remove(name).is_some() {
            removed = true;
            if let Err(e) = state.rebuild() {
                tracing::warn!(error = %e, "keyword automaton rebuild failed after unregister");
            }
        }
        removed
    }

    fn extract_entities(&self, utterance: &str) -> HashMap<String, String> {
        let state = self.read();
        let mut entities = HashMap::new();
        for tag in Self::tag(&state, utterance) {
            entities.entry(tag.entity).or_insert(tag.text);
        }
        entities
    }

    fn calculate_intent(&self, utterance: &str, min_confidence: f64) -> IntentMatch {
        let state = self.read();
        let tags = Self::tag(&state, utterance);
        let total: usize = utterance.chars().filter(|c| !c.is_whitespace()).count();
        if tags.is_empty() || total == 0 {
            return IntentMatch::unknown(MATCHER_ID);
        }

        let mut best: Option<(f64, HashMap<String, String>, &str)> = None;
        for (name, intent) in &state.intents {
            if !intent
                .required
                .iter()
                .all(|r| tags.iter().any(|t| &t.entity == r))
            {
                continue;
            }

            let mut entities = HashMap::new();
            let mut covered = 0usize;
            let mut counted: Vec<&str> = Vec::new();
            for tag in &tags {
                let wanted = intent.required.contains(&tag.entity)
                    || intent.optional.contains(&tag.entity);
                if !wanted {
                    continue;
                }
                entities
                    .entry(tag.entity.clone())
                    .or_insert_with(|| tag.text.clone());
                // A phrase tagged under several types covers its text once.
                if !counted.contains(&tag.text.as_str()) {
                    counted.push(&tag.text);
                    covered += tag.weight;
                }
            }

            let coverage = (covered as f64 / total as f64).min(1.0);
            let confidence = 0.5 + 0.5 * coverage;
            if confidence < min_confidence {
                continue;
            }
            if best.as_ref().is_none_or(|(c, ..)| confidence > *c) {
                best = Some((confidence, entities, name.as_str()));
            }
        }

        match best {
            Some((confidence, entities, name)) => {
                tracing::debug!(intent = %name, confidence, "keyword intent matched");
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

fn on_word_boundary(text: &str, start: usize, end: usize) -> bool {
    let before = text[..start].chars().next_back();
    let after = text[end..].chars().next();
    !before.is_some_and(char::is_alphanumeric) && !after.is_some_and(char::is_alphanumeric)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn vocab(m: &KeywordMatcher, entity: &str, phrases: &[&str]) {
        m.register_pattern(
            entity,
            &PatternSpec::Vocabulary(phrases.iter().map(|p| (*p).to_string()).collect()),
        )
        .unwrap();
    }

    fn matcher() -> KeywordMatcher {
        let m = KeywordMatcher::new();
        vocab(&m, "HelloWorldKeyword", &["hello world"]);
        vocab(&m, "Greeting", &["hello", "hi"]);
        m.register_pattern(
            "hello_world",
            &PatternSpec::Keywords(KeywordIntent::require(["HelloWorldKeyword"])),
        )
        .unwrap();
        m
    }

    #[test]
    fn full_coverage_gives_full_confidence() {
        let result = matcher().calculate_intent("Hello World", 0.5);
        assert_eq!(result.intent_name, "hello_world");
        assert_eq!(result.confidence, 1.0);
        assert_eq!(result.matcher, "keyword");
        assert_eq!(result.entities["HelloWorldKeyword"], "hello world");
    }

    #[test]
    fn partial_coverage_scales_confidence() {
        let result = matcher().calculate_intent("say hello world", 0.5);
        assert_eq!(result.intent_name, "hello_world");
        // 10 of 13 non-space characters covered.
        let expected = 0.5 + 0.5 * (10.0 / 13.0);
        assert!((result.confidence - expected).abs() < 1e-9);
    }

    #[test]
    fn missing_required_entity_is_unknown() {
        let result = matcher().calculate_intent("hello there", 0.5);
        assert!(result.is_unknown());
        assert_eq!(result.matcher, "keyword");
    }

    #[test]
    fn tags_respect_word_boundaries() {
        let m = matcher();
        assert!(m.extract_entities("this is chilling").is_empty());
        assert_eq!(m.extract_entities("hi there")["Greeting"], "hi");
    }

    #[test]
    fn optional_entities_raise_confidence() {
        let m = KeywordMatcher::new();
        vocab(&m, "Weather", &["weather"]);
        vocab(&m, "Location", &["paris", "lisbon"]);
        m.register_pattern(
            "bare",
            &PatternSpec::Keywords(KeywordIntent::require(["Weather"])),
        )
        .unwrap();
        m.register_pattern(
            "located",
            &PatternSpec::Keywords(KeywordIntent::require(["Weather"]).optionally("Location")),
        )
        .unwrap();

        let result = m.calculate_intent("weather paris", 0.5);
        assert_eq!(result.intent_name, "located");
        assert_eq!(result.confidence, 1.0);
        assert_eq!(result.entities["Location"], "paris");

        // Same confidence: registration order wins.
        assert_eq!(m.calculate_intent("weather", 0.5).intent_name, "bare");
    }

    #[test]
    fn unregister_vocabulary_and_intent() {
        let m = matcher();
        assert!(m.unregister("HelloWorldKeyword"));
        assert!(m.calculate_intent("hello world", 0.5).is_unknown());
        assert!(m.unregister("hello_world"));
        assert_eq!(m.intent_count(), 0);
        assert!(!m.unregister("hello_world"));
    }

    #[test]
    fn rejects_empty_and_regex_specs() {
        let m = KeywordMatcher::new();
        let err = m
            .register_pattern("x", &PatternSpec::Keywords(KeywordIntent::default()))
            .unwrap_err();
        assert!(matches!(err, IntentError::EmptyKeywordIntent { .. }));
        let err = m
            .register_pattern("x", &PatternSpec::Regex("x".into()))
            .unwrap_err();
        assert!(matches!(err, IntentError::UnsupportedPattern { .. }));
    }
}
