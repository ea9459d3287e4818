//! Intent matchers.
//!
//! A matcher scores an utterance against the patterns registered with it and
//! returns an [`IntentMatch`].  Matchers are plug-ins behind the
//! [`IntentMatcher`] trait; the orchestrator consults them in pipeline order
//! and stops at the first confident match.
//!
//! | Matcher | Pattern specs | Id |
//! |---------|---------------|----|
//! | [`RegexMatcher`] | [`PatternSpec::Regex`], [`PatternSpec::Entity`] | `regex` |
//! | [`KeywordMatcher`] | [`PatternSpec::Keywords`], [`PatternSpec::Vocabulary`] | `keyword` |
//!
//! Matchers use interior mutability so a single instance can be shared
//! behind an `Arc` while skills register and unregister patterns.

mod keyword;
mod regex;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::Result;

pub use self::keyword::KeywordMatcher;
pub use self::regex::RegexMatcher;

/// Name of the distinguished no-match intent.
pub const UNKNOWN_INTENT: &str = "unknown";

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// A scored matcher result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentMatch {
    /// Registered intent name, or [`UNKNOWN_INTENT`].
    pub intent_name: String,
    /// Confidence in `[0.0, 1.0]`.
    pub confidence: f64,
    /// Slot bindings, lowercased.
    pub entities: HashMap<String, String>,
    /// Identifier of the matcher that produced this result.
    pub matcher: String,
    /// The utterance alternative that was matched.
    pub utterance: String,
}

impl IntentMatch {
    /// The no-match result for `matcher`: confidence 0, no bindings.
    pub fn unknown(matcher: &str) -> Self {
        Self {
            intent_name: UNKNOWN_INTENT.to_string(),
            confidence: 0.0,
            entities: HashMap::new(),
            matcher: matcher.to_string(),
            utterance: String::new(),
        }
    }

    /// Whether this is the no-match result.
    pub fn is_unknown(&self) -> bool {
        self.intent_name == UNKNOWN_INTENT
    }
}

/// A keyword intent: entity types that must (or may) be tagged in the
/// utterance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeywordIntent {
    /// Entity types that must all be present.
    pub required: Vec<String>,
    /// Entity types that add coverage when present.
    #[serde(default)]
    pub optional: Vec<String>,
}

impl KeywordIntent {
    /// An intent requiring the given entity types.
    pub fn require<I, S>(required: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            required: required.into_iter().map(Into::into).collect(),
            optional: Vec::new(),
        }
    }

    /// Add an optional entity type.
    #[must_use]
    pub fn optionally(mut self, entity: impl Into<String>) -> Self {
        self.optional.push(entity.into());
        self
    }
}

/// What a pattern registration describes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternSpec {
    /// A regex intent; named groups bind slots.
    Regex(String),
    /// A regex entity shared by every intent of the matcher.
    Entity(String),
    /// A keyword intent.
    Keywords(KeywordIntent),
    /// Vocabulary phrases for a keyword entity type.
    Vocabulary(Vec<String>),
}

impl PatternSpec {
    /// Short name of the spec kind, for error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Regex(_) => "regex",
            Self::Entity(_) => "entity",
            Self::Keywords(_) => "keywords",
            Self::Vocabulary(_) => "vocabulary",
        }
    }
}

// ---------------------------------------------------------------------------
// Matcher trait
// ---------------------------------------------------------------------------

/// A plug-in matcher.
pub trait IntentMatcher: Send + Sync {
    /// Identifier carried by every [`IntentMatch`] this matcher returns.
    fn id(&self) -> &str;

    /// Register (or replace) a named pattern.
    fn register_pattern(&self, name: &str, spec: &PatternSpec) -> Result<()>;

    /// Remove a named pattern.  Returns `false` if it was not registered.
    fn unregister(&self, name: &str) -> bool;

    /// Extract entity bindings from `utterance` without selecting an intent.
    fn extract_entities(&self, utterance: &str) -> HashMap<String, String>;

    /// Select the best intent for `utterance`, or [`IntentMatch::unknown`]
    /// when nothing reaches `min_confidence`.
    fn calculate_intent(&self, utterance: &str, min_confidence: f64) -> IntentMatch;
}
