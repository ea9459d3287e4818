//! Skill capability tables.
//!
//! A skill is not a type hierarchy: it is a [`SkillHandle`] recording which
//! capabilities the skill opts into, each backed by a trait object.
//!
//! | Capability | Trait | Pipeline stage |
//! |------------|-------|----------------|
//! | Regex / keyword intents | [`IntentHandler`] | regex, keyword |
//! | Fallback with priority | [`FallbackHandler`] | fallback |
//! | Common query | [`CommonQuerySkill`] | common_query |
//! | Common play, one-shot | [`LegacyPlaySkill`] | common_play |
//! | Common play, streaming | [`MediaSearchSkill`] | common_play |
//! | No-argument stop | [`Stop`] | stop (global) |
//! | Session-aware stop | [`SessionStop`] | stop (per session) |
//!
//! Handlers talk back through a [`SkillContext`], which derives every
//! outgoing message from the message that triggered the handler so the
//! routing pair survives.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use skillbus_kernel::{DialogLibrary, Message, MessageBus, Session};

use crate::error::Result;
use crate::matcher::{IntentMatch, KeywordIntent};

/// Topic a fallback skill publishes to leave the chain.
pub const FALLBACK_DEACTIVATE: &str = "fallback_deactivate";

// ---------------------------------------------------------------------------
// Capability traits
// ---------------------------------------------------------------------------

/// Handles a matched regex or keyword intent.
#[async_trait]
pub trait IntentHandler: Send + Sync {
    /// Execute the intent.  An error counts as "not handled".
    async fn handle(&self, ctx: SkillContext, intent: &IntentMatch) -> Result<()>;
}

/// Handles an utterance nothing else claimed.
#[async_trait]
pub trait FallbackHandler: Send + Sync {
    /// Return `true` if the utterance was handled.
    async fn handle_fallback(&self, ctx: SkillContext) -> Result<bool>;
}

/// Confidence band of a knowledge answer, best first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryTier {
    /// The skill matched the question exactly.
    Exact,
    /// A general answer.
    General,
    /// The skill covers the question's category.
    Category,
}

impl QueryTier {
    /// Higher ranks win.
    pub fn rank(self) -> u8 {
        match self {
            Self::Exact => 3,
            Self::General => 2,
            Self::Category => 1,
        }
    }
}

/// A knowledge skill's candidate answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryAnswer {
    /// The phrase the answer responds to.
    pub phrase: String,
    /// Confidence band.
    pub tier: QueryTier,
    /// Text to speak.
    pub answer: String,
    /// Opaque data handed back on selection.
    #[serde(default)]
    pub payload: Value,
}

/// A knowledge skill taking part in common-query arbitration.
#[async_trait]
pub trait CommonQuerySkill: Send + Sync {
    /// Offer an answer for `phrase`, or `None` when the skill has nothing.
    async fn match_query(&self, phrase: &str, lang: &str) -> Option<QueryAnswer>;

    /// Follow-up action once the skill's answer was selected.
    async fn on_selected(&self, _ctx: SkillContext, _answer: QueryAnswer) -> Result<()> {
        Ok(())
    }
}

/// Confidence band of a media match, best first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaTier {
    /// Exact title match.
    Exact,
    /// Matched an artist or author.
    Artist,
    /// Matched a category or genre.
    Category,
    /// The skill can play something generic.
    Generic,
}

impl MediaTier {
    /// Higher ranks win.
    pub fn rank(self) -> u8 {
        match self {
            Self::Exact => 4,
            Self::Artist => 3,
            Self::Category => 2,
            Self::Generic => 1,
        }
    }

    /// Score attached to one-shot matches, which carry a tier only.
    pub fn nominal_score(self) -> f64 {
        match self {
            Self::Exact => 90.0,
            Self::Artist => 70.0,
            Self::Category => 50.0,
            Self::Generic => 30.0,
        }
    }

    /// Tier for a streamed candidate's 0..=100 score.
    pub fn from_score(score: f64) -> Self {
        if score >= 90.0 {
            Self::Exact
        } else if score >= 70.0 {
            Self::Artist
        } else if score >= 50.0 {
            Self::Category
        } else {
            Self::Generic
        }
    }
}

/// Kind of media asked for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaType {
    /// Anything.
    #[default]
    Generic,
    /// Music.
    Music,
    /// Podcasts.
    Podcast,
    /// Radio stations.
    Radio,
    /// Audiobooks.
    Audiobook,
    /// Films.
    Movie,
    /// Video clips.
    Video,
    /// News bulletins.
    News,
}

impl MediaType {
    /// Guess the media type from words in the phrase.
    pub fn detect(phrase: &str) -> Self {
        let lowered = phrase.to_lowercase();
        let has = |w: &str| {
            lowered
                .split_whitespace()
                .any(|t| t.trim_matches(|c: char| !c.is_alphanumeric()) == w)
        };
        if has("podcast") || has("podcasts") {
            Self::Podcast
        } else if has("radio") {
            Self::Radio
        } else if has("audiobook") || has("audiobooks") {
            Self::Audiobook
        } else if has("movie") || has("film") {
            Self::Movie
        } else if has("video") {
            Self::Video
        } else if has("news") {
            Self::News
        } else if has("song") || has("music") || has("album") {
            Self::Music
        } else {
            Self::Generic
        }
    }
}

/// How a selected candidate is played.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackType {
    /// Audio stream.
    Audio,
    /// Video stream.
    Video,
    /// The skill handles playback itself.
    #[default]
    Skill,
}

/// A candidate from a media skill.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaCandidate {
    /// Display title.
    pub title: String,
    /// Confidence band.
    pub tier: MediaTier,
    /// Numeric score in `0..=100`, tie-break within a tier.
    pub score: f64,
    /// Media type tag.
    pub media_type: MediaType,
    /// Playback type tag.
    pub playback: PlaybackType,
    /// Stream location, if any.
    #[serde(default)]
    pub uri: Option<String>,
    /// Presentation metadata (artist, image, ...).
    #[serde(default)]
    pub metadata: Value,
    /// Opaque data echoed back on selection.
    #[serde(default)]
    pub payload: Value,
}

/// A one-shot media skill: one candidate per query.
#[async_trait]
pub trait LegacyPlaySkill: Send + Sync {
    /// Return `(name, tier, payload)` or `None` when the skill cannot play
    /// the phrase.
    async fn match_query(&self, phrase: &str, media_type: MediaType) -> Option<(String, MediaTier, Value)>;

    /// Start playback of a selected match.
    async fn start(&self, ctx: SkillContext, phrase: String, payload: Value) -> Result<()>;
}

/// A streaming media skill: a lazy finite sequence of candidates.
#[async_trait]
pub trait MediaSearchSkill: Send + Sync {
    /// Candidates for `phrase`.  The caller stops pulling when its window
    /// closes.
    fn search(&self, phrase: &str, media_type: MediaType) -> BoxStream<'static, MediaCandidate>;

    /// Start playback of a selected candidate.
    async fn start(&self, ctx: SkillContext, candidate: MediaCandidate) -> Result<()>;
}

/// No-argument stop.
#[async_trait]
pub trait Stop: Send + Sync {
    /// `true` if the skill stopped something.
    async fn stop(&self) -> bool;
}

/// Session-aware stop.
#[async_trait]
pub trait SessionStop: Send + Sync {
    /// `true` if the skill stopped something in `session`.
    async fn stop_session(&self, session: &Session) -> bool;
}

/// The media capability of a skill.
#[derive(Clone)]
pub enum PlayCapability {
    /// One-shot matching.
    Legacy(Arc<dyn LegacyPlaySkill>),
    /// Streaming search.
    Streaming(Arc<dyn MediaSearchSkill>),
}

// ---------------------------------------------------------------------------
// Skill context
// ---------------------------------------------------------------------------

/// What a handler may do while handling a message.
#[derive(Clone)]
pub struct SkillContext {
    skill_id: String,
    bus: MessageBus,
    message: Message,
    dialogs: DialogLibrary,
    lang: String,
    gui: bool,
}

impl SkillContext {
    /// The skill this context belongs to.
    pub fn skill_id(&self) -> &str {
        &self.skill_id
    }

    /// The message that triggered the handler.
    pub fn message(&self) -> &Message {
        &self.message
    }

    /// Language of the dispatch.
    pub fn lang(&self) -> &str {
        &self.lang
    }

    /// Session of the dispatch.
    pub fn session_id(&self) -> &str {
        self.message.session_id()
    }

    /// The utterance being handled: `data.utterance`, else the first of
    /// `data.utterances`.
    pub fn utterance(&self) -> Option<&str> {
        self.message.data_str("utterance").or_else(|| {
            self.message
                .data
                .get("utterances")
                .and_then(Value::as_array)
                .and_then(|u| u.first())
                .and_then(Value::as_str)
        })
    }

    /// Whether a GUI is attached.
    pub fn gui_available(&self) -> bool {
        self.gui
    }

    /// The bus, for skills that subscribe to their own topics.
    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    /// Speak `utterance`.
    pub fn speak(&self, utterance: &str) {
        self.emit(
            "speak",
            json!({
                "utterance": utterance,
                "expect_response": false,
                "lang": self.lang,
                "meta": { "skill": self.skill_id },
            }),
        );
    }

    /// Speak the next variant of dialog template `name`.
    pub fn speak_dialog(&self, name: &str, data: &HashMap<String, String>) {
        let text = self.dialogs.get_dialog(name, &self.lang, data);
        self.speak(&text);
    }

    /// Publish a message derived from the triggering one.
    pub fn emit(&self, topic: &str, data: Value) {
        self.bus.publish(self.message.forward(topic, data));
    }

    /// Leave the fallback chain until the skill registers again.
    pub fn deactivate_fallback(&self) {
        self.emit(FALLBACK_DEACTIVATE, json!({ "skill_id": self.skill_id }));
    }
}

/// Builds [`SkillContext`]s for one pipeline.
#[derive(Clone)]
pub struct ContextFactory {
    bus: MessageBus,
    dialogs: DialogLibrary,
    gui: bool,
}

impl ContextFactory {
    /// Create a factory.
    pub fn new(bus: MessageBus, dialogs: DialogLibrary, gui: bool) -> Self {
        Self { bus, dialogs, gui }
    }

    /// Context for `skill_id` handling `message`.
    pub fn context(&self, skill_id: &str, message: &Message, lang: &str) -> SkillContext {
        SkillContext {
            skill_id: skill_id.to_string(),
            bus: self.bus.clone(),
            message: message.clone(),
            dialogs: self.dialogs.clone(),
            lang: lang.to_string(),
            gui: self.gui,
        }
    }

    /// The shared dialog library.
    pub fn dialogs(&self) -> &DialogLibrary {
        &self.dialogs
    }
}

// ---------------------------------------------------------------------------
// Skill handle
// ---------------------------------------------------------------------------

/// A regex intent declared by a skill.
#[derive(Clone)]
pub struct RegexIntentSpec {
    /// Intent name, local to the skill.
    pub name: String,
    /// Regex with named groups.
    pub pattern: String,
    /// Handler.
    pub handler: Arc<dyn IntentHandler>,
}

/// A keyword intent declared by a skill.
#[derive(Clone)]
pub struct KeywordIntentSpec {
    /// Intent name, local to the skill.
    pub name: String,
    /// Required and optional entity types, local to the skill.
    pub keywords: KeywordIntent,
    /// Handler.
    pub handler: Arc<dyn IntentHandler>,
}

/// The capability table of one skill.
#[derive(Clone)]
pub struct SkillHandle {
    id: String,
    pub(crate) regex_intents: Vec<RegexIntentSpec>,
    pub(crate) regex_entities: Vec<(String, String)>,
    pub(crate) keyword_intents: Vec<KeywordIntentSpec>,
    pub(crate) vocabulary: Vec<(String, Vec<String>)>,
    pub(crate) dialogs: Vec<(String, String, Vec<String>)>,
    pub(crate) fallback: Option<(i32, Arc<dyn FallbackHandler>)>,
    pub(crate) common_query: Option<Arc<dyn CommonQuerySkill>>,
    pub(crate) common_play: Option<PlayCapability>,
    pub(crate) stop: Option<Arc<dyn Stop>>,
    pub(crate) session_stop: Option<Arc<dyn SessionStop>>,
}

impl SkillHandle {
    /// An empty table for `id`.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            regex_intents: Vec::new(),
            regex_entities: Vec::new(),
            keyword_intents: Vec::new(),
            vocabulary: Vec::new(),
            dialogs: Vec::new(),
            fallback: None,
            common_query: None,
            common_play: None,
            stop: None,
            session_stop: None,
        }
    }

    /// The skill id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Fully qualified name of a skill-local intent: `<skill_id>:<name>`.
    pub fn qualify(&self, name: &str) -> String {
        format!("{}:{name}", self.id)
    }

    /// Declare a regex intent.
    #[must_use]
    pub fn regex_intent(
        mut self,
        name: impl Into<String>,
        pattern: impl Into<String>,
        handler: Arc<dyn IntentHandler>,
    ) -> Self {
        self.regex_intents.push(RegexIntentSpec {
            name: name.into(),
            pattern: pattern.into(),
            handler,
        });
        self
    }

    /// Declare a regex entity, shared by every regex intent.
    #[must_use]
    pub fn regex_entity(mut self, name: impl Into<String>, pattern: impl Into<String>) -> Self {
        self.regex_entities.push((name.into(), pattern.into()));
        self
    }

    /// Declare a keyword intent.
    #[must_use]
    pub fn keyword_intent(
        mut self,
        name: impl Into<String>,
        keywords: KeywordIntent,
        handler: Arc<dyn IntentHandler>,
    ) -> Self {
        self.keyword_intents.push(KeywordIntentSpec {
            name: name.into(),
            keywords,
            handler,
        });
        self
    }

    /// Declare vocabulary for a keyword entity type.
    #[must_use]
    pub fn vocabulary<I, S>(mut self, entity: impl Into<String>, phrases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.vocabulary
            .push((entity.into(), phrases.into_iter().map(Into::into).collect()));
        self
    }

    /// Ship a dialog template.
    #[must_use]
    pub fn dialog<I, S>(mut self, lang: impl Into<String>, name: impl Into<String>, variants: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dialogs.push((
            lang.into(),
            name.into(),
            variants.into_iter().map(Into::into).collect(),
        ));
        self
    }

    /// Join the fallback chain at `priority` (lower runs earlier).
    #[must_use]
    pub fn fallback(mut self, priority: i32, handler: Arc<dyn FallbackHandler>) -> Self {
        self.fallback = Some((priority, handler));
        self
    }

    /// Answer common queries.
    #[must_use]
    pub fn common_query(mut self, skill: Arc<dyn CommonQuerySkill>) -> Self {
        self.common_query = Some(skill);
        self
    }

    /// Offer one-shot media matches.
    #[must_use]
    pub fn legacy_play(mut self, skill: Arc<dyn LegacyPlaySkill>) -> Self {
        self.common_play = Some(PlayCapability::Legacy(skill));
        self
    }

    /// Offer streamed media candidates.
    #[must_use]
    pub fn media_search(mut self, skill: Arc<dyn MediaSearchSkill>) -> Self {
        self.common_play = Some(PlayCapability::Streaming(skill));
        self
    }

    /// Offer a no-argument stop.
    #[must_use]
    pub fn stop(mut self, skill: Arc<dyn Stop>) -> Self {
        self.stop = Some(skill);
        self
    }

    /// Offer a session-aware stop.
    #[must_use]
    pub fn session_stop(mut self, skill: Arc<dyn SessionStop>) -> Self {
        self.session_stop = Some(skill);
        self
    }

    /// Names of the capabilities this skill opts into.
    pub fn capabilities(&self) -> Vec<&'static str> {
        let mut caps = Vec::new();
        if !self.regex_intents.is_empty() {
            caps.push("regex_intent");
        }
        if !self.keyword_intents.is_empty() {
            caps.push("keyword_intent");
        }
        if self.fallback.is_some() {
            caps.push("fallback");
        }
        if self.common_query.is_some() {
            caps.push("common_query");
        }
        match self.common_play {
            Some(PlayCapability::Legacy(_)) => caps.push("common_play"),
            Some(PlayCapability::Streaming(_)) => caps.push("media_search"),
            None => {}
        }
        if self.stop.is_some() {
            caps.push("stop");
        }
        if self.session_stop.is_some() {
            caps.push("stop_session");
        }
        caps
    }
}

impl std::fmt::Debug for SkillHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SkillHandle")
            .field("id", &self.id)
            .field("capabilities", &self.capabilities())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Skill registry
// ---------------------------------------------------------------------------

/// Process-wide table of registered skills.
///
/// Cheaply cloneable.  [`SkillRegistry::snapshot`] lists configured priority
/// skills first, then the rest in registration order.
#[derive(Clone)]
pub struct SkillRegistry {
    inner: Arc<SkillRegistryInner>,
}

struct SkillRegistryInner {
    skills: DashMap<String, (u64, Arc<SkillHandle>)>,
    next_seq: AtomicU64,
    priority: Vec<String>,
}

impl SkillRegistry {
    /// Create a registry; `priority` ids iterate first.
    pub fn new(priority: Vec<String>) -> Self {
        Self {
            inner: Arc::new(SkillRegistryInner {
                skills: DashMap::new(),
                next_seq: AtomicU64::new(0),
                priority,
            }),
        }
    }

    /// Insert a skill.  Returns `false` if the id was taken.
    pub fn insert(&self, handle: SkillHandle) -> bool {
        let id = handle.id().to_string();
        match self.inner.skills.entry(id) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let seq = self.inner.next_seq.fetch_add(1, Ordering::Relaxed);
                slot.insert((seq, Arc::new(handle)));
                true
            }
        }
    }

    /// Remove a skill.
    pub fn remove(&self, skill_id: &str) -> Option<Arc<SkillHandle>> {
        self.inner.skills.remove(skill_id).map(|(_, (_, h))| h)
    }

    /// Look up a skill.
    pub fn get(&self, skill_id: &str) -> Option<Arc<SkillHandle>> {
        self.inner
            .skills
            .get(skill_id)
            .map(|e| Arc::clone(&e.value().1))
    }

    /// Whether `skill_id` is registered.
    pub fn contains(&self, skill_id: &str) -> bool {
        self.inner.skills.contains_key(skill_id)
    }

    /// Number of registered skills.
    pub fn len(&self) -> usize {
        self.inner.skills.len()
    }

    /// Whether no skill is registered.
    pub fn is_empty(&self) -> bool {
        self.inner.skills.is_empty()
    }

    /// Every skill, priority skills first, then by registration order.
    pub fn snapshot(&self) -> Vec<Arc<SkillHandle>> {
        let mut entries: Vec<(usize, u64, Arc<SkillHandle>)> = self
            .inner
            .skills
            .iter()
            .map(|e| {
                let (seq, handle) = e.value();
                let rank = self
                    .inner
                    .priority
                    .iter()
                    .position(|p| p == e.key())
                    .unwrap_or(usize::MAX);
                (rank, *seq, Arc::clone(handle))
            })
            .collect();
        entries.sort_by_key(|(rank, seq, _)| (*rank, *seq));
        entries.into_iter().map(|(_, _, h)| h).collect()
    }

    /// Snapshot filtered by a capability predicate.
    pub fn with<F>(&self, predicate: F) -> Vec<Arc<SkillHandle>>
    where
        F: Fn(&SkillHandle) -> bool,
    {
        self.snapshot()
            .into_iter()
            .filter(|h| predicate(h.as_ref()))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
