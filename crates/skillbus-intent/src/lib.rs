//! Intent dispatch pipeline for skillbus.
//!
//! This crate turns an inbound `recognizer_loop:utterance` message into
//! exactly one outcome:
//!
//! - **Matching**: a case-insensitive regex matcher with shared entity
//!   patterns ([`RegexMatcher`]) and an Adapt-style keyword matcher
//!   ([`KeywordMatcher`]), both behind the [`IntentMatcher`] trait.
//! - **Arbitration**: [`CommonQueryArbiter`] and [`CommonPlayArbiter`] collect
//!   candidates from skills over the bus within a bounded window and pick one
//!   by tier.
//! - **Fallbacks**: [`FallbackChain`] runs priority-ordered handlers, each
//!   bounded by a timeout, until one claims the utterance.
//! - **Stop**: [`StopDispatcher`] routes stop commands to session-aware and
//!   global stop capabilities.
//! - **Orchestration**: [`IntentService`] runs the configured stages and
//!   always terminates a dispatch with `ovos.utterance.handled`.
//!
//! Skills are capability tables built with [`SkillHandle`]; the
//! [`SkillHost`] answers arbiter traffic on their behalf.

pub mod common_play;
pub mod common_query;
pub mod error;
pub mod fallback;
pub mod host;
mod invoke;
pub mod matcher;
pub mod pipeline;
pub mod settings;
pub mod skill;
pub mod stop;
pub mod utterance;

pub use common_play::{CommonPlayArbiter, PlaySelection};
pub use common_query::{CommonQueryArbiter, QuerySelection};
pub use error::{IntentError, Result};
pub use fallback::{FallbackChain, FallbackEntryInfo, FallbackOutcome};
pub use host::SkillHost;
pub use matcher::{IntentMatch, IntentMatcher, KeywordIntent, KeywordMatcher, PatternSpec, RegexMatcher};
pub use pipeline::{DispatchOutcome, IntentService};
pub use settings::{CoreSettings, PipelineStage};
pub use skill::{
    CommonQuerySkill, ContextFactory, FallbackHandler, IntentHandler, LegacyPlaySkill, MediaCandidate,
    MediaSearchSkill, MediaTier, MediaType, PlayCapability, PlaybackType, QueryAnswer, QueryTier,
    SessionStop, SkillContext, SkillHandle, SkillRegistry, Stop,
};
pub use stop::{StopDispatcher, StopOutcome};
pub use utterance::{UTTERANCE_TOPIC, UtteranceEvent};
