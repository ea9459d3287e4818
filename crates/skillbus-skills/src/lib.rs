//! Probe skills for skillbus.
//!
//! Small, deterministic skills that exercise every branch of the dispatch
//! pipeline:
//!
//! - **[`hello`]** -- keyword intents answered from dialog templates.
//! - **[`weather`]** -- a regex intent with a shared `Location` entity.
//! - **[`wiki`]** -- common-query answers from a fact table, with a GUI
//!   follow-up on selection.
//! - **[`media`]** -- a one-shot radio skill and a streaming catalog skill
//!   for common-play.
//! - **[`stop`]** -- a session-aware player and a global timer.
//! - **[`fallback`]** -- the catch-all `unknown` fallback plus switchable
//!   and never-completing fallbacks for tests.
//!
//! [`default_skills`] returns the set the `skillbus` binary loads.

pub mod fallback;
pub mod hello;
pub mod media;
pub mod stop;
pub mod weather;
pub mod wiki;

use skillbus_intent::{IntentService, Result, SkillHandle};

pub use fallback::{SlowFallback, SwitchableFallback, UnknownFallback};
pub use media::{CatalogSkill, RadioSkill};
pub use stop::{NoisePlayerSkill, TimerSkill};
pub use wiki::WikiSkill;

/// The demo skill set: every probe skill except the test-only fallbacks.
pub fn default_skills() -> Vec<SkillHandle> {
    vec![
        hello::skill(),
        weather::skill(),
        WikiSkill::default().skill(),
        RadioSkill::default().skill(),
        CatalogSkill::default().skill(),
        NoisePlayerSkill::default().skill(),
        TimerSkill::default().skill(),
        UnknownFallback::skill(),
    ]
}

/// Register every handle in order.  Stops at the first failure; skills
/// registered before it stay registered.
pub fn register_all<I>(service: &IntentService, skills: I) -> Result<usize>
where
    I: IntoIterator<Item = SkillHandle>,
{
    let mut count = 0;
    for handle in skills {
        let skill_id = handle.id().to_string();
        service.register_skill(handle)?;
        tracing::debug!(skill_id = %skill_id, "probe skill loaded");
        count += 1;
    }
    Ok(count)
}
