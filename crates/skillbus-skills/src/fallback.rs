//! Fallback probe skills.
//!
//! | Skill                  | Behavior                                        |
//! |------------------------|-------------------------------------------------|
//! | [`UnknownFallback`]    | priority 100, always speaks the `unknown` dialog |
//! | [`SwitchableFallback`] | returns a settable verdict, records every call  |
//! | [`SlowFallback`]       | never completes                                 |

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use skillbus_intent::{FallbackHandler, Result, SkillContext, SkillHandle};

/// Skill id of the catch-all fallback.
pub const UNKNOWN_SKILL_ID: &str = "fallback-unknown";
/// Priority of the catch-all fallback.
pub const UNKNOWN_PRIORITY: i32 = 100;

// ---------------------------------------------------------------------------
// Unknown
// ---------------------------------------------------------------------------

/// The last resort: tells the user it did not understand.
#[derive(Default)]
pub struct UnknownFallback;

#[async_trait]
impl FallbackHandler for UnknownFallback {
    async fn handle_fallback(&self, ctx: SkillContext) -> Result<bool> {
        tracing::debug!(utterance = ?ctx.utterance(), "unknown fallback speaking");
        ctx.speak_dialog("unknown", &HashMap::new());
        Ok(true)
    }
}

impl UnknownFallback {
    /// Build the skill at [`UNKNOWN_PRIORITY`].
    pub fn skill() -> SkillHandle {
        SkillHandle::new(UNKNOWN_SKILL_ID)
            .fallback(UNKNOWN_PRIORITY, Arc::new(Self))
            .dialog("en-us", "unknown", ["I don't know how to answer that"])
    }
}

// ---------------------------------------------------------------------------
// Switchable
// ---------------------------------------------------------------------------

/// Returns whatever verdict it was last given.
///
/// Cloning shares the verdict and the call log, so a test can keep a clone
/// after handing the skill to the pipeline.
#[derive(Clone, Default)]
pub struct SwitchableFallback {
    verdict: Arc<AtomicBool>,
    calls: Arc<Mutex<Vec<String>>>,
}

impl SwitchableFallback {
    /// Create a fallback answering `verdict`.
    pub fn new(verdict: bool) -> Self {
        let skill = Self::default();
        skill.set_verdict(verdict);
        skill
    }

    /// Change the verdict for later calls.
    pub fn set_verdict(&self, verdict: bool) {
        self.verdict.store(verdict, Ordering::SeqCst);
    }

    /// Utterances this fallback was asked about, oldest first.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Build a skill `skill_id` at `priority` around a clone of `self`.
    pub fn skill(&self, skill_id: &str, priority: i32) -> SkillHandle {
        SkillHandle::new(skill_id).fallback(priority, Arc::new(self.clone()))
    }
}

#[async_trait]
impl FallbackHandler for SwitchableFallback {
    async fn handle_fallback(&self, ctx: SkillContext) -> Result<bool> {
        let utterance = ctx.utterance().unwrap_or_default().to_string();
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).push(utterance);
        let verdict = self.verdict.load(Ordering::SeqCst);
        if verdict {
            ctx.speak(&format!("{} handled it", ctx.skill_id()));
        }
        Ok(verdict)
    }
}

// ---------------------------------------------------------------------------
// Slow
// ---------------------------------------------------------------------------

/// Loops forever; only the chain's timeout or a session close ends it.
#[derive(Clone, Default)]
pub struct SlowFallback {
    started: Arc<AtomicUsize>,
}

impl SlowFallback {
    /// How many times the handler was entered.
    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    /// Build a skill `skill_id` at `priority` around a clone of `self`.
    pub fn skill(&self, skill_id: &str, priority: i32) -> SkillHandle {
        SkillHandle::new(skill_id).fallback(priority, Arc::new(self.clone()))
    }
}

#[async_trait]
impl FallbackHandler for SlowFallback {
    async fn handle_fallback(&self, _ctx: SkillContext) -> Result<bool> {
        self.started.fetch_add(1, Ordering::SeqCst);
        loop {
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }
}
