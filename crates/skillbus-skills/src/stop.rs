//! Stop probe skills.
//!
//! [`NoisePlayerSkill`] plays per session and offers both stop flavors.
//! [`TimerSkill`] rings process-wide and offers only the no-argument stop.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::json;
use skillbus_intent::{IntentHandler, IntentMatch, Result, SessionStop, SkillContext, SkillHandle, Stop};
use skillbus_kernel::Session;

/// Skill id of the white-noise player.
pub const NOISE_SKILL_ID: &str = "white-noise";
/// Skill id of the timer.
pub const TIMER_SKILL_ID: &str = "timer";

// ---------------------------------------------------------------------------
// White noise (session-aware)
// ---------------------------------------------------------------------------

/// Plays white noise in the sessions that asked for it.
#[derive(Clone, Default)]
pub struct NoisePlayerSkill {
    playing: Arc<Mutex<HashSet<String>>>,
}

impl NoisePlayerSkill {
    /// Whether `session_id` is playing.
    pub fn is_playing(&self, session_id: &str) -> bool {
        self.lock().contains(session_id)
    }

    /// Build the skill around a clone of `self`.
    pub fn skill(&self) -> SkillHandle {
        let shared = Arc::new(self.clone());
        SkillHandle::new(NOISE_SKILL_ID)
            .regex_intent("play_noise", r"^(?:play )?(?:some )?white noise$", shared.clone())
            .stop(shared.clone())
            .session_stop(shared)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.playing.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl IntentHandler for NoisePlayerSkill {
    async fn handle(&self, ctx: SkillContext, _intent: &IntentMatch) -> Result<()> {
        self.lock().insert(ctx.session_id().to_string());
        ctx.speak("Playing white noise");
        Ok(())
    }
}

#[async_trait]
impl SessionStop for NoisePlayerSkill {
    async fn stop_session(&self, session: &Session) -> bool {
        self.lock().remove(&session.session_id)
    }
}

#[async_trait]
impl Stop for NoisePlayerSkill {
    async fn stop(&self) -> bool {
        let mut playing = self.lock();
        let any = !playing.is_empty();
        playing.clear();
        any
    }
}

// ---------------------------------------------------------------------------
// Timer (global)
// ---------------------------------------------------------------------------

/// A timer that rings until stopped.
#[derive(Clone, Default)]
pub struct TimerSkill {
    ringing: Arc<AtomicBool>,
}

impl TimerSkill {
    /// Whether the timer is ringing.
    pub fn is_ringing(&self) -> bool {
        self.ringing.load(Ordering::SeqCst)
    }

    /// Build the skill around a clone of `self`.
    pub fn skill(&self) -> SkillHandle {
        let shared = Arc::new(self.clone());
        SkillHandle::new(TIMER_SKILL_ID)
            .regex_intent(
                "start_timer",
                r"^(?:set|start) a timer(?: for (?P<Duration>\d+ (?:seconds?|minutes?)))?$",
                shared.clone(),
            )
            .stop(shared)
    }
}

#[async_trait]
impl IntentHandler for TimerSkill {
    async fn handle(&self, ctx: SkillContext, intent: &IntentMatch) -> Result<()> {
        // The probe timer expires immediately.
        self.ringing.store(true, Ordering::SeqCst);
        let duration = intent.entities.get("Duration").cloned().unwrap_or_default();
        ctx.emit("timer.expired", json!({ "duration": duration }));
        ctx.speak("Your timer is ringing");
        Ok(())
    }
}

#[async_trait]
impl Stop for TimerSkill {
    async fn stop(&self) -> bool {
        self.ringing.swap(false, Ordering::SeqCst)
    }
}
