//! Stop dispatch.
//!
//! Two flavors:
//!
//! - **Per session**: skills with a session-aware stop are consulted in
//!   reverse activation order for the utterance's session.  The first that
//!   returns `true` is removed from the session's active list and the
//!   request is consumed.
//! - **Global**: when no session-aware stop consumed the request, every
//!   skill offering only a no-argument stop is asked.  Skills offering both
//!   have their no-argument stop called afterwards, and only if nothing
//!   else stopped.
//!
//! `false` from a stop method means "not mine".  Each call is bounded by
//! the handler timeout; a failed or late call counts as `false`.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use skillbus_kernel::{Message, MessageBus, SessionRegistry};

use crate::error::IntentError;
use crate::invoke::{Invocation, invoke};
use crate::skill::{SkillHandle, SkillRegistry};

/// Bus topic requesting a global stop.
pub const STOP_TOPIC: &str = "mycroft.stop";
/// Published for every skill that stopped something.
pub const STOP_HANDLED_TOPIC: &str = "mycroft.stop.handled";

/// What a stop request stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopOutcome {
    /// A session-aware skill stopped.
    Session { skill_id: String },
    /// These skills stopped through their no-argument stop.
    Global { skill_ids: Vec<String> },
    /// Nobody claimed the request.
    NothingToStop,
}

impl StopOutcome {
    /// Whether anything stopped.
    pub fn stopped(&self) -> bool {
        !matches!(self, Self::NothingToStop)
    }
}

/// Routes stop requests to skills.
#[derive(Clone)]
pub struct StopDispatcher {
    bus: MessageBus,
    sessions: SessionRegistry,
    skills: SkillRegistry,
    vocabulary: Vec<String>,
    timeout: Duration,
}

impl StopDispatcher {
    /// Create a dispatcher recognizing `vocabulary` as stop commands.
    pub fn new(
        bus: MessageBus,
        sessions: SessionRegistry,
        skills: SkillRegistry,
        vocabulary: Vec<String>,
        timeout: Duration,
    ) -> Self {
        let vocabulary = vocabulary.iter().map(|v| normalize(v)).collect();
        Self {
            bus,
            sessions,
            skills,
            vocabulary,
            timeout,
        }
    }

    /// Whether `utterance` is a stop command.  A trailing or leading
    /// "please" is ignored.
    pub fn is_stop_command(&self, utterance: &str) -> bool {
        let text = normalize(utterance);
        let text = text
            .strip_prefix("please ")
            .or_else(|| text.strip_suffix(" please"))
            .unwrap_or(&text);
        self.vocabulary.iter().any(|v| v == text)
    }

    /// Per-session stop, then global stop.
    pub async fn dispatch(&self, message: &Message) -> StopOutcome {
        if let Some(skill_id) = self.stop_session(message).await {
            return StopOutcome::Session { skill_id };
        }
        self.stop_global(message).await
    }

    /// Ask the session's active session-aware skills, most recent first.
    pub async fn stop_session(&self, message: &Message) -> Option<String> {
        let session_id = message.session_id();
        let session = self.sessions.get(session_id)?;

        for skill_id in session.active_skill_ids() {
            let Some(stopper) = self.skills.get(&skill_id).and_then(|h| h.session_stop.clone()) else {
                continue;
            };
            let snapshot = session.clone();
            let call = async move { Ok::<_, IntentError>(stopper.stop_session(&snapshot).await) };
            if let Invocation::Completed(true) = invoke("stop_session", &skill_id, self.timeout, None, call).await {
                self.sessions.deactivate(session_id, &skill_id);
                self.announce(message, &skill_id, "session");
                tracing::info!(session_id = %session_id, skill_id = %skill_id, "session stop handled");
                return Some(skill_id);
            }
        }
        None
    }

    /// Ask stop-only skills, then, if none stopped, the no-argument stop of
    /// skills that also offer a session-aware stop.
    pub async fn stop_global(&self, message: &Message) -> StopOutcome {
        let snapshot = self.skills.snapshot();
        let stop_only: Vec<&Arc<SkillHandle>> = snapshot
            .iter()
            .filter(|h| h.stop.is_some() && h.session_stop.is_none())
            .collect();
        let dual: Vec<&Arc<SkillHandle>> = snapshot
            .iter()
            .filter(|h| h.stop.is_some() && h.session_stop.is_some())
            .collect();

        let mut stopped = self.call_stop(message, &stop_only).await;
        if stopped.is_empty() {
            stopped = self.call_stop(message, &dual).await;
        }

        if stopped.is_empty() {
            tracing::debug!("stop request found nothing to stop");
            StopOutcome::NothingToStop
        } else {
            StopOutcome::Global { skill_ids: stopped }
        }
    }

    // -- Private helpers ----------------------------------------------------

    async fn call_stop(&self, message: &Message, handles: &[&Arc<SkillHandle>]) -> Vec<String> {
        let mut stopped = Vec::new();
        for handle in handles {
            let Some(stopper) = handle.stop.clone() else {
                continue;
            };
            let call = async move { Ok::<_, IntentError>(stopper.stop().await) };
            if let Invocation::Completed(true) = invoke("stop", handle.id(), self.timeout, None, call).await {
                self.sessions.deactivate(message.session_id(), handle.id());
                self.announce(message, handle.id(), "global");
                stopped.push(handle.id().to_string());
            }
        }
        stopped
    }

    fn announce(&self, message: &Message, skill_id: &str, scope: &str) {
        self.bus.publish(message.forward(
            STOP_HANDLED_TOPIC,
            json!({ "skill_id": skill_id, "scope": scope }),
        ));
    }
}

fn normalize(text: &str) -> String {
    text.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '\'' { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use skillbus_kernel::Session;

    use super::*;
    use crate::skill::{SessionStop, Stop};

    #[derive(Default)]
    struct Player {
        verdict: bool,
        no_arg_calls: Mutex<u32>,
        session_calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Stop for Player {
        async fn stop(&self) -> bool {
            *self.no_arg_calls.lock().unwrap() += 1;
            self.verdict
        }
    }

    #[async_trait]
    impl SessionStop for Player {
        async fn stop_session(&self, session: &Session) -> bool {
            self.session_calls.lock().unwrap().push(session.session_id.clone());
            self.verdict
        }
    }

    fn player(verdict: bool) -> Arc<Player> {
        Arc::new(Player {
            verdict,
            ..Player::default()
        })
    }

    fn dispatcher(skills: &SkillRegistry, sessions: &SessionRegistry, bus: &MessageBus) -> StopDispatcher {
        let vocabulary = vec!["stop".to_string(), "be quiet".to_string()];
        StopDispatcher::new(bus.clone(), sessions.clone(), skills.clone(), vocabulary, Duration::from_secs(1))
    }

    #[test]
    fn stop_vocabulary() {
        let bus = MessageBus::new(8);
        let d = dispatcher(
            &SkillRegistry::new(Vec::new()),
            &SessionRegistry::new(bus.clone(), "en-us"),
            &bus,
        );
        assert!(d.is_stop_command("Stop!"));
        assert!(d.is_stop_command("be   quiet please"));
        assert!(!d.is_stop_command("stop the music and dance"));
    }

    #[tokio::test]
    async fn session_stop_in_reverse_activation_order() {
        let bus = MessageBus::new(64);
        let sessions = SessionRegistry::new(bus.clone(), "en-us");
        let skills = SkillRegistry::new(Vec::new());
        let (older, newer) = (player(true), player(false));
        skills.insert(SkillHandle::new("older").session_stop(older.clone()));
        skills.insert(SkillHandle::new("newer").session_stop(newer.clone()));
        sessions.activate("car", "older");
        sessions.activate("car", "newer");

        let msg = Message::new("recognizer_loop:utterance", json!({})).with_session("car");
        let outcome = dispatcher(&skills, &sessions, &bus).dispatch(&msg).await;

        assert_eq!(outcome, StopOutcome::Session { skill_id: "older".into() });
        assert_eq!(*newer.session_calls.lock().unwrap(), vec!["car"]);
        assert_eq!(sessions.active_skills("car"), vec!["newer"]);
    }

    #[tokio::test]
    async fn global_stop_prefers_stop_only_skills() {
        let bus = MessageBus::new(64);
        let sessions = SessionRegistry::new(bus.clone(), "en-us");
        let skills = SkillRegistry::new(Vec::new());
        let (dual, plain) = (player(true), player(true));
        skills.insert(SkillHandle::new("dual").stop(dual.clone()).session_stop(dual.clone()));
        skills.insert(SkillHandle::new("plain").stop(plain.clone()));

        let mut rx = bus.subscribe();
        let msg = Message::new(STOP_TOPIC, json!({}));
        let outcome = dispatcher(&skills, &sessions, &bus).stop_global(&msg).await;

        assert_eq!(outcome, StopOutcome::Global { skill_ids: vec!["plain".into()] });
        assert_eq!(*dual.no_arg_calls.lock().unwrap(), 0);
        let handled = rx.recv().await.unwrap();
        assert_eq!(handled.msg_type, STOP_HANDLED_TOPIC);
        assert_eq!(handled.data_str("skill_id"), Some("plain"));
    }

    #[tokio::test]
    async fn dual_skills_are_the_coarse_fallback() {
        let bus = MessageBus::new(64);
        let sessions = SessionRegistry::new(bus.clone(), "en-us");
        let skills = SkillRegistry::new(Vec::new());
        let (dual, plain) = (player(true), player(false));
        skills.insert(SkillHandle::new("dual").stop(dual.clone()).session_stop(dual.clone()));
        skills.insert(SkillHandle::new("plain").stop(plain.clone()));

        let msg = Message::new(STOP_TOPIC, json!({}));
        let d = dispatcher(&skills, &sessions, &bus);
        assert_eq!(
            d.dispatch(&msg).await,
            StopOutcome::Global { skill_ids: vec!["dual".into()] }
        );
        assert_eq!(*plain.no_arg_calls.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn nothing_to_stop() {
        let bus = MessageBus::new(64);
        let sessions = SessionRegistry::new(bus.clone(), "en-us");
        let skills = SkillRegistry::new(Vec::new());
        let outcome = dispatcher(&skills, &sessions, &bus)
            .dispatch(&Message::new(STOP_TOPIC, json!({})))
            .await;
        assert!(!outcome.stopped());
    }
}
