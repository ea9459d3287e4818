//! Priority-ordered fallback chain.
//!
//! The chain holds one entry per fallback skill, sorted ascending by
//! priority and then by registration order.  [`FallbackChain::dispatch`]
//! invokes entries one at a time until one returns `true`:
//!
//! ```text
//! entry(prio 20) --false/timeout/error--> entry(prio 50) --true--> Handled
//!                                                        \--...--> Exhausted
//! ```
//!
//! Each call is bounded by the fallback timeout; a call that exceeds it is
//! aborted and the chain moves on.  Closing the dispatch's session aborts
//! the running call and ends the dispatch as [`FallbackOutcome::Cancelled`].
//!
//! A skill leaves the chain by publishing `fallback_deactivate
//! {skill_id}`.  The flip happens on the chain's entry; the skill rejoins
//! only by registering again.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use skillbus_kernel::{Message, MessageBus, SubscriptionId};
use tokio::sync::watch;

use crate::invoke::{Invocation, invoke};
use crate::skill::{ContextFactory, FALLBACK_DEACTIVATE, FallbackHandler};

/// Result of running the chain for one utterance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FallbackOutcome {
    /// The named skill handled the utterance.
    Handled { skill_id: String },
    /// Every active entry declined, failed or timed out.
    Exhausted,
    /// The session closed while a handler was running.
    Cancelled,
}

/// Public view of a chain entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FallbackEntryInfo {
    /// Owning skill.
    pub skill_id: String,
    /// Priority, lower runs earlier.
    pub priority: i32,
    /// Whether the entry takes part in dispatch.
    pub active: bool,
}

struct FallbackEntry {
    skill_id: String,
    priority: i32,
    seq: u64,
    active: bool,
    handler: Arc<dyn FallbackHandler>,
}

#[derive(Default)]
struct ChainState {
    entries: Vec<FallbackEntry>,
    next_seq: u64,
}

// ---------------------------------------------------------------------------
// FallbackChain
// ---------------------------------------------------------------------------

/// The fallback registry and dispatcher.  Cheaply cloneable.
#[derive(Clone)]
pub struct FallbackChain {
    state: Arc<RwLock<ChainState>>,
    bus: MessageBus,
    subscription: SubscriptionId,
}

impl FallbackChain {
    /// Create an empty chain listening for deactivation signals on `bus`.
    pub fn new(bus: MessageBus) -> Self {
        let state: Arc<RwLock<ChainState>> = Arc::default();
        let weak = Arc::downgrade(&state);
        let subscription = bus.on(FALLBACK_DEACTIVATE, move |message| {
            let Some(state) = weak.upgrade() else {
                return;
            };
            let Some(skill_id) = message.data_str("skill_id") else {
                tracing::warn!("fallback_deactivate without skill_id ignored");
                return;
            };
            let mut state = state.write().unwrap_or_else(|e| e.into_inner());
            if let Some(entry) = state.entries.iter_mut().find(|e| e.skill_id == skill_id) {
                entry.active = false;
                tracing::info!(skill_id = %skill_id, "fallback deactivated");
            }
        });
        Self {
            state,
            bus,
            subscription,
        }
    }

    /// Add (or replace) the skill's entry.  Re-registering reactivates it.
    pub fn register(&self, skill_id: &str, priority: i32, handler: Arc<dyn FallbackHandler>) {
        let mut state = self.write();
        state.entries.retain(|e| e.skill_id != skill_id);
        let seq = state.next_seq;
        state.next_seq += 1;
        state.entries.push(FallbackEntry {
            skill_id: skill_id.to_string(),
            priority,
            seq,
            active: true,
            handler,
        });
        state.entries.sort_by_key(|e| (e.priority, e.seq));
        tracing::debug!(skill_id = %skill_id, priority, "fallback registered");
    }

    /// Remove the skill's entry.  Returns `false` if it had none.
    pub fn unregister(&self, skill_id: &str) -> bool {
        let mut state = self.write();
        let before = state.entries.len();
        state.entries.retain(|e| e.skill_id != skill_id);
        before != state.entries.len()
    }

    /// Entries in dispatch order.
    pub fn entries(&self) -> Vec<FallbackEntryInfo> {
        self.read()
            .entries
            .iter()
            .map(|e| FallbackEntryInfo {
                skill_id: e.skill_id.clone(),
                priority: e.priority,
                active: e.active,
            })
            .collect()
    }

    /// Number of active entries.
    pub fn active_count(&self) -> usize {
        self.read().entries.iter().filter(|e| e.active).count()
    }

    /// Run the chain for `message`.
    ///
    /// `closed` is the session's close signal; when it flips the running
    /// handler is aborted and no further entries run.
    pub async fn dispatch(
        &self,
        message: &Message,
        lang: &str,
        contexts: &ContextFactory,
        timeout: Duration,
        closed: Option<watch::Receiver<bool>>,
    ) -> FallbackOutcome {
        // Snapshot so handlers may (de)register while the chain runs.
        let snapshot: Vec<(String, i32, Arc<dyn FallbackHandler>)> = self
            .read()
            .entries
            .iter()
            .filter(|e| e.active)
            .map(|e| (e.skill_id.clone(), e.priority, Arc::clone(&e.handler)))
            .collect();

        for (skill_id, priority, handler) in snapshot {
            // A handler earlier in this dispatch may have deactivated it.
            if !self.is_active(&skill_id) {
                continue;
            }
            tracing::debug!(skill_id = %skill_id, priority, "invoking fallback");
            let ctx = contexts.context(&skill_id, message, lang);
            let call = async move { handler.handle_fallback(ctx).await };

            match invoke("fallback", &skill_id, timeout, closed.clone(), call).await {
                Invocation::Completed(true) => {
                    tracing::info!(skill_id = %skill_id, priority, "fallback handled utterance");
                    return FallbackOutcome::Handled { skill_id };
                }
                Invocation::Completed(false) | Invocation::Failed(_) | Invocation::TimedOut => {}
                Invocation::Cancelled => return FallbackOutcome::Cancelled,
            }
        }
        FallbackOutcome::Exhausted
    }

    // -- Private helpers ----------------------------------------------------

    fn is_active(&self, skill_id: &str) -> bool {
        self.read()
            .entries
            .iter()
            .any(|e| e.skill_id == skill_id && e.active)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, ChainState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, ChainState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for FallbackChain {
    fn drop(&mut self) {
        // The last clone owns the deactivation subscription.
        if Arc::strong_count(&self.state) == 1 {
            self.bus.remove(FALLBACK_DEACTIVATE, self.subscription);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use serde_json::json;
    use skillbus_kernel::DialogLibrary;

    use super::*;
    use crate::error::{IntentError, Result};
    use crate::skill::SkillContext;

    struct Probe {
        name: &'static str,
        verdict: bool,
        calls: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl FallbackHandler for Probe {
        async fn handle_fallback(&self, _ctx: SkillContext) -> Result<bool> {
            self.calls.lock().unwrap().push(self.name);
            Ok(self.verdict)
        }
    }

    struct Hang;

    #[async_trait]
    impl FallbackHandler for Hang {
        async fn handle_fallback(&self, _ctx: SkillContext) -> Result<bool> {
            std::future::pending::<()>().await;
            Ok(true)
        }
    }

    struct Broken;

    #[async_trait]
    impl FallbackHandler for Broken {
        async fn handle_fallback(&self, _ctx: SkillContext) -> Result<bool> {
            Err(IntentError::Internal("no network".into()))
        }
    }

    struct Quitter;

    #[async_trait]
    impl FallbackHandler for Quitter {
        async fn handle_fallback(&self, ctx: SkillContext) -> Result<bool> {
            ctx.deactivate_fallback();
            Ok(false)
        }
    }

    fn setup() -> (MessageBus, FallbackChain, ContextFactory, Arc<Mutex<Vec<&'static str>>>) {
        let bus = MessageBus::new(64);
        let chain = FallbackChain::new(bus.clone());
        let contexts = ContextFactory::new(bus.clone(), DialogLibrary::new(), false);
        (bus, chain, contexts, Arc::default())
    }

    fn probe(name: &'static str, verdict: bool, calls: &Arc<Mutex<Vec<&'static str>>>) -> Arc<Probe> {
        Arc::new(Probe {
            name,
            verdict,
            calls: Arc::clone(calls),
        })
    }

    fn utterance() -> Message {
        Message::new("recognizer_loop:utterance", json!({"utterances": ["bork"]}))
    }

    #[tokio::test]
    async fn stops_at_first_handler_returning_true() {
        let (_bus, chain, contexts, calls) = setup();
        chain.register("late", 100, probe("late", true, &calls));
        chain.register("early", 20, probe("early", true, &calls));

        let outcome = chain
            .dispatch(&utterance(), "en-us", &contexts, Duration::from_secs(1), None)
            .await;
        assert_eq!(outcome, FallbackOutcome::Handled { skill_id: "early".into() });
        assert_eq!(*calls.lock().unwrap(), vec!["early"]);
    }

    #[tokio::test]
    async fn ascending_priority_with_registration_tiebreak() {
        let (_bus, chain, contexts, calls) = setup();
        chain.register("c", 50, probe("c", false, &calls));
        chain.register("a", 10, probe("a", false, &calls));
        chain.register("b", 50, probe("b", false, &calls));

        let outcome = chain
            .dispatch(&utterance(), "en-us", &contexts, Duration::from_secs(1), None)
            .await;
        assert_eq!(outcome, FallbackOutcome::Exhausted);
        assert_eq!(*calls.lock().unwrap(), vec!["a", "c", "b"]);
    }

    #[tokio::test]
    async fn slow_and_failing_handlers_are_skipped() {
        let (_bus, chain, contexts, calls) = setup();
        chain.register("slow", 10, Arc::new(Hang));
        chain.register("broken", 15, Arc::new(Broken));
        chain.register("unknown", 100, probe("unknown", true, &calls));

        let outcome = chain
            .dispatch(&utterance(), "en-us", &contexts, Duration::from_millis(50), None)
            .await;
        assert_eq!(outcome, FallbackOutcome::Handled { skill_id: "unknown".into() });
    }

    #[tokio::test]
    async fn session_close_cancels_dispatch() {
        let (_bus, chain, contexts, calls) = setup();
        chain.register("slow", 10, Arc::new(Hang));
        chain.register("unknown", 100, probe("unknown", true, &calls));

        let (tx, rx) = watch::channel(false);
        let closer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            tx.send_replace(true);
        });
        let outcome = chain
            .dispatch(&utterance(), "en-us", &contexts, Duration::from_secs(5), Some(rx))
            .await;
        closer.await.unwrap();

        assert_eq!(outcome, FallbackOutcome::Cancelled);
        assert!(calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn deactivation_skips_until_reregistered() {
        let (_bus, chain, contexts, calls) = setup();
        chain.register("quitter", 10, Arc::new(Quitter));
        chain.register("unknown", 100, probe("unknown", false, &calls));

        chain
            .dispatch(&utterance(), "en-us", &contexts, Duration::from_secs(1), None)
            .await;
        assert_eq!(chain.active_count(), 1);
        assert!(!chain.entries()[0].active);

        chain.register("quitter", 10, Arc::new(Quitter));
        assert_eq!(chain.active_count(), 2);
    }

    #[test]
    fn unregister_removes_entry() {
        let (_bus, chain, _contexts, calls) = setup();
        chain.register("x", 1, probe("x", true, &calls));
        assert!(chain.unregister("x"));
        assert!(!chain.unregister("x"));
        assert!(chain.entries().is_empty());
    }
}
