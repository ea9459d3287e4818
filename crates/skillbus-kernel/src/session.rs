//! Session registry.
//!
//! A session is a conversation scope spanning many utterances.  The registry
//! maps session ids to [`Session`] records and tracks, per session, which
//! skills were most recently active.  Sessions are created lazily on first
//! reference and reclaimed either by [`SessionRegistry::close`] or by the
//! periodic expiry sweep.
//!
//! The registry is backed by [`DashMap`]: mutations take a short per-shard
//! critical section and readers receive cloned snapshots, so no lock is held
//! across an `.await`.
//!
//! # Example
//!
//! ```rust
//! # use skillbus_kernel::bus::MessageBus;
//! # use skillbus_kernel::session::SessionRegistry;
//! let registry = SessionRegistry::new(MessageBus::default(), "en-us");
//! registry.get_or_create("kitchen");
//! registry.activate("kitchen", "timer-skill");
//!
//! assert_eq!(registry.active_skills("kitchen"), vec!["timer-skill"]);
//! ```

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::bus::MessageBus;
use crate::message::Message;

/// Topic published when a session is closed or expires.
pub const SESSION_CLOSED: &str = "ovos.session.closed";

/// Default inactivity timeout.
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(300);

/// Shortest period [`SessionRegistry::spawn_sweeper`] runs at.
pub const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(10);

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// A skill that handled something in a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveSkill {
    /// The skill's id.
    pub skill_id: String,
    /// When the skill was last activated.
    pub activated_at: DateTime<Utc>,
}

/// A conversation scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Unique identifier supplied by the client.
    pub session_id: String,
    /// Language tag for the conversation.
    pub lang: String,
    /// Active skills ordered by activation time, oldest first.  A skill id
    /// appears at most once.
    pub active_skills: Vec<ActiveSkill>,
    /// When the session was first referenced.
    pub created_at: DateTime<Utc>,
    /// When the session expires unless touched again.
    pub expires_at: DateTime<Utc>,
}

impl Session {
    /// Active skill ids, most recently activated first.
    pub fn active_skill_ids(&self) -> Vec<String> {
        self.active_skills
            .iter()
            .rev()
            .map(|a| a.skill_id.clone())
            .collect()
    }

    /// Whether the session has passed its expiry timestamp.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

struct SessionEntry {
    session: Session,
    closed: watch::Sender<bool>,
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Process-wide session registry.
///
/// Cheaply cloneable (`Arc`-backed) and `Send + Sync`.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    sessions: DashMap<String, SessionEntry>,
    bus: MessageBus,
    default_lang: String,
    ttl: chrono::Duration,
}

impl SessionRegistry {
    /// Create a registry with the default inactivity timeout.
    #[must_use]
    pub fn new(bus: MessageBus, default_lang: impl Into<String>) -> Self {
        Self::with_ttl(bus, default_lang, DEFAULT_SESSION_TTL)
    }

    /// Create a registry whose sessions expire after `ttl` of inactivity.
    #[must_use]
    pub fn with_ttl(bus: MessageBus, default_lang: impl Into<String>, ttl: Duration) -> Self {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(36_500));
        Self {
            inner: Arc::new(RegistryInner {
                sessions: DashMap::new(),
                bus,
                default_lang: default_lang.into(),
                ttl,
            }),
        }
    }

    /// Return the session record, allocating it with the default language
    /// and an empty active-skill list if absent.
    pub fn get_or_create(&self, session_id: &str) -> Session {
        self.entry(session_id).session.clone()
    }

    /// Return a snapshot of the session, if it exists.
    pub fn get(&self, session_id: &str) -> Option<Session> {
        self.inner
            .sessions
            .get(session_id)
            .map(|e| e.session.clone())
    }

    /// Reset the session's expiry timestamp.  Returns `false` if the session
    /// does not exist.
    pub fn touch(&self, session_id: &str) -> bool {
        match self.inner.sessions.get_mut(session_id) {
            Some(mut entry) => {
                entry.session.expires_at = self.expiry_from(Utc::now());
                true
            }
            None => false,
        }
    }

    /// Set the session's language, creating the session if needed.
    pub fn set_lang(&self, session_id: &str, lang: impl Into<String>) {
        self.entry(session_id).session.lang = lang.into();
    }

    /// Remove the session, signal cancellation to anyone holding its
    /// [`closed_signal`](Self::closed_signal), and publish
    /// [`SESSION_CLOSED`].
    ///
    /// Closing an unknown or already-closed session is a no-op and returns
    /// `false`.
    pub fn close(&self, session_id: &str) -> bool {
        let Some((_, entry)) = self.inner.sessions.remove(session_id) else {
            return false;
        };
        entry.closed.send_replace(true);
        tracing::info!(session_id = %session_id, "session closed");
        self.inner.bus.publish(
            Message::new(SESSION_CLOSED, json!({ "session_id": session_id }))
                .with_session(session_id),
        );
        true
    }

    /// Snapshot of every live session.
    pub fn list_active(&self) -> Vec<Session> {
        self.inner
            .sessions
            .iter()
            .map(|e| e.value().session.clone())
            .collect()
    }

    /// Number of live sessions.
    pub fn count(&self) -> usize {
        self.inner.sessions.len()
    }

    /// Record that `skill_id` handled something in the session, moving it
    /// to the most-recent position.
    pub fn activate(&self, session_id: &str, skill_id: &str) {
        let mut entry = self.entry(session_id);
        let active = &mut entry.session.active_skills;
        active.retain(|a| a.skill_id != skill_id);
        active.push(ActiveSkill {
            skill_id: skill_id.to_string(),
            activated_at: Utc::now(),
        });
        tracing::debug!(session_id = %session_id, skill_id = %skill_id, "skill activated");
    }

    /// Drop `skill_id` from the session's active list.  Returns `false` if it
    /// was not active.
    pub fn deactivate(&self, session_id: &str, skill_id: &str) -> bool {
        let Some(mut entry) = self.inner.sessions.get_mut(session_id) else {
            return false;
        };
        let active = &mut entry.session.active_skills;
        let before = active.len();
        active.retain(|a| a.skill_id != skill_id);
        let removed = active.len() != before;
        if removed {
            tracing::debug!(session_id = %session_id, skill_id = %skill_id, "skill deactivated");
        }
        removed
    }

    /// Active skill ids for the session, most recently activated first.
    pub fn active_skills(&self, session_id: &str) -> Vec<String> {
        self.get(session_id)
            .map(|s| s.active_skill_ids())
            .unwrap_or_default()
    }

    /// A receiver that flips to `true` when the session is closed.
    ///
    /// Creates the session if needed so the signal is always tied to a live
    /// record.
    pub fn closed_signal(&self, session_id: &str) -> watch::Receiver<bool> {
        self.entry(session_id).closed.subscribe()
    }

    /// Close every session whose expiry timestamp has passed.  Returns the
    /// closed ids.
    pub fn sweep_expired(&self) -> Vec<String> {
        let now = Utc::now();
        let expired: Vec<String> = self
            .inner
            .sessions
            .iter()
            .filter(|e| e.value().session.is_expired(now))
            .map(|e| e.key().clone())
            .collect();

        for id in &expired {
            self.close(id);
        }
        if !expired.is_empty() {
            tracing::info!(count = expired.len(), "expired sessions swept");
        }
        expired
    }

    /// Spawn a background task that calls [`sweep_expired`](Self::sweep_expired)
    /// every `interval`.  Shorter intervals than [`MIN_SWEEP_INTERVAL`] are raised to it.
    pub fn spawn_sweeper(&self, interval: Duration) -> JoinHandle<()> {
        let interval = if interval < MIN_SWEEP_INTERVAL {
            tracing::warn!(?interval, min = ?MIN_SWEEP_INTERVAL, "sweep interval too short, clamped");
            MIN_SWEEP_INTERVAL
        } else {
            interval
        };
        let registry = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                registry.sweep_expired();
            }
        })
    }

    // -- Private helpers ----------------------------------------------------

    fn entry(&self, session_id: &str) -> dashmap::mapref::one::RefMut<'_, String, SessionEntry> {
        self.inner
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(|| {
                let now = Utc::now();
                tracing::debug!(session_id = %session_id, "session created");
                let (closed, _) = watch::channel(false);
                SessionEntry {
                    session: Session {
                        session_id: session_id.to_string(),
                        lang: self.inner.default_lang.clone(),
                        active_skills: Vec::new(),
                        created_at: now,
                        expires_at: self.expiry_from(now),
                    },
                    closed,
                }
            })
    }

    fn expiry_from(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now.checked_add_signed(self.inner.ttl)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
