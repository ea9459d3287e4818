//! Skillbus kernel.
//!
//! This crate provides the foundational services every other skillbus crate
//! builds on:
//!
//! - **[`message`]** -- The [`Message`] record (topic, data, context) with
//!   routing-preserving `forward`/`reply` helpers.
//! - **[`bus`]** -- In-process publish/subscribe [`MessageBus`] with
//!   synchronous and deferred topic handlers, a firehose, and emit-and-wait.
//! - **[`session`]** -- Concurrent [`SessionRegistry`] using [`dashmap`] with
//!   per-session active-skill lists, expiry and close signalling.
//! - **[`config`]** -- Layered, copy-on-write [`Configuration`] with both the
//!   `lookup(key, default)` and `resolve_stack(configs, cache, remote)`
//!   access styles.
//! - **[`dialog`]** -- [`DialogLibrary`] dialog-template lookup.
//! - **[`error`]** -- Unified kernel error type via [`thiserror`].
//!
//! All public types are `Send + Sync` and designed for use within a
//! multi-threaded tokio runtime.

pub mod bus;
pub mod config;
pub mod dialog;
pub mod error;
pub mod message;
pub mod session;

// Re-export the most commonly used types at the crate root for convenience.
pub use bus::{MessageBus, SubscriptionId};
pub use config::{ConfigLayer, Configuration, GetArgs, LayerKind};
pub use dialog::DialogLibrary;
pub use error::{KernelError, Result};
pub use message::{DEFAULT_SESSION, Message};
pub use session::{ActiveSkill, SESSION_CLOSED, Session, SessionRegistry};
