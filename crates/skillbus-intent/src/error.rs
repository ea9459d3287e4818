//! Intent pipeline error types.
//!
//! All intent subsystems surface errors through [`IntentError`].  Errors stay
//! inside the component that raised them: the orchestrator logs them and
//! moves on, so a dispatch never fails because of one.

/// Unified error type for the intent pipeline.
#[derive(Debug, thiserror::Error)]
pub enum IntentError {
    // -- Matcher errors ------------------------------------------------------
    /// A regex pattern supplied to a matcher is invalid.
    #[error("invalid regex pattern `{pattern}`: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    /// The matcher does not understand this kind of pattern spec.
    #[error("matcher `{matcher}` does not accept {kind} patterns")]
    UnsupportedPattern { matcher: String, kind: String },

    /// Building the keyword automaton failed.
    #[error("keyword automaton build error: {reason}")]
    AutomatonBuild { reason: String },

    /// A keyword intent lists no required entity types.
    #[error("keyword intent `{intent}` has no required entity types")]
    EmptyKeywordIntent { intent: String },

    // -- Skill registry errors -----------------------------------------------
    /// A skill with this id is already registered.
    #[error("skill already registered: {skill_id}")]
    DuplicateSkill { skill_id: String },

    /// The referenced skill is not registered.
    #[error("skill not found: {skill_id}")]
    SkillNotFound { skill_id: String },

    // -- Upstream crate errors -----------------------------------------------
    /// An error propagated from the kernel crate.
    #[error("kernel error: {0}")]
    Kernel(#[from] skillbus_kernel::KernelError),

    /// JSON serialization or deserialization failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    // -- Generic -------------------------------------------------------------
    /// Catch-all for unexpected internal errors.
    #[error("internal intent error: {0}")]
    Internal(String),
}

/// Convenience alias used throughout the intent crate.
pub type Result<T> = std::result::Result<T, IntentError>;
