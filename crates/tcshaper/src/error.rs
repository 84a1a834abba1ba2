//! Error types for the shaping engine

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ShaperError {
    /// Malformed or out-of-range user input. Surfaced immediately, never retried.
    #[error("invalid parameter {param:?}: {reason}")]
    Parameter { param: String, reason: String },

    /// Unknown magnitude suffix, distinct from a plain range error so callers
    /// can point at the exact unit the user typed.
    #[error("unit not found in {0:?}")]
    UnitNotFound(String),

    /// Device or container absent, with a best-effort list of alternatives.
    #[error("target not found: {target} (available: {})", .alternatives.join(", "))]
    TargetNotFound {
        target: String,
        alternatives: Vec<String>,
    },

    /// Soft identity conflict. The message always names the flag that
    /// resolves it.
    #[error("{what} already exists; {hint}")]
    AlreadyExists { what: String, hint: String },

    /// Any other non-zero backend exit. Hard stop, stderr surfaced verbatim.
    #[error("command failed: {command}: {stderr}")]
    Backend { command: String, stderr: String },

    #[error("identifier space exhausted for {0}")]
    IdSpaceExhausted(&'static str),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ShaperError {
    /// Convenience for parameter errors.
    pub fn parameter(param: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Parameter {
            param: param.into(),
            reason: reason.into(),
        }
    }

    /// Whether the error is a local validation problem rather than a
    /// backend/system failure. The CLI maps these to EINVAL.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::Parameter { .. }
                | Self::UnitNotFound(_)
                | Self::TargetNotFound { .. }
                | Self::AlreadyExists { .. }
                | Self::IdSpaceExhausted(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ShaperError>;
