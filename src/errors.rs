// Canonical error taxonomy for the engine, built with `thiserror`.
//
// Gate and guard outcomes are decision values, not errors; only conditions
// that abort an operation surface here. No variant carries secret material
// in its message.

use thiserror::Error;

/// Which AEGIS sub-check refused a promotion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GateBlockKind {
    Secrets,
    Limits,
    Scope,
    Auth,
}

impl std::fmt::Display for GateBlockKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            GateBlockKind::Secrets => "secrets",
            GateBlockKind::Limits => "limits",
            GateBlockKind::Scope => "scope",
            GateBlockKind::Auth => "auth",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum CoreError {
    /// A path resolved outside its confinement base.
    #[error("path escapes confinement base: {0}")]
    PathEscape(String),

    /// Authority sets of a role profile intersect.
    #[error("role authority sets overlap: {0}")]
    RoleAuthorityOverlap(String),

    /// The LLM produced a plan that could not be parsed after retry.
    #[error("goal decomposition failed: {0}")]
    DecompositionFailed(String),

    /// A task's action is not permitted by the owning role.
    #[error("action '{action}' denied for role '{role}'")]
    AuthorityDenied { role: String, action: String },

    /// A skill failed the scan with blocking findings.
    #[error("skill '{0}' blocked by scan")]
    SkillScanBlocked(String),

    /// A skill's recorded integrity hash no longer matches its content.
    #[error("skill '{0}' integrity hash mismatch")]
    IntegrityMismatch(String),

    /// An AEGIS sub-check refused the promotion.
    #[error("gate blocked ({kind}): {reason}")]
    GateBlocked { kind: GateBlockKind, reason: String },

    /// Too many failed verification attempts; time-bound refusal.
    #[error("authentication locked out for {remaining_secs}s")]
    AuthLockout { remaining_secs: u64 },

    /// A session worker stopped heartbeating.
    #[error("session '{0}' heartbeat is stale")]
    StaleHeartbeat(String),

    /// The audit log hash chain failed verification. Fatal until rotated.
    #[error("audit chain break at entry {entry}")]
    ChainBreak { entry: usize },

    /// Provider call failure. Retryable failures are retried with backoff
    /// by the execution loop before surfacing.
    #[error("llm provider error (retryable={retryable}): {message}")]
    LlmError { retryable: bool, message: String },

    /// Operation invalid for the entity's current state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Filesystem or OS-level I/O failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization failure at a persistence boundary.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CoreError {
    /// Stable machine-readable kind label, used by the operator surface.
    pub fn kind(&self) -> &'static str {
        match self {
            CoreError::PathEscape(_) => "path_escape",
            CoreError::RoleAuthorityOverlap(_) => "role_authority_overlap",
            CoreError::DecompositionFailed(_) => "decomposition_failed",
            CoreError::AuthorityDenied { .. } => "authority_denied",
            CoreError::SkillScanBlocked(_) => "skill_scan_blocked",
            CoreError::IntegrityMismatch(_) => "integrity_mismatch",
            CoreError::GateBlocked { .. } => "gate_blocked",
            CoreError::AuthLockout { .. } => "auth_lockout",
            CoreError::StaleHeartbeat(_) => "stale_heartbeat",
            CoreError::ChainBreak { .. } => "chain_break",
            CoreError::LlmError { .. } => "llm_error",
            CoreError::InvalidState(_) => "invalid_state",
            CoreError::Io(_) => "io",
            CoreError::Serialization(_) => "serialization",
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_labels_are_stable() {
        assert_eq!(CoreError::PathEscape("x".into()).kind(), "path_escape");
        assert_eq!(
            CoreError::GateBlocked {
                kind: GateBlockKind::Secrets,
                reason: "found".into()
            }
            .kind(),
            "gate_blocked"
        );
        assert_eq!(
            CoreError::AuthLockout { remaining_secs: 10 }.kind(),
            "auth_lockout"
        );
    }

    #[test]
    fn display_never_contains_newlines() {
        let e = CoreError::LlmError {
            retryable: true,
            message: "timeout".into(),
        };
        assert!(!e.to_string().contains('\n'));
    }
}
