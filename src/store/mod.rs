//! Flat-file persistence for roles and sessions.
//!
//! Directory layout (under `~/.ara/`):
//! ```text
//! roles/<name>.yaml           # RoleProfile
//! sessions/<id>/
//!   state.yaml                # Session
//!   decisions.jsonl           # one DecisionRecord per line, append-only
//!   checkpoints/              # CheckpointManager records
//! ```

pub mod roles;
pub mod sessions;

use anyhow::{bail, Result};

/// Ids and role names become directory components; keep them boring.
pub(crate) fn validate_id(id: &str) -> Result<()> {
    if id.is_empty() {
        bail!("identifier must not be empty");
    }
    if id.contains("..") || id.contains('/') || id.contains('\\') || id.contains('\0') {
        bail!("identifier contains invalid characters: {}", id);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_validation() {
        assert!(validate_id("sess-abc123").is_ok());
        assert!(validate_id("software-engineer").is_ok());
        assert!(validate_id("").is_err());
        assert!(validate_id("../escape").is_err());
        assert!(validate_id("a/b").is_err());
        assert!(validate_id("a\\b").is_err());
    }
}
