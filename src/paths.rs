use std::path::PathBuf;
use std::sync::OnceLock;

static ARA_HOME: OnceLock<PathBuf> = OnceLock::new();

/// Returns the ARA home directory (`~/.ara/`).
/// Supports `$ARA_HOME` env override. Cached via `OnceLock`.
pub fn ara_home() -> &'static PathBuf {
    ARA_HOME.get_or_init(|| {
        if let Ok(val) = std::env::var("ARA_HOME") {
            let p = PathBuf::from(val);
            if !p.as_os_str().is_empty() {
                return p;
            }
        }
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".ara")
    })
}

/// `~/.ara/roles/`
pub fn roles_dir() -> PathBuf {
    ara_home().join("roles")
}

/// `~/.ara/skills/`
pub fn skills_dir() -> PathBuf {
    ara_home().join("skills")
}

/// `~/.ara/sessions/`
pub fn sessions_dir() -> PathBuf {
    ara_home().join("sessions")
}

/// `~/.ara/sandboxes/`
pub fn sandboxes_dir() -> PathBuf {
    ara_home().join("sandboxes")
}

/// `~/.ara/audit/`
pub fn audit_dir() -> PathBuf {
    ara_home().join("audit")
}

/// `~/.ara/credentials/`
pub fn credentials_dir() -> PathBuf {
    ara_home().join("credentials")
}

/// `~/.ara/archive/`
pub fn archive_dir() -> PathBuf {
    ara_home().join("archive")
}

/// `~/.ara/logs/`
pub fn logs_dir() -> PathBuf {
    ara_home().join("logs")
}

/// `~/.ara/wisdom.jsonl`
pub fn wisdom_file() -> PathBuf {
    ara_home().join("wisdom.jsonl")
}

/// `~/.ara/config.toml`
pub fn config_file() -> PathBuf {
    ara_home().join("config.toml")
}
