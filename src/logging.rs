// Tracing setup: compact stdout output plus a non-blocking daily-rolling
// file under `~/.ara/logs/`. Rolled files older than the retention window
// are pruned on startup. Governance-relevant events additionally go to the
// audit log; this file only covers diagnostics.

use anyhow::{anyhow, Result};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::{Duration, SystemTime};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt::time::ChronoUtc, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

const FILE_PREFIX: &str = "ara";
const RETENTION: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Install the global subscriber. An explicit `level` overrides `RUST_LOG`;
/// with neither set, the crate logs at info and noisy http internals are
/// capped at warn. Returns the log directory.
pub fn init(level: Option<&str>) -> Result<PathBuf> {
    let dir = crate::paths::logs_dir();
    std::fs::create_dir_all(&dir)?;
    prune_old_logs(&dir);

    let (writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(&dir, FILE_PREFIX));
    LOG_GUARD
        .set(guard)
        .map_err(|_| anyhow!("tracing already initialized"))?;

    let timer = ChronoUtc::new("%Y-%m-%dT%H:%M:%S".to_string());
    let stdout_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_target(false)
        .with_file(true)
        .with_line_number(true)
        .with_timer(timer.clone());
    let file_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_target(false)
        .with_file(true)
        .with_line_number(true)
        .with_ansi(false)
        .with_timer(timer)
        .with_writer(writer);

    let _ = tracing_subscriber::registry()
        .with(env_filter(level))
        .with(stdout_layer)
        .with(file_layer)
        .try_init();

    Ok(dir)
}

fn env_filter(level: Option<&str>) -> EnvFilter {
    match level {
        Some(level) => EnvFilter::new(quiet_http(level)),
        None => EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(quiet_http("info"))),
    }
}

fn quiet_http(level: &str) -> String {
    format!("ara={level},hyper=warn,hyper_util=warn,reqwest=warn,mio=warn")
}

/// Best-effort removal of rolled log files past the retention window.
/// Failures are ignored; pruning must never block startup.
fn prune_old_logs(dir: &Path) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    let cutoff = SystemTime::now() - RETENTION;
    for path in entries.flatten().map(|e| e.path()) {
        let is_rolled_log = path.is_file()
            && path
                .file_name()
                .and_then(|n| n.to_str())
                .map_or(false, |n| n.starts_with(FILE_PREFIX));
        let expired = path
            .metadata()
            .and_then(|m| m.modified())
            .map_or(false, |t| t <= cutoff);
        if is_rolled_log && expired {
            let _ = std::fs::remove_file(&path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prune_keeps_fresh_logs_and_foreign_files() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("ara.2099-01-01"), "fresh log").unwrap();
        std::fs::write(tmp.path().join("notes.txt"), "not a log").unwrap();
        prune_old_logs(tmp.path());
        assert!(tmp.path().join("ara.2099-01-01").exists());
        assert!(tmp.path().join("notes.txt").exists());
    }

    #[test]
    fn prune_tolerates_missing_directory() {
        prune_old_logs(Path::new("/nonexistent/ara-logs"));
    }

    #[test]
    fn explicit_level_overrides_default() {
        assert!(env_filter(Some("debug")).to_string().contains("ara=debug"));
        assert!(env_filter(Some("trace")).to_string().contains("hyper=warn"));
    }
}
