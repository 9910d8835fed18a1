// Session host: registry of running session workers.
//
// Each running session gets one background worker. Operator control
// operations go through a single-writer mpsc queue per session; a forwarder
// task drains the queue into flags the execution loop checks between tasks,
// so commands serialize and never race the loop. The registry also enforces
// the one-running-session-per-workspace invariant and surfaces
// stale-heartbeat sessions for recovery.

use crate::errors::{CoreError, CoreResult};
use crate::session::Session;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Heartbeats older than this make a running session recovery-eligible.
pub const STALE_SECONDS: u64 = 120;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    Pause,
    Cancel,
}

/// Flags the execution loop polls between tasks.
#[derive(Clone, Debug)]
pub struct WorkerControls {
    pub cancel: Arc<AtomicBool>,
    pub pause: Arc<AtomicBool>,
}

struct WorkerEntry {
    workspace: PathBuf,
    control_tx: mpsc::Sender<ControlCommand>,
}

#[derive(Default)]
pub struct SessionManager {
    workers: Mutex<HashMap<String, WorkerEntry>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a worker for a session. Fails if another session is already
    /// running against the same workspace. Returns the flags for the loop
    /// and spawns the control-queue forwarder.
    pub fn register(&self, session_id: &str, workspace: &Path) -> CoreResult<WorkerControls> {
        let mut workers = self.workers.lock().expect("worker registry lock");
        if let Some((other, _)) = workers
            .iter()
            .find(|(_, entry)| entry.workspace == workspace)
        {
            return Err(CoreError::InvalidState(format!(
                "workspace {} already has running session {}",
                workspace.display(),
                other
            )));
        }
        if workers.contains_key(session_id) {
            return Err(CoreError::InvalidState(format!(
                "session {} already has a worker",
                session_id
            )));
        }

        let controls = WorkerControls {
            cancel: Arc::new(AtomicBool::new(false)),
            pause: Arc::new(AtomicBool::new(false)),
        };
        let (control_tx, mut control_rx) = mpsc::channel::<ControlCommand>(16);
        {
            let controls = controls.clone();
            let id = session_id.to_string();
            tokio::spawn(async move {
                while let Some(command) = control_rx.recv().await {
                    match command {
                        ControlCommand::Pause => controls.pause.store(true, Ordering::SeqCst),
                        ControlCommand::Cancel => controls.cancel.store(true, Ordering::SeqCst),
                    }
                    info!("Session {}: control command {:?}", id, command);
                }
            });
        }

        workers.insert(
            session_id.to_string(),
            WorkerEntry {
                workspace: workspace.to_path_buf(),
                control_tx,
            },
        );
        Ok(controls)
    }

    /// Remove a finished worker from the registry.
    pub fn finish(&self, session_id: &str) {
        self.workers
            .lock()
            .expect("worker registry lock")
            .remove(session_id);
    }

    pub fn is_running(&self, session_id: &str) -> bool {
        self.workers
            .lock()
            .expect("worker registry lock")
            .contains_key(session_id)
    }

    pub fn is_workspace_busy(&self, workspace: &Path) -> bool {
        self.workers
            .lock()
            .expect("worker registry lock")
            .values()
            .any(|entry| entry.workspace == workspace)
    }

    /// Enqueue a control command for a running session.
    pub async fn send(&self, session_id: &str, command: ControlCommand) -> CoreResult<()> {
        let tx = {
            let workers = self.workers.lock().expect("worker registry lock");
            workers
                .get(session_id)
                .map(|entry| entry.control_tx.clone())
                .ok_or_else(|| {
                    CoreError::InvalidState(format!(
                        "session {} has no running worker",
                        session_id
                    ))
                })?
        };
        tx.send(command).await.map_err(|_| {
            CoreError::InvalidState(format!("session {} worker is gone", session_id))
        })?;
        Ok(())
    }

    pub fn running_count(&self) -> usize {
        self.workers.lock().expect("worker registry lock").len()
    }
}

/// Sessions whose workers died without a terminal transition: running
/// status, no registered worker, stale heartbeat.
pub fn find_stale_sessions(sessions: &[Session], manager: &SessionManager) -> Vec<String> {
    sessions
        .iter()
        .filter(|s| s.is_stale(STALE_SECONDS) && !manager.is_running(&s.id))
        .map(|s| {
            warn!("Session {} has a stale heartbeat", s.id);
            s.id.clone()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionStatus;

    #[tokio::test]
    async fn register_enforces_one_session_per_workspace() {
        let manager = SessionManager::new();
        let ws = PathBuf::from("/tmp/ws-a");
        manager.register("s1", &ws).unwrap();
        assert!(manager.is_workspace_busy(&ws));

        let err = manager.register("s2", &ws).unwrap_err();
        assert!(matches!(err, CoreError::InvalidState(_)));

        // a different workspace is fine
        manager.register("s3", Path::new("/tmp/ws-b")).unwrap();
        assert_eq!(manager.running_count(), 2);

        manager.finish("s1");
        assert!(!manager.is_workspace_busy(&ws));
        manager.register("s2", &ws).unwrap();
    }

    #[tokio::test]
    async fn duplicate_session_id_rejected() {
        let manager = SessionManager::new();
        manager.register("s1", Path::new("/tmp/a")).unwrap();
        assert!(manager.register("s1", Path::new("/tmp/b")).is_err());
    }

    #[tokio::test]
    async fn control_commands_reach_flags() {
        let manager = SessionManager::new();
        let controls = manager.register("s1", Path::new("/tmp/ws")).unwrap();

        manager.send("s1", ControlCommand::Pause).await.unwrap();
        manager.send("s1", ControlCommand::Cancel).await.unwrap();
        // forwarder runs on the executor; give it a tick
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        assert!(controls.pause.load(Ordering::SeqCst));
        assert!(controls.cancel.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn send_to_unknown_session_errors() {
        let manager = SessionManager::new();
        assert!(manager.send("ghost", ControlCommand::Pause).await.is_err());
    }

    #[test]
    fn stale_detection() {
        let manager = SessionManager::new();
        let mut fresh = Session::new("r", "g", PathBuf::from("/tmp/a"), 8.0, 5.0);
        fresh.transition(SessionStatus::Running).unwrap();

        let mut stale = Session::new("r", "g", PathBuf::from("/tmp/b"), 8.0, 5.0);
        stale.transition(SessionStatus::Running).unwrap();
        stale.heartbeat_unix -= 600;

        let mut paused = Session::new("r", "g", PathBuf::from("/tmp/c"), 8.0, 5.0);
        paused.transition(SessionStatus::Running).unwrap();
        paused.transition(SessionStatus::Paused).unwrap();
        paused.heartbeat_unix -= 600;

        let stale_ids = find_stale_sessions(&[fresh, stale.clone(), paused], &manager);
        assert_eq!(stale_ids, vec![stale.id]);
    }
}
