// Session: one autonomous execution of a goal under a role.
//
// Six statuses with guarded transitions, a heartbeat for stale-worker
// recovery, cost/time tracking against role ceilings, and a serializable
// form for checkpoints. Exactly one session per workspace may be running.

use crate::engine::graph::{TaskGraph, TaskId};
use crate::errors::{CoreError, CoreResult};
use crate::provider::CostTracker;
use crate::roles::ConfidenceThresholds;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Created,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Failed | SessionStatus::Cancelled
        )
    }
}

/// Why the loop stopped. GoalComplete completes the session; time, cost and
/// confidence collapse pause it; the error threshold fails it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    GoalComplete,
    TimeLimit,
    CostLimit,
    ConfidenceCollapse,
    ErrorThreshold,
}

/// Which band a task's confidence fell into against the role thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceBand {
    AutoExecute,
    ExecuteAndFlag,
    QueueApproval,
    PauseAndAsk,
}

impl ConfidenceBand {
    pub fn classify(confidence: f64, thresholds: &ConfidenceThresholds) -> Self {
        if confidence >= thresholds.auto_execute {
            ConfidenceBand::AutoExecute
        } else if confidence >= thresholds.execute_and_flag {
            ConfidenceBand::ExecuteAndFlag
        } else if confidence >= thresholds.pause_and_ask {
            ConfidenceBand::QueueApproval
        } else {
            ConfidenceBand::PauseAndAsk
        }
    }
}

/// One decision-log record; persisted as JSONL under the session directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub timestamp: String,
    pub task_id: Option<TaskId>,
    pub event: String,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub band: Option<ConfidenceBand>,
    #[serde(default)]
    pub skill: Option<String>,
    pub note: String,
}

impl DecisionRecord {
    pub fn now(task_id: Option<&str>, event: &str, note: &str) -> Self {
        Self {
            timestamp: chrono::Utc::now().to_rfc3339(),
            task_id: task_id.map(String::from),
            event: event.to_string(),
            confidence: None,
            band: None,
            skill: None,
            note: note.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub role_name: String,
    /// Goal text after Prompt Guard sanitization.
    pub goal: String,
    pub workspace: PathBuf,
    pub status: SessionStatus,
    pub task_graph: TaskGraph,
    pub current_task_id: Option<TaskId>,
    /// Checkpoint ids, oldest first.
    pub checkpoints: Vec<String>,
    pub cost: CostTracker,
    pub started_at_unix: u64,
    pub heartbeat_unix: u64,
    pub max_session_hours: f64,
    pub max_cost_per_session: f64,
    pub consecutive_errors: u32,
    pub consecutive_low_confidence: u32,
    pub sandbox_id: Option<String>,
    pub sandbox_branch: Option<String>,
    pub stop_reason: Option<StopReason>,
    /// Prompt Guard pattern names stripped from the original goal.
    pub stripped_patterns: Vec<String>,
    /// Tasks committed in the queue-approval band, awaiting operator review.
    pub approval_queue: Vec<TaskId>,
    /// Tasks the operator has explicitly approved; consulted by the gate's
    /// role-scope check.
    #[serde(default)]
    pub approved_tasks: Vec<TaskId>,
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl Session {
    pub fn new(
        role_name: &str,
        goal: &str,
        workspace: PathBuf,
        max_session_hours: f64,
        max_cost_per_session: f64,
    ) -> Self {
        let now = unix_now();
        Self {
            id: format!("sess-{}", &uuid::Uuid::new_v4().to_string()[..12]),
            role_name: role_name.to_string(),
            goal: goal.to_string(),
            workspace,
            status: SessionStatus::Created,
            task_graph: TaskGraph::default(),
            current_task_id: None,
            checkpoints: Vec::new(),
            cost: CostTracker::default(),
            started_at_unix: now,
            heartbeat_unix: now,
            max_session_hours,
            max_cost_per_session,
            consecutive_errors: 0,
            consecutive_low_confidence: 0,
            sandbox_id: None,
            sandbox_branch: None,
            stop_reason: None,
            stripped_patterns: Vec::new(),
            approval_queue: Vec::new(),
            approved_tasks: Vec::new(),
        }
    }

    /// Guarded status transition; anything off the diagram is refused.
    pub fn transition(&mut self, to: SessionStatus) -> CoreResult<()> {
        use SessionStatus::*;
        let valid = matches!(
            (self.status, to),
            (Created, Running)
                | (Running, Paused)
                | (Paused, Running)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Paused, Cancelled)
        );
        if !valid {
            return Err(CoreError::InvalidState(format!(
                "session {}: invalid transition {:?} -> {:?}",
                self.id, self.status, to
            )));
        }
        self.status = to;
        if !matches!(self.status, Running | Paused) {
            self.current_task_id = None;
        }
        Ok(())
    }

    pub fn heartbeat(&mut self) {
        self.heartbeat_unix = unix_now();
    }

    pub fn is_stale(&self, stale_seconds: u64) -> bool {
        self.status == SessionStatus::Running
            && unix_now().saturating_sub(self.heartbeat_unix) > stale_seconds
    }

    pub fn elapsed_hours(&self) -> f64 {
        unix_now().saturating_sub(self.started_at_unix) as f64 / 3600.0
    }

    pub fn to_yaml(&self) -> CoreResult<String> {
        serde_yml::to_string(self)
            .map_err(|e| CoreError::InvalidState(format!("session serialize error: {}", e)))
    }

    pub fn from_yaml(yaml: &str) -> CoreResult<Self> {
        serde_yml::from_str(yaml)
            .map_err(|e| CoreError::InvalidState(format!("session parse error: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        Session::new("tester", "do things", PathBuf::from("/tmp/ws"), 8.0, 5.0)
    }

    #[test]
    fn lifecycle_happy_path() {
        let mut s = session();
        assert_eq!(s.status, SessionStatus::Created);
        s.transition(SessionStatus::Running).unwrap();
        s.transition(SessionStatus::Paused).unwrap();
        s.transition(SessionStatus::Running).unwrap();
        s.transition(SessionStatus::Completed).unwrap();
        assert!(s.status.is_terminal());
    }

    #[test]
    fn invalid_transitions_refused() {
        let mut s = session();
        assert!(s.transition(SessionStatus::Completed).is_err());
        assert!(s.transition(SessionStatus::Paused).is_err());

        s.transition(SessionStatus::Running).unwrap();
        s.transition(SessionStatus::Cancelled).unwrap();
        // terminal states are sticky
        assert!(s.transition(SessionStatus::Running).is_err());
        assert!(s.transition(SessionStatus::Paused).is_err());
    }

    #[test]
    fn paused_can_cancel() {
        let mut s = session();
        s.transition(SessionStatus::Running).unwrap();
        s.transition(SessionStatus::Paused).unwrap();
        s.transition(SessionStatus::Cancelled).unwrap();
        assert_eq!(s.status, SessionStatus::Cancelled);
    }

    #[test]
    fn current_task_cleared_on_terminal() {
        let mut s = session();
        s.transition(SessionStatus::Running).unwrap();
        s.current_task_id = Some("t1".to_string());
        s.transition(SessionStatus::Completed).unwrap();
        assert!(s.current_task_id.is_none());
    }

    #[test]
    fn confidence_bands() {
        let t = ConfidenceThresholds::default();
        assert_eq!(ConfidenceBand::classify(0.95, &t), ConfidenceBand::AutoExecute);
        assert_eq!(ConfidenceBand::classify(0.90, &t), ConfidenceBand::AutoExecute);
        assert_eq!(ConfidenceBand::classify(0.80, &t), ConfidenceBand::ExecuteAndFlag);
        assert_eq!(ConfidenceBand::classify(0.60, &t), ConfidenceBand::QueueApproval);
        assert_eq!(ConfidenceBand::classify(0.40, &t), ConfidenceBand::PauseAndAsk);
    }

    #[test]
    fn yaml_roundtrip() {
        let mut s = session();
        s.transition(SessionStatus::Running).unwrap();
        s.stripped_patterns.push("ignore_instructions".to_string());
        let yaml = s.to_yaml().unwrap();
        let restored = Session::from_yaml(&yaml).unwrap();
        assert_eq!(restored.id, s.id);
        assert_eq!(restored.status, SessionStatus::Running);
        assert_eq!(restored.stripped_patterns, s.stripped_patterns);
    }

    #[test]
    fn staleness() {
        let mut s = session();
        s.transition(SessionStatus::Running).unwrap();
        s.heartbeat_unix = unix_now() - 300;
        assert!(s.is_stale(120));
        s.heartbeat();
        assert!(!s.is_stale(120));
        // non-running sessions are never stale
        s.transition(SessionStatus::Paused).unwrap();
        s.heartbeat_unix = unix_now() - 300;
        assert!(!s.is_stale(120));
    }
}
