pub mod executor;
pub mod goal;
pub mod graph;

// Execution Loop: drives the task graph in dependency order.
//
// Per task: mark running, execute, record the outcome, checkpoint on the
// cadence (or after a flagged medium-confidence commit), evaluate the five
// stop conditions, and feed the outcome back into the next task's context.
// Cancellation and drift are checked between tasks.

use crate::audit::{Actor, AuditLog};
use crate::checkpoint::CheckpointManager;
use crate::drift::{DriftMonitor, DriftSeverity};
use crate::engine::executor::TaskExecutor;
use crate::engine::graph::TaskStatus;
use crate::limits::WriteTracker;
use crate::prompts::PromptStore;
use crate::provider::LlmProvider;
use crate::roles::RoleProfile;
use crate::sandbox::Sandbox;
use crate::session::{ConfidenceBand, DecisionRecord, Session, SessionStatus, StopReason};
use crate::skills::Skill;
use crate::wisdom::WisdomStore;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

const ERROR_THRESHOLD: u32 = 5;
const COLLAPSE_THRESHOLD: u32 = 3;

/// How the loop ended. Stop-condition exits carry the reason that is also
/// recorded on the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopExit {
    Completed,
    Paused(StopReason),
    PausedOnDrift,
    PausedByOperator,
    Failed(StopReason),
    Cancelled,
}

pub struct LoopConfig {
    pub checkpoint_interval_tasks: usize,
    pub checkpoint_keep_last: usize,
    pub replan_interval_tasks: usize,
    pub max_llm_retries: u32,
    pub usd_per_1k_tokens: f64,
    /// Minimum time between workspace re-fingerprints. The first check of a
    /// run is always due.
    pub drift_poll_interval: Duration,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            checkpoint_interval_tasks: 3,
            checkpoint_keep_last: 5,
            replan_interval_tasks: goal::REPLAN_INTERVAL,
            max_llm_retries: 3,
            usd_per_1k_tokens: 0.01,
            drift_poll_interval: Duration::from_secs(60),
        }
    }
}

pub struct ExecutionLoop<'a> {
    pub session: &'a mut Session,
    pub role: &'a RoleProfile,
    pub provider: &'a dyn LlmProvider,
    pub prompts: &'a PromptStore,
    pub sandbox: &'a mut Sandbox,
    pub wisdom: &'a WisdomStore,
    pub resolved_skills: &'a [Skill],
    pub checkpoints: &'a CheckpointManager,
    pub drift: &'a DriftMonitor,
    pub audit: &'a AuditLog,
    pub tracker: &'a mut WriteTracker,
    pub decisions: &'a mut Vec<DecisionRecord>,
    pub cancel: Arc<AtomicBool>,
    pub pause: Arc<AtomicBool>,
    pub config: LoopConfig,
}

impl<'a> ExecutionLoop<'a> {
    /// Run until a stop condition, cancellation, or drift pause. The
    /// session must already be `running`.
    pub async fn run(&mut self) -> LoopExit {
        if self.session.status != SessionStatus::Running {
            return LoopExit::Failed(StopReason::ErrorThreshold);
        }
        let mut tasks_since_checkpoint = 0usize;
        let mut tasks_since_replan = 0usize;
        let mut last_drift_check: Option<Instant> = None;

        loop {
            self.session.heartbeat();

            if self.cancel.load(Ordering::SeqCst) {
                return self.exit_cancelled();
            }
            if self.pause.swap(false, Ordering::SeqCst) {
                let _ = self.session.transition(SessionStatus::Paused);
                self.audit_event("session_paused", Actor::Operator, serde_json::json!({}));
                return LoopExit::PausedByOperator;
            }
            if let Some(exit) = self.check_drift(&mut last_drift_check) {
                return exit;
            }
            if let Some(exit) = self.check_stop_conditions() {
                return exit;
            }

            let Some(task_id) = self.session.task_graph.next_ready().map(|t| t.id.clone()) else {
                // Nothing ready: either the goal is complete or failures
                // wedged the graph.
                if self.session.task_graph.all_done() {
                    return self.exit_completed();
                }
                return self.exit_failed(StopReason::ErrorThreshold, "task graph wedged by failures");
            };

            self.session.current_task_id = Some(task_id.clone());
            if let Some(task) = self.session.task_graph.get_mut(&task_id) {
                task.status = TaskStatus::Running;
            }

            let outcome = {
                let task = self
                    .session
                    .task_graph
                    .get(&task_id)
                    .expect("running task exists")
                    .clone();
                let recent = self.session.task_graph.recent_outcomes(10);
                let executor = TaskExecutor::new(
                    self.provider,
                    self.prompts,
                    self.sandbox,
                    self.wisdom,
                    self.resolved_skills,
                    self.role,
                    &self.session.goal,
                    self.config.max_llm_retries,
                );
                let started = Instant::now();
                let result = executor
                    .execute(&task, &recent, self.tracker, &mut self.session.cost)
                    .await;
                (result, started.elapsed().as_secs_f64())
            };

            let mut flagged_commit = false;
            match outcome {
                (Ok(outcome), duration) => {
                    let task = self
                        .session
                        .task_graph
                        .get_mut(&task_id)
                        .expect("running task exists");
                    task.confidence = Some(outcome.confidence);
                    task.duration_secs = Some(duration);
                    task.skill = outcome.skill_used.clone();
                    task.output_summary = Some(outcome.summary.clone());

                    if outcome.band == ConfidenceBand::PauseAndAsk {
                        // Withheld: nothing was committed. Counts toward
                        // confidence collapse.
                        task.status = TaskStatus::Skipped;
                        self.session.consecutive_low_confidence += 1;
                        self.record_task_decision(&task_id, &outcome, "withheld_low_confidence");
                        warn!(
                            "Task '{}' withheld at confidence {:.2} ({}/{})",
                            task_id,
                            outcome.confidence,
                            self.session.consecutive_low_confidence,
                            COLLAPSE_THRESHOLD
                        );
                    } else {
                        task.status = TaskStatus::Done;
                        task.needs_review = outcome.band == ConfidenceBand::ExecuteAndFlag;
                        self.session.consecutive_low_confidence = 0;
                        self.session.consecutive_errors = 0;
                        if outcome.band == ConfidenceBand::QueueApproval {
                            self.session.approval_queue.push(task_id.clone());
                        }
                        flagged_commit = outcome.band != ConfidenceBand::AutoExecute;
                        let event = if outcome.regression_rejected {
                            "regression_rejected"
                        } else {
                            "task_completed"
                        };
                        self.record_task_decision(&task_id, &outcome, event);
                        tasks_since_checkpoint += 1;
                        tasks_since_replan += 1;
                    }
                }
                (Err(e), duration) => {
                    let task = self
                        .session
                        .task_graph
                        .get_mut(&task_id)
                        .expect("running task exists");
                    task.status = TaskStatus::Failed;
                    task.duration_secs = Some(duration);
                    task.output_summary = Some(format!("failed: {}", e));
                    self.session.consecutive_errors += 1;
                    self.push_decision(DecisionRecord::now(
                        Some(&task_id),
                        "task_failed",
                        &e.to_string(),
                    ));
                    self.audit_event(
                        "task_failed",
                        Actor::Agent,
                        serde_json::json!({ "task": task_id, "kind": e.kind() }),
                    );
                    warn!(
                        "Task '{}' failed ({}/{}): {}",
                        task_id, self.session.consecutive_errors, ERROR_THRESHOLD, e
                    );
                }
            }
            self.session.current_task_id = None;

            // Checkpoint cadence, plus any flagged (non-auto) commit.
            if tasks_since_checkpoint >= self.config.checkpoint_interval_tasks
                || (flagged_commit && tasks_since_checkpoint > 0)
            {
                match self
                    .checkpoints
                    .save(self.session, self.sandbox, false)
                {
                    Ok(id) => {
                        self.session.checkpoints.push(id);
                        let _ = self.checkpoints.prune(self.config.checkpoint_keep_last);
                        tasks_since_checkpoint = 0;
                    }
                    Err(e) => {
                        // Keep the last good checkpoint and hand control
                        // back to the operator.
                        warn!("Checkpoint write failed: {}", e);
                        self.push_decision(DecisionRecord::now(
                            None,
                            "checkpoint_failed",
                            &e.to_string(),
                        ));
                        return self.exit_paused(StopReason::ErrorThreshold, "checkpoint write failed");
                    }
                }
            }

            // Re-planning opportunity on its own cadence.
            if self.config.replan_interval_tasks > 0
                && tasks_since_replan >= self.config.replan_interval_tasks
                && !self.session.task_graph.all_done()
            {
                tasks_since_replan = 0;
                self.try_replan().await;
            }
        }
    }

    async fn try_replan(&mut self) {
        let engine = goal::GoalEngine::new(
            self.provider,
            self.prompts,
            false, // the stored goal is already sanitized
            self.config.max_llm_retries,
        );
        let memory = String::new();
        match engine
            .replan(
                &self.session.goal,
                self.role,
                &self.session.task_graph,
                &memory,
                &mut self.session.cost,
            )
            .await
        {
            Ok(graph) => {
                info!("Re-planned: {} task(s) in revised graph", graph.len());
                self.push_decision(DecisionRecord::now(
                    None,
                    "replanned",
                    &format!("revised graph has {} tasks", graph.len()),
                ));
                self.session.task_graph = graph;
            }
            Err(e) => {
                // Re-planning is best-effort; the existing graph stands.
                warn!("Re-planning failed, keeping current graph: {}", e);
                self.push_decision(DecisionRecord::now(None, "replan_failed", &e.to_string()));
            }
        }
    }

    // ── Stop conditions ────────────────────────────────────────────────

    fn check_stop_conditions(&mut self) -> Option<LoopExit> {
        // 1. Goal complete.
        if !self.session.task_graph.is_empty() && self.session.task_graph.all_done() {
            return Some(self.exit_completed());
        }
        // 2. Time limit.
        if self.session.elapsed_hours() >= self.session.max_session_hours {
            return Some(self.exit_paused(StopReason::TimeLimit, "session time ceiling reached"));
        }
        // 3. Cost limit.
        let spent = self.session.cost.estimated_usd(self.config.usd_per_1k_tokens);
        if spent >= self.session.max_cost_per_session {
            return Some(self.exit_paused(StopReason::CostLimit, "session cost ceiling reached"));
        }
        // 4. Confidence collapse.
        if self.session.consecutive_low_confidence >= COLLAPSE_THRESHOLD {
            return Some(self.exit_paused(
                StopReason::ConfidenceCollapse,
                "three consecutive low-confidence tasks",
            ));
        }
        // 5. Error threshold.
        if self.session.consecutive_errors >= ERROR_THRESHOLD {
            return Some(self.exit_failed(StopReason::ErrorThreshold, "five consecutive task failures"));
        }
        None
    }

    /// Re-fingerprint the workspace when the poll interval has elapsed.
    fn check_drift(&mut self, last_check: &mut Option<Instant>) -> Option<LoopExit> {
        let due = last_check.map_or(true, |t| t.elapsed() >= self.config.drift_poll_interval);
        if !due {
            return None;
        }
        *last_check = Some(Instant::now());

        let report = match self.drift.check() {
            Ok(r) => r,
            Err(e) => {
                warn!("Drift check failed: {}", e);
                return None;
            }
        };
        match report.severity() {
            Some(DriftSeverity::High) => {
                self.push_decision(DecisionRecord::now(
                    None,
                    "drift_detected",
                    &format!(
                        "high drift: {} changed path(s) in workspace",
                        report.change_count()
                    ),
                ));
                self.audit_event(
                    "drift_pause",
                    Actor::Agent,
                    serde_json::json!({ "changes": report.change_count() }),
                );
                let _ = self.session.transition(SessionStatus::Paused);
                Some(LoopExit::PausedOnDrift)
            }
            Some(DriftSeverity::Medium) => {
                self.push_decision(DecisionRecord::now(
                    None,
                    "drift_warning",
                    &format!("workspace drift: {} changed path(s)", report.change_count()),
                ));
                None
            }
            _ => None,
        }
    }

    // ── Exits ──────────────────────────────────────────────────────────

    fn exit_completed(&mut self) -> LoopExit {
        self.session.stop_reason = Some(StopReason::GoalComplete);
        let _ = self.session.transition(SessionStatus::Completed);
        self.audit_event(
            "session_completed",
            Actor::Agent,
            serde_json::json!({ "tasks": self.session.task_graph.len() }),
        );
        LoopExit::Completed
    }

    fn exit_paused(&mut self, reason: StopReason, note: &str) -> LoopExit {
        self.session.stop_reason = Some(reason);
        let _ = self.session.transition(SessionStatus::Paused);
        self.push_decision(DecisionRecord::now(None, "stop_condition", note));
        self.audit_event(
            "session_paused",
            Actor::Agent,
            serde_json::json!({ "reason": reason, "note": note }),
        );
        LoopExit::Paused(reason)
    }

    fn exit_failed(&mut self, reason: StopReason, note: &str) -> LoopExit {
        self.session.stop_reason = Some(reason);
        let _ = self.session.transition(SessionStatus::Failed);
        self.push_decision(DecisionRecord::now(None, "stop_condition", note));
        self.audit_event(
            "session_failed",
            Actor::Agent,
            serde_json::json!({ "reason": reason, "note": note }),
        );
        LoopExit::Failed(reason)
    }

    fn exit_cancelled(&mut self) -> LoopExit {
        let _ = self.session.transition(SessionStatus::Cancelled);
        self.audit_event("session_cancelled", Actor::Operator, serde_json::json!({}));
        LoopExit::Cancelled
    }

    // ── Recording ──────────────────────────────────────────────────────

    fn record_task_decision(
        &mut self,
        task_id: &str,
        outcome: &executor::ExecOutcome,
        event: &str,
    ) {
        let mut record = DecisionRecord::now(Some(task_id), event, &outcome.summary);
        record.confidence = Some(outcome.confidence);
        record.band = Some(outcome.band);
        record.skill = outcome.skill_used.clone();
        self.push_decision(record);
        self.audit_event(
            event,
            Actor::Agent,
            serde_json::json!({
                "task": task_id,
                "confidence": outcome.confidence,
                "committed": outcome.committed,
                "target": outcome.target,
            }),
        );
    }

    fn push_decision(&mut self, record: DecisionRecord) {
        self.decisions.push(record);
    }

    fn audit_event(&self, event_type: &str, actor: Actor, details: serde_json::Value) {
        if let Err(e) = self
            .audit
            .append(&self.session.id, event_type, actor, details)
        {
            warn!("Audit append failed: {}", e);
        }
    }
}

pub use executor::ExecOutcome;
pub use graph::{ActionType, Task, TaskGraph};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ScriptedProvider;

    struct Fixture {
        _tmp: tempfile::TempDir,
        session: Session,
        role: RoleProfile,
        prompts: PromptStore,
        sandbox: Sandbox,
        wisdom: WisdomStore,
        checkpoints: CheckpointManager,
        drift: DriftMonitor,
        audit: AuditLog,
        tracker: WriteTracker,
        decisions: Vec<DecisionRecord>,
    }

    fn role() -> RoleProfile {
        RoleProfile::from_yaml(
            r#"
name: engineer
description: builds things
auth_method: pin
competencies: [coding]
authority_autonomous: [read_file, write_file, edit_file, analyze, validate, generic]
"#,
        )
        .unwrap()
    }

    fn fixture(tasks: Vec<Task>) -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let ws = tmp.path().join("ws");
        std::fs::create_dir_all(&ws).unwrap();
        std::fs::write(ws.join("seed.txt"), "seed\n").unwrap();

        let sandbox = Sandbox::create(&tmp.path().join("sbx"), &ws).unwrap();
        let drift = DriftMonitor::baseline(&ws, 1024 * 1024).unwrap();
        let audit = AuditLog::open(tmp.path().join("audit.jsonl"), b"k".to_vec()).unwrap();
        let mut session = Session::new("engineer", "test goal", ws, 8.0, 5.0);
        session.task_graph = TaskGraph::new(tasks).unwrap();
        session.transition(SessionStatus::Running).unwrap();

        Fixture {
            session,
            role: role(),
            prompts: PromptStore::load(None),
            sandbox,
            wisdom: WisdomStore::new(tmp.path().join("wisdom.jsonl")),
            checkpoints: CheckpointManager::new(tmp.path().join("checkpoints")),
            drift,
            audit,
            tracker: WriteTracker::new(),
            decisions: Vec::new(),
            _tmp: tmp,
        }
    }

    async fn run(f: &mut Fixture, provider: &ScriptedProvider, config: LoopConfig) -> LoopExit {
        let mut exec_loop = ExecutionLoop {
            session: &mut f.session,
            role: &f.role,
            provider,
            prompts: &f.prompts,
            sandbox: &mut f.sandbox,
            wisdom: &f.wisdom,
            resolved_skills: &[],
            checkpoints: &f.checkpoints,
            drift: &f.drift,
            audit: &f.audit,
            tracker: &mut f.tracker,
            decisions: &mut f.decisions,
            cancel: Arc::new(AtomicBool::new(false)),
            pause: Arc::new(AtomicBool::new(false)),
            config,
        };
        exec_loop.run().await
    }

    fn write_task(id: &str, file: &str) -> Task {
        let mut t = Task::new(
            id,
            &format!("write {file}"),
            &format!("create {file} with content"),
            ActionType::WriteFile,
        );
        t.target = Some(file.to_string());
        t
    }

    fn good_response(content: &str) -> String {
        serde_json::json!({"content": content, "summary": "done", "confidence": 0.95}).to_string()
    }

    fn low_response() -> String {
        serde_json::json!({"content": "meh", "summary": "unsure", "confidence": 0.2}).to_string()
    }

    #[tokio::test]
    async fn completes_when_all_tasks_done() {
        let r1 = good_response("one\n");
        let r2 = good_response("two\n");
        let provider = ScriptedProvider::new(vec![r1.as_str(), r2.as_str()]);
        let mut f = fixture(vec![write_task("t1", "a.txt"), {
            let mut t = write_task("t2", "b.txt");
            t.depends_on = vec!["t1".to_string()];
            t
        }]);

        let exit = run(&mut f, &provider, LoopConfig::default()).await;
        assert_eq!(exit, LoopExit::Completed);
        assert_eq!(f.session.status, SessionStatus::Completed);
        assert_eq!(f.session.stop_reason, Some(StopReason::GoalComplete));
        assert!(f.sandbox.exists(std::path::Path::new("a.txt")));
        assert!(f.sandbox.exists(std::path::Path::new("b.txt")));
        // inter-task context: second call saw the first task's summary
        let second_prompt = provider.prompt_at(1).unwrap();
        assert!(second_prompt.contains("write a.txt"));
    }

    #[tokio::test]
    async fn confidence_collapse_pauses_after_three() {
        let (l1, l2, l3) = (low_response(), low_response(), low_response());
        let provider = ScriptedProvider::new(vec![l1.as_str(), l2.as_str(), l3.as_str()]);
        let mut f = fixture(vec![
            write_task("t1", "a.txt"),
            write_task("t2", "b.txt"),
            write_task("t3", "c.txt"),
            write_task("t4", "d.txt"),
        ]);

        let exit = run(&mut f, &provider, LoopConfig::default()).await;
        assert_eq!(exit, LoopExit::Paused(StopReason::ConfidenceCollapse));
        assert_eq!(f.session.status, SessionStatus::Paused);
        // nothing was committed
        assert!(!f.sandbox.exists(std::path::Path::new("a.txt")));
        assert_eq!(provider.call_count(), 3);
        assert!(f
            .decisions
            .iter()
            .any(|d| d.event == "stop_condition" && d.note.contains("low-confidence")));
    }

    #[tokio::test]
    async fn error_threshold_fails_session() {
        // Scripted provider errors once exhausted; five tasks all fail.
        let provider = ScriptedProvider::new(vec![]);
        let mut f = fixture((1..=6).map(|i| write_task(&format!("t{i}"), &format!("f{i}.txt"))).collect());

        let exit = run(&mut f, &provider, LoopConfig::default()).await;
        assert_eq!(exit, LoopExit::Failed(StopReason::ErrorThreshold));
        assert_eq!(f.session.status, SessionStatus::Failed);
        assert_eq!(f.session.consecutive_errors, 5);
    }

    #[tokio::test]
    async fn cost_limit_pauses() {
        let r1 = good_response("one\n");
        let provider = ScriptedProvider::new(vec![r1.as_str()]);
        let mut f = fixture(vec![write_task("t1", "a.txt"), write_task("t2", "b.txt")]);
        f.session.max_cost_per_session = 0.000001;

        // First stop-condition evaluation happens before any task: cost is
        // zero, so one task runs; its recorded usage then trips the limit.
        let exit = run(&mut f, &provider, LoopConfig::default()).await;
        assert_eq!(exit, LoopExit::Paused(StopReason::CostLimit));
    }

    #[tokio::test]
    async fn time_limit_pauses_immediately_when_exhausted() {
        let provider = ScriptedProvider::new(vec![]);
        let mut f = fixture(vec![write_task("t1", "a.txt")]);
        f.session.started_at_unix -= 9 * 3600;

        let exit = run(&mut f, &provider, LoopConfig::default()).await;
        assert_eq!(exit, LoopExit::Paused(StopReason::TimeLimit));
        assert_eq!(provider.call_count(), 0);
    }

    #[tokio::test]
    async fn cancellation_checked_between_tasks() {
        let provider = ScriptedProvider::new(vec![]);
        let mut f = fixture(vec![write_task("t1", "a.txt")]);
        let cancel = Arc::new(AtomicBool::new(true));
        let mut exec_loop = ExecutionLoop {
            session: &mut f.session,
            role: &f.role,
            provider: &provider,
            prompts: &f.prompts,
            sandbox: &mut f.sandbox,
            wisdom: &f.wisdom,
            resolved_skills: &[],
            checkpoints: &f.checkpoints,
            drift: &f.drift,
            audit: &f.audit,
            tracker: &mut f.tracker,
            decisions: &mut f.decisions,
            cancel,
            pause: Arc::new(AtomicBool::new(false)),
            config: LoopConfig::default(),
        };
        let exit = exec_loop.run().await;
        assert_eq!(exit, LoopExit::Cancelled);
        assert_eq!(f.session.status, SessionStatus::Cancelled);
        assert_eq!(provider.call_count(), 0);
    }

    #[tokio::test]
    async fn checkpoints_saved_on_cadence() {
        let responses: Vec<String> = (0..4).map(|i| good_response(&format!("c{i}\n"))).collect();
        let refs: Vec<&str> = responses.iter().map(String::as_str).collect();
        let provider = ScriptedProvider::new(refs);
        let mut f = fixture((1..=4).map(|i| write_task(&format!("t{i}"), &format!("f{i}.txt"))).collect());

        let config = LoopConfig {
            checkpoint_interval_tasks: 2,
            ..LoopConfig::default()
        };
        let exit = run(&mut f, &provider, config).await;
        assert_eq!(exit, LoopExit::Completed);
        assert_eq!(f.session.checkpoints.len(), 2);
        assert_eq!(f.checkpoints.list().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn high_drift_pauses_session() {
        let provider = ScriptedProvider::new(vec![]);
        let mut f = fixture(vec![write_task("t1", "a.txt")]);
        // six new files in the real workspace → HIGH drift
        for i in 0..6 {
            std::fs::write(f.session.workspace.join(format!("ext{i}.txt")), "x").unwrap();
        }

        let exit = run(&mut f, &provider, LoopConfig::default()).await;
        assert_eq!(exit, LoopExit::PausedOnDrift);
        assert_eq!(f.session.status, SessionStatus::Paused);
        assert!(f.decisions.iter().any(|d| d.event == "drift_detected"));
    }

    #[tokio::test]
    async fn drift_checks_follow_poll_cadence() {
        let provider = ScriptedProvider::new(vec![]);
        let mut f = fixture(vec![write_task("t1", "a.txt")]);
        // remove a baseline file → HIGH drift from the very first poll
        std::fs::remove_file(f.session.workspace.join("seed.txt")).unwrap();

        let mut exec_loop = ExecutionLoop {
            session: &mut f.session,
            role: &f.role,
            provider: &provider,
            prompts: &f.prompts,
            sandbox: &mut f.sandbox,
            wisdom: &f.wisdom,
            resolved_skills: &[],
            checkpoints: &f.checkpoints,
            drift: &f.drift,
            audit: &f.audit,
            tracker: &mut f.tracker,
            decisions: &mut f.decisions,
            cancel: Arc::new(AtomicBool::new(false)),
            pause: Arc::new(AtomicBool::new(false)),
            config: LoopConfig {
                drift_poll_interval: Duration::from_secs(3600),
                ..LoopConfig::default()
            },
        };

        // the first poll is always due and sees the drift
        let mut last_check = None;
        assert!(exec_loop.check_drift(&mut last_check).is_some());
        // within the interval the workspace is not re-fingerprinted
        assert!(exec_loop.check_drift(&mut last_check).is_none());

        // a zero interval re-fingerprints every poll
        exec_loop.config.drift_poll_interval = Duration::ZERO;
        assert!(exec_loop.check_drift(&mut last_check).is_some());
    }

    #[tokio::test]
    async fn approval_band_queues_task() {
        let body = serde_json::json!({"content": "ok\n", "summary": "s", "confidence": 0.6}).to_string();
        let provider = ScriptedProvider::new(vec![body.as_str()]);
        let mut f = fixture(vec![write_task("t1", "a.txt")]);

        let exit = run(&mut f, &provider, LoopConfig::default()).await;
        assert_eq!(exit, LoopExit::Completed);
        assert_eq!(f.session.approval_queue, vec!["t1".to_string()]);
        // flagged commit forced an extra checkpoint
        assert!(!f.session.checkpoints.is_empty());
    }
}
