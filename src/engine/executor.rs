// Task Executor: runs one task against the sandbox through the LLM.
//
// Context assembly (inventory + recent outcomes + selected skill +
// institutional wisdom), four-tier target resolution, read-before-write
// merge discipline, the regression guard, and the confidence gate all live
// here. Commits never leave the sandbox; promotion is a separate, gated act.

use crate::engine::goal::extract_json_object;
use crate::engine::graph::{ActionType, Task};
use crate::errors::{CoreError, CoreResult};
use crate::limits::WriteTracker;
use crate::prompts::{self, PromptStore};
use crate::provider::{complete_with_retry, CostTracker, LlmProvider};
use crate::roles::RoleProfile;
use crate::sandbox::Sandbox;
use crate::session::ConfidenceBand;
use crate::skills::Skill;
use crate::wisdom::WisdomStore;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use tracing::{info, warn};

/// How many prior task outcomes feed the context block.
const CONTEXT_OUTCOMES: usize = 10;
/// Similarity threshold for wisdom retrieval.
const WISDOM_THRESHOLD: f64 = 0.3;
const WISDOM_LIMIT: usize = 3;

#[derive(Debug, Deserialize)]
struct TaskResponse {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    result: Option<String>,
    #[serde(default)]
    summary: Option<String>,
    #[serde(default)]
    confidence: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct ExecOutcome {
    /// False when the confidence gate or regression guard withheld the
    /// commit.
    pub committed: bool,
    pub confidence: f64,
    pub band: ConfidenceBand,
    pub summary: String,
    pub target: Option<String>,
    pub regression_rejected: bool,
    pub skill_used: Option<String>,
}

pub struct TaskExecutor<'a> {
    provider: &'a dyn LlmProvider,
    prompts: &'a PromptStore,
    sandbox: &'a Sandbox,
    wisdom: &'a WisdomStore,
    resolved_skills: &'a [Skill],
    role: &'a RoleProfile,
    goal: &'a str,
    max_retries: u32,
}

impl<'a> TaskExecutor<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        provider: &'a dyn LlmProvider,
        prompts: &'a PromptStore,
        sandbox: &'a Sandbox,
        wisdom: &'a WisdomStore,
        resolved_skills: &'a [Skill],
        role: &'a RoleProfile,
        goal: &'a str,
        max_retries: u32,
    ) -> Self {
        Self {
            provider,
            prompts,
            sandbox,
            wisdom,
            resolved_skills,
            role,
            goal,
            max_retries,
        }
    }

    /// Execute one task. Returns the outcome; persistence happened iff
    /// `committed` and the action writes.
    pub async fn execute(
        &self,
        task: &Task,
        recent_outcomes: &[(&str, &str)],
        tracker: &mut WriteTracker,
        cost: &mut CostTracker,
    ) -> CoreResult<ExecOutcome> {
        let skill = crate::skills::select_for_task(self.resolved_skills, &task.text());
        let context = self.build_context(recent_outcomes, skill);

        match task.action {
            ActionType::ReadFile | ActionType::Analyze | ActionType::Validate => {
                self.run_analysis(task, &context, skill, cost).await
            }
            ActionType::WriteFile | ActionType::EditFile => {
                self.run_file_task(task, &context, skill, tracker, cost).await
            }
            ActionType::Generic => {
                // Generic behaves like write_file when a target is
                // inferable, otherwise like analyze.
                if self.resolve_target(task).is_some() {
                    self.run_file_task(task, &context, skill, tracker, cost).await
                } else {
                    self.run_analysis(task, &context, skill, cost).await
                }
            }
        }
    }

    // ── Context assembly ───────────────────────────────────────────────

    fn build_context(&self, recent_outcomes: &[(&str, &str)], skill: Option<&Skill>) -> String {
        let mut sections: Vec<String> = Vec::new();

        // 1. Sandbox inventory.
        match self.sandbox.list() {
            Ok(inventory) if !inventory.is_empty() => {
                let listing: Vec<String> = inventory
                    .iter()
                    .map(|e| format!("  {} ({} bytes)", e.path, e.size))
                    .collect();
                sections.push(format!("Files in the workspace:\n{}", listing.join("\n")));
            }
            _ => sections.push("The workspace is currently empty.".to_string()),
        }

        // 2. Prior task outcomes.
        if !recent_outcomes.is_empty() {
            let lines: Vec<String> = recent_outcomes
                .iter()
                .rev()
                .take(CONTEXT_OUTCOMES)
                .rev()
                .map(|(title, summary)| format!("  - {}: {}", title, summary))
                .collect();
            sections.push(format!("Completed so far:\n{}", lines.join("\n")));
        }

        // 3. Selected skill instructions.
        if let Some(skill) = skill {
            sections.push(format!(
                "Apply the skill \"{}\":\n{}",
                skill.name, skill.body
            ));
        }

        // 4. Institutional wisdom.
        let query = match skill {
            Some(s) => format!("skill:{} {}", s.name, self.goal),
            None => self.goal.to_string(),
        };
        if let Ok(passages) = self.wisdom.retrieve(&query, WISDOM_THRESHOLD, WISDOM_LIMIT) {
            if !passages.is_empty() {
                let lines: Vec<String> =
                    passages.iter().map(|p| format!("  - {}", p.text)).collect();
                sections.push(format!("Notes from earlier sessions:\n{}", lines.join("\n")));
            }
        }

        sections.join("\n\n")
    }

    // ── Analysis tasks ─────────────────────────────────────────────────

    async fn run_analysis(
        &self,
        task: &Task,
        context: &str,
        skill: Option<&Skill>,
        cost: &mut CostTracker,
    ) -> CoreResult<ExecOutcome> {
        let prompt = self
            .prompts
            .render(prompts::ANALYZE, &[("task", task.text().as_str()), ("context", context)])
            .unwrap_or_default();
        let response = self.call(&prompt, cost).await?;
        let confidence = response.confidence();
        let band = ConfidenceBand::classify(confidence, &self.role.confidence_thresholds);
        let committed = band != ConfidenceBand::PauseAndAsk;
        Ok(ExecOutcome {
            committed,
            confidence,
            band,
            summary: response.summary_or(&response.text()),
            target: None,
            regression_rejected: false,
            skill_used: skill.map(|s| s.name.clone()),
        })
    }

    // ── File tasks ─────────────────────────────────────────────────────

    async fn run_file_task(
        &self,
        task: &Task,
        context: &str,
        skill: Option<&Skill>,
        tracker: &mut WriteTracker,
        cost: &mut CostTracker,
    ) -> CoreResult<ExecOutcome> {
        let target = match self.resolve_target(task) {
            Some(t) => t,
            None => fallback_target(task),
        };
        let target_path = Path::new(&target);
        let existing = if self.sandbox.exists(target_path) {
            Some(String::from_utf8_lossy(&self.sandbox.read(target_path)?).to_string())
        } else {
            None
        };

        if task.action == ActionType::EditFile && existing.is_none() {
            return Err(CoreError::InvalidState(format!(
                "task '{}' edits '{}' but it does not exist in the sandbox",
                task.id, target
            )));
        }

        // Read-before-write: a pre-existing target always goes through the
        // merge prompt carrying its full current content.
        let prompt = match &existing {
            Some(current) => self
                .prompts
                .render(
                    prompts::MERGE_FILE,
                    &[
                        ("task", task.text().as_str()),
                        ("target", target.as_str()),
                        ("current_content", current.as_str()),
                        ("context", context),
                    ],
                )
                .unwrap_or_default(),
            None => self
                .prompts
                .render(
                    prompts::GENERATE_FILE,
                    &[
                        ("task", task.text().as_str()),
                        ("target", target.as_str()),
                        ("context", context),
                    ],
                )
                .unwrap_or_default(),
        };

        let response = self.call(&prompt, cost).await?;
        let content = response.content.clone().unwrap_or_default();
        if content.is_empty() {
            return Err(CoreError::LlmError {
                retryable: false,
                message: format!("task '{}' produced no file content", task.id),
            });
        }
        let confidence = response.confidence();
        let band = ConfidenceBand::classify(confidence, &self.role.confidence_thresholds);

        // Regression guard: a merge that halves a non-trivial file is
        // rejected and the previous content retained.
        if let Some(old) = &existing {
            let old_lines = old.lines().count();
            let new_lines = content.lines().count();
            if old_lines > 20 && (new_lines as f64) < (old_lines as f64) * 0.5 {
                warn!(
                    "Regression guard: task '{}' shrank '{}' from {} to {} lines; keeping previous content",
                    task.id, target, old_lines, new_lines
                );
                return Ok(ExecOutcome {
                    committed: false,
                    confidence,
                    band,
                    summary: format!(
                        "regression guard rejected update to {} ({} -> {} lines); previous content retained",
                        target, old_lines, new_lines
                    ),
                    target: Some(target),
                    regression_rejected: true,
                    skill_used: skill.map(|s| s.name.clone()),
                });
            }
        }

        // Confidence gate: below pause_and_ask nothing is committed.
        if band == ConfidenceBand::PauseAndAsk {
            return Ok(ExecOutcome {
                committed: false,
                confidence,
                band,
                summary: format!(
                    "confidence {:.2} below pause threshold; change to {} withheld",
                    confidence, target
                ),
                target: Some(target),
                regression_rejected: false,
                skill_used: skill.map(|s| s.name.clone()),
            });
        }

        // Write ceilings are enforced before the write lands.
        if let Some(violation) =
            tracker.check(&target, content.len() as u64, &self.role.resource_limits.write_limits)
        {
            return Err(CoreError::InvalidState(format!(
                "write limit: {}",
                violation
            )));
        }
        self.sandbox.write(target_path, content.as_bytes())?;
        tracker.record(&target, content.len() as u64);
        info!("Task '{}' wrote {} ({} bytes)", task.id, target, content.len());

        Ok(ExecOutcome {
            committed: true,
            confidence,
            band,
            summary: response.summary_or(&format!("updated {}", target)),
            target: Some(target),
            regression_rejected: false,
            skill_used: skill.map(|s| s.name.clone()),
        })
    }

    async fn call(&self, prompt: &str, cost: &mut CostTracker) -> CoreResult<TaskResponse> {
        let system = self
            .prompts
            .render(
                prompts::ROLE_SYSTEM,
                &[
                    ("role_name", self.role.name.as_str()),
                    ("role_description", self.role.description.as_str()),
                    ("authority_summary", &self.role.authority_summary()),
                ],
            )
            .unwrap_or_default();
        let completion =
            complete_with_retry(self.provider, &system, prompt, self.max_retries).await?;
        cost.record(self.provider, &completion);
        parse_task_response(&completion.text)
    }

    // ── Target resolution ──────────────────────────────────────────────

    /// Four-tier rule: declared/literal filename, scored sandbox match,
    /// sole sandbox file, most-recently-modified non-readme.
    pub fn resolve_target(&self, task: &Task) -> Option<String> {
        // Tier 1: declared target or a literal filename in the text.
        if let Some(target) = &task.target {
            return Some(target.clone());
        }
        if let Some(name) = literal_filename(&task.text()) {
            return Some(name);
        }

        let inventory = self.sandbox.list().ok()?;
        if inventory.is_empty() {
            return None;
        }

        // Tier 2: score sandbox files by stem/extension/keyword match.
        let words: HashSet<String> = task
            .text()
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| w.len() > 2)
            .map(String::from)
            .collect();
        let mut best: Option<(u32, &str)> = None;
        for entry in &inventory {
            let path = Path::new(&entry.path);
            let stem = path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("")
                .to_lowercase();
            let ext = path
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or("")
                .to_lowercase();
            let mut score = 0u32;
            if !stem.is_empty() && words.contains(&stem) {
                score += 3;
            }
            if !ext.is_empty() && words.contains(&ext) {
                score += 1;
            }
            score += words
                .iter()
                .filter(|w| w.len() > 3 && stem.contains(*w))
                .count() as u32;
            if score > 0 && best.map_or(true, |(s, _)| score > s) {
                best = Some((score, entry.path.as_str()));
            }
        }
        if let Some((_, path)) = best {
            return Some(path.to_string());
        }

        // Tier 3: a single file in the sandbox is the target.
        if inventory.len() == 1 {
            return Some(inventory[0].path.clone());
        }

        // Tier 4: most-recently-modified non-readme file.
        let work = self.sandbox.work_dir();
        inventory
            .iter()
            .filter(|e| {
                !Path::new(&e.path)
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .map(|s| s.eq_ignore_ascii_case("readme"))
                    .unwrap_or(false)
            })
            .max_by_key(|e| {
                std::fs::metadata(work.join(&e.path))
                    .and_then(|m| m.modified())
                    .unwrap_or(std::time::SystemTime::UNIX_EPOCH)
            })
            .map(|e| e.path.clone())
    }
}

impl TaskResponse {
    fn confidence(&self) -> f64 {
        match self.confidence {
            Some(c) => c.clamp(0.0, 1.0),
            // Heuristic when the model omits it: empty output is suspect,
            // anything substantive lands in the flag band.
            None => {
                if self.text().trim().is_empty() {
                    0.3
                } else {
                    0.75
                }
            }
        }
    }

    fn text(&self) -> String {
        self.content
            .clone()
            .or_else(|| self.result.clone())
            .unwrap_or_default()
    }

    fn summary_or(&self, fallback: &str) -> String {
        match &self.summary {
            Some(s) if !s.trim().is_empty() => s.clone(),
            _ => {
                let text = fallback.trim();
                let snippet: String = text.chars().take(160).collect();
                snippet
            }
        }
    }
}

fn parse_task_response(raw: &str) -> CoreResult<TaskResponse> {
    let json = extract_json_object(raw).ok_or_else(|| CoreError::LlmError {
        retryable: false,
        message: "no JSON object in task response".to_string(),
    })?;
    serde_json::from_str(json).map_err(|e| CoreError::LlmError {
        retryable: false,
        message: format!("unparseable task response: {}", e),
    })
}

/// First path-looking token with an extension in the text.
fn literal_filename(text: &str) -> Option<String> {
    static RE: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    let re = RE.get_or_init(|| {
        regex::Regex::new(r"\b([A-Za-z0-9_][A-Za-z0-9_./-]*\.[A-Za-z0-9]{1,8})\b").expect("filename regex")
    });
    re.captures(text)
        .map(|c| c[1].trim_start_matches("./").to_string())
}

/// Last-resort target for a write task in an empty sandbox.
fn fallback_target(task: &Task) -> String {
    let slug: String = task
        .title
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .take(4)
        .collect::<Vec<_>>()
        .join("-");
    if slug.is_empty() {
        "output.md".to_string()
    } else {
        format!("{}.md", slug)
    }
}
