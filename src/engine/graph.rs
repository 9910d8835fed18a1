// Task graph: the DAG produced by goal decomposition.
//
// Tasks live in a flat arena and refer to each other by id, which keeps the
// graph serializable for checkpoints. Validation guarantees unique ids,
// resolvable dependencies, and acyclicity; execution order is a stable
// topological sort over arena indices.

use crate::errors::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

pub type TaskId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    ReadFile,
    WriteFile,
    EditFile,
    Analyze,
    Validate,
    Generic,
}

impl ActionType {
    pub fn label(&self) -> &'static str {
        match self {
            ActionType::ReadFile => "read_file",
            ActionType::WriteFile => "write_file",
            ActionType::EditFile => "edit_file",
            ActionType::Analyze => "analyze",
            ActionType::Validate => "validate",
            ActionType::Generic => "generic",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        match label {
            "read_file" | "read" => Some(ActionType::ReadFile),
            "write_file" | "write" | "create_file" => Some(ActionType::WriteFile),
            "edit_file" | "edit" | "modify_file" => Some(ActionType::EditFile),
            "analyze" | "analysis" => Some(ActionType::Analyze),
            "validate" | "verify" => Some(ActionType::Validate),
            "generic" => Some(ActionType::Generic),
            _ => None,
        }
    }

    /// Does this action produce a file in the sandbox?
    pub fn writes(&self) -> bool {
        matches!(self, ActionType::WriteFile | ActionType::EditFile)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Done,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub title: String,
    pub description: String,
    pub action: ActionType,
    /// Declared target path, when the plan names one.
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub depends_on: Vec<TaskId>,
    pub status: TaskStatus,
    #[serde(default)]
    pub output_summary: Option<String>,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub duration_secs: Option<f64>,
    /// Skill injected for this task, if one was selected.
    #[serde(default)]
    pub skill: Option<String>,
    /// Committed below the auto-execute threshold.
    #[serde(default)]
    pub needs_review: bool,
    /// Action sits in the role's requires-approval tier.
    #[serde(default)]
    pub pending_approval: bool,
}

impl Task {
    pub fn new(id: &str, title: &str, description: &str, action: ActionType) -> Self {
        Self {
            id: id.to_string(),
            title: title.to_string(),
            description: description.to_string(),
            action,
            target: None,
            depends_on: Vec::new(),
            status: TaskStatus::Pending,
            output_summary: None,
            confidence: None,
            duration_secs: None,
            skill: None,
            needs_review: false,
            pending_approval: false,
        }
    }

    /// Combined text used for skill selection and target inference.
    pub fn text(&self) -> String {
        format!("{} {}", self.title, self.description)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskGraph {
    tasks: Vec<Task>,
}

impl TaskGraph {
    /// Validate and build: ids unique, dependencies resolve, graph acyclic.
    pub fn new(tasks: Vec<Task>) -> CoreResult<Self> {
        let mut index: HashMap<&str, usize> = HashMap::new();
        for (i, task) in tasks.iter().enumerate() {
            if index.insert(task.id.as_str(), i).is_some() {
                return Err(CoreError::DecompositionFailed(format!(
                    "duplicate task id '{}'",
                    task.id
                )));
            }
        }
        for task in &tasks {
            for dep in &task.depends_on {
                if !index.contains_key(dep.as_str()) {
                    return Err(CoreError::DecompositionFailed(format!(
                        "task '{}' depends on unknown task '{}'",
                        task.id, dep
                    )));
                }
                if dep == &task.id {
                    return Err(CoreError::DecompositionFailed(format!(
                        "task '{}' depends on itself",
                        task.id
                    )));
                }
            }
        }
        let graph = Self { tasks };
        graph.topological_order()?;
        Ok(graph)
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn tasks_mut(&mut self) -> &mut [Task] {
        &mut self.tasks
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|t| t.id == id)
    }

    /// Stable topological order over arena indices (Kahn's algorithm,
    /// original order breaks ties). Fails on cycles.
    pub fn topological_order(&self) -> CoreResult<Vec<usize>> {
        let index: HashMap<&str, usize> = self
            .tasks
            .iter()
            .enumerate()
            .map(|(i, t)| (t.id.as_str(), i))
            .collect();
        let mut in_degree = vec![0usize; self.tasks.len()];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); self.tasks.len()];
        for (i, task) in self.tasks.iter().enumerate() {
            for dep in &task.depends_on {
                let d = index[dep.as_str()];
                in_degree[i] += 1;
                dependents[d].push(i);
            }
        }

        let mut queue: VecDeque<usize> = (0..self.tasks.len()).filter(|i| in_degree[*i] == 0).collect();
        let mut order = Vec::with_capacity(self.tasks.len());
        while let Some(i) = queue.pop_front() {
            order.push(i);
            for &next in &dependents[i] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    queue.push_back(next);
                }
            }
        }
        if order.len() != self.tasks.len() {
            return Err(CoreError::DecompositionFailed(
                "task graph contains a cycle".to_string(),
            ));
        }
        Ok(order)
    }

    /// Next pending task whose dependencies have all finished (done or
    /// skipped), in topological order.
    pub fn next_ready(&self) -> Option<&Task> {
        let order = self.topological_order().ok()?;
        order
            .into_iter()
            .map(|i| &self.tasks[i])
            .find(|t| t.status == TaskStatus::Pending && self.deps_finished(t))
    }

    fn deps_finished(&self, task: &Task) -> bool {
        task.depends_on.iter().all(|dep| {
            self.get(dep)
                .map(|d| matches!(d.status, TaskStatus::Done | TaskStatus::Skipped))
                .unwrap_or(false)
        })
    }

    pub fn all_finished(&self) -> bool {
        self.tasks
            .iter()
            .all(|t| matches!(t.status, TaskStatus::Done | TaskStatus::Skipped | TaskStatus::Failed))
    }

    pub fn all_done(&self) -> bool {
        self.tasks
            .iter()
            .all(|t| matches!(t.status, TaskStatus::Done | TaskStatus::Skipped))
    }

    pub fn completed_count(&self) -> usize {
        self.tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Done)
            .count()
    }

    /// Summaries of the most recently completed tasks, oldest first.
    pub fn recent_outcomes(&self, limit: usize) -> Vec<(&str, &str)> {
        let done: Vec<&Task> = self
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Done)
            .collect();
        done.iter()
            .rev()
            .take(limit)
            .rev()
            .map(|t| {
                (
                    t.title.as_str(),
                    t.output_summary.as_deref().unwrap_or("(no summary)"),
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str, deps: &[&str]) -> Task {
        let mut t = Task::new(id, &format!("task {id}"), "", ActionType::Analyze);
        t.depends_on = deps.iter().map(|d| d.to_string()).collect();
        t
    }

    #[test]
    fn topological_order_respects_deps() {
        let graph = TaskGraph::new(vec![
            task("c", &["a", "b"]),
            task("a", &[]),
            task("b", &["a"]),
        ])
        .unwrap();
        let order = graph.topological_order().unwrap();
        let ids: Vec<&str> = order.iter().map(|&i| graph.tasks()[i].id.as_str()).collect();
        let pos = |id: &str| ids.iter().position(|x| *x == id).unwrap();
        assert!(pos("a") < pos("b"));
        assert!(pos("b") < pos("c"));
    }

    #[test]
    fn cycle_rejected() {
        let err = TaskGraph::new(vec![task("a", &["b"]), task("b", &["a"])]).unwrap_err();
        assert!(matches!(err, CoreError::DecompositionFailed(_)));
    }

    #[test]
    fn self_dependency_rejected() {
        assert!(TaskGraph::new(vec![task("a", &["a"])]).is_err());
    }

    #[test]
    fn unknown_dependency_rejected() {
        assert!(TaskGraph::new(vec![task("a", &["ghost"])]).is_err());
    }

    #[test]
    fn duplicate_id_rejected() {
        assert!(TaskGraph::new(vec![task("a", &[]), task("a", &[])]).is_err());
    }

    #[test]
    fn next_ready_walks_dependencies() {
        let mut graph =
            TaskGraph::new(vec![task("a", &[]), task("b", &["a"]), task("c", &["b"])]).unwrap();
        assert_eq!(graph.next_ready().unwrap().id, "a");
        graph.get_mut("a").unwrap().status = TaskStatus::Done;
        assert_eq!(graph.next_ready().unwrap().id, "b");
        graph.get_mut("b").unwrap().status = TaskStatus::Skipped;
        // skipped dependencies unblock their dependents
        assert_eq!(graph.next_ready().unwrap().id, "c");
        graph.get_mut("c").unwrap().status = TaskStatus::Done;
        assert!(graph.next_ready().is_none());
        assert!(graph.all_finished());
        assert!(graph.all_done());
    }

    #[test]
    fn failed_dependency_blocks_dependents() {
        let mut graph = TaskGraph::new(vec![task("a", &[]), task("b", &["a"])]).unwrap();
        graph.get_mut("a").unwrap().status = TaskStatus::Failed;
        assert!(graph.next_ready().is_none());
        assert!(graph.all_finished());
        assert!(!graph.all_done());
    }

    #[test]
    fn recent_outcomes_capped_and_ordered() {
        let mut graph = TaskGraph::new((0..5).map(|i| task(&format!("t{i}"), &[])).collect()).unwrap();
        for i in 0..5 {
            let t = graph.get_mut(&format!("t{i}")).unwrap();
            t.status = TaskStatus::Done;
            t.output_summary = Some(format!("summary {i}"));
        }
        let outcomes = graph.recent_outcomes(3);
        assert_eq!(outcomes.len(), 3);
        assert_eq!(outcomes[0].1, "summary 2");
        assert_eq!(outcomes[2].1, "summary 4");
    }

    #[test]
    fn action_type_labels_roundtrip() {
        for action in [
            ActionType::ReadFile,
            ActionType::WriteFile,
            ActionType::EditFile,
            ActionType::Analyze,
            ActionType::Validate,
            ActionType::Generic,
        ] {
            assert_eq!(ActionType::from_label(action.label()), Some(action));
        }
        assert_eq!(ActionType::from_label("deploy"), None);
    }
}
