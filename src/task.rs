//! Task, result and history records shared by the queue, store and executor.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One component/version pair to validate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskParam {
    pub component: String,
    pub version: String,
}

impl TaskParam {
    pub fn new(component: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            version: version.into(),
        }
    }
}

impl std::fmt::Display for TaskParam {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.component, self.version)
    }
}

/// A validation job waiting in the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub params: Vec<TaskParam>,
}

impl Task {
    pub fn new(id: impl Into<String>, params: Vec<TaskParam>) -> Self {
        Self {
            id: id.into(),
            params,
        }
    }

    /// `amf:70, smf:80` style summary for log lines.
    pub fn params_summary(&self) -> String {
        self.params
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Queueing,
    Running,
    Success,
    Failed,
}

impl TaskStatus {
    /// Only terminal results end a task's lifecycle.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Success | TaskStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Queueing => "queueing",
            TaskStatus::Running => "running",
            TaskStatus::Success => "success",
            TaskStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queueing" => Ok(TaskStatus::Queueing),
            "running" => Ok(TaskStatus::Running),
            "success" => Ok(TaskStatus::Success),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(format!("unknown task status '{}'", other)),
        }
    }
}

/// Outcome record for a task.
///
/// When `failed_tests` is non-empty it is index-aligned with `logs`: `logs[i]`
/// is the excerpt for `failed_tests[i]`. Success, running and generic failure
/// results carry their text in `logs` with no sub-test names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub params: Vec<TaskParam>,
    #[serde(default)]
    pub logs: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failed_tests: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

impl TaskResult {
    pub fn running(task: &Task, at: DateTime<Utc>) -> Self {
        Self {
            task_id: task.id.clone(),
            status: TaskStatus::Running,
            params: task.params.clone(),
            logs: vec![format!("Task started processing at {}", at.to_rfc3339())],
            failed_tests: Vec::new(),
            timestamp: at,
        }
    }

    pub fn queueing(task: &Task, at: DateTime<Utc>) -> Self {
        Self {
            task_id: task.id.clone(),
            status: TaskStatus::Queueing,
            params: task.params.clone(),
            logs: Vec::new(),
            failed_tests: Vec::new(),
            timestamp: at,
        }
    }

    pub fn success(task: &Task, output: String, at: DateTime<Utc>) -> Self {
        Self {
            task_id: task.id.clone(),
            status: TaskStatus::Success,
            params: task.params.clone(),
            logs: vec![output],
            failed_tests: Vec::new(),
            timestamp: at,
        }
    }

    /// A failure attributed to one named sub-test.
    pub fn failed_test(task: &Task, name: String, excerpt: String, at: DateTime<Utc>) -> Self {
        Self {
            task_id: task.id.clone(),
            status: TaskStatus::Failed,
            params: task.params.clone(),
            logs: vec![excerpt],
            failed_tests: vec![name],
            timestamp: at,
        }
    }

    /// A failure with no sub-test to blame.
    pub fn failed_generic(task: &Task, error: &str, output: &str, at: DateTime<Utc>) -> Self {
        Self {
            task_id: task.id.clone(),
            status: TaskStatus::Failed,
            params: task.params.clone(),
            logs: vec![format!("Task failed: {}\nLogs: {}", error, output)],
            failed_tests: Vec::new(),
            timestamp: at,
        }
    }
}

/// Append-only summary of one processed task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub time: DateTime<Utc>,
    pub params: Vec<TaskParam>,
    pub result: TaskStatus,
    pub task_name: String,
}

impl HistoryRecord {
    pub fn for_task(task: &Task, result: TaskStatus, at: DateTime<Utc>) -> Self {
        Self {
            time: at,
            params: task.params.clone(),
            result,
            task_name: format!("Test Task {}", task.id),
        }
    }
}

/// One window of the history log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryPage {
    pub records: Vec<HistoryRecord>,
    pub page: u64,
    pub total_pages: u64,
    pub total_records: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task() -> Task {
        Task::new("7", vec![TaskParam::new("amf", "70"), TaskParam::new("smf", "80")])
    }

    #[test]
    fn test_params_summary() {
        assert_eq!(task().params_summary(), "amf:70, smf:80");
    }

    #[test]
    fn test_status_round_trips_through_str() {
        for status in [
            TaskStatus::Queueing,
            TaskStatus::Running,
            TaskStatus::Success,
            TaskStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<TaskStatus>().unwrap(), status);
        }
        assert!("Success".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn test_only_success_and_failed_are_terminal() {
        assert!(!TaskStatus::Queueing.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert!(TaskStatus::Success.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
    }

    #[test]
    fn test_failed_test_result_is_index_aligned() {
        let r = TaskResult::failed_test(&task(), "TestFoo".into(), "excerpt".into(), Utc::now());
        assert_eq!(r.logs.len(), r.failed_tests.len());
        assert_eq!(r.failed_tests[0], "TestFoo");
    }

    #[test]
    fn test_status_serializes_lowercase() {
        let json = serde_json::to_string(&TaskStatus::Running).unwrap();
        assert_eq!(json, "\"running\"");
    }

    #[test]
    fn test_history_task_name() {
        let rec = HistoryRecord::for_task(&task(), TaskStatus::Success, Utc::now());
        assert_eq!(rec.task_name, "Test Task 7");
    }
}
