//! Single-consumer task executor.
//!
//! The executor owns the consume loop: pop a task, mark it running, run the
//! validation script, classify the output into terminal results, persist them
//! with one history entry, then clear the running marker.
//!
//! # Components
//!
//! - [`TaskExecutor`]: the consume loop and per-task lifecycle
//! - [`runner`]: the [`CommandRunner`] seam and the real [`ScriptRunner`]
//! - [`parser`]: literal failure extraction from script output
//!
//! Tasks run strictly one at a time; throughput is bound by script wall-clock
//! time.

pub mod parser;
pub mod runner;

pub use parser::parse_failed_tests;
pub use runner::{CommandOutput, CommandRunner, ExitOutcome, ScriptRunner};

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::ExecutorConfig;
use crate::queue::{QueueError, TaskQueue};
use crate::storage::{ResultStore, StoreError};
use crate::task::{HistoryRecord, Task, TaskParam, TaskResult, TaskStatus};

pub const DEFAULT_LEADING_FLAG: &str = "-n";
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("executor cancelled")]
    Cancelled,

    #[error("queue error: {0}")]
    Queue(QueueError),

    #[error("failed to persist result for task {task_id}: {source}")]
    Persist {
        task_id: String,
        #[source]
        source: StoreError,
    },
}

impl From<QueueError> for ExecutorError {
    fn from(e: QueueError) -> Self {
        match e {
            QueueError::Cancelled => ExecutorError::Cancelled,
            other => ExecutorError::Queue(other),
        }
    }
}

/// Script arguments: the leading flag, then `-p component:version` per param.
pub fn build_args(leading_flag: &str, params: &[TaskParam]) -> Vec<String> {
    let mut args = Vec::with_capacity(1 + params.len() * 2);
    args.push(leading_flag.to_string());
    for param in params {
        args.push("-p".to_string());
        args.push(param.to_string());
    }
    args
}

/// Turn one script run into the task's terminal results.
///
/// Always returns at least one result. Parsed sub-test failures win over the
/// exit code; a failed exit with nothing parsed yields one generic failure.
pub fn classify(task: &Task, output: &CommandOutput, at: DateTime<Utc>) -> Vec<TaskResult> {
    let failed = parse_failed_tests(&output.output);

    if !failed.is_empty() {
        return failed
            .into_iter()
            .map(|(name, excerpt)| TaskResult::failed_test(task, name, excerpt, at))
            .collect();
    }

    match &output.exit {
        ExitOutcome::Success => vec![TaskResult::success(task, output.output.clone(), at)],
        ExitOutcome::Failed(error) => {
            vec![TaskResult::failed_generic(task, error, &output.output, at)]
        }
    }
}

pub struct TaskExecutor {
    queue: Arc<TaskQueue>,
    store: Arc<dyn ResultStore>,
    runner: Arc<dyn CommandRunner>,
    leading_flag: String,
    retry_delay: Duration,
}

impl TaskExecutor {
    pub fn new(
        queue: Arc<TaskQueue>,
        store: Arc<dyn ResultStore>,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            queue,
            store,
            runner,
            leading_flag: DEFAULT_LEADING_FLAG.to_string(),
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }

    pub fn from_config(
        config: &ExecutorConfig,
        queue: Arc<TaskQueue>,
        store: Arc<dyn ResultStore>,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self::new(queue, store, runner)
            .with_leading_flag(config.leading_flag.clone())
            .with_retry_delay(Duration::from_millis(config.retry_delay_ms))
    }

    pub fn with_leading_flag(mut self, flag: impl Into<String>) -> Self {
        self.leading_flag = flag.into();
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Consume tasks until `cancel` fires.
    ///
    /// Processing errors are logged and retried after the backoff delay;
    /// only cancellation ends the loop.
    pub async fn start(&self, cancel: &CancellationToken) -> Result<(), ExecutorError> {
        info!("Executor started, waiting for tasks...");

        while !cancel.is_cancelled() {
            match self.process_next_task(cancel).await {
                Ok(_) => {}
                Err(ExecutorError::Cancelled) => break,
                Err(e) => {
                    error!(error = %e, "Error processing task");
                    tokio::select! {
                        _ = tokio::time::sleep(self.retry_delay) => {}
                        _ = cancel.cancelled() => break,
                    }
                }
            }
        }

        info!("Executor stopped");
        Ok(())
    }

    /// Pop one task (waiting if needed) and drive it to a terminal status.
    pub async fn process_next_task(
        &self,
        cancel: &CancellationToken,
    ) -> Result<TaskStatus, ExecutorError> {
        let task = self.queue.pop(cancel).await?;
        info!(task_id = %task.id, params = %task.params_summary(), "Processing task");

        if let Err(e) = self.store.save_result(&TaskResult::running(&task, Utc::now())) {
            error!(task_id = %task.id, error = %e, "Failed to save running status");
        }
        self.queue.release(&task.id);

        let args = build_args(&self.leading_flag, &task.params);
        let output = tokio::select! {
            output = self.runner.run(&args) => output,
            _ = cancel.cancelled() => {
                warn!(task_id = %task.id, "Cancelled while script was running, task abandoned");
                self.clear_running_marker(&task.id);
                return Err(ExecutorError::Cancelled);
            }
        };

        let results = classify(&task, &output, Utc::now());
        let status = results
            .first()
            .map_or(TaskStatus::Failed, |r| r.status);

        for result in &results {
            self.store
                .save_result(result)
                .map_err(|source| ExecutorError::Persist {
                    task_id: task.id.clone(),
                    source,
                })?;
        }

        self.clear_running_marker(&task.id);

        let record = HistoryRecord::for_task(&task, status, Utc::now());
        if let Err(e) = self.store.save_history(&record) {
            error!(task_id = %task.id, error = %e, "Failed to save history record");
        }

        info!(task_id = %task.id, %status, results = results.len(), "Task completed");
        Ok(status)
    }

    // The terminal result already exists, so a failed delete is only logged.
    fn clear_running_marker(&self, task_id: &str) {
        if let Err(e) = self.store.delete_result(task_id, TaskStatus::Running) {
            warn!(task_id, error = %e, "Failed to delete running status");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task() -> Task {
        Task::new("42", vec![TaskParam::new("amf", "70"), TaskParam::new("smf", "80")])
    }

    #[test]
    fn test_build_args() {
        let args = build_args("-n", &task().params);
        assert_eq!(args, vec!["-n", "-p", "amf:70", "-p", "smf:80"]);
    }

    #[test]
    fn test_build_args_without_params() {
        assert_eq!(build_args("-n", &[]), vec!["-n"]);
    }

    #[test]
    fn test_classify_success() {
        let out = CommandOutput::success("TestAMF\nPASS: TestAMF\n");
        let results = classify(&task(), &out, Utc::now());

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].status, TaskStatus::Success);
        assert_eq!(results[0].logs, vec!["TestAMF\nPASS: TestAMF\n".to_string()]);
        assert!(results[0].failed_tests.is_empty());
    }

    #[test]
    fn test_classify_parsed_failure_overrides_zero_exit() {
        let out = CommandOutput::success("TestAMF\nFAIL: TestAMF\n");
        let results = classify(&task(), &out, Utc::now());

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].status, TaskStatus::Failed);
        assert_eq!(results[0].failed_tests, vec!["TestAMF".to_string()]);
    }

    #[test]
    fn test_classify_one_result_per_failed_subtest() {
        let out = CommandOutput::failed(
            "TestA\nFAIL: TestA\nTestB\nFAIL: TestB\nTestC\nok\n",
            "script execution failed: exit status 1",
        );
        let results = classify(&task(), &out, Utc::now());

        assert_eq!(results.len(), 2);
        for r in &results {
            assert_eq!(r.status, TaskStatus::Failed);
            assert_eq!(r.logs.len(), r.failed_tests.len());
            assert!(r.logs[0].contains(&format!("FAIL: {}", r.failed_tests[0])));
        }
    }

    #[test]
    fn test_classify_generic_failure() {
        let out = CommandOutput::failed("segfault\n", "script execution failed: exit status 139");
        let results = classify(&task(), &out, Utc::now());

        assert_eq!(results.len(), 1);
        assert!(results[0].failed_tests.is_empty());
        assert!(results[0].logs[0].contains("exit status 139"));
        assert!(results[0].logs[0].contains("segfault"));
    }

    #[test]
    fn test_cancelled_queue_error_maps_to_cancelled() {
        assert!(matches!(
            ExecutorError::from(QueueError::Cancelled),
            ExecutorError::Cancelled
        ));
        assert!(matches!(
            ExecutorError::from(QueueError::EmptyTaskId),
            ExecutorError::Queue(QueueError::EmptyTaskId)
        ));
    }
}
