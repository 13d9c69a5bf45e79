//! The durable-execution engine: starts executions, processes claimed tasks
//! (decision turns and activity invocations), and applies retry policy.
//! All durable effects go through `WorkflowStore` in single transactions;
//! the engine itself keeps no state a crash could lose.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use log::{info, warn};
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::spawn_blocking;

use crate::common::{ACTIVITY_TIMEOUT, MAX_ACTIVITY_ATTEMPTS, TASK_LEASE_MS};
use crate::models::photo::{PhotoId, PhotoUploadInput};
use crate::utils::now_ms;
use crate::workflow::activities::{ActivityCommand, PipelineContext, run_activity};
use crate::workflow::photo_upload::{TurnOutcome, decide, execution_id_for};
use crate::workflow::store::{
    ExecutionRecord, ExecutionState, HistoryEvent, QueuedTask, StartOutcome, WorkItem,
    WorkflowStore,
};

/// Per-invocation bounds and backoff. Exponential with a cap and a little
/// jitter so a burst of failures does not retry in lockstep.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub activity_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: MAX_ACTIVITY_ATTEMPTS,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(100),
            activity_timeout: ACTIVITY_TIMEOUT,
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1`, in milliseconds.
    pub fn backoff_ms(&self, attempt: u32) -> u64 {
        let initial = self.initial_backoff.as_millis() as u64;
        let cap = self.max_backoff.as_millis() as u64;
        let base = initial
            .saturating_mul(1u64 << attempt.min(32))
            .min(cap);
        if base == 0 {
            return 0;
        }
        base + rand::random_range(0..=base / 4)
    }

    /// No waiting, few attempts; lets tests exhaust retries instantly.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            activity_timeout: ACTIVITY_TIMEOUT,
        }
    }
}

/// Operational view of one execution, for the visibility endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionSummary {
    pub execution_id: String,
    pub state: ExecutionState,
    pub created_at: u64,
    pub updated_at: u64,
}

impl From<&ExecutionRecord> for ExecutionSummary {
    fn from(record: &ExecutionRecord) -> Self {
        Self {
            execution_id: record.execution_id.clone(),
            state: record.state,
            created_at: record.created_ms,
            updated_at: record.updated_ms,
        }
    }
}

pub struct WorkflowEngine {
    store: Arc<WorkflowStore>,
    pipeline: Arc<PipelineContext>,
    policy: RetryPolicy,
    wake: Notify,
}

impl WorkflowEngine {
    pub fn new(store: Arc<WorkflowStore>, pipeline: Arc<PipelineContext>) -> Self {
        Self::with_policy(store, pipeline, RetryPolicy::default())
    }

    pub fn with_policy(
        store: Arc<WorkflowStore>,
        pipeline: Arc<PipelineContext>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            store,
            pipeline,
            policy,
            wake: Notify::new(),
        }
    }

    /// Resolves when new work may be available. Workers also poll on a
    /// timer, so a missed notification only costs latency.
    pub async fn notified(&self) {
        self.wake.notified().await;
    }

    /// Start one `photo_upload_<id>` execution. A second start for the same
    /// photo id is reported, not re-run.
    pub async fn start_photo_upload(&self, input: PhotoUploadInput) -> Result<StartOutcome> {
        let execution_id = execution_id_for(&input.photo_id);
        let now = now_ms();
        let record = ExecutionRecord {
            execution_id: execution_id.clone(),
            state: ExecutionState::Started,
            history: vec![HistoryEvent::ExecutionStarted { input }],
            created_ms: now,
            updated_ms: now,
        };
        let first_task = QueuedTask {
            execution_id: execution_id.clone(),
            item: WorkItem::RunTurn,
            not_before_ms: 0,
            locked_until_ms: 0,
        };

        let store = self.store.clone();
        let outcome =
            spawn_blocking(move || store.create_execution(record, first_task)).await??;
        match outcome {
            StartOutcome::Started => {
                info!("Started workflow execution {execution_id}");
                self.wake.notify_waiters();
            }
            StartOutcome::AlreadyExists => {
                warn!("Workflow execution {execution_id} already exists; not starting again");
            }
        }
        Ok(outcome)
    }

    /// Claim the next due task, skipping sequence numbers this process is
    /// already working on.
    pub async fn claim(&self, held: Vec<u64>) -> Result<Option<(u64, QueuedTask)>> {
        let store = self.store.clone();
        let now = now_ms();
        spawn_blocking(move || store.claim_next(now, TASK_LEASE_MS, &held)).await?
    }

    /// Process one claimed task to its durable conclusion.
    pub async fn process(&self, seq: u64, task: QueuedTask) -> Result<()> {
        match task.item.clone() {
            WorkItem::RunTurn => self.run_turn(seq, &task.execution_id).await,
            WorkItem::RunActivity {
                invocation,
                command,
                attempt,
            } => {
                self.run_activity_task(seq, &task, invocation, command, attempt)
                    .await
            }
        }
    }

    async fn run_turn(&self, seq: u64, execution_id: &str) -> Result<()> {
        let record = self
            .load_execution(execution_id)
            .await?
            .ok_or_else(|| anyhow!("Turn scheduled for unknown execution {execution_id}"))?;
        let history_len = record.history.len();
        let outcome = decide(&record);

        if let Some(state) = outcome.state {
            info!("Execution {execution_id} advancing to {state:?}");
        }

        let applied = self
            .apply(seq, execution_id, outcome, Some(history_len))
            .await?;
        if !applied {
            // A concurrent turn advanced the history first; its decisions
            // stand and this one is discarded.
            info!("Execution {execution_id}: stale turn discarded");
        }
        Ok(())
    }

    async fn run_activity_task(
        &self,
        seq: u64,
        task: &QueuedTask,
        invocation: u32,
        command: ActivityCommand,
        attempt: u32,
    ) -> Result<()> {
        let execution_id = task.execution_id.as_str();
        let label = command.label();

        let outcome = tokio::time::timeout(
            self.policy.activity_timeout,
            run_activity(&self.pipeline, command.clone()),
        )
        .await;
        let outcome = match outcome {
            Ok(result) => result,
            Err(_) => Err(anyhow!(
                "activity {label} timed out after {:?}",
                self.policy.activity_timeout
            )),
        };

        match outcome {
            Ok(result) => {
                let turn = TurnOutcome {
                    events: vec![HistoryEvent::ActivityCompleted { invocation, result }],
                    state: None,
                    enqueue: vec![WorkItem::RunTurn],
                };
                self.apply(seq, execution_id, turn, None).await?;
                Ok(())
            }
            Err(error) => {
                let attempts_made = attempt + 1;
                if attempts_made >= self.policy.max_attempts {
                    warn!(
                        "Activity {label} (invocation {invocation}) of {execution_id} failed on final attempt {attempts_made}: {error:#}"
                    );
                    let turn = TurnOutcome {
                        events: vec![HistoryEvent::ActivityFailed {
                            invocation,
                            error: format!("{error:#}"),
                            attempts: attempts_made,
                        }],
                        state: None,
                        enqueue: vec![WorkItem::RunTurn],
                    };
                    self.apply(seq, execution_id, turn, None).await?;
                    Ok(())
                } else {
                    let delay = self.policy.backoff_ms(attempt);
                    warn!(
                        "Activity {label} (invocation {invocation}) of {execution_id} failed on attempt {attempts_made}, retrying in {delay}ms: {error:#}"
                    );
                    let retry = QueuedTask {
                        execution_id: execution_id.to_string(),
                        item: WorkItem::RunActivity {
                            invocation,
                            command,
                            attempt: attempts_made,
                        },
                        not_before_ms: now_ms() + delay,
                        locked_until_ms: 0,
                    };
                    let store = self.store.clone();
                    spawn_blocking(move || store.reschedule_task(seq, &retry)).await??;
                    Ok(())
                }
            }
        }
    }

    async fn apply(
        &self,
        seq: u64,
        execution_id: &str,
        outcome: TurnOutcome,
        expected_history_len: Option<usize>,
    ) -> Result<bool> {
        let store = self.store.clone();
        let execution_id = execution_id.to_string();
        let has_followups = !outcome.enqueue.is_empty();
        let applied = spawn_blocking(move || {
            store.apply_outcome(
                seq,
                &execution_id,
                outcome.events,
                outcome.state,
                outcome.enqueue,
                expected_history_len,
                now_ms(),
            )
        })
        .await??;
        if applied && has_followups {
            self.wake.notify_waiters();
        }
        Ok(applied)
    }

    pub async fn load_execution(&self, execution_id: &str) -> Result<Option<ExecutionRecord>> {
        let store = self.store.clone();
        let execution_id = execution_id.to_string();
        spawn_blocking(move || store.load_execution(&execution_id)).await?
    }

    /// Execution record of a photo id's upload workflow, if one was started.
    pub async fn photo_execution(&self, photo_id: &PhotoId) -> Result<Option<ExecutionRecord>> {
        self.load_execution(&execution_id_for(photo_id)).await
    }

    /// Operator visibility: every execution with its current state. This is
    /// where pipeline failures after upload acceptance become observable.
    pub async fn list_executions(&self) -> Result<Vec<ExecutionSummary>> {
        let store = self.store.clone();
        let records = spawn_blocking(move || store.list_executions()).await??;
        let mut summaries: Vec<ExecutionSummary> =
            records.iter().map(ExecutionSummary::from).collect();
        summaries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(summaries)
    }

    /// Number of tasks still queued; zero means the pipeline is idle.
    pub async fn queued_tasks(&self) -> Result<u64> {
        let store = self.store.clone();
        spawn_blocking(move || store.queue_len())
            .await?
            .context("Failed to read task queue length")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        // Jitter adds at most 25% on top of the base delay.
        for attempt in 0..6 {
            let base = 1_000u64 << attempt;
            let delay = policy.backoff_ms(attempt);
            assert!(delay >= base.min(100_000));
            assert!(delay <= base.min(100_000) * 5 / 4);
        }
        // Far past the cap the delay stays bounded.
        let delay = policy.backoff_ms(30);
        assert!(delay <= 125_000);
    }

    #[test]
    fn immediate_policy_never_waits() {
        let policy = RetryPolicy::immediate(3);
        assert_eq!(policy.backoff_ms(0), 0);
        assert_eq!(policy.backoff_ms(5), 0);
        assert_eq!(policy.max_attempts, 3);
    }
}
