//! Durable backing store of the orchestrator: execution records with an
//! append-only event history, plus a persistent task queue with visibility
//! delays and claim leases. Everything the engine decides is committed here
//! in single write transactions, which is what lets a restarted worker pick
//! up exactly where the last one died.

use std::path::Path;

use anyhow::{Context, Result, anyhow};
use bitcode::{Decode, Encode};
use redb::{Database, ReadableTable, TableDefinition};
use serde::Serialize;

use crate::workflow::activities::{ActivityCommand, ActivityResult};
use crate::models::photo::PhotoUploadInput;

/// execution id → bitcode-encoded `ExecutionRecord`.
pub const EXECUTION_TABLE: TableDefinition<&str, &[u8]> =
    TableDefinition::new("workflow_executions");

/// queue sequence → bitcode-encoded `QueuedTask`.
pub const TASK_QUEUE_TABLE: TableDefinition<u64, &[u8]> =
    TableDefinition::new("workflow_task_queue");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ExecutionState {
    Started,
    PreviewsPending,
    MetadataPending,
    Persisting,
    Completed,
    Failed,
}

impl ExecutionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ExecutionState::Completed | ExecutionState::Failed)
    }
}

/// One entry of an execution's recorded history. The history is the source
/// of truth: state is recomputed from it on every turn, so replay after a
/// crash reaches the same decisions.
#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub enum HistoryEvent {
    ExecutionStarted {
        input: PhotoUploadInput,
    },
    ActivityScheduled {
        invocation: u32,
        command: ActivityCommand,
    },
    ActivityCompleted {
        invocation: u32,
        result: ActivityResult,
    },
    ActivityFailed {
        invocation: u32,
        error: String,
        attempts: u32,
    },
    ExecutionCompleted,
    ExecutionFailed {
        reason: String,
    },
}

#[derive(Debug, Clone, Encode, Decode)]
pub struct ExecutionRecord {
    pub execution_id: String,
    pub state: ExecutionState,
    pub history: Vec<HistoryEvent>,
    pub created_ms: u64,
    pub updated_ms: u64,
}

/// Work the queue can hand to a worker slot: either a decision turn for an
/// execution, or one activity invocation.
#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub enum WorkItem {
    RunTurn,
    RunActivity {
        invocation: u32,
        command: ActivityCommand,
        /// Attempts already made before this delivery.
        attempt: u32,
    },
}

#[derive(Debug, Clone, Encode, Decode)]
pub struct QueuedTask {
    pub execution_id: String,
    pub item: WorkItem,
    /// Visibility delay; retries park the task until their backoff elapses.
    pub not_before_ms: u64,
    /// Claim lease. Zero or expired means claimable; a crashed worker's
    /// tasks become claimable again when their lease runs out.
    pub locked_until_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    /// The execution id was already used; the natural deduplication of
    /// double-submitted uploads.
    AlreadyExists,
}

pub struct WorkflowStore {
    db: Database,
}

impl WorkflowStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let db = Database::create(path).context(format!(
            "Failed to open workflow database {}",
            path.display()
        ))?;
        let txn = db.begin_write()?;
        txn.open_table(EXECUTION_TABLE)?;
        txn.open_table(TASK_QUEUE_TABLE)?;
        txn.commit()?;
        Ok(Self { db })
    }

    /// Insert a fresh execution and its first task in one transaction.
    /// Rejects an execution id that already exists, running or terminal.
    pub fn create_execution(
        &self,
        record: ExecutionRecord,
        first_task: QueuedTask,
    ) -> Result<StartOutcome> {
        let txn = self.db.begin_write()?;
        {
            let mut executions = txn.open_table(EXECUTION_TABLE)?;
            if executions.get(record.execution_id.as_str())?.is_some() {
                return Ok(StartOutcome::AlreadyExists);
            }
            let encoded = bitcode::encode(&record);
            executions.insert(record.execution_id.as_str(), encoded.as_slice())?;

            let mut queue = txn.open_table(TASK_QUEUE_TABLE)?;
            let seq = next_seq(&queue)?;
            let encoded = bitcode::encode(&first_task);
            queue.insert(seq, encoded.as_slice())?;
        }
        txn.commit()?;
        Ok(StartOutcome::Started)
    }

    pub fn load_execution(&self, execution_id: &str) -> Result<Option<ExecutionRecord>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(EXECUTION_TABLE)?;
        match table.get(execution_id)? {
            Some(bytes) => Ok(Some(
                bitcode::decode(bytes.value()).context("Failed to decode execution record")?,
            )),
            None => Ok(None),
        }
    }

    pub fn list_executions(&self) -> Result<Vec<ExecutionRecord>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(EXECUTION_TABLE)?;
        let mut records = Vec::new();
        for entry in table.range::<&str>(..)? {
            let (_, value) = entry?;
            records
                .push(bitcode::decode(value.value()).context("Failed to decode execution record")?);
        }
        Ok(records)
    }

    /// Claim the first due task: visible, lease expired, and not currently
    /// held by this process. Renews the lease within the same transaction so
    /// no other claimer can take it.
    pub fn claim_next(
        &self,
        now_ms: u64,
        lease_ms: u64,
        held: &[u64],
    ) -> Result<Option<(u64, QueuedTask)>> {
        let txn = self.db.begin_write()?;
        let mut claimed = None;
        {
            let mut queue = txn.open_table(TASK_QUEUE_TABLE)?;
            let mut candidate: Option<(u64, QueuedTask)> = None;
            for entry in queue.range::<u64>(..)? {
                let (key, value) = entry?;
                let seq = key.value();
                if held.contains(&seq) {
                    continue;
                }
                let task: QueuedTask =
                    bitcode::decode(value.value()).context("Failed to decode queued task")?;
                if task.not_before_ms <= now_ms && task.locked_until_ms <= now_ms {
                    candidate = Some((seq, task));
                    break;
                }
            }
            if let Some((seq, mut task)) = candidate {
                task.locked_until_ms = now_ms + lease_ms;
                let encoded = bitcode::encode(&task);
                queue.insert(seq, encoded.as_slice())?;
                claimed = Some((seq, task));
            }
        }
        txn.commit()?;
        Ok(claimed)
    }

    /// Commit the outcome of one processed task atomically: append history
    /// events, update the state, remove the finished task and enqueue its
    /// follow-ups.
    ///
    /// `expected_history_len` is optimistic concurrency for decision turns:
    /// if another turn advanced the history since this one loaded it, the
    /// stale outcome is discarded (the task is still removed; the turn that
    /// won the race carries the execution forward).
    pub fn apply_outcome(
        &self,
        seq: u64,
        execution_id: &str,
        events: Vec<HistoryEvent>,
        state: Option<ExecutionState>,
        enqueue: Vec<WorkItem>,
        expected_history_len: Option<usize>,
        now_ms: u64,
    ) -> Result<bool> {
        let txn = self.db.begin_write()?;
        let mut applied = true;
        {
            let mut executions = txn.open_table(EXECUTION_TABLE)?;
            let mut record: ExecutionRecord = match executions.get(execution_id)? {
                Some(bytes) => {
                    bitcode::decode(bytes.value()).context("Failed to decode execution record")?
                }
                None => return Err(anyhow!("Unknown execution: {execution_id}")),
            };

            if expected_history_len.is_some_and(|expected| record.history.len() != expected) {
                applied = false;
            } else if !events.is_empty() || state.is_some() {
                record.history.extend(events);
                if let Some(state) = state {
                    record.state = state;
                }
                record.updated_ms = now_ms;
                let encoded = bitcode::encode(&record);
                executions.insert(execution_id, encoded.as_slice())?;
            }

            let mut queue = txn.open_table(TASK_QUEUE_TABLE)?;
            queue.remove(seq)?;
            if applied {
                for item in enqueue {
                    let task = QueuedTask {
                        execution_id: execution_id.to_string(),
                        item,
                        not_before_ms: 0,
                        locked_until_ms: 0,
                    };
                    let next = next_seq(&queue)?;
                    let encoded = bitcode::encode(&task);
                    queue.insert(next, encoded.as_slice())?;
                }
            }
        }
        txn.commit()?;
        Ok(applied)
    }

    /// Re-arm a failed activity task in place with its bumped attempt count
    /// and backoff visibility delay.
    pub fn reschedule_task(&self, seq: u64, task: &QueuedTask) -> Result<()> {
        let txn = self.db.begin_write()?;
        {
            let mut queue = txn.open_table(TASK_QUEUE_TABLE)?;
            let encoded = bitcode::encode(task);
            queue.insert(seq, encoded.as_slice())?;
        }
        txn.commit()?;
        Ok(())
    }

    /// Number of queued tasks, due or not. Used by tests and the idle check.
    pub fn queue_len(&self) -> Result<u64> {
        use redb::ReadableTableMetadata;
        let txn = self.db.begin_read()?;
        let table = txn.open_table(TASK_QUEUE_TABLE)?;
        Ok(table.len()?)
    }
}

fn next_seq(queue: &impl redb::ReadableTable<u64, &'static [u8]>) -> Result<u64> {
    Ok(queue.last()?.map(|(key, _)| key.value() + 1).unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::photo::PhotoId;
    use tempfile::TempDir;

    fn record(execution_id: &str) -> ExecutionRecord {
        let input = PhotoUploadInput {
            photo_id: PhotoId::from("cafe01").unwrap(),
            original_name: "a.jpg".to_string(),
            original_object: "original.jpg".to_string(),
        };
        ExecutionRecord {
            execution_id: execution_id.to_string(),
            state: ExecutionState::Started,
            history: vec![HistoryEvent::ExecutionStarted { input }],
            created_ms: 1,
            updated_ms: 1,
        }
    }

    fn turn_task(execution_id: &str) -> QueuedTask {
        QueuedTask {
            execution_id: execution_id.to_string(),
            item: WorkItem::RunTurn,
            not_before_ms: 0,
            locked_until_ms: 0,
        }
    }

    fn open() -> (TempDir, WorkflowStore) {
        let dir = TempDir::new().unwrap();
        let store = WorkflowStore::open(dir.path().join("workflow.redb")).unwrap();
        (dir, store)
    }

    #[test]
    fn duplicate_execution_ids_are_rejected() {
        let (_dir, store) = open();
        let id = "photo_upload_cafe01";
        assert_eq!(
            store.create_execution(record(id), turn_task(id)).unwrap(),
            StartOutcome::Started
        );
        assert_eq!(
            store.create_execution(record(id), turn_task(id)).unwrap(),
            StartOutcome::AlreadyExists
        );
        // The rejected start must not have enqueued a second task.
        assert_eq!(store.queue_len().unwrap(), 1);
    }

    #[test]
    fn claim_leases_the_task_until_expiry() {
        let (_dir, store) = open();
        let id = "photo_upload_cafe01";
        store.create_execution(record(id), turn_task(id)).unwrap();

        let (seq, _task) = store.claim_next(1_000, 60_000, &[]).unwrap().unwrap();
        // Within the lease nothing is claimable.
        assert!(store.claim_next(2_000, 60_000, &[]).unwrap().is_none());
        // After the lease expires the same task comes back, as it would to
        // a worker that replaced a crashed one.
        let (seq_again, _) = store.claim_next(62_000, 60_000, &[]).unwrap().unwrap();
        assert_eq!(seq, seq_again);
    }

    #[test]
    fn backoff_visibility_hides_rescheduled_tasks() {
        let (_dir, store) = open();
        let id = "photo_upload_cafe01";
        store.create_execution(record(id), turn_task(id)).unwrap();

        let (seq, mut task) = store.claim_next(1_000, 60_000, &[]).unwrap().unwrap();
        task.not_before_ms = 5_000;
        task.locked_until_ms = 0;
        store.reschedule_task(seq, &task).unwrap();

        assert!(store.claim_next(4_999, 60_000, &[]).unwrap().is_none());
        assert!(store.claim_next(5_000, 60_000, &[]).unwrap().is_some());
    }

    #[test]
    fn stale_turns_lose_the_optimistic_race() {
        let (_dir, store) = open();
        let id = "photo_upload_cafe01";
        store.create_execution(record(id), turn_task(id)).unwrap();
        let (seq, _task) = store.claim_next(1_000, 60_000, &[]).unwrap().unwrap();

        // Both "turns" loaded history at length 1. The first wins.
        let applied = store
            .apply_outcome(
                seq,
                id,
                vec![HistoryEvent::ExecutionCompleted],
                Some(ExecutionState::Completed),
                vec![],
                Some(1),
                2_000,
            )
            .unwrap();
        assert!(applied);

        // A second outcome based on the same stale length is discarded.
        let (seq2, _) = {
            // Re-arm a task to have something to complete against.
            let task = turn_task(id);
            store.reschedule_task(seq, &task).unwrap();
            store.claim_next(3_000, 60_000, &[]).unwrap().unwrap()
        };
        let applied = store
            .apply_outcome(
                seq2,
                id,
                vec![HistoryEvent::ExecutionCompleted],
                None,
                vec![WorkItem::RunTurn],
                Some(1),
                3_000,
            )
            .unwrap();
        assert!(!applied);

        let record = store.load_execution(id).unwrap().unwrap();
        assert_eq!(record.history.len(), 2);
        // The discarded outcome enqueued nothing.
        assert_eq!(store.queue_len().unwrap(), 0);
    }

    #[test]
    fn apply_outcome_appends_and_enqueues_atomically() {
        let (_dir, store) = open();
        let id = "photo_upload_cafe01";
        store.create_execution(record(id), turn_task(id)).unwrap();
        let (seq, _task) = store.claim_next(1_000, 60_000, &[]).unwrap().unwrap();

        store
            .apply_outcome(
                seq,
                id,
                vec![HistoryEvent::ExecutionCompleted],
                Some(ExecutionState::Completed),
                vec![WorkItem::RunTurn, WorkItem::RunTurn],
                None,
                2_000,
            )
            .unwrap();

        let record = store.load_execution(id).unwrap().unwrap();
        assert_eq!(record.state, ExecutionState::Completed);
        assert_eq!(record.history.len(), 2);
        assert_eq!(record.updated_ms, 2_000);
        assert_eq!(store.queue_len().unwrap(), 2);
    }
}
