//! The photo-upload workflow definition: a pure decision function over the
//! recorded history. Re-running it against the same history always yields
//! the same commands, which is what makes crash-replay safe.

use std::collections::BTreeMap;

use crate::models::photo::{PhotoId, PhotoUploadInput, PreviewSize};
use crate::workflow::activities::{ActivityCommand, ActivityResult};
use crate::workflow::store::{ExecutionRecord, ExecutionState, HistoryEvent, WorkItem};

pub const WORKFLOW_ID_PREFIX: &str = "photo_upload_";

/// Fixed invocation numbering inside one execution. The previews fan out,
/// metadata and persist are strictly ordered after them.
const PREVIEW_INVOCATIONS: [(u32, PreviewSize); 3] = [
    (1, PreviewSize::Small),
    (2, PreviewSize::Medium),
    (3, PreviewSize::Large),
];
const METADATA_INVOCATION: u32 = 4;
const PERSIST_INVOCATION: u32 = 5;

pub fn execution_id_for(photo_id: &PhotoId) -> String {
    format!("{WORKFLOW_ID_PREFIX}{photo_id}")
}

/// What one decision turn wants committed: history events, a state change,
/// and tasks to enqueue. Empty means the turn observed in-flight work and
/// has nothing to do yet.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct TurnOutcome {
    pub events: Vec<HistoryEvent>,
    pub state: Option<ExecutionState>,
    pub enqueue: Vec<WorkItem>,
}

impl TurnOutcome {
    fn schedule(&mut self, invocation: u32, command: ActivityCommand) {
        self.events.push(HistoryEvent::ActivityScheduled {
            invocation,
            command: command.clone(),
        });
        self.enqueue.push(WorkItem::RunActivity {
            invocation,
            command,
            attempt: 0,
        });
    }
}

/// Folded view of an execution's history.
struct HistoryView<'a> {
    input: Option<&'a PhotoUploadInput>,
    scheduled: BTreeMap<u32, &'a ActivityCommand>,
    completed: BTreeMap<u32, &'a ActivityResult>,
    failed: BTreeMap<u32, &'a str>,
    terminal: bool,
}

fn fold(history: &[HistoryEvent]) -> HistoryView<'_> {
    let mut view = HistoryView {
        input: None,
        scheduled: BTreeMap::new(),
        completed: BTreeMap::new(),
        failed: BTreeMap::new(),
        terminal: false,
    };
    for event in history {
        match event {
            HistoryEvent::ExecutionStarted { input } => view.input = Some(input),
            HistoryEvent::ActivityScheduled {
                invocation,
                command,
            } => {
                view.scheduled.entry(*invocation).or_insert(command);
            }
            HistoryEvent::ActivityCompleted { invocation, result } => {
                view.completed.entry(*invocation).or_insert(result);
            }
            HistoryEvent::ActivityFailed {
                invocation, error, ..
            } => {
                view.failed.entry(*invocation).or_insert(error.as_str());
            }
            HistoryEvent::ExecutionCompleted | HistoryEvent::ExecutionFailed { .. } => {
                view.terminal = true;
            }
        }
    }
    view
}

/// Decide the next step of a photo-upload execution from its history.
pub fn decide(record: &ExecutionRecord) -> TurnOutcome {
    let view = fold(&record.history);
    let mut outcome = TurnOutcome::default();

    // A terminal execution ignores stray turns (late completions of
    // already-doomed activities enqueue turns too).
    if view.terminal {
        return outcome;
    }

    // Any exhausted activity dooms the whole execution: a partial preview
    // set is not servable.
    if let Some((invocation, error)) = view.failed.iter().next() {
        outcome.events.push(HistoryEvent::ExecutionFailed {
            reason: format!("activity {invocation} exhausted retries: {error}"),
        });
        outcome.state = Some(ExecutionState::Failed);
        return outcome;
    }

    let input = match view.input {
        Some(input) => input,
        None => {
            outcome.events.push(HistoryEvent::ExecutionFailed {
                reason: "history has no ExecutionStarted event".to_string(),
            });
            outcome.state = Some(ExecutionState::Failed);
            return outcome;
        }
    };

    // Fan out the three preview renditions concurrently.
    if view.scheduled.is_empty() {
        for (invocation, size) in PREVIEW_INVOCATIONS {
            outcome.schedule(
                invocation,
                ActivityCommand::GeneratePreview {
                    photo_id: input.photo_id,
                    size,
                    original_object: input.original_object.clone(),
                },
            );
        }
        outcome.state = Some(ExecutionState::PreviewsPending);
        return outcome;
    }

    let previews_done = PREVIEW_INVOCATIONS
        .iter()
        .all(|(invocation, _)| view.completed.contains_key(invocation));

    if previews_done && !view.scheduled.contains_key(&METADATA_INVOCATION) {
        outcome.schedule(
            METADATA_INVOCATION,
            ActivityCommand::ExtractMetadata {
                photo_id: input.photo_id,
                original_object: input.original_object.clone(),
            },
        );
        outcome.state = Some(ExecutionState::MetadataPending);
        return outcome;
    }

    if !view.scheduled.contains_key(&PERSIST_INVOCATION) {
        if let Some(result) = view.completed.get(&METADATA_INVOCATION) {
            if let ActivityResult::Metadata(probe) = *result {
                outcome.schedule(
                    PERSIST_INVOCATION,
                    ActivityCommand::WriteCatalogRow {
                        photo_id: input.photo_id,
                        original_name: input.original_name.clone(),
                        probe: probe.clone(),
                    },
                );
                outcome.state = Some(ExecutionState::Persisting);
                return outcome;
            }
        }
    }

    if view.completed.contains_key(&PERSIST_INVOCATION) {
        outcome.events.push(HistoryEvent::ExecutionCompleted);
        outcome.state = Some(ExecutionState::Completed);
        return outcome;
    }

    // Activities still in flight; the turns their completions enqueue will
    // carry the execution forward.
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::photo::{CameraMetadata, PhotoProbe};
    use crate::utils::now_ms;

    fn input() -> PhotoUploadInput {
        PhotoUploadInput {
            photo_id: PhotoId::from("deadbeef").unwrap(),
            original_name: "cat.jpg".to_string(),
            original_object: "original.jpg".to_string(),
        }
    }

    fn record(history: Vec<HistoryEvent>) -> ExecutionRecord {
        ExecutionRecord {
            execution_id: execution_id_for(&input().photo_id),
            state: ExecutionState::Started,
            history,
            created_ms: now_ms(),
            updated_ms: now_ms(),
        }
    }

    fn probe() -> PhotoProbe {
        PhotoProbe {
            width: 640,
            height: 480,
            blur_hash: "LKO2?U%2Tw=w]~RBVZRi};RPxuwH".to_string(),
            camera: CameraMetadata::default(),
        }
    }

    #[test]
    fn first_turn_fans_out_three_previews() {
        let record = record(vec![HistoryEvent::ExecutionStarted { input: input() }]);
        let outcome = decide(&record);

        assert_eq!(outcome.state, Some(ExecutionState::PreviewsPending));
        assert_eq!(outcome.enqueue.len(), 3);
        let widths: Vec<u32> = outcome
            .enqueue
            .iter()
            .map(|item| match item {
                WorkItem::RunActivity {
                    command: ActivityCommand::GeneratePreview { size, .. },
                    ..
                } => size.target_width(),
                other => panic!("unexpected work item: {other:?}"),
            })
            .collect();
        assert_eq!(widths, vec![300, 768, 1920]);
    }

    #[test]
    fn metadata_waits_for_every_preview() {
        let base = record(vec![HistoryEvent::ExecutionStarted { input: input() }]);
        let mut history = base.history.clone();
        let first = decide(&base);
        history.extend(first.events);

        // Two of three previews done: nothing new to schedule.
        for invocation in [1, 2] {
            history.push(HistoryEvent::ActivityCompleted {
                invocation,
                result: ActivityResult::PreviewStored {
                    size: PreviewSize::Small,
                },
            });
        }
        let outcome = decide(&record(history.clone()));
        assert_eq!(outcome, TurnOutcome::default());

        // Third completes: metadata gets scheduled exactly once.
        history.push(HistoryEvent::ActivityCompleted {
            invocation: 3,
            result: ActivityResult::PreviewStored {
                size: PreviewSize::Large,
            },
        });
        let outcome = decide(&record(history));
        assert_eq!(outcome.state, Some(ExecutionState::MetadataPending));
        assert_eq!(outcome.enqueue.len(), 1);
    }

    #[test]
    fn metadata_result_feeds_the_catalog_write() {
        let base = record(vec![HistoryEvent::ExecutionStarted { input: input() }]);
        let mut history = base.history.clone();
        history.extend(decide(&base).events);
        for invocation in [1, 2, 3] {
            history.push(HistoryEvent::ActivityCompleted {
                invocation,
                result: ActivityResult::PreviewStored {
                    size: PreviewSize::Small,
                },
            });
        }
        history.extend(decide(&record(history.clone())).events);
        history.push(HistoryEvent::ActivityCompleted {
            invocation: METADATA_INVOCATION,
            result: ActivityResult::Metadata(probe()),
        });

        let outcome = decide(&record(history));
        assert_eq!(outcome.state, Some(ExecutionState::Persisting));
        match &outcome.enqueue[0] {
            WorkItem::RunActivity {
                command: ActivityCommand::WriteCatalogRow { probe: carried, .. },
                ..
            } => assert_eq!(carried.width, 640),
            other => panic!("unexpected work item: {other:?}"),
        }
    }

    #[test]
    fn one_exhausted_activity_fails_the_execution() {
        let base = record(vec![HistoryEvent::ExecutionStarted { input: input() }]);
        let mut history = base.history.clone();
        history.extend(decide(&base).events);
        history.push(HistoryEvent::ActivityFailed {
            invocation: 2,
            error: "all decoders failed".to_string(),
            attempts: 6,
        });

        let outcome = decide(&record(history.clone()));
        assert_eq!(outcome.state, Some(ExecutionState::Failed));

        // Once terminal, further turns are no-ops.
        history.extend(outcome.events);
        assert_eq!(decide(&record(history)), TurnOutcome::default());
    }

    #[test]
    fn replaying_an_identical_history_is_deterministic() {
        let record = record(vec![HistoryEvent::ExecutionStarted { input: input() }]);
        assert_eq!(decide(&record), decide(&record));
    }
}
