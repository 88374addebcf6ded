//! History providers: durable storage for instance histories plus the three
//! peek-lock work queues the runtime drains.
//!
//! A provider is the only stateful component in the system. Everything the
//! runtime does, from scheduling and completions to continue-as-new rollover
//! and crash recovery, reduces to ordered appends against an execution's history and
//! peek-lock transfers through the `Orchestrator`, `Worker` and `Timer`
//! queues. Appends are idempotent for correlated events, so redelivered work
//! items change nothing.
use std::collections::HashSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::Event;

pub mod fs;
pub mod in_memory;

pub use fs::FsHistoryStore;
pub use in_memory::InMemoryHistoryStore;

/// Hard cap on events per execution. Continue-as-new exists precisely so
/// well-behaved programs never approach this.
pub const MAX_HISTORY_EVENTS: usize = 10_000;

/// Messages moved through provider queues between dispatchers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum WorkItem {
    /// Create and start a new instance (orchestrator queue).
    StartOrchestration {
        instance: String,
        orchestration: String,
        input: String,
    },
    /// Run one activity invocation (worker queue).
    ActivityExecute {
        instance: String,
        execution_id: u64,
        id: u64,
        name: String,
        input: String,
    },
    /// Activity result headed back to its instance (orchestrator queue).
    ActivityCompleted {
        instance: String,
        execution_id: u64,
        id: u64,
        result: String,
    },
    /// Activity error headed back to its instance (orchestrator queue).
    ActivityFailed {
        instance: String,
        execution_id: u64,
        id: u64,
        error: String,
    },
    /// Arm a durable timer (timer queue).
    TimerSchedule {
        instance: String,
        execution_id: u64,
        id: u64,
        fire_at_ms: u64,
    },
    /// Timer deadline reached (orchestrator queue).
    TimerFired {
        instance: String,
        execution_id: u64,
        id: u64,
        fire_at_ms: u64,
    },
    /// External event raised against an instance (orchestrator queue).
    ExternalRaised {
        instance: String,
        name: String,
        data: String,
    },
    /// Terminate an instance (orchestrator queue).
    TerminateRequested { instance: String, reason: String },
}

impl WorkItem {
    /// Instance this item belongs to.
    pub fn instance(&self) -> &str {
        match self {
            WorkItem::StartOrchestration { instance, .. }
            | WorkItem::ActivityExecute { instance, .. }
            | WorkItem::ActivityCompleted { instance, .. }
            | WorkItem::ActivityFailed { instance, .. }
            | WorkItem::TimerSchedule { instance, .. }
            | WorkItem::TimerFired { instance, .. }
            | WorkItem::ExternalRaised { instance, .. }
            | WorkItem::TerminateRequested { instance, .. } => instance,
        }
    }
}

/// The three queues a provider maintains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    /// Instance lifecycle and completion messages.
    Orchestrator,
    /// Activity invocations.
    Worker,
    /// Timer arming requests.
    Timer,
}

/// Durable storage contract for histories, instance metadata and work queues.
///
/// `append*` must be atomic and ordered, reject appends past a terminal event
/// (terminal states are absorbing) and deduplicate correlated events so that
/// at-least-once delivery upstream still yields exactly-once history effects.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Read the latest execution's history (empty if unknown instance).
    async fn read(&self, instance: &str) -> Vec<Event>;

    /// Read one specific execution's history.
    async fn read_with_execution(&self, instance: &str, execution_id: u64) -> Vec<Event>;

    /// Append to the latest execution.
    async fn append(&self, instance: &str, new_events: Vec<Event>) -> Result<(), String>;

    /// Append to one specific execution.
    async fn append_with_execution(
        &self,
        instance: &str,
        execution_id: u64,
        new_events: Vec<Event>,
    ) -> Result<(), String>;

    /// Register an instance with an empty first execution. Errors if it
    /// already exists.
    async fn create_instance(&self, instance: &str) -> Result<(), String>;

    /// Remove an instance and all its executions.
    async fn remove_instance(&self, instance: &str) -> Result<(), String>;

    /// All known instance ids.
    async fn list_instances(&self) -> Vec<String>;

    /// Latest execution id for an instance, if it exists.
    async fn latest_execution_id(&self, instance: &str) -> Option<u64>;

    /// All execution ids for an instance, ascending.
    async fn list_executions(&self, instance: &str) -> Vec<u64>;

    /// Start the next execution for continue-as-new: allocates the next
    /// execution id and seeds it with `OrchestrationStarted`.
    async fn create_new_execution(
        &self,
        instance: &str,
        orchestration: &str,
        input: &str,
    ) -> Result<u64, String>;

    /// Last custom status payload set by the instance, if any.
    async fn read_custom_status(&self, instance: &str) -> Option<String>;

    /// Persist the custom status payload (metadata, not history).
    async fn write_custom_status(&self, instance: &str, status: &str) -> Result<(), String>;

    /// Enqueue a work item.
    async fn enqueue_work(&self, kind: QueueKind, item: WorkItem) -> Result<(), String>;

    /// Dequeue under a peek lock: the item stays invisible until acked or
    /// abandoned. Returns the item and its lock token.
    async fn dequeue_peek_lock(&self, kind: QueueKind) -> Option<(WorkItem, String)>;

    /// Permanently remove a locked item.
    async fn ack(&self, kind: QueueKind, token: &str) -> Result<(), String>;

    /// Return a locked item to the queue for redelivery.
    async fn abandon(&self, kind: QueueKind, token: &str) -> Result<(), String>;

    /// Human-readable dump of all histories, for debugging and tests.
    async fn dump_all_pretty(&self) -> String {
        let mut out = String::new();
        for instance in self.list_instances().await {
            out.push_str(&format!("== {instance}\n"));
            for exec in self.list_executions(&instance).await {
                out.push_str(&format!("-- execution {exec}\n"));
                for ev in self.read_with_execution(&instance, exec).await {
                    out.push_str(&format!("   {ev:?}\n"));
                }
            }
        }
        out
    }
}

/// Shared append semantics: dedupe correlated events, refuse writes past a
/// terminal event, enforce the capacity cap. Returns the events to actually
/// append.
pub(crate) fn filter_append(
    instance: &str,
    existing: &[Event],
    new_events: Vec<Event>,
) -> Result<Vec<Event>, String> {
    let mut terminal = existing.iter().any(Event::is_terminal);
    let mut seen: HashSet<(u8, u64)> = existing.iter().filter_map(dedupe_key).collect();
    let mut accepted = Vec::with_capacity(new_events.len());
    for ev in new_events {
        if terminal {
            // Terminal states are absorbing; late arrivals are dropped.
            continue;
        }
        if let Some(key) = dedupe_key(&ev) {
            if !seen.insert(key) {
                continue;
            }
        }
        terminal = ev.is_terminal();
        accepted.push(ev);
    }
    // Terminal events do not count against the cap: an instance at capacity
    // must still be able to record how it ended.
    let non_terminal = accepted.iter().filter(|e| !e.is_terminal()).count();
    if existing.len() + non_terminal > MAX_HISTORY_EVENTS {
        return Err(format!(
            "history for '{instance}' would exceed {MAX_HISTORY_EVENTS} events"
        ));
    }
    Ok(accepted)
}

fn dedupe_key(ev: &Event) -> Option<(u8, u64)> {
    match ev {
        Event::ActivityScheduled { id, .. } => Some((0, *id)),
        Event::ActivityCompleted { id, .. } | Event::ActivityFailed { id, .. } => Some((1, *id)),
        Event::TimerCreated { id, .. } => Some((2, *id)),
        Event::TimerFired { id, .. } => Some((3, *id)),
        Event::ExternalSubscribed { id, .. } => Some((4, *id)),
        Event::SystemCall { id, .. } => Some((5, *id)),
        // Start, terminal and external-raised events carry no correlation id.
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_completions_are_dropped() {
        let existing = vec![
            Event::OrchestrationStarted {
                name: "O".into(),
                input: String::new(),
                started_at_ms: 0,
            },
            Event::ActivityScheduled {
                id: 1,
                name: "A".into(),
                input: String::new(),
            },
        ];
        let accepted = filter_append(
            "i",
            &existing,
            vec![
                Event::ActivityCompleted {
                    id: 1,
                    result: "r".into(),
                },
                Event::ActivityCompleted {
                    id: 1,
                    result: "r".into(),
                },
                Event::ActivityFailed {
                    id: 1,
                    error: "late".into(),
                },
            ],
        )
        .unwrap();
        assert_eq!(
            accepted,
            vec![Event::ActivityCompleted {
                id: 1,
                result: "r".into()
            }]
        );
    }

    #[test]
    fn appends_after_terminal_are_dropped() {
        let existing = vec![Event::OrchestrationCompleted { output: "x".into() }];
        let accepted = filter_append(
            "i",
            &existing,
            vec![Event::ExternalEvent {
                name: "e".into(),
                data: "d".into(),
            }],
        )
        .unwrap();
        assert!(accepted.is_empty());
    }

    #[test]
    fn terminal_events_land_even_at_capacity() {
        let mut existing = vec![Event::OrchestrationStarted {
            name: "O".into(),
            input: String::new(),
            started_at_ms: 0,
        }];
        existing.extend((1..MAX_HISTORY_EVENTS).map(|i| Event::ExternalEvent {
            name: "e".into(),
            data: i.to_string(),
        }));
        assert_eq!(existing.len(), MAX_HISTORY_EVENTS);

        let err = filter_append(
            "i",
            &existing,
            vec![Event::ExternalEvent {
                name: "e".into(),
                data: "over".into(),
            }],
        );
        assert!(err.is_err());

        let accepted = filter_append(
            "i",
            &existing,
            vec![Event::OrchestrationFailed {
                error: "too big".into(),
            }],
        )
        .unwrap();
        assert_eq!(accepted.len(), 1);
    }

    #[test]
    fn external_raises_are_never_deduped() {
        let accepted = filter_append(
            "i",
            &[],
            vec![
                Event::ExternalEvent {
                    name: "e".into(),
                    data: "1".into(),
                },
                Event::ExternalEvent {
                    name: "e".into(),
                    data: "1".into(),
                },
            ],
        )
        .unwrap();
        assert_eq!(accepted.len(), 2);
    }
}
