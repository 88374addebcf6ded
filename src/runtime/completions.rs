//! Mapping queued completion messages onto history events.
//!
//! Redelivered items and duplicates from racing dispatch are harmless: the
//! provider's append dedupes correlated events, and this module drops items
//! that no longer make sense (stale execution id, unknown correlation id).
use crate::providers::WorkItem;
use crate::Event;

/// Outcome of examining one inbox message against current history.
pub(crate) enum CompletionEffect {
    /// Append this event, then ack.
    Append(Event),
    /// Nothing to record (duplicate or stale); ack and move on.
    Ignore,
}

/// Decide how a queued item affects the given execution's history.
pub(crate) fn completion_effect(
    history: &[Event],
    current_execution_id: u64,
    item: &WorkItem,
) -> CompletionEffect {
    match item {
        WorkItem::ActivityCompleted {
            execution_id,
            id,
            result,
            ..
        } => {
            if *execution_id != current_execution_id {
                return CompletionEffect::Ignore;
            }
            if !has_open_activity(history, *id) {
                return CompletionEffect::Ignore;
            }
            CompletionEffect::Append(Event::ActivityCompleted {
                id: *id,
                result: result.clone(),
            })
        }
        WorkItem::ActivityFailed {
            execution_id,
            id,
            error,
            ..
        } => {
            if *execution_id != current_execution_id {
                return CompletionEffect::Ignore;
            }
            if !has_open_activity(history, *id) {
                return CompletionEffect::Ignore;
            }
            CompletionEffect::Append(Event::ActivityFailed {
                id: *id,
                error: error.clone(),
            })
        }
        WorkItem::TimerFired {
            execution_id,
            id,
            fire_at_ms,
            ..
        } => {
            if *execution_id != current_execution_id {
                return CompletionEffect::Ignore;
            }
            let created = history
                .iter()
                .any(|e| matches!(e, Event::TimerCreated { id: tid, .. } if tid == id));
            let fired = history
                .iter()
                .any(|e| matches!(e, Event::TimerFired { id: tid, .. } if tid == id));
            if !created || fired {
                return CompletionEffect::Ignore;
            }
            CompletionEffect::Append(Event::TimerFired {
                id: *id,
                fire_at_ms: *fire_at_ms,
            })
        }
        // External events are recorded whenever the execution is running,
        // subscription or not: an event raised before the wait is queued in
        // history and consumed by a later subscription to the same name.
        WorkItem::ExternalRaised { name, data, .. } => CompletionEffect::Append(Event::ExternalEvent {
            name: name.clone(),
            data: data.clone(),
        }),
        WorkItem::TerminateRequested { reason, .. } => {
            CompletionEffect::Append(Event::OrchestrationTerminated {
                reason: reason.clone(),
            })
        }
        // Lifecycle and dispatch items never reach an instance inbox.
        _ => CompletionEffect::Ignore,
    }
}

fn has_open_activity(history: &[Event], id: u64) -> bool {
    let scheduled = history
        .iter()
        .any(|e| matches!(e, Event::ActivityScheduled { id: aid, .. } if *aid == id));
    let completed = history.iter().any(|e| {
        matches!(e, Event::ActivityCompleted { id: aid, .. } | Event::ActivityFailed { id: aid, .. } if *aid == id)
    });
    scheduled && !completed
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scheduled(id: u64) -> Event {
        Event::ActivityScheduled {
            id,
            name: "A".into(),
            input: String::new(),
        }
    }

    #[test]
    fn stale_execution_completions_are_ignored() {
        let history = vec![scheduled(1)];
        let item = WorkItem::ActivityCompleted {
            instance: "i".into(),
            execution_id: 1,
            id: 1,
            result: "old".into(),
        };
        assert!(matches!(
            completion_effect(&history, 2, &item),
            CompletionEffect::Ignore
        ));
        assert!(matches!(
            completion_effect(&history, 1, &item),
            CompletionEffect::Append(_)
        ));
    }

    #[test]
    fn duplicate_activity_completion_is_ignored() {
        let history = vec![
            scheduled(1),
            Event::ActivityCompleted {
                id: 1,
                result: "r".into(),
            },
        ];
        let item = WorkItem::ActivityFailed {
            instance: "i".into(),
            execution_id: 1,
            id: 1,
            error: "late".into(),
        };
        assert!(matches!(
            completion_effect(&history, 1, &item),
            CompletionEffect::Ignore
        ));
    }

    #[test]
    fn external_event_is_recorded_without_subscription() {
        let item = WorkItem::ExternalRaised {
            instance: "i".into(),
            name: "Go".into(),
            data: "d".into(),
        };
        assert!(matches!(
            completion_effect(&[], 1, &item),
            CompletionEffect::Append(Event::ExternalEvent { .. })
        ));
    }
}
