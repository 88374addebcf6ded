//! Per-instance execution task: replay pass, history delta append, action
//! dispatch, completion batching, continue-as-new rollover and dehydration.
//!
//! Ordering is the whole story here. Scheduling events are appended *before*
//! their work items are enqueued, and queue tokens are acked only *after*
//! their history effect is durable. A crash at any point therefore leaves
//! either a redeliverable item or a history the next activation can resume
//! from; the activation path re-dispatches anything scheduled but not yet
//! completed.
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};

use crate::providers::{HistoryStore, QueueKind, WorkItem};
use crate::runtime::completions::{completion_effect, CompletionEffect};
use crate::runtime::registry::OrchestrationRegistry;
use crate::runtime::router::{InstanceMsg, InstanceRouter};
use crate::{Action, Event, OrchestrationContext};

/// Idle period after which an instance task parks itself. Any later message
/// rehydrates it from history.
const DEHYDRATE_AFTER: Duration = Duration::from_millis(200);

fn started_fields(history: &[Event]) -> Option<(String, String)> {
    history.iter().find_map(|e| match e {
        Event::OrchestrationStarted { name, input, .. } => Some((name.clone(), input.clone())),
        _ => None,
    })
}

pub(crate) async fn run_instance(
    store: Arc<dyn HistoryStore>,
    router: Arc<InstanceRouter>,
    orchestrations: OrchestrationRegistry,
    instance: String,
    mut inbox: mpsc::UnboundedReceiver<InstanceMsg>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut first_activation = true;
    loop {
        if *shutdown.borrow() {
            park(&store, &router, &instance, &mut inbox, Park::Abandon).await;
            return;
        }
        let Some(mut execution_id) = store.latest_execution_id(&instance).await else {
            park(&store, &router, &instance, &mut inbox, Park::Abandon).await;
            return;
        };
        let mut history = store.read_with_execution(&instance, execution_id).await;

        // Heal a half-finished rollover: the terminal ContinuedAsNew was
        // appended but the next execution was never created.
        let rollover_input = match history.last() {
            Some(Event::OrchestrationContinuedAsNew { input }) => Some(input.clone()),
            _ => None,
        };
        if let Some(input) = rollover_input {
            let Some((name, _)) = started_fields(&history) else {
                park(&store, &router, &instance, &mut inbox, Park::Abandon).await;
                return;
            };
            match store.create_new_execution(&instance, &name, &input).await {
                Ok(next) => {
                    tracing::info!(target: "windlass::runtime", %instance, execution_id = next, "continue-as-new rollover");
                    execution_id = next;
                    history = store.read_with_execution(&instance, execution_id).await;
                }
                Err(e) => {
                    tracing::error!(target: "windlass::runtime", %instance, error = %e, "rollover failed");
                    park(&store, &router, &instance, &mut inbox, Park::Abandon).await;
                    return;
                }
            }
        }

        // Terminal states absorb everything still in flight.
        if history.iter().any(Event::is_terminal) {
            park(&store, &router, &instance, &mut inbox, Park::Ack).await;
            return;
        }

        let Some((name, input)) = started_fields(&history) else {
            // Start item must have been redelivered but not yet applied.
            park(&store, &router, &instance, &mut inbox, Park::Abandon).await;
            return;
        };

        let Some(handler) = orchestrations.get(&name) else {
            let fail = Event::OrchestrationFailed {
                error: format!("unregistered orchestration '{name}'"),
            };
            if let Err(e) = store
                .append_with_execution(&instance, execution_id, vec![fail])
                .await
            {
                tracing::error!(target: "windlass::runtime", %instance, error = %e, "failed to record missing handler");
            }
            continue;
        };

        // One replay pass. The program future lives only inside this block;
        // durable futures resolve synchronously from history under a no-op
        // waker, so a single poll is a full pass.
        let ctx = OrchestrationContext::new_with_meta(history.clone(), &instance, &name, execution_id);
        let polled = {
            let mut fut = handler.invoke(ctx.clone(), input.clone());
            crate::poll_once(fut.as_mut())
        };
        let outcome = crate::finish_turn(ctx, polled);

        if let Some(err) = outcome.nondeterminism {
            tracing::error!(target: "windlass::runtime", %instance, error = %err, "nondeterministic orchestration");
            let fail = Event::OrchestrationFailed { error: err };
            let _ = store
                .append_with_execution(&instance, execution_id, vec![fail])
                .await;
            continue;
        }

        if let Some(status) = &outcome.custom_status {
            if let Err(e) = store.write_custom_status(&instance, status).await {
                tracing::warn!(target: "windlass::runtime", %instance, error = %e, "failed to persist custom status");
            }
        }

        let delta: Vec<Event> = outcome.history[history.len()..].to_vec();

        // Continue-as-new preempts everything else decided this pass.
        let can_input = outcome.actions.iter().find_map(|a| match a {
            Action::ContinueAsNew { input } => Some(input.clone()),
            _ => None,
        });
        if let Some(next_input) = can_input {
            let mut events = delta;
            events.push(Event::OrchestrationContinuedAsNew { input: next_input });
            if let Err(e) = store
                .append_with_execution(&instance, execution_id, events)
                .await
            {
                tracing::error!(target: "windlass::runtime", %instance, error = %e, "failed to record continue-as-new");
            }
            continue;
        }

        if !delta.is_empty() {
            if let Err(e) = store
                .append_with_execution(&instance, execution_id, delta)
                .await
            {
                // Capacity or storage fault: fail the instance rather than
                // dispatch work whose scheduling was never recorded.
                let fail = Event::OrchestrationFailed { error: e };
                let _ = store
                    .append_with_execution(&instance, execution_id, vec![fail])
                    .await;
                continue;
            }
        }

        if first_activation {
            first_activation = false;
            // Covers both this pass's new actions and anything a previous
            // incarnation scheduled but never dispatched. Duplicate dispatch
            // is safe: completions dedupe at append.
            redispatch_pending(&store, &instance, execution_id, &outcome.history).await;
        } else {
            for action in &outcome.actions {
                dispatch_action(&store, &instance, execution_id, action).await;
            }
        }

        if let Some(result) = outcome.output {
            let terminal = match result {
                Ok(output) => Event::OrchestrationCompleted { output },
                Err(error) => Event::OrchestrationFailed { error },
            };
            if let Err(e) = store
                .append_with_execution(&instance, execution_id, vec![terminal])
                .await
            {
                tracing::error!(target: "windlass::runtime", %instance, error = %e, "failed to record terminal event");
            }
            continue;
        }

        // Suspended at an unresolved await: wait for completions.
        let first = tokio::select! {
            _ = shutdown.changed() => {
                park(&store, &router, &instance, &mut inbox, Park::Abandon).await;
                return;
            }
            msg = inbox.recv() => match msg {
                Some(m) => m,
                None => {
                    router.unregister(&instance).await;
                    return;
                }
            },
            _ = tokio::time::sleep(DEHYDRATE_AFTER) => {
                park(&store, &router, &instance, &mut inbox, Park::Abandon).await;
                return;
            }
        };

        let mut batch = vec![first];
        while let Ok(m) = inbox.try_recv() {
            batch.push(m);
        }

        let mut combined = store.read_with_execution(&instance, execution_id).await;
        let mut events = Vec::new();
        let mut tokens = Vec::new();
        for msg in batch {
            match completion_effect(&combined, execution_id, &msg.item) {
                CompletionEffect::Append(ev) => {
                    combined.push(ev.clone());
                    events.push(ev);
                }
                CompletionEffect::Ignore => {}
            }
            tokens.push(msg.token);
        }
        if !events.is_empty() {
            if let Err(e) = store
                .append_with_execution(&instance, execution_id, events)
                .await
            {
                tracing::warn!(target: "windlass::runtime", %instance, error = %e, "completion append failed, abandoning batch");
                for token in tokens {
                    let _ = store.abandon(QueueKind::Orchestrator, &token).await;
                }
                continue;
            }
        }
        // Effects are durable; release the queue items.
        for token in tokens {
            let _ = store.ack(QueueKind::Orchestrator, &token).await;
        }
    }
}

async fn dispatch_action(
    store: &Arc<dyn HistoryStore>,
    instance: &str,
    execution_id: u64,
    action: &Action,
) {
    let (kind, item) = match action {
        Action::CallActivity { id, name, input } => (
            QueueKind::Worker,
            WorkItem::ActivityExecute {
                instance: instance.to_string(),
                execution_id,
                id: *id,
                name: name.clone(),
                input: input.clone(),
            },
        ),
        Action::CreateTimer { id, fire_at_ms } => (
            QueueKind::Timer,
            WorkItem::TimerSchedule {
                instance: instance.to_string(),
                execution_id,
                id: *id,
                fire_at_ms: *fire_at_ms,
            },
        ),
        // Subscriptions live entirely in history; raises find them there.
        Action::WaitExternal { .. } => return,
        Action::ContinueAsNew { .. } => return,
    };
    if let Err(e) = store.enqueue_work(kind, item).await {
        tracing::error!(target: "windlass::runtime", %instance, error = %e, "failed to enqueue work");
    }
}

/// Enqueue work for every scheduled-but-uncompleted activity and timer.
async fn redispatch_pending(
    store: &Arc<dyn HistoryStore>,
    instance: &str,
    execution_id: u64,
    history: &[Event],
) {
    for ev in history {
        match ev {
            Event::ActivityScheduled { id, name, input } => {
                let done = history.iter().any(|e| {
                    matches!(e, Event::ActivityCompleted { id: cid, .. } | Event::ActivityFailed { id: cid, .. } if cid == id)
                });
                if !done {
                    dispatch_action(
                        store,
                        instance,
                        execution_id,
                        &Action::CallActivity {
                            id: *id,
                            name: name.clone(),
                            input: input.clone(),
                        },
                    )
                    .await;
                }
            }
            Event::TimerCreated { id, fire_at_ms } => {
                let fired = history
                    .iter()
                    .any(|e| matches!(e, Event::TimerFired { id: tid, .. } if tid == id));
                if !fired {
                    dispatch_action(
                        store,
                        instance,
                        execution_id,
                        &Action::CreateTimer {
                            id: *id,
                            fire_at_ms: *fire_at_ms,
                        },
                    )
                    .await;
                }
            }
            _ => {}
        }
    }
}

#[derive(Clone, Copy)]
enum Park {
    /// Absorb remaining messages (terminal instance).
    Ack,
    /// Return remaining messages for redelivery (dehydrate, shutdown).
    Abandon,
}

async fn park(
    store: &Arc<dyn HistoryStore>,
    router: &Arc<InstanceRouter>,
    instance: &str,
    inbox: &mut mpsc::UnboundedReceiver<InstanceMsg>,
    mode: Park,
) {
    // Unregister first so the dispatcher cannot send past the drain below.
    router.unregister(instance).await;
    while let Ok(msg) = inbox.try_recv() {
        let result = match mode {
            Park::Ack => store.ack(QueueKind::Orchestrator, &msg.token).await,
            Park::Abandon => store.abandon(QueueKind::Orchestrator, &msg.token).await,
        };
        if let Err(e) = result {
            tracing::warn!(target: "windlass::runtime", %instance, error = %e, "failed to release inbox token");
        }
    }
}
