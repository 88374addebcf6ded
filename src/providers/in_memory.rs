//! In-memory provider used by tests and examples. Not durable; everything
//! lives in a single mutex-guarded state.
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{filter_append, HistoryStore, QueueKind, WorkItem};
use crate::Event;

#[derive(Default)]
struct State {
    /// instance -> execution id -> ordered history
    executions: HashMap<String, BTreeMap<u64, Vec<Event>>>,
    custom_status: HashMap<String, String>,
    queues: HashMap<QueueKind, VecDeque<(u64, WorkItem)>>,
    locked: HashMap<String, (QueueKind, WorkItem)>,
    next_seq: u64,
}

#[derive(Default)]
pub struct InMemoryHistoryStore {
    state: Mutex<State>,
}

impl InMemoryHistoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl HistoryStore for InMemoryHistoryStore {
    async fn read(&self, instance: &str) -> Vec<Event> {
        let state = self.state.lock().await;
        state
            .executions
            .get(instance)
            .and_then(|execs| execs.values().next_back())
            .cloned()
            .unwrap_or_default()
    }

    async fn read_with_execution(&self, instance: &str, execution_id: u64) -> Vec<Event> {
        let state = self.state.lock().await;
        state
            .executions
            .get(instance)
            .and_then(|execs| execs.get(&execution_id))
            .cloned()
            .unwrap_or_default()
    }

    async fn append(&self, instance: &str, new_events: Vec<Event>) -> Result<(), String> {
        let mut state = self.state.lock().await;
        let execs = state
            .executions
            .get_mut(instance)
            .ok_or_else(|| format!("unknown instance '{instance}'"))?;
        let latest = execs
            .keys()
            .next_back()
            .copied()
            .ok_or_else(|| format!("instance '{instance}' has no executions"))?;
        let history = execs.entry(latest).or_default();
        let accepted = filter_append(instance, history, new_events)?;
        history.extend(accepted);
        Ok(())
    }

    async fn append_with_execution(
        &self,
        instance: &str,
        execution_id: u64,
        new_events: Vec<Event>,
    ) -> Result<(), String> {
        let mut state = self.state.lock().await;
        let history = state
            .executions
            .get_mut(instance)
            .and_then(|execs| execs.get_mut(&execution_id))
            .ok_or_else(|| format!("unknown execution {execution_id} for '{instance}'"))?;
        let accepted = filter_append(instance, history, new_events)?;
        history.extend(accepted);
        Ok(())
    }

    async fn create_instance(&self, instance: &str) -> Result<(), String> {
        let mut state = self.state.lock().await;
        if state.executions.contains_key(instance) {
            return Err(format!("instance '{instance}' already exists"));
        }
        let mut execs = BTreeMap::new();
        execs.insert(crate::INITIAL_EXECUTION_ID, Vec::new());
        state.executions.insert(instance.to_string(), execs);
        Ok(())
    }

    async fn remove_instance(&self, instance: &str) -> Result<(), String> {
        let mut state = self.state.lock().await;
        state.executions.remove(instance);
        state.custom_status.remove(instance);
        Ok(())
    }

    async fn list_instances(&self) -> Vec<String> {
        let state = self.state.lock().await;
        let mut out: Vec<String> = state.executions.keys().cloned().collect();
        out.sort();
        out
    }

    async fn latest_execution_id(&self, instance: &str) -> Option<u64> {
        let state = self.state.lock().await;
        state
            .executions
            .get(instance)
            .and_then(|execs| execs.keys().next_back().copied())
    }

    async fn list_executions(&self, instance: &str) -> Vec<u64> {
        let state = self.state.lock().await;
        state
            .executions
            .get(instance)
            .map(|execs| execs.keys().copied().collect())
            .unwrap_or_default()
    }

    async fn create_new_execution(
        &self,
        instance: &str,
        orchestration: &str,
        input: &str,
    ) -> Result<u64, String> {
        let mut state = self.state.lock().await;
        let execs = state
            .executions
            .get_mut(instance)
            .ok_or_else(|| format!("unknown instance '{instance}'"))?;
        let next = execs.keys().next_back().copied().unwrap_or(0) + 1;
        execs.insert(
            next,
            vec![Event::OrchestrationStarted {
                name: orchestration.to_string(),
                input: input.to_string(),
                started_at_ms: crate::wall_clock_ms(),
            }],
        );
        Ok(next)
    }

    async fn read_custom_status(&self, instance: &str) -> Option<String> {
        let state = self.state.lock().await;
        state.custom_status.get(instance).cloned()
    }

    async fn write_custom_status(&self, instance: &str, status: &str) -> Result<(), String> {
        let mut state = self.state.lock().await;
        state
            .custom_status
            .insert(instance.to_string(), status.to_string());
        Ok(())
    }

    async fn enqueue_work(&self, kind: QueueKind, item: WorkItem) -> Result<(), String> {
        let mut state = self.state.lock().await;
        let seq = state.next_seq;
        state.next_seq += 1;
        state.queues.entry(kind).or_default().push_back((seq, item));
        Ok(())
    }

    async fn dequeue_peek_lock(&self, kind: QueueKind) -> Option<(WorkItem, String)> {
        let mut state = self.state.lock().await;
        let (seq, item) = state.queues.entry(kind).or_default().pop_front()?;
        let token = format!("{kind:?}-{seq}");
        state.locked.insert(token.clone(), (kind, item.clone()));
        Some((item, token))
    }

    async fn ack(&self, kind: QueueKind, token: &str) -> Result<(), String> {
        let mut state = self.state.lock().await;
        match state.locked.remove(token) {
            Some((k, _)) if k == kind => Ok(()),
            Some((k, item)) => {
                state.locked.insert(token.to_string(), (k, item));
                Err(format!("token '{token}' belongs to queue {k:?}"))
            }
            // Already acked; treat as idempotent.
            None => Ok(()),
        }
    }

    async fn abandon(&self, kind: QueueKind, token: &str) -> Result<(), String> {
        let mut state = self.state.lock().await;
        match state.locked.remove(token) {
            Some((k, item)) if k == kind => {
                let seq = state.next_seq;
                state.next_seq += 1;
                state.queues.entry(kind).or_default().push_back((seq, item));
                Ok(())
            }
            Some((k, item)) => {
                state.locked.insert(token.to_string(), (k, item));
                Err(format!("token '{token}' belongs to queue {k:?}"))
            }
            None => Ok(()),
        }
    }
}
