//! Store-only control plane. The client shares the provider with the
//! runtime but holds no runtime handle: every operation is an enqueue or a
//! read, so a client works from any process that can reach the store.
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::providers::{HistoryStore, QueueKind, WorkItem};
use crate::runtime::status::{
    get_orchestration_status, wait_for_orchestration, OrchestrationStatus, WaitError,
};
use crate::Event;

/// Returned by [`WorkflowClient::schedule`]; mirrors the check-status
/// response of the HTTP front-ends built on top of engines like this one.
#[derive(Debug, Clone, Serialize)]
pub struct StartReceipt {
    pub instance_id: String,
    pub status_uri: String,
}

/// Snapshot of an instance for status queries.
#[derive(Debug, Clone, Serialize)]
pub struct StatusResponse {
    pub runtime_status: String,
    pub custom_status: Option<String>,
    pub output: Option<String>,
}

#[derive(Clone)]
pub struct WorkflowClient {
    store: Arc<dyn HistoryStore>,
}

static SCHEDULE_SEQ: AtomicU64 = AtomicU64::new(0);

impl WorkflowClient {
    pub fn new(store: Arc<dyn HistoryStore>) -> Self {
        Self { store }
    }

    /// Start a new instance under a generated id.
    pub async fn schedule(
        &self,
        orchestration: &str,
        input: impl Into<String>,
    ) -> Result<StartReceipt, String> {
        let seq = SCHEDULE_SEQ.fetch_add(1, Ordering::Relaxed);
        let instance_id = format!("wf-{:x}-{seq:04x}", crate::wall_clock_ms());
        self.start_orchestration(&instance_id, orchestration, input)
            .await?;
        Ok(StartReceipt {
            status_uri: format!("/instances/{instance_id}"),
            instance_id,
        })
    }

    /// Start a new instance under a caller-chosen id.
    pub async fn start_orchestration(
        &self,
        instance: &str,
        orchestration: &str,
        input: impl Into<String>,
    ) -> Result<(), String> {
        if self.store.latest_execution_id(instance).await.is_some() {
            return Err(format!("instance '{instance}' already exists"));
        }
        self.store
            .enqueue_work(
                QueueKind::Orchestrator,
                WorkItem::StartOrchestration {
                    instance: instance.to_string(),
                    orchestration: orchestration.to_string(),
                    input: input.into(),
                },
            )
            .await
    }

    /// Typed variant of [`start_orchestration`](Self::start_orchestration).
    pub async fn start_orchestration_typed<In: Serialize>(
        &self,
        instance: &str,
        orchestration: &str,
        input: &In,
    ) -> Result<(), String> {
        use crate::_typed_codec::{Codec, Json};
        let payload = Json::encode(input)?;
        self.start_orchestration(instance, orchestration, payload).await
    }

    /// Raise an external event against a running instance. The event is
    /// queued even when no subscription is pending; a later wait on the same
    /// name consumes it. Events for terminal instances are absorbed.
    pub async fn raise_event(
        &self,
        instance: &str,
        name: &str,
        data: impl Into<String>,
    ) -> Result<(), String> {
        if self.store.latest_execution_id(instance).await.is_none() {
            return Err(format!("unknown instance '{instance}'"));
        }
        self.store
            .enqueue_work(
                QueueKind::Orchestrator,
                WorkItem::ExternalRaised {
                    instance: instance.to_string(),
                    name: name.to_string(),
                    data: data.into(),
                },
            )
            .await
    }

    /// Typed variant of [`raise_event`](Self::raise_event).
    pub async fn raise_event_typed<T: Serialize>(
        &self,
        instance: &str,
        name: &str,
        data: &T,
    ) -> Result<(), String> {
        use crate::_typed_codec::{Codec, Json};
        let payload = Json::encode(data)?;
        self.raise_event(instance, name, payload).await
    }

    /// Request termination. Terminal states are absorbing, so terminating a
    /// finished instance is a no-op.
    pub async fn terminate_instance(
        &self,
        instance: &str,
        reason: impl Into<String>,
    ) -> Result<(), String> {
        if self.store.latest_execution_id(instance).await.is_none() {
            return Err(format!("unknown instance '{instance}'"));
        }
        self.store
            .enqueue_work(
                QueueKind::Orchestrator,
                WorkItem::TerminateRequested {
                    instance: instance.to_string(),
                    reason: reason.into(),
                },
            )
            .await
    }

    /// Combined status snapshot: runtime status, custom status, output.
    pub async fn get_status(&self, instance: &str) -> StatusResponse {
        let status = get_orchestration_status(&self.store, instance).await;
        let custom_status = self.store.read_custom_status(instance).await;
        let output = match &status {
            OrchestrationStatus::Completed { output } => Some(output.clone()),
            OrchestrationStatus::Failed { error } => Some(error.clone()),
            OrchestrationStatus::Terminated { reason } => Some(reason.clone()),
            _ => None,
        };
        StatusResponse {
            runtime_status: status.as_str().to_string(),
            custom_status,
            output,
        }
    }

    pub async fn get_orchestration_status(&self, instance: &str) -> OrchestrationStatus {
        get_orchestration_status(&self.store, instance).await
    }

    pub async fn wait_for_orchestration(
        &self,
        instance: &str,
        timeout: Duration,
    ) -> Result<OrchestrationStatus, WaitError> {
        wait_for_orchestration(&self.store, instance, timeout).await
    }

    pub async fn list_instances(&self) -> Vec<String> {
        self.store.list_instances().await
    }

    pub async fn list_executions(&self, instance: &str) -> Vec<u64> {
        self.store.list_executions(instance).await
    }

    pub async fn get_execution_history(&self, instance: &str, execution_id: u64) -> Vec<Event> {
        self.store.read_with_execution(instance, execution_id).await
    }
}
