//! Crash recovery: a second runtime over the same filesystem store must
//! resume instances from history, re-dispatching whatever was still pending.
mod common;

use std::sync::Arc;
use std::time::Duration;

use windlass::providers::{
    FsHistoryStore, HistoryStore, InMemoryHistoryStore, QueueKind, WorkItem,
};
use windlass::runtime::{
    ActivityRegistry, OrchestrationRegistry, OrchestrationStatus, Runtime,
};
use windlass::{Event, OrchestrationContext, WorkflowClient};

async fn delayed(ctx: OrchestrationContext, _input: String) -> Result<String, String> {
    ctx.schedule_timer(300).into_timer().await;
    Ok("woke".to_string())
}

async fn gate(ctx: OrchestrationContext, _input: String) -> Result<String, String> {
    ctx.set_custom_status("gated");
    let data = ctx.schedule_wait("Resume").into_event().await;
    Ok(format!("resume:{data}"))
}

fn orchestrations() -> OrchestrationRegistry {
    OrchestrationRegistry::builder()
        .register("Delayed", delayed)
        .register("Gate", gate)
        .build()
}

async fn wait_for_event(
    client: &WorkflowClient,
    instance: &str,
    pred: impl Fn(&Event) -> bool,
) {
    for _ in 0..500 {
        let history = client.get_execution_history(instance, 1).await;
        if history.iter().any(&pred) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("instance '{instance}' never recorded the expected event");
}

#[tokio::test]
async fn pending_timer_is_rearmed_after_restart() {
    let dir = tempfile::tempdir().unwrap();

    let store1: Arc<dyn HistoryStore> = FsHistoryStore::new(dir.path());
    let rt1 = Runtime::start_with_store(store1.clone(), ActivityRegistry::default(), orchestrations()).await;
    let client1 = WorkflowClient::new(store1);
    client1
        .start_orchestration("inst-rec-timer", "Delayed", "")
        .await
        .unwrap();
    // Stop as soon as the timer is durably scheduled; the armed in-process
    // heap dies with this runtime.
    wait_for_event(&client1, "inst-rec-timer", |e| {
        matches!(e, Event::TimerCreated { .. })
    })
    .await;
    rt1.shutdown().await;

    let store2: Arc<dyn HistoryStore> = FsHistoryStore::new(dir.path());
    let rt2 = Runtime::start_with_store(store2.clone(), ActivityRegistry::default(), orchestrations()).await;
    let client2 = WorkflowClient::new(store2);
    let status = client2
        .wait_for_orchestration("inst-rec-timer", Duration::from_secs(10))
        .await
        .unwrap();
    assert_eq!(
        status,
        OrchestrationStatus::Completed {
            output: "woke".into()
        }
    );
    rt2.shutdown().await;
}

#[tokio::test]
async fn redelivered_start_seeds_an_instance_left_empty_by_a_crash() {
    let store: Arc<dyn HistoryStore> = InMemoryHistoryStore::new();
    // The instance was created but the crash hit before its history was
    // seeded; the start item comes back around on the orchestrator queue.
    store.create_instance("inst-half-start").await.unwrap();
    store
        .enqueue_work(
            QueueKind::Orchestrator,
            WorkItem::StartOrchestration {
                instance: "inst-half-start".into(),
                orchestration: "Echo".into(),
                input: "x".into(),
            },
        )
        .await
        .unwrap();

    let orchestrations = OrchestrationRegistry::builder()
        .register("Echo", |_ctx: OrchestrationContext, input: String| async move {
            Ok::<String, String>(input)
        })
        .build();
    let rt =
        Runtime::start_with_store(store.clone(), ActivityRegistry::default(), orchestrations)
            .await;
    let client = WorkflowClient::new(store);
    let status = client
        .wait_for_orchestration("inst-half-start", Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(status, OrchestrationStatus::Completed { output: "x".into() });
    rt.shutdown().await;
}

#[tokio::test]
async fn subscription_and_custom_status_survive_restart() {
    let dir = tempfile::tempdir().unwrap();

    let store1: Arc<dyn HistoryStore> = FsHistoryStore::new(dir.path());
    let rt1 = Runtime::start_with_store(store1.clone(), ActivityRegistry::default(), orchestrations()).await;
    let client1 = WorkflowClient::new(store1);
    client1
        .start_orchestration("inst-rec-gate", "Gate", "")
        .await
        .unwrap();
    wait_for_event(&client1, "inst-rec-gate", |e| {
        matches!(e, Event::ExternalSubscribed { .. })
    })
    .await;
    rt1.shutdown().await;

    let store2: Arc<dyn HistoryStore> = FsHistoryStore::new(dir.path());
    let rt2 = Runtime::start_with_store(store2.clone(), ActivityRegistry::default(), orchestrations()).await;
    let client2 = WorkflowClient::new(store2);

    // Metadata written before the crash is still visible.
    let snapshot = client2.get_status("inst-rec-gate").await;
    assert_eq!(snapshot.runtime_status, "Running");
    assert_eq!(snapshot.custom_status.as_deref(), Some("gated"));

    client2
        .raise_event("inst-rec-gate", "Resume", "42")
        .await
        .unwrap();
    let status = client2
        .wait_for_orchestration("inst-rec-gate", Duration::from_secs(10))
        .await
        .unwrap();
    assert_eq!(
        status,
        OrchestrationStatus::Completed {
            output: "resume:42".into()
        }
    );
    rt2.shutdown().await;
}
