//! JSON-typed orchestration and activity I/O, and the generated-id start path.
mod common;

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use windlass::providers::{HistoryStore, InMemoryHistoryStore};
use windlass::runtime::{
    ActivityRegistry, OrchestrationRegistry, OrchestrationStatus, Runtime,
};
use windlass::{OrchestrationContext, WorkflowClient};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Order {
    sku: String,
    qty: u64,
    unit_price: u64,
}

async fn start_runtime() -> (Arc<Runtime>, WorkflowClient) {
    let store: Arc<dyn HistoryStore> = InMemoryHistoryStore::new();
    let activities = ActivityRegistry::builder()
        .register_typed("PriceOrder", |order: Order| async move {
            Ok::<u64, String>(order.qty * order.unit_price)
        })
        .build();
    let orchestrations = OrchestrationRegistry::builder()
        .register_typed("ApproveOrder", |ctx: OrchestrationContext, order: Order| async move {
            let total: u64 = ctx
                .schedule_activity_typed("PriceOrder", &order)
                .into_activity_typed()
                .await?;
            let approved: bool = ctx.schedule_wait("Approval").into_event_typed().await?;
            if approved {
                Ok::<u64, String>(total)
            } else {
                Err("rejected".to_string())
            }
        })
        .build();
    let rt = Runtime::start_with_store(store.clone(), activities, orchestrations).await;
    (rt, WorkflowClient::new(store))
}

#[tokio::test]
async fn typed_round_trip_through_activity_and_event() {
    let (rt, client) = start_runtime().await;
    let order = Order {
        sku: "widget".into(),
        qty: 3,
        unit_price: 10,
    };
    client
        .start_orchestration_typed("inst-typed", "ApproveOrder", &order)
        .await
        .unwrap();
    common::wait_until_visible(&client, "inst-typed").await;
    client
        .raise_event_typed("inst-typed", "Approval", &true)
        .await
        .unwrap();
    let status = client
        .wait_for_orchestration("inst-typed", Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(status, OrchestrationStatus::Completed { output: "30".into() });
    rt.shutdown().await;
}

#[tokio::test]
async fn schedule_returns_a_usable_receipt() {
    let (rt, client) = start_runtime().await;
    let order = Order {
        sku: "gadget".into(),
        qty: 1,
        unit_price: 5,
    };
    let payload = serde_json::to_string(&order).unwrap();
    let receipt = client.schedule("ApproveOrder", payload).await.unwrap();
    assert!(receipt.status_uri.contains(&receipt.instance_id));

    common::raise_when_ready(&client, &receipt.instance_id, "Approval", "false").await;
    let status = client
        .wait_for_orchestration(&receipt.instance_id, Duration::from_secs(5))
        .await
        .unwrap();
    match status {
        OrchestrationStatus::Failed { error } => assert!(error.contains("rejected")),
        other => panic!("expected rejection, got {other:?}"),
    }
    rt.shutdown().await;
}
