//! Shared helpers for runtime integration tests.
#![allow(dead_code)]
use std::time::Duration;

use windlass::runtime::OrchestrationStatus;
use windlass::WorkflowClient;

/// Starts are asynchronous: the instance exists only once the dispatcher has
/// applied the start item. Retry control-plane calls until it is visible.
pub async fn wait_until_visible(client: &WorkflowClient, instance: &str) {
    for _ in 0..500 {
        if client.get_orchestration_status(instance).await != OrchestrationStatus::NotFound {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("instance '{instance}' never became visible");
}

pub async fn raise_when_ready(client: &WorkflowClient, instance: &str, name: &str, data: &str) {
    wait_until_visible(client, instance).await;
    client
        .raise_event(instance, name, data)
        .await
        .unwrap_or_else(|e| panic!("raise_event({name}) failed: {e}"));
}

/// Poll until the custom status satisfies `pred`.
pub async fn wait_for_custom_status(
    client: &WorkflowClient,
    instance: &str,
    pred: impl Fn(&str) -> bool,
) {
    for _ in 0..500 {
        if let Some(status) = client.get_status(instance).await.custom_status {
            if pred(&status) {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("instance '{instance}' never reached the expected custom status");
}
