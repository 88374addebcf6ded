//! Per-instance inboxes. The orchestration dispatcher owns the provider
//! queue; messages destined for a live instance task flow through its inbox
//! so replay passes see completion batches, not interleaved singletons.
use std::collections::HashMap;

use tokio::sync::{mpsc, Mutex};

use crate::providers::WorkItem;

/// One queued message plus the provider lock token to ack after its effect
/// is durably appended.
#[derive(Debug)]
pub(crate) struct InstanceMsg {
    pub item: WorkItem,
    pub token: String,
}

#[derive(Default)]
pub(crate) struct InstanceRouter {
    inboxes: Mutex<HashMap<String, mpsc::UnboundedSender<InstanceMsg>>>,
}

impl InstanceRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an inbox for `instance` if none is live. Returns the receiver
    /// when a new task must be spawned.
    pub async fn ensure(&self, instance: &str) -> Option<mpsc::UnboundedReceiver<InstanceMsg>> {
        let mut inboxes = self.inboxes.lock().await;
        if let Some(tx) = inboxes.get(instance) {
            if !tx.is_closed() {
                return None;
            }
        }
        let (tx, rx) = mpsc::unbounded_channel();
        inboxes.insert(instance.to_string(), tx);
        Some(rx)
    }

    /// Route a message to a live instance task. On failure the message comes
    /// back so the caller can abandon its token for redelivery.
    pub async fn send(&self, instance: &str, msg: InstanceMsg) -> Result<(), InstanceMsg> {
        let inboxes = self.inboxes.lock().await;
        match inboxes.get(instance) {
            Some(tx) => tx.send(msg).map_err(|e| e.0),
            None => Err(msg),
        }
    }

    /// Drop the inbox registration; called by the instance task itself before
    /// it dehydrates or exits, so no send can race past it.
    pub async fn unregister(&self, instance: &str) {
        self.inboxes.lock().await.remove(instance);
    }
}
