//! Provider-backed runtime: three queue dispatchers plus on-demand
//! per-instance execution tasks.
//!
//! The orchestration dispatcher drains the orchestrator queue and routes
//! items to instance inboxes, spawning (rehydrating) instance tasks as
//! needed. The worker dispatcher runs each activity on its own tokio task so
//! a blocked activity never stalls the queue. The timer dispatcher arms an
//! in-process min-heap and turns deadlines into orchestrator-queue fires.
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::providers::{HistoryStore, QueueKind, WorkItem};
use crate::Event;

mod completions;
mod execution;
pub mod registry;
mod router;
pub mod status;
mod timers;

pub use registry::{
    ActivityHandler, ActivityRegistry, ActivityRegistryBuilder, OrchestrationHandler,
    OrchestrationRegistry, OrchestrationRegistryBuilder,
};
pub use status::{
    get_orchestration_status, wait_for_orchestration, OrchestrationStatus, WaitError,
};

use router::{InstanceMsg, InstanceRouter};

const QUEUE_IDLE_POLL: Duration = Duration::from_millis(10);

pub struct Runtime {
    store: Arc<dyn HistoryStore>,
    activities: ActivityRegistry,
    orchestrations: OrchestrationRegistry,
    router: Arc<InstanceRouter>,
    shutdown_tx: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Runtime {
    /// Start dispatchers against `store` and re-activate every non-terminal
    /// instance found there (crash recovery).
    pub async fn start_with_store(
        store: Arc<dyn HistoryStore>,
        activities: ActivityRegistry,
        orchestrations: OrchestrationRegistry,
    ) -> Arc<Self> {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let rt = Arc::new(Self {
            store: store.clone(),
            activities,
            orchestrations,
            router: Arc::new(InstanceRouter::new()),
            shutdown_tx,
            handles: Mutex::new(Vec::new()),
        });

        let mut handles = Vec::new();
        handles.push(tokio::spawn(
            rt.clone().orchestration_dispatcher(shutdown_rx.clone()),
        ));
        handles.push(tokio::spawn(rt.clone().worker_dispatcher(shutdown_rx.clone())));
        handles.push(tokio::spawn(timers::run_timer_dispatcher(
            store.clone(),
            shutdown_rx,
        )));
        if let Ok(mut guard) = rt.handles.lock() {
            *guard = handles;
        }

        for instance in store.list_instances().await {
            let status = get_orchestration_status(&store, &instance).await;
            if !status.is_terminal() && status != OrchestrationStatus::NotFound {
                tracing::info!(target: "windlass::runtime", %instance, "re-activating instance");
                rt.activate(&instance).await;
            }
        }
        rt
    }

    /// Signal every dispatcher and instance task, then wait for the
    /// dispatchers to drain.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let handles = match self.handles.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(_) => Vec::new(),
        };
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// Enqueue a start for a new instance. The instance becomes visible once
    /// the orchestration dispatcher applies it.
    pub async fn start_orchestration(
        &self,
        instance: &str,
        orchestration: &str,
        input: impl Into<String>,
    ) -> Result<(), String> {
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

    /// Spawn the instance task if it is not already live.
    async fn activate(&self, instance: &str) {
        if let Some(inbox) = self.router.ensure(instance).await {
            tokio::spawn(execution::run_instance(
                self.store.clone(),
                self.router.clone(),
                self.orchestrations.clone(),
                instance.to_string(),
                inbox,
                self.shutdown_tx.subscribe(),
            ));
        }
    }

    async fn orchestration_dispatcher(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.store.dequeue_peek_lock(QueueKind::Orchestrator).await {
                Some((item, token)) => self.route_orchestrator_item(item, token).await,
                None => {
                    tokio::select! {
                        _ = shutdown.changed() => {}
                        _ = tokio::time::sleep(QUEUE_IDLE_POLL) => {}
                    }
                }
            }
        }
    }

    async fn route_orchestrator_item(&self, item: WorkItem, token: String) {
        match item {
            WorkItem::StartOrchestration {
                instance,
                orchestration,
                input,
            } => {
                if self.store.latest_execution_id(&instance).await.is_none() {
                    if let Err(e) = self.store.create_instance(&instance).await {
                        tracing::warn!(target: "windlass::runtime", %instance, error = %e, "create_instance failed");
                        let _ = self.store.abandon(QueueKind::Orchestrator, &token).await;
                        return;
                    }
                }
                // An existing but empty first execution means a redelivered
                // start whose seed append never landed; seed it now rather
                // than treating the item as a duplicate.
                if self.store.read(&instance).await.is_empty() {
                    let started = Event::OrchestrationStarted {
                        name: orchestration,
                        input,
                        started_at_ms: crate::wall_clock_ms(),
                    };
                    if let Err(e) = self
                        .store
                        .append_with_execution(&instance, crate::INITIAL_EXECUTION_ID, vec![started])
                        .await
                    {
                        tracing::error!(target: "windlass::runtime", %instance, error = %e, "failed to seed history");
                        let _ = self.store.abandon(QueueKind::Orchestrator, &token).await;
                        return;
                    }
                } else {
                    tracing::warn!(target: "windlass::runtime", %instance, "duplicate start ignored");
                }
                let _ = self.store.ack(QueueKind::Orchestrator, &token).await;
                self.activate(&instance).await;
            }
            item => {
                let instance = item.instance().to_string();
                if self.store.latest_execution_id(&instance).await.is_none() {
                    tracing::warn!(target: "windlass::runtime", %instance, ?item, "message for unknown instance dropped");
                    let _ = self.store.ack(QueueKind::Orchestrator, &token).await;
                    return;
                }
                self.activate(&instance).await;
                if let Err(msg) = self.router.send(&instance, InstanceMsg { item, token }).await {
                    // Task parked between activate and send; redeliver.
                    let _ = self.store.abandon(QueueKind::Orchestrator, &msg.token).await;
                }
            }
        }
    }

    async fn worker_dispatcher(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.store.dequeue_peek_lock(QueueKind::Worker).await {
                Some((
                    WorkItem::ActivityExecute {
                        instance,
                        execution_id,
                        id,
                        name,
                        input,
                    },
                    token,
                )) => {
                    let store = self.store.clone();
                    let activities = self.activities.clone();
                    // One task per invocation; a never-returning activity
                    // holds only its own token.
                    tokio::spawn(async move {
                        let completion = match activities.get(&name) {
                            Some(handler) => match handler.invoke(input).await {
                                Ok(result) => WorkItem::ActivityCompleted {
                                    instance,
                                    execution_id,
                                    id,
                                    result,
                                },
                                Err(error) => WorkItem::ActivityFailed {
                                    instance,
                                    execution_id,
                                    id,
                                    error,
                                },
                            },
                            None => WorkItem::ActivityFailed {
                                instance,
                                execution_id,
                                id,
                                error: format!("unregistered activity '{name}'"),
                            },
                        };
                        if store
                            .enqueue_work(QueueKind::Orchestrator, completion)
                            .await
                            .is_ok()
                        {
                            let _ = store.ack(QueueKind::Worker, &token).await;
                        } else {
                            let _ = store.abandon(QueueKind::Worker, &token).await;
                        }
                    });
                }
                Some((other, token)) => {
                    tracing::warn!(target: "windlass::runtime", ?other, "unexpected item on worker queue");
                    let _ = self.store.ack(QueueKind::Worker, &token).await;
                }
                None => {
                    tokio::select! {
                        _ = shutdown.changed() => {}
                        _ = tokio::time::sleep(QUEUE_IDLE_POLL) => {}
                    }
                }
            }
        }
    }
}
