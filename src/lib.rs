//! Durable, replay-based workflow orchestration engine.
//!
//! Orchestrations are ordinary async functions made deterministic by replay:
//! every decision (activity call, timer, external-event wait, system call) is
//! recorded as an append-only `Event` in the instance history, and on every
//! wake the program is re-run from its first statement against that history,
//! consuming recorded completions instead of re-executing side effects. The
//! crate provides:
//!
//! - Public data model: `Event`, `Action`
//! - An `OrchestrationContext` with correlation-id futures for activities,
//!   timers and external events, composable via `select`/`join`
//! - A single-pass driver: `run_turn`
//! - A provider-backed `Runtime` with orchestrator/worker/timer dispatchers
//! - A thin control-plane `WorkflowClient`
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};

pub mod client;
pub mod futures;
pub mod logging;
pub mod providers;
pub mod runtime;

pub use crate::futures::{DurableFuture, DurableOutput, JoinFuture, SelectFuture};
pub use client::{StartReceipt, StatusResponse, WorkflowClient};
pub use runtime::{OrchestrationHandler, OrchestrationRegistry, OrchestrationStatus};

use serde::{Deserialize, Serialize};

// System operation names recorded in SystemCall events.
pub(crate) const SYSCALL_OP_GUID: &str = "guid";
pub(crate) const SYSCALL_OP_NOW_MS: &str = "now_ms";
pub(crate) const SYSCALL_OP_TRACE_PREFIX: &str = "trace:";

/// First execution of every instance.
pub const INITIAL_EXECUTION_ID: u64 = 1;

// Internal codec utilities for typed I/O (kept private; public API remains ergonomic)
pub(crate) mod _typed_codec {
    use serde::{de::DeserializeOwned, Serialize};
    use serde_json::Value;
    pub trait Codec {
        fn encode<T: Serialize>(v: &T) -> Result<String, String>;
        fn decode<T: DeserializeOwned>(s: &str) -> Result<T, String>;
    }
    pub struct Json;
    impl Codec for Json {
        fn encode<T: Serialize>(v: &T) -> Result<String, String> {
            // If the value is a JSON string, return the raw content so plain
            // string payloads stay human-readable in history dumps.
            match serde_json::to_value(v) {
                Ok(Value::String(s)) => Ok(s),
                Ok(val) => serde_json::to_string(&val).map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            }
        }
        fn decode<T: DeserializeOwned>(s: &str) -> Result<T, String> {
            match serde_json::from_str::<T>(s) {
                Ok(v) => Ok(v),
                Err(_) => {
                    // Fallback: treat the raw string as a JSON string value.
                    let val = Value::String(s.to_string());
                    serde_json::from_value(val).map_err(|e| e.to_string())
                }
            }
        }
    }
}

/// Append-only orchestration history entries persisted by a provider and
/// consumed during replay. Scheduling-type variants carry stable correlation
/// ids assigned in program order; completion-type variants reference them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Event {
    /// Execution was created and started by name with input. `started_at_ms`
    /// seeds the virtual clock for this execution.
    OrchestrationStarted {
        name: String,
        input: String,
        started_at_ms: u64,
    },
    /// Orchestration completed with a final result (terminal).
    OrchestrationCompleted { output: String },
    /// Orchestration failed with a final error (terminal).
    OrchestrationFailed { error: String },
    /// Orchestration continued as new with fresh input (terminal for this
    /// execution; the next execution is seeded with `input`).
    OrchestrationContinuedAsNew { input: String },
    /// Orchestration was terminated by an external request (terminal).
    OrchestrationTerminated { reason: String },

    /// Activity was scheduled with a unique correlation id and input.
    ActivityScheduled { id: u64, name: String, input: String },
    /// Activity completed successfully with a result.
    ActivityCompleted { id: u64, result: String },
    /// Activity failed; the error is surfaced to the awaiting program.
    ActivityFailed { id: u64, error: String },

    /// Timer was created and will logically fire at `fire_at_ms`.
    TimerCreated { id: u64, fire_at_ms: u64 },
    /// Timer fired at logical time `fire_at_ms`.
    TimerFired { id: u64, fire_at_ms: u64 },

    /// Subscription to an external event by name.
    ExternalSubscribed { id: u64, name: String },
    /// An external event was raised. Matched to subscriptions by name and
    /// arrival order; recorded even when no subscription is pending so a
    /// later wait with the same name can consume it.
    ExternalEvent { name: String, data: String },

    /// A system operation (guid, wall clock, trace) whose value was computed
    /// once and is replayed verbatim afterwards.
    SystemCall { id: u64, op: String, value: String },
}

impl Event {
    /// Correlation id of a scheduling-type event, if any.
    pub(crate) fn scheduling_id(&self) -> Option<u64> {
        match self {
            Event::ActivityScheduled { id, .. }
            | Event::TimerCreated { id, .. }
            | Event::ExternalSubscribed { id, .. }
            | Event::SystemCall { id, .. } => Some(*id),
            _ => None,
        }
    }

    /// True for events that end an execution.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Event::OrchestrationCompleted { .. }
                | Event::OrchestrationFailed { .. }
                | Event::OrchestrationContinuedAsNew { .. }
                | Event::OrchestrationTerminated { .. }
        )
    }
}

/// Declarative decisions produced by a replay pass. The runtime materializes
/// these into provider work items; the corresponding scheduling `Event`s are
/// already part of the pass's history delta.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Schedule an activity invocation.
    CallActivity { id: u64, name: String, input: String },
    /// Create a timer firing at the recorded wall-clock deadline.
    CreateTimer { id: u64, fire_at_ms: u64 },
    /// Subscribe to an external event by name.
    WaitExternal { id: u64, name: String },
    /// End this execution and start the next one with new input.
    ContinueAsNew { input: String },
}

#[derive(Debug)]
pub(crate) struct CtxInner {
    pub(crate) history: Vec<Event>,
    pub(crate) actions: Vec<Action>,
    /// Next correlation id; seeded past the maximum id found in history.
    pub(crate) next_correlation_id: u64,
    /// Scheduling event ids claimed by futures during this pass, in program order.
    pub(crate) claimed_ids: HashSet<u64>,
    /// Correlation ids whose completion has been consumed during this pass.
    pub(crate) consumed_completions: HashSet<u64>,
    /// Per-name count of external events already consumed during this pass.
    pub(crate) consumed_externals: HashMap<String, usize>,
    /// Virtual clock: last resolved history point, never wall clock.
    pub(crate) logical_time_ms: u64,
    /// Last-write-wins custom status set during this pass.
    pub(crate) custom_status: Option<String>,
    /// Set when the program's decisions diverge from recorded history.
    pub(crate) nondeterminism_error: Option<String>,
    // Instance metadata for trace correlation.
    pub(crate) instance: String,
    pub(crate) orchestration_name: String,
    pub(crate) execution_id: u64,
}

impl CtxInner {
    fn new(history: Vec<Event>) -> Self {
        let mut max_id = 0u64;
        let mut start_ms = 0u64;
        for ev in &history {
            if let Some(id) = ev.scheduling_id() {
                max_id = max_id.max(id);
            }
            if let Event::OrchestrationStarted { started_at_ms, .. } = ev {
                start_ms = *started_at_ms;
            }
        }
        Self {
            history,
            actions: Vec::new(),
            next_correlation_id: max_id.saturating_add(1),
            claimed_ids: HashSet::new(),
            consumed_completions: HashSet::new(),
            consumed_externals: HashMap::new(),
            logical_time_ms: start_ms,
            custom_status: None,
            nondeterminism_error: None,
            instance: String::new(),
            orchestration_name: String::new(),
            execution_id: INITIAL_EXECUTION_ID,
        }
    }

    pub(crate) fn record_action(&mut self, a: Action) {
        self.actions.push(a);
    }

    pub(crate) fn next_id(&mut self) -> u64 {
        let id = self.next_correlation_id;
        self.next_correlation_id += 1;
        id
    }

    /// True while unclaimed scheduling events remain ahead of the program's
    /// current position, i.e. the pass is still consuming recorded history.
    pub(crate) fn replaying(&self) -> bool {
        self.history
            .iter()
            .any(|e| matches!(e.scheduling_id(), Some(id) if !self.claimed_ids.contains(&id)))
    }
}

pub(crate) fn wall_clock_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// User-facing orchestration context for scheduling and replay-safe helpers.
#[derive(Clone)]
pub struct OrchestrationContext {
    pub(crate) inner: Arc<Mutex<CtxInner>>,
}

impl OrchestrationContext {
    /// Construct a new context from an existing history vector.
    pub fn new(history: Vec<Event>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(CtxInner::new(history))),
        }
    }

    pub(crate) fn new_with_meta(
        history: Vec<Event>,
        instance: &str,
        orchestration_name: &str,
        execution_id: u64,
    ) -> Self {
        let ctx = Self::new(history);
        {
            let mut inner = ctx.inner.lock().unwrap();
            inner.instance = instance.to_string();
            inner.orchestration_name = orchestration_name.to_string();
            inner.execution_id = execution_id;
        }
        ctx
    }

    /// Current virtual time in milliseconds: the timestamp of the last
    /// resolved history point (execution start, then consumed timer fires).
    /// Never reads the wall clock; identical on every replay of the same
    /// history prefix.
    pub fn current_time_ms(&self) -> u64 {
        self.inner.lock().unwrap().logical_time_ms
    }

    /// True while this pass is consuming already-recorded history. Logs and
    /// other observable effects should be skipped while replaying; see the
    /// `durable_info!` family of macros.
    pub fn is_replaying(&self) -> bool {
        self.inner.lock().unwrap().replaying()
    }

    /// Set the instance's custom status payload (last write wins). This is
    /// metadata, not program state: it is persisted after the pass commits
    /// and is never replayed.
    pub fn set_custom_status(&self, status: impl Into<String>) {
        self.inner.lock().unwrap().custom_status = Some(status.into());
    }

    /// Request continue-as-new: this execution ends and the next one starts
    /// fresh with `input`, truncating history to the new seed.
    pub fn continue_as_new(&self, input: impl Into<String>) {
        let mut inner = self.inner.lock().unwrap();
        inner.record_action(Action::ContinueAsNew { input: input.into() });
    }

    /// Typed variant of [`continue_as_new`](Self::continue_as_new).
    pub fn continue_as_new_typed<In: Serialize>(&self, input: &In) {
        use crate::_typed_codec::{Codec, Json};
        match Json::encode(input) {
            Ok(payload) => self.continue_as_new(payload),
            Err(e) => {
                self.inner.lock().unwrap().nondeterminism_error =
                    Some(format!("continue_as_new encode failed: {e}"));
            }
        }
    }

    pub(crate) fn take_actions(&self) -> Vec<Action> {
        std::mem::take(&mut self.inner.lock().unwrap().actions)
    }
}

fn noop_waker() -> Waker {
    unsafe fn clone(_: *const ()) -> RawWaker {
        RawWaker::new(std::ptr::null(), &VTABLE)
    }
    unsafe fn wake(_: *const ()) {}
    unsafe fn wake_by_ref(_: *const ()) {}
    unsafe fn drop(_: *const ()) {}
    static VTABLE: RawWakerVTable = RawWakerVTable::new(clone, wake, wake_by_ref, drop);
    unsafe { Waker::from_raw(RawWaker::new(std::ptr::null(), &VTABLE)) }
}

pub(crate) fn poll_once<F: Future + ?Sized>(fut: Pin<&mut F>) -> Poll<F::Output> {
    let w = noop_waker();
    let mut cx = Context::from_waker(&w);
    fut.poll(&mut cx)
}

fn poll_once_unpinned<F: Future>(fut: &mut F) -> Poll<F::Output> {
    // The turn future never moves between polls; it lives on this stack frame
    // for the duration of the pass.
    let pinned = unsafe { Pin::new_unchecked(fut) };
    poll_once(pinned)
}

/// Everything produced by a single replay pass.
#[derive(Debug)]
pub struct TurnOutcome<O> {
    /// History including scheduling events recorded during this pass.
    pub history: Vec<Event>,
    /// New decisions to materialize (empty on a pure replay pass).
    pub actions: Vec<Action>,
    /// Custom status set during this pass, if any.
    pub custom_status: Option<String>,
    /// Program output when the pass ran to completion.
    pub output: Option<O>,
    /// Set when the program's decisions diverged from recorded history; the
    /// instance must be failed, not retried.
    pub nondeterminism: Option<String>,
}

/// Run one replay pass of `orchestrator` over `history`.
///
/// The program is polled exactly once with a no-op waker: durable futures
/// resolve synchronously from history, so a single poll consumes every
/// already-resolved await and stops at the first unresolved one. Determinism
/// law: the same history prefix always yields the same actions.
pub fn run_turn<O, F>(history: Vec<Event>, orchestrator: impl Fn(OrchestrationContext) -> F) -> TurnOutcome<O>
where
    F: Future<Output = O>,
{
    let ctx = OrchestrationContext::new(history);
    let mut fut = orchestrator(ctx.clone());
    let polled = poll_once_unpinned(&mut fut);
    finish_turn(ctx, polled)
}

pub(crate) fn finish_turn<O>(ctx: OrchestrationContext, polled: Poll<O>) -> TurnOutcome<O> {
    let actions = ctx.take_actions();
    let inner = ctx.inner.lock().unwrap();
    TurnOutcome {
        history: inner.history.clone(),
        actions,
        custom_status: inner.custom_status.clone(),
        output: match polled {
            Poll::Ready(out) if inner.nondeterminism_error.is_none() => Some(out),
            _ => None,
        },
        nondeterminism: inner.nondeterminism_error.clone(),
    }
}
