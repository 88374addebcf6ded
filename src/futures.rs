//! Correlation-id futures for activities, timers, external events and system
//! calls, plus the `select`/`join` combinators built on top of them.
//!
//! Every durable future follows the same three-step protocol against the
//! instance history held by the context:
//!
//! 1. **Claim**: on first poll, adopt the next unclaimed scheduling event in
//!    history order. If none remains, the await is genuinely new: allocate the
//!    next correlation id, append the scheduling event and record an `Action`.
//!    A claimed event that does not match the program's request is a
//!    nondeterminism fault.
//! 2. **Find completion**: look for the matching completion event; its
//!    position in history is the arbitration key for `select`.
//! 3. **Consume**: mark the completion consumed (so re-subscriptions to the
//!    same external name take later occurrences) and produce the output.
//!
//! Futures resolve synchronously from history under a no-op waker; a poll that
//! finds no completion parks the program until the runtime appends more
//! history and replays.
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::{Action, CtxInner, Event, OrchestrationContext};

/// Output of a resolved [`DurableFuture`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DurableOutput {
    Activity(Result<String, String>),
    Timer,
    External(String),
    System(String),
}

#[derive(Debug, Clone)]
enum Kind {
    Activity { name: String, input: String },
    Timer { delay_ms: u64 },
    External { name: String },
    System { op: String },
}

impl Kind {
    fn describe(&self) -> String {
        match self {
            Kind::Activity { name, .. } => format!("activity '{name}'"),
            Kind::Timer { delay_ms } => format!("timer ({delay_ms}ms)"),
            Kind::External { name } => format!("external wait '{name}'"),
            Kind::System { op } => format!("system call '{op}'"),
        }
    }
}

/// A single awaitable durable operation bound to an [`OrchestrationContext`].
pub struct DurableFuture {
    ctx: OrchestrationContext,
    kind: Kind,
    claimed_id: Option<u64>,
}

impl DurableFuture {
    fn new(ctx: OrchestrationContext, kind: Kind) -> Self {
        Self {
            ctx,
            kind,
            claimed_id: None,
        }
    }

    /// Adopt the next unclaimed scheduling event, or record a new one.
    fn ensure_claimed(&mut self, inner: &mut CtxInner) {
        if self.claimed_id.is_some() || inner.nondeterminism_error.is_some() {
            return;
        }
        let unclaimed = inner.history.iter().find_map(|e| {
            e.scheduling_id()
                .filter(|id| !inner.claimed_ids.contains(id))
                .map(|id| (id, e.clone()))
        });
        if let Some((id, recorded)) = unclaimed {
            if let Some(err) = self.match_recorded(&recorded) {
                inner.nondeterminism_error = Some(err);
                return;
            }
            inner.claimed_ids.insert(id);
            self.claimed_id = Some(id);
            return;
        }
        // Past recorded history: this await is new. Record the scheduling
        // event and the matching action in the same pass.
        let id = inner.next_id();
        match &self.kind {
            Kind::Activity { name, input } => {
                inner.history.push(Event::ActivityScheduled {
                    id,
                    name: name.clone(),
                    input: input.clone(),
                });
                inner.record_action(Action::CallActivity {
                    id,
                    name: name.clone(),
                    input: input.clone(),
                });
            }
            Kind::Timer { delay_ms } => {
                let fire_at_ms = crate::wall_clock_ms().saturating_add(*delay_ms);
                inner.history.push(Event::TimerCreated { id, fire_at_ms });
                inner.record_action(Action::CreateTimer { id, fire_at_ms });
            }
            Kind::External { name } => {
                inner.history.push(Event::ExternalSubscribed {
                    id,
                    name: name.clone(),
                });
                inner.record_action(Action::WaitExternal {
                    id,
                    name: name.clone(),
                });
            }
            Kind::System { op } => {
                // System calls resolve at recording time; the value is
                // computed exactly once and replayed verbatim afterwards.
                let value = evaluate_system_call(inner, id, op);
                inner.history.push(Event::SystemCall {
                    id,
                    op: op.clone(),
                    value,
                });
            }
        }
        inner.claimed_ids.insert(id);
        self.claimed_id = Some(id);
    }

    /// Compare the program's request against the recorded scheduling event.
    fn match_recorded(&self, recorded: &Event) -> Option<String> {
        let matches = match (&self.kind, recorded) {
            (
                Kind::Activity { name, input },
                Event::ActivityScheduled {
                    name: rn,
                    input: ri,
                    ..
                },
            ) => name == rn && input == ri,
            (Kind::Timer { .. }, Event::TimerCreated { .. }) => true,
            (Kind::External { name }, Event::ExternalSubscribed { name: rn, .. }) => name == rn,
            (Kind::System { op }, Event::SystemCall { op: ro, .. }) => op == ro,
            _ => false,
        };
        if matches {
            None
        } else {
            Some(format!(
                "nondeterministic orchestration: history recorded {recorded:?} but the program requested {}",
                self.kind.describe()
            ))
        }
    }

    /// Position in history of this future's completion, if it has arrived.
    fn completion_index(&self, inner: &CtxInner) -> Option<usize> {
        let id = self.claimed_id?;
        if inner.consumed_completions.contains(&id) {
            return None;
        }
        match &self.kind {
            Kind::Activity { .. } => inner.history.iter().position(|e| {
                matches!(e, Event::ActivityCompleted { id: cid, .. } | Event::ActivityFailed { id: cid, .. } if *cid == id)
            }),
            Kind::Timer { .. } => inner
                .history
                .iter()
                .position(|e| matches!(e, Event::TimerFired { id: cid, .. } if *cid == id)),
            Kind::External { name } => {
                // Externals are matched by name in arrival order; occurrences
                // already consumed by earlier subscriptions are skipped.
                let skip = inner.consumed_externals.get(name).copied().unwrap_or(0);
                inner
                    .history
                    .iter()
                    .enumerate()
                    .filter(|(_, e)| matches!(e, Event::ExternalEvent { name: en, .. } if en == name))
                    .map(|(idx, _)| idx)
                    .nth(skip)
            }
            Kind::System { .. } => inner
                .history
                .iter()
                .position(|e| matches!(e, Event::SystemCall { id: cid, .. } if *cid == id)),
        }
    }

    /// Mark the completion consumed and produce the output.
    fn consume(&self, inner: &mut CtxInner, idx: usize) -> DurableOutput {
        let id = self.claimed_id.unwrap_or_default();
        let completion = inner.history[idx].clone();
        match (&self.kind, &completion) {
            (Kind::Activity { .. }, Event::ActivityCompleted { result, .. }) => {
                let out = DurableOutput::Activity(Ok(result.clone()));
                inner.consumed_completions.insert(id);
                out
            }
            (Kind::Activity { .. }, Event::ActivityFailed { error, .. }) => {
                let out = DurableOutput::Activity(Err(error.clone()));
                inner.consumed_completions.insert(id);
                out
            }
            (Kind::Timer { .. }, Event::TimerFired { fire_at_ms, .. }) => {
                // Consuming a timer fire advances the virtual clock.
                inner.logical_time_ms = inner.logical_time_ms.max(*fire_at_ms);
                inner.consumed_completions.insert(id);
                DurableOutput::Timer
            }
            (Kind::External { name }, Event::ExternalEvent { data, .. }) => {
                let out = DurableOutput::External(data.clone());
                *inner.consumed_externals.entry(name.clone()).or_insert(0) += 1;
                inner.consumed_completions.insert(id);
                out
            }
            (Kind::System { .. }, Event::SystemCall { value, .. }) => {
                let out = DurableOutput::System(value.clone());
                inner.consumed_completions.insert(id);
                out
            }
            (kind, other) => {
                inner.nondeterminism_error = Some(format!(
                    "completion at index {idx} ({other:?}) does not match {}",
                    kind.describe()
                ));
                DurableOutput::System(String::new())
            }
        }
    }

    /// Resolve as an activity result, treating any other kind as a fault.
    pub async fn into_activity(self) -> Result<String, String> {
        match self.await {
            DurableOutput::Activity(r) => r,
            other => Err(format!("expected activity result, got {other:?}")),
        }
    }

    /// Resolve as a typed activity result decoded from JSON.
    pub async fn into_activity_typed<T: serde::de::DeserializeOwned>(self) -> Result<T, String> {
        use crate::_typed_codec::{Codec, Json};
        let raw = self.into_activity().await?;
        Json::decode(&raw)
    }

    /// Resolve as a timer fire.
    pub async fn into_timer(self) {
        let _ = self.await;
    }

    /// Resolve as an external event payload.
    pub async fn into_event(self) -> String {
        match self.await {
            DurableOutput::External(data) => data,
            other => format!("expected external event, got {other:?}"),
        }
    }

    /// Resolve as a typed external event payload decoded from JSON.
    pub async fn into_event_typed<T: serde::de::DeserializeOwned>(self) -> Result<T, String> {
        use crate::_typed_codec::{Codec, Json};
        match self.await {
            DurableOutput::External(data) => Json::decode(&data),
            other => Err(format!("expected external event, got {other:?}")),
        }
    }
}

fn evaluate_system_call(inner: &mut CtxInner, id: u64, op: &str) -> String {
    if op == crate::SYSCALL_OP_GUID {
        return format!(
            "{:016x}-{:04x}-{:08x}",
            crate::wall_clock_ms(),
            id,
            std::process::id()
        );
    }
    if op == crate::SYSCALL_OP_NOW_MS {
        return crate::wall_clock_ms().to_string();
    }
    if let Some(rest) = op.strip_prefix(crate::SYSCALL_OP_TRACE_PREFIX) {
        // "LEVEL:message": emitted through tracing exactly once, now, on the
        // pass that records the call. Replays adopt the event silently.
        let (level, msg) = rest.split_once(':').unwrap_or(("INFO", rest));
        let instance = inner.instance.clone();
        let orchestration = inner.orchestration_name.clone();
        match level {
            "ERROR" => tracing::error!(target: "windlass::orch", %instance, %orchestration, "{msg}"),
            "WARN" => tracing::warn!(target: "windlass::orch", %instance, %orchestration, "{msg}"),
            "DEBUG" => tracing::debug!(target: "windlass::orch", %instance, %orchestration, "{msg}"),
            _ => tracing::info!(target: "windlass::orch", %instance, %orchestration, "{msg}"),
        }
        return String::new();
    }
    String::new()
}

impl Future for DurableFuture {
    type Output = DurableOutput;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let handle = this.ctx.inner.clone();
        let mut inner = handle.lock().unwrap();
        this.ensure_claimed(&mut inner);
        if inner.nondeterminism_error.is_some() {
            return Poll::Pending;
        }
        match this.completion_index(&inner) {
            Some(idx) => Poll::Ready(this.consume(&mut inner, idx)),
            None => Poll::Pending,
        }
    }
}

/// Resolves with the index and output of the child whose completion appears
/// earliest in history. Losing children are left pending and still
/// correlated; their completions can be awaited later or simply ignored.
pub struct SelectFuture {
    ctx: OrchestrationContext,
    children: Vec<DurableFuture>,
}

impl Future for SelectFuture {
    type Output = (usize, DurableOutput);

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let handle = this.ctx.inner.clone();
        let mut inner = handle.lock().unwrap();
        // Claim every child first so scheduling order matches program order
        // regardless of which arm wins.
        for child in this.children.iter_mut() {
            child.ensure_claimed(&mut inner);
        }
        if inner.nondeterminism_error.is_some() {
            return Poll::Pending;
        }
        let winner = this
            .children
            .iter()
            .enumerate()
            .filter_map(|(i, c)| c.completion_index(&inner).map(|idx| (i, idx)))
            .min_by_key(|&(_, idx)| idx);
        match winner {
            Some((i, idx)) => {
                let out = this.children[i].consume(&mut inner, idx);
                Poll::Ready((i, out))
            }
            None => Poll::Pending,
        }
    }
}

/// Resolves when every child has a completion, yielding outputs in the order
/// the children were passed in, not the order completions arrived.
pub struct JoinFuture {
    ctx: OrchestrationContext,
    children: Vec<DurableFuture>,
    resolved: Vec<Option<DurableOutput>>,
}

impl Future for JoinFuture {
    type Output = Vec<DurableOutput>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let handle = this.ctx.inner.clone();
        let mut inner = handle.lock().unwrap();
        for child in this.children.iter_mut() {
            child.ensure_claimed(&mut inner);
        }
        if inner.nondeterminism_error.is_some() {
            return Poll::Pending;
        }
        // Consume each completion as it is found, in call order, so two
        // waits on the same external name take successive arrivals instead
        // of both resolving to the earliest one.
        for (child, slot) in this.children.iter().zip(this.resolved.iter_mut()) {
            if slot.is_none() {
                if let Some(idx) = child.completion_index(&inner) {
                    *slot = Some(child.consume(&mut inner, idx));
                }
            }
        }
        if this.resolved.iter().all(Option::is_some) {
            Poll::Ready(this.resolved.iter_mut().filter_map(Option::take).collect())
        } else {
            Poll::Pending
        }
    }
}

impl OrchestrationContext {
    /// Schedule an activity by name with a string input.
    pub fn schedule_activity(
        &self,
        name: impl Into<String>,
        input: impl Into<String>,
    ) -> DurableFuture {
        DurableFuture::new(
            self.clone(),
            Kind::Activity {
                name: name.into(),
                input: input.into(),
            },
        )
    }

    /// Schedule an activity with a JSON-encoded typed input. An input that
    /// fails to encode faults the pass; nothing is scheduled.
    pub fn schedule_activity_typed<In: serde::Serialize>(
        &self,
        name: impl Into<String>,
        input: &In,
    ) -> DurableFuture {
        use crate::_typed_codec::{Codec, Json};
        let name = name.into();
        match Json::encode(input) {
            Ok(payload) => self.schedule_activity(name, payload),
            Err(e) => {
                self.inner.lock().unwrap().nondeterminism_error =
                    Some(format!("activity '{name}' input failed to encode: {e}"));
                self.schedule_activity(name, String::new())
            }
        }
    }

    /// Schedule a durable timer that fires after `delay_ms`.
    pub fn schedule_timer(&self, delay_ms: u64) -> DurableFuture {
        DurableFuture::new(self.clone(), Kind::Timer { delay_ms })
    }

    /// Subscribe to an external event by name.
    pub fn schedule_wait(&self, name: impl Into<String>) -> DurableFuture {
        DurableFuture::new(self.clone(), Kind::External { name: name.into() })
    }

    /// Race two durable futures; the loser stays pending and correlated.
    pub fn select2(&self, a: DurableFuture, b: DurableFuture) -> SelectFuture {
        self.select(vec![a, b])
    }

    /// Race any number of durable futures.
    pub fn select(&self, children: Vec<DurableFuture>) -> SelectFuture {
        SelectFuture {
            ctx: self.clone(),
            children,
        }
    }

    /// Wait for all durable futures; outputs come back in call order.
    pub fn join(&self, children: Vec<DurableFuture>) -> JoinFuture {
        let resolved = vec![None; children.len()];
        JoinFuture {
            ctx: self.clone(),
            children,
            resolved,
        }
    }

    /// A GUID generated once and replayed deterministically afterwards.
    pub async fn new_guid(&self) -> String {
        match self.system_call(crate::SYSCALL_OP_GUID).await {
            DurableOutput::System(v) => v,
            _ => String::new(),
        }
    }

    /// Wall-clock milliseconds captured once and replayed deterministically.
    /// Contrast with [`current_time_ms`](Self::current_time_ms), which is the
    /// virtual clock and never consults the wall clock at all.
    pub async fn system_now_ms(&self) -> u64 {
        match self.system_call(crate::SYSCALL_OP_NOW_MS).await {
            DurableOutput::System(v) => v.parse().unwrap_or(0),
            _ => 0,
        }
    }

    fn system_call(&self, op: impl Into<String>) -> DurableFuture {
        DurableFuture::new(self.clone(), Kind::System { op: op.into() })
    }

    fn trace(&self, level: &str, msg: impl AsRef<str>) {
        let op = format!("{}{}:{}", crate::SYSCALL_OP_TRACE_PREFIX, level, msg.as_ref());
        let mut fut = self.system_call(op);
        // System calls resolve on first poll; drive it here so the trace is
        // recorded (and emitted) at the program point that issued it.
        let _ = crate::poll_once(Pin::new(&mut fut));
    }

    /// Replay-safe trace at info level: recorded in history, emitted once.
    pub fn trace_info(&self, msg: impl AsRef<str>) {
        self.trace("INFO", msg);
    }

    /// Replay-safe trace at warn level.
    pub fn trace_warn(&self, msg: impl AsRef<str>) {
        self.trace("WARN", msg);
    }

    /// Replay-safe trace at error level.
    pub fn trace_error(&self, msg: impl AsRef<str>) {
        self.trace("ERROR", msg);
    }

    /// Replay-safe trace at debug level.
    pub fn trace_debug(&self, msg: impl AsRef<str>) {
        self.trace("DEBUG", msg);
    }
}
