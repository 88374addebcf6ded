//! In-process timer wheel: a min-heap of armed timers drained by the timer
//! dispatcher. Timer items stay locked in the provider queue until they fire,
//! so a crash before the fire re-arms them on restart.
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::providers::{HistoryStore, QueueKind, WorkItem};

#[derive(Debug, PartialEq, Eq)]
pub(crate) struct ArmedTimer {
    pub fire_at_ms: u64,
    pub seq: u64,
    pub instance: String,
    pub execution_id: u64,
    pub id: u64,
    pub token: String,
}

impl Ord for ArmedTimer {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.fire_at_ms, self.seq).cmp(&(other.fire_at_ms, other.seq))
    }
}

impl PartialOrd for ArmedTimer {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
pub(crate) struct TimerService {
    heap: BinaryHeap<Reverse<ArmedTimer>>,
    next_seq: u64,
}

impl TimerService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arm(
        &mut self,
        instance: String,
        execution_id: u64,
        id: u64,
        fire_at_ms: u64,
        token: String,
    ) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Reverse(ArmedTimer {
            fire_at_ms,
            seq,
            instance,
            execution_id,
            id,
            token,
        }));
    }

    /// Pop every timer due at or before `now_ms`, earliest first.
    pub fn take_due(&mut self, now_ms: u64) -> Vec<ArmedTimer> {
        let mut due = Vec::new();
        while let Some(Reverse(top)) = self.heap.peek() {
            if top.fire_at_ms > now_ms {
                break;
            }
            if let Some(Reverse(t)) = self.heap.pop() {
                due.push(t);
            }
        }
        due
    }

    pub fn next_deadline_ms(&self) -> Option<u64> {
        self.heap.peek().map(|Reverse(t)| t.fire_at_ms)
    }
}

const IDLE_POLL: Duration = Duration::from_millis(20);

pub(crate) async fn run_timer_dispatcher(
    store: Arc<dyn HistoryStore>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut service = TimerService::new();
    loop {
        if *shutdown.borrow() {
            break;
        }
        while let Some((item, token)) = store.dequeue_peek_lock(QueueKind::Timer).await {
            match item {
                WorkItem::TimerSchedule {
                    instance,
                    execution_id,
                    id,
                    fire_at_ms,
                } => service.arm(instance, execution_id, id, fire_at_ms, token),
                other => {
                    tracing::warn!(target: "windlass::runtime", ?other, "unexpected item on timer queue");
                    let _ = store.ack(QueueKind::Timer, &token).await;
                }
            }
        }
        let now = crate::wall_clock_ms();
        for timer in service.take_due(now) {
            let fired = WorkItem::TimerFired {
                instance: timer.instance.clone(),
                execution_id: timer.execution_id,
                id: timer.id,
                fire_at_ms: timer.fire_at_ms,
            };
            match store.enqueue_work(QueueKind::Orchestrator, fired).await {
                Ok(()) => {
                    let _ = store.ack(QueueKind::Timer, &timer.token).await;
                }
                Err(e) => {
                    tracing::warn!(target: "windlass::runtime", error = %e, "failed to enqueue timer fire");
                    let _ = store.abandon(QueueKind::Timer, &timer.token).await;
                }
            }
        }
        let sleep_for = service
            .next_deadline_ms()
            .map(|d| Duration::from_millis(d.saturating_sub(now).clamp(1, 50)))
            .unwrap_or(IDLE_POLL);
        tokio::select! {
            _ = shutdown.changed() => {}
            _ = tokio::time::sleep(sleep_for) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn due_timers_come_out_in_deadline_order() {
        let mut svc = TimerService::new();
        svc.arm("a".into(), 1, 1, 300, "t1".into());
        svc.arm("b".into(), 1, 2, 100, "t2".into());
        svc.arm("c".into(), 1, 3, 200, "t3".into());

        assert_eq!(svc.next_deadline_ms(), Some(100));
        let due = svc.take_due(250);
        assert_eq!(
            due.iter().map(|t| t.fire_at_ms).collect::<Vec<_>>(),
            vec![100, 200]
        );
        assert_eq!(svc.next_deadline_ms(), Some(300));
        assert!(svc.take_due(250).is_empty());
    }

    #[test]
    fn equal_deadlines_preserve_arming_order() {
        let mut svc = TimerService::new();
        svc.arm("a".into(), 1, 1, 100, "t1".into());
        svc.arm("b".into(), 1, 2, 100, "t2".into());
        let due = svc.take_due(100);
        assert_eq!(
            due.iter().map(|t| t.id).collect::<Vec<_>>(),
            vec![1, 2]
        );
    }
}
