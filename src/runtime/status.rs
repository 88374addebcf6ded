//! Instance status derived from history, plus a polling wait helper.
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::providers::HistoryStore;
use crate::Event;

/// Lifecycle state of an orchestration instance, derived from the latest
/// execution's history. Terminal states are absorbing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum OrchestrationStatus {
    NotFound,
    Running,
    Completed { output: String },
    Failed { error: String },
    ContinuedAsNew { input: String },
    Terminated { reason: String },
}

impl OrchestrationStatus {
    /// Wire-friendly status name.
    pub fn as_str(&self) -> &'static str {
        match self {
            OrchestrationStatus::NotFound => "NotFound",
            OrchestrationStatus::Running => "Running",
            OrchestrationStatus::Completed { .. } => "Completed",
            OrchestrationStatus::Failed { .. } => "Failed",
            OrchestrationStatus::ContinuedAsNew { .. } => "ContinuedAsNew",
            OrchestrationStatus::Terminated { .. } => "Terminated",
        }
    }

    /// True for states no further event can leave.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrchestrationStatus::Completed { .. }
                | OrchestrationStatus::Failed { .. }
                | OrchestrationStatus::Terminated { .. }
        )
    }
}

pub(crate) fn status_from_history(history: &[Event]) -> OrchestrationStatus {
    for ev in history.iter().rev() {
        match ev {
            Event::OrchestrationCompleted { output } => {
                return OrchestrationStatus::Completed {
                    output: output.clone(),
                }
            }
            Event::OrchestrationFailed { error } => {
                return OrchestrationStatus::Failed {
                    error: error.clone(),
                }
            }
            Event::OrchestrationContinuedAsNew { input } => {
                return OrchestrationStatus::ContinuedAsNew {
                    input: input.clone(),
                }
            }
            Event::OrchestrationTerminated { reason } => {
                return OrchestrationStatus::Terminated {
                    reason: reason.clone(),
                }
            }
            _ => {}
        }
    }
    OrchestrationStatus::Running
}

/// Status of the latest execution of `instance`.
pub async fn get_orchestration_status(
    store: &Arc<dyn HistoryStore>,
    instance: &str,
) -> OrchestrationStatus {
    match store.latest_execution_id(instance).await {
        None => OrchestrationStatus::NotFound,
        Some(exec) => status_from_history(&store.read_with_execution(instance, exec).await),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitError {
    Timeout,
    Other(String),
}

impl std::fmt::Display for WaitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WaitError::Timeout => write!(f, "timed out waiting for orchestration"),
            WaitError::Other(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for WaitError {}

/// Poll until the instance reaches a terminal status. A continue-as-new
/// rollover is not terminal; polling continues into the next execution.
pub async fn wait_for_orchestration(
    store: &Arc<dyn HistoryStore>,
    instance: &str,
    timeout: Duration,
) -> Result<OrchestrationStatus, WaitError> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let status = get_orchestration_status(store, instance).await;
        if status.is_terminal() {
            return Ok(status);
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(WaitError::Timeout);
        }
        tokio::time::sleep(Duration::from_millis(15)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_terminal_event_wins() {
        let history = vec![
            Event::OrchestrationStarted {
                name: "O".into(),
                input: String::new(),
                started_at_ms: 0,
            },
            Event::OrchestrationCompleted { output: "done".into() },
        ];
        assert_eq!(
            status_from_history(&history),
            OrchestrationStatus::Completed { output: "done".into() }
        );
        assert!(status_from_history(&history).is_terminal());
    }

    #[test]
    fn non_terminal_history_is_running() {
        let history = vec![Event::OrchestrationStarted {
            name: "O".into(),
            input: String::new(),
            started_at_ms: 0,
        }];
        assert_eq!(status_from_history(&history), OrchestrationStatus::Running);
    }
}
