//! Filesystem provider: one JSONL file per execution, one JSON file per
//! queued work item, lock sidecar files for peek-lock visibility. Survives
//! process restarts, which is what the crash-recovery tests exercise.
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{filter_append, HistoryStore, QueueKind, WorkItem};
use crate::Event;

pub struct FsHistoryStore {
    root: PathBuf,
    // Serializes multi-step file operations within this process; cross-process
    // exclusion comes from the lock sidecar files.
    guard: Mutex<()>,
}

impl FsHistoryStore {
    pub fn new(root: impl AsRef<Path>) -> Arc<Self> {
        let root = root.as_ref().to_path_buf();
        let _ = fs::create_dir_all(root.join("instances"));
        for kind in ["orchestrator", "worker", "timer"] {
            let dir = root.join("queues").join(kind);
            let _ = fs::create_dir_all(&dir);
            // Locks left behind by a crashed process protect nothing and
            // would hide their items forever; reap them so the items become
            // visible again.
            if let Ok(entries) = fs::read_dir(&dir) {
                for entry in entries.flatten() {
                    if entry.file_name().to_string_lossy().ends_with(".lock") {
                        let _ = fs::remove_file(entry.path());
                    }
                }
            }
        }
        Arc::new(Self {
            root,
            guard: Mutex::new(()),
        })
    }

    fn instance_dir(&self, instance: &str) -> PathBuf {
        self.root.join("instances").join(instance)
    }

    fn exec_file(&self, instance: &str, execution_id: u64) -> PathBuf {
        self.instance_dir(instance)
            .join(format!("exec-{execution_id:05}.jsonl"))
    }

    fn queue_dir(&self, kind: QueueKind) -> PathBuf {
        let name = match kind {
            QueueKind::Orchestrator => "orchestrator",
            QueueKind::Worker => "worker",
            QueueKind::Timer => "timer",
        };
        self.root.join("queues").join(name)
    }

    fn read_jsonl(path: &Path) -> Vec<Event> {
        let Ok(text) = fs::read_to_string(path) else {
            return Vec::new();
        };
        text.lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect()
    }

    fn append_jsonl(path: &Path, events: &[Event]) -> Result<(), String> {
        use std::io::Write;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| e.to_string())?;
        for ev in events {
            let line = serde_json::to_string(ev).map_err(|e| e.to_string())?;
            writeln!(file, "{line}").map_err(|e| e.to_string())?;
        }
        file.sync_all().map_err(|e| e.to_string())
    }

    fn execution_ids(&self, instance: &str) -> Vec<u64> {
        let Ok(entries) = fs::read_dir(self.instance_dir(instance)) else {
            return Vec::new();
        };
        let mut ids: Vec<u64> = entries
            .flatten()
            .filter_map(|e| {
                let name = e.file_name().to_string_lossy().into_owned();
                name.strip_prefix("exec-")?
                    .strip_suffix(".jsonl")?
                    .parse()
                    .ok()
            })
            .collect();
        ids.sort_unstable();
        ids
    }

    fn next_queue_seq(&self, dir: &Path) -> u64 {
        let Ok(entries) = fs::read_dir(dir) else {
            return 1;
        };
        entries
            .flatten()
            .filter_map(|e| {
                let name = e.file_name().to_string_lossy().into_owned();
                name.strip_suffix(".json")?.parse::<u64>().ok()
            })
            .max()
            .unwrap_or(0)
            + 1
    }
}

#[async_trait]
impl HistoryStore for FsHistoryStore {
    async fn read(&self, instance: &str) -> Vec<Event> {
        let _g = self.guard.lock().await;
        match self.execution_ids(instance).last() {
            Some(&latest) => Self::read_jsonl(&self.exec_file(instance, latest)),
            None => Vec::new(),
        }
    }

    async fn read_with_execution(&self, instance: &str, execution_id: u64) -> Vec<Event> {
        let _g = self.guard.lock().await;
        Self::read_jsonl(&self.exec_file(instance, execution_id))
    }

    async fn append(&self, instance: &str, new_events: Vec<Event>) -> Result<(), String> {
        let _g = self.guard.lock().await;
        let latest = self
            .execution_ids(instance)
            .last()
            .copied()
            .ok_or_else(|| format!("unknown instance '{instance}'"))?;
        let path = self.exec_file(instance, latest);
        let existing = Self::read_jsonl(&path);
        let accepted = filter_append(instance, &existing, new_events)?;
        Self::append_jsonl(&path, &accepted)
    }

    async fn append_with_execution(
        &self,
        instance: &str,
        execution_id: u64,
        new_events: Vec<Event>,
    ) -> Result<(), String> {
        let _g = self.guard.lock().await;
        let path = self.exec_file(instance, execution_id);
        if !path.exists() {
            return Err(format!(
                "unknown execution {execution_id} for '{instance}'"
            ));
        }
        let existing = Self::read_jsonl(&path);
        let accepted = filter_append(instance, &existing, new_events)?;
        Self::append_jsonl(&path, &accepted)
    }

    async fn create_instance(&self, instance: &str) -> Result<(), String> {
        let _g = self.guard.lock().await;
        let dir = self.instance_dir(instance);
        if dir.exists() {
            return Err(format!("instance '{instance}' already exists"));
        }
        fs::create_dir_all(&dir).map_err(|e| e.to_string())?;
        fs::write(self.exec_file(instance, crate::INITIAL_EXECUTION_ID), "")
            .map_err(|e| e.to_string())
    }

    async fn remove_instance(&self, instance: &str) -> Result<(), String> {
        let _g = self.guard.lock().await;
        let dir = self.instance_dir(instance);
        if dir.exists() {
            fs::remove_dir_all(dir).map_err(|e| e.to_string())?;
        }
        Ok(())
    }

    async fn list_instances(&self) -> Vec<String> {
        let _g = self.guard.lock().await;
        let Ok(entries) = fs::read_dir(self.root.join("instances")) else {
            return Vec::new();
        };
        let mut out: Vec<String> = entries
            .flatten()
            .filter(|e| e.path().is_dir())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        out.sort();
        out
    }

    async fn latest_execution_id(&self, instance: &str) -> Option<u64> {
        let _g = self.guard.lock().await;
        self.execution_ids(instance).last().copied()
    }

    async fn list_executions(&self, instance: &str) -> Vec<u64> {
        let _g = self.guard.lock().await;
        self.execution_ids(instance)
    }

    async fn create_new_execution(
        &self,
        instance: &str,
        orchestration: &str,
        input: &str,
    ) -> Result<u64, String> {
        let _g = self.guard.lock().await;
        let next = self.execution_ids(instance).last().copied().unwrap_or(0) + 1;
        if next == 1 && !self.instance_dir(instance).exists() {
            return Err(format!("unknown instance '{instance}'"));
        }
        let seed = Event::OrchestrationStarted {
            name: orchestration.to_string(),
            input: input.to_string(),
            started_at_ms: crate::wall_clock_ms(),
        };
        Self::append_jsonl(&self.exec_file(instance, next), &[seed])?;
        Ok(next)
    }

    async fn read_custom_status(&self, instance: &str) -> Option<String> {
        let _g = self.guard.lock().await;
        fs::read_to_string(self.instance_dir(instance).join("status")).ok()
    }

    async fn write_custom_status(&self, instance: &str, status: &str) -> Result<(), String> {
        let _g = self.guard.lock().await;
        let dir = self.instance_dir(instance);
        if !dir.exists() {
            return Err(format!("unknown instance '{instance}'"));
        }
        fs::write(dir.join("status"), status).map_err(|e| e.to_string())
    }

    async fn enqueue_work(&self, kind: QueueKind, item: WorkItem) -> Result<(), String> {
        let _g = self.guard.lock().await;
        let dir = self.queue_dir(kind);
        let seq = self.next_queue_seq(&dir);
        let body = serde_json::to_string(&item).map_err(|e| e.to_string())?;
        fs::write(dir.join(format!("{seq:020}.json")), body).map_err(|e| e.to_string())
    }

    async fn dequeue_peek_lock(&self, kind: QueueKind) -> Option<(WorkItem, String)> {
        let _g = self.guard.lock().await;
        let dir = self.queue_dir(kind);
        let mut names: Vec<String> = fs::read_dir(&dir)
            .ok()?
            .flatten()
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|n| n.ends_with(".json"))
            .collect();
        names.sort();
        for name in names {
            let lock = dir.join(format!("{name}.lock"));
            if lock.exists() {
                continue;
            }
            let Ok(body) = fs::read_to_string(dir.join(&name)) else {
                continue;
            };
            let Ok(item) = serde_json::from_str::<WorkItem>(&body) else {
                continue;
            };
            if fs::write(&lock, "").is_err() {
                continue;
            }
            return Some((item, name));
        }
        None
    }

    async fn ack(&self, kind: QueueKind, token: &str) -> Result<(), String> {
        let _g = self.guard.lock().await;
        let dir = self.queue_dir(kind);
        let _ = fs::remove_file(dir.join(token));
        let _ = fs::remove_file(dir.join(format!("{token}.lock")));
        Ok(())
    }

    async fn abandon(&self, kind: QueueKind, token: &str) -> Result<(), String> {
        let _g = self.guard.lock().await;
        let _ = fs::remove_file(self.queue_dir(kind).join(format!("{token}.lock")));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn history_round_trips_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FsHistoryStore::new(dir.path());
            store.create_instance("i").await.unwrap();
            store
                .append(
                    "i",
                    vec![
                        Event::OrchestrationStarted {
                            name: "O".into(),
                            input: "in".into(),
                            started_at_ms: 7,
                        },
                        Event::ActivityScheduled {
                            id: 1,
                            name: "A".into(),
                            input: "x".into(),
                        },
                    ],
                )
                .await
                .unwrap();
        }
        let reopened = FsHistoryStore::new(dir.path());
        let history = reopened.read("i").await;
        assert_eq!(history.len(), 2);
        assert_eq!(reopened.latest_execution_id("i").await, Some(1));
        assert!(reopened.dump_all_pretty().await.contains("== i"));
    }

    #[tokio::test]
    async fn queue_items_survive_reopen_and_respect_locks() {
        let dir = tempfile::tempdir().unwrap();
        let item = WorkItem::TimerSchedule {
            instance: "i".into(),
            execution_id: 1,
            id: 3,
            fire_at_ms: 99,
        };
        {
            let store = FsHistoryStore::new(dir.path());
            store
                .enqueue_work(QueueKind::Timer, item.clone())
                .await
                .unwrap();
        }
        let reopened = FsHistoryStore::new(dir.path());
        let (got, token) = reopened.dequeue_peek_lock(QueueKind::Timer).await.unwrap();
        assert_eq!(got, item);
        assert!(reopened.dequeue_peek_lock(QueueKind::Timer).await.is_none());
        reopened.ack(QueueKind::Timer, &token).await.unwrap();
        assert!(reopened.dequeue_peek_lock(QueueKind::Timer).await.is_none());
    }

    #[tokio::test]
    async fn stale_locks_are_reaped_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let item = WorkItem::ExternalRaised {
            instance: "i".into(),
            name: "Go".into(),
            data: "d".into(),
        };
        {
            let store = FsHistoryStore::new(dir.path());
            store
                .enqueue_work(QueueKind::Orchestrator, item.clone())
                .await
                .unwrap();
            // Crash while holding the lock: the token is never released.
            let _ = store.dequeue_peek_lock(QueueKind::Orchestrator).await.unwrap();
        }
        let reopened = FsHistoryStore::new(dir.path());
        let (got, token) = reopened
            .dequeue_peek_lock(QueueKind::Orchestrator)
            .await
            .unwrap();
        assert_eq!(got, item);
        reopened.ack(QueueKind::Orchestrator, &token).await.unwrap();
    }
}
