//! Backup Supervisor (spec.md §4.7) — the concurrency fabric. One
//! exclusive "slot", one FIFO queue of [`QueueEntry`], one Progress Record
//! registry, one "current operation" descriptor.
//!
//! The slot is a `tokio::sync::Mutex<()>` — holding its guard *is* holding
//! the slot. Direct submissions try to acquire it without blocking;
//! the queue processor acquires it blocking, which is the serialisation
//! point spec.md calls out explicitly. Because `tokio::sync::Mutex` isn't
//! reentrant and its guard isn't `Send`-friendly to stash across await
//! points behind a channel hop, the slot plus the "who holds it" bookkeeping
//! is wrapped in a small owned token so the queue processor can be the sole
//! releaser, matching the "queue processor releases the slot itself; the
//! engine must not release twice" invariant.

pub mod progress;

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use tokio::sync::{Mutex as AsyncMutex, Notify, OwnedMutexGuard};
use tracing::{error, info, warn};

use crate::engine::BackupEngine;
use crate::error::{CoreError, CoreResult};
use progress::{ProgressRegistry, ProgressStatus};

#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub container_id: String,
    pub progress_id: String,
    pub is_scheduled: bool,
}

#[derive(Debug, Clone)]
pub struct CurrentOperation {
    pub container_id: String,
    pub progress_id: String,
    pub is_scheduled: bool,
}

#[derive(Debug, Clone)]
pub struct SupervisorStatus {
    pub slot_held: bool,
    pub current_operation: Option<CurrentOperation>,
    pub queue_depth: usize,
}

#[derive(Debug, Clone)]
pub enum SubmitOutcome {
    /// Running immediately, or accepted onto the queue; either way the
    /// caller gets a progress id to poll.
    Accepted { progress_id: String, queued: bool },
    Busy { current: Option<CurrentOperation> },
}

struct Inner {
    queue: VecDeque<QueueEntry>,
    current: Option<CurrentOperation>,
    processor_running: bool,
}

/// Owns the slot, the queue, and the progress registry; the single point
/// every backup submission — manual or scheduled — passes through.
pub struct Supervisor {
    slot: Arc<AsyncMutex<()>>,
    state: StdMutex<Inner>,
    notify: Notify,
    progress: Arc<ProgressRegistry>,
    engine: Arc<BackupEngine>,
    shutdown: Arc<tokio::sync::Notify>,
    shutting_down: std::sync::atomic::AtomicBool,
}

impl Supervisor {
    pub fn new(engine: Arc<BackupEngine>, progress: Arc<ProgressRegistry>) -> Arc<Self> {
        Arc::new(Self {
            slot: Arc::new(AsyncMutex::new(())),
            state: StdMutex::new(Inner {
                queue: VecDeque::new(),
                current: None,
                processor_running: false,
            }),
            notify: Notify::new(),
            progress,
            engine,
            shutdown: Arc::new(tokio::sync::Notify::new()),
            shutting_down: std::sync::atomic::AtomicBool::new(false),
        })
    }

    pub fn progress(&self, id: &str) -> Option<progress::ProgressRecord> {
        self.progress.get(id)
    }

    pub fn status(&self) -> SupervisorStatus {
        let state = self.state.lock().unwrap();
        SupervisorStatus {
            slot_held: self.slot.try_lock().is_err(),
            current_operation: state.current.clone(),
            queue_depth: state.queue.len(),
        }
    }

    /// The unified submission API (spec.md §4.7 "Entry points").
    pub fn start(
        self: &Arc<Self>,
        container_id: &str,
        queue_if_busy: bool,
        is_scheduled: bool,
    ) -> SubmitOutcome {
        if let Ok(guard) = self.slot.clone().try_lock_owned() {
            let progress_id = self.progress.create(container_id, is_scheduled);
            self.spawn_immediate(guard, container_id.to_string(), progress_id.clone(), is_scheduled);
            return SubmitOutcome::Accepted {
                progress_id,
                queued: false,
            };
        }

        if !queue_if_busy {
            let state = self.state.lock().unwrap();
            return SubmitOutcome::Busy {
                current: state.current.clone(),
            };
        }

        let progress_id = self.progress.create(container_id, is_scheduled);
        {
            let mut state = self.state.lock().unwrap();
            state.queue.push_back(QueueEntry {
                container_id: container_id.to_string(),
                progress_id: progress_id.clone(),
                is_scheduled,
            });
        }
        self.notify.notify_one();
        self.ensure_processor();

        SubmitOutcome::Accepted {
            progress_id,
            queued: true,
        }
    }

    fn spawn_immediate(
        self: &Arc<Self>,
        guard: OwnedMutexGuard<()>,
        container_id: String,
        progress_id: String,
        is_scheduled: bool,
    ) {
        let this = self.clone();
        {
            let mut state = this.state.lock().unwrap();
            state.current = Some(CurrentOperation {
                container_id: container_id.clone(),
                progress_id: progress_id.clone(),
                is_scheduled,
            });
        }
        tokio::spawn(async move {
            let engine = this.engine.clone();
            let progress = this.progress.clone();
            if let Err(e) = engine
                .run(&container_id, is_scheduled, &progress_id, &progress)
                .await
            {
                warn!(error = %e, container_id, "immediate backup run failed");
            }
            drop(guard);
            let mut state = this.state.lock().unwrap();
            state.current = None;
        });
    }

    /// Ensures exactly one queue-processor task is running (idempotent to
    /// request); it dies only on service shutdown.
    fn ensure_processor(self: &Arc<Self>) {
        let mut state = self.state.lock().unwrap();
        if state.processor_running {
            return;
        }
        state.processor_running = true;
        drop(state);

        let this = self.clone();
        tokio::spawn(async move { this.run_processor().await });
    }

    async fn run_processor(self: Arc<Self>) {
        info!("queue processor started");
        loop {
            let entry = {
                let mut state = self.state.lock().unwrap();
                state.queue.pop_front()
            };

            let entry = match entry {
                Some(entry) => entry,
                None => {
                    let wait = tokio::time::sleep(std::time::Duration::from_millis(500));
                    tokio::select! {
                        _ = self.notify.notified() => continue,
                        _ = wait => continue,
                        _ = self.shutdown.notified() => break,
                    }
                }
            };

            self.progress
                .set_status(&entry.progress_id, ProgressStatus::Waiting);

            let guard = self.slot.clone().lock_owned().await;

            self.progress
                .set_status(&entry.progress_id, ProgressStatus::Starting);
            {
                let mut state = self.state.lock().unwrap();
                state.current = Some(CurrentOperation {
                    container_id: entry.container_id.clone(),
                    progress_id: entry.progress_id.clone(),
                    is_scheduled: entry.is_scheduled,
                });
            }

            if let Err(e) = self
                .engine
                .run(
                    &entry.container_id,
                    entry.is_scheduled,
                    &entry.progress_id,
                    &self.progress,
                )
                .await
            {
                error!(error = %e, container_id = entry.container_id, "queued backup run failed");
            }

            // the processor releases the slot itself; the engine never does.
            drop(guard);
            let mut state = self.state.lock().unwrap();
            state.current = None;
        }

        let mut state = self.state.lock().unwrap();
        state.processor_running = false;
        info!("queue processor stopped");
    }

    pub fn shutdown(&self) {
        self.shutting_down
            .store(true, std::sync::atomic::Ordering::SeqCst);
        self.shutdown.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::backup::SelfReference;
    use crate::docker::MockDockerTransport;

    fn test_engine() -> Arc<BackupEngine> {
        let mut mock = MockDockerTransport::new();
        mock.expect_inspect_container().returning(|_| {
            Ok(crate::docker::inspect::InspectDocument::new(serde_json::json!({
                "Id": "id", "Name": "/c", "Config": {"Image": "alpine"}
            })))
        });
        Arc::new(BackupEngine::new(
            Arc::new(mock),
            std::env::temp_dir(),
            "host-1".into(),
            SelfReference::default(),
            std::time::Duration::from_secs(5),
            Arc::new(crate::audit::NoopAuditSink),
        ))
    }

    #[tokio::test]
    async fn busy_without_queue_if_busy_reports_busy() {
        let progress = Arc::new(ProgressRegistry::new());
        let supervisor = Supervisor::new(test_engine(), progress);

        // occupy the slot directly.
        let _guard = supervisor.slot.clone().try_lock_owned().unwrap();

        let outcome = supervisor.start("c2", false, false);
        assert!(matches!(outcome, SubmitOutcome::Busy { .. }));
    }

    #[tokio::test]
    async fn busy_with_queue_if_busy_enqueues_and_returns_queued_progress() {
        let progress = Arc::new(ProgressRegistry::new());
        let supervisor = Supervisor::new(test_engine(), progress.clone());

        let _guard = supervisor.slot.clone().try_lock_owned().unwrap();

        let outcome = supervisor.start("c2", true, false);
        match outcome {
            SubmitOutcome::Accepted { progress_id, queued } => {
                assert!(queued);
                let record = progress.get(&progress_id).unwrap();
                assert_eq!(record.status, ProgressStatus::Queued);
            }
            _ => panic!("expected Accepted"),
        }
    }

    #[test]
    fn status_reports_queue_depth() {
        let progress = Arc::new(ProgressRegistry::new());
        let supervisor = Supervisor::new(test_engine(), progress);
        let status = supervisor.status();
        assert_eq!(status.queue_depth, 0);
        assert!(!status.slot_held);
    }
}
