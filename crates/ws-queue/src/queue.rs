//! Bounded in-process job queue feeding a fixed worker pool.
//!
//! Jobs are FIFO; each worker runs one job to completion before taking
//! another, so the number of simultaneously running jobs never exceeds the
//! pool size. A job only counts as *failed* on engine-level failure —
//! per-item sync errors still complete the job. Retries apply exponential
//! backoff and only fire for transient errors.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use ws_core::cancel::CancelFlag;
use ws_core::config::QueueConfig;
use ws_core::error::{Result, WsError};
use ws_core::types::{ExecutionTrigger, Job, JobState, SyncOptions};

use crate::events::{EventBus, JobEvent};
use crate::shutdown::ShutdownSignal;

/// Runs one job; implemented by the service layer around the sync engine.
#[async_trait]
pub trait JobExecutor: Send + Sync + 'static {
    async fn run(&self, job: &Job, cancel: CancelFlag) -> Result<serde_json::Value>;
}

#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub workers: usize,
    /// Maximum backlog of queued (not yet running) jobs.
    pub capacity: usize,
    pub max_attempts: u32,
    pub retry_backoff: Duration,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            workers: 5,
            capacity: 100,
            max_attempts: 3,
            retry_backoff: Duration::from_secs(1),
        }
    }
}

impl From<&QueueConfig> for QueueSettings {
    fn from(cfg: &QueueConfig) -> Self {
        Self {
            workers: cfg.workers,
            capacity: cfg.capacity,
            max_attempts: cfg.max_attempts,
            retry_backoff: Duration::from_millis(cfg.retry_backoff_ms),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct QueueCounts {
    pub queued: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
}

struct Inner {
    settings: QueueSettings,
    tx: flume::Sender<Uuid>,
    rx: flume::Receiver<Uuid>,
    jobs: DashMap<Uuid, Job>,
    cancels: DashMap<Uuid, CancelFlag>,
    events: EventBus,
    queued: AtomicUsize,
    active: AtomicUsize,
    completed: AtomicUsize,
    failed: AtomicUsize,
}

#[derive(Clone)]
pub struct JobQueue {
    inner: Arc<Inner>,
}

impl JobQueue {
    pub fn new(settings: QueueSettings) -> Self {
        let (tx, rx) = flume::unbounded();
        Self {
            inner: Arc::new(Inner {
                settings,
                tx,
                rx,
                jobs: DashMap::new(),
                cancels: DashMap::new(),
                events: EventBus::new(),
                queued: AtomicUsize::new(0),
                active: AtomicUsize::new(0),
                completed: AtomicUsize::new(0),
                failed: AtomicUsize::new(0),
            }),
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    /// Append a job to the FIFO. Refuses with [`WsError::QueueFull`] when the
    /// backlog is at capacity; callers must not blindly retry.
    pub fn enqueue(
        &self,
        config_id: Uuid,
        options: SyncOptions,
        trigger: ExecutionTrigger,
        payload: Option<serde_json::Value>,
    ) -> Result<Uuid> {
        if self.inner.queued.load(Ordering::SeqCst) >= self.inner.settings.capacity {
            return Err(WsError::QueueFull);
        }

        let mut job = Job::new(config_id, options, trigger);
        job.max_attempts = self.inner.settings.max_attempts;
        job.payload = payload;
        let id = job.id;

        self.inner.queued.fetch_add(1, Ordering::SeqCst);
        self.inner.jobs.insert(id, job.clone());
        self.inner.cancels.insert(id, CancelFlag::new());
        self.inner.events.publish(JobEvent::Queued { job });
        self.inner
            .tx
            .send(id)
            .map_err(|_| WsError::Execution("job channel closed".into()))?;

        debug!(job_id = %id, config_id = %config_id, "job enqueued");
        Ok(id)
    }

    /// The job record, if known.
    pub fn status(&self, id: Uuid) -> Option<Job> {
        self.inner.jobs.get(&id).map(|j| j.clone())
    }

    pub fn counts(&self) -> QueueCounts {
        QueueCounts {
            queued: self.inner.queued.load(Ordering::SeqCst),
            active: self.inner.active.load(Ordering::SeqCst),
            completed: self.inner.completed.load(Ordering::SeqCst),
            failed: self.inner.failed.load(Ordering::SeqCst),
        }
    }

    /// Request cancellation. A queued job is skipped when a worker picks it
    /// up; a running job aborts at its next check point.
    pub fn cancel(&self, id: Uuid) -> bool {
        match self.inner.cancels.get(&id) {
            Some(flag) => {
                flag.cancel();
                if let Some(mut job) = self.inner.jobs.get_mut(&id) {
                    if job.state == JobState::Queued {
                        job.state = JobState::Cancelled;
                    }
                }
                true
            }
            None => false,
        }
    }

    /// Spawn the worker pool. Workers exit on shutdown after finishing their
    /// current job.
    pub fn start(&self, executor: Arc<dyn JobExecutor>, shutdown: &ShutdownSignal) -> Vec<JoinHandle<()>> {
        (0..self.inner.settings.workers)
            .map(|worker_idx| {
                let queue = self.clone();
                let executor = executor.clone();
                let mut shutdown_rx = shutdown.subscribe();
                tokio::spawn(async move {
                    loop {
                        tokio::select! {
                            _ = shutdown_rx.recv() => break,
                            msg = queue.inner.rx.recv_async() => match msg {
                                Err(_) => break,
                                Ok(job_id) => queue.run_job(job_id, executor.as_ref(), worker_idx).await,
                            },
                        }
                    }
                    debug!(worker = worker_idx, "queue worker stopped");
                })
            })
            .collect()
    }

    async fn run_job(&self, job_id: Uuid, executor: &dyn JobExecutor, worker_idx: usize) {
        let inner = &self.inner;
        let cancel = inner
            .cancels
            .get(&job_id)
            .map(|f| f.clone())
            .unwrap_or_default();

        // Cancelled while still queued.
        if cancel.is_cancelled() {
            inner.queued.fetch_sub(1, Ordering::SeqCst);
            if let Some(mut job) = inner.jobs.get_mut(&job_id) {
                job.state = JobState::Cancelled;
                job.completed_at = Some(Utc::now());
            }
            if let Some(job) = self.status(job_id) {
                inner.events.publish(JobEvent::Cancelled { job });
            }
            return;
        }

        inner.queued.fetch_sub(1, Ordering::SeqCst);
        inner.active.fetch_add(1, Ordering::SeqCst);

        let job_snapshot = {
            let mut job = match inner.jobs.get_mut(&job_id) {
                Some(job) => job,
                None => {
                    inner.active.fetch_sub(1, Ordering::SeqCst);
                    return;
                }
            };
            job.state = JobState::Running;
            job.started_at = Some(Utc::now());
            job.clone()
        };
        info!(job_id = %job_id, worker = worker_idx, "job started");
        inner.events.publish(JobEvent::Started { job: job_snapshot.clone() });

        let mut attempts = 0u32;
        let outcome = loop {
            attempts += 1;
            if let Some(mut job) = inner.jobs.get_mut(&job_id) {
                job.attempts = attempts;
            }
            match executor.run(&job_snapshot, cancel.clone()).await {
                Ok(result) => break Ok(result),
                Err(e) => {
                    if cancel.is_cancelled() {
                        break Err(e);
                    }
                    if e.is_retryable() && attempts < job_snapshot.max_attempts {
                        let backoff = inner.settings.retry_backoff * 2u32.pow(attempts - 1);
                        warn!(
                            job_id = %job_id,
                            attempt = attempts,
                            backoff_ms = backoff.as_millis() as u64,
                            error = %e,
                            "transient failure; retrying"
                        );
                        tokio::time::sleep(backoff).await;
                        continue;
                    }
                    break Err(e);
                }
            }
        };

        let final_job = {
            let mut job = inner.jobs.get_mut(&job_id).expect("job record exists");
            job.completed_at = Some(Utc::now());
            match &outcome {
                Ok(result) => {
                    job.state = JobState::Completed;
                    job.result = Some(result.clone());
                }
                Err(e) => {
                    job.state = if cancel.is_cancelled() {
                        JobState::Cancelled
                    } else {
                        JobState::Failed
                    };
                    job.error = Some(e.to_string());
                }
            }
            job.clone()
        };

        inner.active.fetch_sub(1, Ordering::SeqCst);
        match final_job.state {
            JobState::Completed => {
                inner.completed.fetch_add(1, Ordering::SeqCst);
                info!(job_id = %job_id, "job completed");
                inner.events.publish(JobEvent::Completed { job: final_job });
            }
            JobState::Cancelled => {
                warn!(job_id = %job_id, "job cancelled");
                inner.events.publish(JobEvent::Cancelled { job: final_job });
            }
            _ => {
                inner.failed.fetch_add(1, Ordering::SeqCst);
                warn!(job_id = %job_id, error = ?final_job.error, "job failed");
                inner.events.publish(JobEvent::Failed { job: final_job });
            }
        }
        inner.cancels.remove(&job_id);
    }

    /// Wait for the backlog and in-flight jobs to finish, bounded by `grace`.
    /// Returns `true` when the queue fully drained.
    pub async fn drain(&self, grace: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + grace;
        loop {
            let counts = self.counts();
            if counts.queued == 0 && counts.active == 0 {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    queued = counts.queued,
                    active = counts.active,
                    "drain grace period expired"
                );
                return false;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
