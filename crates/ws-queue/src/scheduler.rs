//! Cron scheduler: time-based trigger that enqueues sync jobs.
//!
//! Maintains one entry per active config with `trigger_kind = scheduled`.
//! The tick loop only ever *enqueues* — execution stays in the worker pool.
//! Expressions use the 6/7-field cron form with a leading seconds field
//! (e.g. `0 */5 * * * *` for every five minutes).

use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use ws_core::error::{Result, WsError};
use ws_core::store::Store;
use ws_core::types::{ExecutionTrigger, SyncOptions, TriggerKind};

use crate::queue::JobQueue;
use crate::shutdown::ShutdownSignal;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SchedulerStatus {
    pub is_running: bool,
    pub job_count: usize,
}

struct ScheduleEntry {
    schedule: Schedule,
    next_fire: DateTime<Utc>,
}

pub struct CronScheduler {
    store: Arc<Store>,
    queue: JobQueue,
    entries: Arc<DashMap<Uuid, ScheduleEntry>>,
    running: Arc<AtomicBool>,
    tick: Duration,
}

impl CronScheduler {
    pub fn new(store: Arc<Store>, queue: JobQueue, tick: Duration) -> Self {
        Self {
            store,
            queue,
            entries: Arc::new(DashMap::new()),
            running: Arc::new(AtomicBool::new(false)),
            tick,
        }
    }

    fn parse_expr(expr: &str) -> Result<Schedule> {
        Schedule::from_str(expr)
            .map_err(|e| WsError::Configuration(format!("malformed cron expression '{expr}': {e}")))
    }

    /// Load all active scheduled configs, register their entries, and spawn
    /// the tick loop.
    pub async fn start(&self, shutdown: &ShutdownSignal) -> Result<JoinHandle<()>> {
        for config in self.store.list_scheduled_configs().await? {
            let Some(expr) = &config.cron_expr else { continue };
            match Self::parse_expr(expr) {
                Ok(schedule) => {
                    self.register(config.id, schedule);
                }
                Err(e) => {
                    warn!(config_id = %config.id, error = %e, "skipping config with bad cron");
                }
            }
        }
        self.running.store(true, Ordering::SeqCst);
        info!(entries = self.entries.len(), "cron scheduler started");

        let entries = self.entries.clone();
        let queue = self.queue.clone();
        let running = self.running.clone();
        let tick = self.tick;
        let mut shutdown_rx = shutdown.subscribe();
        Ok(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = tokio::time::sleep(tick) => {
                        if !running.load(Ordering::SeqCst) {
                            break;
                        }
                        Self::fire_due(&entries, &queue);
                    }
                }
            }
            running.store(false, Ordering::SeqCst);
            info!("cron scheduler stopped");
        }))
    }

    fn fire_due(entries: &DashMap<Uuid, ScheduleEntry>, queue: &JobQueue) {
        let now = Utc::now();
        for mut entry in entries.iter_mut() {
            let config_id = *entry.key();
            if entry.next_fire > now {
                continue;
            }
            match queue.enqueue(
                config_id,
                SyncOptions::default(),
                ExecutionTrigger::Scheduled,
                None,
            ) {
                Ok(job_id) => {
                    info!(config_id = %config_id, job_id = %job_id, "scheduled sync enqueued")
                }
                Err(e) => warn!(config_id = %config_id, error = %e, "scheduled enqueue refused"),
            }
            // Advance past now so a slow tick cannot double-fire.
            let next = entry.value().schedule.after(&now).next();
            if let Some(next) = next {
                entry.value_mut().next_fire = next;
            }
        }
    }

    fn register(&self, config_id: Uuid, schedule: Schedule) {
        let next_fire = schedule
            .after(&Utc::now())
            .next()
            .unwrap_or_else(Utc::now);
        self.entries.insert(
            config_id,
            ScheduleEntry {
                schedule,
                next_fire,
            },
        );
    }

    /// Register (or replace) a schedule and persist it on the config.
    pub async fn schedule(&self, config_id: Uuid, cron_expr: &str) -> Result<()> {
        let schedule = Self::parse_expr(cron_expr)?;
        let mut config = self
            .store
            .get_sync_config(config_id)
            .await?
            .ok_or_else(|| WsError::Configuration(format!("sync config {config_id} not found")))?;
        config.trigger_kind = TriggerKind::Scheduled;
        config.cron_expr = Some(cron_expr.to_string());
        self.store.update_sync_config(&config).await?;

        self.register(config_id, schedule);
        info!(config_id = %config_id, cron = cron_expr, "sync scheduled");
        Ok(())
    }

    /// Remove a schedule and persist the change.
    pub async fn unschedule(&self, config_id: Uuid) -> Result<()> {
        self.entries.remove(&config_id);
        if let Some(mut config) = self.store.get_sync_config(config_id).await? {
            config.trigger_kind = TriggerKind::Manual;
            config.cron_expr = None;
            self.store.update_sync_config(&config).await?;
        }
        info!(config_id = %config_id, "sync unscheduled");
        Ok(())
    }

    pub fn status(&self) -> SchedulerStatus {
        SchedulerStatus {
            is_running: self.running.load(Ordering::SeqCst),
            job_count: self.entries.len(),
        }
    }

    /// Stop firing; the tick loop exits on its next wake-up.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
