//! The worksync background daemon: wires the store, vault, registry, queue,
//! scheduler, and bridge together and owns the shutdown ordering.
//!
//! Shutdown drains in a fixed order: the scheduler stops enqueueing first,
//! then the queue finishes in-flight jobs within a bounded grace period,
//! then the store closes.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, warn};

use ws_bridge::{router, BridgeState, SyncService};
use ws_connectors::registry::ConnectorRegistry;
use ws_core::config::Config;
use ws_core::store::Store;
use ws_core::vault::Vault;
use ws_mapping::MappingEngine;
use ws_queue::{CronScheduler, JobQueue, QueueSettings, ShutdownSignal};

pub struct Daemon {
    config: Config,
    store: Arc<Store>,
    service: Arc<SyncService>,
    queue: JobQueue,
    scheduler: CronScheduler,
    shutdown: ShutdownSignal,
}

impl std::fmt::Debug for Daemon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Daemon").finish_non_exhaustive()
    }
}

impl Daemon {
    /// Build the component graph. The vault secret comes from the
    /// environment variable named in the config.
    pub async fn new(config: Config) -> Result<Self> {
        let secret = std::env::var(&config.general.secret_env).with_context(|| {
            format!(
                "vault secret missing: set the {} environment variable",
                config.general.secret_env
            )
        })?;
        let vault = Arc::new(Vault::from_secret(&secret)?);

        let store = Arc::new(
            Store::open(&config.store.path)
                .await
                .context("failed to open the worksync database")?,
        );
        let registry = Arc::new(ConnectorRegistry::with_default_drivers(
            store.clone(),
            vault,
        ));
        let mapping = Arc::new(MappingEngine::new(store.clone()));
        let queue = JobQueue::new(QueueSettings::from(&config.queue));
        let service = Arc::new(SyncService::new(
            store.clone(),
            registry,
            mapping,
            queue.clone(),
        ));
        let scheduler = CronScheduler::new(
            store.clone(),
            queue.clone(),
            Duration::from_secs(config.scheduler.tick_secs),
        );

        Ok(Self {
            config,
            store,
            service,
            queue,
            scheduler,
            shutdown: ShutdownSignal::new(),
        })
    }

    pub fn shutdown_handle(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    pub fn service(&self) -> &Arc<SyncService> {
        &self.service
    }

    /// Run until the shutdown signal fires, then drain in order.
    pub async fn run(self) -> Result<()> {
        let worker_handles = self.queue.start(self.service.clone(), &self.shutdown);
        let scheduler_handle = self.scheduler.start(&self.shutdown).await?;
        info!(
            workers = worker_handles.len(),
            bind = %self.config.bridge.bind,
            "worksync daemon started"
        );

        // ctrl-c triggers the same cooperative shutdown as an API call.
        {
            let shutdown = self.shutdown.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    shutdown.trigger();
                }
            });
        }

        let app = router(
            BridgeState::new(self.service.clone()),
            self.config.bridge.api_key.clone(),
        );
        let listener = tokio::net::TcpListener::bind(&self.config.bridge.bind)
            .await
            .with_context(|| format!("failed to bind {}", self.config.bridge.bind))?;
        let mut serve_shutdown = self.shutdown.subscribe();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = serve_shutdown.recv().await;
            })
            .await
            .context("bridge server failed")?;

        // Scheduler first: no new jobs while the queue drains.
        self.scheduler.stop();
        let _ = scheduler_handle.await;

        let grace = Duration::from_secs(self.config.queue.drain_grace_secs);
        if !self.queue.drain(grace).await {
            warn!("jobs still in flight after the drain grace period");
        }
        for handle in worker_handles {
            handle.abort();
        }

        // Everything else holds only clones; release ours and close the
        // store if we are the last owner.
        let Self { store, service, .. } = self;
        drop(service);
        match Arc::try_unwrap(store) {
            Ok(store) => store.close().await?,
            Err(_) => warn!("store still shared at shutdown; skipping explicit close"),
        }
        info!("worksync daemon stopped");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
