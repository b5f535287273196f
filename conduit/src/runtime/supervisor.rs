use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Duration;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, Mutex, Notify};
use tracing::Instrument;

use crate::breaker::{BreakerSnapshot, BreakerStore};
use crate::correlation::CorrelationId;
use crate::events::ItemEvent;
use crate::item::{EnqueueRequest, ItemId};
use crate::lease::ItemLease;
use crate::manager::QueueManager;
use crate::queue::{LeaseExpiryScanner, QueueStats, QueueStore};
use crate::run::{IntegrationRun, RunTracker};
use crate::telemetry;

use super::handler::{HandlerRegistry, JobHandler};
use super::worker::{execute_guarded, WorkerConfig};

/// Configuration for the worker runtime.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Lease time-to-live in seconds.
    pub lease_ttl_secs: i64,
    /// Minimum margin before lease expiry for renewal attempts.
    pub renew_min_margin_secs: i64,
    /// Fraction of lease TTL at which to attempt renewal.
    pub renew_at_fraction: f32,
    /// Interval between housekeeper runs in milliseconds.
    pub housekeeper_interval_ms: u64,
    /// Upper bound on a single handler invocation.
    pub handler_timeout_secs: u64,
    /// Idle sleep when a queue has nothing claimable.
    pub poll_interval_ms: u64,
    /// Sleep after a store error before polling again.
    pub error_backoff_ms: u64,
    /// How long shutdown waits for each worker.
    pub shutdown_grace_secs: u64,
    /// When set, the housekeeper purges completed/dead items older than this.
    pub retention_secs: Option<u64>,
    /// Buffered lifecycle events per subscriber.
    pub event_capacity: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            lease_ttl_secs: 30,
            renew_min_margin_secs: 2,
            renew_at_fraction: 0.5,
            housekeeper_interval_ms: 5000,
            handler_timeout_secs: 1800,
            poll_interval_ms: 250,
            error_backoff_ms: 1000,
            shutdown_grace_secs: 30,
            retention_secs: None,
            event_capacity: 1024,
        }
    }
}

impl RuntimeConfig {
    pub fn lease_ttl(&self) -> Duration {
        Duration::seconds(self.lease_ttl_secs)
    }
}

/// Cancellation flag shared by the housekeeper and every worker task.
#[derive(Clone, Debug)]
pub struct ShutdownToken {
    inner: Arc<ShutdownTokenInner>,
}

#[derive(Debug)]
struct ShutdownTokenInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl ShutdownToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ShutdownTokenInner {
                cancelled: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    /// Signal cancellation.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Wait until cancelled.
    pub async fn cancelled(&self) {
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        // register before checking so a concurrent cancel cannot slip between
        notified.as_mut().enable();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

impl Default for ShutdownToken {
    fn default() -> Self {
        Self::new()
    }
}

/// The integration job engine: queue manager, handler registry, worker
/// pools and housekeeping behind one handle.
pub struct IntegrationEngine<Q, B> {
    config: RuntimeConfig,
    manager: Arc<QueueManager<Q, B>>,
    runs: RunTracker<Q>,
    handlers: Arc<HandlerRegistry>,
    shutdown_token: ShutdownToken,
    worker_handles: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl<Q, B> fmt::Debug for IntegrationEngine<Q, B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IntegrationEngine")
            .field("config", &self.config)
            .field("manager", &self.manager)
            .field("handlers", &self.handlers)
            .field("shutdown", &self.shutdown_token.is_cancelled())
            .finish()
    }
}

impl<Q, B> IntegrationEngine<Q, B>
where
    Q: QueueStore + LeaseExpiryScanner + 'static,
    B: BreakerStore + 'static,
{
    pub fn new(
        config: RuntimeConfig,
        manager: Arc<QueueManager<Q, B>>,
        handlers: Arc<HandlerRegistry>,
    ) -> Self {
        let runs = RunTracker::new(manager.store());
        Self {
            config,
            manager,
            runs,
            handlers,
            shutdown_token: ShutdownToken::new(),
            worker_handles: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn manager(&self) -> Arc<QueueManager<Q, B>> {
        Arc::clone(&self.manager)
    }

    pub fn handlers(&self) -> Arc<HandlerRegistry> {
        Arc::clone(&self.handlers)
    }

    pub fn shutdown_token(&self) -> ShutdownToken {
        self.shutdown_token.clone()
    }

    /// Register the handler for a queue. Items dispatched before this call
    /// were marked `failed` and can be requeued.
    pub fn register_handler(
        &self,
        queue_name: impl Into<String>,
        handler: Arc<dyn JobHandler>,
    ) -> anyhow::Result<()> {
        Ok(self.handlers.register(queue_name, handler)?)
    }

    pub async fn enqueue(&self, request: EnqueueRequest) -> anyhow::Result<ItemId> {
        Ok(self.manager.enqueue(request).await?.id)
    }

    /// Enqueue a batch atomically.
    pub async fn enqueue_many(&self, requests: Vec<EnqueueRequest>) -> anyhow::Result<Vec<ItemId>> {
        let items = self.manager.enqueue_many(requests).await?;
        Ok(items.into_iter().map(|item| item.id).collect())
    }

    pub async fn get_run_status(
        &self,
        correlation_id: &CorrelationId,
    ) -> anyhow::Result<IntegrationRun> {
        self.runs.get_run(correlation_id).await
    }

    pub async fn get_queue_stats(&self, queue_name: &str) -> anyhow::Result<QueueStats> {
        self.manager.stats(queue_name).await
    }

    pub async fn get_all_queue_stats(&self) -> anyhow::Result<Vec<QueueStats>> {
        self.manager.all_stats().await
    }

    /// Requeue `failed`/`dead` items of a queue that finished at least
    /// `older_than_secs` ago.
    pub async fn requeue(
        &self,
        queue_name: &str,
        older_than_secs: u64,
        reset_attempts: bool,
    ) -> anyhow::Result<u64> {
        self.manager
            .requeue(queue_name, secs(older_than_secs), reset_attempts)
            .await
    }

    pub async fn requeue_item(
        &self,
        item_id: ItemId,
        older_than_secs: u64,
        reset_attempts: bool,
    ) -> anyhow::Result<bool> {
        self.manager
            .requeue_item(item_id, secs(older_than_secs), reset_attempts)
            .await
    }

    pub async fn cleanup(&self, queue_name: &str, older_than_secs: u64) -> anyhow::Result<u64> {
        self.manager.cleanup(queue_name, secs(older_than_secs)).await
    }

    pub async fn get_breaker_state(&self, dependency: &str) -> anyhow::Result<BreakerSnapshot> {
        let now = self.manager.clock().now();
        self.manager.breakers().snapshot(dependency, now).await
    }

    pub async fn get_all_breaker_states(&self) -> anyhow::Result<Vec<BreakerSnapshot>> {
        self.manager.breakers().snapshots().await
    }

    pub async fn reset_breaker(&self, dependency: &str) -> anyhow::Result<BreakerSnapshot> {
        let now = self.manager.clock().now();
        self.manager.breakers().reset(dependency, now).await
    }

    /// Subscribe to item lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<ItemEvent> {
        self.manager.events().subscribe()
    }

    /// Start background housekeeping.
    pub async fn start(&self) -> anyhow::Result<()> {
        self.spawn_housekeeper().await;
        Ok(())
    }

    /// Gracefully shut down the housekeeper and all workers.
    ///
    /// Workers finish the item in hand (bounded by the handler timeout);
    /// anything still running after the grace period keeps its lease and
    /// is reclaimed later.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        tracing::info!("initiating graceful shutdown of integration engine");

        self.shutdown_token.cancel();

        let handles = {
            let mut guard = self.worker_handles.lock().await;
            std::mem::take(&mut *guard)
        };

        let grace = std::time::Duration::from_secs(self.config.shutdown_grace_secs);
        for handle in handles {
            match tokio::time::timeout(grace, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!("worker task failed: {:?}", e),
                Err(_) => tracing::warn!("worker task timed out during shutdown"),
            }
        }

        tracing::info!("integration engine shutdown complete");
        Ok(())
    }

    /// Spawn `parallelism` workers claiming from `queue_name`.
    pub async fn spawn_worker_pool(&self, queue_name: &str, parallelism: usize) {
        let worker_group = format!("{}-{}", queue_name, std::process::id());

        for i in 0..parallelism {
            let worker = WorkerConfig::from_runtime(
                format!("{}-w{}", worker_group, i),
                queue_name,
                &self.config,
            );
            let manager = self.manager();
            let handlers = self.handlers();
            let shutdown = self.shutdown_token.clone();

            let handle = tokio::spawn(async move {
                Self::worker_loop(worker, manager, handlers, shutdown).await;
            });

            let mut handles = self.worker_handles.lock().await;
            handles.push(handle);
        }

        tracing::info!(queue = queue_name, parallelism, "worker pool started");
    }

    /// Spawn the task that reclaims expired leases and, when retention is
    /// configured, purges old finished items.
    pub async fn spawn_housekeeper(&self) {
        let manager = self.manager();
        let interval = std::time::Duration::from_millis(self.config.housekeeper_interval_ms);
        let retention = self.config.retention_secs.map(secs);
        let shutdown = self.shutdown_token.clone();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::info!("housekeeper shutting down");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {
                        Self::housekeep(&manager, retention).await;
                    }
                }
            }
        });

        self.worker_handles.lock().await.push(handle);
    }

    async fn housekeep(manager: &QueueManager<Q, B>, retention: Option<Duration>) {
        match manager.reclaim_expired().await {
            Ok(0) => {}
            Ok(reclaimed) => tracing::info!(reclaimed, "expired leases reclaimed"),
            Err(err) => tracing::warn!("housekeeper reclaim_expired error: {err}"),
        }

        let Some(retention) = retention else {
            return;
        };
        let queues = match manager.store().queue_names().await {
            Ok(queues) => queues,
            Err(err) => {
                tracing::warn!("housekeeper queue listing error: {err}");
                return;
            }
        };
        for queue in queues {
            if let Err(err) = manager.cleanup(&queue, retention).await {
                tracing::warn!(queue = %queue, "housekeeper cleanup error: {err}");
            }
        }
    }

    async fn worker_loop(
        worker: WorkerConfig,
        manager: Arc<QueueManager<Q, B>>,
        handlers: Arc<HandlerRegistry>,
        shutdown: ShutdownToken,
    ) {
        loop {
            if shutdown.is_cancelled() {
                tracing::info!("worker {} shutting down", worker.worker_id);
                break;
            }

            let idle = match manager.claim_next(&worker.queue_name, &worker.worker_id).await {
                Ok(Some(lease)) => {
                    Self::process(&worker, &manager, &handlers, lease).await;
                    continue;
                }
                Ok(None) => worker.poll_interval(),
                Err(err) => {
                    tracing::warn!(worker_id = %worker.worker_id, "claim error: {err}");
                    worker.error_backoff()
                }
            };

            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(idle) => {}
            }
        }
    }

    async fn process(
        worker: &WorkerConfig,
        manager: &Arc<QueueManager<Q, B>>,
        handlers: &HandlerRegistry,
        lease: ItemLease,
    ) {
        let queue_name = lease.item.queue_name.clone();

        let Some(handler) = handlers.get(&queue_name) else {
            let error = format!("no handler registered for queue {queue_name:?}");
            tracing::error!(item_id = %lease.item.id, "{error}");
            if let Err(err) = manager.reject(&lease, error).await {
                tracing::error!(item_id = %lease.item.id, "queue reject error: {err}");
            }
            return;
        };

        let lease = match manager.start(lease).await {
            Ok(Some(lease)) => lease,
            Ok(None) => return,
            Err(err) => {
                // left claimed; the housekeeper reclaims it once the lease lapses
                tracing::error!("queue start error: {err}");
                return;
            }
        };

        let (cancel_tx, cancel_rx) = mpsc::channel::<()>(1);
        let renew_handle = tokio::spawn(Self::renew_loop(
            worker.clone(),
            Arc::clone(manager),
            lease.clone(),
            cancel_rx,
        ));

        let item_id = lease.item.id.to_string();
        let timing = telemetry::record_item_start(&item_id);
        let outcome = telemetry::instrument_execute(
            &item_id,
            &queue_name,
            &lease.item.dependency,
            execute_guarded(handler, lease.item.payload.clone(), worker.handler_timeout()),
        )
        .await;

        let _ = cancel_tx.try_send(());
        let _ = renew_handle.await;

        let label = outcome.label();
        let settled = match outcome.failure_class() {
            None => manager.complete(&lease).await.map(|_| ()),
            Some(class) => manager
                .fail(&lease, class, outcome.error().unwrap_or_default())
                .await
                .map(|_| ()),
        };
        telemetry::record_item_end(timing, &queue_name, label);

        if let Err(err) = settled {
            // the lease will lapse and the housekeeper retries the item
            tracing::error!(item_id = %item_id, "queue settle error: {err}");
        }
    }

    async fn renew_loop(
        worker: WorkerConfig,
        manager: Arc<QueueManager<Q, B>>,
        lease: ItemLease,
        mut cancel_rx: mpsc::Receiver<()>,
    ) {
        let clock = manager.clock();
        let mut lease = lease;
        let span = telemetry::lease_renew_span(lease.lease_id.to_string(), lease.item.id.to_string());

        async move {
            loop {
                let sleep_dur = worker.renew_delay(lease.expires_at, clock.now());

                tokio::select! {
                    _ = tokio::time::sleep(sleep_dur) => {}
                    _ = cancel_rx.recv() => { break; }
                }

                if lease.is_expired(clock.now()) {
                    tracing::warn!("lease expired before it could be renewed");
                    break;
                }
                match manager.renew(&lease).await {
                    Ok(Some(updated)) => lease.expires_at = updated,
                    Ok(None) => {
                        tracing::warn!("lease lost while handler running");
                        break;
                    }
                    Err(err) => {
                        tracing::warn!("lease renew error: {err}");
                        tokio::select! {
                            _ = tokio::time::sleep(worker.error_backoff()) => {}
                            _ = cancel_rx.recv() => { break; }
                        }
                    }
                }
            }
        }
        .instrument(span)
        .await
    }
}

/// Ages beyond this are treated as "forever" so `now - age` cannot overflow.
const MAX_AGE_SECS: u64 = 100 * 365 * 24 * 60 * 60;

fn secs(secs: u64) -> Duration {
    Duration::seconds(secs.min(MAX_AGE_SECS) as i64)
}
