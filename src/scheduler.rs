//! # Queue Maintenance
//!
//! Background loops that keep the delivery queue moving:
//!
//! - the **mover** promotes due entries from the scheduling set into the
//!   active stream every `mover_interval_ms`;
//! - the **reclaimer** returns expired leases to the stream, re-enqueues
//!   deliveries left without a queue message, publishes queue depth and
//!   purges closed rate-limit windows every `reclaim_interval_seconds`.
//!
//! Both are safe to run in several processes at once; the queue backends
//! make every move a claim.

use chrono::{DateTime, Utc};
use metrics::histogram;
use tokio::time::{Duration, Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::engine::Engine;
use crate::error::EngineError;
use crate::queue::QueueJob;

#[derive(Clone)]
pub struct QueueMaintenance {
    engine: Engine,
}

impl QueueMaintenance {
    pub fn new(engine: Engine) -> Self {
        Self { engine }
    }

    /// Run the mover until `shutdown` fires.
    #[instrument(skip_all)]
    pub async fn run_mover(self, shutdown: CancellationToken) {
        let interval = Duration::from_millis(self.engine.config.mover_interval_ms);
        info!(interval_ms = interval.as_millis() as u64, "Starting queue mover");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = sleep(interval) => {
                    let started = Instant::now();
                    if let Err(err) = self.promote_due().await {
                        self.engine.metrics.queue_error("promote");
                        error!(error = %err, "Queue mover tick failed");
                    }
                    histogram!("courier_queue_mover_tick_duration_ms")
                        .record(started.elapsed().as_secs_f64() * 1_000.0);
                }
            }
        }

        info!("Queue mover stopped");
    }

    /// Run the reclaim sweep until `shutdown` fires.
    #[instrument(skip_all)]
    pub async fn run_reclaimer(self, shutdown: CancellationToken) {
        let interval = Duration::from_secs(self.engine.config.reclaim_interval_seconds);
        info!(interval_s = interval.as_secs(), "Starting lease reclaimer");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = sleep(interval) => {
                    if let Err(err) = self.sweep().await {
                        self.engine.metrics.queue_error("reclaim");
                        error!(error = %err, "Reclaim sweep failed");
                    }
                }
            }
        }

        info!("Lease reclaimer stopped");
    }

    /// Promote due entries in batches until none remain. Returns how many
    /// moved.
    pub async fn promote_due(&self) -> Result<u64, EngineError> {
        let batch = self.engine.config.mover_batch_size;
        let mut total = 0;

        loop {
            let moved = self.engine.queue.promote_ready(Utc::now(), batch).await?;
            total += moved;
            if moved < batch {
                break;
            }
        }

        if total > 0 {
            self.engine.metrics.jobs_promoted(total);
            debug!(promoted = total, "Promoted due deliveries");
        }
        Ok(total)
    }

    /// One reclaim pass: expired leases, queue gauges, counter purge.
    pub async fn sweep(&self) -> Result<u64, EngineError> {
        let now = Utc::now();
        let reclaimed = self.engine.queue.reclaim_expired(now).await?;
        if reclaimed > 0 {
            self.engine.metrics.leases_reclaimed(reclaimed);
            warn!(reclaimed, "Reclaimed expired delivery leases");
        }

        // A delivery only counts as stranded once it has been overdue for a
        // full lease, so an ingest still between its two writes is left alone.
        let lease = chrono::Duration::seconds(self.engine.config.lease_timeout_seconds as i64);
        let recovered = self.recover_stranded(now - lease).await?;
        if recovered > 0 {
            warn!(recovered, "Re-enqueued deliveries that had no queue message");
        }

        let stats = self.engine.queue.stats().await?;
        self.engine.metrics.queue_stats(&stats);

        match self.engine.rate_limiter.purge_expired(now).await {
            Ok(purged) if purged > 0 => debug!(purged, "Purged closed rate limit windows"),
            Ok(_) => {}
            Err(err) => warn!(error = %err, "Failed to purge rate limit counters"),
        }

        debug!(
            scheduled = stats.scheduled,
            ready = stats.ready,
            pending = stats.pending,
            "Reclaim sweep completed"
        );
        Ok(reclaimed)
    }

    /// Give a fresh automatic job to every waiting delivery due at or before
    /// `due_before` that has no queue message at all. Covers a crash or a
    /// queue error between writing a delivery and enqueueing it.
    pub async fn recover_stranded(&self, due_before: DateTime<Utc>) -> Result<u64, EngineError> {
        let candidates = self
            .engine
            .repos
            .deliveries
            .find_stranded(due_before, self.engine.config.mover_batch_size)
            .await?;

        let now = Utc::now();
        let mut recovered = 0;
        for delivery in candidates {
            if self.engine.queue.tracks(delivery.id).await? {
                continue;
            }
            self.engine
                .queue
                .enqueue(QueueJob::new(delivery.id, delivery.project_id, false), now)
                .await?;
            debug!(delivery_id = %delivery.id, status = %delivery.status, "Recovered stranded delivery");
            recovered += 1;
        }
        Ok(recovered)
    }
}
