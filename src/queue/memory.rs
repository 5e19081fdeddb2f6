//! In-memory delivery queue.
//!
//! Not durable: all state is lost on process restart. The scheduling set is
//! a `BTreeMap` keyed by (score, sequence), the active stream a FIFO
//! `VecDeque`, and pending leases a `HashMap` by job id. Blocked leasers are
//! woken through a `Notify` whenever messages enter the stream.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use uuid::Uuid;

use super::{
    DeliveryQueue, Lease, QueueError, QueueJob, QueueResult, QueueStats, lease_expiry,
};

#[derive(Debug)]
struct Pending {
    job: QueueJob,
    token: Uuid,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Inner {
    scheduled: BTreeMap<(i64, u64), QueueJob>,
    ready: VecDeque<QueueJob>,
    pending: HashMap<Uuid, Pending>,
    delivery_counts: HashMap<Uuid, u32>,
    sequence: u64,
}

impl Inner {
    fn schedule(&mut self, job: QueueJob, not_before: DateTime<Utc>) {
        self.sequence += 1;
        self.scheduled
            .insert((not_before.timestamp_millis(), self.sequence), job);
    }
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryDeliveryQueue {
    inner: Arc<Mutex<Inner>>,
    notify: Arc<Notify>,
}

impl InMemoryDeliveryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> QueueResult<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| QueueError::Unavailable("in-memory queue lock poisoned".to_string()))
    }

    fn wake(&self) {
        self.notify.notify_waiters();
        self.notify.notify_one();
    }
}

#[async_trait]
impl DeliveryQueue for InMemoryDeliveryQueue {
    async fn enqueue(&self, job: QueueJob, not_before: DateTime<Utc>) -> QueueResult<()> {
        self.lock()?.schedule(job, not_before);
        Ok(())
    }

    async fn promote_ready(&self, now: DateTime<Utc>, limit: u64) -> QueueResult<u64> {
        let moved = {
            let mut inner = self.lock()?;
            let now_ms = now.timestamp_millis();
            let due: Vec<(i64, u64)> = inner
                .scheduled
                .range(..=(now_ms, u64::MAX))
                .take(limit as usize)
                .map(|(key, _)| *key)
                .collect();

            for key in &due {
                if let Some(job) = inner.scheduled.remove(key) {
                    inner.ready.push_back(job);
                }
            }
            due.len() as u64
        };

        if moved > 0 {
            self.wake();
        }
        Ok(moved)
    }

    async fn lease(
        &self,
        consumer: &str,
        lease_timeout: Duration,
        now: DateTime<Utc>,
    ) -> QueueResult<Option<Lease>> {
        let mut inner = self.lock()?;
        let Some(job) = inner.ready.pop_front() else {
            return Ok(None);
        };

        let token = Uuid::new_v4();
        let expires_at = lease_expiry(now, lease_timeout);
        let delivery_count = {
            let count = inner.delivery_counts.entry(job.id).or_insert(0);
            *count += 1;
            *count
        };
        inner.pending.insert(
            job.id,
            Pending {
                job,
                token,
                expires_at,
            },
        );

        Ok(Some(Lease {
            job,
            token,
            consumer: consumer.to_string(),
            expires_at,
            delivery_count,
        }))
    }

    async fn ack(&self, lease: &Lease) -> QueueResult<bool> {
        let mut inner = self.lock()?;
        let held = inner
            .pending
            .get(&lease.job.id)
            .is_some_and(|pending| pending.token == lease.token);
        if held {
            inner.pending.remove(&lease.job.id);
            inner.delivery_counts.remove(&lease.job.id);
        }
        Ok(held)
    }

    async fn reschedule(&self, lease: &Lease, not_before: DateTime<Utc>) -> QueueResult<bool> {
        let mut inner = self.lock()?;
        let held = inner
            .pending
            .get(&lease.job.id)
            .is_some_and(|pending| pending.token == lease.token);
        if held {
            inner.pending.remove(&lease.job.id);
            inner.schedule(lease.job, not_before);
        }
        Ok(held)
    }

    async fn reclaim_expired(&self, now: DateTime<Utc>) -> QueueResult<u64> {
        let reclaimed = {
            let mut inner = self.lock()?;
            let expired: Vec<Uuid> = inner
                .pending
                .iter()
                .filter(|(_, pending)| pending.expires_at <= now)
                .map(|(id, _)| *id)
                .collect();

            for id in &expired {
                if let Some(pending) = inner.pending.remove(id) {
                    inner.ready.push_back(pending.job);
                }
            }
            expired.len() as u64
        };

        if reclaimed > 0 {
            self.wake();
        }
        Ok(reclaimed)
    }

    async fn cancel_waiting(&self, delivery_id: Uuid) -> QueueResult<u64> {
        let mut inner = self.lock()?;
        let before = inner.scheduled.len() + inner.ready.len();
        inner.scheduled.retain(|_, job| job.delivery_id != delivery_id);
        inner.ready.retain(|job| job.delivery_id != delivery_id);
        let removed = before - (inner.scheduled.len() + inner.ready.len());
        Ok(removed as u64)
    }

    async fn tracks(&self, delivery_id: Uuid) -> QueueResult<bool> {
        let inner = self.lock()?;
        Ok(inner.scheduled.values().any(|job| job.delivery_id == delivery_id)
            || inner.ready.iter().any(|job| job.delivery_id == delivery_id)
            || inner
                .pending
                .values()
                .any(|pending| pending.job.delivery_id == delivery_id))
    }

    async fn stats(&self) -> QueueResult<QueueStats> {
        let inner = self.lock()?;
        Ok(QueueStats {
            scheduled: inner.scheduled.len() as u64,
            ready: inner.ready.len() as u64,
            pending: inner.pending.len() as u64,
        })
    }

    async fn wait_for_work(&self, timeout: Duration) {
        let _ = tokio::time::timeout(timeout, self.notify.notified()).await;
    }
}
