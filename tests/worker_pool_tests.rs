//! At-least-once delivery across worker crashes, and the supervised worker
//! pool running against the SQL-backed queue.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use courier::config::DeliveryConfig;
use courier::engine::Engine;
use courier::executor::WorkerPool;
use courier::ingest::{CreateEvent, create_event};
use courier::metrics::DeliveryOutcome;
use courier::models::event_delivery::DeliveryStatus;
use courier::queue::{
    DeliveryQueue, InMemoryDeliveryQueue, Lease, QueueError, QueueJob, QueueResult, QueueStats,
};
use courier::repositories::{DeliveryFilter, PageRequest};
use courier::retry::RetryConfig;
use courier::scheduler::QueueMaintenance;
use courier::worker::DeliveryWorker;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

#[path = "test_utils/mod.rs"]
mod test_utils;
use test_utils::{
    insert_endpoint, insert_project, insert_subscription, lease_next, setup_test_db,
};

/// Engine on the default SQL queue and counter store.
async fn sql_engine(delivery: DeliveryConfig) -> Result<Engine> {
    let db = setup_test_db().await?;
    Ok(Engine::builder(db).delivery_config(delivery).build()?)
}

fn order_paid(project_id: Uuid) -> CreateEvent {
    CreateEvent {
        project_id,
        event_type: "order.paid".to_string(),
        payload: br#"{"order":{"id":"o-1","total":4200}}"#.to_vec(),
        ..Default::default()
    }
}

#[tokio::test]
async fn job_of_crashed_worker_is_reclaimed_and_delivered() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let engine = sql_engine(DeliveryConfig::default()).await?;
    let project = insert_project(&engine, true).await?;
    let endpoint = insert_endpoint(&engine, project.id, &server.uri(), &["whsec_a"]).await?;
    insert_subscription(&engine, project.id, endpoint.id, &["*"], RetryConfig::linear(10, 3)).await?;
    let result = create_event(&engine, order_paid(project.id)).await?;

    let maintenance = QueueMaintenance::new(engine.clone());
    assert_eq!(maintenance.promote_due().await?, 1);

    // A worker leases the job and dies before acknowledging it.
    let crashed = engine
        .queue
        .lease("crashed-worker", Duration::from_millis(1), Utc::now())
        .await?
        .expect("leased job");
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(maintenance.sweep().await?, 1);

    let lease = engine
        .queue
        .lease("worker-2", Duration::from_secs(120), Utc::now())
        .await?
        .expect("reclaimed job");
    assert_eq!(lease.job.delivery_id, crashed.job.delivery_id);
    assert_eq!(lease.delivery_count, 2);

    let worker = DeliveryWorker::new(engine.clone(), "worker-2");
    assert_eq!(worker.process(&lease).await?, DeliveryOutcome::Success);

    assert!(!engine.queue.ack(&crashed).await?);
    let delivery = engine
        .repos
        .deliveries
        .find_by_id(result.deliveries[0].id)
        .await?
        .unwrap();
    assert_eq!(delivery.delivery_status().unwrap(), DeliveryStatus::Success);

    let stats = engine.queue.stats().await?;
    assert_eq!((stats.scheduled, stats.ready, stats.pending), (0, 0, 0));
    Ok(())
}

#[tokio::test]
async fn pool_delivers_until_shutdown() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(202))
        .mount(&server)
        .await;

    let engine = sql_engine(DeliveryConfig {
        worker_count: 2,
        poll_interval_ms: 10,
        mover_interval_ms: 10,
        reclaim_interval_seconds: 1,
        ..DeliveryConfig::default()
    })
    .await?;
    let project = insert_project(&engine, true).await?;
    let endpoint = insert_endpoint(&engine, project.id, &server.uri(), &["whsec_a"]).await?;
    insert_subscription(&engine, project.id, endpoint.id, &["order.paid"], RetryConfig::linear(10, 3)).await?;

    let shutdown = CancellationToken::new();
    let pool = tokio::spawn(
        WorkerPool::new(engine.clone())
            .with_instance_name("test")
            .run(shutdown.clone()),
    );

    let mut delivery_ids = Vec::new();
    for _ in 0..3 {
        let result = create_event(&engine, order_paid(project.id)).await?;
        delivery_ids.extend(result.deliveries.iter().map(|d| d.id));
    }

    let repos = engine.repos.clone();
    let all_delivered = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let mut delivered = 0;
            for id in &delivery_ids {
                if let Some(delivery) = repos.deliveries.find_by_id(*id).await? {
                    if delivery.delivery_status().ok() == Some(DeliveryStatus::Success) {
                        delivered += 1;
                    }
                }
            }
            if delivered == delivery_ids.len() {
                return anyhow::Ok(());
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await;

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(5), pool).await??;

    all_delivered??;
    assert_eq!(server.received_requests().await.unwrap().len(), 3);
    Ok(())
}

/// In-memory queue whose `enqueue` fails while `down` is set.
#[derive(Default)]
struct FlakyQueue {
    inner: InMemoryDeliveryQueue,
    down: AtomicBool,
}

#[async_trait]
impl DeliveryQueue for FlakyQueue {
    async fn enqueue(&self, job: QueueJob, not_before: DateTime<Utc>) -> QueueResult<()> {
        if self.down.load(Ordering::SeqCst) {
            return Err(QueueError::Unavailable("enqueue refused".to_string()));
        }
        self.inner.enqueue(job, not_before).await
    }

    async fn promote_ready(&self, now: DateTime<Utc>, limit: u64) -> QueueResult<u64> {
        self.inner.promote_ready(now, limit).await
    }

    async fn lease(
        &self,
        consumer: &str,
        lease_timeout: Duration,
        now: DateTime<Utc>,
    ) -> QueueResult<Option<Lease>> {
        self.inner.lease(consumer, lease_timeout, now).await
    }

    async fn ack(&self, lease: &Lease) -> QueueResult<bool> {
        self.inner.ack(lease).await
    }

    async fn reschedule(&self, lease: &Lease, not_before: DateTime<Utc>) -> QueueResult<bool> {
        self.inner.reschedule(lease, not_before).await
    }

    async fn reclaim_expired(&self, now: DateTime<Utc>) -> QueueResult<u64> {
        self.inner.reclaim_expired(now).await
    }

    async fn cancel_waiting(&self, delivery_id: Uuid) -> QueueResult<u64> {
        self.inner.cancel_waiting(delivery_id).await
    }

    async fn tracks(&self, delivery_id: Uuid) -> QueueResult<bool> {
        self.inner.tracks(delivery_id).await
    }

    async fn stats(&self) -> QueueResult<QueueStats> {
        self.inner.stats().await
    }
}

#[tokio::test]
async fn delivery_left_without_queue_message_is_recovered() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let queue = Arc::new(FlakyQueue::default());
    let engine = Engine::builder(setup_test_db().await?)
        .queue(queue.clone())
        .build()?;
    let project = insert_project(&engine, true).await?;
    let endpoint = insert_endpoint(&engine, project.id, &server.uri(), &["whsec_a"]).await?;
    insert_subscription(&engine, project.id, endpoint.id, &["*"], RetryConfig::linear(10, 3)).await?;

    queue.down.store(true, Ordering::SeqCst);
    assert!(create_event(&engine, order_paid(project.id)).await.is_err());
    queue.down.store(false, Ordering::SeqCst);

    let stranded = engine
        .repos
        .deliveries
        .load_paged(&DeliveryFilter::for_project(project.id), PageRequest::first(10))
        .await?;
    assert_eq!(stranded.items.len(), 1);
    let delivery_id = stranded.items[0].id;
    assert!(!queue.tracks(delivery_id).await?);

    let maintenance = QueueMaintenance::new(engine.clone());
    // Not yet overdue by a full lease: left alone.
    assert_eq!(maintenance.sweep().await?, 0);
    assert!(!queue.tracks(delivery_id).await?);

    let horizon = Utc::now() + chrono::Duration::seconds(1);
    assert_eq!(maintenance.recover_stranded(horizon).await?, 1);
    assert_eq!(maintenance.recover_stranded(horizon).await?, 0);

    let lease = lease_next(queue.as_ref(), "worker-1").await?.expect("recovered job");
    assert_eq!(lease.job.delivery_id, delivery_id);
    let worker = DeliveryWorker::new(engine.clone(), "worker-1");
    assert_eq!(worker.process(&lease).await?, DeliveryOutcome::Success);
    Ok(())
}
