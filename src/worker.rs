//! # Dispatch Worker
//!
//! Processes one leased queue job end to end: re-validates the delivery,
//! its subscription and endpoint, consults the rate limiter, signs and sends
//! the payload, records the attempt, then settles or reschedules the job.
//!
//! Every status write is conditional on the status the worker expects, so a
//! job reclaimed from a crashed worker and processed twice can never move a
//! settled delivery. Storage or queue errors leave the lease in place; the
//! reclaim sweep hands the job to another worker once the lease expires.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::dispatcher::{DispatchOutcome, DispatchRequest, delivery_headers, headers_to_json};
use crate::engine::Engine;
use crate::error::EngineError;
use crate::health::{EndpointHealth, HealthSignal};
use crate::metrics::{DeliveryOutcome, status_class};
use crate::models::endpoint::{self, EndpointStatus};
use crate::models::event_delivery::{self, DeliveryStatus};
use crate::models::{event, subscription};
use crate::notifier::FailureAlert;
use crate::queue::{Lease, lease_blocking};
use crate::rate_limiter::endpoint_key;
use crate::repositories::{DeliveryUpdate, NewDeliveryAttempt};
use crate::retry::RetryConfig;
use crate::signature::{self, Secret};

/// A delivery that passed every precondition and is ready to send.
struct Prepared {
    delivery: event_delivery::Model,
    subscription: subscription::Model,
    endpoint: endpoint::Model,
}

pub struct DeliveryWorker {
    engine: Engine,
    consumer: String,
}

impl DeliveryWorker {
    pub fn new(engine: Engine, consumer: impl Into<String>) -> Self {
        Self {
            engine,
            consumer: consumer.into(),
        }
    }

    pub fn consumer(&self) -> &str {
        &self.consumer
    }

    /// Lease and process jobs until `shutdown` fires. A job in flight when
    /// shutdown is requested is finished first.
    pub async fn run(self, shutdown: CancellationToken) {
        let config = self.engine.config.clone();
        let lease_timeout = Duration::from_secs(config.lease_timeout_seconds);
        let poll_interval = Duration::from_millis(config.poll_interval_ms);
        let max_backoff = Duration::from_millis(config.queue_error_backoff_max_ms);
        let mut backoff = poll_interval;

        info!(consumer = %self.consumer, "Delivery worker started");

        loop {
            let leased = lease_blocking(
                self.engine.queue.as_ref(),
                &self.consumer,
                lease_timeout,
                poll_interval,
                &shutdown,
            )
            .await;

            match leased {
                Ok(None) => break,
                Ok(Some(lease)) => {
                    backoff = poll_interval;
                    let span = info_span!(
                        "deliver",
                        consumer = %self.consumer,
                        delivery_id = %lease.job.delivery_id,
                        project_id = %lease.job.project_id,
                        manual = lease.job.manual,
                        lease_count = lease.delivery_count,
                    );
                    if let Err(err) = self.process(&lease).instrument(span).await {
                        self.engine.metrics.queue_error("process");
                        error!(
                            consumer = %self.consumer,
                            delivery_id = %lease.job.delivery_id,
                            error = %err,
                            "Delivery processing failed; job left for reclaim"
                        );
                    }
                }
                Err(err) => {
                    self.engine.metrics.queue_error("lease");
                    warn!(
                        consumer = %self.consumer,
                        error = %err,
                        backoff_ms = backoff.as_millis() as u64,
                        "Queue lease failed; backing off"
                    );
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(max_backoff);
                }
            }
        }

        info!(consumer = %self.consumer, "Delivery worker stopped");
    }

    /// Process one leased job and settle its lease.
    pub async fn process(&self, lease: &Lease) -> Result<DeliveryOutcome, EngineError> {
        let now = Utc::now();
        let outcome = match self.prepare(lease).await? {
            Ok(prepared) => match self.limit(lease, &prepared, now).await? {
                Some(outcome) => outcome,
                None => self.deliver(lease, prepared, now).await?,
            },
            Err(outcome) => outcome,
        };

        self.engine.metrics.delivery_outcome(outcome);
        Ok(outcome)
    }

    /// Steps 1 and 2: the delivery must still want work, and its
    /// subscription and endpoint must still accept it.
    async fn prepare(
        &self,
        lease: &Lease,
    ) -> Result<Result<Prepared, DeliveryOutcome>, EngineError> {
        let repos = &self.engine.repos;

        let Some(delivery) = repos.deliveries.find_by_id(lease.job.delivery_id).await? else {
            debug!("Delivery no longer exists; dropping job");
            self.ack(lease).await?;
            return Ok(Err(DeliveryOutcome::Skipped));
        };

        match delivery.delivery_status() {
            Ok(status) if status.is_settled() => {
                debug!(status = %status, "Delivery already settled; dropping job");
                self.ack(lease).await?;
                return Ok(Err(DeliveryOutcome::Skipped));
            }
            Ok(_) => {}
            Err(reason) => {
                return self
                    .fail(lease, &delivery, format!("corrupt delivery status: {reason}"))
                    .await
                    .map(Err);
            }
        }

        let Some(endpoint) = repos.endpoints.find_by_id(delivery.endpoint_id).await? else {
            return self
                .discard(lease, &delivery, "endpoint no longer exists")
                .await
                .map(Err);
        };
        if endpoint.disabled {
            return self
                .discard(lease, &delivery, "endpoint is disabled")
                .await
                .map(Err);
        }

        let subscription = match repos.subscriptions.find_by_id(delivery.subscription_id).await? {
            Some(subscription) if subscription.enabled => subscription,
            Some(_) => {
                return self
                    .discard(lease, &delivery, "subscription is disabled")
                    .await
                    .map(Err);
            }
            None => {
                return self
                    .discard(lease, &delivery, "subscription no longer exists")
                    .await
                    .map(Err);
            }
        };

        if endpoint.health() == EndpointStatus::Inactive {
            if !lease.job.manual {
                return self
                    .discard(lease, &delivery, "endpoint is inactive")
                    .await
                    .map(Err);
            }
            self.engine
                .health
                .apply(endpoint.id, HealthSignal::ManualResend)
                .await?;
        }

        Ok(Ok(Prepared {
            delivery,
            subscription,
            endpoint,
        }))
    }

    /// Step 3: defer without recording an attempt when the endpoint is over
    /// its rate limit.
    async fn limit(
        &self,
        lease: &Lease,
        prepared: &Prepared,
        now: DateTime<Utc>,
    ) -> Result<Option<DeliveryOutcome>, EngineError> {
        let limit = prepared
            .subscription
            .rate_limit_override()
            .unwrap_or_else(|| prepared.endpoint.rate_limit());

        let decision = match self
            .engine
            .rate_limiter
            .allow(&endpoint_key(prepared.endpoint.id), &limit, now)
            .await
        {
            Ok(decision) => decision,
            Err(err) => {
                return self
                    .fail(
                        lease,
                        &prepared.delivery,
                        format!("invalid endpoint rate limit: {err}"),
                    )
                    .await
                    .map(Some);
            }
        };

        if decision.permitted {
            return Ok(None);
        }

        let delay = Duration::from_secs(self.engine.config.rate_limited_delay_seconds)
            .max(decision.retry_after);
        let not_before = now + chrono_duration(delay);
        debug!(
            endpoint_id = %prepared.endpoint.id,
            retry_at = %not_before,
            "Endpoint rate limited; deferring delivery"
        );
        if !self.engine.queue.reschedule(lease, not_before).await? {
            debug!("Lease lost before rate-limit deferral");
        }
        Ok(Some(DeliveryOutcome::RateLimited))
    }

    /// Steps 4 and 5: sign, send, record and classify.
    async fn deliver(
        &self,
        lease: &Lease,
        prepared: Prepared,
        now: DateTime<Utc>,
    ) -> Result<DeliveryOutcome, EngineError> {
        let Prepared {
            delivery,
            subscription,
            endpoint,
        } = prepared;
        let repos = &self.engine.repos;

        if !repos.deliveries.claim(delivery.id, lease.job.id).await? {
            debug!("Delivery claimed by another job or settled; dropping job");
            self.ack(lease).await?;
            return Ok(DeliveryOutcome::Skipped);
        }

        let Some(event) = repos.events.find_by_id(delivery.event_id).await? else {
            return self
                .discard(lease, &delivery, "event no longer exists")
                .await;
        };

        let retry = match delivery.retry() {
            Ok(retry) => retry,
            Err(err) => {
                return self
                    .fail(lease, &delivery, format!("invalid retry configuration: {err}"))
                    .await;
            }
        };

        let (request, signature_version) = match self.build_request(&event, &delivery, &endpoint, now) {
            Ok(built) => built,
            Err(reason) => return self.fail(lease, &delivery, reason).await,
        };

        let url = request.url.clone();
        let request_headers = headers_to_json(&request.headers);
        let outcome = self.engine.dispatcher.send(request).await;
        self.engine
            .metrics
            .dispatch_latency(outcome.elapsed, status_class(outcome.status));

        repos
            .deliveries
            .record_attempt(
                delivery.id,
                NewDeliveryAttempt {
                    manual: lease.job.manual,
                    url,
                    method: "POST".to_string(),
                    request_headers,
                    signature_version: Some(signature_version),
                    response_status: outcome.status,
                    response_headers: outcome.response_headers.clone(),
                    response_body: outcome.response_body.clone(),
                    error: (!outcome.is_success()).then(|| outcome.failure_reason()),
                    duration_ms: outcome.elapsed.as_millis().min(i64::MAX as u128) as i64,
                },
            )
            .await?;

        if outcome.is_success() {
            return self.succeed(lease, &delivery, &endpoint).await;
        }

        self.retry_or_discard(lease, &delivery, &subscription, &endpoint, &retry, &outcome, now)
            .await
    }

    fn build_request(
        &self,
        event: &event::Model,
        delivery: &event_delivery::Model,
        endpoint: &endpoint::Model,
        now: DateTime<Utc>,
    ) -> Result<(DispatchRequest, String), String> {
        let scheme = endpoint
            .signature_scheme()
            .map_err(|e| format!("invalid signature scheme: {e}"))?;
        let sealed = endpoint
            .sealed_secrets()
            .map_err(|e| format!("invalid endpoint secrets: {e}"))?;

        let secrets = sealed
            .iter()
            .filter(|secret| secret.is_active(now))
            .map(|secret| {
                self.engine
                    .sealer
                    .open(endpoint.id, &secret.value)
                    .map(|value| Secret {
                        value,
                        expires_at: secret.expires_at,
                    })
            })
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| format!("failed to open endpoint secret: {e}"))?;

        let signatures = signature::sign(&event.payload, &secrets, &scheme, now)
            .map_err(|e| format!("signing failed: {e}"))?;

        let headers = delivery_headers(event, delivery, &endpoint.custom_headers(), &signatures);
        let request = DispatchRequest {
            url: endpoint.url.clone(),
            payload: event.payload.clone(),
            headers,
            timeout: self
                .engine
                .dispatcher
                .timeout_for(endpoint.http_timeout_seconds),
        };

        Ok((request, scheme.version_label()))
    }

    async fn succeed(
        &self,
        lease: &Lease,
        delivery: &event_delivery::Model,
        endpoint: &endpoint::Model,
    ) -> Result<DeliveryOutcome, EngineError> {
        self.engine
            .repos
            .deliveries
            .update_status(
                delivery.id,
                &[DeliveryStatus::Processing],
                DeliveryUpdate::status(DeliveryStatus::Success).with_description("delivered"),
            )
            .await?;
        self.report_health(endpoint.id, HealthSignal::Success).await;
        self.ack(lease).await?;

        info!(endpoint_id = %endpoint.id, "Delivery succeeded");
        Ok(DeliveryOutcome::Success)
    }

    #[allow(clippy::too_many_arguments)]
    async fn retry_or_discard(
        &self,
        lease: &Lease,
        delivery: &event_delivery::Model,
        subscription: &subscription::Model,
        endpoint: &endpoint::Model,
        retry: &RetryConfig,
        outcome: &DispatchOutcome,
        now: DateTime<Utc>,
    ) -> Result<DeliveryOutcome, EngineError> {
        let reason = outcome.failure_reason();
        let may_deactivate = self
            .engine
            .repos
            .projects
            .find_by_id(delivery.project_id)
            .await?
            .is_none_or(|project| project.disable_endpoint);

        let health = self
            .report_health(
                endpoint.id,
                HealthSignal::Failure {
                    threshold: retry.retry_count,
                    may_deactivate,
                },
            )
            .await;
        if let Some(after) = health {
            self.maybe_alert(delivery, subscription, endpoint, after, &reason, now)
                .await;
        }

        let auto_attempts =
            delivery.auto_attempt_count.max(0) as u32 + u32::from(!lease.job.manual);

        if retry.can_retry(auto_attempts) {
            let ceiling = Duration::from_secs(self.engine.config.max_retry_backoff_seconds);
            let next_attempt_at = now + chrono_duration(retry.backoff(auto_attempts.max(1), ceiling));

            self.engine
                .repos
                .deliveries
                .update_status(
                    delivery.id,
                    &[DeliveryStatus::Processing],
                    DeliveryUpdate::status(DeliveryStatus::Retry)
                        .with_next_attempt_at(next_attempt_at)
                        .with_description(reason.clone()),
                )
                .await?;

            // Retries always count against the automatic budget.
            let mut retry_lease = lease.clone();
            retry_lease.job.manual = false;
            if !self
                .engine
                .queue
                .reschedule(&retry_lease, next_attempt_at)
                .await?
            {
                debug!("Lease lost before retry reschedule");
            }

            info!(
                endpoint_id = %endpoint.id,
                auto_attempts,
                retry_at = %next_attempt_at,
                error = %reason,
                "Delivery failed; retry scheduled"
            );
            return Ok(DeliveryOutcome::Retry);
        }

        self.engine
            .repos
            .deliveries
            .update_status(
                delivery.id,
                &[DeliveryStatus::Processing],
                DeliveryUpdate::status(DeliveryStatus::Discarded).with_description(format!(
                    "{}: {reason}",
                    EngineError::Exhausted {
                        attempts: auto_attempts
                    }
                )),
            )
            .await?;
        self.ack(lease).await?;

        warn!(
            endpoint_id = %endpoint.id,
            auto_attempts,
            error = %reason,
            "Delivery discarded after exhausting retries"
        );
        Ok(DeliveryOutcome::Discarded)
    }

    async fn maybe_alert(
        &self,
        delivery: &event_delivery::Model,
        subscription: &subscription::Model,
        endpoint: &endpoint::Model,
        after: EndpointHealth,
        reason: &str,
        now: DateTime<Utc>,
    ) {
        let Some(alert) = subscription.alert() else {
            return;
        };
        if alert.count == 0 || after.failure_count != alert.count {
            return;
        }

        let alert = FailureAlert {
            project_id: delivery.project_id,
            endpoint_id: endpoint.id,
            subscription_id: subscription.id,
            delivery_id: delivery.id,
            endpoint_url: endpoint.url.clone(),
            failure_count: after.failure_count,
            threshold: alert.count,
            endpoint_status: after.status.to_string(),
            last_error: reason.to_string(),
            raised_at: now,
        };
        if let Err(err) = self.engine.notifier.notify(&alert).await {
            warn!(endpoint_id = %endpoint.id, error = %err, "Failed to send failure alert");
        }
    }

    /// Health bookkeeping never fails the delivery itself.
    async fn report_health(
        &self,
        endpoint_id: uuid::Uuid,
        signal: HealthSignal,
    ) -> Option<EndpointHealth> {
        match self.engine.health.apply(endpoint_id, signal).await {
            Ok((_, after)) => Some(after),
            Err(err) => {
                warn!(endpoint_id = %endpoint_id, error = %err, "Failed to update endpoint health");
                None
            }
        }
    }

    async fn discard(
        &self,
        lease: &Lease,
        delivery: &event_delivery::Model,
        reason: &str,
    ) -> Result<DeliveryOutcome, EngineError> {
        self.settle(lease, delivery, DeliveryStatus::Discarded, reason.to_string())
            .await?;
        info!(reason, "Delivery discarded");
        Ok(DeliveryOutcome::Discarded)
    }

    /// Fatal configuration problems are not retried.
    async fn fail(
        &self,
        lease: &Lease,
        delivery: &event_delivery::Model,
        reason: String,
    ) -> Result<DeliveryOutcome, EngineError> {
        warn!(
            error = %EngineError::Configuration(reason.clone()),
            "Delivery failed permanently"
        );
        self.settle(lease, delivery, DeliveryStatus::Failure, reason)
            .await?;
        Ok(DeliveryOutcome::Failure)
    }

    async fn settle(
        &self,
        lease: &Lease,
        delivery: &event_delivery::Model,
        status: DeliveryStatus,
        description: String,
    ) -> Result<(), EngineError> {
        self.engine
            .repos
            .deliveries
            .update_status(
                delivery.id,
                DeliveryStatus::dispatchable(),
                DeliveryUpdate::status(status).with_description(description),
            )
            .await?;
        self.ack(lease).await
    }

    async fn ack(&self, lease: &Lease) -> Result<(), EngineError> {
        if !self.engine.queue.ack(lease).await? {
            debug!("Lease was reclaimed before acknowledgement");
        }
        Ok(())
    }
}

fn chrono_duration(duration: Duration) -> chrono::Duration {
    chrono::Duration::milliseconds(duration.as_millis().min(i64::MAX as u128) as i64)
}
