//! # Endpoint Health
//!
//! Circuit breaker driven by delivery outcomes. An endpoint stays `active`
//! while it succeeds; consecutive failures reaching the subscription's retry
//! count turn it `inactive` (when the project allows deactivation). A manual
//! resend against an inactive endpoint moves it to `pending`, where the next
//! result decides between `active` and `inactive`. The explicit `disabled`
//! flag is separate and never touched here.

use std::sync::Arc;

use tracing::{info, warn};
use uuid::Uuid;

use crate::error::EngineError;
use crate::metrics::MetricsSink;
use crate::models::endpoint::{self, EndpointStatus};
use crate::repositories::EndpointRepository;

/// Conflicting concurrent updates are retried this many times.
const MAX_UPDATE_RETRIES: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointHealth {
    pub status: EndpointStatus,
    pub failure_count: u32,
}

impl EndpointHealth {
    pub fn healthy() -> Self {
        Self {
            status: EndpointStatus::Active,
            failure_count: 0,
        }
    }

    pub fn of(endpoint: &endpoint::Model) -> Self {
        Self {
            status: endpoint.health(),
            failure_count: endpoint.failure_count.max(0) as u32,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthSignal {
    Success,
    Failure {
        /// Consecutive failures that open the circuit
        threshold: u32,
        /// Project setting allowing deactivation
        may_deactivate: bool,
    },
    ManualResend,
}

/// Next health for `current` after `signal`.
pub fn transition(current: EndpointHealth, signal: HealthSignal) -> EndpointHealth {
    match signal {
        HealthSignal::Success => EndpointHealth::healthy(),
        HealthSignal::Failure {
            threshold,
            may_deactivate,
        } => {
            let failure_count = current.failure_count.saturating_add(1);
            let status = match current.status {
                EndpointStatus::Active if may_deactivate && failure_count >= threshold => {
                    EndpointStatus::Inactive
                }
                EndpointStatus::Active => EndpointStatus::Active,
                EndpointStatus::Pending | EndpointStatus::Inactive => EndpointStatus::Inactive,
            };
            EndpointHealth {
                status,
                failure_count,
            }
        }
        HealthSignal::ManualResend => match current.status {
            EndpointStatus::Inactive => EndpointHealth {
                status: EndpointStatus::Pending,
                ..current
            },
            _ => current,
        },
    }
}

/// Applies health signals through the endpoint repository with optimistic
/// concurrency.
#[derive(Clone)]
pub struct HealthTracker {
    endpoints: Arc<dyn EndpointRepository>,
    metrics: Arc<dyn MetricsSink>,
}

impl HealthTracker {
    pub fn new(endpoints: Arc<dyn EndpointRepository>, metrics: Arc<dyn MetricsSink>) -> Self {
        Self { endpoints, metrics }
    }

    /// Returns the health before and after the signal.
    pub async fn apply(
        &self,
        endpoint_id: Uuid,
        signal: HealthSignal,
    ) -> Result<(EndpointHealth, EndpointHealth), EngineError> {
        for _ in 0..MAX_UPDATE_RETRIES {
            let endpoint = self
                .endpoints
                .find_by_id(endpoint_id)
                .await?
                .ok_or_else(|| EngineError::not_found("endpoint", endpoint_id))?;

            let current = EndpointHealth::of(&endpoint);
            let next = transition(current, signal);
            if next == current {
                return Ok((current, next));
            }

            if self
                .endpoints
                .update_status(endpoint_id, current, next)
                .await?
            {
                if current.status != next.status {
                    info!(
                        endpoint_id = %endpoint_id,
                        from = %current.status,
                        to = %next.status,
                        failure_count = next.failure_count,
                        "Endpoint health changed"
                    );
                    if next.status == EndpointStatus::Inactive {
                        self.metrics.endpoint_deactivated();
                    }
                }
                return Ok((current, next));
            }
        }

        warn!(endpoint_id = %endpoint_id, "Endpoint health update kept conflicting");
        Err(EngineError::Conflict(format!(
            "endpoint {endpoint_id} health changed concurrently"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failure(threshold: u32) -> HealthSignal {
        HealthSignal::Failure {
            threshold,
            may_deactivate: true,
        }
    }

    fn health(status: EndpointStatus, failure_count: u32) -> EndpointHealth {
        EndpointHealth {
            status,
            failure_count,
        }
    }

    #[test]
    fn opens_after_exactly_threshold_failures() {
        let mut current = EndpointHealth::healthy();
        current = transition(current, failure(3));
        assert_eq!(current, health(EndpointStatus::Active, 1));
        current = transition(current, failure(3));
        assert_eq!(current, health(EndpointStatus::Active, 2));
        current = transition(current, failure(3));
        assert_eq!(current, health(EndpointStatus::Inactive, 3));
    }

    #[test]
    fn success_resets_failures() {
        let current = health(EndpointStatus::Active, 2);
        assert_eq!(
            transition(current, HealthSignal::Success),
            EndpointHealth::healthy()
        );
    }

    #[test]
    fn project_may_forbid_deactivation() {
        let next = transition(
            health(EndpointStatus::Active, 9),
            HealthSignal::Failure {
                threshold: 2,
                may_deactivate: false,
            },
        );
        assert_eq!(next, health(EndpointStatus::Active, 10));
    }

    #[test]
    fn pending_probe_decides() {
        let pending = transition(
            health(EndpointStatus::Inactive, 3),
            HealthSignal::ManualResend,
        );
        assert_eq!(pending, health(EndpointStatus::Pending, 3));

        assert_eq!(
            transition(pending, HealthSignal::Success),
            EndpointHealth::healthy()
        );
        assert_eq!(
            transition(pending, failure(10)).status,
            EndpointStatus::Inactive
        );
    }

    #[test]
    fn manual_resend_leaves_active_alone() {
        let active = health(EndpointStatus::Active, 1);
        assert_eq!(transition(active, HealthSignal::ManualResend), active);
    }
}
