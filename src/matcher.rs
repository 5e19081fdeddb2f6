//! # Subscription Matcher
//!
//! Resolves the (subscription, endpoint) pairs that must receive an event.
//! A subscription matches when its event-type allow-list accepts the event
//! type (exact or `*`, empty means every type) and its structural filter is
//! contained in the event's headers and body. Matching is read-only.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::error::EngineError;
use crate::models::{endpoint, event, subscription};
use crate::repositories::{EndpointRepository, SubscriptionRepository};

pub const WILDCARD_EVENT_TYPE: &str = "*";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterConfig {
    #[serde(default)]
    pub event_types: Vec<String>,
    #[serde(default)]
    pub filter: StructuralFilter,
}

/// Subset predicate over the event's forwarded headers and JSON body.
/// Header names are matched case-insensitively.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructuralFilter {
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "lowercase_header_names"
    )]
    pub headers: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<JsonValue>,
}

/// Stored events carry lowercased header names, so filters are folded the
/// same way when decoded.
fn lowercase_header_names<'de, D>(deserializer: D) -> Result<Option<JsonValue>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let filter = Option::<JsonValue>::deserialize(deserializer)?;
    Ok(filter.map(|filter| match filter {
        JsonValue::Object(fields) => JsonValue::Object(
            fields
                .into_iter()
                .map(|(name, value)| (name.to_ascii_lowercase(), value))
                .collect(),
        ),
        other => other,
    }))
}

impl FilterConfig {
    pub fn for_types<I, S>(types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            event_types: types.into_iter().map(Into::into).collect(),
            filter: StructuralFilter::default(),
        }
    }

    pub fn accepts_type(&self, event_type: &str) -> bool {
        self.event_types.is_empty()
            || self
                .event_types
                .iter()
                .any(|allowed| allowed == WILDCARD_EVENT_TYPE || allowed == event_type)
    }

    pub fn accepts(&self, event_type: &str, headers: &JsonValue, body: &JsonValue) -> bool {
        self.accepts_type(event_type)
            && self
                .filter
                .headers
                .as_ref()
                .is_none_or(|filter| contains(headers, filter))
            && self
                .filter
                .body
                .as_ref()
                .is_none_or(|filter| contains(body, filter))
    }
}

/// Whether `filter` is structurally contained in `value`.
///
/// Objects: every filter key is present with a contained value. Arrays:
/// every filter element is contained in some element of `value`. Anything
/// else compares by equality. An empty object or array filter accepts any
/// value of the same shape and nothing else.
pub fn contains(value: &JsonValue, filter: &JsonValue) -> bool {
    match (value, filter) {
        (JsonValue::Object(value), JsonValue::Object(filter)) => filter
            .iter()
            .all(|(key, expected)| value.get(key).is_some_and(|actual| contains(actual, expected))),
        (JsonValue::Array(value), JsonValue::Array(filter)) => filter
            .iter()
            .all(|expected| value.iter().any(|actual| contains(actual, expected))),
        (value, filter) => value == filter,
    }
}

/// A subscription paired with the endpoint it delivers to.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryTarget {
    pub subscription: subscription::Model,
    pub endpoint: endpoint::Model,
}

#[derive(Clone)]
pub struct SubscriptionMatcher {
    subscriptions: Arc<dyn SubscriptionRepository>,
    endpoints: Arc<dyn EndpointRepository>,
}

impl SubscriptionMatcher {
    pub fn new(
        subscriptions: Arc<dyn SubscriptionRepository>,
        endpoints: Arc<dyn EndpointRepository>,
    ) -> Self {
        Self {
            subscriptions,
            endpoints,
        }
    }

    /// Every enabled subscription of the event's project (and source, for
    /// inbound events) whose filter accepts the event. Subscriptions with
    /// an undecodable filter or a missing endpoint are skipped.
    #[instrument(skip_all, fields(event_id = %event.id, project_id = %event.project_id, event_type = %event.event_type))]
    pub async fn match_event(&self, event: &event::Model) -> Result<Vec<DeliveryTarget>, EngineError> {
        let candidates = self
            .subscriptions
            .find_enabled(event.project_id, event.source_id)
            .await?;

        let headers = event
            .headers
            .clone()
            .unwrap_or_else(|| JsonValue::Object(Default::default()));
        let body = event.payload_json();

        let mut endpoints: HashMap<Uuid, Option<endpoint::Model>> = HashMap::new();
        let mut targets = Vec::new();

        for subscription in candidates {
            let filter = match subscription.filter() {
                Ok(filter) => filter,
                Err(err) => {
                    warn!(subscription_id = %subscription.id, error = %err, "Skipping subscription with invalid filter config");
                    continue;
                }
            };

            if !filter.accepts(&event.event_type, &headers, &body) {
                continue;
            }

            let endpoint = match endpoints.get(&subscription.endpoint_id) {
                Some(cached) => cached.clone(),
                None => {
                    let loaded = self.endpoints.find_by_id(subscription.endpoint_id).await?;
                    endpoints.insert(subscription.endpoint_id, loaded.clone());
                    loaded
                }
            };

            let Some(endpoint) = endpoint.filter(|e| e.project_id == event.project_id) else {
                warn!(
                    subscription_id = %subscription.id,
                    endpoint_id = %subscription.endpoint_id,
                    "Subscription endpoint not found; skipping"
                );
                continue;
            };

            targets.push(DeliveryTarget {
                subscription,
                endpoint,
            });
        }

        debug!(matched = targets.len(), "Subscriptions matched");
        Ok(targets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn event_type_allow_list() {
        let exact = FilterConfig::for_types(["user.created"]);
        assert!(exact.accepts_type("user.created"));
        assert!(!exact.accepts_type("user.deleted"));

        assert!(FilterConfig::for_types(["*"]).accepts_type("anything.at.all"));
        assert!(FilterConfig::default().accepts_type("invoice.paid"));
    }

    #[test]
    fn object_containment_is_subset() {
        let payload = json!({ "user": { "id": 7, "tier": "gold" }, "source": "signup" });

        assert!(contains(&payload, &json!({ "user": { "tier": "gold" } })));
        assert!(contains(&payload, &json!({})));
        assert!(!contains(&payload, &json!({ "user": { "tier": "silver" } })));
        assert!(!contains(&payload, &json!({ "missing": true })));
    }

    #[test]
    fn array_containment_matches_any_element() {
        let payload = json!({ "tags": ["a", "b", { "k": 1, "x": 2 }] });

        assert!(contains(&payload, &json!({ "tags": ["b"] })));
        assert!(contains(&payload, &json!({ "tags": [{ "k": 1 }, "a"] })));
        assert!(!contains(&payload, &json!({ "tags": ["c"] })));
        assert!(!contains(&payload, &json!({ "tags": "a" })));
    }

    #[test]
    fn structural_filter_checks_headers_and_body() {
        let config: FilterConfig = serde_json::from_value(json!({
            "event_types": ["order.paid"],
            "filter": {
                "headers": { "x-region": "eu" },
                "body": { "amount": 10 }
            }
        }))
        .unwrap();

        let headers = json!({ "x-region": "eu", "x-other": "1" });
        assert!(config.accepts("order.paid", &headers, &json!({ "amount": 10, "currency": "EUR" })));
        assert!(!config.accepts("order.paid", &headers, &json!({ "amount": 11 })));
        assert!(!config.accepts("order.paid", &json!({ "x-region": "us" }), &json!({ "amount": 10 })));
        assert!(!config.accepts("order.created", &headers, &json!({ "amount": 10 })));
    }

    #[test]
    fn empty_object_filter_only_accepts_objects() {
        assert!(contains(&json!({ "a": 1 }), &json!({})));
        assert!(!contains(&JsonValue::Null, &json!({})));
        assert!(!contains(&json!("text"), &json!({})));
        assert!(!contains(&json!([1]), &json!({})));
    }

    #[test]
    fn header_filter_names_are_case_insensitive() {
        let config: FilterConfig = serde_json::from_value(json!({
            "filter": { "headers": { "X-Region": "eu" } }
        }))
        .unwrap();

        assert_eq!(config.filter.headers, Some(json!({ "x-region": "eu" })));
        assert!(config.accepts("order.paid", &json!({ "x-region": "eu" }), &json!({})));
    }

    #[test]
    fn empty_header_filter_matches_event_without_headers() {
        let config: FilterConfig = serde_json::from_value(json!({
            "filter": { "headers": {} }
        }))
        .unwrap();

        assert!(config.accepts("order.paid", &json!({}), &json!({ "id": 1 })));
    }
}
