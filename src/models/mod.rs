//! # Data Models
//!
//! SeaORM entities for the delivery engine tables.

pub mod delivery_attempt;
pub mod endpoint;
pub mod event;
pub mod event_delivery;
pub mod project;
pub mod queue_message;
pub mod rate_limit_counter;
pub mod source;
pub mod subscription;

pub use delivery_attempt::Entity as DeliveryAttempt;
pub use endpoint::{Entity as Endpoint, EndpointStatus};
pub use event::Entity as Event;
pub use event_delivery::{DeliveryStatus, Entity as EventDelivery};
pub use project::Entity as Project;
pub use queue_message::Entity as QueueMessage;
pub use rate_limit_counter::Entity as RateLimitCounter;
pub use source::Entity as Source;
pub use subscription::Entity as Subscription;
