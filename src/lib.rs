//! # Courier
//!
//! Multi-tenant webhook delivery engine: subscription matching, a delayed
//! at-least-once delivery queue, signed HTTP dispatch with retries, endpoint
//! circuit breaking and per-tenant rate limiting.

pub mod admin;
pub mod config;
pub mod crypto;
pub mod db;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod executor;
pub mod handlers;
pub mod health;
pub mod ingest;
pub mod matcher;
pub mod metrics;
pub mod models;
pub mod notifier;
pub mod queue;
pub mod rate_limiter;
pub mod repositories;
pub mod retry;
pub mod scheduler;
pub mod server;
pub mod signature;
pub mod telemetry;
pub mod webhook_verification;
pub mod worker;

pub use engine::{Engine, EngineBuilder};
pub use migration;
