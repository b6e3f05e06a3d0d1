//! A webhook delivery engine with a CLI streaming bridge.
//!
//! Two subsystems share one data model:
//!
//! - **Delivery processing**: a queue-driven worker pool that merges
//!   per-delivery configuration from subscription and group, enforces
//!   per-endpoint rate limits, signs and POSTs payloads, records every
//!   attempt, and schedules bounded-backoff retries — optionally
//!   deactivating a subscription after sustained failure.
//! - **Streaming**: a hub that registers connected CLI devices, tails
//!   the event-delivery change feed, and pushes matching deliveries
//!   over WebSocket instead of HTTP.
//!
//! ## Guarantees
//! - At-least-once delivery: the HTTP call precedes the state write, so
//!   a crash in between can duplicate a webhook; receivers deduplicate
//!   by delivery id
//! - Strictly sequential attempts per delivery (delayed re-enqueue,
//!   never in-process sleep)
//! - Per-endpoint rate limiting across all workers
//! - Per-app, feed-ordered dispatch to streaming clients
//!
//! ## Non-Guarantees
//! - Durable queueing, shared rate-limit counters, and persistence are
//!   external: this crate talks to them through traits and ships
//!   in-memory implementations for tests and single-process embedding
//! - Exactly-once delivery
//! - Cross-app ordering

pub mod client;
pub mod config;
pub mod error;
pub mod hub;
pub mod queue;
pub mod rate_limit;
pub mod repo;
pub mod signing;
pub mod stream;
pub mod types;
pub mod watcher;
pub mod worker;

pub use client::{Client, ServerSocket};
pub use config::{
    next_delay, EffectiveConfig, GroupConfig, HashAlgorithm, RateLimitConfig, SignatureConfig,
    StrategyConfig, StrategyType, MAX_BACKOFF,
};
pub use error::{DeliveryError, RepoError, StreamError};
pub use hub::Hub;
pub use queue::{
    InMemoryQueue, QueueError, TaskQueue, DEFAULT_LANE, EVENT_PROCESSOR, NOTIFICATION_PROCESSOR,
};
pub use rate_limit::{InMemoryRateLimiter, RateLimitError, RateLimitResult, RateLimiter};
pub use repo::{
    ApplicationRepo, DeviceRepo, EventDeliveryRepo, GroupRepo, InMemoryStore, SubscriptionRepo,
};
pub use signing::{compute_signature, verify_signature};
pub use stream::{StreamBridge, MAX_MESSAGE_SIZE};
pub use types::{
    AppId, Application, CliMetadata, DeliveryAttempt, DeliveryId, DeliveryMetadata, DeliveryMode,
    DeliveryStatus, Device, DeviceId, DeviceStatus, Endpoint, EndpointAuth, EndpointId,
    EndpointStatus, Event, EventDelivery, EventId, FilterConfig, Group, GroupId, SourceId,
    Subscription, SubscriptionId, SubscriptionStatus,
};
pub use watcher::run_event_watcher;
pub use worker::{
    run_workers, DeliveryWorker, NotificationPayload, ENDPOINT_DISABLED, ENDPOINT_ENABLED,
};
