use std::fmt;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{GroupConfig, RateLimitConfig, StrategyConfig};

/// A device is considered online while its last ping is younger than this.
pub const MAX_DEVICE_LAST_SEEN_SECS: i64 = 120;

/// Unique identifier for a group (tenancy/configuration root).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GroupId(pub String);

/// Unique identifier for an application.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AppId(pub String);

/// Unique identifier for an endpoint.
///
/// Strongly-typed wrapper to avoid accidental mixing of endpoint ids
/// with other string identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EndpointId(pub String);

/// Unique identifier for a subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(pub String);

/// Unique identifier for an event source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceId(pub String);

/// Unique identifier for an event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(pub String);

/// Unique identifier for an event delivery.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeliveryId(pub String);

/// Unique identifier for a CLI device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceId(pub String);

macro_rules! display_as_inner {
    ($($id:ident),+ $(,)?) => {$(
        impl fmt::Display for $id {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    )+};
}

display_as_inner!(
    GroupId,
    AppId,
    EndpointId,
    SubscriptionId,
    SourceId,
    EventId,
    DeliveryId,
    DeviceId,
);

/// Tenant-scoped logical source of events; owner of endpoints and
/// CLI devices.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Application {
    pub id: AppId,
    pub group_id: GroupId,
    pub name: String,
    pub support_email: Option<String>,
    pub disabled: bool,
}

/// Destination for webhook delivery.
///
/// An endpoint describes *where* and *how* a webhook should be delivered.
/// It is a pure configuration object with no internal state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Endpoint {
    pub id: EndpointId,

    /// Target URL for webhook delivery.
    pub target_url: String,

    /// Secret used for HMAC signing of outbound payloads.
    pub secret: String,

    /// Optional static auth header sent with every delivery.
    pub authentication: Option<EndpointAuth>,

    /// Per-endpoint rate limit as configured on the endpoint itself.
    /// Delivery enforces the effective limit resolved from subscription
    /// and group (see `EffectiveConfig`).
    pub rate_limit: RateLimitConfig,

    pub description: String,
    pub status: EndpointStatus,
}

/// Custom auth header attached to outbound requests for an endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointAuth {
    pub header_name: String,
    pub header_value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointStatus {
    Active,
    Inactive,
    Pending,
}

/// Binds a source and an event-type filter to an endpoint, optionally
/// overriding the group's delivery configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub name: String,
    pub app_id: AppId,
    pub source_id: SourceId,
    pub endpoint_id: EndpointId,
    pub status: SubscriptionStatus,

    /// Event types this subscription listens for. `"*"` matches all.
    pub filter: FilterConfig,

    /// Overrides. `None` inherits the group default.
    pub retry_config: Option<StrategyConfig>,
    pub rate_limit_config: Option<RateLimitConfig>,

    /// Tri-valued: `Some(true)` / `Some(false)` are explicit choices,
    /// `None` inherits the group default.
    pub disable_endpoint: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionStatus {
    Active,
    Inactive,
    Pending,
}

/// Event-type filter carried by a subscription.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilterConfig {
    pub event_types: Vec<String>,
}

impl FilterConfig {
    /// Whether `event_type` is selected by this filter. A literal `"*"`
    /// entry matches every event type.
    pub fn matches(&self, event_type: &str) -> bool {
        self.event_types
            .iter()
            .any(|t| t == event_type || t == "*")
    }
}

/// Tenancy root holding default delivery configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    pub id: GroupId,
    pub name: String,
    pub config: GroupConfig,
}

/// Immutable record of a business occurrence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub source_id: SourceId,
    pub event_type: String,

    /// Serialized event payload. The engine treats it as opaque bytes.
    pub payload: Vec<u8>,

    pub created_at: DateTime<Utc>,
}

/// How a delivery reaches its consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    /// POSTed to the endpoint's target URL.
    Http,
    /// Streamed to a connected CLI device over the WebSocket bridge.
    Cli,
}

/// Delivery lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryStatus {
    Scheduled,
    Processing,
    Retry,
    Success,
    Failure,
    Discarded,
}

impl DeliveryStatus {
    /// Terminal statuses are never re-dispatched automatically.
    pub fn is_terminal(self) -> bool {
        matches!(self, DeliveryStatus::Success | DeliveryStatus::Discarded)
    }
}

/// Mutable bookkeeping carried by a delivery across attempts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryMetadata {
    /// Payload bytes POSTed verbatim to the endpoint.
    pub payload: Vec<u8>,

    /// Attempts executed so far.
    pub num_trials: u32,

    /// Automatic attempts allowed. `num_trials` may reach
    /// `retry_limit + 1` through a manual retry, never beyond.
    pub retry_limit: u32,

    /// Base delay of the retry strategy, in seconds.
    pub interval_seconds: u64,

    pub next_send_time: DateTime<Utc>,
}

/// Extra routing data for CLI-mode deliveries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CliMetadata {
    pub event_type: String,
    pub host_name: String,
}

/// One planned-or-attempted delivery of one event to one endpoint via
/// one subscription.
///
/// Deliveries reference their entities by id only; the worker loads
/// what it needs and detects orphans by lookup failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventDelivery {
    pub id: DeliveryId,
    pub event_id: EventId,
    pub endpoint_id: EndpointId,
    pub app_id: AppId,
    pub subscription_id: SubscriptionId,
    pub group_id: GroupId,
    pub device_id: Option<DeviceId>,
    pub mode: DeliveryMode,
    pub cli_metadata: Option<CliMetadata>,
    pub metadata: DeliveryMetadata,
    pub status: DeliveryStatus,

    /// Append-only history, one record per executed HTTP round-trip.
    pub attempts: Vec<DeliveryAttempt>,

    pub created_at: DateTime<Utc>,
}

/// Record of one HTTP round-trip against an endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryAttempt {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub status_code: Option<u16>,
    pub response_headers: Vec<(String, String)>,
    pub response_body: String,
    pub ip: Option<String>,
    pub error: Option<String>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Online,
    Offline,
    Disabled,
}

/// Long-lived CLI client identity, kept fresh by ping-driven
/// last-seen writes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub id: DeviceId,
    pub app_id: AppId,
    pub group_id: GroupId,
    pub host_name: String,
    pub status: DeviceStatus,
    pub last_seen_at: DateTime<Utc>,
}

impl Device {
    /// A device counts as online while its last ping is younger than
    /// two minutes, regardless of the persisted status field.
    pub fn is_online(&self) -> bool {
        Utc::now() - self.last_seen_at < ChronoDuration::seconds(MAX_DEVICE_LAST_SEEN_SECS)
    }
}
