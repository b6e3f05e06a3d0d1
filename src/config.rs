//! Delivery configuration: group defaults, subscription overrides, and
//! the resolver that merges them into the effective per-delivery config.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::{Group, Subscription};

/// Upper bound on any computed retry delay.
pub const MAX_BACKOFF: Duration = Duration::from_secs(24 * 60 * 60);

/// Hash function used for outbound payload signatures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HashAlgorithm {
    #[serde(rename = "SHA256")]
    Sha256,
    #[serde(rename = "SHA512")]
    Sha512,
}

/// Signature header configuration, defined per group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignatureConfig {
    /// Header name carrying the hex digest, byte-for-byte as configured.
    pub header: String,
    pub hash: HashAlgorithm,
}

impl Default for SignatureConfig {
    fn default() -> Self {
        Self {
            header: "X-Webhook-Signature".to_string(),
            hash: HashAlgorithm::Sha256,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyType {
    Linear,
    Exponential,
}

/// Retry strategy: how long to wait between attempts and how many
/// automatic attempts a delivery gets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategyConfig {
    #[serde(rename = "type")]
    pub strategy: StrategyType,

    /// Base delay in seconds.
    pub duration: u64,

    pub retry_count: u32,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            strategy: StrategyType::Linear,
            duration: 60,
            retry_count: 5,
        }
    }
}

/// Token budget per window for one endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub count: u32,

    /// Window length in seconds.
    pub duration: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            count: 5000,
            duration: 60,
        }
    }
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.duration)
    }
}

/// Group-level defaults applied to every delivery that its
/// subscriptions do not override.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GroupConfig {
    pub signature: SignatureConfig,
    pub strategy: StrategyConfig,
    pub rate_limit: RateLimitConfig,

    /// Whether exhausting retries deactivates the subscription.
    pub disable_endpoint: bool,
}

/// Per-delivery configuration after merging subscription overrides with
/// group defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffectiveConfig {
    pub strategy: StrategyConfig,
    pub rate_limit: RateLimitConfig,
    pub disable_endpoint: bool,
}

impl EffectiveConfig {
    /// Merge `subscription` overrides onto `group` defaults.
    ///
    /// Each field is taken from the subscription when set, otherwise
    /// from the group. `disable_endpoint` is tri-valued: an explicit
    /// subscription value, including `false`, wins over the group
    /// default.
    pub fn resolve(subscription: &Subscription, group: &Group) -> Self {
        Self {
            strategy: subscription.retry_config.unwrap_or(group.config.strategy),
            rate_limit: subscription
                .rate_limit_config
                .unwrap_or(group.config.rate_limit),
            disable_endpoint: subscription
                .disable_endpoint
                .unwrap_or(group.config.disable_endpoint),
        }
    }
}

/// Delay before the next attempt, given the number of trials already
/// executed.
///
/// Linear waits the base duration every time; exponential doubles per
/// trial and is capped at [`MAX_BACKOFF`].
pub fn next_delay(strategy: &StrategyConfig, trials: u32) -> Duration {
    match strategy.strategy {
        StrategyType::Linear => {
            Duration::from_secs(strategy.duration).min(MAX_BACKOFF)
        }
        StrategyType::Exponential => {
            let factor = 2u64.saturating_pow(trials);
            Duration::from_secs(strategy.duration.saturating_mul(factor)).min(MAX_BACKOFF)
        }
    }
}
