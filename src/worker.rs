//! The event delivery processor.
//!
//! [`DeliveryWorker::process`] executes one delivery attempt end-to-end:
//! load entities, resolve effective config, pass the rate-limit gate,
//! sign and POST, record the attempt, advance the state machine, and
//! surface retry/discard decisions to the queue. [`run_workers`] drains
//! the event-processor lane with a pool of such invocations.
//!
//! The HTTP call happens before the state write, so a crash in between
//! can duplicate a webhook; receivers deduplicate by delivery id.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use reqwest::header::HeaderMap;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::{next_delay, EffectiveConfig};
use crate::error::{DeliveryError, RepoError};
use crate::queue::{TaskQueue, DEFAULT_LANE, EVENT_PROCESSOR, NOTIFICATION_PROCESSOR};
use crate::rate_limit::RateLimiter;
use crate::repo::{ApplicationRepo, EventDeliveryRepo, GroupRepo, SubscriptionRepo};
use crate::signing;
use crate::types::{
    Application, DeliveryAttempt, DeliveryId, DeliveryStatus, Endpoint, EndpointStatus,
    SubscriptionStatus,
};

#[cfg(feature = "metrics")]
fn metric_inc(name: &'static str) {
    metrics::increment_counter!(name);
}

#[cfg(not(feature = "metrics"))]
fn metric_inc(_name: &'static str) {}

/// Connect + read budget for one delivery attempt.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Redelivery delay applied when a repository write fails mid-flight.
const REDELIVERY_DELAY: Duration = Duration::from_secs(5);

/// Caps on what one attempt record retains from the response.
const MAX_RESPONSE_BODY: usize = 4096;
const MAX_RESPONSE_HEADERS: usize = 20;
const MAX_HEADER_VALUE: usize = 256;

/// Notification emitted when a subscription is activated after a
/// pending endpoint's first successful delivery.
pub const ENDPOINT_ENABLED: &str = "endpoint.enabled";

/// Notification emitted when retry exhaustion deactivates a
/// subscription.
pub const ENDPOINT_DISABLED: &str = "endpoint.disabled";

/// Task payload written to the NotificationProcessor on endpoint-state
/// transitions. Transport (email etc.) lives outside this crate.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct NotificationPayload {
    pub event: String,
    pub app_id: String,
    pub endpoint_id: String,
    pub endpoint_url: String,
    pub support_email: Option<String>,
}

/// Executes delivery attempts against endpoint URLs.
///
/// Stateless apart from the shared HTTP client; safe to share across
/// worker tasks.
pub struct DeliveryWorker {
    applications: Arc<dyn ApplicationRepo>,
    subscriptions: Arc<dyn SubscriptionRepo>,
    deliveries: Arc<dyn EventDeliveryRepo>,
    groups: Arc<dyn GroupRepo>,
    queue: Arc<dyn TaskQueue>,
    limiter: Arc<dyn RateLimiter>,
    client: reqwest::Client,
}

impl DeliveryWorker {
    pub fn new(
        applications: Arc<dyn ApplicationRepo>,
        subscriptions: Arc<dyn SubscriptionRepo>,
        deliveries: Arc<dyn EventDeliveryRepo>,
        groups: Arc<dyn GroupRepo>,
        queue: Arc<dyn TaskQueue>,
        limiter: Arc<dyn RateLimiter>,
    ) -> Result<Self, DeliveryError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("hookstream/", env!("CARGO_PKG_VERSION")))
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| DeliveryError::NonRetryable(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            applications,
            subscriptions,
            deliveries,
            groups,
            queue,
            limiter,
            client,
        })
    }

    /// Process one scheduled delivery.
    ///
    /// Idempotent on terminal deliveries. Past the rate-limit gate,
    /// exactly one status write (Processing) and one attempt append
    /// happen per invocation.
    pub async fn process(&self, id: &DeliveryId) -> Result<(), DeliveryError> {
        let mut delivery = match self.deliveries.find_delivery_by_id(id).await {
            Ok(d) => d,
            Err(err @ RepoError::NotFound { .. }) => {
                return Err(DeliveryError::NonRetryable(err.to_string()))
            }
            Err(err) => return Err(err.into()),
        };

        if delivery.status.is_terminal() {
            tracing::debug!(
                target: "delivery",
                delivery_id = %delivery.id,
                status = ?delivery.status,
                "delivery already terminal, nothing to do"
            );
            return Ok(());
        }

        let endpoint = self
            .applications
            .find_endpoint_by_id(&delivery.app_id, &delivery.endpoint_id)
            .await
            .map_err(orphaned)?;
        let application = self
            .applications
            .find_application_by_id(&delivery.app_id)
            .await
            .map_err(orphaned)?;
        let subscription = self
            .subscriptions
            .find_subscription_by_id(&delivery.subscription_id)
            .await
            .map_err(orphaned)?;
        let group = self
            .groups
            .find_group_by_id(&delivery.group_id)
            .await
            .map_err(orphaned)?;

        let cfg = EffectiveConfig::resolve(&subscription, &group);

        if subscription.status == SubscriptionStatus::Inactive {
            tracing::info!(
                target: "delivery",
                delivery_id = %delivery.id,
                subscription_id = %subscription.id,
                "subscription inactive, discarding delivery"
            );
            self.deliveries
                .update_delivery_status(&delivery.id, DeliveryStatus::Discarded)
                .await?;
            return Ok(());
        }

        let window = cfg.rate_limit.window();
        let probe = self
            .limiter
            .should_allow(&endpoint.id.0, cfg.rate_limit.count, window)
            .await
            .map_err(|e| DeliveryError::Repository(RepoError::Storage(e.to_string())))?;
        if !probe.allowed {
            metric_inc("delivery.rate_limited");
            tracing::debug!(
                target: "delivery",
                delivery_id = %delivery.id,
                endpoint_id = %endpoint.id,
                reset_ms = probe.reset_after.as_millis() as u64,
                "endpoint rate limit exhausted"
            );
            return Err(DeliveryError::RateLimited {
                reset: probe.reset_after,
            });
        }
        self.limiter
            .allow(&endpoint.id.0, cfg.rate_limit.count, window)
            .await
            .map_err(|e| DeliveryError::Repository(RepoError::Storage(e.to_string())))?;

        // The single status write for this invocation; the final status
        // rides with the attempt below.
        self.deliveries
            .update_delivery_status(&delivery.id, DeliveryStatus::Processing)
            .await?;
        delivery.status = DeliveryStatus::Processing;

        let signature = signing::compute_signature(
            group.config.signature.hash,
            &endpoint.secret,
            &delivery.metadata.payload,
        );

        let mut request = self
            .client
            .post(&endpoint.target_url)
            .header("Content-Type", "application/json")
            .header(group.config.signature.header.as_str(), signature)
            .body(delivery.metadata.payload.clone());
        if let Some(auth) = &endpoint.authentication {
            request = request.header(auth.header_name.as_str(), auth.header_value.as_str());
        }

        let started = Instant::now();
        let result = request.send().await;

        let mut attempt = DeliveryAttempt {
            id: Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            status_code: None,
            response_headers: Vec::new(),
            response_body: String::new(),
            ip: None,
            error: None,
            duration_ms: 0,
        };

        let succeeded = match result {
            Ok(response) => {
                let status = response.status();
                attempt.status_code = Some(status.as_u16());
                attempt.ip = response.remote_addr().map(|addr| addr.ip().to_string());
                attempt.response_headers = bounded_headers(response.headers());
                let body = response.text().await.unwrap_or_default();
                attempt.response_body = body.chars().take(MAX_RESPONSE_BODY).collect();
                status.is_success()
            }
            Err(err) => {
                attempt.error = Some(err.to_string());
                false
            }
        };
        attempt.duration_ms = started.elapsed().as_millis() as u64;

        let failure_reason = attempt.error.clone().unwrap_or_else(|| {
            format!("HTTP {}", attempt.status_code.unwrap_or_default())
        });

        let trials_before = delivery.metadata.num_trials;
        delivery.metadata.num_trials += 1;

        let mut retry_delay = None;
        if succeeded {
            delivery.status = DeliveryStatus::Success;
        } else if delivery.metadata.num_trials < delivery.metadata.retry_limit {
            delivery.status = DeliveryStatus::Retry;
            let delay = next_delay(&cfg.strategy, trials_before);
            delivery.metadata.next_send_time =
                Utc::now() + chrono::Duration::seconds(delay.as_secs() as i64);
            retry_delay = Some(delay);
        } else {
            delivery.status = DeliveryStatus::Discarded;
        }

        self.deliveries
            .update_with_attempt(&delivery, attempt)
            .await?;

        if succeeded {
            metric_inc("delivery.success");
            tracing::info!(
                target: "delivery",
                delivery_id = %delivery.id,
                endpoint_id = %endpoint.id,
                num_trials = delivery.metadata.num_trials,
                "delivery succeeded"
            );
            if subscription.status == SubscriptionStatus::Pending {
                self.subscriptions
                    .update_status(&subscription.id, SubscriptionStatus::Active)
                    .await?;
                if endpoint.status == EndpointStatus::Pending {
                    self.applications
                        .update_endpoint_status(
                            &delivery.app_id,
                            &endpoint.id,
                            EndpointStatus::Active,
                        )
                        .await?;
                }
                self.notify_endpoint_state(ENDPOINT_ENABLED, &application, &endpoint)
                    .await;
            }
            return Ok(());
        }

        metric_inc("delivery.failure");
        if let Some(delay) = retry_delay {
            tracing::warn!(
                target: "delivery",
                delivery_id = %delivery.id,
                endpoint_id = %endpoint.id,
                num_trials = delivery.metadata.num_trials,
                retry_limit = delivery.metadata.retry_limit,
                error = %failure_reason,
                delay_secs = delay.as_secs(),
                "delivery attempt failed, scheduling retry"
            );
            return Err(DeliveryError::Endpoint {
                reason: failure_reason,
                delay,
            });
        }

        metric_inc("delivery.discarded");
        tracing::warn!(
            target: "delivery",
            delivery_id = %delivery.id,
            endpoint_id = %endpoint.id,
            num_trials = delivery.metadata.num_trials,
            error = %failure_reason,
            "retries exhausted, discarding delivery"
        );
        if cfg.disable_endpoint {
            tracing::warn!(
                target: "delivery",
                subscription_id = %subscription.id,
                endpoint_id = %endpoint.id,
                "deactivating subscription after sustained failure"
            );
            self.subscriptions
                .update_status(&subscription.id, SubscriptionStatus::Inactive)
                .await?;
            self.notify_endpoint_state(ENDPOINT_DISABLED, &application, &endpoint)
                .await;
        }
        Ok(())
    }

    /// Enqueue an endpoint-state notification task, best-effort.
    async fn notify_endpoint_state(
        &self,
        event: &str,
        application: &Application,
        endpoint: &Endpoint,
    ) {
        let payload = NotificationPayload {
            event: event.to_string(),
            app_id: application.id.0.clone(),
            endpoint_id: endpoint.id.0.clone(),
            endpoint_url: endpoint.target_url.clone(),
            support_email: application.support_email.clone(),
        };

        let bytes = match serde_json::to_vec(&payload) {
            Ok(b) => b,
            Err(e) => {
                tracing::error!(
                    target: "delivery",
                    error = %e,
                    "failed to serialize notification payload"
                );
                return;
            }
        };

        if let Err(e) = self
            .queue
            .write(NOTIFICATION_PROCESSOR, DEFAULT_LANE, bytes, Duration::ZERO)
            .await
        {
            tracing::error!(
                target: "delivery",
                event,
                endpoint_id = %endpoint.id,
                error = %e,
                "failed to enqueue notification task"
            );
        }
    }
}

fn orphaned(err: RepoError) -> DeliveryError {
    match err {
        RepoError::NotFound { .. } => DeliveryError::NonRetryable(err.to_string()),
        other => DeliveryError::Repository(other),
    }
}

fn bounded_headers(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .take(MAX_RESPONSE_HEADERS)
        .filter_map(|(name, value)| {
            value.to_str().ok().map(|v| {
                (
                    name.to_string(),
                    v.chars().take(MAX_HEADER_VALUE).collect(),
                )
            })
        })
        .collect()
}

/// Spawn `count` workers draining the EventProcessor lane.
///
/// Each worker pops a delivery id, runs [`DeliveryWorker::process`],
/// and hands retryable failures back to the queue with their delay.
/// Cancellation mid-attempt re-enqueues the task without recording an
/// attempt.
pub fn run_workers(
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
    worker: Arc<DeliveryWorker>,
    queue: Arc<dyn TaskQueue>,
    token: CancellationToken,
    count: usize,
) -> Vec<JoinHandle<()>> {
    let rx = Arc::new(Mutex::new(rx));
    (0..count.max(1))
        .map(|_| {
            tokio::spawn(worker_loop(
                rx.clone(),
                worker.clone(),
                queue.clone(),
                token.clone(),
            ))
        })
        .collect()
}

async fn worker_loop(
    rx: Arc<Mutex<mpsc::UnboundedReceiver<Vec<u8>>>>,
    worker: Arc<DeliveryWorker>,
    queue: Arc<dyn TaskQueue>,
    token: CancellationToken,
) {
    loop {
        let payload = {
            let mut guard = rx.lock().await;
            tokio::select! {
                _ = token.cancelled() => None,
                msg = guard.recv() => msg,
            }
        };
        let Some(payload) = payload else { break };

        let id = match String::from_utf8(payload) {
            Ok(id) => DeliveryId(id),
            Err(e) => {
                tracing::error!(target: "delivery", error = %e, "dropping malformed task payload");
                continue;
            }
        };

        tokio::select! {
            _ = token.cancelled() => {
                // Aborted mid-attempt: no attempt was recorded, hand the
                // task back for redelivery.
                let _ = queue
                    .write(EVENT_PROCESSOR, DEFAULT_LANE, id.0.into_bytes(), REDELIVERY_DELAY)
                    .await;
                break;
            }
            result = worker.process(&id) => {
                if let Err(err) = result {
                    handle_process_error(&queue, &id, err).await;
                }
            }
        }
    }
}

async fn handle_process_error(queue: &Arc<dyn TaskQueue>, id: &DeliveryId, err: DeliveryError) {
    let delay = match err {
        DeliveryError::Endpoint { delay, .. } => delay,
        DeliveryError::RateLimited { reset } => reset,
        DeliveryError::Repository(e) => {
            tracing::error!(
                target: "delivery",
                delivery_id = %id,
                error = %e,
                "repository failure, redelivering task"
            );
            REDELIVERY_DELAY
        }
        DeliveryError::NonRetryable(reason) => {
            tracing::error!(
                target: "delivery",
                delivery_id = %id,
                reason = %reason,
                "dropping non-retryable delivery task"
            );
            return;
        }
    };

    if let Err(e) = queue
        .write(
            EVENT_PROCESSOR,
            DEFAULT_LANE,
            id.0.clone().into_bytes(),
            delay,
        )
        .await
    {
        tracing::error!(
            target: "delivery",
            delivery_id = %id,
            error = %e,
            "failed to re-enqueue delivery task"
        );
    }
}
