//! Tails the event-delivery change feed and routes new CLI deliveries
//! to the hub.

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::hub::Hub;
use crate::repo::EventDeliveryRepo;

/// Watch the change feed until it closes, the hub goes away, or the
/// token is cancelled. Deliveries reach the hub in feed order.
pub async fn run_event_watcher(
    deliveries: Arc<dyn EventDeliveryRepo>,
    hub: Arc<Hub>,
    token: CancellationToken,
) {
    let mut feed = deliveries.watch_scheduled_cli_deliveries();
    tracing::info!(target: "stream", "event watcher started");

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            result = feed.recv() => match result {
                Ok(delivery) => {
                    tracing::debug!(
                        target: "stream",
                        delivery_id = %delivery.id,
                        app_id = %delivery.app_id,
                        "change feed produced a delivery"
                    );
                    if hub.dispatch(delivery).is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(
                        target: "stream",
                        skipped,
                        "event watcher lagged behind the change feed"
                    );
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    tracing::info!(target: "stream", "event watcher stopped");
}
