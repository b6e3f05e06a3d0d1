//! The streaming hub: registry of connected CLI devices.
//!
//! The hub is an actor. One task owns the client map; registration,
//! unregistration, event dispatch, and shutdown all arrive through a
//! single inbox, so the map is never touched concurrently. Everything
//! else (watcher, sessions) holds only a sender.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::client::Client;
use crate::error::StreamError;
use crate::types::{AppId, DeviceId, EventDelivery};

#[cfg(feature = "metrics")]
fn metric_inc(name: &'static str) {
    metrics::increment_counter!(name);
}

#[cfg(not(feature = "metrics"))]
fn metric_inc(_name: &'static str) {}

pub(crate) enum HubCommand {
    Register(Arc<Client>),
    Unregister(Arc<Client>),
    Dispatch(EventDelivery),
}

/// Handle to the hub actor.
pub struct Hub {
    tx: mpsc::UnboundedSender<HubCommand>,
    token: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Hub {
    /// Spawn the hub actor. Must be called from within a tokio runtime.
    pub fn start() -> Arc<Hub> {
        let (tx, rx) = mpsc::unbounded_channel();
        let token = CancellationToken::new();
        let handle = tokio::spawn(run(rx, token.clone()));
        Arc::new(Hub {
            tx,
            token,
            handle: Mutex::new(Some(handle)),
        })
    }

    pub(crate) fn sender(&self) -> mpsc::UnboundedSender<HubCommand> {
        self.tx.clone()
    }

    /// Child token observed by sessions and the watcher; cancelled when
    /// the hub stops.
    pub(crate) fn child_token(&self) -> CancellationToken {
        self.token.child_token()
    }

    pub(crate) fn register(&self, client: Arc<Client>) {
        let _ = self.tx.send(HubCommand::Register(client));
    }

    /// Route a delivery to the sessions whose app, liveness, and
    /// event-type filter match.
    pub fn dispatch(&self, delivery: EventDelivery) -> Result<(), StreamError> {
        self.tx
            .send(HubCommand::Dispatch(delivery))
            .map_err(|_| StreamError::HubClosed)
    }

    /// Broadcast close and wait for the actor to drain. Every session
    /// observes the cancellation and exits.
    pub async fn stop(&self) {
        self.token.cancel();
        if let Some(handle) = self.handle.lock().await.take() {
            let _ = handle.await;
        }
    }
}

async fn run(mut rx: mpsc::UnboundedReceiver<HubCommand>, token: CancellationToken) {
    let mut clients: HashMap<(AppId, DeviceId), Arc<Client>> = HashMap::new();
    tracing::info!(target: "stream", "hub started");

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            cmd = rx.recv() => {
                let Some(cmd) = cmd else { break };
                match cmd {
                    HubCommand::Register(client) => {
                        let key = (client.app_id().clone(), client.device_id().clone());
                        tracing::info!(
                            target: "stream",
                            app_id = %key.0,
                            device_id = %key.1,
                            "client registered"
                        );
                        metric_inc("stream.client.registered");
                        if let Some(previous) = clients.insert(key, client) {
                            // Last login wins.
                            previous.close().await;
                        }
                    }
                    HubCommand::Unregister(client) => {
                        let key = (client.app_id().clone(), client.device_id().clone());
                        // Only evict the session that is actually
                        // registered; a replaced connection closing late
                        // must not tear down its successor.
                        if clients
                            .get(&key)
                            .is_some_and(|current| Arc::ptr_eq(current, &client))
                        {
                            clients.remove(&key);
                            client.go_offline().await;
                            tracing::info!(
                                target: "stream",
                                app_id = %key.0,
                                device_id = %key.1,
                                "client unregistered"
                            );
                            metric_inc("stream.client.unregistered");
                        }
                    }
                    HubCommand::Dispatch(delivery) => dispatch(&clients, delivery).await,
                }
            }
        }
    }

    for client in clients.values() {
        client.go_offline().await;
    }
    tracing::info!(target: "stream", "hub stopped");
}

async fn dispatch(clients: &HashMap<(AppId, DeviceId), Arc<Client>>, delivery: EventDelivery) {
    let Some(event_type) = delivery.cli_metadata.as_ref().map(|m| m.event_type.clone()) else {
        tracing::debug!(
            target: "stream",
            delivery_id = %delivery.id,
            "delivery carries no CLI metadata, skipping"
        );
        return;
    };

    let frame = match serde_json::to_vec(&delivery) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::error!(
                target: "stream",
                delivery_id = %delivery.id,
                error = %e,
                "failed to serialize delivery frame"
            );
            return;
        }
    };

    for ((app_id, device_id), client) in clients {
        if app_id != &delivery.app_id {
            continue;
        }
        if !client.is_online().await {
            continue;
        }
        if !client.has_event_type(&event_type) {
            continue;
        }

        match client.send(frame.clone()).await {
            Ok(()) => {
                metric_inc("stream.delivery.pushed");
                tracing::debug!(
                    target: "stream",
                    delivery_id = %delivery.id,
                    device_id = %device_id,
                    "delivery pushed to client"
                );
            }
            Err(e) => {
                tracing::error!(
                    target: "stream",
                    delivery_id = %delivery.id,
                    device_id = %device_id,
                    error = %e,
                    "failed to push delivery to client"
                );
            }
        }
    }
}
