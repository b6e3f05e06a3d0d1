//! The stream bridge: wires the hub, the event watcher, and incoming
//! WebSocket upgrades together.
//!
//! Authentication and device login live outside this crate; the
//! embedder resolves a connection to a [`Device`] plus its subscribed
//! event types and hands both to [`StreamBridge::attach`].

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;

use crate::client::{Client, ServerSocket};
use crate::error::StreamError;
use crate::hub::Hub;
use crate::repo::{DeviceRepo, EventDeliveryRepo};
use crate::types::Device;
use crate::watcher::run_event_watcher;

/// Maximum inbound message size from a peer. Acks and pings are tiny;
/// anything larger is a misbehaving client.
pub const MAX_MESSAGE_SIZE: usize = 512;

/// Pause after stopping the hub so in-flight session teardown and ack
/// writes can finish.
const DRAIN_PERIOD: Duration = Duration::from_secs(1);

/// Upgrade a raw TCP connection to a size-capped WebSocket.
pub async fn accept(socket: TcpStream) -> Result<ServerSocket, StreamError> {
    let mut config = WebSocketConfig::default();
    config.max_message_size = Some(MAX_MESSAGE_SIZE);
    let ws = tokio_tungstenite::accept_async_with_config(socket, Some(config)).await?;
    Ok(ws)
}

/// Long-lived streaming side: hub actor plus change-feed watcher.
pub struct StreamBridge {
    hub: Arc<Hub>,
    devices: Arc<dyn DeviceRepo>,
    deliveries: Arc<dyn EventDeliveryRepo>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl StreamBridge {
    /// Start the hub and the watcher. Must be called from within a
    /// tokio runtime.
    pub fn start(
        devices: Arc<dyn DeviceRepo>,
        deliveries: Arc<dyn EventDeliveryRepo>,
    ) -> Arc<Self> {
        let hub = Hub::start();
        let watcher = tokio::spawn(run_event_watcher(
            deliveries.clone(),
            hub.clone(),
            hub.child_token(),
        ));

        Arc::new(Self {
            hub,
            devices,
            deliveries,
            watcher: Mutex::new(Some(watcher)),
        })
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    /// Upgrade `socket` and register the session with the hub.
    pub async fn attach(
        &self,
        socket: TcpStream,
        device: Device,
        event_types: Vec<String>,
    ) -> Result<Arc<Client>, StreamError> {
        let ws = accept(socket).await?;
        Ok(Client::spawn(
            &self.hub,
            ws,
            device,
            event_types,
            self.devices.clone(),
            self.deliveries.clone(),
        ))
    }

    /// Stop the hub, wait for the watcher, then drain briefly so
    /// sessions can close themselves.
    pub async fn shutdown(&self) {
        self.hub.stop().await;
        if let Some(handle) = self.watcher.lock().await.take() {
            let _ = handle.await;
        }
        tokio::time::sleep(DRAIN_PERIOD).await;
        tracing::info!(target: "stream", "stream bridge stopped");
    }
}
