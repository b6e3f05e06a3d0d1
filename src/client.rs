//! A connected CLI client session.
//!
//! One reader task per connection; the WebSocket library contract
//! forbids concurrent reads. Writes come from the hub's dispatch path
//! and from the ping handler, serialized through the sink mutex. The
//! in-memory device record is shared between the reader (ping handler)
//! and the hub (liveness reads), guarded by a read/write lock.

use std::sync::Arc;

use chrono::Utc;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;

use crate::error::StreamError;
use crate::hub::{Hub, HubCommand};
use crate::repo::{DeviceRepo, EventDeliveryRepo};
use crate::types::{AppId, DeliveryId, DeliveryStatus, Device, DeviceId, DeviceStatus};

/// Server side of an upgraded streaming connection.
pub type ServerSocket = WebSocketStream<TcpStream>;
type SocketSink = SplitSink<ServerSocket, Message>;

/// `{"uid": "<event-delivery-id>"}` acknowledgement frame.
#[derive(Debug, Deserialize)]
struct AckMessage {
    uid: String,
}

/// Middleman between one WebSocket connection and the hub.
pub struct Client {
    device_id: DeviceId,
    app_id: AppId,
    event_types: Vec<String>,
    device: RwLock<Device>,
    sink: Mutex<SocketSink>,
    devices: Arc<dyn DeviceRepo>,
    deliveries: Arc<dyn EventDeliveryRepo>,
    hub_tx: mpsc::UnboundedSender<HubCommand>,
    token: CancellationToken,
}

impl Client {
    /// Register a freshly upgraded connection with the hub and start
    /// its read loop. The device identity and subscribed event types
    /// come from the login path.
    pub fn spawn(
        hub: &Hub,
        socket: ServerSocket,
        device: Device,
        event_types: Vec<String>,
        devices: Arc<dyn DeviceRepo>,
        deliveries: Arc<dyn EventDeliveryRepo>,
    ) -> Arc<Client> {
        let (sink, stream) = socket.split();
        let client = Arc::new(Client {
            device_id: device.id.clone(),
            app_id: device.app_id.clone(),
            event_types,
            device: RwLock::new(device),
            sink: Mutex::new(sink),
            devices,
            deliveries,
            hub_tx: hub.sender(),
            token: hub.child_token(),
        });

        hub.register(client.clone());
        tokio::spawn(read_loop(stream, client.clone()));
        client
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    pub fn app_id(&self) -> &AppId {
        &self.app_id
    }

    /// Liveness per the two-minute last-seen window.
    pub async fn is_online(&self) -> bool {
        self.device.read().await.is_online()
    }

    /// Whether this session subscribed to `event_type`; `"*"` matches
    /// everything.
    pub fn has_event_type(&self, event_type: &str) -> bool {
        self.event_types
            .iter()
            .any(|t| t == event_type || t == "*")
    }

    /// Push a serialized delivery frame to the peer.
    pub async fn send(&self, frame: Vec<u8>) -> Result<(), StreamError> {
        self.sink.lock().await.send(Message::Binary(frame)).await?;
        Ok(())
    }

    /// Persist the device as offline, then close the connection.
    pub async fn go_offline(&self) {
        {
            let mut device = self.device.write().await;
            device.status = DeviceStatus::Offline;
            if let Err(e) = self
                .devices
                .update_status(&device, DeviceStatus::Offline)
                .await
            {
                tracing::error!(
                    target: "stream",
                    device_id = %self.device_id,
                    error = %e,
                    "failed to mark device offline"
                );
            }
        }
        self.close().await;
    }

    /// Stop the read loop and close the socket.
    pub(crate) async fn close(&self) {
        self.token.cancel();
        if let Err(e) = self.sink.lock().await.close().await {
            tracing::debug!(
                target: "stream",
                device_id = %self.device_id,
                error = %e,
                "closing session socket"
            );
        }
    }

    /// Refresh last-seen, mark online, reply PONG("ok"). Either write
    /// failing is fatal to the session.
    async fn handle_ping(&self) -> Result<(), StreamError> {
        {
            let mut device = self.device.write().await;
            device.last_seen_at = Utc::now();
            device.status = DeviceStatus::Online;
            self.devices
                .update_last_seen(&device, DeviceStatus::Online)
                .await?;
        }

        self.sink
            .lock()
            .await
            .send(Message::Pong(b"ok".to_vec()))
            .await?;
        Ok(())
    }

    /// Acknowledgement: mark the delivery successful off the read loop.
    fn handle_ack(&self, text: &str) {
        let ack: AckMessage = match serde_json::from_str(text) {
            Ok(ack) => ack,
            Err(e) => {
                tracing::error!(
                    target: "stream",
                    device_id = %self.device_id,
                    error = %e,
                    "failed to parse ack message"
                );
                return;
            }
        };

        let deliveries = self.deliveries.clone();
        tokio::spawn(async move {
            let id = DeliveryId(ack.uid);
            if let Err(e) = deliveries
                .update_delivery_status(&id, DeliveryStatus::Success)
                .await
            {
                tracing::error!(
                    target: "stream",
                    delivery_id = %id,
                    error = %e,
                    "failed to acknowledge delivery"
                );
            }
        });
    }
}

/// Pump messages from the connection until close, error, or hub
/// shutdown, then hand the session back to the hub.
async fn read_loop(mut stream: SplitStream<ServerSocket>, client: Arc<Client>) {
    loop {
        tokio::select! {
            _ = client.token.cancelled() => break,
            msg = stream.next() => match msg {
                Some(Ok(Message::Ping(_))) => {
                    if let Err(e) = client.handle_ping().await {
                        tracing::error!(
                            target: "stream",
                            device_id = %client.device_id,
                            error = %e,
                            "ping handling failed, closing session"
                        );
                        break;
                    }
                }
                Some(Ok(Message::Text(text))) => client.handle_ack(&text),
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    if !is_normal_close(&e) {
                        tracing::error!(
                            target: "stream",
                            device_id = %client.device_id,
                            error = %e,
                            "unexpected close error"
                        );
                    }
                    break;
                }
            }
        }
    }

    let _ = client.hub_tx.send(HubCommand::Unregister(client.clone()));
}

fn is_normal_close(err: &WsError) -> bool {
    matches!(err, WsError::ConnectionClosed | WsError::AlreadyClosed)
}
