//! Repository facades over the persistence layer.
//!
//! The engine never talks to a database directly; it goes through these
//! traits. Production deployments implement them against a document
//! store with indexed queries and change streams. [`InMemoryStore`]
//! implements all of them for tests and single-process embedding.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::{broadcast, Mutex};

use crate::error::RepoError;
use crate::types::{
    AppId, Application, DeliveryAttempt, DeliveryId, DeliveryMode, DeliveryStatus, Device,
    DeviceId, DeviceStatus, Endpoint, EndpointId, EndpointStatus, EventDelivery, Group, GroupId,
    Subscription, SubscriptionId, SubscriptionStatus,
};

/// Buffered change-feed capacity before slow watchers start lagging.
const FEED_CAPACITY: usize = 256;

#[async_trait]
pub trait ApplicationRepo: Send + Sync {
    async fn find_application_by_id(&self, id: &AppId) -> Result<Application, RepoError>;

    async fn find_endpoint_by_id(
        &self,
        app_id: &AppId,
        endpoint_id: &EndpointId,
    ) -> Result<Endpoint, RepoError>;

    async fn update_endpoint_status(
        &self,
        app_id: &AppId,
        endpoint_id: &EndpointId,
        status: EndpointStatus,
    ) -> Result<(), RepoError>;
}

#[async_trait]
pub trait SubscriptionRepo: Send + Sync {
    async fn find_subscription_by_id(&self, id: &SubscriptionId)
        -> Result<Subscription, RepoError>;

    async fn update_status(
        &self,
        id: &SubscriptionId,
        status: SubscriptionStatus,
    ) -> Result<(), RepoError>;
}

#[async_trait]
pub trait EventDeliveryRepo: Send + Sync {
    async fn find_delivery_by_id(&self, id: &DeliveryId) -> Result<EventDelivery, RepoError>;

    async fn update_delivery_status(
        &self,
        id: &DeliveryId,
        status: DeliveryStatus,
    ) -> Result<(), RepoError>;

    /// Persist the delivery's new status and bookkeeping together with
    /// the appended attempt, as one logical write.
    async fn update_with_attempt(
        &self,
        delivery: &EventDelivery,
        attempt: DeliveryAttempt,
    ) -> Result<(), RepoError>;

    /// Change feed of newly inserted deliveries with status Scheduled
    /// and CLI delivery mode, in insert order.
    fn watch_scheduled_cli_deliveries(&self) -> broadcast::Receiver<EventDelivery>;
}

#[async_trait]
pub trait GroupRepo: Send + Sync {
    async fn find_group_by_id(&self, id: &GroupId) -> Result<Group, RepoError>;
}

#[async_trait]
pub trait DeviceRepo: Send + Sync {
    /// Persist a ping: refresh last-seen and set the given status.
    async fn update_last_seen(
        &self,
        device: &Device,
        status: DeviceStatus,
    ) -> Result<(), RepoError>;

    async fn update_status(&self, device: &Device, status: DeviceStatus)
        -> Result<(), RepoError>;
}

/// In-memory implementation of every repository facade.
#[derive(Debug)]
pub struct InMemoryStore {
    applications: Mutex<HashMap<AppId, Application>>,
    endpoints: Mutex<HashMap<(AppId, EndpointId), Endpoint>>,
    subscriptions: Mutex<HashMap<SubscriptionId, Subscription>>,
    groups: Mutex<HashMap<GroupId, Group>>,
    deliveries: Mutex<HashMap<DeliveryId, EventDelivery>>,
    devices: Mutex<HashMap<DeviceId, Device>>,
    feed: broadcast::Sender<EventDelivery>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        let (feed, _) = broadcast::channel(FEED_CAPACITY);
        Self {
            applications: Mutex::new(HashMap::new()),
            endpoints: Mutex::new(HashMap::new()),
            subscriptions: Mutex::new(HashMap::new()),
            groups: Mutex::new(HashMap::new()),
            deliveries: Mutex::new(HashMap::new()),
            devices: Mutex::new(HashMap::new()),
            feed,
        }
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_application(&self, app: Application) {
        self.applications.lock().await.insert(app.id.clone(), app);
    }

    pub async fn insert_endpoint(&self, app_id: &AppId, endpoint: Endpoint) {
        self.endpoints
            .lock()
            .await
            .insert((app_id.clone(), endpoint.id.clone()), endpoint);
    }

    pub async fn insert_subscription(&self, subscription: Subscription) {
        self.subscriptions
            .lock()
            .await
            .insert(subscription.id.clone(), subscription);
    }

    pub async fn insert_group(&self, group: Group) {
        self.groups.lock().await.insert(group.id.clone(), group);
    }

    pub async fn insert_device(&self, device: Device) {
        self.devices.lock().await.insert(device.id.clone(), device);
    }

    /// Insert a delivery; Scheduled CLI deliveries are also published on
    /// the change feed, mirroring a change stream on inserts.
    pub async fn insert_delivery(&self, delivery: EventDelivery) {
        self.deliveries
            .lock()
            .await
            .insert(delivery.id.clone(), delivery.clone());

        if delivery.status == DeliveryStatus::Scheduled && delivery.mode == DeliveryMode::Cli {
            // No receivers connected yet is fine.
            let _ = self.feed.send(delivery);
        }
    }

    pub async fn delivery(&self, id: &DeliveryId) -> Option<EventDelivery> {
        self.deliveries.lock().await.get(id).cloned()
    }

    pub async fn subscription(&self, id: &SubscriptionId) -> Option<Subscription> {
        self.subscriptions.lock().await.get(id).cloned()
    }

    pub async fn endpoint(&self, app_id: &AppId, id: &EndpointId) -> Option<Endpoint> {
        self.endpoints
            .lock()
            .await
            .get(&(app_id.clone(), id.clone()))
            .cloned()
    }

    pub async fn device(&self, id: &DeviceId) -> Option<Device> {
        self.devices.lock().await.get(id).cloned()
    }
}

#[async_trait]
impl ApplicationRepo for InMemoryStore {
    async fn find_application_by_id(&self, id: &AppId) -> Result<Application, RepoError> {
        self.applications
            .lock()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| RepoError::not_found("application", id.0.as_str()))
    }

    async fn find_endpoint_by_id(
        &self,
        app_id: &AppId,
        endpoint_id: &EndpointId,
    ) -> Result<Endpoint, RepoError> {
        self.endpoints
            .lock()
            .await
            .get(&(app_id.clone(), endpoint_id.clone()))
            .cloned()
            .ok_or_else(|| RepoError::not_found("endpoint", endpoint_id.0.as_str()))
    }

    async fn update_endpoint_status(
        &self,
        app_id: &AppId,
        endpoint_id: &EndpointId,
        status: EndpointStatus,
    ) -> Result<(), RepoError> {
        let mut endpoints = self.endpoints.lock().await;
        let endpoint = endpoints
            .get_mut(&(app_id.clone(), endpoint_id.clone()))
            .ok_or_else(|| RepoError::not_found("endpoint", endpoint_id.0.as_str()))?;
        endpoint.status = status;
        Ok(())
    }
}

#[async_trait]
impl SubscriptionRepo for InMemoryStore {
    async fn find_subscription_by_id(
        &self,
        id: &SubscriptionId,
    ) -> Result<Subscription, RepoError> {
        self.subscriptions
            .lock()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| RepoError::not_found("subscription", id.0.as_str()))
    }

    async fn update_status(
        &self,
        id: &SubscriptionId,
        status: SubscriptionStatus,
    ) -> Result<(), RepoError> {
        let mut subscriptions = self.subscriptions.lock().await;
        let subscription = subscriptions
            .get_mut(id)
            .ok_or_else(|| RepoError::not_found("subscription", id.0.as_str()))?;
        subscription.status = status;
        Ok(())
    }
}

#[async_trait]
impl EventDeliveryRepo for InMemoryStore {
    async fn find_delivery_by_id(&self, id: &DeliveryId) -> Result<EventDelivery, RepoError> {
        self.deliveries
            .lock()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| RepoError::not_found("event delivery", id.0.as_str()))
    }

    async fn update_delivery_status(
        &self,
        id: &DeliveryId,
        status: DeliveryStatus,
    ) -> Result<(), RepoError> {
        let mut deliveries = self.deliveries.lock().await;
        let delivery = deliveries
            .get_mut(id)
            .ok_or_else(|| RepoError::not_found("event delivery", id.0.as_str()))?;
        delivery.status = status;
        Ok(())
    }

    async fn update_with_attempt(
        &self,
        delivery: &EventDelivery,
        attempt: DeliveryAttempt,
    ) -> Result<(), RepoError> {
        let mut deliveries = self.deliveries.lock().await;
        if !deliveries.contains_key(&delivery.id) {
            return Err(RepoError::not_found("event delivery", delivery.id.0.as_str()));
        }
        let mut updated = delivery.clone();
        updated.attempts.push(attempt);
        deliveries.insert(updated.id.clone(), updated);
        Ok(())
    }

    fn watch_scheduled_cli_deliveries(&self) -> broadcast::Receiver<EventDelivery> {
        self.feed.subscribe()
    }
}

#[async_trait]
impl GroupRepo for InMemoryStore {
    async fn find_group_by_id(&self, id: &GroupId) -> Result<Group, RepoError> {
        self.groups
            .lock()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| RepoError::not_found("group", id.0.as_str()))
    }
}

#[async_trait]
impl DeviceRepo for InMemoryStore {
    async fn update_last_seen(
        &self,
        device: &Device,
        status: DeviceStatus,
    ) -> Result<(), RepoError> {
        let mut devices = self.devices.lock().await;
        let stored = devices
            .get_mut(&device.id)
            .ok_or_else(|| RepoError::not_found("device", device.id.0.as_str()))?;
        stored.last_seen_at = device.last_seen_at;
        stored.status = status;
        Ok(())
    }

    async fn update_status(
        &self,
        device: &Device,
        status: DeviceStatus,
    ) -> Result<(), RepoError> {
        let mut devices = self.devices.lock().await;
        let stored = devices
            .get_mut(&device.id)
            .ok_or_else(|| RepoError::not_found("device", device.id.0.as_str()))?;
        stored.status = status;
        Ok(())
    }
}
