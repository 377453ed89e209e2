//! Domain events announcing authorization mutations.
//!
//! Mutations publish after their writes land. Delivery failures are logged
//! and never propagated, so a flaky bus cannot veto a completed write.

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::warn;

use crate::error::Result;

pub const TOPIC_RELATION_CREATED: &str = "authorization:create:relation";
pub const TOPIC_RESOURCE_CREATED: &str = "authorization:create:resource";
pub const TOPIC_RESOURCE_UPDATED: &str = "authorization:update:resource";

/// Outbound side of the engine: completed mutations announce themselves here.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, topic: &str, payload: serde_json::Value) -> Result<()>;
}

/// Publisher that drops every event, for deployments without a bus.
pub struct NullEventBus;

#[async_trait]
impl EventPublisher for NullEventBus {
    async fn publish(&self, _topic: &str, _payload: serde_json::Value) -> Result<()> {
        Ok(())
    }
}

/// Publisher that records events in memory, for tests and local development.
#[derive(Default)]
pub struct MemoryEventBus {
    events: RwLock<Vec<(String, serde_json::Value)>>,
}

impl MemoryEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<(String, serde_json::Value)> {
        self.events.read().await.clone()
    }

    pub async fn topics(&self) -> Vec<String> {
        self.events
            .read()
            .await
            .iter()
            .map(|(topic, _)| topic.clone())
            .collect()
    }
}

#[async_trait]
impl EventPublisher for MemoryEventBus {
    async fn publish(&self, topic: &str, payload: serde_json::Value) -> Result<()> {
        self.events.write().await.push((topic.to_string(), payload));
        Ok(())
    }
}

/// Serializes and publishes; failures are logged, never returned.
pub(crate) async fn emit<T: Serialize>(bus: &dyn EventPublisher, topic: &str, entity: &T) {
    match serde_json::to_value(entity) {
        Ok(payload) => {
            if let Err(err) = bus.publish(topic, payload).await {
                warn!(topic, "failed to publish event: {err}");
            }
        }
        Err(err) => warn!(topic, "failed to serialize event payload: {err}"),
    }
}
