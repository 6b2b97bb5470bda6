/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Message bus abstraction used to talk to the archival pipeline

use crate::error::{RetentionError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Header carrying the event type of a published message
pub const EVENT_TYPE_HEADER: &str = "Event-Type";

/// Publish/subscribe transport
#[async_trait]
pub trait MessageBus: Send + Sync + std::fmt::Debug {
    /// Publish `payload` on `topic`; returns once the broker accepted it
    async fn publish(&self, topic: &str, event_type: &str, payload: Bytes) -> Result<()>;

    /// Stream of raw payloads delivered on `topic`
    async fn subscribe(&self, topic: &str) -> Result<BoxStream<'static, Bytes>>;
}

/// NATS connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub url: String,
    /// Connection name reported to the server
    pub client_name: String,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            url: "nats://127.0.0.1:4222".to_string(),
            client_name: "hypertable-retention".to_string(),
        }
    }
}

/// NATS backed message bus
#[derive(Debug, Clone)]
pub struct NatsMessageBus {
    client: async_nats::Client,
}

impl NatsMessageBus {
    pub async fn connect(config: &BusConfig) -> Result<Self> {
        info!("Connecting to message bus at {}", config.url);

        let client = async_nats::ConnectOptions::new()
            .name(config.client_name.as_str())
            .connect(config.url.as_str())
            .await
            .map_err(|e| RetentionError::MessageBus(format!("connect to {}: {}", config.url, e)))?;

        Ok(Self { client })
    }
}

#[async_trait]
impl MessageBus for NatsMessageBus {
    async fn publish(&self, topic: &str, event_type: &str, payload: Bytes) -> Result<()> {
        let mut headers = async_nats::HeaderMap::new();
        headers.insert(EVENT_TYPE_HEADER, event_type);

        self.client
            .publish_with_headers(topic.to_string(), headers, payload)
            .await
            .map_err(|e| RetentionError::MessageBus(format!("publish to {}: {}", topic, e)))?;

        // Publishing only buffers; flushing surfaces a dead connection to the caller.
        self.client
            .flush()
            .await
            .map_err(|e| RetentionError::MessageBus(format!("flush after publish to {}: {}", topic, e)))?;

        debug!("Published {} on {}", event_type, topic);
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<BoxStream<'static, Bytes>> {
        let subscriber = self
            .client
            .subscribe(topic.to_string())
            .await
            .map_err(|e| RetentionError::MessageBus(format!("subscribe to {}: {}", topic, e)))?;

        info!("Subscribed to {}", topic);
        Ok(subscriber.map(|message| message.payload).boxed())
    }
}
