/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Publishing archival requests

use crate::{
    bus::MessageBus,
    chunk::ChunkDescriptor,
    error::Result,
    event::{ArchivalRequest, ARCHIVAL_REQUESTED},
    pending::{PendingConfirmation, PendingStore},
};
use bytes::Bytes;
use chrono::Utc;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Packages eligible chunks into archival requests and tracks them
#[derive(Debug, Clone)]
pub struct ArchivalPublisher {
    bus: Arc<dyn MessageBus>,
    pending: Arc<dyn PendingStore>,
    topic: String,
}

impl ArchivalPublisher {
    pub fn new(bus: Arc<dyn MessageBus>, pending: Arc<dyn PendingStore>, topic: impl Into<String>) -> Self {
        Self {
            bus,
            pending,
            topic: topic.into(),
        }
    }

    /// Publish one request covering `chunks` of `table_name`.
    ///
    /// The pending entry is recorded before the message leaves, so a
    /// confirmation racing the publish call always finds it. If publishing
    /// fails the entry is withdrawn and the error returned; nothing was
    /// dropped, so the next cycle identifies the same chunks again.
    pub async fn publish(
        &self,
        table_name: &str,
        chunks: Vec<ChunkDescriptor>,
    ) -> Result<ArchivalRequest> {
        let request = ArchivalRequest::new(table_name, chunks)?;
        let payload = Bytes::from(request.to_json()?);

        self.pending
            .insert(
                &request.event_id,
                PendingConfirmation {
                    table_name: request.table_name.clone(),
                    chunks: request.chunks.clone(),
                    timestamp: Utc::now(),
                },
            )
            .await?;

        if let Err(err) = self.bus.publish(&self.topic, ARCHIVAL_REQUESTED, payload).await {
            warn!(
                "Publishing archival request {} for {} failed: {}",
                request.event_id, table_name, err
            );
            if let Err(remove_err) = self.pending.remove(&request.event_id).await {
                // The entry will be cleared by the expiry sweep instead.
                error!(
                    "Failed to withdraw pending entry {}: {}",
                    request.event_id, remove_err
                );
            }
            return Err(err);
        }

        info!(
            "Requested archival of {} chunks of {} as event {}",
            request.chunks.len(),
            table_name,
            request.event_id
        );
        Ok(request)
    }
}
