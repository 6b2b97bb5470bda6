/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Archival request and confirmation messages

use crate::{
    chunk::ChunkDescriptor,
    error::{RetentionError, Result},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default topic archival requests are published on
pub const ARCHIVAL_TOPIC: &str = "archival.events";

/// Default topic confirmations are received on
pub const CONFIRMATION_TOPIC: &str = "archival.confirmations";

/// Event type attached to every archival request
pub const ARCHIVAL_REQUESTED: &str = "data.archival.requested";

/// Request handed to the archival pipeline for one table.
///
/// Immutable once published; `event_id` correlates the eventual
/// confirmation with the pending bookkeeping entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchivalRequest {
    pub event_id: String,
    pub table_name: String,
    pub chunks: Vec<ChunkDescriptor>,
}

/// Terminal status reported by the archival pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ArchivalStatus {
    Completed,
    Failed,
}

/// Inbound confirmation for a previously published request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchivalConfirmation {
    pub event_id: String,
    pub status: ArchivalStatus,
    pub completed_at: DateTime<Utc>,
    /// Where the archived data landed, on success
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lakehouse_path: Option<String>,
    /// Pipeline error, on failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl ArchivalRequest {
    /// Build a request with a fresh correlation id
    pub fn new(table_name: impl Into<String>, chunks: Vec<ChunkDescriptor>) -> Result<Self> {
        let table_name = table_name.into();
        if chunks.is_empty() {
            return Err(RetentionError::InvalidRequest(format!(
                "no chunks to archive for {}",
                table_name
            )));
        }

        Ok(Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            table_name,
            chunks,
        })
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

impl ArchivalConfirmation {
    pub fn completed(event_id: impl Into<String>, lakehouse_path: impl Into<String>) -> Self {
        Self {
            event_id: event_id.into(),
            status: ArchivalStatus::Completed,
            completed_at: Utc::now(),
            lakehouse_path: Some(lakehouse_path.into()),
            error_message: None,
        }
    }

    pub fn failed(event_id: impl Into<String>, error_message: impl Into<String>) -> Self {
        Self {
            event_id: event_id.into(),
            status: ArchivalStatus::Failed,
            completed_at: Utc::now(),
            lakehouse_path: None,
            error_message: Some(error_message.into()),
        }
    }

    pub fn from_json(payload: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(payload)?)
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}
