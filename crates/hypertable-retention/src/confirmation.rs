/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Handling of archival confirmations
//!
//! Chunks are only dropped after a COMPLETED confirmation whose event id
//! matches a live pending entry. Every other case (failure, unknown or
//! duplicate event, drop error) leaves the data in place.

use crate::{
    catalog::HypertableCatalog,
    error::Result,
    event::{ArchivalConfirmation, ArchivalStatus},
    pending::{Claim, PendingStore},
};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// What handling a confirmation did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmationOutcome {
    /// Archival succeeded and the chunks were dropped
    Dropped {
        event_id: String,
        table_name: String,
        chunks: usize,
    },
    /// Archival failed; data kept for a later cycle
    Retained {
        event_id: String,
        table_name: String,
        error_message: Option<String>,
    },
    /// No pending entry for this event
    Unknown { event_id: String },
    /// Another confirmation for this event is being handled
    InFlight { event_id: String },
}

impl ConfirmationOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            ConfirmationOutcome::Dropped { .. } => "dropped",
            ConfirmationOutcome::Retained { .. } => "retained",
            ConfirmationOutcome::Unknown { .. } => "unknown",
            ConfirmationOutcome::InFlight { .. } => "in_flight",
        }
    }
}

/// Applies confirmations to storage and bookkeeping
#[derive(Debug, Clone)]
pub struct ConfirmationHandler {
    catalog: Arc<dyn HypertableCatalog>,
    pending: Arc<dyn PendingStore>,
}

impl ConfirmationHandler {
    pub fn new(catalog: Arc<dyn HypertableCatalog>, pending: Arc<dyn PendingStore>) -> Self {
        Self { catalog, pending }
    }

    pub async fn handle(&self, confirmation: &ArchivalConfirmation) -> Result<ConfirmationOutcome> {
        let event_id = confirmation.event_id.as_str();

        let pending = match self.pending.claim(event_id).await? {
            Claim::Claimed(pending) => pending,
            Claim::Unknown => {
                debug!("Ignoring confirmation for unknown event {}", event_id);
                return Ok(ConfirmationOutcome::Unknown {
                    event_id: event_id.to_string(),
                });
            }
            Claim::InFlight => {
                debug!("Confirmation for event {} is already being handled", event_id);
                return Ok(ConfirmationOutcome::InFlight {
                    event_id: event_id.to_string(),
                });
            }
        };

        match confirmation.status {
            ArchivalStatus::Completed => {
                if let Err(err) = self
                    .catalog
                    .drop_chunks(event_id, &pending.table_name, &pending.chunks)
                    .await
                {
                    error!(
                        "Archival of {} completed but dropping its chunks failed, data kept: {}",
                        pending.table_name, err
                    );
                    if let Err(release_err) = self.pending.release(event_id).await {
                        error!("Failed to release pending entry {}: {}", event_id, release_err);
                    }
                    return Err(err);
                }

                if let Err(err) = self.pending.remove(event_id).await {
                    // Dropping again on redelivery skips chunks that are gone.
                    error!(
                        "Chunks of {} were dropped but pending entry {} could not be removed: {}",
                        pending.table_name, event_id, err
                    );
                    if let Err(release_err) = self.pending.release(event_id).await {
                        error!("Failed to release pending entry {}: {}", event_id, release_err);
                    }
                    return Err(err);
                }

                info!(
                    "Archived and dropped {} chunks of {} (event {}, location {})",
                    pending.chunks.len(),
                    pending.table_name,
                    event_id,
                    confirmation.lakehouse_path.as_deref().unwrap_or("unknown")
                );

                Ok(ConfirmationOutcome::Dropped {
                    event_id: event_id.to_string(),
                    table_name: pending.table_name,
                    chunks: pending.chunks.len(),
                })
            }
            ArchivalStatus::Failed => {
                if let Err(err) = self.pending.remove(event_id).await {
                    if let Err(release_err) = self.pending.release(event_id).await {
                        error!("Failed to release pending entry {}: {}", event_id, release_err);
                    }
                    return Err(err);
                }
                warn!(
                    "Archival of {} failed for event {}, keeping {} chunks: {}",
                    pending.table_name,
                    event_id,
                    pending.chunks.len(),
                    confirmation.error_message.as_deref().unwrap_or("no error message")
                );

                Ok(ConfirmationOutcome::Retained {
                    event_id: event_id.to_string(),
                    table_name: pending.table_name,
                    error_message: confirmation.error_message.clone(),
                })
            }
        }
    }
}
