/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Bookkeeping of archival requests awaiting confirmation
//!
//! The store is keyed by the request's `event_id` and is the only source of
//! truth for whether an archival is outstanding. Entries are inserted by the
//! publisher and removed by the confirmation handler or the expiry sweep,
//! possibly from different tasks, so every mutation is a single atomic map
//! operation.

use crate::{chunk::ChunkDescriptor, error::Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// An archival request that has been published but not yet confirmed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingConfirmation {
    pub table_name: String,
    /// Same chunks, same order as the published request
    pub chunks: Vec<ChunkDescriptor>,
    /// Submission time
    pub timestamp: DateTime<Utc>,
}

/// Outcome of trying to take exclusive ownership of a pending entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Claim {
    /// The caller now owns the entry until it removes or releases it
    Claimed(PendingConfirmation),
    /// Another confirmation is already acting on the entry
    InFlight,
    /// No entry for this event id
    Unknown,
}

/// Storage for pending confirmations
#[async_trait]
pub trait PendingStore: Send + Sync + std::fmt::Debug {
    async fn insert(&self, event_id: &str, pending: PendingConfirmation) -> Result<()>;

    async fn get(&self, event_id: &str) -> Result<Option<PendingConfirmation>>;

    /// Atomically mark the entry as being acted upon
    async fn claim(&self, event_id: &str) -> Result<Claim>;

    /// Undo a claim, leaving the entry pending
    async fn release(&self, event_id: &str) -> Result<()>;

    async fn remove(&self, event_id: &str) -> Result<Option<PendingConfirmation>>;

    /// Remove unclaimed entries submitted before `cutoff`
    async fn expire_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<(String, PendingConfirmation)>>;

    /// Snapshot of every entry
    async fn entries(&self) -> Result<Vec<(String, PendingConfirmation)>>;

    async fn len(&self) -> Result<usize> {
        Ok(self.entries().await?.len())
    }

    /// Names of chunks of `table_name` that are part of an outstanding request
    async fn pending_chunk_names(&self, table_name: &str) -> Result<HashSet<String>> {
        Ok(self
            .entries()
            .await?
            .into_iter()
            .filter(|(_, pending)| pending.table_name == table_name)
            .flat_map(|(_, pending)| pending.chunks.into_iter().map(|c| c.chunk_name))
            .collect())
    }
}

#[derive(Debug, Clone)]
struct PendingEntry {
    pending: PendingConfirmation,
    claimed: bool,
}

/// Process-local pending store.
///
/// Entries are lost when the process exits; a COMPLETED confirmation arriving
/// after a restart is then treated as unknown and nothing is dropped.
#[derive(Debug, Default)]
pub struct InMemoryPendingStore {
    entries: DashMap<String, PendingEntry>,
}

impl InMemoryPendingStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PendingStore for InMemoryPendingStore {
    async fn insert(&self, event_id: &str, pending: PendingConfirmation) -> Result<()> {
        self.entries.insert(
            event_id.to_string(),
            PendingEntry {
                pending,
                claimed: false,
            },
        );
        Ok(())
    }

    async fn get(&self, event_id: &str) -> Result<Option<PendingConfirmation>> {
        Ok(self.entries.get(event_id).map(|entry| entry.pending.clone()))
    }

    async fn claim(&self, event_id: &str) -> Result<Claim> {
        // The shard lock is held for the whole check-and-set.
        Ok(match self.entries.get_mut(event_id) {
            Some(mut entry) if !entry.claimed => {
                entry.claimed = true;
                Claim::Claimed(entry.pending.clone())
            }
            Some(_) => Claim::InFlight,
            None => Claim::Unknown,
        })
    }

    async fn release(&self, event_id: &str) -> Result<()> {
        if let Some(mut entry) = self.entries.get_mut(event_id) {
            entry.claimed = false;
        }
        Ok(())
    }

    async fn remove(&self, event_id: &str) -> Result<Option<PendingConfirmation>> {
        Ok(self.entries.remove(event_id).map(|(_, entry)| entry.pending))
    }

    async fn expire_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<(String, PendingConfirmation)>> {
        let candidates: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| !entry.claimed && entry.pending.timestamp < cutoff)
            .map(|entry| entry.key().clone())
            .collect();

        let expired = candidates
            .into_iter()
            .filter_map(|event_id| {
                self.entries
                    .remove_if(&event_id, |_, entry| {
                        !entry.claimed && entry.pending.timestamp < cutoff
                    })
                    .map(|(event_id, entry)| (event_id, entry.pending))
            })
            .collect();

        Ok(expired)
    }

    async fn entries(&self) -> Result<Vec<(String, PendingConfirmation)>> {
        Ok(self
            .entries
            .iter()
            .map(|entry| (entry.key().clone(), entry.pending.clone()))
            .collect())
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.entries.len())
    }
}
