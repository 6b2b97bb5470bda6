/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! In-memory doubles for the storage engine and the message bus

use crate::{
    bus::MessageBus,
    catalog::HypertableCatalog,
    chunk::ChunkDescriptor,
    error::{RetentionError, Result},
    event::{ArchivalConfirmation, ArchivalRequest},
    pending::{Claim, InMemoryPendingStore, PendingConfirmation, PendingStore},
    policy::{RetentionPolicy, TablePolicy},
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use std::{
    collections::{BTreeMap, HashSet},
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
    time::Duration,
};
use tokio::sync::mpsc;

/// Hypertable catalog kept in memory.
///
/// Drops are applied all-or-nothing to mirror the transactional backend.
#[derive(Debug, Default)]
pub struct MockCatalog {
    policies: Mutex<BTreeMap<String, RetentionPolicy>>,
    chunks: Mutex<BTreeMap<String, Vec<ChunkDescriptor>>>,
    dropped: Mutex<Vec<(String, String)>>,
    failing_tables: Mutex<HashSet<String>>,
    failing_chunks: Mutex<HashSet<String>>,
    policies_unavailable: Mutex<bool>,
    listing_delay: Mutex<Option<Duration>>,
    listings: AtomicUsize,
    listings_in_flight: AtomicUsize,
    max_listings_in_flight: AtomicUsize,
}

impl MockCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_policy(&self, table_name: &str, policy: RetentionPolicy) {
        self.policies.lock().insert(table_name.to_string(), policy);
    }

    pub fn add_chunk(&self, table_name: &str, chunk: ChunkDescriptor) {
        self.chunks
            .lock()
            .entry(table_name.to_string())
            .or_default()
            .push(chunk);
    }

    /// Make `list_chunks` fail for `table_name`
    pub fn fail_listing_of(&self, table_name: &str) {
        self.failing_tables.lock().insert(table_name.to_string());
    }

    /// Make any drop batch containing `chunk_name` fail
    pub fn fail_drop_of(&self, chunk_name: &str) {
        self.failing_chunks.lock().insert(chunk_name.to_string());
    }

    pub fn clear_drop_failures(&self) {
        self.failing_chunks.lock().clear();
    }

    pub fn fail_policy_reads(&self, unavailable: bool) {
        *self.policies_unavailable.lock() = unavailable;
    }

    /// Make every `list_chunks` call take `delay` before answering
    pub fn delay_listing(&self, delay: Duration) {
        *self.listing_delay.lock() = Some(delay);
    }

    /// Number of `list_chunks` calls that returned
    pub fn listings(&self) -> usize {
        self.listings.load(Ordering::SeqCst)
    }

    /// Highest number of `list_chunks` calls observed running at once
    pub fn max_listings_in_flight(&self) -> usize {
        self.max_listings_in_flight.load(Ordering::SeqCst)
    }

    /// Chunks still present for `table_name`
    pub fn chunk_names(&self, table_name: &str) -> Vec<String> {
        self.chunks
            .lock()
            .get(table_name)
            .map(|chunks| chunks.iter().map(|c| c.chunk_name.clone()).collect())
            .unwrap_or_default()
    }

    /// Chunks dropped from `table_name`, in drop order
    pub fn dropped_names(&self, table_name: &str) -> Vec<String> {
        self.dropped
            .lock()
            .iter()
            .filter(|(table, _)| table == table_name)
            .map(|(_, chunk)| chunk.clone())
            .collect()
    }

    /// Number of chunk drops that were committed
    pub fn drop_calls(&self) -> usize {
        self.dropped.lock().len()
    }
}

#[async_trait]
impl HypertableCatalog for MockCatalog {
    async fn retention_policies(&self) -> Result<Vec<TablePolicy>> {
        if *self.policies_unavailable.lock() {
            return Err(RetentionError::Pool("catalog unavailable".to_string()));
        }
        Ok(self
            .policies
            .lock()
            .iter()
            .map(|(table, policy)| TablePolicy::new(table.clone(), *policy))
            .collect())
    }

    async fn list_chunks(&self, table_name: &str) -> Result<Vec<ChunkDescriptor>> {
        let in_flight = self.listings_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_listings_in_flight.fetch_max(in_flight, Ordering::SeqCst);

        let delay = *self.listing_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        self.listings_in_flight.fetch_sub(1, Ordering::SeqCst);
        self.listings.fetch_add(1, Ordering::SeqCst);

        if self.failing_tables.lock().contains(table_name) {
            return Err(RetentionError::Pool(format!("cannot list chunks of {}", table_name)));
        }
        Ok(self.chunks.lock().get(table_name).cloned().unwrap_or_default())
    }

    async fn drop_chunks(
        &self,
        event_id: &str,
        table_name: &str,
        chunks: &[ChunkDescriptor],
    ) -> Result<()> {
        let failing = self.failing_chunks.lock();
        if let Some(chunk) = chunks.iter().find(|c| failing.contains(&c.chunk_name)) {
            return Err(RetentionError::DropFailed {
                event_id: event_id.to_string(),
                chunk: chunk.chunk_name.clone(),
                reason: "injected failure".to_string(),
            });
        }
        drop(failing);

        let mut stored = self.chunks.lock();
        let mut dropped = self.dropped.lock();
        let table_chunks = stored.entry(table_name.to_string()).or_default();
        for chunk in chunks {
            if let Some(pos) = table_chunks.iter().position(|c| c.chunk_name == chunk.chunk_name) {
                table_chunks.remove(pos);
                dropped.push((table_name.to_string(), chunk.chunk_name.clone()));
            }
        }
        Ok(())
    }
}

/// A message captured by [`MockBus`]
#[derive(Debug, Clone)]
pub struct PublishedMessage {
    pub topic: String,
    pub event_type: String,
    pub payload: Bytes,
}

/// Message bus that records publishes and lets tests inject deliveries.
///
/// Each `subscribe` opens a fresh stream; payloads delivered while nobody is
/// subscribed are queued for the next subscriber.
#[derive(Debug, Default)]
pub struct MockBus {
    published: Mutex<Vec<PublishedMessage>>,
    fail_publish: Mutex<bool>,
    subscriber: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    backlog: Mutex<Vec<Bytes>>,
    subscriptions: AtomicUsize,
}

impl MockBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_publishes(&self, fail: bool) {
        *self.fail_publish.lock() = fail;
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.published.lock().clone()
    }

    /// Decoded archival requests, in publish order
    pub fn requests(&self) -> Vec<ArchivalRequest> {
        self.published
            .lock()
            .iter()
            .filter_map(|message| serde_json::from_slice(&message.payload).ok())
            .collect()
    }

    /// Deliver a raw payload to the current subscriber
    pub fn deliver(&self, payload: impl Into<Bytes>) {
        let payload = payload.into();
        let mut subscriber = self.subscriber.lock();
        if let Some(sender) = subscriber.as_ref() {
            match sender.send(payload) {
                Ok(()) => return,
                Err(err) => {
                    *subscriber = None;
                    self.backlog.lock().push(err.0);
                }
            }
        } else {
            self.backlog.lock().push(payload);
        }
    }

    pub fn confirm(&self, confirmation: &ArchivalConfirmation) -> Result<()> {
        self.deliver(confirmation.to_json()?);
        Ok(())
    }

    /// End the current subscription stream, as a lost connection would
    pub fn close_subscription(&self) {
        self.subscriber.lock().take();
    }

    /// Number of successful `subscribe` calls
    pub fn subscriptions(&self) -> usize {
        self.subscriptions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageBus for MockBus {
    async fn publish(&self, topic: &str, event_type: &str, payload: Bytes) -> Result<()> {
        if *self.fail_publish.lock() {
            return Err(RetentionError::MessageBus(format!("{} unavailable", topic)));
        }
        self.published.lock().push(PublishedMessage {
            topic: topic.to_string(),
            event_type: event_type.to_string(),
            payload,
        });
        Ok(())
    }

    async fn subscribe(&self, _topic: &str) -> Result<BoxStream<'static, Bytes>> {
        let (sender, receiver) = mpsc::unbounded_channel();
        for payload in self.backlog.lock().drain(..) {
            // The receiver is still held below.
            let _ = sender.send(payload);
        }
        *self.subscriber.lock() = Some(sender);
        self.subscriptions.fetch_add(1, Ordering::SeqCst);

        Ok(stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|payload| (payload, receiver))
        })
        .boxed())
    }
}

/// In-memory pending store whose operations can be made to fail
#[derive(Debug, Default)]
pub struct MockPendingStore {
    inner: InMemoryPendingStore,
    fail_next_remove: AtomicBool,
    fail_claims: AtomicBool,
}

impl MockPendingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `remove` fail without removing anything
    pub fn fail_next_remove(&self) {
        self.fail_next_remove.store(true, Ordering::SeqCst);
    }

    pub fn fail_claims(&self, fail: bool) {
        self.fail_claims.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl PendingStore for MockPendingStore {
    async fn insert(&self, event_id: &str, pending: PendingConfirmation) -> Result<()> {
        self.inner.insert(event_id, pending).await
    }

    async fn get(&self, event_id: &str) -> Result<Option<PendingConfirmation>> {
        self.inner.get(event_id).await
    }

    async fn claim(&self, event_id: &str) -> Result<Claim> {
        if self.fail_claims.load(Ordering::SeqCst) {
            return Err(RetentionError::Pool("pending store unavailable".to_string()));
        }
        self.inner.claim(event_id).await
    }

    async fn release(&self, event_id: &str) -> Result<()> {
        self.inner.release(event_id).await
    }

    async fn remove(&self, event_id: &str) -> Result<Option<PendingConfirmation>> {
        if self.fail_next_remove.swap(false, Ordering::SeqCst) {
            return Err(RetentionError::Pool("pending store unavailable".to_string()));
        }
        self.inner.remove(event_id).await
    }

    async fn expire_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<(String, PendingConfirmation)>> {
        self.inner.expire_before(cutoff).await
    }

    async fn entries(&self) -> Result<Vec<(String, PendingConfirmation)>> {
        self.inner.entries().await
    }
}
