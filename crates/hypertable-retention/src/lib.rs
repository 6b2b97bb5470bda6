/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! # Hypertable Retention Coordinator
//!
//! Moves expired hypertable chunks to long-term storage before deleting them:
//!
//! - Per-table retention policies read from the database
//! - Periodic identification of chunks past their retention window
//! - Archival requests published on the message bus
//! - Chunks dropped only after a matching COMPLETED confirmation
//! - Pending confirmations tracked durably and expired when unanswered

pub mod bus;
pub mod catalog;
pub mod chunk;
pub mod config;
pub mod confirmation;
pub mod coordinator;
pub mod error;
pub mod event;
pub mod metrics;
pub mod pending;
pub mod policy;
pub mod postgres;
pub mod publisher;
pub mod scheduler;

#[cfg(any(test, feature = "test_mode"))]
pub mod testing;

pub use bus::{BusConfig, MessageBus, NatsMessageBus};
pub use catalog::HypertableCatalog;
pub use chunk::{ChunkDescriptor, ChunkIdentifier};
pub use config::{ArchivalConfig, LoggingConfig, RetentionConfig, ScheduleConfig};
pub use confirmation::{ConfirmationHandler, ConfirmationOutcome};
pub use coordinator::{CycleReport, RetentionCoordinator};
pub use error::{Result, RetentionError};
pub use event::{ArchivalConfirmation, ArchivalRequest, ArchivalStatus};
pub use pending::{InMemoryPendingStore, PendingConfirmation, PendingStore};
pub use policy::{RetentionPolicy, TablePolicy};
pub use postgres::{DatabaseConfig, PostgresCatalog, PostgresPendingStore};
pub use scheduler::{RetentionScheduler, SchedulerStatus};

use bytes::Bytes;
use futures::{stream::BoxStream, StreamExt};
use std::{sync::Arc, time::Duration};
use tokio::{sync::Mutex, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(1);
const MAX_RESUBSCRIBE_DELAY: Duration = Duration::from_secs(60);

/// Main retention service: the cycle scheduler plus the confirmation listener
#[derive(Debug, Clone)]
pub struct RetentionService {
    inner: Arc<RetentionServiceInner>,
}

#[derive(Debug)]
struct RetentionServiceInner {
    config: RetentionConfig,
    bus: Arc<dyn MessageBus>,
    coordinator: Arc<RetentionCoordinator>,
    scheduler: RetentionScheduler,
    listener: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl RetentionService {
    /// Connect to PostgreSQL and the message bus and build the service
    pub async fn new(config: RetentionConfig) -> Result<Self> {
        info!("Initializing retention service");

        let pool = postgres::create_pool(&config.database)?;
        let catalog: Arc<dyn HypertableCatalog> =
            Arc::new(PostgresCatalog::new(pool.clone(), &config.database));
        let pending: Arc<dyn PendingStore> = if config.database.durable_pending {
            Arc::new(PostgresPendingStore::open(pool, &config.database).await?)
        } else {
            warn!("Pending confirmations are kept in memory and will not survive a restart");
            Arc::new(InMemoryPendingStore::new())
        };
        let bus: Arc<dyn MessageBus> = Arc::new(NatsMessageBus::connect(&config.bus).await?);

        Ok(Self::with_components(config, catalog, bus, pending))
    }

    /// Build the service from explicit collaborators
    pub fn with_components(
        config: RetentionConfig,
        catalog: Arc<dyn HypertableCatalog>,
        bus: Arc<dyn MessageBus>,
        pending: Arc<dyn PendingStore>,
    ) -> Self {
        let coordinator = Arc::new(RetentionCoordinator::new(
            catalog,
            bus.clone(),
            pending,
            &config.archival,
        ));
        let scheduler = RetentionScheduler::new(&config.schedule, coordinator.clone());

        Self {
            inner: Arc::new(RetentionServiceInner {
                config,
                bus,
                coordinator,
                scheduler,
                listener: Mutex::new(None),
            }),
        }
    }

    /// Start listening for confirmations, then start the scheduler
    pub async fn start(&self) -> Result<()> {
        info!("Starting retention service");

        {
            let mut listener = self.inner.listener.lock().await;
            if listener.is_some() {
                warn!("Retention service is already running");
                return Ok(());
            }

            let topic = self.inner.config.archival.confirmation_topic.clone();
            let confirmations = self.inner.bus.subscribe(&topic).await?;
            info!("Listening for archival confirmations on {}", topic);

            let token = CancellationToken::new();
            let handle = tokio::spawn(listen_for_confirmations(
                self.inner.bus.clone(),
                topic,
                self.inner.coordinator.clone(),
                confirmations,
                token.clone(),
            ));
            *listener = Some((token, handle));
        }

        self.inner.scheduler.start().await?;

        info!("Retention service started successfully");
        Ok(())
    }

    /// Stop the scheduler, then the confirmation listener
    pub async fn stop(&self) -> Result<()> {
        info!("Stopping retention service");

        self.inner.scheduler.stop().await?;

        if let Some((token, handle)) = self.inner.listener.lock().await.take() {
            token.cancel();
            if let Err(err) = handle.await {
                warn!("Confirmation listener ended abnormally: {}", err);
            }
        }

        info!("Retention service stopped");
        Ok(())
    }

    /// Run one cycle outside the schedule
    pub async fn run_cycle(&self) -> Result<CycleReport> {
        self.inner.coordinator.run_cycle().await
    }

    pub async fn pending_count(&self) -> Result<usize> {
        self.inner.coordinator.pending_store().len().await
    }

    pub async fn scheduler_status(&self) -> SchedulerStatus {
        self.inner.scheduler.status().await
    }

    pub async fn get_metrics(&self) -> metrics::RetentionMetrics {
        self.inner.coordinator.metrics().await
    }

    pub fn coordinator(&self) -> &Arc<RetentionCoordinator> {
        &self.inner.coordinator
    }
}

/// Feed confirmations to the coordinator until cancelled, resubscribing
/// whenever the subscription ends.
async fn listen_for_confirmations(
    bus: Arc<dyn MessageBus>,
    topic: String,
    coordinator: Arc<RetentionCoordinator>,
    mut confirmations: BoxStream<'static, Bytes>,
    cancelled: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            biased;
            _ = cancelled.cancelled() => break,
            next = confirmations.next() => next,
        };

        match next {
            // Handled outside the select so a drop is never cut short.
            Some(payload) => {
                if let Some(outcome) = coordinator.handle_payload(&payload).await {
                    debug!("Confirmation handled: {}", outcome.label());
                }
            }
            None => {
                error!("Confirmation subscription on {} closed, resubscribing", topic);
                match resubscribe(bus.as_ref(), &topic, &cancelled).await {
                    Some(stream) => {
                        coordinator.record_resubscribe().await;
                        confirmations = stream;
                    }
                    None => break,
                }
            }
        }
    }

    debug!("Confirmation listener exited");
}

/// Subscribe again with exponential backoff. `None` once cancelled.
async fn resubscribe(
    bus: &dyn MessageBus,
    topic: &str,
    cancelled: &CancellationToken,
) -> Option<BoxStream<'static, Bytes>> {
    let mut delay = RESUBSCRIBE_DELAY;
    loop {
        tokio::select! {
            biased;
            _ = cancelled.cancelled() => return None,
            _ = tokio::time::sleep(delay) => {}
        }

        match bus.subscribe(topic).await {
            Ok(stream) => {
                info!("Resubscribed to archival confirmations on {}", topic);
                return Some(stream);
            }
            Err(err) => {
                delay = (delay * 2).min(MAX_RESUBSCRIBE_DELAY);
                warn!(
                    "Resubscribing to {} failed, next attempt in {}s: {}",
                    topic,
                    delay.as_secs(),
                    err
                );
            }
        }
    }
}
