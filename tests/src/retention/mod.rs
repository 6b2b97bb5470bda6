/*
 * SPDX-FileCopyrightText: 2024 A3Mailer Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! End-to-end retention tests against in-memory storage and message bus

pub mod safety;
pub mod scenarios;
pub mod service;

use chrono::{DateTime, Duration, Utc};
use hypertable_retention::{
    testing::{MockBus, MockCatalog},
    ArchivalConfig, ChunkDescriptor, InMemoryPendingStore, RetentionCoordinator,
};
use std::sync::Arc;

pub struct TestEnv {
    pub catalog: Arc<MockCatalog>,
    pub bus: Arc<MockBus>,
    pub store: Arc<InMemoryPendingStore>,
    pub coordinator: RetentionCoordinator,
}

impl TestEnv {
    pub fn new() -> Self {
        Self::with_config(ArchivalConfig::default())
    }

    pub fn with_config(config: ArchivalConfig) -> Self {
        let catalog = Arc::new(MockCatalog::new());
        let bus = Arc::new(MockBus::new());
        let store = Arc::new(InMemoryPendingStore::new());
        let coordinator =
            RetentionCoordinator::new(catalog.clone(), bus.clone(), store.clone(), &config);
        Self {
            catalog,
            bus,
            store,
            coordinator,
        }
    }
}

/// A one-week chunk ending `days_ago` days before `now`
pub fn chunk_ending(name: &str, now: DateTime<Utc>, days_ago: i64) -> ChunkDescriptor {
    ChunkDescriptor::new(
        name,
        now - Duration::days(days_ago + 7),
        now - Duration::days(days_ago),
    )
}
