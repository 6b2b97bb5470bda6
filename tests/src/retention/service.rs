/*
 * SPDX-FileCopyrightText: 2024 A3Mailer Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Scheduler and confirmation listener running together

use super::chunk_ending;
use chrono::Utc;
use hypertable_retention::{
    testing::{MockBus, MockCatalog},
    ArchivalConfirmation, InMemoryPendingStore, RetentionConfig, RetentionPolicy,
    RetentionService, ScheduleConfig,
};
use std::{sync::Arc, time::Duration};

async fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test]
async fn service_archives_and_drops_end_to_end() {
    let now = Utc::now();
    let catalog = Arc::new(MockCatalog::new());
    let bus = Arc::new(MockBus::new());
    catalog.set_policy("metrics", RetentionPolicy::new(true, 30));
    catalog.add_chunk("metrics", chunk_ending("chunk_1", now, 40));
    catalog.add_chunk("metrics", chunk_ending("chunk_2", now, 1));

    let config = RetentionConfig {
        schedule: ScheduleConfig {
            enabled: true,
            interval_secs: 3600,
            run_on_start: true,
        },
        ..RetentionConfig::default()
    };
    let service = RetentionService::with_components(
        config,
        catalog.clone(),
        bus.clone(),
        Arc::new(InMemoryPendingStore::new()),
    );

    service.start().await.unwrap();
    assert!(wait_for(|| !bus.requests().is_empty()).await);
    assert_eq!(service.pending_count().await.unwrap(), 1);

    let request = bus.requests().remove(0);
    bus.confirm(&ArchivalConfirmation::completed(
        request.event_id,
        "s3://lakehouse/metrics",
    ))
    .unwrap();
    assert!(wait_for(|| catalog.drop_calls() == 1).await);

    service.stop().await.unwrap();

    assert_eq!(catalog.chunk_names("metrics"), vec!["chunk_2".to_string()]);
    assert_eq!(service.pending_count().await.unwrap(), 0);

    let metrics = service.get_metrics().await;
    assert_eq!(metrics.cycle_stats.total_cycles, 1);
    assert_eq!(metrics.confirmation_stats.completed, 1);
    assert_eq!(metrics.confirmation_stats.chunks_dropped, 1);

    let status = service.scheduler_status().await;
    assert!(!status.running);
    assert_eq!(status.last_report.map(|r| r.requests_published), Some(1));
}

#[tokio::test]
async fn manual_cycle_without_scheduler() {
    let now = Utc::now();
    let catalog = Arc::new(MockCatalog::new());
    let bus = Arc::new(MockBus::new());
    catalog.set_policy("metrics", RetentionPolicy::new(true, 7));
    catalog.add_chunk("metrics", chunk_ending("chunk_1", now, 10));

    let mut config = RetentionConfig::default();
    config.schedule.enabled = false;
    let service = RetentionService::with_components(
        config,
        catalog,
        bus.clone(),
        Arc::new(InMemoryPendingStore::new()),
    );

    let report = service.run_cycle().await.unwrap();
    assert_eq!(report.requests_published, 1);
    assert_eq!(bus.requests().len(), 1);
    assert!(!service.scheduler_status().await.running);
}
