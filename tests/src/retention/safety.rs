/*
 * SPDX-FileCopyrightText: 2024 A3Mailer Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Data is only deleted after an explicit, matching COMPLETED confirmation

use super::{chunk_ending, TestEnv};
use chrono::{Duration, Utc};
use hypertable_retention::{
    ArchivalConfig, ArchivalConfirmation, ConfirmationOutcome, PendingStore, RetentionError,
    RetentionPolicy,
};

#[tokio::test]
async fn publish_failure_is_retried_next_cycle() {
    let env = TestEnv::new();
    let now = Utc::now();
    env.catalog.set_policy("metrics", RetentionPolicy::new(true, 30));
    env.catalog.add_chunk("metrics", chunk_ending("chunk_1", now, 40));

    env.bus.fail_publishes(true);
    let report = env.coordinator.run_cycle_at(now).await.unwrap();
    assert_eq!(report.tables_failed, 1);
    assert_eq!(env.store.len().await.unwrap(), 0);
    assert_eq!(env.catalog.chunk_names("metrics"), vec!["chunk_1".to_string()]);

    env.bus.fail_publishes(false);
    let report = env.coordinator.run_cycle_at(now).await.unwrap();
    assert_eq!(report.requests_published, 1);
    assert_eq!(env.bus.requests()[0].chunks[0].chunk_name, "chunk_1");
    assert_eq!(env.store.len().await.unwrap(), 1);
}

#[tokio::test]
async fn unknown_event_changes_nothing() {
    let env = TestEnv::new();
    let now = Utc::now();
    env.catalog.set_policy("metrics", RetentionPolicy::new(true, 30));
    env.catalog.add_chunk("metrics", chunk_ending("chunk_1", now, 40));
    env.coordinator.run_cycle_at(now).await.unwrap();

    let outcome = env
        .coordinator
        .handle_confirmation(&ArchivalConfirmation::completed("forged-event", "s3://lake"))
        .await
        .unwrap();

    assert_eq!(outcome.label(), "unknown");
    assert_eq!(env.catalog.drop_calls(), 0);
    assert_eq!(env.store.len().await.unwrap(), 1);
}

#[tokio::test]
async fn redelivered_confirmation_drops_once() {
    let env = TestEnv::new();
    let now = Utc::now();
    env.catalog.set_policy("metrics", RetentionPolicy::new(true, 30));
    env.catalog.add_chunk("metrics", chunk_ending("chunk_1", now, 40));
    env.catalog.add_chunk("metrics", chunk_ending("chunk_2", now, 33));
    env.coordinator.run_cycle_at(now).await.unwrap();
    let confirmation =
        ArchivalConfirmation::completed(env.bus.requests()[0].event_id.clone(), "s3://lake");

    let (first, second) = tokio::join!(
        env.coordinator.handle_confirmation(&confirmation),
        env.coordinator.handle_confirmation(&confirmation)
    );
    let third = env.coordinator.handle_confirmation(&confirmation).await;

    let dropped = [first, second, third]
        .into_iter()
        .map(Result::unwrap)
        .filter(|outcome| matches!(outcome, ConfirmationOutcome::Dropped { .. }))
        .count();
    assert_eq!(dropped, 1);
    assert_eq!(env.catalog.drop_calls(), 2);
    assert_eq!(env.store.len().await.unwrap(), 0);
}

#[tokio::test]
async fn failed_drop_is_rolled_back_and_retryable() {
    let env = TestEnv::new();
    let now = Utc::now();
    env.catalog.set_policy("metrics", RetentionPolicy::new(true, 30));
    env.catalog.add_chunk("metrics", chunk_ending("chunk_1", now, 40));
    env.catalog.add_chunk("metrics", chunk_ending("chunk_2", now, 33));
    env.coordinator.run_cycle_at(now).await.unwrap();
    let confirmation =
        ArchivalConfirmation::completed(env.bus.requests()[0].event_id.clone(), "s3://lake");

    env.catalog.fail_drop_of("chunk_2");
    let result = env.coordinator.handle_confirmation(&confirmation).await;
    assert!(matches!(result, Err(RetentionError::DropFailed { .. })));
    assert_eq!(env.catalog.chunk_names("metrics").len(), 2);
    assert_eq!(env.store.len().await.unwrap(), 1);
    assert_eq!(env.coordinator.metrics().await.confirmation_stats.drop_errors, 1);

    // Outstanding chunks are not requested again while the entry lives.
    let report = env.coordinator.run_cycle_at(now).await.unwrap();
    assert_eq!(report.requests_published, 0);

    // A redelivery after the storage recovers completes the drop.
    env.catalog.clear_drop_failures();
    let outcome = env
        .coordinator
        .handle_confirmation(&confirmation)
        .await
        .unwrap();
    assert_eq!(outcome.label(), "dropped");
    assert!(env.catalog.chunk_names("metrics").is_empty());
    assert_eq!(env.store.len().await.unwrap(), 0);
}

#[tokio::test]
async fn malformed_confirmation_is_ignored() {
    let env = TestEnv::new();
    let now = Utc::now();
    env.catalog.set_policy("metrics", RetentionPolicy::new(true, 30));
    env.catalog.add_chunk("metrics", chunk_ending("chunk_1", now, 40));
    env.coordinator.run_cycle_at(now).await.unwrap();
    let event_id = env.bus.requests()[0].event_id.clone();

    let payloads = [
        "not json".to_string(),
        format!(r#"{{"event_id": "{}", "status": "DONE"}}"#, event_id),
        format!(r#"{{"event_id": "{}"}}"#, event_id),
    ];
    for payload in &payloads {
        assert!(env.coordinator.handle_payload(payload.as_bytes()).await.is_none());
    }

    assert_eq!(env.catalog.drop_calls(), 0);
    assert_eq!(env.store.len().await.unwrap(), 1);
    assert_eq!(env.coordinator.metrics().await.confirmation_stats.malformed, 3);
}

#[tokio::test]
async fn unanswered_request_expires_without_drops() {
    let env = TestEnv::with_config(ArchivalConfig {
        pending_expiry_secs: Some(6 * 3600),
        ..ArchivalConfig::default()
    });
    let now = Utc::now();
    env.catalog.set_policy("metrics", RetentionPolicy::new(true, 30));
    env.catalog.add_chunk("metrics", chunk_ending("chunk_1", now, 40));
    env.coordinator.run_cycle_at(now).await.unwrap();
    let stale_event = env.bus.requests()[0].event_id.clone();

    let report = env
        .coordinator
        .run_cycle_at(now + Duration::hours(7))
        .await
        .unwrap();
    assert_eq!(report.pending_expired, 1);
    assert_eq!(report.requests_published, 1);
    assert_eq!(env.catalog.drop_calls(), 0);

    // A late confirmation for the expired request is unknown.
    let outcome = env
        .coordinator
        .handle_confirmation(&ArchivalConfirmation::completed(&stale_event, "s3://lake"))
        .await
        .unwrap();
    assert_eq!(outcome.label(), "unknown");
    assert_eq!(env.catalog.chunk_names("metrics"), vec!["chunk_1".to_string()]);
}

#[tokio::test]
async fn failing_table_does_not_block_others() {
    let env = TestEnv::new();
    let now = Utc::now();
    env.catalog.set_policy("broken", RetentionPolicy::new(true, 30));
    env.catalog.set_policy("invalid", RetentionPolicy::new(true, 0));
    env.catalog.set_policy("metrics", RetentionPolicy::new(true, 30));
    env.catalog.fail_listing_of("broken");
    env.catalog.add_chunk("invalid", chunk_ending("invalid_chunk", now, 40));
    env.catalog.add_chunk("metrics", chunk_ending("chunk_1", now, 40));

    let report = env.coordinator.run_cycle_at(now).await.unwrap();

    assert_eq!(report.tables_scanned, 2);
    assert_eq!(report.tables_failed, 1);
    assert_eq!(report.requests_published, 1);
    assert_eq!(env.bus.requests()[0].table_name, "metrics");
}
