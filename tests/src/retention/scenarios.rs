/*
 * SPDX-FileCopyrightText: 2024 A3Mailer Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Identification, publication and confirmation of a single table and of
//! several tables in the same cycle

use super::{chunk_ending, TestEnv};
use chrono::Utc;
use hypertable_retention::{
    event::ARCHIVAL_REQUESTED, ArchivalConfirmation, ChunkIdentifier, ConfirmationOutcome,
    PendingStore, RetentionPolicy,
};

#[tokio::test]
async fn expired_chunk_is_requested_once() {
    let env = TestEnv::new();
    let now = Utc::now();
    let policy = RetentionPolicy::new(true, 30);
    env.catalog.set_policy("metrics", policy);
    env.catalog.add_chunk("metrics", chunk_ending("chunk_1", now, 40));
    env.catalog.add_chunk("metrics", chunk_ending("chunk_recent", now, 2));

    let eligible = ChunkIdentifier::new(env.catalog.clone())
        .eligible_chunks("metrics", &policy, now)
        .await
        .unwrap();
    assert_eq!(eligible.len(), 1);
    assert_eq!(eligible[0].chunk_name, "chunk_1");

    let report = env.coordinator.run_cycle_at(now).await.unwrap();
    assert_eq!(report.requests_published, 1);
    assert_eq!(report.chunks_requested, 1);

    let published = env.bus.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].topic, "archival.events");
    assert_eq!(published[0].event_type, ARCHIVAL_REQUESTED);

    let requests = env.bus.requests();
    assert_eq!(requests[0].table_name, "metrics");
    assert_eq!(requests[0].chunks, eligible);
    assert_eq!(env.store.len().await.unwrap(), 1);
    assert!(env.store.get(&requests[0].event_id).await.unwrap().is_some());
}

#[tokio::test]
async fn completed_confirmation_drops_chunk() {
    let env = TestEnv::new();
    let now = Utc::now();
    env.catalog.set_policy("metrics", RetentionPolicy::new(true, 30));
    env.catalog.add_chunk("metrics", chunk_ending("chunk_1", now, 40));
    env.coordinator.run_cycle_at(now).await.unwrap();
    let event_id = env.bus.requests()[0].event_id.clone();

    let outcome = env
        .coordinator
        .handle_confirmation(&ArchivalConfirmation::completed(
            &event_id,
            "s3://lakehouse/metrics/2024",
        ))
        .await
        .unwrap();

    assert_eq!(outcome.label(), "dropped");
    assert_eq!(env.catalog.drop_calls(), 1);
    assert_eq!(env.catalog.dropped_names("metrics"), vec!["chunk_1".to_string()]);
    assert_eq!(env.store.len().await.unwrap(), 0);
}

#[tokio::test]
async fn failed_confirmation_keeps_chunk_for_next_cycle() {
    let env = TestEnv::new();
    let now = Utc::now();
    env.catalog.set_policy("metrics", RetentionPolicy::new(true, 30));
    env.catalog.add_chunk("metrics", chunk_ending("chunk_1", now, 40));
    env.coordinator.run_cycle_at(now).await.unwrap();
    let event_id = env.bus.requests()[0].event_id.clone();

    let outcome = env
        .coordinator
        .handle_confirmation(&ArchivalConfirmation::failed(&event_id, "upload timed out"))
        .await
        .unwrap();

    assert!(matches!(outcome, ConfirmationOutcome::Retained { .. }));
    assert_eq!(env.catalog.drop_calls(), 0);
    assert_eq!(env.store.len().await.unwrap(), 0);

    let report = env.coordinator.run_cycle_at(Utc::now()).await.unwrap();
    assert_eq!(report.requests_published, 1);
    let requests = env.bus.requests();
    assert_eq!(requests.len(), 2);
    assert_ne!(requests[0].event_id, requests[1].event_id);
    assert_eq!(requests[1].chunks[0].chunk_name, "chunk_1");
}

#[tokio::test]
async fn tables_are_confirmed_independently() {
    let env = TestEnv::new();
    let now = Utc::now();
    env.catalog.set_policy("cpu", RetentionPolicy::new(true, 30));
    env.catalog.set_policy("memory", RetentionPolicy::new(true, 14));
    env.catalog.add_chunk("cpu", chunk_ending("cpu_chunk", now, 40));
    env.catalog.add_chunk("memory", chunk_ending("memory_chunk", now, 20));

    let report = env.coordinator.run_cycle_at(now).await.unwrap();
    assert_eq!(report.requests_published, 2);
    assert_eq!(env.store.len().await.unwrap(), 2);

    let requests = env.bus.requests();
    let event_for = |table: &str| {
        requests
            .iter()
            .find(|r| r.table_name == table)
            .map(|r| r.event_id.clone())
            .unwrap()
    };
    let cpu_event = event_for("cpu");
    let memory_event = event_for("memory");
    assert_ne!(cpu_event, memory_event);

    // Confirm in the reverse order of publication.
    env.coordinator
        .handle_confirmation(&ArchivalConfirmation::failed(&memory_event, "quota"))
        .await
        .unwrap();
    assert_eq!(env.store.len().await.unwrap(), 1);

    env.coordinator
        .handle_confirmation(&ArchivalConfirmation::completed(&cpu_event, "s3://lake/cpu"))
        .await
        .unwrap();

    assert_eq!(env.catalog.dropped_names("cpu"), vec!["cpu_chunk".to_string()]);
    assert!(env.catalog.dropped_names("memory").is_empty());
    assert_eq!(env.catalog.chunk_names("memory"), vec!["memory_chunk".to_string()]);
    assert_eq!(env.store.len().await.unwrap(), 0);
}

#[tokio::test]
async fn chunks_are_dropped_in_request_order() {
    let env = TestEnv::new();
    let now = Utc::now();
    env.catalog.set_policy("metrics", RetentionPolicy::new(true, 30));
    env.catalog.add_chunk("metrics", chunk_ending("chunk_c", now, 35));
    env.catalog.add_chunk("metrics", chunk_ending("chunk_a", now, 49));
    env.catalog.add_chunk("metrics", chunk_ending("chunk_b", now, 42));

    env.coordinator.run_cycle_at(now).await.unwrap();
    let request = env.bus.requests().remove(0);
    let requested: Vec<_> = request.chunks.iter().map(|c| c.chunk_name.clone()).collect();
    assert_eq!(requested, vec!["chunk_a", "chunk_b", "chunk_c"]);

    env.coordinator
        .handle_confirmation(&ArchivalConfirmation::completed(&request.event_id, "s3://lake"))
        .await
        .unwrap();
    assert_eq!(env.catalog.dropped_names("metrics"), requested);
}
