/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Error types for retention and archival operations

use thiserror::Error;

/// Result type for retention operations
pub type Result<T> = std::result::Result<T, RetentionError>;

/// Errors raised by the retention coordinator
#[derive(Error, Debug)]
pub enum RetentionError {
    /// Query or statement failed against the storage engine
    #[error("Database error: {0}")]
    Database(#[from] tokio_postgres::Error),

    /// No connection could be checked out of the pool
    #[error("Connection pool error: {0}")]
    Pool(String),

    /// Message bus publish or subscribe failed
    #[error("Message bus error: {0}")]
    MessageBus(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Retention configuration for a table cannot be honoured
    #[error("Invalid retention policy for {table}: {reason}")]
    InvalidPolicy { table: String, reason: String },

    /// Archival request violates its construction invariants
    #[error("Invalid archival request: {0}")]
    InvalidRequest(String),

    /// A chunk drop failed; the enclosing transaction was rolled back
    #[error("Dropping chunk {chunk} for event {event_id} failed: {reason}")]
    DropFailed {
        event_id: String,
        chunk: String,
        reason: String,
    },
}

impl RetentionError {
    /// Check if the operation may succeed on a later cycle
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RetentionError::Database(_)
                | RetentionError::Pool(_)
                | RetentionError::MessageBus(_)
                | RetentionError::Io(_)
                | RetentionError::DropFailed { .. }
        )
    }

    /// Get error category for metrics
    pub fn category(&self) -> &'static str {
        match self {
            RetentionError::Database(_) => "database",
            RetentionError::Pool(_) => "pool",
            RetentionError::MessageBus(_) => "message_bus",
            RetentionError::Serialization(_) => "serialization",
            RetentionError::Config(_) => "config",
            RetentionError::Io(_) => "io",
            RetentionError::InvalidPolicy { .. } => "invalid_policy",
            RetentionError::InvalidRequest(_) => "invalid_request",
            RetentionError::DropFailed { .. } => "drop_failed",
        }
    }
}

impl From<deadpool_postgres::PoolError> for RetentionError {
    fn from(err: deadpool_postgres::PoolError) -> Self {
        RetentionError::Pool(err.to_string())
    }
}

impl From<deadpool_postgres::CreatePoolError> for RetentionError {
    fn from(err: deadpool_postgres::CreatePoolError) -> Self {
        RetentionError::Config(format!("cannot create connection pool: {}", err))
    }
}
