//! # Counter
//!
//! Durable per-option vote counts, kept in PostgreSQL and only ever changed through the
//! `increment_vote` stored function.
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use thiserror::Error;
use tracing::info;

use crate::vote::VoteOption;

/// Enumeration of errors for operations with the counter store.
/// Errors originate from sqlx and are wrapped by us to provide additional context.
#[derive(Error, Debug)]
pub enum CounterError {
    #[error("connection failed with: {error}")]
    ConnectionError { error: sqlx::Error },
    #[error("{command} query failed with: {error}")]
    QueryError {
        command: &'static str,
        error: sqlx::Error,
    },
    #[error("increment_vote returned no row for {0}")]
    NoResult(VoteOption),
    #[error("counter store returned unknown option {0}")]
    UnknownOption(String),
    #[error("counter store is unavailable: {0}")]
    Unavailable(String),
}

/// The count of one option right after it was incremented.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VoteCount {
    pub option: VoteOption,
    pub count: i64,
}

/// The current state of one option's counter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoteTally {
    pub option: VoteOption,
    pub count: i64,
    pub updated_at: DateTime<Utc>,
}

/// The counter store operations the vote pipeline relies on.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically add one vote for `option`, returning the new count.
    /// Safe to call concurrently from any number of processes.
    async fn increment(&self, option: VoteOption) -> Result<VoteCount, CounterError>;

    /// Current counts for every option, ordered by option.
    async fn counts(&self) -> Result<Vec<VoteTally>, CounterError>;

    /// Release the store. No further calls can be made.
    async fn close(self);
}

/// Settings for the PostgreSQL connection pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub min_connections: u32,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
    pub statement_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_connections: 2,
            max_connections: 10,
            acquire_timeout: Duration::from_secs(5),
            statement_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(sqlx::FromRow)]
struct IncrementRow {
    option: String,
    new_count: i64,
}

#[derive(sqlx::FromRow)]
struct TallyRow {
    option: String,
    count: i64,
    updated_at: DateTime<Utc>,
}

/// A `CounterStore` on top of a PostgreSQL connection pool.
#[derive(Clone)]
pub struct PgCounterStore {
    pool: PgPool,
}

impl PgCounterStore {
    /// Open a connection pool and check it can serve a query.
    pub async fn connect(url: &str, config: &PoolConfig) -> Result<Self, CounterError> {
        let options = url
            .parse::<PgConnectOptions>()
            .map_err(|error| CounterError::ConnectionError { error })?
            .options([(
                "statement_timeout",
                config.statement_timeout.as_millis().to_string(),
            )]);

        let pool = PgPoolOptions::new()
            .min_connections(config.min_connections)
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect_with(options)
            .await
            .map_err(|error| CounterError::ConnectionError { error })?;

        sqlx::query("SELECT 1")
            .execute(&pool)
            .await
            .map_err(|error| CounterError::ConnectionError { error })?;

        info!(
            max_connections = config.max_connections,
            "postgres counter store pool created"
        );

        Ok(Self { pool })
    }

    /// Wrap an existing pool, for example one provided by `sqlx::test`.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CounterStore for PgCounterStore {
    async fn increment(&self, option: VoteOption) -> Result<VoteCount, CounterError> {
        let row: Option<IncrementRow> =
            sqlx::query_as("SELECT option, new_count FROM increment_vote($1)")
                .bind(option.as_str())
                .fetch_optional(&self.pool)
                .await
                .map_err(|error| CounterError::QueryError {
                    command: "increment_vote",
                    error,
                })?;

        let row = row.ok_or(CounterError::NoResult(option))?;
        let option = row
            .option
            .parse::<VoteOption>()
            .map_err(|_| CounterError::UnknownOption(row.option.clone()))?;

        Ok(VoteCount {
            option,
            count: row.new_count,
        })
    }

    async fn counts(&self) -> Result<Vec<VoteTally>, CounterError> {
        let rows: Vec<TallyRow> =
            sqlx::query_as("SELECT option, count, updated_at FROM votes ORDER BY option")
                .fetch_all(&self.pool)
                .await
                .map_err(|error| CounterError::QueryError {
                    command: "SELECT",
                    error,
                })?;

        rows.into_iter()
            .map(|row| {
                let option = row
                    .option
                    .parse::<VoteOption>()
                    .map_err(|_| CounterError::UnknownOption(row.option.clone()))?;
                Ok(VoteTally {
                    option,
                    count: row.count,
                    updated_at: row.updated_at,
                })
            })
            .collect()
    }

    async fn close(self) {
        info!("closing postgres counter store pool");
        self.pool.close().await;
        info!("postgres counter store pool closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[sqlx::test(migrations = "../migrations")]
    #[ignore = "requires a running postgres"]
    async fn test_increment_returns_new_count(db: PgPool) {
        let store = PgCounterStore::from_pool(db);

        let first = store
            .increment(VoteOption::Cats)
            .await
            .expect("failed to increment");
        assert_eq!(
            first,
            VoteCount {
                option: VoteOption::Cats,
                count: 1
            }
        );

        let second = store.increment(VoteOption::Cats).await.unwrap();
        assert_eq!(second.count, 2);

        let counts: Vec<(VoteOption, i64)> = store
            .counts()
            .await
            .unwrap()
            .into_iter()
            .map(|tally| (tally.option, tally.count))
            .collect();
        assert_eq!(counts, vec![(VoteOption::Cats, 2), (VoteOption::Dogs, 0)]);
    }

    #[sqlx::test(migrations = "../migrations")]
    #[ignore = "requires a running postgres"]
    async fn test_concurrent_increments_are_not_lost(db: PgPool) {
        let store = PgCounterStore::from_pool(db);

        let increments: Vec<_> = (0..50)
            .map(|i| {
                let store = store.clone();
                let option = if i % 2 == 0 {
                    VoteOption::Cats
                } else {
                    VoteOption::Dogs
                };
                tokio::spawn(async move { store.increment(option).await })
            })
            .collect();

        for handle in increments {
            handle.await.unwrap().expect("increment failed");
        }

        let counts: Vec<i64> = store
            .counts()
            .await
            .unwrap()
            .iter()
            .map(|tally| tally.count)
            .collect();
        assert_eq!(counts, vec![25, 25]);
    }

    #[sqlx::test(migrations = "../migrations")]
    #[ignore = "requires a running postgres"]
    async fn test_closed_store_fails(db: PgPool) {
        let store = PgCounterStore::from_pool(db);
        let handle = store.clone();

        store.close().await;

        let result = handle.increment(VoteOption::Dogs).await;
        assert!(matches!(result, Err(CounterError::QueryError { .. })));
    }
}
