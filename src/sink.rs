//! Sink trait seam: the engine core depends only on `Pool`/`Connection`,
//! never on a concrete database client. `candle-ingest-timescale` is the
//! production implementation over `sqlx::PgPool`; tests use an in-memory
//! double.
//!
//! Narrowed to the operations the writer actually needs (upsert, health,
//! retention cleanup, stats, maintenance) rather than a generic
//! execute/fetch surface — the same "one trait per concern" idiom the
//! teacher uses for `Clock` and `Sleeper`.

use crate::model::CandleRecord;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DbStats {
    pub total_records: i64,
    pub unique_symbols: i64,
    pub oldest_record: Option<DateTime<Utc>>,
    pub newest_record: Option<DateTime<Utc>>,
}

/// Cumulative counters for records handled by `DatabaseWriter::insert_batch`:
/// how many ultimately wrote, how many were queued for retry behind an open
/// circuit, and how many of those were dropped once the retry queue filled.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchStats {
    pub total_processed: u64,
    pub total_retried: u64,
    pub total_dropped: u64,
}

/// Everything `DatabaseWriter::get_stats` reports: the DB-query stats, the
/// cumulative batch counters, and the current retry queue depth.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriterStats {
    pub db_stats: DbStats,
    pub batch_stats: BatchStats,
    pub retry_queue_size: usize,
}

#[derive(Debug)]
pub enum WriteError {
    Deadlock,
    UniqueViolation,
    Connectivity(String),
}

impl std::fmt::Display for WriteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Deadlock => write!(f, "deadlock detected"),
            Self::UniqueViolation => write!(f, "unique constraint violation"),
            Self::Connectivity(msg) => write!(f, "connectivity error: {msg}"),
        }
    }
}

impl std::error::Error for WriteError {}

/// A checked-out database connection. One connection is used per flush;
/// the writer never holds more than one at a time.
#[async_trait]
pub trait Connection: Send {
    /// Upsert a batch of candles in a single transaction. Merge rule:
    /// open/close last-writer-wins, high/low monotone via GREATEST/LEAST.
    async fn upsert_candles(&mut self, rows: &[CandleRecord]) -> Result<(), WriteError>;

    async fn health_check(&mut self) -> Result<(), WriteError>;

    /// Delete rows older than `retention_days`.
    async fn cleanup(&mut self, retention_days: i64) -> Result<(), WriteError>;

    async fn stats(&mut self) -> Result<DbStats, WriteError>;

    async fn vacuum_analyze(&mut self) -> Result<(), WriteError>;
}

#[async_trait]
pub trait Pool: Send + Sync {
    type Conn: Connection;

    async fn acquire(&self) -> Result<Self::Conn, WriteError>;

    fn size(&self) -> u32;

    fn max_size(&self) -> u32;
}
