//! `Pool`/`Connection` sink adapter over `sqlx::PgPool`, owning the upsert
//! SQL and schema assumptions for the `candles` hypertable.

use async_trait::async_trait;
use candle_ingest::{CandleRecord, Connection, DbStats, Pool as IngestPool, WriteError};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};

const UPSERT_CANDLES: &str = r#"
    INSERT INTO candles (
        time, symbol, open, high,
        low, close, volume
    ) VALUES ($1, $2, $3, $4, $5, $6, $7)
    ON CONFLICT (time, symbol) DO UPDATE SET
        open = EXCLUDED.open,
        high = GREATEST(candles.high, EXCLUDED.high),
        low = LEAST(candles.low, EXCLUDED.low),
        close = EXCLUDED.close,
        volume = EXCLUDED.volume
"#;

const CLEANUP_OLD_RECORDS: &str = "DELETE FROM candles WHERE time < NOW() - ($1 || ' days')::interval";

const STATS_QUERY: &str = r#"
    SELECT
        COUNT(*) AS total_records,
        COUNT(DISTINCT symbol) AS unique_symbols,
        MIN(time) AS oldest_record,
        MAX(time) AS newest_record
    FROM candles
"#;

#[derive(Clone)]
pub struct TimescalePool {
    pool: PgPool,
}

impl TimescalePool {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, WriteError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| WriteError::Connectivity(e.to_string()))?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl IngestPool for TimescalePool {
    type Conn = TimescaleConnection;

    async fn acquire(&self) -> Result<Self::Conn, WriteError> {
        let conn = self.pool.acquire().await.map_err(|e| WriteError::Connectivity(e.to_string()))?;
        Ok(TimescaleConnection { conn })
    }

    fn size(&self) -> u32 {
        self.pool.size()
    }

    fn max_size(&self) -> u32 {
        self.pool.options().get_max_connections()
    }
}

pub struct TimescaleConnection {
    conn: sqlx::pool::PoolConnection<sqlx::Postgres>,
}

#[async_trait]
impl Connection for TimescaleConnection {
    async fn upsert_candles(&mut self, rows: &[CandleRecord]) -> Result<(), WriteError> {
        let mut tx = self.conn.begin().await.map_err(classify_error)?;
        for row in rows {
            sqlx::query(UPSERT_CANDLES)
                .bind(row.start_time)
                .bind(&row.symbol)
                .bind(row.open_price)
                .bind(row.high_price)
                .bind(row.low_price)
                .bind(row.close_price)
                .bind(row.volume)
                .execute(&mut *tx)
                .await
                .map_err(classify_error)?;
        }
        tx.commit().await.map_err(classify_error)
    }

    async fn health_check(&mut self) -> Result<(), WriteError> {
        sqlx::query("SELECT 1").execute(&mut *self.conn).await.map_err(classify_error)?;
        Ok(())
    }

    async fn cleanup(&mut self, retention_days: i64) -> Result<(), WriteError> {
        sqlx::query(CLEANUP_OLD_RECORDS)
            .bind(retention_days.to_string())
            .execute(&mut *self.conn)
            .await
            .map_err(classify_error)?;
        Ok(())
    }

    async fn stats(&mut self) -> Result<DbStats, WriteError> {
        let row = sqlx::query(STATS_QUERY).fetch_one(&mut *self.conn).await.map_err(classify_error)?;
        Ok(DbStats {
            total_records: row.try_get("total_records").unwrap_or(0),
            unique_symbols: row.try_get("unique_symbols").unwrap_or(0),
            oldest_record: row.try_get("oldest_record").ok(),
            newest_record: row.try_get("newest_record").ok(),
        })
    }

    async fn vacuum_analyze(&mut self) -> Result<(), WriteError> {
        sqlx::query("VACUUM ANALYZE candles").execute(&mut *self.conn).await.map_err(classify_error)?;
        tracing::info!("vacuum_analyze_completed");
        Ok(())
    }
}

/// Maps Postgres error codes to the writer's narrow `WriteError` taxonomy:
/// `40P01` deadlock, `23505` unique violation, everything else a
/// connectivity/query failure.
fn classify_error(e: sqlx::Error) -> WriteError {
    if let sqlx::Error::Database(db_err) = &e {
        match db_err.code().as_deref() {
            Some("40P01") => return WriteError::Deadlock,
            Some("23505") => return WriteError::UniqueViolation,
            _ => {}
        }
    }
    WriteError::Connectivity(e.to_string())
}
