/// Append-only relational persistence for completed bars.
///
/// Backed by `sqlx::SqlitePool` per the schema in spec: `bars(symbol,
/// minute_start, open, high, low, close, volume, tick_count)` keyed on
/// `(symbol, minute_start)`, inserts replace on conflict. Decimal prices are
/// stored as TEXT and round-tripped through `Decimal::from_str` — sqlx's
/// SQLite driver has no native decimal binding, and storing as REAL would
/// reintroduce the float-price bug the rest of the core avoids.
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tracing::{debug, info};

use crate::error::{Result, TradingError};
use crate::types::Bar;

pub struct BarStore {
    pool: SqlitePool,
}

impl BarStore {
    pub async fn connect(path: &str) -> Result<Self> {
        let url = if path == ":memory:" {
            "sqlite::memory:".to_string()
        } else {
            if let Some(parent) = std::path::Path::new(path).parent() {
                if !parent.as_os_str().is_empty() {
                    tokio::fs::create_dir_all(parent).await.ok();
                }
            }
            format!("sqlite://{}", path)
        };
        let options = SqliteConnectOptions::from_str(&url)
            .map_err(|e| TradingError::PersistenceFailure(e.to_string()))?
            .create_if_missing(true);
        // A pooled in-memory database is a distinct database per connection;
        // cap it at one so tests see a single consistent instance.
        let max_connections = if path == ":memory:" { 1 } else { 4 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .map_err(TradingError::DatabaseError)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS bars (
                symbol TEXT NOT NULL,
                minute_start TEXT NOT NULL,
                open TEXT NOT NULL,
                high TEXT NOT NULL,
                low TEXT NOT NULL,
                close TEXT NOT NULL,
                volume INTEGER NOT NULL,
                tick_count INTEGER NOT NULL,
                PRIMARY KEY (symbol, minute_start)
            )
            "#,
        )
        .execute(&pool)
        .await
        .map_err(TradingError::DatabaseError)?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_bars_symbol_minute ON bars(symbol, minute_start DESC)",
        )
        .execute(&pool)
        .await
        .map_err(TradingError::DatabaseError)?;

        info!(%path, "bar store initialized");
        Ok(BarStore { pool })
    }

    /// Insert a completed bar, replacing any existing row for the same
    /// `(symbol, minute_start)`.
    pub async fn append(&self, bar: &Bar) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO bars
                (symbol, minute_start, open, high, low, close, volume, tick_count)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&bar.symbol)
        .bind(bar.minute_start.to_rfc3339())
        .bind(bar.open.to_string())
        .bind(bar.high.to_string())
        .bind(bar.low.to_string())
        .bind(bar.close.to_string())
        .bind(bar.volume)
        .bind(bar.tick_count as i64)
        .execute(&self.pool)
        .await
        .map_err(TradingError::DatabaseError)?;

        debug!(symbol = %bar.symbol, minute_start = %bar.minute_start, "bar persisted");
        Ok(())
    }

    /// Bars for `symbol` with `minute_start` in `[from, to]`, ascending.
    pub async fn range(&self, symbol: &str, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<Bar>> {
        let rows = sqlx::query(
            r#"
            SELECT symbol, minute_start, open, high, low, close, volume, tick_count
            FROM bars
            WHERE symbol = ? AND minute_start >= ? AND minute_start <= ?
            ORDER BY minute_start ASC
            "#,
        )
        .bind(symbol)
        .bind(from.to_rfc3339())
        .bind(to.to_rfc3339())
        .fetch_all(&self.pool)
        .await
        .map_err(TradingError::DatabaseError)?;

        rows.iter().map(row_to_bar).collect()
    }

    /// Most recent `n` bars for `symbol`, ascending.
    pub async fn recent(&self, symbol: &str, n: i64) -> Result<Vec<Bar>> {
        let rows = sqlx::query(
            r#"
            SELECT symbol, minute_start, open, high, low, close, volume, tick_count
            FROM bars
            WHERE symbol = ?
            ORDER BY minute_start DESC
            LIMIT ?
            "#,
        )
        .bind(symbol)
        .bind(n)
        .fetch_all(&self.pool)
        .await
        .map_err(TradingError::DatabaseError)?;

        let mut bars: Vec<Bar> = rows.iter().map(row_to_bar).collect::<Result<_>>()?;
        bars.reverse();
        Ok(bars)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn row_to_bar(row: &sqlx::sqlite::SqliteRow) -> Result<Bar> {
    let minute_start: String = row.get("minute_start");
    let open: String = row.get("open");
    let high: String = row.get("high");
    let low: String = row.get("low");
    let close: String = row.get("close");
    let parse_dec = |s: &str| -> Result<Decimal> {
        Decimal::from_str(s).map_err(|e| TradingError::PersistenceFailure(e.to_string()))
    };
    Ok(Bar {
        symbol: row.get("symbol"),
        minute_start: DateTime::parse_from_rfc3339(&minute_start)
            .map_err(|e| TradingError::PersistenceFailure(e.to_string()))?
            .with_timezone(&Utc),
        open: parse_dec(&open)?,
        high: parse_dec(&high)?,
        low: parse_dec(&low)?,
        close: parse_dec(&close)?,
        volume: row.get::<i64, _>("volume"),
        tick_count: row.get::<i64, _>("tick_count") as u32,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn bar(minute_start: DateTime<Utc>) -> Bar {
        Bar {
            symbol: "NQ".to_string(),
            minute_start,
            open: dec!(100),
            high: dec!(105),
            low: dec!(99),
            close: dec!(102),
            volume: 10,
            tick_count: 3,
        }
    }

    #[tokio::test]
    async fn test_append_and_range_round_trip() {
        let store = BarStore::connect(":memory:").await.unwrap();
        let t0 = Utc.with_ymd_and_hms(2026, 3, 2, 9, 15, 0).unwrap();
        let t1 = Utc.with_ymd_and_hms(2026, 3, 2, 9, 16, 0).unwrap();
        store.append(&bar(t0)).await.unwrap();
        store.append(&bar(t1)).await.unwrap();

        let bars = store.range("NQ", t0, t1).await.unwrap();
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0].minute_start, t0);
        assert_eq!(bars[1].minute_start, t1);
    }

    #[tokio::test]
    async fn test_insert_replaces_on_conflict() {
        let store = BarStore::connect(":memory:").await.unwrap();
        let t0 = Utc.with_ymd_and_hms(2026, 3, 2, 9, 15, 0).unwrap();
        store.append(&bar(t0)).await.unwrap();

        let mut updated = bar(t0);
        updated.close = dec!(999);
        store.append(&updated).await.unwrap();

        let bars = store.recent("NQ", 10).await.unwrap();
        assert_eq!(bars.len(), 1);
        assert_eq!(bars[0].close, dec!(999));
    }

    #[tokio::test]
    async fn test_recent_returns_ascending_order() {
        let store = BarStore::connect(":memory:").await.unwrap();
        for i in 0..5 {
            let t = Utc.with_ymd_and_hms(2026, 3, 2, 9, 15 + i, 0).unwrap();
            store.append(&bar(t)).await.unwrap();
        }
        let bars = store.recent("NQ", 3).await.unwrap();
        assert_eq!(bars.len(), 3);
        assert!(bars[0].minute_start < bars[1].minute_start);
        assert!(bars[1].minute_start < bars[2].minute_start);
    }
}
