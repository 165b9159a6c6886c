//! SQLite-backed trade store
//!
//! Key choices:
//! - WAL mode so aggregation reads don't block loads
//! - One connection behind a mutex; concurrent chunk loaders serialize here
//! - `BEGIN IMMEDIATE` transactions with multi-row INSERT statements,
//!   prepared once per shape and cached

use anyhow::{bail, Context, Result};
use parking_lot::{Mutex, MutexGuard};
use rusqlite::{params, params_from_iter, Connection, OpenFlags, OptionalExtension};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{BulkStore, BulkTransaction, RowSource, Value};

/// Rows bound per INSERT statement (6 columns -> 3000 parameters).
const ROWS_PER_STATEMENT: usize = 500;

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA cache_size = -64000;  -- 64MB cache
PRAGMA temp_store = MEMORY;

CREATE TABLE IF NOT EXISTS trades (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    closing_time TEXT NOT NULL,
    trade_date TEXT NOT NULL,
    ticker TEXT NOT NULL,
    price TEXT NOT NULL,
    quantity INTEGER NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_trades_ticker_date
    ON trades(ticker, trade_date);

CREATE TABLE IF NOT EXISTS daily_aggregations (
    ticker TEXT NOT NULL,
    trade_date TEXT NOT NULL,
    max_price REAL NOT NULL,
    min_price REAL NOT NULL,
    total_volume INTEGER NOT NULL,
    trade_count INTEGER NOT NULL,
    PRIMARY KEY (ticker, trade_date)
) WITHOUT ROWID;
"#;

#[derive(Debug, Clone, PartialEq)]
pub struct DailyAggregation {
    pub ticker: String,
    pub trade_date: String,
    pub max_price: f64,
    pub min_price: f64,
    pub total_volume: i64,
    pub trade_count: i64,
}

#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn new(db_path: &str) -> Result<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX; // We handle our own locking

        let conn = Connection::open_with_flags(db_path, flags)
            .with_context(|| format!("Failed to open database at {}", db_path))?;

        conn.execute_batch(SCHEMA_SQL)
            .context("Failed to initialize database schema")?;

        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap_or_default();
        if db_path != ":memory:" && journal_mode.to_lowercase() != "wal" {
            warn!("WAL mode not active, journal_mode = {}", journal_mode);
        }

        info!("📊 Trade store initialized at: {}", db_path);

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn in_memory() -> Result<Self> {
        Self::new(":memory:")
    }

    pub fn trade_count(&self) -> Result<i64> {
        let conn = self.conn.lock();
        conn.query_row("SELECT COUNT(*) FROM trades", [], |row| row.get(0))
            .context("Failed to count trades")
    }

    pub fn health_check(&self) -> Result<()> {
        let conn = self.conn.lock();
        let one: i64 = conn
            .query_row("SELECT 1", [], |row| row.get(0))
            .context("Health query failed")?;
        if one != 1 {
            bail!("Unexpected health query result {}", one);
        }
        Ok(())
    }

    /// Rebuilds per-ticker, per-day aggregates from the trades table.
    pub fn refresh_daily_aggregations(&self) -> Result<usize> {
        let conn = self.conn.lock();
        conn.execute_batch("BEGIN IMMEDIATE")?;

        let result = (|| -> Result<usize> {
            conn.execute("DELETE FROM daily_aggregations", [])?;
            let rows = conn.execute(
                "INSERT INTO daily_aggregations
                 (ticker, trade_date, max_price, min_price, total_volume, trade_count)
                 SELECT ticker, trade_date,
                        MAX(CAST(price AS REAL)), MIN(CAST(price AS REAL)),
                        SUM(quantity), COUNT(*)
                 FROM trades
                 GROUP BY ticker, trade_date",
                [],
            )?;
            Ok(rows)
        })();

        match result {
            Ok(rows) => {
                conn.execute_batch("COMMIT")?;
                debug!("🔄 Refreshed {} daily aggregations", rows);
                Ok(rows)
            }
            Err(e) => {
                let _ = conn.execute_batch("ROLLBACK");
                Err(e.context("Failed to refresh daily aggregations"))
            }
        }
    }

    pub fn daily_aggregation(&self, ticker: &str, trade_date: &str) -> Result<Option<DailyAggregation>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT ticker, trade_date, max_price, min_price, total_volume, trade_count
             FROM daily_aggregations WHERE ticker = ?1 AND trade_date = ?2",
            params![ticker, trade_date],
            |row| {
                Ok(DailyAggregation {
                    ticker: row.get(0)?,
                    trade_date: row.get(1)?,
                    max_price: row.get(2)?,
                    min_price: row.get(3)?,
                    total_volume: row.get(4)?,
                    trade_count: row.get(5)?,
                })
            },
        )
        .optional()
        .context("Failed to read daily aggregation")
    }
}

impl BulkStore for SqliteStore {
    fn begin(&self) -> Result<Box<dyn BulkTransaction + '_>> {
        let conn = self.conn.lock();
        conn.execute_batch("BEGIN IMMEDIATE")
            .context("Failed to begin transaction")?;
        Ok(Box::new(SqliteTransaction { conn, open: true }))
    }
}

pub struct SqliteTransaction<'a> {
    conn: MutexGuard<'a, Connection>,
    open: bool,
}

impl BulkTransaction for SqliteTransaction<'_> {
    fn copy_in(&mut self, table: &str, columns: &[&str], rows: RowSource<'_>) -> Result<u64> {
        if columns.is_empty() {
            bail!("copy_in into {} requires at least one column", table);
        }

        let full_sql = insert_sql(table, columns, ROWS_PER_STATEMENT);
        let mut buffer: Vec<Value> = Vec::with_capacity(columns.len() * ROWS_PER_STATEMENT);
        let mut buffered = 0usize;
        let mut inserted = 0u64;

        for row in rows {
            if row.len() != columns.len() {
                bail!(
                    "row has {} values but {} columns were declared for {}",
                    row.len(),
                    columns.len(),
                    table
                );
            }
            buffer.extend(row);
            buffered += 1;

            if buffered == ROWS_PER_STATEMENT {
                let mut stmt = self.conn.prepare_cached(&full_sql)?;
                inserted += stmt.execute(params_from_iter(buffer.drain(..)))? as u64;
                buffered = 0;
            }
        }

        if buffered > 0 {
            let sql = insert_sql(table, columns, buffered);
            let mut stmt = self.conn.prepare(&sql)?;
            inserted += stmt.execute(params_from_iter(buffer.drain(..)))? as u64;
        }

        Ok(inserted)
    }

    fn commit(mut self: Box<Self>) -> Result<()> {
        self.conn
            .execute_batch("COMMIT")
            .context("Failed to commit transaction")?;
        self.open = false;
        Ok(())
    }

    fn rollback(mut self: Box<Self>) -> Result<()> {
        self.open = false;
        self.conn
            .execute_batch("ROLLBACK")
            .context("Failed to roll back transaction")
    }
}

impl Drop for SqliteTransaction<'_> {
    fn drop(&mut self) {
        if self.open {
            if let Err(e) = self.conn.execute_batch("ROLLBACK") {
                warn!(error = %e, "Rollback of abandoned transaction failed");
            }
        }
    }
}

fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn insert_sql(table: &str, columns: &[&str], rows: usize) -> String {
    let cols = columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");
    let placeholders = format!("({})", vec!["?"; columns.len()].join(", "));
    let values = vec![placeholders.as_str(); rows].join(", ");
    format!("INSERT INTO {} ({}) VALUES {}", quote_ident(table), cols, values)
}

#[cfg(test)]
mod tests {
    use super::*;

    const COLUMNS: [&str; 6] = [
        "closing_time",
        "trade_date",
        "ticker",
        "price",
        "quantity",
        "created_at",
    ];

    fn row(ticker: &str, price: &str, qty: i64) -> Vec<Value> {
        vec![
            Value::Text("2024-01-15 15:30:00.000".to_string()),
            Value::Text("2024-01-15".to_string()),
            Value::Text(ticker.to_string()),
            Value::Text(price.to_string()),
            Value::Integer(qty),
            Value::Text("2024-01-16T00:00:00Z".to_string()),
        ]
    }

    #[test]
    fn test_insert_sql_shape() {
        let sql = insert_sql("trades", &["a", "b"], 2);
        assert_eq!(sql, "INSERT INTO \"trades\" (\"a\", \"b\") VALUES (?, ?), (?, ?)");
    }

    #[test]
    fn test_copy_in_commit_persists_rows() {
        let store = SqliteStore::in_memory().expect("Failed to create database");
        let mut rows = (0..1_234).map(|i| row("PETR4", "20.50", i));

        let mut tx = store.begin().expect("begin");
        let n = tx.copy_in("trades", &COLUMNS, &mut rows).expect("copy_in");
        tx.commit().expect("commit");

        assert_eq!(n, 1_234);
        assert_eq!(store.trade_count().unwrap(), 1_234);
    }

    #[test]
    fn test_dropped_transaction_rolls_back() {
        let store = SqliteStore::in_memory().expect("Failed to create database");
        {
            let mut tx = store.begin().expect("begin");
            let mut rows = (0..10).map(|i| row("VALE3", "60,1", i));
            tx.copy_in("trades", &COLUMNS, &mut rows).expect("copy_in");
        }
        assert_eq!(store.trade_count().unwrap(), 0);

        // The connection is usable again after the implicit rollback
        let tx = store.begin().expect("begin after rollback");
        tx.rollback().expect("rollback");
    }

    #[test]
    fn test_row_width_mismatch_is_error() {
        let store = SqliteStore::in_memory().expect("Failed to create database");
        let mut tx = store.begin().expect("begin");
        let mut rows = std::iter::once(vec![Value::Integer(1)]);
        assert!(tx.copy_in("trades", &COLUMNS, &mut rows).is_err());
        tx.rollback().expect("rollback");
        assert_eq!(store.trade_count().unwrap(), 0);
    }

    #[test]
    fn test_refresh_daily_aggregations() {
        let store = SqliteStore::in_memory().expect("Failed to create database");
        let mut tx = store.begin().expect("begin");
        let mut rows = vec![
            row("PETR4", "20.50", 100),
            row("PETR4", "21.75", 300),
            row("VALE3", "60.10", 10),
        ]
        .into_iter();
        tx.copy_in("trades", &COLUMNS, &mut rows).expect("copy_in");
        tx.commit().expect("commit");

        assert_eq!(store.refresh_daily_aggregations().unwrap(), 2);
        let agg = store
            .daily_aggregation("PETR4", "2024-01-15")
            .unwrap()
            .expect("aggregation present");
        assert_eq!(agg.max_price, 21.75);
        assert_eq!(agg.min_price, 20.5);
        assert_eq!(agg.total_volume, 400);
        assert_eq!(agg.trade_count, 2);
    }

    #[test]
    fn test_health_check() {
        let store = SqliteStore::in_memory().expect("Failed to create database");
        store.health_check().expect("healthy");
    }
}
