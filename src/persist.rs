//! Persistence
//!
//! Best-effort SQLite snapshots of positions, the realized-PnL ledger, and
//! closed-order history, keyed by (venue, pair, timestamp). The engine never
//! reads this at runtime; reads happen only on explicit restore.

use crate::engine::orders::Order;
use crate::engine::positions::Position;
use crate::types::{TimestampMs, TradingPair};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use rust_decimal::Decimal;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use tracing::debug;

const SCHEMA_VERSION: u32 = 1;

/// Errors from the data store.
#[derive(Debug)]
pub enum DataStoreError {
    Sqlite(rusqlite::Error),
    Corrupt(String),
}

impl std::fmt::Display for DataStoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sqlite(e) => write!(f, "sqlite error: {}", e),
            Self::Corrupt(m) => write!(f, "corrupt record: {}", m),
        }
    }
}

impl std::error::Error for DataStoreError {}

impl From<rusqlite::Error> for DataStoreError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Sqlite(e)
    }
}

/// A restored position snapshot row.
#[derive(Debug, Clone, PartialEq)]
pub struct RestoredPosition {
    pub pair: TradingPair,
    pub size: Decimal,
    pub entry_price: Decimal,
    pub realized_pnl: Decimal,
    pub cumulative_fees: Decimal,
    pub ts: TimestampMs,
}

/// SQLite-backed snapshot store.
pub struct DataStore {
    conn: Arc<Mutex<Connection>>,
}

impl DataStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DataStoreError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.initialize_schema()?;
        Ok(store)
    }

    fn initialize_schema(&self) -> Result<(), DataStoreError> {
        let conn = self.conn.lock();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS position_snapshots (
                venue TEXT NOT NULL,
                pair TEXT NOT NULL,
                ts INTEGER NOT NULL,
                size TEXT NOT NULL,
                entry_price TEXT NOT NULL,
                realized_pnl TEXT NOT NULL,
                cumulative_fees TEXT NOT NULL,
                PRIMARY KEY (venue, pair, ts)
            );
            CREATE TABLE IF NOT EXISTS closed_orders (
                client_id TEXT PRIMARY KEY,
                venue TEXT NOT NULL,
                pair TEXT NOT NULL,
                side TEXT NOT NULL,
                state TEXT NOT NULL,
                size TEXT NOT NULL,
                filled_size TEXT NOT NULL,
                avg_fill_price TEXT NOT NULL,
                cumulative_fee TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );",
        )?;
        conn.execute(
            "INSERT OR REPLACE INTO meta (key, value) VALUES ('schema_version', ?1)",
            params![SCHEMA_VERSION.to_string()],
        )?;
        Ok(())
    }

    /// Append one snapshot row per position.
    pub fn snapshot_positions(
        &self,
        venue: &str,
        positions: &[Position],
        ts: TimestampMs,
    ) -> Result<usize, DataStoreError> {
        let conn = self.conn.lock();
        let mut written = 0;
        for position in positions {
            conn.execute(
                "INSERT OR REPLACE INTO position_snapshots
                 (venue, pair, ts, size, entry_price, realized_pnl, cumulative_fees)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    venue,
                    position.pair.to_string(),
                    ts,
                    position.size.to_string(),
                    position.entry_price.to_string(),
                    position.realized_pnl.to_string(),
                    position.cumulative_fees.to_string(),
                ],
            )?;
            written += 1;
        }
        debug!(venue, written, "position snapshot flushed");
        Ok(written)
    }

    /// Upsert terminal orders into history.
    pub fn record_closed_orders(
        &self,
        venue: &str,
        orders: &[Order],
    ) -> Result<usize, DataStoreError> {
        let conn = self.conn.lock();
        let mut written = 0;
        for order in orders {
            conn.execute(
                "INSERT OR REPLACE INTO closed_orders
                 (client_id, venue, pair, side, state, size, filled_size,
                  avg_fill_price, cumulative_fee, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    order.client_id,
                    venue,
                    order.pair.to_string(),
                    order.side.to_string(),
                    order.state.to_string(),
                    order.size.to_string(),
                    order.filled_size.to_string(),
                    order.avg_fill_price.to_string(),
                    order.cumulative_fee.to_string(),
                    order.created_at,
                    order.updated_at,
                ],
            )?;
            written += 1;
        }
        Ok(written)
    }

    /// Latest snapshot per pair for a venue. Explicit restore only.
    pub fn restore_positions(&self, venue: &str) -> Result<Vec<RestoredPosition>, DataStoreError> {
        let conn = self.conn.lock();
        let mut statement = conn.prepare(
            "SELECT pair, size, entry_price, realized_pnl, cumulative_fees, MAX(ts)
             FROM position_snapshots WHERE venue = ?1 GROUP BY pair ORDER BY pair",
        )?;
        let rows = statement.query_map(params![venue], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, i64>(5)?,
            ))
        })?;

        let mut restored = Vec::new();
        for row in rows {
            let (pair, size, entry, realized, fees, ts) = row?;
            let pair = TradingPair::from_str(&pair)
                .map_err(|e| DataStoreError::Corrupt(format!("pair {}: {}", pair, e)))?;
            let parse = |raw: &str| {
                Decimal::from_str(raw)
                    .map_err(|e| DataStoreError::Corrupt(format!("decimal {}: {}", raw, e)))
            };
            restored.push(RestoredPosition {
                pair,
                size: parse(&size)?,
                entry_price: parse(&entry)?,
                realized_pnl: parse(&realized)?,
                cumulative_fees: parse(&fees)?,
                ts,
            });
        }
        Ok(restored)
    }

    pub fn closed_order_count(&self, venue: &str) -> Result<u64, DataStoreError> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM closed_orders WHERE venue = ?1",
            params![venue],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }
}
