//! SQLite-backed store. One file is the single source of truth for
//! knowledge, journal, snapshots, and runtime state; in-memory copies held
//! by the owning tasks are caches over it.

use crate::models::{TradingError, TradingResult};
use parking_lot::Mutex;
use rusqlite::Connection;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

/// Declared schema version. Bump together with a new migration entry;
/// an on-disk version ahead of the binary refuses startup (exit code 2).
pub const SCHEMA_VERSION: i64 = 1;

/// Forward-only migrations, applied in order above the stored version.
const MIGRATIONS: &[(i64, &str)] = &[(1, SCHEMA_V1)];

const SCHEMA_V1: &str = r#"
CREATE TABLE IF NOT EXISTS coin_scores (
    symbol TEXT PRIMARY KEY,
    trades INTEGER NOT NULL DEFAULT 0,
    wins INTEGER NOT NULL DEFAULT 0,
    losses INTEGER NOT NULL DEFAULT 0,
    total_pnl REAL NOT NULL DEFAULT 0,
    avg_pnl REAL NOT NULL DEFAULT 0,
    win_rate REAL NOT NULL DEFAULT 0,
    avg_winner REAL NOT NULL DEFAULT 0,
    avg_loser REAL NOT NULL DEFAULT 0,
    trend TEXT NOT NULL DEFAULT 'stable',
    status TEXT NOT NULL DEFAULT 'UNKNOWN',
    blacklist_reason TEXT,
    last_updated_ms INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS patterns (
    pattern_id TEXT PRIMARY KEY,
    description TEXT NOT NULL,
    entry_conditions TEXT NOT NULL,
    exit_conditions TEXT NOT NULL,
    times_used INTEGER NOT NULL DEFAULT 0,
    wins INTEGER NOT NULL DEFAULT 0,
    losses INTEGER NOT NULL DEFAULT 0,
    total_pnl REAL NOT NULL DEFAULT 0,
    confidence REAL NOT NULL DEFAULT 0.5,
    active INTEGER NOT NULL DEFAULT 1,
    created_at_ms INTEGER NOT NULL,
    last_used_at_ms INTEGER
);

CREATE TABLE IF NOT EXISTS regime_rules (
    rule_id TEXT PRIMARY KEY,
    description TEXT NOT NULL,
    condition_json TEXT NOT NULL,
    action TEXT NOT NULL,
    times_triggered INTEGER NOT NULL DEFAULT 0,
    estimated_saves REAL NOT NULL DEFAULT 0,
    active INTEGER NOT NULL DEFAULT 1,
    created_at_ms INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS adaptations (
    id TEXT PRIMARY KEY,
    ts_ms INTEGER NOT NULL,
    insight_id TEXT,
    action TEXT NOT NULL,
    target TEXT NOT NULL,
    description TEXT NOT NULL,
    pre_metrics TEXT NOT NULL,
    confidence REAL NOT NULL,
    auto_applied INTEGER NOT NULL,
    post_metrics TEXT,
    effectiveness TEXT NOT NULL DEFAULT 'pending',
    measured_at_ms INTEGER,
    rolled_back INTEGER NOT NULL DEFAULT 0,
    rollback_reason TEXT
);
CREATE INDEX IF NOT EXISTS idx_adaptations_target ON adaptations(target, ts_ms);
CREATE INDEX IF NOT EXISTS idx_adaptations_pending ON adaptations(effectiveness);

CREATE TABLE IF NOT EXISTS reflections (
    id TEXT PRIMARY KEY,
    ts_ms INTEGER NOT NULL,
    window_from_ms INTEGER NOT NULL,
    window_to_ms INTEGER NOT NULL,
    trade_count INTEGER NOT NULL,
    summary TEXT NOT NULL,
    duration_ms INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS insights (
    id TEXT PRIMARY KEY,
    reflection_id TEXT NOT NULL,
    insight_json TEXT NOT NULL,
    ts_ms INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_insights_reflection ON insights(reflection_id);

CREATE TABLE IF NOT EXISTS journal (
    trade_id TEXT PRIMARY KEY,
    condition_id TEXT NOT NULL,
    symbol TEXT NOT NULL,
    direction TEXT NOT NULL,
    size_usd REAL NOT NULL,
    strategy_id TEXT NOT NULL,
    pattern_id TEXT,
    entry_price REAL NOT NULL,
    entry_ts_ms INTEGER NOT NULL,
    market_regime TEXT NOT NULL DEFAULT '',
    btc_change_24h REAL NOT NULL DEFAULT 0,
    hour_of_day INTEGER NOT NULL DEFAULT 0,
    day_of_week INTEGER NOT NULL DEFAULT 0,
    exit_price REAL,
    exit_ts_ms INTEGER,
    exit_reason TEXT,
    pnl_usd REAL,
    pnl_pct REAL,
    duration_ms INTEGER,
    price_after_1m REAL,
    price_after_5m REAL,
    price_after_15m REAL
);
CREATE INDEX IF NOT EXISTS idx_journal_entry_ts ON journal(entry_ts_ms);
CREATE INDEX IF NOT EXISTS idx_journal_symbol ON journal(symbol, entry_ts_ms);
CREATE INDEX IF NOT EXISTS idx_journal_pattern ON journal(pattern_id, entry_ts_ms);

CREATE TABLE IF NOT EXISTS active_conditions (
    id TEXT PRIMARY KEY,
    condition_json TEXT NOT NULL,
    valid_until_ms INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS runtime_state (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

/// Shared handle to the SQLite store. Writers serialize on the connection
/// mutex; every mutator runs inside a single transaction.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn open<P: AsRef<Path>>(path: P) -> TradingResult<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| TradingError::DatabaseError(format!("create {}: {}", parent.display(), e)))?;
            }
        }
        let conn = Connection::open(path.as_ref())
            .map_err(|e| TradingError::DatabaseError(format!("open {}: {}", path.as_ref().display(), e)))?;
        Self::from_connection(conn)
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> TradingResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> TradingResult<Self> {
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.migrate()?;
        Ok(db)
    }

    fn migrate(&self) -> TradingResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)",
            [],
        )?;

        let stored: Option<i64> = conn
            .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| row.get(0))
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;

        let from = match stored {
            Some(v) if v > SCHEMA_VERSION => {
                return Err(TradingError::SchemaError(format!(
                    "store schema version {} is ahead of supported version {}",
                    v, SCHEMA_VERSION
                )));
            }
            Some(v) => v,
            None => 0,
        };

        for (version, sql) in MIGRATIONS.iter().filter(|(v, _)| *v > from) {
            info!("🗄️ Applying store migration v{}", version);
            conn.execute_batch(sql)?;
        }

        if stored.is_none() {
            conn.execute("INSERT INTO schema_version (version) VALUES (?1)", [SCHEMA_VERSION])?;
        } else if from < SCHEMA_VERSION {
            conn.execute("UPDATE schema_version SET version = ?1", [SCHEMA_VERSION])?;
        }
        Ok(())
    }

    /// Run a closure against the connection. Keep closures short; this
    /// serializes all store access.
    pub fn with<R>(&self, f: impl FnOnce(&Connection) -> TradingResult<R>) -> TradingResult<R> {
        let conn = self.conn.lock();
        f(&conn)
    }

    /// Run a closure inside a transaction; rollback on error so partial
    /// writes are impossible.
    pub fn with_tx<R>(&self, f: impl FnOnce(&rusqlite::Transaction) -> TradingResult<R>) -> TradingResult<R> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        match f(&tx) {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(e) => {
                warn!("🗄️ Store transaction rolled back: {}", e);
                Err(e)
            }
        }
    }

    pub fn health_check(&self) -> bool {
        self.with(|conn| {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
                .map_err(TradingError::from)
        })
        .map(|v| v == 1)
        .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_store_migrates_to_current_version() {
        let db = Database::open_in_memory().unwrap();
        let version: i64 = db
            .with(|conn| {
                conn.query_row("SELECT version FROM schema_version", [], |row| row.get(0))
                    .map_err(TradingError::from)
            })
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);
        assert!(db.health_check());
    }

    #[test]
    fn future_schema_version_refuses_startup() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute("CREATE TABLE schema_version (version INTEGER NOT NULL)", [])
            .unwrap();
        conn.execute("INSERT INTO schema_version (version) VALUES (99)", [])
            .unwrap();
        let err = Database::from_connection(conn).err().unwrap();
        assert!(matches!(err, TradingError::SchemaError(_)));
    }

    #[test]
    fn transaction_rolls_back_on_error() {
        let db = Database::open_in_memory().unwrap();
        let result: TradingResult<()> = db.with_tx(|tx| {
            tx.execute(
                "INSERT INTO runtime_state (key, value) VALUES ('k', 'v')",
                [],
            )?;
            Err(TradingError::DataError("boom".to_string()))
        });
        assert!(result.is_err());

        let count: i64 = db
            .with(|conn| {
                conn.query_row("SELECT COUNT(*) FROM runtime_state", [], |row| row.get(0))
                    .map_err(TradingError::from)
            })
            .unwrap();
        assert_eq!(count, 0);
    }
}
