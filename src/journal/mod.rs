//! Append-only trade journal. The Sniper enqueues writes on a bounded
//! channel; a dedicated writer task owns the actual SQLite appends so the
//! tick path never touches disk.

use crate::models::{
    ClosedTrade, Direction, ExitReason, JournalEntry, Position, TradingError, TradingResult,
};
use crate::store::Database;
use rusqlite::{params, Row};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Price sample offsets recorded after an exit, for missed-profit analysis.
pub const ENRICH_OFFSETS_MIN: [u32; 3] = [1, 5, 15];

/// Messages accepted by the journal writer task.
#[derive(Debug)]
pub enum JournalMsg {
    Entry(Box<Position>),
    Exit(Box<ClosedTrade>),
    Enrich {
        trade_id: String,
        offset_min: u32,
        price: f64,
    },
}

#[derive(Clone)]
pub struct Journal {
    db: Database,
}

/// Filters for time-indexed journal queries.
#[derive(Debug, Default, Clone)]
pub struct JournalQuery {
    pub since_ms: i64,
    pub until_ms: Option<i64>,
    pub symbol: Option<String>,
    pub pattern_id: Option<String>,
    pub limit: Option<usize>,
}

impl Journal {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn record_entry(&self, position: &Position) -> TradingResult<()> {
        self.db.with_tx(|tx| {
            tx.execute(
                "INSERT INTO journal
                   (trade_id, condition_id, symbol, direction, size_usd, strategy_id,
                    pattern_id, entry_price, entry_ts_ms, market_regime, btc_change_24h,
                    hour_of_day, day_of_week)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    position.id,
                    position.condition_id,
                    position.symbol,
                    position.direction.to_string(),
                    position.size_usd,
                    position.strategy_id,
                    position.pattern_id,
                    position.entry_price,
                    position.entry_ts_ms,
                    position.entry_ctx.market_regime,
                    position.entry_ctx.btc_change_24h,
                    position.entry_ctx.hour_of_day,
                    position.entry_ctx.day_of_week,
                ],
            )?;
            Ok(())
        })
    }

    /// Fill in the exit half of the matching entry row. Single UPDATE, so
    /// the row is never observable half-written.
    pub fn record_exit(&self, trade: &ClosedTrade) -> TradingResult<()> {
        if trade.exit_ts_ms < trade.position.entry_ts_ms {
            // Negative duration means a clock or time-unit error upstream;
            // refuse to write rather than journal garbage.
            error!(
                "📓 Negative trade duration for {} (entry {} > exit {}), dropping exit row",
                trade.position.id, trade.position.entry_ts_ms, trade.exit_ts_ms
            );
            return Err(TradingError::DataError(format!(
                "negative duration for trade {}",
                trade.position.id
            )));
        }
        self.db.with_tx(|tx| {
            let updated = tx.execute(
                "UPDATE journal SET exit_price = ?2, exit_ts_ms = ?3, exit_reason = ?4,
                        pnl_usd = ?5, pnl_pct = ?6, duration_ms = ?7
                 WHERE trade_id = ?1 AND exit_ts_ms IS NULL",
                params![
                    trade.position.id,
                    trade.exit_price,
                    trade.exit_ts_ms,
                    trade.reason.to_string(),
                    trade.pnl_usd,
                    trade.pnl_pct,
                    trade.duration_ms,
                ],
            )?;
            if updated == 0 {
                warn!("📓 Exit for unknown or already-closed trade {}", trade.position.id);
            }
            Ok(())
        })
    }

    /// Post-exit enrichment; allowed only within a bounded window after the
    /// exit and writes each offset at most once.
    pub fn enrich_post_exit(&self, trade_id: &str, offset_min: u32, price: f64) -> TradingResult<()> {
        let column = match offset_min {
            1 => "price_after_1m",
            5 => "price_after_5m",
            15 => "price_after_15m",
            other => {
                return Err(TradingError::DataError(format!(
                    "unsupported enrichment offset {}m",
                    other
                )))
            }
        };
        self.db.with_tx(|tx| {
            tx.execute(
                &format!(
                    "UPDATE journal SET {} = ?2
                     WHERE trade_id = ?1 AND exit_ts_ms IS NOT NULL AND {} IS NULL",
                    column, column
                ),
                params![trade_id, price],
            )?;
            Ok(())
        })
    }

    pub fn query(&self, q: &JournalQuery) -> TradingResult<Vec<JournalEntry>> {
        let mut sql = String::from(
            "SELECT trade_id, condition_id, symbol, direction, size_usd, strategy_id,
                    pattern_id, entry_price, entry_ts_ms, market_regime, btc_change_24h,
                    hour_of_day, day_of_week, exit_price, exit_ts_ms, exit_reason,
                    pnl_usd, pnl_pct, duration_ms, price_after_1m, price_after_5m,
                    price_after_15m
             FROM journal WHERE entry_ts_ms >= ?1",
        );
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(q.since_ms)];
        if let Some(until) = q.until_ms {
            args.push(Box::new(until));
            sql.push_str(&format!(" AND entry_ts_ms <= ?{}", args.len()));
        }
        if let Some(symbol) = &q.symbol {
            args.push(Box::new(symbol.clone()));
            sql.push_str(&format!(" AND symbol = ?{}", args.len()));
        }
        if let Some(pattern) = &q.pattern_id {
            args.push(Box::new(pattern.clone()));
            sql.push_str(&format!(" AND pattern_id = ?{}", args.len()));
        }
        sql.push_str(" ORDER BY entry_ts_ms DESC");
        if let Some(limit) = q.limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }

        self.db.with(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let params_ref: Vec<&dyn rusqlite::ToSql> = args.iter().map(|a| a.as_ref()).collect();
            let rows = stmt
                .query_map(params_ref.as_slice(), entry_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Most recent closed trades for one symbol, newest first. Used for the
    /// last-5 vs previous-5 trend comparison.
    pub fn recent_closed_for_symbol(&self, symbol: &str, limit: usize) -> TradingResult<Vec<JournalEntry>> {
        self.db.with(|conn| {
            let mut stmt = conn.prepare(
                "SELECT trade_id, condition_id, symbol, direction, size_usd, strategy_id,
                        pattern_id, entry_price, entry_ts_ms, market_regime, btc_change_24h,
                        hour_of_day, day_of_week, exit_price, exit_ts_ms, exit_reason,
                        pnl_usd, pnl_pct, duration_ms, price_after_1m, price_after_5m,
                        price_after_15m
                 FROM journal WHERE symbol = ?1 AND exit_ts_ms IS NOT NULL
                 ORDER BY exit_ts_ms DESC LIMIT ?2",
            )?;
            let rows = stmt
                .query_map(params![symbol, limit as i64], entry_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Count of closed trades touching a target (symbol or pattern id)
    /// since a timestamp. Drives the effectiveness horizon.
    pub fn closed_count_for_target_since(&self, target: &str, since_ms: i64) -> TradingResult<u32> {
        self.db.with(|conn| {
            let count: u32 = conn.query_row(
                "SELECT COUNT(*) FROM journal
                 WHERE exit_ts_ms IS NOT NULL AND exit_ts_ms >= ?2
                   AND (symbol = ?1 OR pattern_id = ?1)",
                params![target, since_ms],
                |row| row.get(0),
            )?;
            Ok(count)
        })
    }

    /// Aggregate (trades, wins, total_pnl) touching a target since a
    /// timestamp; pre/post metric input for the effectiveness monitor.
    pub fn target_metrics_since(&self, target: &str, since_ms: i64) -> TradingResult<(u32, u32, f64)> {
        self.db.with(|conn| {
            conn.query_row(
                "SELECT COUNT(*),
                        COALESCE(SUM(CASE WHEN pnl_usd > 0 THEN 1 ELSE 0 END), 0),
                        COALESCE(SUM(pnl_usd), 0)
                 FROM journal
                 WHERE exit_ts_ms IS NOT NULL AND exit_ts_ms >= ?2
                   AND (symbol = ?1 OR pattern_id = ?1)",
                params![target, since_ms],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .map_err(TradingError::from)
        })
    }

    pub fn total_closed_pnl(&self) -> TradingResult<f64> {
        self.db.with(|conn| {
            conn.query_row(
                "SELECT COALESCE(SUM(pnl_usd), 0) FROM journal WHERE exit_ts_ms IS NOT NULL",
                [],
                |row| row.get(0),
            )
            .map_err(TradingError::from)
        })
    }
}

/// Run the journal writer until the channel closes. Append failures retry
/// with capped exponential backoff; sustained failure flips `degraded`.
pub async fn run_writer(
    journal: Journal,
    mut rx: mpsc::Receiver<JournalMsg>,
    health: crate::orchestrator::HealthHandle,
) {
    info!("📓 Journal writer started");
    while let Some(msg) = rx.recv().await {
        let mut backoff = Duration::from_millis(50);
        let mut attempts = 0u32;
        loop {
            let result = match &msg {
                JournalMsg::Entry(position) => journal.record_entry(position),
                JournalMsg::Exit(trade) => journal.record_exit(trade),
                JournalMsg::Enrich {
                    trade_id,
                    offset_min,
                    price,
                } => journal.enrich_post_exit(trade_id, *offset_min, *price),
            };
            match result {
                Ok(()) => {
                    health.ok();
                    break;
                }
                // Data errors are not retryable; drop the message.
                Err(TradingError::DataError(e)) => {
                    warn!("📓 Journal message dropped: {}", e);
                    health.error(&e);
                    break;
                }
                Err(e) => {
                    attempts += 1;
                    if attempts >= 5 {
                        error!("📓 Journal append failed after {} attempts: {}", attempts, e);
                        health.degrade(&e.to_string());
                        break;
                    }
                    debug!("📓 Journal append retry {} after {:?}: {}", attempts, backoff, e);
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(Duration::from_secs(2));
                }
            }
        }
    }
    info!("📓 Journal writer stopped");
}

fn entry_from_row(row: &Row) -> rusqlite::Result<JournalEntry> {
    let direction: String = row.get(3)?;
    let exit_reason: Option<String> = row.get(15)?;
    Ok(JournalEntry {
        trade_id: row.get(0)?,
        condition_id: row.get(1)?,
        symbol: row.get(2)?,
        direction: Direction::parse(&direction).unwrap_or(Direction::Long),
        size_usd: row.get(4)?,
        strategy_id: row.get(5)?,
        pattern_id: row.get(6)?,
        entry_price: row.get(7)?,
        entry_ts_ms: row.get(8)?,
        market_regime: row.get(9)?,
        btc_change_24h: row.get(10)?,
        hour_of_day: row.get(11)?,
        day_of_week: row.get(12)?,
        exit_price: row.get(13)?,
        exit_ts_ms: row.get(14)?,
        exit_reason: exit_reason.as_deref().and_then(ExitReason::parse),
        pnl_usd: row.get(16)?,
        pnl_pct: row.get(17)?,
        duration_ms: row.get(18)?,
        price_after_1m: row.get(19)?,
        price_after_5m: row.get(20)?,
        price_after_15m: row.get(21)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EntryContext, TradeCondition, TriggerRel};

    fn journal() -> Journal {
        Journal::new(Database::open_in_memory().unwrap())
    }

    fn open_position(symbol: &str, entry_ts_ms: i64) -> Position {
        let cond = TradeCondition {
            id: uuid::Uuid::new_v4().to_string(),
            symbol: symbol.to_string(),
            direction: Direction::Long,
            trigger_price: 100.0,
            trigger_rel: TriggerRel::Above,
            stop_loss_pct: 0.02,
            take_profit_pct: 0.01,
            size_usd: 500.0,
            strategy_id: "llm".to_string(),
            pattern_id: Some("p1".to_string()),
            reasoning: String::new(),
            created_at_ms: entry_ts_ms,
            valid_until_ms: entry_ts_ms + 60_000,
        };
        Position::open(&cond, 100.0, entry_ts_ms, EntryContext::default())
    }

    fn close(position: Position, exit_price: f64, exit_ts_ms: i64) -> ClosedTrade {
        let pnl = position.pnl_at(exit_price);
        ClosedTrade {
            duration_ms: exit_ts_ms - position.entry_ts_ms,
            pnl_pct: pnl / position.size_usd,
            pnl_usd: pnl,
            reason: ExitReason::TakeProfit,
            exit_price,
            exit_ts_ms,
            position,
        }
    }

    #[test]
    fn entry_then_exit_makes_one_row() {
        let j = journal();
        let t0 = 2_100_000_000_000;
        let position = open_position("BTC", t0);
        j.record_entry(&position).unwrap();

        let trade = close(position, 101.0, t0 + 5_000);
        j.record_exit(&trade).unwrap();

        let rows = j.query(&JournalQuery { since_ms: t0 - 1, ..Default::default() }).unwrap();
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(row.exit_reason, Some(ExitReason::TakeProfit));
        assert!((row.pnl_usd.unwrap() - 5.0).abs() < 1e-9);
        assert_eq!(row.duration_ms, Some(5_000));
    }

    #[test]
    fn negative_duration_is_refused() {
        let j = journal();
        let t0 = 2_100_000_000_000;
        let position = open_position("BTC", t0);
        j.record_entry(&position).unwrap();

        let trade = close(position, 101.0, t0 - 1_000);
        assert!(j.record_exit(&trade).is_err());

        let rows = j.query(&JournalQuery { since_ms: 0, ..Default::default() }).unwrap();
        assert!(rows[0].exit_ts_ms.is_none());
    }

    #[test]
    fn exit_row_is_write_once() {
        let j = journal();
        let t0 = 2_100_000_000_000;
        let position = open_position("ETH", t0);
        j.record_entry(&position).unwrap();

        let first = close(position.clone(), 101.0, t0 + 1_000);
        j.record_exit(&first).unwrap();
        let second = close(position, 90.0, t0 + 2_000);
        j.record_exit(&second).unwrap();

        let rows = j.query(&JournalQuery { since_ms: 0, ..Default::default() }).unwrap();
        assert!((rows[0].exit_price.unwrap() - 101.0).abs() < 1e-9);
    }

    #[test]
    fn enrichment_fills_each_offset_once() {
        let j = journal();
        let t0 = 2_100_000_000_000;
        let position = open_position("SOL", t0);
        let id = position.id.clone();
        j.record_entry(&position).unwrap();
        j.record_exit(&close(position, 101.0, t0 + 1_000)).unwrap();

        j.enrich_post_exit(&id, 1, 102.0).unwrap();
        j.enrich_post_exit(&id, 1, 999.0).unwrap();
        j.enrich_post_exit(&id, 5, 103.0).unwrap();
        assert!(j.enrich_post_exit(&id, 7, 1.0).is_err());

        let rows = j.query(&JournalQuery { since_ms: 0, ..Default::default() }).unwrap();
        assert!((rows[0].price_after_1m.unwrap() - 102.0).abs() < 1e-9);
        assert!((rows[0].price_after_5m.unwrap() - 103.0).abs() < 1e-9);
        assert!(rows[0].price_after_15m.is_none());
    }

    #[test]
    fn query_filters_by_symbol_and_pattern() {
        let j = journal();
        let t0 = 2_100_000_000_000;
        for (i, symbol) in ["BTC", "ETH", "BTC"].iter().enumerate() {
            let position = open_position(symbol, t0 + i as i64 * 1_000);
            j.record_entry(&position).unwrap();
            j.record_exit(&close(position, 101.0, t0 + i as i64 * 1_000 + 500))
                .unwrap();
        }
        let btc = j
            .query(&JournalQuery {
                since_ms: 0,
                symbol: Some("BTC".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(btc.len(), 2);

        let by_pattern = j
            .query(&JournalQuery {
                since_ms: 0,
                pattern_id: Some("p1".to_string()),
                limit: Some(2),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(by_pattern.len(), 2);

        assert_eq!(j.closed_count_for_target_since("BTC", 0).unwrap(), 2);
        let (trades, wins, pnl) = j.target_metrics_since("BTC", 0).unwrap();
        assert_eq!(trades, 2);
        assert_eq!(wins, 2);
        assert!(pnl > 0.0);
    }
}
