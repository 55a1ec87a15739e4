//! Knowledge store: coin scores, pattern library, regime rules, adaptations,
//! reflections, and runtime snapshots. QuickUpdate and the AdaptationEngine
//! are the only mutators; everyone else reads.

use crate::models::{
    Adaptation, AdaptationAction, CoinScore, CoinStatus, Effectiveness, Insight, Pattern,
    Position, RegimeAction, RegimeRule, RuleCondition, RuntimeState, TradeCondition, Trend,
    TradingError, TradingResult,
};
use crate::store::Database;
use crate::utils::time::now_ms;
use dashmap::DashMap;
use rusqlite::{params, Row};
use std::sync::Arc;
use tracing::{debug, info};

/// Hot, lock-light view of the blacklist for the Sniper's admission check.
/// Kept in sync by the mutators below; maps symbol -> reason.
pub type BlacklistView = Arc<DashMap<String, String>>;

#[derive(Clone)]
pub struct KnowledgeStore {
    db: Database,
    blacklist: BlacklistView,
}

impl KnowledgeStore {
    pub fn new(db: Database) -> TradingResult<Self> {
        let store = Self {
            db,
            blacklist: Arc::new(DashMap::new()),
        };
        store.reload_blacklist_view()?;
        Ok(store)
    }

    pub fn blacklist_view(&self) -> BlacklistView {
        Arc::clone(&self.blacklist)
    }

    pub fn is_blacklisted(&self, symbol: &str) -> bool {
        self.blacklist.contains_key(symbol)
    }

    fn reload_blacklist_view(&self) -> TradingResult<()> {
        let rows = self.db.with(|conn| {
            let mut stmt = conn.prepare(
                "SELECT symbol, COALESCE(blacklist_reason, '') FROM coin_scores
                 WHERE status = 'BLACKLISTED'",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;
        self.blacklist.clear();
        for (symbol, reason) in rows {
            self.blacklist.insert(symbol, reason);
        }
        Ok(())
    }

    // === Coin scores ===

    pub fn upsert_coin_score(&self, score: &CoinScore) -> TradingResult<()> {
        self.db.with_tx(|tx| {
            tx.execute(
                "INSERT INTO coin_scores
                   (symbol, trades, wins, losses, total_pnl, avg_pnl, win_rate,
                    avg_winner, avg_loser, trend, status, blacklist_reason, last_updated_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                 ON CONFLICT(symbol) DO UPDATE SET
                   trades = excluded.trades,
                   wins = excluded.wins,
                   losses = excluded.losses,
                   total_pnl = excluded.total_pnl,
                   avg_pnl = excluded.avg_pnl,
                   win_rate = excluded.win_rate,
                   avg_winner = excluded.avg_winner,
                   avg_loser = excluded.avg_loser,
                   trend = excluded.trend,
                   status = excluded.status,
                   blacklist_reason = excluded.blacklist_reason,
                   last_updated_ms = excluded.last_updated_ms",
                params![
                    score.symbol,
                    score.trades,
                    score.wins,
                    score.losses,
                    score.total_pnl,
                    score.avg_pnl,
                    score.win_rate,
                    score.avg_winner,
                    score.avg_loser,
                    score.trend.to_string(),
                    score.status.to_string(),
                    score.blacklist_reason,
                    score.last_updated_ms,
                ],
            )?;
            Ok(())
        })?;
        self.sync_blacklist_entry(&score.symbol, score.status, score.blacklist_reason.as_deref());
        Ok(())
    }

    pub fn set_coin_status(
        &self,
        symbol: &str,
        status: CoinStatus,
        reason: Option<&str>,
    ) -> TradingResult<()> {
        self.db.with_tx(|tx| {
            let updated = tx.execute(
                "UPDATE coin_scores SET status = ?2, blacklist_reason = ?3, last_updated_ms = ?4
                 WHERE symbol = ?1",
                params![symbol, status.to_string(), reason, now_ms()],
            )?;
            if updated == 0 {
                tx.execute(
                    "INSERT INTO coin_scores (symbol, status, blacklist_reason, last_updated_ms)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![symbol, status.to_string(), reason, now_ms()],
                )?;
            }
            Ok(())
        })?;
        self.sync_blacklist_entry(symbol, status, reason);
        info!("📚 Coin status set: {} -> {}", symbol, status);
        Ok(())
    }

    fn sync_blacklist_entry(&self, symbol: &str, status: CoinStatus, reason: Option<&str>) {
        if status == CoinStatus::Blacklisted {
            self.blacklist
                .insert(symbol.to_string(), reason.unwrap_or("").to_string());
        } else {
            self.blacklist.remove(symbol);
        }
    }

    pub fn get_coin_score(&self, symbol: &str) -> TradingResult<Option<CoinScore>> {
        self.db.with(|conn| {
            let mut stmt = conn.prepare(
                "SELECT symbol, trades, wins, losses, total_pnl, avg_pnl, win_rate,
                        avg_winner, avg_loser, trend, status, blacklist_reason, last_updated_ms
                 FROM coin_scores WHERE symbol = ?1",
            )?;
            let mut rows = stmt.query_map(params![symbol], coin_score_from_row)?;
            match rows.next() {
                Some(row) => Ok(Some(row?)),
                None => Ok(None),
            }
        })
    }

    pub fn get_all_coin_scores(&self) -> TradingResult<Vec<CoinScore>> {
        self.db.with(|conn| {
            let mut stmt = conn.prepare(
                "SELECT symbol, trades, wins, losses, total_pnl, avg_pnl, win_rate,
                        avg_winner, avg_loser, trend, status, blacklist_reason, last_updated_ms
                 FROM coin_scores ORDER BY symbol",
            )?;
            let rows = stmt
                .query_map([], coin_score_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn get_blacklist(&self) -> TradingResult<Vec<String>> {
        self.symbols_with_status(CoinStatus::Blacklisted)
    }

    pub fn get_favored(&self) -> TradingResult<Vec<String>> {
        self.symbols_with_status(CoinStatus::Favored)
    }

    fn symbols_with_status(&self, status: CoinStatus) -> TradingResult<Vec<String>> {
        self.db.with(|conn| {
            let mut stmt =
                conn.prepare("SELECT symbol FROM coin_scores WHERE status = ?1 ORDER BY symbol")?;
            let rows = stmt
                .query_map(params![status.to_string()], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    // === Patterns ===

    pub fn add_pattern(&self, pattern: &Pattern) -> TradingResult<()> {
        self.db.with_tx(|tx| {
            tx.execute(
                "INSERT OR REPLACE INTO patterns
                   (pattern_id, description, entry_conditions, exit_conditions, times_used,
                    wins, losses, total_pnl, confidence, active, created_at_ms, last_used_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    pattern.pattern_id,
                    pattern.description,
                    pattern.entry_conditions.to_string(),
                    pattern.exit_conditions.to_string(),
                    pattern.times_used,
                    pattern.wins,
                    pattern.losses,
                    pattern.total_pnl,
                    pattern.confidence,
                    pattern.active,
                    pattern.created_at_ms,
                    pattern.last_used_at_ms,
                ],
            )?;
            Ok(())
        })
    }

    pub fn update_pattern_stats(&self, pattern: &Pattern) -> TradingResult<()> {
        self.db.with_tx(|tx| {
            tx.execute(
                "UPDATE patterns SET times_used = ?2, wins = ?3, losses = ?4, total_pnl = ?5,
                        confidence = ?6, last_used_at_ms = ?7
                 WHERE pattern_id = ?1",
                params![
                    pattern.pattern_id,
                    pattern.times_used,
                    pattern.wins,
                    pattern.losses,
                    pattern.total_pnl,
                    pattern.confidence,
                    pattern.last_used_at_ms,
                ],
            )?;
            Ok(())
        })
    }

    pub fn set_pattern_active(&self, pattern_id: &str, active: bool) -> TradingResult<()> {
        self.db.with_tx(|tx| {
            tx.execute(
                "UPDATE patterns SET active = ?2 WHERE pattern_id = ?1",
                params![pattern_id, active],
            )?;
            Ok(())
        })
    }

    pub fn get_pattern(&self, pattern_id: &str) -> TradingResult<Option<Pattern>> {
        self.db.with(|conn| {
            let mut stmt = conn.prepare(
                "SELECT pattern_id, description, entry_conditions, exit_conditions, times_used,
                        wins, losses, total_pnl, confidence, active, created_at_ms, last_used_at_ms
                 FROM patterns WHERE pattern_id = ?1",
            )?;
            let mut rows = stmt.query_map(params![pattern_id], pattern_from_row)?;
            match rows.next() {
                Some(row) => Ok(Some(row?)),
                None => Ok(None),
            }
        })
    }

    pub fn get_active_patterns(&self) -> TradingResult<Vec<Pattern>> {
        self.db.with(|conn| {
            let mut stmt = conn.prepare(
                "SELECT pattern_id, description, entry_conditions, exit_conditions, times_used,
                        wins, losses, total_pnl, confidence, active, created_at_ms, last_used_at_ms
                 FROM patterns WHERE active = 1 ORDER BY confidence DESC",
            )?;
            let rows = stmt
                .query_map([], pattern_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    // === Regime rules ===

    pub fn add_regime_rule(&self, rule: &RegimeRule) -> TradingResult<()> {
        let condition_json = serde_json::to_string(&rule.condition)
            .map_err(|e| TradingError::DataError(format!("rule condition encode: {}", e)))?;
        self.db.with_tx(|tx| {
            tx.execute(
                "INSERT OR REPLACE INTO regime_rules
                   (rule_id, description, condition_json, action, times_triggered,
                    estimated_saves, active, created_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    rule.rule_id,
                    rule.description,
                    condition_json,
                    rule.action.to_string(),
                    rule.times_triggered,
                    rule.estimated_saves,
                    rule.active,
                    rule.created_at_ms,
                ],
            )?;
            Ok(())
        })
    }

    pub fn set_rule_active(&self, rule_id: &str, active: bool) -> TradingResult<()> {
        self.db.with_tx(|tx| {
            tx.execute(
                "UPDATE regime_rules SET active = ?2 WHERE rule_id = ?1",
                params![rule_id, active],
            )?;
            Ok(())
        })
    }

    pub fn bump_rule_triggered(&self, rule_id: &str) -> TradingResult<()> {
        self.db.with_tx(|tx| {
            tx.execute(
                "UPDATE regime_rules SET times_triggered = times_triggered + 1 WHERE rule_id = ?1",
                params![rule_id],
            )?;
            Ok(())
        })
    }

    pub fn get_active_rules(&self) -> TradingResult<Vec<RegimeRule>> {
        self.db.with(|conn| {
            let mut stmt = conn.prepare(
                "SELECT rule_id, description, condition_json, action, times_triggered,
                        estimated_saves, active, created_at_ms
                 FROM regime_rules WHERE active = 1 ORDER BY created_at_ms",
            )?;
            let rows = stmt
                .query_map([], regime_rule_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    // === Adaptations ===

    pub fn add_adaptation(&self, adaptation: &Adaptation) -> TradingResult<()> {
        self.db.with_tx(|tx| {
            tx.execute(
                "INSERT INTO adaptations
                   (id, ts_ms, insight_id, action, target, description, pre_metrics,
                    confidence, auto_applied, post_metrics, effectiveness, measured_at_ms,
                    rolled_back, rollback_reason)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                params![
                    adaptation.id,
                    adaptation.ts_ms,
                    adaptation.insight_id,
                    adaptation.action.to_string(),
                    adaptation.target,
                    adaptation.description,
                    adaptation.pre_metrics.to_string(),
                    adaptation.confidence,
                    adaptation.auto_applied,
                    adaptation.post_metrics.as_ref().map(|m| m.to_string()),
                    adaptation.effectiveness.to_string(),
                    adaptation.measured_at_ms,
                    adaptation.rolled_back,
                    adaptation.rollback_reason,
                ],
            )?;
            Ok(())
        })
    }

    pub fn finalize_adaptation(
        &self,
        id: &str,
        post_metrics: &serde_json::Value,
        effectiveness: Effectiveness,
    ) -> TradingResult<()> {
        self.db.with_tx(|tx| {
            tx.execute(
                "UPDATE adaptations SET post_metrics = ?2, effectiveness = ?3, measured_at_ms = ?4
                 WHERE id = ?1 AND effectiveness = 'pending'",
                params![id, post_metrics.to_string(), effectiveness.to_string(), now_ms()],
            )?;
            Ok(())
        })
    }

    pub fn record_rollback(&self, id: &str, reason: &str) -> TradingResult<()> {
        self.db.with_tx(|tx| {
            tx.execute(
                "UPDATE adaptations SET rolled_back = 1, rollback_reason = ?2 WHERE id = ?1",
                params![id, reason],
            )?;
            Ok(())
        })
    }

    pub fn get_adaptation(&self, id: &str) -> TradingResult<Option<Adaptation>> {
        self.db.with(|conn| {
            let mut stmt = conn.prepare(&format!("{} WHERE id = ?1", SELECT_ADAPTATION))?;
            let mut rows = stmt.query_map(params![id], adaptation_from_row)?;
            match rows.next() {
                Some(row) => Ok(Some(row?)),
                None => Ok(None),
            }
        })
    }

    pub fn get_recent_adaptations(&self, window_ms: i64) -> TradingResult<Vec<Adaptation>> {
        let since = now_ms() - window_ms;
        self.db.with(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{} WHERE ts_ms >= ?1 ORDER BY ts_ms DESC",
                SELECT_ADAPTATION
            ))?;
            let rows = stmt
                .query_map(params![since], adaptation_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn get_adaptations_for_target(&self, target: &str) -> TradingResult<Vec<Adaptation>> {
        self.db.with(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{} WHERE target = ?1 ORDER BY ts_ms DESC",
                SELECT_ADAPTATION
            ))?;
            let rows = stmt
                .query_map(params![target], adaptation_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn get_pending_adaptations(&self) -> TradingResult<Vec<Adaptation>> {
        self.db.with(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{} WHERE effectiveness = 'pending' AND rolled_back = 0 ORDER BY ts_ms",
                SELECT_ADAPTATION
            ))?;
            let rows = stmt
                .query_map([], adaptation_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    // === Reflections & insights ===

    pub fn add_reflection(
        &self,
        reflection_id: &str,
        window_from_ms: i64,
        window_to_ms: i64,
        trade_count: u32,
        summary: &str,
        duration_ms: i64,
        insights: &[Insight],
    ) -> TradingResult<Vec<String>> {
        let ts = now_ms();
        self.db.with_tx(|tx| {
            tx.execute(
                "INSERT INTO reflections
                   (id, ts_ms, window_from_ms, window_to_ms, trade_count, summary, duration_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    reflection_id,
                    ts,
                    window_from_ms,
                    window_to_ms,
                    trade_count,
                    summary,
                    duration_ms
                ],
            )?;
            let mut ids = Vec::with_capacity(insights.len());
            for insight in insights {
                let insight_id = uuid::Uuid::new_v4().to_string();
                let blob = serde_json::to_string(insight)
                    .map_err(|e| TradingError::DataError(format!("insight encode: {}", e)))?;
                tx.execute(
                    "INSERT INTO insights (id, reflection_id, insight_json, ts_ms)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![insight_id, reflection_id, blob, ts],
                )?;
                ids.push(insight_id);
            }
            Ok(ids)
        })
    }

    // === Runtime state & snapshots ===

    pub fn save_runtime_state(&self, state: &RuntimeState) -> TradingResult<()> {
        let blob = serde_json::to_string(state)
            .map_err(|e| TradingError::DataError(format!("runtime state encode: {}", e)))?;
        self.put_kv("runtime", &blob)
    }

    pub fn get_runtime_state(&self) -> TradingResult<Option<RuntimeState>> {
        match self.get_kv("runtime")? {
            Some(blob) => serde_json::from_str(&blob)
                .map(Some)
                .map_err(|e| TradingError::DataError(format!("runtime state decode: {}", e))),
            None => Ok(None),
        }
    }

    pub fn save_conditions_snapshot(&self, conditions: &[TradeCondition]) -> TradingResult<()> {
        self.db.with_tx(|tx| {
            tx.execute("DELETE FROM active_conditions", [])?;
            for cond in conditions {
                let blob = serde_json::to_string(cond)
                    .map_err(|e| TradingError::DataError(format!("condition encode: {}", e)))?;
                tx.execute(
                    "INSERT INTO active_conditions (id, condition_json, valid_until_ms)
                     VALUES (?1, ?2, ?3)",
                    params![cond.id, blob, cond.valid_until_ms],
                )?;
            }
            Ok(())
        })
    }

    /// Restore the condition set, dropping anything already expired.
    pub fn load_conditions_snapshot(&self, now_ms: i64) -> TradingResult<Vec<TradeCondition>> {
        let blobs = self.db.with(|conn| {
            let mut stmt = conn.prepare(
                "SELECT condition_json FROM active_conditions WHERE valid_until_ms >= ?1",
            )?;
            let rows = stmt
                .query_map(params![now_ms], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;
        let mut conditions = Vec::with_capacity(blobs.len());
        for blob in blobs {
            match serde_json::from_str::<TradeCondition>(&blob) {
                Ok(cond) => conditions.push(cond),
                Err(e) => debug!("📚 Dropping undecodable condition snapshot: {}", e),
            }
        }
        Ok(conditions)
    }

    pub fn save_positions_snapshot(&self, positions: &[Position]) -> TradingResult<()> {
        let blob = serde_json::to_string(positions)
            .map_err(|e| TradingError::DataError(format!("positions encode: {}", e)))?;
        self.put_kv("open_positions", &blob)
    }

    pub fn load_positions_snapshot(&self) -> TradingResult<Vec<Position>> {
        match self.get_kv("open_positions")? {
            Some(blob) => serde_json::from_str(&blob)
                .map_err(|e| TradingError::DataError(format!("positions decode: {}", e))),
            None => Ok(Vec::new()),
        }
    }

    fn put_kv(&self, key: &str, value: &str) -> TradingResult<()> {
        self.db.with_tx(|tx| {
            tx.execute(
                "INSERT INTO runtime_state (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, value],
            )?;
            Ok(())
        })
    }

    fn get_kv(&self, key: &str) -> TradingResult<Option<String>> {
        self.db.with(|conn| {
            let mut stmt = conn.prepare("SELECT value FROM runtime_state WHERE key = ?1")?;
            let mut rows = stmt.query_map(params![key], |row| row.get::<_, String>(0))?;
            match rows.next() {
                Some(row) => Ok(Some(row?)),
                None => Ok(None),
            }
        })
    }
}

const SELECT_ADAPTATION: &str = "SELECT id, ts_ms, insight_id, action, target, description, \
     pre_metrics, confidence, auto_applied, post_metrics, effectiveness, measured_at_ms, \
     rolled_back, rollback_reason FROM adaptations";

fn coin_score_from_row(row: &Row) -> rusqlite::Result<CoinScore> {
    let trend: String = row.get(9)?;
    let status: String = row.get(10)?;
    Ok(CoinScore {
        symbol: row.get(0)?,
        trades: row.get(1)?,
        wins: row.get(2)?,
        losses: row.get(3)?,
        total_pnl: row.get(4)?,
        avg_pnl: row.get(5)?,
        win_rate: row.get(6)?,
        avg_winner: row.get(7)?,
        avg_loser: row.get(8)?,
        trend: Trend::parse(&trend).unwrap_or(Trend::Stable),
        status: CoinStatus::parse(&status).unwrap_or(CoinStatus::Unknown),
        blacklist_reason: row.get(11)?,
        last_updated_ms: row.get(12)?,
    })
}

fn pattern_from_row(row: &Row) -> rusqlite::Result<Pattern> {
    let entry: String = row.get(2)?;
    let exit: String = row.get(3)?;
    Ok(Pattern {
        pattern_id: row.get(0)?,
        description: row.get(1)?,
        entry_conditions: serde_json::from_str(&entry).unwrap_or(serde_json::Value::Null),
        exit_conditions: serde_json::from_str(&exit).unwrap_or(serde_json::Value::Null),
        times_used: row.get(4)?,
        wins: row.get(5)?,
        losses: row.get(6)?,
        total_pnl: row.get(7)?,
        confidence: row.get(8)?,
        active: row.get(9)?,
        created_at_ms: row.get(10)?,
        last_used_at_ms: row.get(11)?,
    })
}

fn regime_rule_from_row(row: &Row) -> rusqlite::Result<RegimeRule> {
    let condition_json: String = row.get(2)?;
    let action: String = row.get(3)?;
    Ok(RegimeRule {
        rule_id: row.get(0)?,
        description: row.get(1)?,
        condition: serde_json::from_str::<RuleCondition>(&condition_json)
            .unwrap_or(RuleCondition::Weekend),
        action: RegimeAction::parse(&action).unwrap_or(RegimeAction::ReduceSize),
        times_triggered: row.get(4)?,
        estimated_saves: row.get(5)?,
        active: row.get(6)?,
        created_at_ms: row.get(7)?,
    })
}

fn adaptation_from_row(row: &Row) -> rusqlite::Result<Adaptation> {
    let action: String = row.get(3)?;
    let pre: String = row.get(6)?;
    let post: Option<String> = row.get(9)?;
    let effectiveness: String = row.get(10)?;
    Ok(Adaptation {
        id: row.get(0)?,
        ts_ms: row.get(1)?,
        insight_id: row.get(2)?,
        action: AdaptationAction::parse(&action).unwrap_or(AdaptationAction::Rollback),
        target: row.get(4)?,
        description: row.get(5)?,
        pre_metrics: serde_json::from_str(&pre).unwrap_or(serde_json::Value::Null),
        confidence: row.get(7)?,
        auto_applied: row.get(8)?,
        post_metrics: post.and_then(|p| serde_json::from_str(&p).ok()),
        effectiveness: Effectiveness::parse(&effectiveness).unwrap_or(Effectiveness::Pending),
        measured_at_ms: row.get(11)?,
        rolled_back: row.get(12)?,
        rollback_reason: row.get(13)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::BtcTrend;

    fn store() -> KnowledgeStore {
        KnowledgeStore::new(Database::open_in_memory().unwrap()).unwrap()
    }

    #[test]
    fn coin_score_round_trip() {
        let ks = store();
        let mut score = CoinScore::new("SOL");
        score.trades = 10;
        score.wins = 6;
        score.losses = 4;
        score.win_rate = 0.6;
        score.total_pnl = 12.5;
        score.status = CoinStatus::Favored;
        ks.upsert_coin_score(&score).unwrap();

        let loaded = ks.get_coin_score("SOL").unwrap().unwrap();
        assert_eq!(loaded.trades, 10);
        assert_eq!(loaded.wins + loaded.losses, loaded.trades);
        assert_eq!(loaded.status, CoinStatus::Favored);
        assert_eq!(ks.get_favored().unwrap(), vec!["SOL".to_string()]);
    }

    #[test]
    fn blacklist_view_tracks_status_changes() {
        let ks = store();
        ks.set_coin_status("DOGE", CoinStatus::Blacklisted, Some("losing streak"))
            .unwrap();
        assert!(ks.is_blacklisted("DOGE"));
        assert_eq!(ks.get_blacklist().unwrap(), vec!["DOGE".to_string()]);

        ks.set_coin_status("DOGE", CoinStatus::Normal, None).unwrap();
        assert!(!ks.is_blacklisted("DOGE"));
        assert!(ks.get_blacklist().unwrap().is_empty());
    }

    #[test]
    fn blacklist_view_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.db");
        {
            let ks = KnowledgeStore::new(Database::open(&path).unwrap()).unwrap();
            ks.set_coin_status("PEPE", CoinStatus::Blacklisted, Some("rug"))
                .unwrap();
        }
        let ks = KnowledgeStore::new(Database::open(&path).unwrap()).unwrap();
        assert!(ks.is_blacklisted("PEPE"));
    }

    #[test]
    fn adaptation_lifecycle() {
        let ks = store();
        let adaptation = Adaptation {
            id: "a1".to_string(),
            ts_ms: now_ms(),
            insight_id: None,
            action: AdaptationAction::Blacklist,
            target: "DOGE".to_string(),
            description: "blacklist DOGE".to_string(),
            pre_metrics: serde_json::json!({"win_rate": 0.2}),
            confidence: 0.9,
            auto_applied: true,
            post_metrics: None,
            effectiveness: Effectiveness::Pending,
            measured_at_ms: None,
            rolled_back: false,
            rollback_reason: None,
        };
        ks.add_adaptation(&adaptation).unwrap();
        assert_eq!(ks.get_pending_adaptations().unwrap().len(), 1);

        ks.finalize_adaptation("a1", &serde_json::json!({"win_rate": 0.5}), Effectiveness::Effective)
            .unwrap();
        assert!(ks.get_pending_adaptations().unwrap().is_empty());
        let loaded = ks.get_adaptation("a1").unwrap().unwrap();
        assert_eq!(loaded.effectiveness, Effectiveness::Effective);
        assert!(loaded.post_metrics.is_some());

        ks.record_rollback("a1", "harmful").unwrap();
        let loaded = ks.get_adaptation("a1").unwrap().unwrap();
        assert!(loaded.rolled_back);
    }

    #[test]
    fn finalize_is_write_once() {
        let ks = store();
        let mut adaptation = Adaptation {
            id: "a2".to_string(),
            ts_ms: now_ms(),
            insight_id: None,
            action: AdaptationAction::Favor,
            target: "SOL".to_string(),
            description: "favor SOL".to_string(),
            pre_metrics: serde_json::Value::Null,
            confidence: 0.85,
            auto_applied: true,
            post_metrics: None,
            effectiveness: Effectiveness::Pending,
            measured_at_ms: None,
            rolled_back: false,
            rollback_reason: None,
        };
        adaptation.pre_metrics = serde_json::json!({});
        ks.add_adaptation(&adaptation).unwrap();

        ks.finalize_adaptation("a2", &serde_json::json!({}), Effectiveness::Neutral)
            .unwrap();
        // A second finalize must not overwrite the first label.
        ks.finalize_adaptation("a2", &serde_json::json!({}), Effectiveness::Harmful)
            .unwrap();
        let loaded = ks.get_adaptation("a2").unwrap().unwrap();
        assert_eq!(loaded.effectiveness, Effectiveness::Neutral);
    }

    #[test]
    fn regime_rule_round_trip() {
        let ks = store();
        let rule = RegimeRule {
            rule_id: "r1".to_string(),
            description: "no trades while BTC is dumping".to_string(),
            condition: RuleCondition::BtcTrend { trend: BtcTrend::Down },
            action: RegimeAction::NoTrade,
            times_triggered: 0,
            estimated_saves: 0.0,
            active: true,
            created_at_ms: now_ms(),
        };
        ks.add_regime_rule(&rule).unwrap();
        ks.bump_rule_triggered("r1").unwrap();

        let rules = ks.get_active_rules().unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].times_triggered, 1);
        assert_eq!(rules[0].action, RegimeAction::NoTrade);

        ks.set_rule_active("r1", false).unwrap();
        assert!(ks.get_active_rules().unwrap().is_empty());
    }

    #[test]
    fn snapshots_round_trip_and_drop_expired() {
        let ks = store();
        let now = now_ms();
        let mk = |id: &str, valid_until: i64| TradeCondition {
            id: id.to_string(),
            symbol: "BTC".to_string(),
            direction: crate::models::Direction::Long,
            trigger_price: 50_000.0,
            trigger_rel: crate::models::TriggerRel::Above,
            stop_loss_pct: 0.02,
            take_profit_pct: 0.01,
            size_usd: 50.0,
            strategy_id: "llm".to_string(),
            pattern_id: None,
            reasoning: String::new(),
            created_at_ms: now,
            valid_until_ms: valid_until,
        };
        ks.save_conditions_snapshot(&[mk("live", now + 60_000), mk("dead", now - 1)])
            .unwrap();
        let restored = ks.load_conditions_snapshot(now).unwrap();
        assert_eq!(restored.len(), 1);
        assert_eq!(restored[0].id, "live");
    }
}
