//! Per-trade arithmetic learning. Runs after every closed trade; no LLM,
//! no blocking beyond the store writes.

use crate::config::LearningConfig;
use crate::journal::Journal;
use crate::knowledge::KnowledgeStore;
use crate::models::{
    Adaptation, AdaptationAction, ClosedTrade, CoinScore, CoinStatus, Effectiveness, Trend,
    TradingResult,
};
use crate::reflection::ReflectionScheduler;
use crate::utils::time::now_ms;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct QuickUpdate {
    knowledge: KnowledgeStore,
    journal: Journal,
    config: LearningConfig,
    scheduler: Arc<ReflectionScheduler>,
}

impl QuickUpdate {
    pub fn new(
        knowledge: KnowledgeStore,
        journal: Journal,
        config: LearningConfig,
        scheduler: Arc<ReflectionScheduler>,
    ) -> Self {
        Self {
            knowledge,
            journal,
            config,
            scheduler,
        }
    }

    pub fn on_trade_closed(&self, trade: &ClosedTrade) -> TradingResult<()> {
        let symbol = &trade.position.symbol;
        let won = trade.pnl_usd > 0.0;

        let mut score = self
            .knowledge
            .get_coin_score(symbol)?
            .unwrap_or_else(|| CoinScore::new(symbol));

        apply_trade(&mut score, won, trade.pnl_usd);
        score.trend = self.compute_trend(symbol)?;
        score.last_updated_ms = now_ms();

        let previous_status = score.status;
        score.status = next_status(&score, &self.config);
        if score.status == CoinStatus::Blacklisted && previous_status != CoinStatus::Blacklisted {
            score.blacklist_reason = Some(format!(
                "win rate {:.0}% over {} trades, pnl {:.2}",
                score.win_rate * 100.0,
                score.trades,
                score.total_pnl
            ));
        } else if score.status != CoinStatus::Blacklisted {
            score.blacklist_reason = None;
        }

        self.knowledge.upsert_coin_score(&score)?;

        if score.status != previous_status {
            info!(
                "📈 {} status {} -> {} (wr {:.0}%, pnl {:+.2})",
                symbol,
                previous_status,
                score.status,
                score.win_rate * 100.0,
                score.total_pnl
            );
            if score.status == CoinStatus::Blacklisted {
                self.record_blacklist_adaptation(&score)?;
            }
        }

        if let Some(pattern_id) = &trade.position.pattern_id {
            if let Err(e) = self.update_pattern(pattern_id, won, trade.pnl_usd) {
                warn!("📈 Pattern update failed for {}: {}", pattern_id, e);
            }
        }

        self.scheduler.on_trade_closed();
        Ok(())
    }

    /// Compare the last five closed trades against the five before them.
    fn compute_trend(&self, symbol: &str) -> TradingResult<Trend> {
        let recent = self.journal.recent_closed_for_symbol(symbol, 10)?;
        if recent.len() < 10 {
            return Ok(Trend::Stable);
        }
        let newer: f64 = recent[..5].iter().filter_map(|t| t.pnl_usd).sum::<f64>() / 5.0;
        let older: f64 = recent[5..].iter().filter_map(|t| t.pnl_usd).sum::<f64>() / 5.0;
        Ok(if newer > older + 1e-9 {
            Trend::Improving
        } else if newer + 1e-9 < older {
            Trend::Declining
        } else {
            Trend::Stable
        })
    }

    fn update_pattern(&self, pattern_id: &str, won: bool, pnl: f64) -> TradingResult<()> {
        let Some(mut pattern) = self.knowledge.get_pattern(pattern_id)? else {
            debug!("📈 Trade referenced unknown pattern {}", pattern_id);
            return Ok(());
        };
        pattern.times_used += 1;
        if won {
            pattern.wins += 1;
        } else {
            pattern.losses += 1;
        }
        pattern.total_pnl += pnl;
        pattern.confidence = pattern_confidence(pattern.wins, pattern.wins + pattern.losses);
        pattern.last_used_at_ms = Some(now_ms());
        self.knowledge.update_pattern_stats(&pattern)
    }

    fn record_blacklist_adaptation(&self, score: &CoinScore) -> TradingResult<()> {
        let adaptation = Adaptation {
            id: uuid::Uuid::new_v4().to_string(),
            ts_ms: now_ms(),
            insight_id: None,
            action: AdaptationAction::Blacklist,
            target: score.symbol.clone(),
            description: format!(
                "threshold blacklist: {}",
                score.blacklist_reason.as_deref().unwrap_or("")
            ),
            pre_metrics: serde_json::json!({
                "trades": score.trades,
                "win_rate": score.win_rate,
                "total_pnl": score.total_pnl,
            }),
            confidence: 1.0,
            auto_applied: true,
            post_metrics: None,
            effectiveness: Effectiveness::Pending,
            measured_at_ms: None,
            rolled_back: false,
            rollback_reason: None,
        };
        self.knowledge.add_adaptation(&adaptation)
    }
}

/// Counter and average maintenance for one more closed trade. Exact
/// incremental updates; nothing is re-scanned.
fn apply_trade(score: &mut CoinScore, won: bool, pnl: f64) {
    if won {
        let winner_sum = score.avg_winner * score.wins as f64 + pnl;
        score.wins += 1;
        score.avg_winner = winner_sum / score.wins as f64;
    } else {
        let loser_sum = score.avg_loser * score.losses as f64 + pnl;
        score.losses += 1;
        score.avg_loser = loser_sum / score.losses as f64;
    }
    score.trades = score.wins + score.losses;
    score.total_pnl += pnl;
    score.avg_pnl = score.total_pnl / score.trades as f64;
    score.win_rate = score.wins as f64 / score.trades as f64;
}

/// Status thresholds. Applies only once enough trades exist; promotion and
/// demotion share the same composite predicate.
fn next_status(score: &CoinScore, config: &LearningConfig) -> CoinStatus {
    if score.trades < config.min_trades_for_adaptation {
        return score.status;
    }
    if score.win_rate < config.blacklist_wr && score.total_pnl < 0.0 {
        CoinStatus::Blacklisted
    } else if score.win_rate < config.reduced_wr {
        CoinStatus::Reduced
    } else if score.win_rate > config.favored_wr && score.total_pnl > 0.0 {
        CoinStatus::Favored
    } else {
        CoinStatus::Normal
    }
}

/// Bayesian shrinkage toward 0.5 with pseudo-count alpha = 5.
pub fn pattern_confidence(wins: u32, trades: u32) -> f64 {
    const ALPHA: f64 = 5.0;
    (wins as f64 + ALPHA) / (trades as f64 + 2.0 * ALPHA)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;

    fn learning() -> LearningConfig {
        AppConfig::default().learning
    }

    #[test]
    fn coin_score_arithmetic_stays_consistent() {
        let mut score = CoinScore::new("SOL");
        for pnl in [1.0, 1.0, -2.0, 3.0, -1.0] {
            apply_trade(&mut score, pnl > 0.0, pnl);
            assert_eq!(score.trades, score.wins + score.losses);
            assert!((score.win_rate - score.wins as f64 / score.trades as f64).abs() < 1e-9);
        }
        assert_eq!(score.trades, 5);
        assert_eq!(score.wins, 3);
        assert!((score.total_pnl - 2.0).abs() < 1e-9);
        assert!((score.avg_winner - 5.0 / 3.0).abs() < 1e-9);
        assert!((score.avg_loser + 1.5).abs() < 1e-9);
    }

    #[test]
    fn status_gate_needs_min_trades() {
        let config = learning();
        let mut score = CoinScore::new("APT");
        // Four losses: still below the adaptation gate.
        for _ in 0..4 {
            apply_trade(&mut score, false, -1.0);
        }
        assert_eq!(next_status(&score, &config), CoinStatus::Unknown);

        apply_trade(&mut score, false, -1.0);
        assert_eq!(next_status(&score, &config), CoinStatus::Blacklisted);
    }

    #[test]
    fn promote_then_demote_on_negative_pnl() {
        let config = learning();
        let mut score = CoinScore::new("SOL");
        // Six winners of +1 promote to FAVORED.
        for _ in 0..6 {
            apply_trade(&mut score, true, 1.0);
        }
        score.status = next_status(&score, &config);
        assert_eq!(score.status, CoinStatus::Favored);

        // Four losers of -2: win rate 60% but total pnl -2, so the
        // composite predicate demotes to NORMAL.
        for _ in 0..4 {
            apply_trade(&mut score, false, -2.0);
        }
        assert!((score.win_rate - 0.6).abs() < 1e-9);
        assert!(score.total_pnl < 0.0);
        score.status = next_status(&score, &config);
        assert_eq!(score.status, CoinStatus::Normal);
    }

    #[test]
    fn reduced_band_sits_between_blacklist_and_normal() {
        let config = learning();
        let mut score = CoinScore::new("ADA");
        // 2 wins / 3 losses = 40% with positive pnl: REDUCED.
        for pnl in [5.0, 5.0, -1.0, -1.0, -1.0] {
            apply_trade(&mut score, pnl > 0.0, pnl);
        }
        assert_eq!(next_status(&score, &config), CoinStatus::Reduced);
    }

    #[test]
    fn confidence_shrinks_toward_half() {
        assert!((pattern_confidence(0, 0) - 0.5).abs() < 1e-9);
        // 3/3 winners with alpha=5: (3+5)/(3+10)
        assert!((pattern_confidence(3, 3) - 8.0 / 13.0).abs() < 1e-9);
        // Large samples converge on the empirical rate.
        assert!((pattern_confidence(900, 1000) - 905.0 / 1010.0).abs() < 1e-9);
    }
}
