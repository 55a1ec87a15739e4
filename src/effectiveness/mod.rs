//! Post-hoc measurement of adaptations. Pending rows are measured after
//! enough trades touch the target (or the age cap passes), labeled, and
//! harmful ones are reversed automatically.

use crate::adaptation::AdaptationEngine;
use crate::config::LearningConfig;
use crate::journal::Journal;
use crate::models::{Adaptation, AdaptationAction, Effectiveness, TradingResult};
use crate::orchestrator::HealthHandle;
use crate::utils::time::{now_ms, HOUR_MS};
use std::time::Duration;
use tracing::{debug, info, warn};

pub struct EffectivenessMonitor {
    journal: Journal,
    adapter: AdaptationEngine,
    config: LearningConfig,
    health: HealthHandle,
}

impl EffectivenessMonitor {
    pub fn new(
        journal: Journal,
        adapter: AdaptationEngine,
        config: LearningConfig,
        health: HealthHandle,
    ) -> Self {
        Self {
            journal,
            adapter,
            config,
            health,
        }
    }

    pub async fn run(self) {
        info!("📐 Effectiveness monitor started");
        let mut interval = tokio::time::interval(Duration::from_secs(300));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            match self.sweep_once() {
                Ok(measured) => {
                    self.health.ok();
                    if measured > 0 {
                        info!("📐 Measured {} adaptations", measured);
                    }
                }
                Err(e) => {
                    warn!("📐 Effectiveness sweep failed: {}", e);
                    self.health.error(&e.to_string());
                }
            }
        }
    }

    /// One pass over pending adaptations. Returns how many got a label.
    pub fn sweep_once(&self) -> TradingResult<usize> {
        let pending = self.adapter.knowledge().get_pending_adaptations()?;
        let mut measured = 0;
        for adaptation in pending {
            if self.measure(&adaptation)? {
                measured += 1;
            }
        }
        Ok(measured)
    }

    fn measure(&self, adaptation: &Adaptation) -> TradingResult<bool> {
        // Rollback rows record history; there is nothing to measure.
        if adaptation.action == AdaptationAction::Rollback {
            self.adapter.knowledge().finalize_adaptation(
                &adaptation.id,
                &serde_json::Value::Null,
                Effectiveness::Neutral,
            )?;
            return Ok(true);
        }

        let now = now_ms();
        let trades_on_target = self
            .journal
            .closed_count_for_target_since(&adaptation.target, adaptation.ts_ms)?;
        let age_ms = now - adaptation.ts_ms;
        let max_age_ms = self.config.effectiveness_max_age_h as i64 * HOUR_MS;

        if trades_on_target < self.config.effectiveness_min_trades && age_ms < max_age_ms {
            debug!(
                "📐 {} on {} not ripe ({} trades, {}h old)",
                adaptation.action,
                adaptation.target,
                trades_on_target,
                age_ms / HOUR_MS
            );
            return Ok(false);
        }

        let (post_trades, post_wins, post_pnl) = self
            .journal
            .target_metrics_since(&adaptation.target, adaptation.ts_ms)?;

        let pre_wr = adaptation
            .pre_metrics
            .get("win_rate")
            .and_then(|v| v.as_f64())
            .unwrap_or(0.0);
        let pre_pnl = adaptation
            .pre_metrics
            .get("total_pnl")
            .and_then(|v| v.as_f64())
            .unwrap_or(0.0);

        let post_wr = if post_trades > 0 {
            post_wins as f64 / post_trades as f64
        } else {
            0.0
        };

        let effectiveness = label(post_trades, post_wr - pre_wr, post_pnl, pre_pnl);

        let post_metrics = serde_json::json!({
            "trades": post_trades,
            "win_rate": post_wr,
            "pnl": post_pnl,
        });
        self.adapter
            .knowledge()
            .finalize_adaptation(&adaptation.id, &post_metrics, effectiveness)?;
        info!(
            "📐 {} on {} labeled {} ({} post trades, Δwr {:+.1}pp, post pnl {:+.2})",
            adaptation.action,
            adaptation.target,
            effectiveness,
            post_trades,
            (post_wr - pre_wr) * 100.0,
            post_pnl
        );

        if effectiveness == Effectiveness::Harmful {
            let reason = format!(
                "harmful after measurement: Δwr {:+.1}pp, post pnl {:+.2}",
                (post_wr - pre_wr) * 100.0,
                post_pnl
            );
            self.adapter.rollback(adaptation, &reason)?;
        }
        Ok(true)
    }
}

/// Label precedence: no-evidence neutral, harmful, highly effective,
/// small-change neutral, effective, then ineffective.
pub fn label(post_trades: u32, delta_wr: f64, post_pnl: f64, pre_pnl: f64) -> Effectiveness {
    if post_trades == 0 {
        return Effectiveness::Neutral;
    }
    let delta_wr_pp = delta_wr * 100.0;
    // Relative pnl threshold degenerates when pre_pnl is ~0; fall back to
    // an absolute dollar band there.
    let pnl_band = if pre_pnl.abs() > 1e-9 {
        0.10 * pre_pnl.abs()
    } else {
        1.0
    };

    if delta_wr_pp < -10.0 || post_pnl < -pnl_band {
        Effectiveness::Harmful
    } else if delta_wr_pp > 5.0 && post_pnl > 0.0 {
        Effectiveness::HighlyEffective
    } else if delta_wr_pp.abs() <= 2.0 && post_pnl.abs() <= pnl_band {
        Effectiveness::Neutral
    } else if delta_wr_pp > 0.0 || post_pnl > 0.0 {
        Effectiveness::Effective
    } else {
        Effectiveness::Ineffective
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_thresholds() {
        // No post trades: nothing to judge.
        assert_eq!(label(0, -0.2, 0.0, -15.0), Effectiveness::Neutral);
        // Big win-rate jump with positive pnl.
        assert_eq!(label(10, 0.08, 5.0, 10.0), Effectiveness::HighlyEffective);
        // Mild improvement.
        assert_eq!(label(10, 0.04, 2.0, 10.0), Effectiveness::Effective);
        // Tiny move either way.
        assert_eq!(label(10, 0.01, 0.05, 10.0), Effectiveness::Neutral);
        // Clear regression.
        assert_eq!(label(10, -0.15, 1.0, 10.0), Effectiveness::Harmful);
        assert_eq!(label(10, 0.0, -5.0, 10.0), Effectiveness::Harmful);
        // Moderate regression that is not harmful.
        assert_eq!(label(10, -0.05, -0.5, 10.0), Effectiveness::Ineffective);
    }

    #[test]
    fn zero_pre_pnl_uses_absolute_band() {
        assert_eq!(label(10, 0.0, 0.5, 0.0), Effectiveness::Neutral);
        assert_eq!(label(10, 0.0, -1.5, 0.0), Effectiveness::Harmful);
    }
}
