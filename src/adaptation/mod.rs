//! Insight -> knowledge mutation, behind confidence/evidence/cooldown
//! guards. Also owns the reverse mutations used for rollback.

use crate::config::LearningConfig;
use crate::knowledge::KnowledgeStore;
use crate::metrics::Metrics;
use crate::models::{
    Adaptation, AdaptationAction, CoinStatus, Effectiveness, Insight, RegimeAction, RegimeRule,
    RuleCondition, TradingError, TradingResult,
};
use crate::utils::time::{now_ms, HOUR_MS};
use std::sync::Arc;
use tracing::{info, warn};

/// Per-action application thresholds.
#[derive(Debug, Clone, Copy)]
pub struct Guard {
    pub min_confidence: f64,
    pub min_trades: u32,
}

pub fn guard_for(action: AdaptationAction) -> Option<Guard> {
    use AdaptationAction::*;
    let guard = match action {
        Blacklist | DeactivatePattern => Guard {
            min_confidence: 0.85,
            min_trades: 5,
        },
        Favor => Guard {
            min_confidence: 0.80,
            min_trades: 5,
        },
        Reduce => Guard {
            min_confidence: 0.60,
            min_trades: 5,
        },
        CreateTimeRule | CreateRegimeRule => Guard {
            min_confidence: 0.75,
            min_trades: 10,
        },
        // Not insight-driven: unblacklist/activate arrive via rollback or
        // the operator, and rollback itself is never guarded.
        Unblacklist | ActivatePattern | Rollback => return None,
    };
    Some(guard)
}

#[derive(Clone)]
pub struct AdaptationEngine {
    knowledge: KnowledgeStore,
    config: LearningConfig,
    metrics: Arc<Metrics>,
}

impl AdaptationEngine {
    pub fn new(knowledge: KnowledgeStore, config: LearningConfig, metrics: Arc<Metrics>) -> Self {
        Self {
            knowledge,
            config,
            metrics,
        }
    }

    pub fn knowledge(&self) -> &KnowledgeStore {
        &self.knowledge
    }

    /// Apply a batch of insights; returns how many produced adaptations.
    pub fn apply_insights<'a>(
        &self,
        insights: impl Iterator<Item = (&'a str, &'a Insight)>,
    ) -> usize {
        let mut applied = 0;
        for (insight_id, insight) in insights {
            match self.apply_insight(insight_id, insight) {
                Ok(true) => applied += 1,
                Ok(false) => {}
                Err(e) => warn!("🔧 Insight application failed: {}", e),
            }
        }
        applied
    }

    /// Guard, cool down, capture pre-metrics, mutate, record. Skips are
    /// logged at INFO so operators can see why nothing happened.
    pub fn apply_insight(&self, insight_id: &str, insight: &Insight) -> TradingResult<bool> {
        let Some(action) = AdaptationAction::parse(&insight.suggested_action) else {
            info!(
                "🔧 Skipping insight '{}': unknown action {}",
                insight.title, insight.suggested_action
            );
            self.metrics.adaptations_skipped_total.inc();
            return Ok(false);
        };

        let Some(guard) = guard_for(action) else {
            info!("🔧 Skipping insight '{}': {} is not insight-driven", insight.title, action);
            self.metrics.adaptations_skipped_total.inc();
            return Ok(false);
        };

        if insight.evidence.trades < guard.min_trades {
            info!(
                "🔧 Skipping {} on '{}': evidence {} trades < {}",
                action, insight.title, insight.evidence.trades, guard.min_trades
            );
            self.metrics.adaptations_skipped_total.inc();
            return Ok(false);
        }
        if insight.confidence < guard.min_confidence {
            info!(
                "🔧 Skipping {} on '{}': confidence {:.2} < {:.2}",
                action, insight.title, insight.confidence, guard.min_confidence
            );
            self.metrics.adaptations_skipped_total.inc();
            return Ok(false);
        }

        let Some(target) = target_of(action, insight) else {
            info!("🔧 Skipping {}: no usable target in evidence", action);
            self.metrics.adaptations_skipped_total.inc();
            return Ok(false);
        };

        if self.in_cooldown(&target)? {
            info!("🔧 Skipping {} on {}: cooldown active", action, target);
            self.metrics.adaptations_skipped_total.inc();
            return Ok(false);
        }

        let pre_metrics = self.capture_metrics(&target)?;
        self.mutate(action, &target, insight)?;

        let adaptation = Adaptation {
            id: uuid::Uuid::new_v4().to_string(),
            ts_ms: now_ms(),
            insight_id: Some(insight_id.to_string()),
            action,
            target: target.clone(),
            description: format!("{}: {}", insight.title, insight.description),
            pre_metrics,
            confidence: insight.confidence,
            auto_applied: true,
            post_metrics: None,
            effectiveness: Effectiveness::Pending,
            measured_at_ms: None,
            rolled_back: false,
            rollback_reason: None,
        };
        self.knowledge.add_adaptation(&adaptation)?;
        self.metrics.adaptations_applied_total.inc();
        info!("🔧 Applied {} on {} (confidence {:.2})", action, target, insight.confidence);
        Ok(true)
    }

    fn in_cooldown(&self, target: &str) -> TradingResult<bool> {
        let cooldown_ms = self.config.adaptation_cooldown_h as i64 * HOUR_MS;
        let cutoff = now_ms() - cooldown_ms;
        let recent = self.knowledge.get_adaptations_for_target(target)?;
        Ok(recent.iter().any(|a| a.ts_ms >= cutoff && !a.rolled_back))
    }

    /// Snapshot of the target's current stats, written as pre_metrics.
    pub fn capture_metrics(&self, target: &str) -> TradingResult<serde_json::Value> {
        if let Some(score) = self.knowledge.get_coin_score(target)? {
            return Ok(serde_json::json!({
                "kind": "coin",
                "trades": score.trades,
                "win_rate": score.win_rate,
                "total_pnl": score.total_pnl,
                "status": score.status.to_string(),
            }));
        }
        if let Some(pattern) = self.knowledge.get_pattern(target)? {
            return Ok(serde_json::json!({
                "kind": "pattern",
                "trades": pattern.wins + pattern.losses,
                "win_rate": if pattern.wins + pattern.losses > 0 {
                    pattern.wins as f64 / (pattern.wins + pattern.losses) as f64
                } else { 0.0 },
                "total_pnl": pattern.total_pnl,
                "confidence": pattern.confidence,
            }));
        }
        Ok(serde_json::json!({ "kind": "other" }))
    }

    fn mutate(&self, action: AdaptationAction, target: &str, insight: &Insight) -> TradingResult<()> {
        use AdaptationAction::*;
        match action {
            Blacklist => self
                .knowledge
                .set_coin_status(target, CoinStatus::Blacklisted, Some(&insight.title)),
            Unblacklist => self.knowledge.set_coin_status(target, CoinStatus::Normal, None),
            Favor => self.knowledge.set_coin_status(target, CoinStatus::Favored, None),
            Reduce => self.knowledge.set_coin_status(target, CoinStatus::Reduced, None),
            DeactivatePattern => self.knowledge.set_pattern_active(target, false),
            ActivatePattern => self.knowledge.set_pattern_active(target, true),
            CreateTimeRule => {
                let hours = insight
                    .evidence
                    .hours
                    .as_ref()
                    .filter(|h| !h.is_empty())
                    .ok_or_else(|| {
                        TradingError::DataError("time rule without hours evidence".to_string())
                    })?;
                let start = hours.iter().copied().min().unwrap_or(0);
                let end = hours.iter().copied().max().unwrap_or(23);
                self.knowledge.add_regime_rule(&RegimeRule {
                    rule_id: target.to_string(),
                    description: insight.title.clone(),
                    condition: RuleCondition::HourRange { start, end },
                    action: rule_action_for(insight),
                    times_triggered: 0,
                    estimated_saves: 0.0,
                    active: true,
                    created_at_ms: now_ms(),
                })
            }
            CreateRegimeRule => {
                let condition = regime_condition_for(insight).ok_or_else(|| {
                    TradingError::DataError(format!(
                        "no regime condition derivable from insight type '{}'",
                        insight.insight_type
                    ))
                })?;
                self.knowledge.add_regime_rule(&RegimeRule {
                    rule_id: target.to_string(),
                    description: insight.title.clone(),
                    condition,
                    action: rule_action_for(insight),
                    times_triggered: 0,
                    estimated_saves: 0.0,
                    active: true,
                    created_at_ms: now_ms(),
                })
            }
            Rollback => Err(TradingError::DataError(
                "rollback is not an insight action".to_string(),
            )),
        }
    }

    /// Reverse a previously-applied adaptation and record the rollback.
    /// Used by the effectiveness monitor (harmful label) and the operator.
    pub fn rollback(&self, adaptation: &Adaptation, reason: &str) -> TradingResult<()> {
        use AdaptationAction::*;
        match adaptation.action {
            Blacklist => {
                self.knowledge
                    .set_coin_status(&adaptation.target, CoinStatus::Normal, None)?
            }
            Favor | Reduce => {
                self.knowledge
                    .set_coin_status(&adaptation.target, CoinStatus::Normal, None)?
            }
            Unblacklist => self.knowledge.set_coin_status(
                &adaptation.target,
                CoinStatus::Blacklisted,
                Some(reason),
            )?,
            DeactivatePattern => self.knowledge.set_pattern_active(&adaptation.target, true)?,
            ActivatePattern => self.knowledge.set_pattern_active(&adaptation.target, false)?,
            CreateTimeRule | CreateRegimeRule => {
                self.knowledge.set_rule_active(&adaptation.target, false)?
            }
            Rollback => {
                return Err(TradingError::DataError(
                    "cannot roll back a rollback".to_string(),
                ))
            }
        }

        self.knowledge.record_rollback(&adaptation.id, reason)?;
        self.knowledge.add_adaptation(&Adaptation {
            id: uuid::Uuid::new_v4().to_string(),
            ts_ms: now_ms(),
            insight_id: None,
            action: AdaptationAction::Rollback,
            target: adaptation.id.clone(),
            description: format!("rollback of {} on {}: {}", adaptation.action, adaptation.target, reason),
            pre_metrics: adaptation.post_metrics.clone().unwrap_or(serde_json::Value::Null),
            confidence: 1.0,
            auto_applied: true,
            post_metrics: None,
            effectiveness: Effectiveness::Pending,
            measured_at_ms: None,
            rolled_back: false,
            rollback_reason: None,
        })?;
        self.metrics.rollbacks_total.inc();
        warn!(
            "↩️ Rolled back {} on {}: {}",
            adaptation.action, adaptation.target, reason
        );
        Ok(())
    }
}

fn rule_action_for(insight: &Insight) -> RegimeAction {
    if insight.category == "problem" {
        RegimeAction::NoTrade
    } else {
        RegimeAction::ReduceSize
    }
}

/// Deterministic mapping from insight type to a regime predicate. Unknown
/// types skip the rule rather than guessing.
fn regime_condition_for(insight: &Insight) -> Option<RuleCondition> {
    let t = insight.insight_type.to_lowercase();
    if t.contains("weekend") {
        Some(RuleCondition::Weekend)
    } else if t.contains("btc_down") || t.contains("downtrend") {
        Some(RuleCondition::BtcTrend {
            trend: crate::models::BtcTrend::Down,
        })
    } else if t.contains("btc_up") || t.contains("uptrend") {
        Some(RuleCondition::BtcTrend {
            trend: crate::models::BtcTrend::Up,
        })
    } else {
        None
    }
}

fn target_of(action: AdaptationAction, insight: &Insight) -> Option<String> {
    use AdaptationAction::*;
    match action {
        Blacklist | Unblacklist | Favor | Reduce => insight.evidence.symbol.clone(),
        DeactivatePattern | ActivatePattern => insight.evidence.pattern_id.clone(),
        CreateTimeRule => insight.evidence.hours.as_ref().map(|hours| {
            let start = hours.iter().min().copied().unwrap_or(0);
            let end = hours.iter().max().copied().unwrap_or(23);
            format!("time_rule:{:02}-{:02}", start, end)
        }),
        CreateRegimeRule => Some(format!("regime_rule:{}", insight.insight_type)),
        Rollback => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Database;

    fn engine() -> AdaptationEngine {
        let knowledge = KnowledgeStore::new(Database::open_in_memory().unwrap()).unwrap();
        AdaptationEngine::new(
            knowledge,
            crate::config::AppConfig::default().learning,
            Metrics::new(),
        )
    }

    fn insight(action: &str, symbol: Option<&str>, trades: u32, confidence: f64) -> Insight {
        Insight {
            insight_type: "symbol_performance".to_string(),
            category: "problem".to_string(),
            title: format!("{} {}", action, symbol.unwrap_or("?")),
            description: "test insight".to_string(),
            evidence: crate::models::InsightEvidence {
                trades,
                win_rate: Some(0.2),
                pnl: Some(-15.0),
                pattern_id: None,
                symbol: symbol.map(|s| s.to_string()),
                hours: None,
            },
            suggested_action: action.to_string(),
            confidence,
        }
    }

    #[test]
    fn blacklist_applies_and_mutates_knowledge() {
        let engine = engine();
        let applied = engine
            .apply_insight("i1", &insight("BLACKLIST", Some("DOGE"), 10, 0.9))
            .unwrap();
        assert!(applied);
        assert!(engine.knowledge().is_blacklisted("DOGE"));

        let pending = engine.knowledge().get_pending_adaptations().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].action, AdaptationAction::Blacklist);
        assert!(pending[0].confidence >= 0.85);
    }

    #[test]
    fn guards_reject_thin_evidence_and_low_confidence() {
        let engine = engine();
        assert!(!engine
            .apply_insight("i1", &insight("BLACKLIST", Some("DOGE"), 3, 0.9))
            .unwrap());
        assert!(!engine
            .apply_insight("i2", &insight("BLACKLIST", Some("DOGE"), 10, 0.5))
            .unwrap());
        assert!(!engine.knowledge().is_blacklisted("DOGE"));
    }

    #[test]
    fn cooldown_makes_reapplication_a_noop() {
        let engine = engine();
        assert!(engine
            .apply_insight("i1", &insight("BLACKLIST", Some("DOGE"), 10, 0.9))
            .unwrap());
        // Same action, same target, inside the cooldown window.
        assert!(!engine
            .apply_insight("i2", &insight("BLACKLIST", Some("DOGE"), 10, 0.9))
            .unwrap());
        assert_eq!(
            engine
                .knowledge()
                .get_adaptations_for_target("DOGE")
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn time_rule_is_built_from_hours_evidence() {
        let engine = engine();
        let mut i = insight("CREATE_TIME_RULE", None, 15, 0.8);
        i.evidence.hours = Some(vec![2, 3, 4]);
        assert!(engine.apply_insight("i1", &i).unwrap());

        let rules = engine.knowledge().get_active_rules().unwrap();
        assert_eq!(rules.len(), 1);
        assert!(matches!(
            rules[0].condition,
            RuleCondition::HourRange { start: 2, end: 4 }
        ));
        assert_eq!(rules[0].action, RegimeAction::NoTrade);
    }

    #[test]
    fn rollback_reverses_a_blacklist() {
        let engine = engine();
        engine
            .apply_insight("i1", &insight("BLACKLIST", Some("DOGE"), 10, 0.9))
            .unwrap();
        let adaptation = engine
            .knowledge()
            .get_adaptations_for_target("DOGE")
            .unwrap()
            .remove(0);

        engine.rollback(&adaptation, "harmful").unwrap();
        assert!(!engine.knowledge().is_blacklisted("DOGE"));

        let reloaded = engine.knowledge().get_adaptation(&adaptation.id).unwrap().unwrap();
        assert!(reloaded.rolled_back);
        // A ROLLBACK row referencing the original was appended.
        let rollback_rows = engine
            .knowledge()
            .get_adaptations_for_target(&adaptation.id)
            .unwrap();
        assert_eq!(rollback_rows.len(), 1);
        assert_eq!(rollback_rows[0].action, AdaptationAction::Rollback);
    }

    #[test]
    fn unknown_action_is_skipped() {
        let engine = engine();
        assert!(!engine
            .apply_insight("i1", &insight("DO_SOMETHING", Some("BTC"), 10, 0.9))
            .unwrap());
    }
}
