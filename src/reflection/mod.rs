//! Periodic deep reflection: aggregate the recent journal, ask the LLM for
//! insights, hand them to the adaptation engine. Runs on its own task so
//! the tick path never waits on it.

use crate::adaptation::AdaptationEngine;
use crate::config::LearningConfig;
use crate::journal::{Journal, JournalQuery};
use crate::llm::{extract_json, ChatClient};
use crate::metrics::Metrics;
use crate::models::{ExitReason, Insight, JournalEntry, TradingError, TradingResult};
use crate::orchestrator::HealthHandle;
use crate::utils::time::{now_ms, HOUR_MS};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{info, warn};

/// Shared trigger state between QuickUpdate and the reflection task.
pub struct ReflectionScheduler {
    trades_since: AtomicU32,
    last_reflection_ms: AtomicI64,
    notify: Notify,
}

impl ReflectionScheduler {
    pub fn new(last_reflection_ms: i64, trades_since: u32) -> Arc<Self> {
        Arc::new(Self {
            trades_since: AtomicU32::new(trades_since),
            last_reflection_ms: AtomicI64::new(last_reflection_ms),
            notify: Notify::new(),
        })
    }

    pub fn on_trade_closed(&self) {
        self.trades_since.fetch_add(1, Ordering::Relaxed);
        self.notify.notify_one();
    }

    /// Manual trigger from the operator API.
    pub fn force(&self) {
        self.trades_since
            .fetch_max(u32::MAX / 2, Ordering::Relaxed);
        self.notify.notify_one();
    }

    pub fn trades_since(&self) -> u32 {
        self.trades_since.load(Ordering::Relaxed)
    }

    pub fn last_reflection_ms(&self) -> i64 {
        self.last_reflection_ms.load(Ordering::Relaxed)
    }

    pub fn should_reflect(&self, config: &LearningConfig, now: i64) -> bool {
        let last = self.last_reflection_ms.load(Ordering::Relaxed);
        let elapsed = now - last;
        elapsed >= config.reflection_period_h as i64 * HOUR_MS
            || self.trades_since.load(Ordering::Relaxed) >= config.reflection_min_trades
    }

    pub fn mark_reflected(&self, now: i64) {
        self.last_reflection_ms.store(now, Ordering::Relaxed);
        self.trades_since.store(0, Ordering::Relaxed);
    }

    pub async fn wait(&self) {
        self.notify.notified().await;
    }
}

/// Arithmetic breakdowns fed into the reflection prompt.
#[derive(Debug, Default)]
pub struct TradeBreakdown {
    pub per_symbol: BTreeMap<String, AxisStats>,
    pub per_pattern: BTreeMap<String, AxisStats>,
    pub per_hour: BTreeMap<u8, AxisStats>,
    pub per_day: BTreeMap<u8, AxisStats>,
    pub per_regime: BTreeMap<String, AxisStats>,
    pub stop_exits: u32,
    pub target_exits: u32,
    /// Stopped trades whose +5m sample was back past entry in the trade's
    /// direction: the stop cost a winner.
    pub recoverable_stops: u32,
}

#[derive(Debug, Default, Clone)]
pub struct AxisStats {
    pub trades: u32,
    pub wins: u32,
    pub pnl: f64,
}

impl AxisStats {
    fn add(&mut self, won: bool, pnl: f64) {
        self.trades += 1;
        if won {
            self.wins += 1;
        }
        self.pnl += pnl;
    }

    pub fn win_rate(&self) -> f64 {
        if self.trades == 0 {
            0.0
        } else {
            self.wins as f64 / self.trades as f64
        }
    }
}

pub fn compute_breakdown(trades: &[JournalEntry]) -> TradeBreakdown {
    let mut breakdown = TradeBreakdown::default();
    for trade in trades {
        let Some(pnl) = trade.pnl_usd else { continue };
        let won = pnl > 0.0;

        breakdown
            .per_symbol
            .entry(trade.symbol.clone())
            .or_default()
            .add(won, pnl);
        if let Some(pattern) = &trade.pattern_id {
            breakdown
                .per_pattern
                .entry(pattern.clone())
                .or_default()
                .add(won, pnl);
        }
        breakdown
            .per_hour
            .entry(trade.hour_of_day)
            .or_default()
            .add(won, pnl);
        breakdown
            .per_day
            .entry(trade.day_of_week)
            .or_default()
            .add(won, pnl);

        let regime = if trade.btc_change_24h > 1.0 {
            "btc_up"
        } else if trade.btc_change_24h < -1.0 {
            "btc_down"
        } else {
            "btc_sideways"
        };
        breakdown
            .per_regime
            .entry(regime.to_string())
            .or_default()
            .add(won, pnl);
        if trade.day_of_week >= 5 {
            breakdown
                .per_regime
                .entry("weekend".to_string())
                .or_default()
                .add(won, pnl);
        }

        match trade.exit_reason {
            Some(ExitReason::StopLoss) => {
                breakdown.stop_exits += 1;
                if let Some(after) = trade.price_after_5m {
                    let recovered = match trade.direction {
                        crate::models::Direction::Long => after > trade.entry_price,
                        crate::models::Direction::Short => after < trade.entry_price,
                    };
                    if recovered {
                        breakdown.recoverable_stops += 1;
                    }
                }
            }
            Some(ExitReason::TakeProfit) => breakdown.target_exits += 1,
            _ => {}
        }
    }
    breakdown
}

#[derive(Debug, serde::Deserialize)]
struct ReflectionResponse {
    summary: String,
    insights: Vec<serde_json::Value>,
}

pub struct ReflectionEngine {
    journal: Journal,
    adapter: AdaptationEngine,
    chat: Arc<dyn ChatClient>,
    config: LearningConfig,
    scheduler: Arc<ReflectionScheduler>,
    metrics: Arc<Metrics>,
    health: HealthHandle,
}

impl ReflectionEngine {
    pub fn new(
        journal: Journal,
        adapter: AdaptationEngine,
        chat: Arc<dyn ChatClient>,
        config: LearningConfig,
        scheduler: Arc<ReflectionScheduler>,
        metrics: Arc<Metrics>,
        health: HealthHandle,
    ) -> Self {
        Self {
            journal,
            adapter,
            chat,
            config,
            scheduler,
            metrics,
            health,
        }
    }

    /// Reflection loop. Cycles run one at a time; triggers arriving while
    /// a cycle is in flight coalesce into the next wakeup check.
    pub async fn run(self) {
        info!("🪞 Reflection engine started");
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = self.scheduler.wait() => {}
                _ = interval.tick() => {}
            }
            if !self.scheduler.should_reflect(&self.config, now_ms()) {
                continue;
            }
            match self.reflect_once().await {
                Ok(applied) => {
                    self.health.ok();
                    if applied > 0 {
                        info!("🪞 Reflection applied {} adaptations", applied);
                    }
                }
                Err(e) => {
                    warn!("🪞 Reflection cycle failed: {}", e);
                    self.health.error(&e.to_string());
                }
            }
        }
    }

    /// One full cycle. Returns the number of adaptations applied.
    pub async fn reflect_once(&self) -> TradingResult<usize> {
        let started = std::time::Instant::now();
        let now = now_ms();
        let window_from = now - 24 * HOUR_MS;

        let trades = self.journal.query(&JournalQuery {
            since_ms: window_from,
            limit: Some(100),
            ..Default::default()
        })?;
        let closed: Vec<JournalEntry> =
            trades.into_iter().filter(|t| t.exit_ts_ms.is_some()).collect();

        let first_run = self.scheduler.last_reflection_ms() == 0;
        let min = if first_run {
            self.config.first_reflection_min_trades
        } else {
            1
        };
        if (closed.len() as u32) < min {
            return Ok(0);
        }

        let breakdown = compute_breakdown(&closed);
        let user_prompt = build_prompt(&closed, &breakdown);

        self.metrics.llm_calls_total.inc();
        let raw = match self
            .chat
            .complete(
                REFLECTION_SYSTEM_PROMPT,
                &user_prompt,
                Duration::from_secs(self.config.reflection_llm_timeout_s),
            )
            .await
        {
            Ok(raw) => raw,
            Err(e) => {
                self.metrics.llm_failures_total.inc();
                return Err(e);
            }
        };

        let parsed: ReflectionResponse = serde_json::from_str(&extract_json(&raw))
            .map_err(|e| TradingError::LlmError(format!("reflection decode: {}", e)))?;

        // Individually-malformed insights drop; the rest survive.
        let mut insights = Vec::new();
        for value in parsed.insights {
            match serde_json::from_value::<Insight>(value) {
                Ok(insight) => insights.push(insight),
                Err(e) => {
                    self.metrics.insights_dropped_total.inc();
                    warn!("🪞 Malformed insight dropped: {}", e);
                }
            }
        }

        let reflection_id = uuid::Uuid::new_v4().to_string();
        let insight_ids = self.adapter.knowledge().add_reflection(
            &reflection_id,
            window_from,
            now,
            closed.len() as u32,
            &parsed.summary,
            started.elapsed().as_millis() as i64,
            &insights,
        )?;

        let applied = self
            .adapter
            .apply_insights(insight_ids.iter().map(String::as_str).zip(insights.iter()));

        self.metrics.reflections_total.inc();
        self.scheduler.mark_reflected(now);
        info!(
            "🪞 Reflection complete: {} trades, {} insights, {} applied ({}ms)",
            closed.len(),
            insights.len(),
            applied,
            started.elapsed().as_millis()
        );
        Ok(applied)
    }
}

const REFLECTION_SYSTEM_PROMPT: &str = "You are the reflection module of an autonomous \
crypto paper-trading engine. You receive aggregated results of recent trades and respond \
with STRICT JSON only, no prose and no markdown fences, shaped as \
{\"summary\": string, \"insights\": [{\"type\": string, \"category\": \
\"problem\"|\"opportunity\"|\"observation\", \"title\": string, \"description\": string, \
\"evidence\": {\"trades\": int, \"win_rate\": number?, \"pnl\": number?, \"pattern_id\": \
string?, \"symbol\": string?, \"hours\": [int]?}, \"suggested_action\": string, \
\"confidence\": number}]}. Suggested actions: BLACKLIST, UNBLACKLIST, FAVOR, REDUCE, \
DEACTIVATE_PATTERN, ACTIVATE_PATTERN, CREATE_TIME_RULE, CREATE_REGIME_RULE.";

fn build_prompt(trades: &[JournalEntry], breakdown: &TradeBreakdown) -> String {
    let mut prompt = String::with_capacity(4096);
    prompt.push_str(&format!("Window: {} closed trades.\n\n", trades.len()));

    prompt.push_str("Per-symbol performance:\n");
    for (symbol, stats) in &breakdown.per_symbol {
        prompt.push_str(&format!(
            "  {}: {} trades, {:.0}% win rate, {:+.2} USD\n",
            symbol,
            stats.trades,
            stats.win_rate() * 100.0,
            stats.pnl
        ));
    }

    if !breakdown.per_pattern.is_empty() {
        prompt.push_str("\nPer-pattern performance:\n");
        for (pattern, stats) in &breakdown.per_pattern {
            prompt.push_str(&format!(
                "  {}: {} trades, {:.0}% win rate, {:+.2} USD\n",
                pattern,
                stats.trades,
                stats.win_rate() * 100.0,
                stats.pnl
            ));
        }
    }

    prompt.push_str("\nPer-hour (UTC) win rates:\n");
    for (hour, stats) in &breakdown.per_hour {
        prompt.push_str(&format!(
            "  {:02}h: {} trades, {:.0}%\n",
            hour,
            stats.trades,
            stats.win_rate() * 100.0
        ));
    }

    prompt.push_str("\nPer-day win rates (0=Mon):\n");
    for (day, stats) in &breakdown.per_day {
        prompt.push_str(&format!(
            "  day {}: {} trades, {:.0}%\n",
            day,
            stats.trades,
            stats.win_rate() * 100.0
        ));
    }

    prompt.push_str("\nRegime performance:\n");
    for (regime, stats) in &breakdown.per_regime {
        prompt.push_str(&format!(
            "  {}: {} trades, {:.0}% win rate, {:+.2} USD\n",
            regime,
            stats.trades,
            stats.win_rate() * 100.0,
            stats.pnl
        ));
    }

    prompt.push_str(&format!(
        "\nExits: {} stops, {} targets, {} stops recovered within 5 minutes.\n",
        breakdown.stop_exits, breakdown.target_exits, breakdown.recoverable_stops
    ));
    prompt.push_str("\nEmit insights with evidence and confidence.");
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Direction;

    fn entry(symbol: &str, pnl: f64, hour: u8, day: u8, reason: ExitReason) -> JournalEntry {
        JournalEntry {
            trade_id: uuid::Uuid::new_v4().to_string(),
            condition_id: "c".to_string(),
            symbol: symbol.to_string(),
            direction: Direction::Long,
            size_usd: 100.0,
            strategy_id: "llm".to_string(),
            pattern_id: Some("breakout".to_string()),
            entry_price: 100.0,
            entry_ts_ms: 2_100_000_000_000,
            market_regime: String::new(),
            btc_change_24h: 2.0,
            hour_of_day: hour,
            day_of_week: day,
            exit_price: Some(100.0 + pnl),
            exit_ts_ms: Some(2_100_000_010_000),
            exit_reason: Some(reason),
            pnl_usd: Some(pnl),
            pnl_pct: Some(pnl / 100.0),
            duration_ms: Some(10_000),
            price_after_1m: None,
            price_after_5m: None,
            price_after_15m: None,
        }
    }

    #[test]
    fn breakdown_aggregates_every_axis() {
        let trades = vec![
            entry("BTC", 5.0, 9, 1, ExitReason::TakeProfit),
            entry("BTC", -2.0, 9, 1, ExitReason::StopLoss),
            entry("ETH", 3.0, 14, 5, ExitReason::TakeProfit),
        ];
        let breakdown = compute_breakdown(&trades);

        assert_eq!(breakdown.per_symbol["BTC"].trades, 2);
        assert!((breakdown.per_symbol["BTC"].win_rate() - 0.5).abs() < 1e-9);
        assert_eq!(breakdown.per_pattern["breakout"].trades, 3);
        assert_eq!(breakdown.per_hour[&9].trades, 2);
        assert_eq!(breakdown.per_day[&5].trades, 1);
        assert_eq!(breakdown.per_regime["btc_up"].trades, 3);
        assert_eq!(breakdown.per_regime["weekend"].trades, 1);
        assert_eq!(breakdown.stop_exits, 1);
        assert_eq!(breakdown.target_exits, 2);
    }

    #[test]
    fn recoverable_stop_needs_direction_aware_recovery() {
        let mut stopped = entry("BTC", -2.0, 9, 1, ExitReason::StopLoss);
        stopped.price_after_5m = Some(101.0); // back above entry for a long
        let breakdown = compute_breakdown(&[stopped]);
        assert_eq!(breakdown.recoverable_stops, 1);

        let mut stopped_short = entry("BTC", -2.0, 9, 1, ExitReason::StopLoss);
        stopped_short.direction = Direction::Short;
        stopped_short.price_after_5m = Some(101.0); // against the short
        let breakdown = compute_breakdown(&[stopped_short]);
        assert_eq!(breakdown.recoverable_stops, 0);
    }

    #[test]
    fn scheduler_triggers_on_count_or_time() {
        let config = crate::config::AppConfig::default().learning;
        let now = now_ms();
        let scheduler = ReflectionScheduler::new(now, 0);
        assert!(!scheduler.should_reflect(&config, now));

        for _ in 0..10 {
            scheduler.on_trade_closed();
        }
        assert!(scheduler.should_reflect(&config, now));

        scheduler.mark_reflected(now);
        assert_eq!(scheduler.trades_since(), 0);
        assert!(!scheduler.should_reflect(&config, now));
        assert!(scheduler.should_reflect(&config, now + HOUR_MS));
    }

    #[test]
    fn prompt_contains_the_enumerated_sections() {
        let trades = vec![entry("BTC", 5.0, 9, 1, ExitReason::TakeProfit)];
        let prompt = build_prompt(&trades, &compute_breakdown(&trades));
        assert!(prompt.contains("Per-symbol performance"));
        assert!(prompt.contains("Per-hour"));
        assert!(prompt.contains("Regime performance"));
        assert!(prompt.contains("Exits:"));
    }
}
