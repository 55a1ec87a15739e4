//! Periodic LLM-driven condition generation. Every cycle snapshots the
//! knowledge store once and uses that snapshot throughout, so concurrent
//! adaptations take effect the following cycle.

use crate::config::AppConfig;
use crate::knowledge::KnowledgeStore;
use crate::llm::{extract_json, ChatClient};
use crate::metrics::Metrics;
use crate::models::{
    AccountState, CoinScore, CoinStatus, Direction, GenerationOutcome, MarketState, Pattern,
    RegimeAction, RegimeRule, Tick, TradeCondition, TriggerRel,
};
use crate::orchestrator::HealthHandle;
use crate::price_bus::PriceBus;
use crate::sniper::{RegimeStamp, SniperHandle};
use crate::utils::time::now_ms;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// A condition as proposed by the model, before validation and sizing.
#[derive(Debug, Deserialize)]
pub struct ProposedCondition {
    pub symbol: String,
    pub direction: String,
    pub trigger_price: f64,
    pub trigger_rel: String,
    pub stop_loss_pct: f64,
    pub take_profit_pct: f64,
    pub base_size_usd: f64,
    #[serde(default)]
    pub pattern_id: Option<String>,
    #[serde(default)]
    pub reasoning: String,
    pub valid_for_seconds: i64,
}

/// Circuit breaker over the LLM call: opens after three consecutive
/// failures, stays open for 60 s, then half-opens for a single probe.
struct CircuitBreaker {
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    open_for: Duration,
}

impl CircuitBreaker {
    fn new() -> Self {
        Self {
            consecutive_failures: 0,
            opened_at: None,
            open_for: Duration::from_secs(60),
        }
    }

    fn allows_call(&self) -> bool {
        match self.opened_at {
            // Half-open once the window has passed: one probe goes through.
            Some(at) => at.elapsed() >= self.open_for,
            None => true,
        }
    }

    fn on_success(&mut self) {
        self.consecutive_failures = 0;
        self.opened_at = None;
    }

    fn on_failure(&mut self) {
        self.consecutive_failures += 1;
        if self.consecutive_failures >= 3 {
            self.opened_at = Some(Instant::now());
        }
    }
}

pub struct Strategist {
    config: AppConfig,
    knowledge: KnowledgeStore,
    chat: Arc<dyn ChatClient>,
    sniper: SniperHandle,
    price_bus: Arc<PriceBus>,
    metrics: Arc<Metrics>,
    health: HealthHandle,
    breaker: CircuitBreaker,
    consecutive_errors: u32,
    last_success: Option<Instant>,
}

impl Strategist {
    pub fn new(
        config: AppConfig,
        knowledge: KnowledgeStore,
        chat: Arc<dyn ChatClient>,
        sniper: SniperHandle,
        price_bus: Arc<PriceBus>,
        metrics: Arc<Metrics>,
        health: HealthHandle,
    ) -> Self {
        Self {
            config,
            knowledge,
            chat,
            sniper,
            price_bus,
            metrics,
            health,
            breaker: CircuitBreaker::new(),
            consecutive_errors: 0,
            last_success: None,
        }
    }

    pub async fn run(mut self) {
        info!(
            "🧭 Strategist started (period {}s)",
            self.config.strategist.period_s
        );
        let mut interval =
            tokio::time::interval(Duration::from_secs(self.config.strategist.period_s));
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick fires immediately; skip it so the feed has time to
        // populate prices.
        interval.tick().await;

        loop {
            interval.tick().await;
            let outcome = self.generate_once().await;
            match &outcome {
                GenerationOutcome::Conditions(conds) => {
                    info!("🧭 Generated {} conditions", conds.len());
                    self.mark_success();
                }
                GenerationOutcome::Suppressed { rule_id } => {
                    info!("🧭 Generation suppressed by regime rule {}", rule_id);
                    self.mark_success();
                }
                GenerationOutcome::Empty => {
                    debug!("🧭 Generation produced no conditions");
                    self.mark_success();
                }
                GenerationOutcome::Failed(e) => {
                    warn!("🧭 Generation failed: {}", e);
                    self.consecutive_errors += 1;
                    if self.consecutive_errors >= 5 {
                        self.health.fail(e);
                    } else {
                        self.health.error(e);
                    }
                }
            }

            // Stale success degrades health even without hard errors.
            if let Some(last) = self.last_success {
                if last.elapsed() > Duration::from_secs(self.config.strategist.period_s * 2) {
                    self.health.degrade("no successful generation in 2 periods");
                }
            }
        }
    }

    fn mark_success(&mut self) {
        self.consecutive_errors = 0;
        self.last_success = Some(Instant::now());
        self.health.ok();
    }

    /// One generation cycle against a single knowledge snapshot.
    pub async fn generate_once(&mut self) -> GenerationOutcome {
        let now = now_ms();

        // Snapshot prices for every tradeable symbol.
        let mut prices: HashMap<String, Tick> = HashMap::new();
        for symbol in &self.config.symbols.tradeable_symbols {
            if let Some(tick) = self.price_bus.latest(symbol) {
                prices.insert(symbol.clone(), tick);
            }
        }
        if prices.is_empty() {
            return GenerationOutcome::Failed("no prices available yet".to_string());
        }

        let btc_change = prices
            .get("BTC")
            .and_then(|t| t.change_24h)
            .unwrap_or(0.0);
        let market = MarketState::at(now, btc_change);

        // Knowledge snapshot for the whole cycle.
        let scores = match self.knowledge.get_all_coin_scores() {
            Ok(scores) => scores,
            Err(e) => return GenerationOutcome::Failed(e.to_string()),
        };
        let rules = match self.knowledge.get_active_rules() {
            Ok(rules) => rules,
            Err(e) => return GenerationOutcome::Failed(e.to_string()),
        };
        let patterns = match self.knowledge.get_active_patterns() {
            Ok(patterns) => patterns,
            Err(e) => return GenerationOutcome::Failed(e.to_string()),
        };

        // Regime gate before any LLM spend.
        let (suppressor, reduce) = evaluate_regime(&rules, &market);
        if let Some(rule_id) = suppressor {
            if let Err(e) = self.knowledge.bump_rule_triggered(&rule_id) {
                warn!("🧭 Failed to bump rule counter: {}", e);
            }
            return GenerationOutcome::Suppressed { rule_id };
        }
        let regime_modifier = if let Some(rule_id) = &reduce {
            if let Err(e) = self.knowledge.bump_rule_triggered(rule_id) {
                warn!("🧭 Failed to bump rule counter: {}", e);
            }
            0.5
        } else {
            1.0
        };

        let Some(account) = self.sniper.snapshot().await.map(|s| s.account) else {
            return GenerationOutcome::Failed("sniper unavailable".to_string());
        };

        if !self.breaker.allows_call() {
            return GenerationOutcome::Failed("circuit breaker open".to_string());
        }

        let user_prompt = build_prompt(&self.config, &prices, &scores, &rules, &patterns, &account);
        self.metrics.llm_calls_total.inc();
        let raw = match self
            .chat
            .complete(
                STRATEGIST_SYSTEM_PROMPT,
                &user_prompt,
                Duration::from_secs(self.config.strategist.llm_timeout_s),
            )
            .await
        {
            Ok(raw) => {
                self.breaker.on_success();
                raw
            }
            Err(e) => {
                self.breaker.on_failure();
                self.metrics.llm_failures_total.inc();
                return GenerationOutcome::Failed(e.to_string());
            }
        };

        let proposals: Vec<serde_json::Value> = match serde_json::from_str(&extract_json(&raw)) {
            Ok(list) => list,
            Err(e) => return GenerationOutcome::Failed(format!("response decode: {}", e)),
        };

        let score_by_symbol: HashMap<&str, &CoinScore> =
            scores.iter().map(|s| (s.symbol.as_str(), s)).collect();
        let pattern_by_id: HashMap<&str, &Pattern> =
            patterns.iter().map(|p| (p.pattern_id.as_str(), p)).collect();

        let mut conditions = Vec::new();
        let mut exposure_remaining =
            self.config.risk.max_exposure_pct * account.balance - account.in_positions;
        for value in proposals
            .into_iter()
            .take(self.config.strategist.max_conditions_per_cycle)
        {
            let proposal: ProposedCondition = match serde_json::from_value(value) {
                Ok(p) => p,
                Err(e) => {
                    debug!("🧭 Malformed proposal dropped: {}", e);
                    continue;
                }
            };
            match self.admit_proposal(proposal, &prices, &score_by_symbol, &pattern_by_id, regime_modifier, exposure_remaining, now) {
                Ok(cond) => {
                    exposure_remaining -= cond.size_usd;
                    conditions.push(cond);
                }
                Err(reason) => debug!("🧭 Proposal dropped: {}", reason),
            }
        }

        if conditions.is_empty() {
            return GenerationOutcome::Empty;
        }

        let stamp = RegimeStamp {
            market_regime: market.btc_trend.to_string(),
            btc_change_24h: btc_change,
        };
        if !self.sniper.install_conditions(conditions.clone(), stamp).await {
            return GenerationOutcome::Failed("sniper channel closed".to_string());
        }
        GenerationOutcome::Conditions(conditions)
    }

    /// Validation pipeline plus sizing for one proposal.
    #[allow(clippy::too_many_arguments)]
    fn admit_proposal(
        &self,
        proposal: ProposedCondition,
        prices: &HashMap<String, Tick>,
        scores: &HashMap<&str, &CoinScore>,
        patterns: &HashMap<&str, &Pattern>,
        regime_modifier: f64,
        exposure_remaining: f64,
        now: i64,
    ) -> Result<TradeCondition, String> {
        if !self.config.symbols.is_known(&proposal.symbol) {
            return Err(format!("unknown symbol {}", proposal.symbol));
        }
        if self.knowledge.is_blacklisted(&proposal.symbol) {
            self.metrics.dropped_blacklisted_total.inc();
            return Err(format!("{} is blacklisted", proposal.symbol));
        }
        let direction =
            Direction::parse(&proposal.direction).ok_or_else(|| format!("bad direction {}", proposal.direction))?;
        let trigger_rel = TriggerRel::parse(&proposal.trigger_rel)
            .ok_or_else(|| format!("bad trigger_rel {}", proposal.trigger_rel))?;

        let [sl_min, sl_max] = self.config.risk.sl_bounds;
        if !(sl_min..=sl_max).contains(&proposal.stop_loss_pct) {
            return Err(format!("stop_loss_pct {} out of bounds", proposal.stop_loss_pct));
        }
        let [tp_min, tp_max] = self.config.risk.tp_bounds;
        if !(tp_min..=tp_max).contains(&proposal.take_profit_pct) {
            return Err(format!("take_profit_pct {} out of bounds", proposal.take_profit_pct));
        }

        let spot = prices
            .get(&proposal.symbol)
            .map(|t| t.price)
            .ok_or_else(|| format!("no price for {}", proposal.symbol))?;
        if proposal.trigger_price <= 0.0 || !proposal.trigger_price.is_finite() {
            return Err("non-positive trigger".to_string());
        }
        if (proposal.trigger_price - spot).abs() / spot > self.config.risk.max_trigger_distance_pct {
            return Err(format!(
                "trigger {:.6} too far from spot {:.6}",
                proposal.trigger_price, spot
            ));
        }

        let [valid_min, valid_max] = self.config.strategist.validity_bounds_s;
        let valid_for = (proposal.valid_for_seconds.max(0) as u64).clamp(valid_min, valid_max);

        let coin_modifier = scores
            .get(proposal.symbol.as_str())
            .map(|s| s.status.size_modifier())
            .unwrap_or(1.0);
        let pattern_modifier = proposal
            .pattern_id
            .as_deref()
            .and_then(|id| patterns.get(id))
            .map(|p| p.size_modifier())
            .unwrap_or(1.0);

        let size = size_condition(
            proposal.base_size_usd,
            coin_modifier,
            pattern_modifier,
            regime_modifier,
            self.config.risk.min_size_usd,
            self.config.risk.max_size_usd,
            exposure_remaining,
        )
        .ok_or_else(|| "size resolved to zero".to_string())?;

        Ok(TradeCondition {
            id: uuid::Uuid::new_v4().to_string(),
            symbol: proposal.symbol,
            direction,
            trigger_price: proposal.trigger_price,
            trigger_rel,
            stop_loss_pct: proposal.stop_loss_pct,
            take_profit_pct: proposal.take_profit_pct,
            size_usd: size,
            strategy_id: "llm_strategist".to_string(),
            pattern_id: proposal.pattern_id,
            reasoning: proposal.reasoning,
            created_at_ms: now,
            valid_until_ms: now + valid_for as i64 * 1_000,
        })
    }
}

/// First NO_TRADE rule wins; otherwise the first REDUCE_SIZE rule is noted.
pub fn evaluate_regime(rules: &[RegimeRule], market: &MarketState) -> (Option<String>, Option<String>) {
    let mut reduce = None;
    for rule in rules.iter().filter(|r| r.active) {
        if rule.condition.matches(market) {
            match rule.action {
                RegimeAction::NoTrade => return (Some(rule.rule_id.clone()), None),
                RegimeAction::ReduceSize => {
                    if reduce.is_none() {
                        reduce = Some(rule.rule_id.clone());
                    }
                }
            }
        }
    }
    (None, reduce)
}

/// `base × coin × pattern × regime`, clamped into the admissible band.
/// Returns None when the condition must be dropped.
pub fn size_condition(
    base: f64,
    coin_modifier: f64,
    pattern_modifier: f64,
    regime_modifier: f64,
    min_size: f64,
    max_size: f64,
    exposure_remaining: f64,
) -> Option<f64> {
    let raw = base * coin_modifier * pattern_modifier * regime_modifier;
    if raw <= 0.0 || !raw.is_finite() {
        return None;
    }
    let upper = max_size.min(exposure_remaining);
    if upper < min_size {
        return None;
    }
    Some(raw.clamp(min_size, upper))
}

const STRATEGIST_SYSTEM_PROMPT: &str = "You are the strategist of an autonomous crypto \
paper-trading engine. Propose price-triggered trade conditions as a STRICT JSON array, no \
prose and no markdown fences. Each item: {\"symbol\": string, \"direction\": \
\"LONG\"|\"SHORT\", \"trigger_price\": number, \"trigger_rel\": \"ABOVE\"|\"BELOW\", \
\"stop_loss_pct\": number, \"take_profit_pct\": number, \"base_size_usd\": number, \
\"pattern_id\": string?, \"reasoning\": string, \"valid_for_seconds\": number}. Propose at \
most 5 conditions; an empty array is acceptable. Never propose avoided symbols.";

fn build_prompt(
    config: &AppConfig,
    prices: &HashMap<String, Tick>,
    scores: &[CoinScore],
    rules: &[RegimeRule],
    patterns: &[Pattern],
    account: &AccountState,
) -> String {
    let mut prompt = String::with_capacity(4096);

    prompt.push_str("Current prices:\n");
    for symbol in &config.symbols.tradeable_symbols {
        if let Some(tick) = prices.get(symbol) {
            prompt.push_str(&format!(
                "  {}: {:.6} ({:+.2}% 24h)\n",
                symbol,
                tick.price,
                tick.change_24h.unwrap_or(0.0)
            ));
        }
    }

    prompt.push_str("\nPer-symbol performance:\n");
    for score in scores {
        prompt.push_str(&format!(
            "  {}: {} | {} trades | {:.0}% win rate | {:+.2} USD | {}\n",
            score.symbol,
            score.status,
            score.trades,
            score.win_rate * 100.0,
            score.total_pnl,
            score.trend
        ));
    }

    let favored: Vec<&str> = scores
        .iter()
        .filter(|s| s.status == CoinStatus::Favored)
        .map(|s| s.symbol.as_str())
        .collect();
    let avoided: Vec<&str> = scores
        .iter()
        .filter(|s| matches!(s.status, CoinStatus::Blacklisted))
        .map(|s| s.symbol.as_str())
        .collect();
    prompt.push_str(&format!("\nFavored: {:?}\nAvoid (do not propose): {:?}\n", favored, avoided));

    if !rules.is_empty() {
        prompt.push_str("\nActive regime rules:\n");
        for rule in rules {
            prompt.push_str(&format!("  [{}] {} -> {}\n", rule.rule_id, rule.description, rule.action));
        }
    }

    if !patterns.is_empty() {
        prompt.push_str("\nTop patterns:\n");
        for pattern in patterns.iter().take(5) {
            prompt.push_str(&format!(
                "  {} (confidence {:.2}): {}\n",
                pattern.pattern_id, pattern.confidence, pattern.description
            ));
        }
    }

    prompt.push_str(&format!(
        "\nAccount: balance {:.2}, available {:.2}, in positions {:.2}, daily pnl {:+.2}, trades today {}\n",
        account.balance, account.available, account.in_positions, account.daily_pnl, account.trade_count_today
    ));
    prompt.push_str(&format!(
        "\nConstraints: size within [{}, {}] USD, stop within [{:.1}%, {:.1}%], target within [{:.1}%, {:.1}%], validity {}..{}s.",
        config.risk.min_size_usd,
        config.risk.max_size_usd,
        config.risk.sl_bounds[0] * 100.0,
        config.risk.sl_bounds[1] * 100.0,
        config.risk.tp_bounds[0] * 100.0,
        config.risk.tp_bounds[1] * 100.0,
        config.strategist.validity_bounds_s[0],
        config.strategist.validity_bounds_s[1],
    ));
    prompt
}
