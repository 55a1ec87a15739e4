use chrono::{DateTime, Datelike, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};

/// A single price observation from the feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tick {
    pub symbol: String,
    pub price: f64,
    pub ts_ms: i64,
    pub change_24h: Option<f64>,
}

/// Lower/upper bound for an epoch-milliseconds timestamp accepted on ingress.
/// Anything outside this window is a unit error (seconds vs millis) upstream.
pub const TS_MS_MIN: i64 = 2_000_000_000_000;
pub const TS_MS_MAX: i64 = 9_999_999_999_999;

impl Tick {
    /// Ingress validation: finite positive price, epoch-ms timestamp.
    pub fn validate(&self) -> Result<(), TradingError> {
        if !self.price.is_finite() || self.price <= 0.0 {
            return Err(TradingError::DataError(format!(
                "invalid price {} for {}",
                self.price, self.symbol
            )));
        }
        if self.ts_ms < TS_MS_MIN || self.ts_ms > TS_MS_MAX {
            return Err(TradingError::DataError(format!(
                "timestamp {} for {} outside epoch-ms window",
                self.ts_ms, self.symbol
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    pub fn sign(&self) -> f64 {
        match self {
            Direction::Long => 1.0,
            Direction::Short => -1.0,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Long => write!(f, "LONG"),
            Direction::Short => write!(f, "SHORT"),
        }
    }
}

impl Direction {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "LONG" => Some(Direction::Long),
            "SHORT" => Some(Direction::Short),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TriggerRel {
    Above,
    Below,
}

impl std::fmt::Display for TriggerRel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TriggerRel::Above => write!(f, "ABOVE"),
            TriggerRel::Below => write!(f, "BELOW"),
        }
    }
}

impl TriggerRel {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ABOVE" => Some(TriggerRel::Above),
            "BELOW" => Some(TriggerRel::Below),
            _ => None,
        }
    }
}

/// Immutable price-triggered entry template produced by the Strategist.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeCondition {
    pub id: String,
    pub symbol: String,
    pub direction: Direction,
    pub trigger_price: f64,
    pub trigger_rel: TriggerRel,
    pub stop_loss_pct: f64,
    pub take_profit_pct: f64,
    pub size_usd: f64,
    pub strategy_id: String,
    pub pattern_id: Option<String>,
    pub reasoning: String,
    pub created_at_ms: i64,
    pub valid_until_ms: i64,
}

impl TradeCondition {
    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.valid_until_ms < now_ms
    }

    /// Inclusive trigger match: ABOVE fires at price == trigger_price.
    pub fn triggers_at(&self, price: f64) -> bool {
        match self.trigger_rel {
            TriggerRel::Above => price >= self.trigger_price,
            TriggerRel::Below => price <= self.trigger_price,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExitReason {
    StopLoss,
    TakeProfit,
    Manual,
    Shutdown,
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitReason::StopLoss => write!(f, "STOP_LOSS"),
            ExitReason::TakeProfit => write!(f, "TAKE_PROFIT"),
            ExitReason::Manual => write!(f, "MANUAL"),
            ExitReason::Shutdown => write!(f, "SHUTDOWN"),
        }
    }
}

impl ExitReason {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "STOP_LOSS" => Some(ExitReason::StopLoss),
            "TAKE_PROFIT" => Some(ExitReason::TakeProfit),
            "MANUAL" => Some(ExitReason::Manual),
            "SHUTDOWN" => Some(ExitReason::Shutdown),
            _ => None,
        }
    }
}

/// Strategist snapshot of the ambient market, journaled with each entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EntryContext {
    pub market_regime: String,
    pub btc_change_24h: f64,
    pub hour_of_day: u8,
    pub day_of_week: u8,
}

impl EntryContext {
    pub fn at(ts_ms: i64, market_regime: &str, btc_change_24h: f64) -> Self {
        let dt = ms_to_datetime(ts_ms);
        Self {
            market_regime: market_regime.to_string(),
            btc_change_24h,
            hour_of_day: dt.hour() as u8,
            day_of_week: dt.weekday().num_days_from_monday() as u8,
        }
    }
}

/// An open trade, owned exclusively by the Sniper task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: String,
    pub condition_id: String,
    pub symbol: String,
    pub direction: Direction,
    pub size_usd: f64,
    pub entry_price: f64,
    pub entry_ts_ms: i64,
    pub stop_price: f64,
    pub target_price: f64,
    #[serde(default)]
    pub current_price: f64,
    #[serde(default)]
    pub unrealized_pnl: f64,
    pub strategy_id: String,
    pub pattern_id: Option<String>,
    pub entry_ctx: EntryContext,
}

impl Position {
    /// Open a position from a fired condition. Stop and target become
    /// absolute prices here; the condition's percentages are not kept.
    pub fn open(cond: &TradeCondition, entry_price: f64, entry_ts_ms: i64, ctx: EntryContext) -> Self {
        let (stop_price, target_price) = match cond.direction {
            Direction::Long => (
                entry_price * (1.0 - cond.stop_loss_pct),
                entry_price * (1.0 + cond.take_profit_pct),
            ),
            Direction::Short => (
                entry_price * (1.0 + cond.stop_loss_pct),
                entry_price * (1.0 - cond.take_profit_pct),
            ),
        };
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            condition_id: cond.id.clone(),
            symbol: cond.symbol.clone(),
            direction: cond.direction,
            size_usd: cond.size_usd,
            entry_price,
            entry_ts_ms,
            stop_price,
            target_price,
            current_price: entry_price,
            unrealized_pnl: 0.0,
            strategy_id: cond.strategy_id.clone(),
            pattern_id: cond.pattern_id.clone(),
            entry_ctx: ctx,
        }
    }

    pub fn mark_to_market(&mut self, price: f64) {
        self.current_price = price;
        self.unrealized_pnl = self.pnl_at(price);
    }

    pub fn pnl_at(&self, price: f64) -> f64 {
        (price - self.entry_price) * (self.size_usd / self.entry_price) * self.direction.sign()
    }

    /// Exit check for one tick. Stop wins when stop and target match the
    /// same tick (pessimistic execution).
    pub fn exit_reason_at(&self, price: f64) -> Option<ExitReason> {
        let (stop_hit, target_hit) = match self.direction {
            Direction::Long => (price <= self.stop_price, price >= self.target_price),
            Direction::Short => (price >= self.stop_price, price <= self.target_price),
        };
        if stop_hit {
            Some(ExitReason::StopLoss)
        } else if target_hit {
            Some(ExitReason::TakeProfit)
        } else {
            None
        }
    }
}

/// A closed trade as emitted by the Sniper on exit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClosedTrade {
    pub position: Position,
    pub exit_price: f64,
    pub exit_ts_ms: i64,
    pub reason: ExitReason,
    pub pnl_usd: f64,
    pub pnl_pct: f64,
    pub duration_ms: i64,
}

/// One row of the trade journal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEntry {
    pub trade_id: String,
    pub condition_id: String,
    pub symbol: String,
    pub direction: Direction,
    pub size_usd: f64,
    pub strategy_id: String,
    pub pattern_id: Option<String>,
    pub entry_price: f64,
    pub entry_ts_ms: i64,
    pub market_regime: String,
    pub btc_change_24h: f64,
    pub hour_of_day: u8,
    pub day_of_week: u8,
    pub exit_price: Option<f64>,
    pub exit_ts_ms: Option<i64>,
    pub exit_reason: Option<ExitReason>,
    pub pnl_usd: Option<f64>,
    pub pnl_pct: Option<f64>,
    pub duration_ms: Option<i64>,
    pub price_after_1m: Option<f64>,
    pub price_after_5m: Option<f64>,
    pub price_after_15m: Option<f64>,
}

impl JournalEntry {
    pub fn won(&self) -> bool {
        self.pnl_usd.unwrap_or(0.0) > 0.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Improving,
    Stable,
    Declining,
}

impl std::fmt::Display for Trend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Trend::Improving => write!(f, "improving"),
            Trend::Stable => write!(f, "stable"),
            Trend::Declining => write!(f, "declining"),
        }
    }
}

impl Trend {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "improving" => Some(Trend::Improving),
            "stable" => Some(Trend::Stable),
            "declining" => Some(Trend::Declining),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CoinStatus {
    Unknown,
    Blacklisted,
    Reduced,
    Normal,
    Favored,
}

impl std::fmt::Display for CoinStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CoinStatus::Unknown => write!(f, "UNKNOWN"),
            CoinStatus::Blacklisted => write!(f, "BLACKLISTED"),
            CoinStatus::Reduced => write!(f, "REDUCED"),
            CoinStatus::Normal => write!(f, "NORMAL"),
            CoinStatus::Favored => write!(f, "FAVORED"),
        }
    }
}

impl CoinStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "UNKNOWN" => Some(CoinStatus::Unknown),
            "BLACKLISTED" => Some(CoinStatus::Blacklisted),
            "REDUCED" => Some(CoinStatus::Reduced),
            "NORMAL" => Some(CoinStatus::Normal),
            "FAVORED" => Some(CoinStatus::Favored),
            _ => None,
        }
    }

    /// Size multiplier applied by the Strategist during sizing.
    pub fn size_modifier(&self) -> f64 {
        match self {
            CoinStatus::Blacklisted => 0.0,
            CoinStatus::Reduced => 0.5,
            CoinStatus::Normal | CoinStatus::Unknown => 1.0,
            CoinStatus::Favored => 1.5,
        }
    }
}

/// Aggregate performance per symbol. Arithmetic invariant:
/// trades == wins + losses and win_rate == wins / trades when trades > 0.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoinScore {
    pub symbol: String,
    pub trades: u32,
    pub wins: u32,
    pub losses: u32,
    pub total_pnl: f64,
    pub avg_pnl: f64,
    pub win_rate: f64,
    pub avg_winner: f64,
    pub avg_loser: f64,
    pub trend: Trend,
    pub status: CoinStatus,
    pub blacklist_reason: Option<String>,
    pub last_updated_ms: i64,
}

impl CoinScore {
    pub fn new(symbol: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            trades: 0,
            wins: 0,
            losses: 0,
            total_pnl: 0.0,
            avg_pnl: 0.0,
            win_rate: 0.0,
            avg_winner: 0.0,
            avg_loser: 0.0,
            trend: Trend::Stable,
            status: CoinStatus::Unknown,
            blacklist_reason: None,
            last_updated_ms: 0,
        }
    }
}

/// Named entry/exit template with confidence built from outcomes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pattern {
    pub pattern_id: String,
    pub description: String,
    pub entry_conditions: serde_json::Value,
    pub exit_conditions: serde_json::Value,
    pub times_used: u32,
    pub wins: u32,
    pub losses: u32,
    pub total_pnl: f64,
    pub confidence: f64,
    pub active: bool,
    pub created_at_ms: i64,
    pub last_used_at_ms: Option<i64>,
}

impl Pattern {
    /// Linear map of confidence [0,1] onto the sizing band [0.75, 1.25].
    pub fn size_modifier(&self) -> f64 {
        0.75 + self.confidence.clamp(0.0, 1.0) * 0.5
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BtcTrend {
    Up,
    Down,
    Sideways,
}

impl std::fmt::Display for BtcTrend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BtcTrend::Up => write!(f, "up"),
            BtcTrend::Down => write!(f, "down"),
            BtcTrend::Sideways => write!(f, "sideways"),
        }
    }
}

/// Ambient market state evaluated against regime rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketState {
    pub btc_trend: BtcTrend,
    pub btc_change_24h: f64,
    pub hour_of_day: u8,
    pub day_of_week: u8,
    pub is_weekend: bool,
}

impl MarketState {
    pub fn at(ts_ms: i64, btc_change_24h: f64) -> Self {
        let dt = ms_to_datetime(ts_ms);
        let dow = dt.weekday().num_days_from_monday() as u8;
        let btc_trend = if btc_change_24h > 1.0 {
            BtcTrend::Up
        } else if btc_change_24h < -1.0 {
            BtcTrend::Down
        } else {
            BtcTrend::Sideways
        };
        Self {
            btc_trend,
            btc_change_24h,
            hour_of_day: dt.hour() as u8,
            day_of_week: dow,
            is_weekend: dow >= 5,
        }
    }
}

/// Typed predicate attached to a regime rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RuleCondition {
    BtcTrend { trend: BtcTrend },
    BtcChangeBelow { pct: f64 },
    BtcChangeAbove { pct: f64 },
    HourRange { start: u8, end: u8 },
    Weekend,
}

impl RuleCondition {
    pub fn matches(&self, state: &MarketState) -> bool {
        match self {
            RuleCondition::BtcTrend { trend } => state.btc_trend == *trend,
            RuleCondition::BtcChangeBelow { pct } => state.btc_change_24h < *pct,
            RuleCondition::BtcChangeAbove { pct } => state.btc_change_24h > *pct,
            // Wrapping range so 22..4 covers the overnight hours.
            RuleCondition::HourRange { start, end } => {
                if start <= end {
                    (*start..=*end).contains(&state.hour_of_day)
                } else {
                    state.hour_of_day >= *start || state.hour_of_day <= *end
                }
            }
            RuleCondition::Weekend => state.is_weekend,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RegimeAction {
    NoTrade,
    ReduceSize,
}

impl std::fmt::Display for RegimeAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegimeAction::NoTrade => write!(f, "NO_TRADE"),
            RegimeAction::ReduceSize => write!(f, "REDUCE_SIZE"),
        }
    }
}

impl RegimeAction {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "NO_TRADE" => Some(RegimeAction::NoTrade),
            "REDUCE_SIZE" => Some(RegimeAction::ReduceSize),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegimeRule {
    pub rule_id: String,
    pub description: String,
    pub condition: RuleCondition,
    pub action: RegimeAction,
    pub times_triggered: u32,
    pub estimated_saves: f64,
    pub active: bool,
    pub created_at_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AdaptationAction {
    Blacklist,
    Unblacklist,
    Favor,
    Reduce,
    DeactivatePattern,
    ActivatePattern,
    CreateTimeRule,
    CreateRegimeRule,
    Rollback,
}

impl std::fmt::Display for AdaptationAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AdaptationAction::Blacklist => "BLACKLIST",
            AdaptationAction::Unblacklist => "UNBLACKLIST",
            AdaptationAction::Favor => "FAVOR",
            AdaptationAction::Reduce => "REDUCE",
            AdaptationAction::DeactivatePattern => "DEACTIVATE_PATTERN",
            AdaptationAction::ActivatePattern => "ACTIVATE_PATTERN",
            AdaptationAction::CreateTimeRule => "CREATE_TIME_RULE",
            AdaptationAction::CreateRegimeRule => "CREATE_REGIME_RULE",
            AdaptationAction::Rollback => "ROLLBACK",
        };
        write!(f, "{}", s)
    }
}

impl AdaptationAction {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "BLACKLIST" => Some(AdaptationAction::Blacklist),
            "UNBLACKLIST" => Some(AdaptationAction::Unblacklist),
            "FAVOR" => Some(AdaptationAction::Favor),
            "REDUCE" => Some(AdaptationAction::Reduce),
            "DEACTIVATE_PATTERN" => Some(AdaptationAction::DeactivatePattern),
            "ACTIVATE_PATTERN" => Some(AdaptationAction::ActivatePattern),
            "CREATE_TIME_RULE" => Some(AdaptationAction::CreateTimeRule),
            "CREATE_REGIME_RULE" => Some(AdaptationAction::CreateRegimeRule),
            "ROLLBACK" => Some(AdaptationAction::Rollback),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Effectiveness {
    Pending,
    HighlyEffective,
    Effective,
    Neutral,
    Ineffective,
    Harmful,
}

impl std::fmt::Display for Effectiveness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Effectiveness::Pending => "pending",
            Effectiveness::HighlyEffective => "highly_effective",
            Effectiveness::Effective => "effective",
            Effectiveness::Neutral => "neutral",
            Effectiveness::Ineffective => "ineffective",
            Effectiveness::Harmful => "harmful",
        };
        write!(f, "{}", s)
    }
}

impl Effectiveness {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Effectiveness::Pending),
            "highly_effective" => Some(Effectiveness::HighlyEffective),
            "effective" => Some(Effectiveness::Effective),
            "neutral" => Some(Effectiveness::Neutral),
            "ineffective" => Some(Effectiveness::Ineffective),
            "harmful" => Some(Effectiveness::Harmful),
            _ => None,
        }
    }
}

/// A knowledge-store mutation applied in response to an insight (or an
/// operator command). Append-only; post-hoc fields written exactly once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Adaptation {
    pub id: String,
    pub ts_ms: i64,
    pub insight_id: Option<String>,
    pub action: AdaptationAction,
    pub target: String,
    pub description: String,
    pub pre_metrics: serde_json::Value,
    pub confidence: f64,
    pub auto_applied: bool,
    pub post_metrics: Option<serde_json::Value>,
    pub effectiveness: Effectiveness,
    pub measured_at_ms: Option<i64>,
    pub rolled_back: bool,
    pub rollback_reason: Option<String>,
}

/// Evidence cited by a reflection insight.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InsightEvidence {
    pub trades: u32,
    #[serde(default)]
    pub win_rate: Option<f64>,
    #[serde(default)]
    pub pnl: Option<f64>,
    #[serde(default)]
    pub pattern_id: Option<String>,
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default)]
    pub hours: Option<Vec<u8>>,
}

/// Structured observation emitted by the reflection LLM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Insight {
    #[serde(rename = "type")]
    pub insight_type: String,
    pub category: String,
    pub title: String,
    pub description: String,
    pub evidence: InsightEvidence,
    pub suggested_action: String,
    pub confidence: f64,
}

/// Persisted engine state written on shutdown and every flush interval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeState {
    pub last_reflection_ms: i64,
    pub trades_since_reflection: u32,
    pub balance: f64,
    pub paused: bool,
}

impl Default for RuntimeState {
    fn default() -> Self {
        Self {
            last_reflection_ms: 0,
            trades_since_reflection: 0,
            balance: 0.0,
            paused: false,
        }
    }
}

/// Authoritative paper-account state, owned by the Sniper.
/// At rest: balance == available + in_positions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountState {
    pub balance: f64,
    pub available: f64,
    pub in_positions: f64,
    pub total_pnl: f64,
    pub daily_pnl: f64,
    pub trade_count_today: u32,
    pub last_updated_ms: i64,
}

impl AccountState {
    pub fn new(balance: f64) -> Self {
        Self {
            balance,
            available: balance,
            in_positions: 0.0,
            total_pnl: 0.0,
            daily_pnl: 0.0,
            trade_count_today: 0,
            last_updated_ms: 0,
        }
    }
}

/// Outcome of one Strategist generation cycle.
#[derive(Debug, Clone)]
pub enum GenerationOutcome {
    Conditions(Vec<TradeCondition>),
    Suppressed { rule_id: String },
    Empty,
    Failed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Failed,
    Stopped,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Failed => write!(f, "failed"),
            HealthStatus::Stopped => write!(f, "stopped"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: HealthStatus,
    pub last_activity_ms: i64,
    pub error_count: u64,
    pub detail: Option<String>,
}

impl ComponentHealth {
    pub fn healthy(now_ms: i64) -> Self {
        Self {
            status: HealthStatus::Healthy,
            last_activity_ms: now_ms,
            error_count: 0,
            detail: None,
        }
    }
}

fn ms_to_datetime(ts_ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ts_ms)
        .single()
        .unwrap_or_else(Utc::now)
}

// Error types
#[derive(Debug, thiserror::Error)]
pub enum TradingError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Schema error: {0}")]
    SchemaError(String),

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Data error: {0}")]
    DataError(String),

    #[error("LLM error: {0}")]
    LlmError(String),

    #[error("Timeout after {timeout_ms}ms: {context}")]
    Timeout { timeout_ms: u64, context: String },

    #[error("Risk limit exceeded: {0}")]
    RiskLimitExceeded(String),

    #[error("Channel closed: {0}")]
    ChannelClosed(String),
}

impl From<rusqlite::Error> for TradingError {
    fn from(e: rusqlite::Error) -> Self {
        TradingError::DatabaseError(e.to_string())
    }
}

pub type TradingResult<T> = Result<T, TradingError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn condition(direction: Direction, trigger_rel: TriggerRel, trigger: f64) -> TradeCondition {
        TradeCondition {
            id: "c1".to_string(),
            symbol: "BTC".to_string(),
            direction,
            trigger_price: trigger,
            trigger_rel,
            stop_loss_pct: 0.02,
            take_profit_pct: 0.01,
            size_usd: 500.0,
            strategy_id: "llm".to_string(),
            pattern_id: None,
            reasoning: "test".to_string(),
            created_at_ms: 2_000_000_000_001,
            valid_until_ms: 2_000_000_100_000,
        }
    }

    #[test]
    fn trigger_is_inclusive() {
        let c = condition(Direction::Long, TriggerRel::Above, 50_000.0);
        assert!(!c.triggers_at(49_999.0));
        assert!(c.triggers_at(50_000.0));
        assert!(c.triggers_at(50_001.0));

        let c = condition(Direction::Short, TriggerRel::Below, 50_000.0);
        assert!(c.triggers_at(50_000.0));
        assert!(!c.triggers_at(50_001.0));
    }

    #[test]
    fn position_stop_and_target_math() {
        let c = condition(Direction::Long, TriggerRel::Above, 50_000.0);
        let p = Position::open(&c, 50_000.0, 2_000_000_000_001, EntryContext::default());
        assert!((p.stop_price - 49_000.0).abs() < 1e-6);
        assert!((p.target_price - 50_500.0).abs() < 1e-6);

        let short = condition(Direction::Short, TriggerRel::Below, 50_000.0);
        let p = Position::open(&short, 50_000.0, 2_000_000_000_001, EntryContext::default());
        assert!((p.stop_price - 51_000.0).abs() < 1e-6);
        assert!((p.target_price - 49_500.0).abs() < 1e-6);
    }

    #[test]
    fn stop_wins_over_target_on_same_tick() {
        let c = condition(Direction::Long, TriggerRel::Above, 100.0);
        let p = Position::open(&c, 100.0, 2_000_000_000_001, EntryContext::default());
        assert_eq!(p.exit_reason_at(97.9), Some(ExitReason::StopLoss));
        assert_eq!(p.exit_reason_at(101.0), Some(ExitReason::TakeProfit));
        assert_eq!(p.exit_reason_at(99.5), None);
    }

    #[test]
    fn pnl_is_signed_by_direction() {
        let c = condition(Direction::Long, TriggerRel::Above, 100.0);
        let p = Position::open(&c, 100.0, 2_000_000_000_001, EntryContext::default());
        assert!((p.pnl_at(101.0) - 5.0).abs() < 1e-9); // 1% move on 500 USD

        let c = condition(Direction::Short, TriggerRel::Below, 100.0);
        let p = Position::open(&c, 100.0, 2_000_000_000_001, EntryContext::default());
        assert!((p.pnl_at(101.0) + 5.0).abs() < 1e-9);
    }

    #[test]
    fn tick_ingress_window() {
        let mut t = Tick {
            symbol: "BTC".to_string(),
            price: 50_000.0,
            ts_ms: 2_500_000_000_000,
            change_24h: None,
        };
        assert!(t.validate().is_ok());
        // Seconds-scale timestamp (the 1969-12-31 class of bug) is rejected.
        t.ts_ms = 1_700_000_000;
        assert!(t.validate().is_err());
        t.ts_ms = 2_500_000_000_000;
        t.price = f64::NAN;
        assert!(t.validate().is_err());
    }

    #[test]
    fn pattern_confidence_maps_to_sizing_band() {
        let mut p = Pattern {
            pattern_id: "p1".to_string(),
            description: String::new(),
            entry_conditions: serde_json::Value::Null,
            exit_conditions: serde_json::Value::Null,
            times_used: 0,
            wins: 0,
            losses: 0,
            total_pnl: 0.0,
            confidence: 0.0,
            active: true,
            created_at_ms: 0,
            last_used_at_ms: None,
        };
        assert!((p.size_modifier() - 0.75).abs() < 1e-9);
        p.confidence = 1.0;
        assert!((p.size_modifier() - 1.25).abs() < 1e-9);
        p.confidence = 0.5;
        assert!((p.size_modifier() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn hour_range_rule_wraps_midnight() {
        let rule = RuleCondition::HourRange { start: 22, end: 4 };
        let mk = |hour| MarketState {
            btc_trend: BtcTrend::Sideways,
            btc_change_24h: 0.0,
            hour_of_day: hour,
            day_of_week: 2,
            is_weekend: false,
        };
        assert!(rule.matches(&mk(23)));
        assert!(rule.matches(&mk(2)));
        assert!(!rule.matches(&mk(12)));
    }
}
