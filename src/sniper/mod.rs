//! The hot path. One task owns the active condition set, the open
//! positions, and the account state; ticks and commands arrive on channels,
//! so installs and ticks are totally ordered and `on_tick` holds no locks.
//! Nothing here performs I/O beyond enqueueing to the journal writer.

use crate::config::RiskConfig;
use crate::journal::JournalMsg;
use crate::knowledge::BlacklistView;
use crate::metrics::Metrics;
use crate::models::{
    AccountState, ClosedTrade, EntryContext, ExitReason, Position, Tick, TradeCondition,
};
use crate::orchestrator::HealthHandle;
use crate::utils::time::{day_ordinal, now_ms};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Strategist snapshot of the ambient regime, stamped onto entries so the
/// journal records the regime the trade was planned under.
#[derive(Debug, Clone, Default)]
pub struct RegimeStamp {
    pub market_regime: String,
    pub btc_change_24h: f64,
}

/// Control-plane messages. Ticks observe either the pre- or post-command
/// state, never a partial one.
pub enum SniperCommand {
    InstallConditions {
        conditions: Vec<TradeCondition>,
        regime: RegimeStamp,
    },
    Snapshot(oneshot::Sender<SniperSnapshot>),
    Pause,
    Resume,
    CloseAll {
        reason: ExitReason,
        reply: oneshot::Sender<usize>,
    },
    ManualClose {
        symbol: String,
        reply: oneshot::Sender<bool>,
    },
}

#[derive(Debug, Clone)]
pub struct SniperSnapshot {
    pub account: AccountState,
    pub positions: Vec<Position>,
    pub conditions: Vec<TradeCondition>,
    pub paused: bool,
}

/// Emitted on every open/close; fanned out to the journal, quick update,
/// and post-exit enrichment by the orchestrator.
#[derive(Debug, Clone)]
pub enum TradeEvent {
    Opened(Position),
    Closed(ClosedTrade),
}

/// Cloneable handle for everyone outside the sniper task.
#[derive(Clone)]
pub struct SniperHandle {
    pub(crate) cmd_tx: mpsc::Sender<SniperCommand>,
}

impl SniperHandle {
    pub async fn install_conditions(&self, conditions: Vec<TradeCondition>, regime: RegimeStamp) -> bool {
        self.cmd_tx
            .send(SniperCommand::InstallConditions { conditions, regime })
            .await
            .is_ok()
    }

    pub async fn snapshot(&self) -> Option<SniperSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx.send(SniperCommand::Snapshot(tx)).await.ok()?;
        rx.await.ok()
    }

    pub async fn pause(&self) -> bool {
        self.cmd_tx.send(SniperCommand::Pause).await.is_ok()
    }

    pub async fn resume(&self) -> bool {
        self.cmd_tx.send(SniperCommand::Resume).await.is_ok()
    }

    pub async fn close_all(&self, reason: ExitReason) -> usize {
        let (tx, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(SniperCommand::CloseAll { reason, reply: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    pub async fn manual_close(&self, symbol: &str) -> bool {
        let (tx, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(SniperCommand::ManualClose {
                symbol: symbol.to_string(),
                reply: tx,
            })
            .await
            .is_err()
        {
            return false;
        }
        rx.await.unwrap_or(false)
    }
}

pub struct Sniper {
    risk: RiskConfig,
    account: AccountState,
    /// Active conditions, keyed by symbol so a tick only scans its own.
    conditions: HashMap<String, Vec<TradeCondition>>,
    /// One open position per symbol (per-symbol cap is 1).
    positions: HashMap<String, Position>,
    blacklist: BlacklistView,
    paused: bool,
    regime: RegimeStamp,
    current_day: i64,
    journal_tx: mpsc::Sender<JournalMsg>,
    event_tx: mpsc::UnboundedSender<TradeEvent>,
    metrics: Arc<Metrics>,
    health: HealthHandle,
}

impl Sniper {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        risk: RiskConfig,
        account: AccountState,
        restored_conditions: Vec<TradeCondition>,
        restored_positions: Vec<Position>,
        blacklist: BlacklistView,
        journal_tx: mpsc::Sender<JournalMsg>,
        event_tx: mpsc::UnboundedSender<TradeEvent>,
        metrics: Arc<Metrics>,
        health: HealthHandle,
    ) -> Self {
        let now = now_ms();
        let mut conditions: HashMap<String, Vec<TradeCondition>> = HashMap::new();
        for cond in restored_conditions {
            if cond.is_expired(now) {
                continue;
            }
            conditions.entry(cond.symbol.clone()).or_default().push(cond);
        }
        let positions = restored_positions
            .into_iter()
            .map(|p| (p.symbol.clone(), p))
            .collect();

        let sniper = Self {
            risk,
            account,
            conditions,
            positions,
            blacklist,
            paused: false,
            regime: RegimeStamp::default(),
            current_day: day_ordinal(now),
            journal_tx,
            event_tx,
            metrics,
            health,
        };
        sniper.publish_gauges();
        sniper
    }

    /// Spawn the actor and hand back its control handle.
    pub fn spawn(self, tick_rx: mpsc::Receiver<Tick>) -> (SniperHandle, tokio::task::JoinHandle<()>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let task = tokio::spawn(self.run(tick_rx, cmd_rx));
        (SniperHandle { cmd_tx }, task)
    }

    /// Actor loop: a single consumer for ticks and commands, plus the
    /// periodic expiry sweep.
    pub async fn run(
        mut self,
        mut tick_rx: mpsc::Receiver<Tick>,
        mut cmd_rx: mpsc::Receiver<SniperCommand>,
    ) {
        info!("🎯 Sniper started ({} restored conditions, {} restored positions)",
            self.condition_count(), self.positions.len());
        let mut sweep = tokio::time::interval(Duration::from_secs(30));
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                maybe_tick = tick_rx.recv() => {
                    match maybe_tick {
                        Some(tick) => self.on_tick(&tick).await,
                        None => break,
                    }
                }
                maybe_cmd = cmd_rx.recv() => {
                    match maybe_cmd {
                        Some(cmd) => {
                            if self.handle_command(cmd).await {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = sweep.tick() => {
                    self.sweep_expired(now_ms());
                }
            }
        }
        info!("🎯 Sniper stopped");
    }

    pub fn condition_count(&self) -> usize {
        self.conditions.values().map(|v| v.len()).sum()
    }

    /// Returns true when the loop should exit (channel shutdown only).
    pub async fn handle_command(&mut self, cmd: SniperCommand) -> bool {
        match cmd {
            SniperCommand::InstallConditions { conditions, regime } => {
                self.regime = regime;
                self.install_conditions(conditions);
            }
            SniperCommand::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            SniperCommand::Pause => {
                info!("⏸️ Sniper paused, new entries suppressed");
                self.paused = true;
            }
            SniperCommand::Resume => {
                info!("▶️ Sniper resumed");
                self.paused = false;
            }
            SniperCommand::CloseAll { reason, reply } => {
                let closed = self.close_all(reason).await;
                let _ = reply.send(closed);
            }
            SniperCommand::ManualClose { symbol, reply } => {
                let closed = match self.positions.get(&symbol) {
                    Some(position) => {
                        let price = position.current_price;
                        self.close_position(&symbol, price, now_ms(), ExitReason::Manual)
                            .await
                    }
                    None => false,
                };
                let _ = reply.send(closed);
            }
        }
        false
    }

    /// Replace the active set with the valid, non-expired subset.
    pub fn install_conditions(&mut self, conds: Vec<TradeCondition>) {
        let now = now_ms();
        let mut fresh: HashMap<String, Vec<TradeCondition>> = HashMap::new();
        let mut installed = 0usize;
        for cond in conds {
            if cond.is_expired(now) {
                continue;
            }
            if self.blacklist.contains_key(&cond.symbol) {
                self.metrics.dropped_blacklisted_total.inc();
                warn!("🚫 Condition for blacklisted {} not installed", cond.symbol);
                continue;
            }
            installed += 1;
            fresh.entry(cond.symbol.clone()).or_default().push(cond);
        }
        self.conditions = fresh;
        self.metrics.conditions_installed_total.inc_by(installed as u64);
        debug!("🎯 Installed {} conditions", installed);
        self.publish_gauges();
    }

    pub fn snapshot(&self) -> SniperSnapshot {
        SniperSnapshot {
            account: self.account.clone(),
            positions: self.positions.values().cloned().collect(),
            conditions: self.conditions.values().flatten().cloned().collect(),
            paused: self.paused,
        }
    }

    /// Per-tick work: daily rollover, expiry purge for this symbol, exit
    /// checks for the symbol's position, then entry trigger checks.
    pub async fn on_tick(&mut self, tick: &Tick) {
        self.roll_day(tick.ts_ms);
        self.purge_expired_for(&tick.symbol, tick.ts_ms);

        // Exits run before entries: a position closed on this tick frees
        // its slot, but a same-tick re-entry still sees the updated set.
        let exit = match self.positions.get_mut(&tick.symbol) {
            Some(position) => {
                position.mark_to_market(tick.price);
                position.exit_reason_at(tick.price)
            }
            None => None,
        };
        if let Some(reason) = exit {
            self.close_position(&tick.symbol, tick.price, tick.ts_ms, reason)
                .await;
        }

        if let Some(conds) = self.conditions.get(&tick.symbol) {
            let fired: Vec<String> = conds
                .iter()
                .filter(|c| c.triggers_at(tick.price))
                .map(|c| c.id.clone())
                .collect();
            for cond_id in fired {
                self.try_enter(&cond_id, tick).await;
            }
        }
        self.health.ok();
    }

    async fn try_enter(&mut self, cond_id: &str, tick: &Tick) {
        let Some(conds) = self.conditions.get(&tick.symbol) else {
            return;
        };
        let Some(cond) = conds.iter().find(|c| c.id == cond_id).cloned() else {
            return;
        };

        if let Some(reject) = self.admission_check(&cond) {
            self.metrics.entries_rejected_total.inc();
            debug!("⛔ Entry rejected for {} ({}): {}", cond.symbol, cond.id, reject);
            return;
        }

        // Consume the condition and open the position.
        if let Some(list) = self.conditions.get_mut(&tick.symbol) {
            list.retain(|c| c.id != cond.id);
            if list.is_empty() {
                self.conditions.remove(&tick.symbol);
            }
        }

        let ctx = EntryContext::at(
            tick.ts_ms,
            &self.regime.market_regime,
            self.regime.btc_change_24h,
        );
        let position = Position::open(&cond, tick.price, tick.ts_ms, ctx);

        self.account.available -= position.size_usd;
        self.account.in_positions += position.size_usd;
        self.account.last_updated_ms = tick.ts_ms;

        info!(
            "🟢 ENTRY {} {} @ {:.6} size ${:.0} (stop {:.6}, target {:.6})",
            position.symbol,
            position.direction,
            position.entry_price,
            position.size_usd,
            position.stop_price,
            position.target_price
        );

        self.metrics.entries_total.inc();
        self.enqueue_journal(JournalMsg::Entry(Box::new(position.clone()))).await;
        let _ = self.event_tx.send(TradeEvent::Opened(position.clone()));
        self.positions.insert(position.symbol.clone(), position);
        self.publish_gauges();
    }

    /// Admission guards, in check order. Returning Some(reason) leaves the
    /// condition installed until expiry.
    fn admission_check(&self, cond: &TradeCondition) -> Option<String> {
        if self.paused {
            return Some("engine paused".to_string());
        }
        if self.positions.contains_key(&cond.symbol) {
            return Some(format!("position already open in {}", cond.symbol));
        }
        if self.positions.len() >= self.risk.max_positions {
            return Some(format!("max positions ({}) reached", self.risk.max_positions));
        }
        let exposure_cap = self.risk.max_exposure_pct * self.account.balance;
        if self.account.in_positions + cond.size_usd > exposure_cap + 1e-9 {
            return Some(format!(
                "exposure {:.2} + {:.2} exceeds cap {:.2}",
                self.account.in_positions, cond.size_usd, exposure_cap
            ));
        }
        if self.blacklist.contains_key(&cond.symbol) {
            self.metrics.dropped_blacklisted_total.inc();
            return Some(format!("{} is blacklisted", cond.symbol));
        }
        None
    }

    async fn close_position(
        &mut self,
        symbol: &str,
        exit_price: f64,
        exit_ts_ms: i64,
        reason: ExitReason,
    ) -> bool {
        let Some(position) = self.positions.remove(symbol) else {
            return false;
        };

        let pnl_usd = position.pnl_at(exit_price);
        let trade = ClosedTrade {
            pnl_pct: pnl_usd / position.size_usd,
            duration_ms: exit_ts_ms - position.entry_ts_ms,
            exit_price,
            exit_ts_ms,
            reason,
            pnl_usd,
            position,
        };

        self.account.in_positions -= trade.position.size_usd;
        self.account.available += trade.position.size_usd + pnl_usd;
        self.account.balance += pnl_usd;
        self.account.total_pnl += pnl_usd;
        self.account.daily_pnl += pnl_usd;
        self.account.trade_count_today += 1;
        self.account.last_updated_ms = exit_ts_ms;

        info!(
            "🔴 EXIT {} {} @ {:.6} pnl {:+.2} USD ({}) after {}ms",
            trade.position.symbol,
            trade.position.direction,
            exit_price,
            pnl_usd,
            reason,
            trade.duration_ms
        );

        self.metrics.exits_total.inc();
        self.enqueue_journal(JournalMsg::Exit(Box::new(trade.clone()))).await;
        let _ = self.event_tx.send(TradeEvent::Closed(trade));
        self.publish_gauges();
        true
    }

    async fn close_all(&mut self, reason: ExitReason) -> usize {
        let symbols: Vec<String> = self.positions.keys().cloned().collect();
        let mut closed = 0;
        for symbol in symbols {
            let price = self
                .positions
                .get(&symbol)
                .map(|p| p.current_price)
                .unwrap_or(0.0);
            if price > 0.0 && self.close_position(&symbol, price, now_ms(), reason).await {
                closed += 1;
            }
        }
        closed
    }

    fn purge_expired_for(&mut self, symbol: &str, now_ms: i64) {
        if let Some(list) = self.conditions.get_mut(symbol) {
            let before = list.len();
            list.retain(|c| !c.is_expired(now_ms));
            let purged = before - list.len();
            if purged > 0 {
                self.metrics.conditions_expired_total.inc_by(purged as u64);
                debug!("🧹 Purged {} expired conditions for {}", purged, symbol);
            }
            if list.is_empty() {
                self.conditions.remove(symbol);
            }
        }
    }

    pub fn sweep_expired(&mut self, now_ms: i64) {
        let symbols: Vec<String> = self.conditions.keys().cloned().collect();
        for symbol in symbols {
            self.purge_expired_for(&symbol, now_ms);
        }
        self.publish_gauges();
    }

    fn roll_day(&mut self, ts_ms: i64) {
        let day = day_ordinal(ts_ms);
        if day != self.current_day {
            self.current_day = day;
            self.account.daily_pnl = 0.0;
            self.account.trade_count_today = 0;
        }
    }

    /// Bounded enqueue to the journal writer. A full queue blocks briefly;
    /// sustained backpressure drops the message and degrades health.
    async fn enqueue_journal(&self, msg: JournalMsg) {
        if let Err(e) = self.journal_tx.try_send(msg) {
            match e {
                mpsc::error::TrySendError::Full(msg) => {
                    warn!("📓 Journal queue full, applying backpressure");
                    match tokio::time::timeout(
                        Duration::from_millis(250),
                        self.journal_tx.send(msg),
                    )
                    .await
                    {
                        Ok(Ok(())) => {}
                        _ => self.health.degrade("journal backpressure"),
                    }
                }
                mpsc::error::TrySendError::Closed(_) => {
                    self.health.degrade("journal writer gone");
                }
            }
        }
        self.metrics
            .journal_queue_depth
            .set((self.journal_tx.max_capacity() - self.journal_tx.capacity()) as i64);
    }

    fn publish_gauges(&self) {
        self.metrics.balance.set(self.account.balance);
        self.metrics.open_positions.set(self.positions.len() as i64);
        self.metrics
            .active_conditions
            .set(self.condition_count() as i64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Direction, TriggerRel};
    use dashmap::DashMap;

    const T0: i64 = 2_100_000_000_000;

    struct Rig {
        sniper: Sniper,
        journal_rx: mpsc::Receiver<JournalMsg>,
        event_rx: mpsc::UnboundedReceiver<TradeEvent>,
    }

    fn rig(balance: f64) -> Rig {
        let (journal_tx, journal_rx) = mpsc::channel(64);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let registry = crate::orchestrator::HealthRegistry::new();
        let sniper = Sniper::new(
            RiskConfig {
                max_positions: 5,
                max_per_symbol: 1,
                max_exposure_pct: 0.10,
                min_size_usd: 20.0,
                max_size_usd: 1_000.0,
                sl_bounds: [0.002, 0.10],
                tp_bounds: [0.002, 0.10],
                max_trigger_distance_pct: 0.10,
            },
            AccountState::new(balance),
            Vec::new(),
            Vec::new(),
            std::sync::Arc::new(DashMap::new()),
            journal_tx,
            event_tx,
            Metrics::new(),
            registry.handle("sniper"),
        );
        Rig {
            sniper,
            journal_rx,
            event_rx,
        }
    }

    fn condition(symbol: &str, size: f64, trigger: f64) -> TradeCondition {
        TradeCondition {
            id: uuid::Uuid::new_v4().to_string(),
            symbol: symbol.to_string(),
            direction: Direction::Long,
            trigger_price: trigger,
            trigger_rel: TriggerRel::Above,
            stop_loss_pct: 0.02,
            take_profit_pct: 0.01,
            size_usd: size,
            strategy_id: "llm".to_string(),
            pattern_id: None,
            reasoning: String::new(),
            created_at_ms: T0,
            valid_until_ms: now_ms() + 600_000,
        }
    }

    fn tick(symbol: &str, price: f64, ts_ms: i64) -> Tick {
        Tick {
            symbol: symbol.to_string(),
            price,
            ts_ms,
            change_24h: None,
        }
    }

    #[tokio::test]
    async fn trigger_then_take_profit() {
        let mut rig = rig(10_000.0);
        rig.sniper
            .install_conditions(vec![condition("BTC", 500.0, 50_000.0)]);

        rig.sniper.on_tick(&tick("BTC", 49_999.0, T0)).await;
        assert!(rig.sniper.positions.is_empty());

        rig.sniper.on_tick(&tick("BTC", 50_000.0, T0 + 1_000)).await;
        assert_eq!(rig.sniper.positions.len(), 1);
        assert_eq!(rig.sniper.condition_count(), 0);

        rig.sniper.on_tick(&tick("BTC", 50_500.0, T0 + 2_000)).await;
        assert!(rig.sniper.positions.is_empty());

        let account = &rig.sniper.account;
        assert!((account.total_pnl - 5.0).abs() < 1e-6);
        assert!((account.balance - 10_005.0).abs() < 1e-6);
        assert!((account.balance - account.available - account.in_positions).abs() < 1e-6);

        // Entry and exit both journaled, both events emitted.
        assert!(matches!(rig.journal_rx.recv().await, Some(JournalMsg::Entry(_))));
        match rig.journal_rx.recv().await {
            Some(JournalMsg::Exit(trade)) => {
                assert_eq!(trade.reason, ExitReason::TakeProfit);
                assert!((trade.pnl_usd - 5.0).abs() < 1e-6);
            }
            other => panic!("expected exit, got {:?}", other),
        }
        assert!(matches!(rig.event_rx.recv().await, Some(TradeEvent::Opened(_))));
        assert!(matches!(rig.event_rx.recv().await, Some(TradeEvent::Closed(_))));
    }

    #[tokio::test]
    async fn stop_wins_on_simultaneous_hit() {
        let mut rig = rig(10_000.0);
        let mut cond = condition("ETH", 100.0, 100.0);
        cond.stop_loss_pct = 0.02;
        cond.take_profit_pct = 0.01;
        rig.sniper.install_conditions(vec![cond]);

        rig.sniper.on_tick(&tick("ETH", 100.0, T0)).await;
        assert_eq!(rig.sniper.positions.len(), 1);

        // Single tick through both stop and target distance.
        rig.sniper.on_tick(&tick("ETH", 97.9, T0 + 1_000)).await;
        assert!(rig.sniper.positions.is_empty());
        let _ = rig.journal_rx.recv().await;
        match rig.journal_rx.recv().await {
            Some(JournalMsg::Exit(trade)) => {
                assert_eq!(trade.reason, ExitReason::StopLoss);
                assert!((trade.pnl_usd + 2.1).abs() < 0.01);
            }
            other => panic!("expected exit, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn exposure_cap_rejects_admission() {
        let mut rig = rig(10_000.0); // cap = 1000
        rig.sniper.install_conditions(vec![
            condition("BTC", 600.0, 100.0),
            condition("ETH", 600.0, 100.0),
        ]);
        rig.sniper.on_tick(&tick("BTC", 100.0, T0)).await;
        rig.sniper.on_tick(&tick("ETH", 100.0, T0 + 1)).await;

        assert_eq!(rig.sniper.positions.len(), 1);
        // The rejected condition stays installed until expiry.
        assert_eq!(rig.sniper.condition_count(), 1);
        assert!(rig.sniper.account.in_positions <= 1_000.0);
    }

    #[tokio::test]
    async fn one_position_per_symbol() {
        let mut rig = rig(100_000.0);
        rig.sniper.install_conditions(vec![
            condition("SOL", 100.0, 100.0),
            condition("SOL", 100.0, 99.0),
        ]);
        rig.sniper.on_tick(&tick("SOL", 100.0, T0)).await;
        assert_eq!(rig.sniper.positions.len(), 1);
        assert_eq!(rig.sniper.condition_count(), 1);
    }

    #[tokio::test]
    async fn blacklisted_symbol_is_not_installed() {
        let mut rig = rig(10_000.0);
        rig.sniper
            .blacklist
            .insert("DOGE".to_string(), "bad".to_string());
        rig.sniper.install_conditions(vec![
            condition("DOGE", 100.0, 1.0),
            condition("BTC", 100.0, 50_000.0),
        ]);
        assert_eq!(rig.sniper.condition_count(), 1);
        rig.sniper.on_tick(&tick("DOGE", 1.0, T0)).await;
        assert!(rig.sniper.positions.is_empty());
    }

    #[tokio::test]
    async fn expired_conditions_are_purged() {
        let mut rig = rig(10_000.0);
        let mut dead = condition("BTC", 100.0, 50_000.0);
        dead.valid_until_ms = now_ms() - 1;
        let live = condition("ETH", 100.0, 3_000.0);
        // install_conditions drops the already-expired one up front.
        rig.sniper.install_conditions(vec![dead, live.clone()]);
        assert_eq!(rig.sniper.condition_count(), 1);

        // A live one that expires later is purged by the sweep.
        rig.sniper.sweep_expired(live.valid_until_ms + 1);
        assert_eq!(rig.sniper.condition_count(), 0);
    }

    #[tokio::test]
    async fn pause_suppresses_entries_but_not_exits() {
        let mut rig = rig(10_000.0);
        rig.sniper
            .install_conditions(vec![condition("BTC", 500.0, 50_000.0)]);
        rig.sniper.on_tick(&tick("BTC", 50_000.0, T0)).await;
        assert_eq!(rig.sniper.positions.len(), 1);

        rig.sniper.paused = true;
        rig.sniper
            .install_conditions(vec![condition("ETH", 500.0, 3_000.0)]);
        rig.sniper.on_tick(&tick("ETH", 3_000.0, T0 + 1)).await;
        assert_eq!(rig.sniper.positions.len(), 1);

        // The open BTC position still exits while paused.
        rig.sniper.on_tick(&tick("BTC", 49_000.0, T0 + 2)).await;
        assert!(rig.sniper.positions.is_empty());
    }

    #[tokio::test]
    async fn snapshot_reflects_installed_state() {
        let mut rig = rig(10_000.0);
        let conds = vec![condition("BTC", 100.0, 50_000.0), condition("ETH", 100.0, 3_000.0)];
        rig.sniper.install_conditions(conds);
        let snapshot = rig.sniper.snapshot();
        assert_eq!(snapshot.conditions.len(), 2);
        assert!(snapshot.positions.is_empty());
        assert!((snapshot.account.balance - 10_000.0).abs() < 1e-9);
    }
}
