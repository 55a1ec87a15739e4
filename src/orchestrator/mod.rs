//! Lifecycle owner: wires the subsystems together, drives the periodic
//! timers, aggregates health, and handles graceful shutdown with runtime
//! state persistence.

use crate::adaptation::AdaptationEngine;
use crate::api;
use crate::config::AppConfig;
use crate::effectiveness::EffectivenessMonitor;
use crate::feed::PriceSource;
use crate::journal::{self, Journal, JournalMsg, ENRICH_OFFSETS_MIN};
use crate::knowledge::KnowledgeStore;
use crate::llm::ChatClient;
use crate::metrics::Metrics;
use crate::models::{
    AccountState, ComponentHealth, ExitReason, HealthStatus, RuntimeState, TradingResult,
};
use crate::price_bus::PriceBus;
use crate::quick_update::QuickUpdate;
use crate::reflection::{ReflectionEngine, ReflectionScheduler};
use crate::sniper::{Sniper, SniperHandle, TradeEvent};
use crate::store::Database;
use crate::strategist::Strategist;
use crate::utils::time::{now_ms, MINUTE_MS};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Per-component health, aggregated to the worst status overall.
#[derive(Clone)]
pub struct HealthRegistry {
    inner: Arc<DashMap<&'static str, ComponentHealth>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(DashMap::new()),
        }
    }

    pub fn handle(&self, name: &'static str) -> HealthHandle {
        self.inner.insert(name, ComponentHealth::healthy(now_ms()));
        HealthHandle {
            name,
            inner: Arc::clone(&self.inner),
        }
    }

    pub fn all(&self) -> Vec<(String, ComponentHealth)> {
        self.inner
            .iter()
            .map(|e| (e.key().to_string(), e.value().clone()))
            .collect()
    }

    pub fn overall(&self) -> HealthStatus {
        self.inner
            .iter()
            .map(|e| e.value().status)
            .max()
            .unwrap_or(HealthStatus::Healthy)
    }
}

impl Default for HealthRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone)]
pub struct HealthHandle {
    name: &'static str,
    inner: Arc<DashMap<&'static str, ComponentHealth>>,
}

impl HealthHandle {
    pub fn ok(&self) {
        if let Some(mut health) = self.inner.get_mut(self.name) {
            health.status = HealthStatus::Healthy;
            health.last_activity_ms = now_ms();
            health.detail = None;
        }
    }

    pub fn error(&self, detail: &str) {
        if let Some(mut health) = self.inner.get_mut(self.name) {
            health.error_count += 1;
            health.detail = Some(detail.to_string());
        }
    }

    pub fn degrade(&self, detail: &str) {
        if let Some(mut health) = self.inner.get_mut(self.name) {
            health.status = HealthStatus::Degraded;
            health.error_count += 1;
            health.detail = Some(detail.to_string());
        }
    }

    pub fn fail(&self, detail: &str) {
        if let Some(mut health) = self.inner.get_mut(self.name) {
            health.status = HealthStatus::Failed;
            health.error_count += 1;
            health.detail = Some(detail.to_string());
        }
    }

    pub fn stop(&self) {
        if let Some(mut health) = self.inner.get_mut(self.name) {
            health.status = HealthStatus::Stopped;
        }
    }
}

/// The assembled engine.
pub struct SageBot {
    config: AppConfig,
    knowledge: KnowledgeStore,
    journal: Journal,
    metrics: Arc<Metrics>,
    health: HealthRegistry,
    sniper_handle: SniperHandle,
    scheduler: Arc<ReflectionScheduler>,
    adapter: AdaptationEngine,
    tasks: Vec<JoinHandle<()>>,
}

impl SageBot {
    /// Build and wire every subsystem. Startup order: store (schema check),
    /// runtime state, snapshots, then tasks.
    pub async fn new(
        config: AppConfig,
        chat: Arc<dyn ChatClient>,
        source: Arc<dyn PriceSource>,
    ) -> TradingResult<Self> {
        info!("🔧 Initializing engine components...");

        let db = Database::open(&config.storage.db_path)?;
        let knowledge = KnowledgeStore::new(db.clone())?;
        let journal = Journal::new(db);
        let metrics = Metrics::new();
        let health = HealthRegistry::new();
        let price_bus = PriceBus::new(Arc::clone(&metrics));

        // Restore runtime state and snapshots; expired conditions drop here.
        let runtime = knowledge.get_runtime_state()?.unwrap_or(RuntimeState {
            balance: config.engine.initial_balance,
            ..Default::default()
        });
        let restored_conditions = knowledge.load_conditions_snapshot(now_ms())?;
        let restored_positions = knowledge.load_positions_snapshot()?;
        let in_positions: f64 = restored_positions.iter().map(|p| p.size_usd).sum();

        let mut account = AccountState::new(runtime.balance);
        account.in_positions = in_positions;
        account.available = account.balance - in_positions;
        account.total_pnl = journal.total_closed_pnl()?;

        info!(
            "💾 Restored state: balance {:.2}, {} conditions, {} positions",
            account.balance,
            restored_conditions.len(),
            restored_positions.len()
        );

        // Channels: one tick stream into the sniper, one bounded journal
        // queue, one unbounded trade-event stream out.
        let tick_rx = price_bus.subscribe(1024);
        let (journal_tx, journal_rx) = mpsc::channel(config.storage.journal_queue_bound);
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let sniper = Sniper::new(
            config.risk.clone(),
            account,
            restored_conditions,
            restored_positions,
            knowledge.blacklist_view(),
            journal_tx.clone(),
            event_tx,
            Arc::clone(&metrics),
            health.handle("sniper"),
        );

        let scheduler =
            ReflectionScheduler::new(runtime.last_reflection_ms, runtime.trades_since_reflection);
        let adapter = AdaptationEngine::new(
            knowledge.clone(),
            config.learning.clone(),
            Arc::clone(&metrics),
        );
        let quick_update = QuickUpdate::new(
            knowledge.clone(),
            journal.clone(),
            config.learning.clone(),
            Arc::clone(&scheduler),
        );

        let mut tasks = Vec::new();

        // Feed -> bus.
        {
            let bus = Arc::clone(&price_bus);
            let feed_health = health.handle("feed");
            tasks.push(tokio::spawn(async move {
                if let Err(e) = source.run(bus).await {
                    error!("🌐 Price source terminated: {}", e);
                    feed_health.fail(&e.to_string());
                }
            }));
        }

        // Sniper actor.
        let (sniper_handle, sniper_task) = sniper.spawn(tick_rx);
        tasks.push(sniper_task);

        // Journal writer.
        tasks.push(tokio::spawn(journal::run_writer(
            journal.clone(),
            journal_rx,
            health.handle("journal"),
        )));

        // Trade event fan-out: quick update + post-exit enrichment.
        tasks.push(tokio::spawn(fan_out_events(
            event_rx,
            quick_update,
            Arc::clone(&price_bus),
            journal_tx,
            health.handle("quick_update"),
        )));

        // Strategist.
        let strategist = Strategist::new(
            config.clone(),
            knowledge.clone(),
            Arc::clone(&chat),
            sniper_handle.clone(),
            Arc::clone(&price_bus),
            Arc::clone(&metrics),
            health.handle("strategist"),
        );
        tasks.push(tokio::spawn(strategist.run()));

        // Reflection.
        let reflection = ReflectionEngine::new(
            journal.clone(),
            adapter.clone(),
            chat,
            config.learning.clone(),
            Arc::clone(&scheduler),
            Arc::clone(&metrics),
            health.handle("reflection"),
        );
        tasks.push(tokio::spawn(reflection.run()));

        // Effectiveness sweeps.
        let monitor = EffectivenessMonitor::new(
            journal.clone(),
            adapter.clone(),
            config.learning.clone(),
            health.handle("effectiveness"),
        );
        tasks.push(tokio::spawn(monitor.run()));

        info!("✅ All engine components initialized");

        Ok(Self {
            config,
            knowledge,
            journal,
            metrics,
            health,
            sniper_handle,
            scheduler,
            adapter,
            tasks,
        })
    }

    pub fn sniper(&self) -> SniperHandle {
        self.sniper_handle.clone()
    }

    /// Main supervision loop. Returns after a clean shutdown.
    pub async fn run(mut self) -> TradingResult<()> {
        if self.config.api.enabled {
            let ctx = api::ApiContext {
                sniper: self.sniper_handle.clone(),
                knowledge: self.knowledge.clone(),
                journal: self.journal.clone(),
                adapter: self.adapter.clone(),
                scheduler: Arc::clone(&self.scheduler),
                health: self.health.clone(),
                metrics: Arc::clone(&self.metrics),
            };
            let port = self.config.api.port;
            self.tasks.push(tokio::spawn(async move {
                if let Err(e) = api::serve(ctx, port).await {
                    error!("🌍 API server error: {}", e);
                }
            }));
        }

        let mut flush =
            tokio::time::interval(Duration::from_secs(self.config.storage.runtime_flush_s));
        flush.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut health_report = tokio::time::interval(Duration::from_secs(30));
        health_report.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!("🚀 Engine running");
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("🛑 Shutdown signal received");
                    break;
                }
                _ = flush.tick() => {
                    if let Err(e) = self.flush_runtime_state().await {
                        warn!("💾 Runtime state flush failed: {}", e);
                    }
                }
                _ = health_report.tick() => {
                    let overall = self.health.overall();
                    if overall == HealthStatus::Healthy {
                        info!("💓 Health: {}", overall);
                    } else {
                        warn!("💓 Health: {} ({:?})", overall, self.health.all()
                            .iter()
                            .filter(|(_, h)| h.status != HealthStatus::Healthy)
                            .map(|(n, h)| format!("{}={}", n, h.status))
                            .collect::<Vec<_>>());
                    }
                }
            }
        }

        self.shutdown().await;
        Ok(())
    }

    async fn flush_runtime_state(&self) -> TradingResult<()> {
        let Some(snapshot) = self.sniper_handle.snapshot().await else {
            return Ok(());
        };
        self.knowledge.save_conditions_snapshot(&snapshot.conditions)?;
        self.knowledge.save_positions_snapshot(&snapshot.positions)?;
        self.knowledge.save_runtime_state(&RuntimeState {
            last_reflection_ms: self.scheduler.last_reflection_ms(),
            trades_since_reflection: self.scheduler.trades_since(),
            balance: snapshot.account.balance,
            paused: snapshot.paused,
        })?;
        Ok(())
    }

    /// Ordered teardown: close positions as SHUTDOWN exits, let the journal
    /// drain, persist the final snapshot, then stop the tasks.
    async fn shutdown(mut self) {
        info!("🛑 Shutting down...");

        let closed = self.sniper_handle.close_all(ExitReason::Shutdown).await;
        if closed > 0 {
            info!("🛑 Closed {} open positions as SHUTDOWN", closed);
        }

        // Give the journal writer a moment to drain the exit rows.
        tokio::time::sleep(Duration::from_millis(300)).await;

        if let Err(e) = self.flush_runtime_state().await {
            warn!("💾 Final state flush failed: {}", e);
        }

        // 5s unwind budget; stragglers are abandoned with a warning.
        let mut tasks = std::mem::take(&mut self.tasks);
        for task in &tasks {
            task.abort();
        }
        let drain = async {
            for task in tasks.drain(..) {
                let _ = task.await;
            }
        };
        if tokio::time::timeout(Duration::from_secs(5), drain).await.is_err() {
            warn!("🛑 Subsystems did not unwind in 5s, abandoning");
        }
        info!("✅ Shutdown complete");
    }
}

/// Consume trade events: quick-update on closes and schedule the +1/+5/+15
/// minute price samples for missed-profit analysis.
async fn fan_out_events(
    mut event_rx: mpsc::UnboundedReceiver<TradeEvent>,
    quick_update: QuickUpdate,
    price_bus: Arc<PriceBus>,
    journal_tx: mpsc::Sender<JournalMsg>,
    health: HealthHandle,
) {
    while let Some(event) = event_rx.recv().await {
        match event {
            TradeEvent::Opened(_) => {}
            TradeEvent::Closed(trade) => {
                if let Err(e) = quick_update.on_trade_closed(&trade) {
                    warn!("📈 Quick update failed for {}: {}", trade.position.symbol, e);
                    health.error(&e.to_string());
                } else {
                    health.ok();
                }

                let symbol = trade.position.symbol.clone();
                let trade_id = trade.position.id.clone();
                let bus = Arc::clone(&price_bus);
                let tx = journal_tx.clone();
                tokio::spawn(async move {
                    let mut slept_min = 0u32;
                    for offset_min in ENRICH_OFFSETS_MIN {
                        let delta = (offset_min - slept_min) as u64 * MINUTE_MS as u64;
                        tokio::time::sleep(Duration::from_millis(delta)).await;
                        slept_min = offset_min;
                        if let Some(tick) = bus.latest(&symbol) {
                            let _ = tx
                                .send(JournalMsg::Enrich {
                                    trade_id: trade_id.clone(),
                                    offset_min,
                                    price: tick.price,
                                })
                                .await;
                        }
                    }
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overall_health_is_the_worst_component() {
        let registry = HealthRegistry::new();
        let a = registry.handle("a");
        let b = registry.handle("b");
        assert_eq!(registry.overall(), HealthStatus::Healthy);

        b.degrade("queue backed up");
        assert_eq!(registry.overall(), HealthStatus::Degraded);

        a.fail("gone");
        assert_eq!(registry.overall(), HealthStatus::Failed);

        a.ok();
        assert_eq!(registry.overall(), HealthStatus::Degraded);
    }

    #[test]
    fn error_counts_accumulate_without_changing_status() {
        let registry = HealthRegistry::new();
        let handle = registry.handle("c");
        handle.error("transient");
        handle.error("transient");
        let health = &registry.all()[0].1;
        assert_eq!(health.error_count, 2);
        assert_eq!(health.status, HealthStatus::Healthy);
    }
}
