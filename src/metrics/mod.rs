//! Process metrics. One registry, scraped by the operator API at /metrics.

use prometheus::{Gauge, IntCounter, IntGauge, Opts, Registry};
use std::sync::Arc;

pub struct Metrics {
    pub registry: Registry,
    pub ticks_total: IntCounter,
    pub ticks_rejected_total: IntCounter,
    pub entries_total: IntCounter,
    pub exits_total: IntCounter,
    pub entries_rejected_total: IntCounter,
    pub dropped_blacklisted_total: IntCounter,
    pub conditions_installed_total: IntCounter,
    pub conditions_expired_total: IntCounter,
    pub llm_calls_total: IntCounter,
    pub llm_failures_total: IntCounter,
    pub insights_dropped_total: IntCounter,
    pub adaptations_applied_total: IntCounter,
    pub adaptations_skipped_total: IntCounter,
    pub rollbacks_total: IntCounter,
    pub reflections_total: IntCounter,
    pub balance: Gauge,
    pub open_positions: IntGauge,
    pub active_conditions: IntGauge,
    pub journal_queue_depth: IntGauge,
}

impl Metrics {
    pub fn new() -> Arc<Self> {
        let registry = Registry::new();

        fn counter(registry: &Registry, name: &str, help: &str) -> IntCounter {
            let c = IntCounter::with_opts(Opts::new(name, help)).unwrap();
            registry.register(Box::new(c.clone())).unwrap();
            c
        }
        fn int_gauge(registry: &Registry, name: &str, help: &str) -> IntGauge {
            let g = IntGauge::with_opts(Opts::new(name, help)).unwrap();
            registry.register(Box::new(g.clone())).unwrap();
            g
        }

        let balance = Gauge::with_opts(Opts::new("account_balance_usd", "Paper account balance")).unwrap();
        registry.register(Box::new(balance.clone())).unwrap();

        Arc::new(Self {
            ticks_total: counter(&registry, "ticks_total", "Ticks accepted by the price bus"),
            ticks_rejected_total: counter(&registry, "ticks_rejected_total", "Ticks rejected on ingress validation"),
            entries_total: counter(&registry, "entries_total", "Positions opened"),
            exits_total: counter(&registry, "exits_total", "Positions closed"),
            entries_rejected_total: counter(&registry, "entries_rejected_total", "Entries rejected by admission checks"),
            dropped_blacklisted_total: counter(&registry, "dropped_blacklisted_total", "Proposed conditions dropped for blacklisted symbols"),
            conditions_installed_total: counter(&registry, "conditions_installed_total", "Conditions installed on the sniper"),
            conditions_expired_total: counter(&registry, "conditions_expired_total", "Conditions purged on expiry"),
            llm_calls_total: counter(&registry, "llm_calls_total", "Chat completions attempted"),
            llm_failures_total: counter(&registry, "llm_failures_total", "Chat completions failed"),
            insights_dropped_total: counter(&registry, "insights_dropped_total", "Reflection insights dropped as malformed"),
            adaptations_applied_total: counter(&registry, "adaptations_applied_total", "Adaptations applied"),
            adaptations_skipped_total: counter(&registry, "adaptations_skipped_total", "Adaptations skipped by guards"),
            rollbacks_total: counter(&registry, "rollbacks_total", "Adaptations rolled back"),
            reflections_total: counter(&registry, "reflections_total", "Reflection cycles completed"),
            balance,
            open_positions: int_gauge(&registry, "open_positions", "Open position count"),
            active_conditions: int_gauge(&registry, "active_conditions", "Active condition count"),
            journal_queue_depth: int_gauge(&registry, "journal_queue_depth", "Journal writer queue depth"),
            registry,
        })
    }
}
