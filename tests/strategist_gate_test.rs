//! Strategist generation gates: blacklist filtering, validation bounds,
//! and regime suppression, driven with a scripted chat client.

use sage_bot::config::AppConfig;
use sage_bot::journal::JournalMsg;
use sage_bot::knowledge::KnowledgeStore;
use sage_bot::llm::MockChatClient;
use sage_bot::metrics::Metrics;
use sage_bot::models::*;
use sage_bot::orchestrator::HealthRegistry;
use sage_bot::price_bus::PriceBus;
use sage_bot::sniper::Sniper;
use sage_bot::store::Database;
use sage_bot::strategist::Strategist;
use sage_bot::utils::time::now_ms;
use std::sync::Arc;
use tokio::sync::mpsc;

struct Rig {
    strategist: Strategist,
    knowledge: KnowledgeStore,
    metrics: Arc<Metrics>,
    bus: Arc<PriceBus>,
    _journal_rx: mpsc::Receiver<JournalMsg>,
}

fn rig(responses: Vec<String>) -> Rig {
    let config = AppConfig::default();
    let knowledge = KnowledgeStore::new(Database::open_in_memory().unwrap()).unwrap();
    let metrics = Metrics::new();
    let health = HealthRegistry::new();
    let bus = PriceBus::new(Arc::clone(&metrics));

    let tick_rx = bus.subscribe(1024);
    let (journal_tx, journal_rx) = mpsc::channel(64);
    let (event_tx, _event_rx) = mpsc::unbounded_channel();

    let sniper = Sniper::new(
        config.risk.clone(),
        AccountState::new(config.engine.initial_balance),
        Vec::new(),
        Vec::new(),
        knowledge.blacklist_view(),
        journal_tx,
        event_tx,
        Arc::clone(&metrics),
        health.handle("sniper"),
    );
    let (handle, _task) = sniper.spawn(tick_rx);

    let strategist = Strategist::new(
        config,
        knowledge.clone(),
        Arc::new(MockChatClient::new(responses)),
        handle,
        Arc::clone(&bus),
        Arc::clone(&metrics),
        health.handle("strategist"),
    );

    Rig {
        strategist,
        knowledge,
        metrics,
        bus,
        _journal_rx: journal_rx,
    }
}

fn publish(bus: &PriceBus, symbol: &str, price: f64, change: f64) {
    bus.publish(Tick {
        symbol: symbol.to_string(),
        price,
        ts_ms: now_ms(),
        change_24h: Some(change),
    });
}

fn proposal(symbol: &str, trigger: f64) -> serde_json::Value {
    serde_json::json!({
        "symbol": symbol,
        "direction": "LONG",
        "trigger_price": trigger,
        "trigger_rel": "ABOVE",
        "stop_loss_pct": 0.02,
        "take_profit_pct": 0.01,
        "base_size_usd": 50.0,
        "reasoning": "momentum continuation",
        "valid_for_seconds": 120
    })
}

#[tokio::test]
async fn blacklisted_symbol_in_llm_response_is_dropped() {
    let response = serde_json::json!([proposal("DOGE", 0.105), proposal("BTC", 50_400.0)]);
    let mut rig = rig(vec![response.to_string()]);

    rig.knowledge
        .set_coin_status("DOGE", CoinStatus::Blacklisted, Some("losing streak"))
        .unwrap();
    publish(&rig.bus, "BTC", 50_000.0, 1.5);
    publish(&rig.bus, "DOGE", 0.10, 0.5);

    let outcome = rig.strategist.generate_once().await;
    match outcome {
        GenerationOutcome::Conditions(conds) => {
            assert_eq!(conds.len(), 1);
            assert_eq!(conds[0].symbol, "BTC");
        }
        other => panic!("expected conditions, got {:?}", outcome_name(&other)),
    }
    assert_eq!(rig.metrics.dropped_blacklisted_total.get(), 1);
}

#[tokio::test]
async fn out_of_bounds_proposals_drop_individually() {
    let mut bad_stop = proposal("ETH", 3_010.0);
    bad_stop["stop_loss_pct"] = serde_json::json!(0.5);
    let mut far_trigger = proposal("SOL", 300.0); // spot will be 150
    far_trigger["trigger_price"] = serde_json::json!(300.0);
    let response = serde_json::json!([bad_stop, far_trigger, proposal("BTC", 50_100.0)]);
    let mut rig = rig(vec![response.to_string()]);

    publish(&rig.bus, "BTC", 50_000.0, 0.5);
    publish(&rig.bus, "ETH", 3_000.0, 0.5);
    publish(&rig.bus, "SOL", 150.0, 0.5);

    match rig.strategist.generate_once().await {
        GenerationOutcome::Conditions(conds) => {
            assert_eq!(conds.len(), 1);
            assert_eq!(conds[0].symbol, "BTC");
            // Validity clamped into [30s, 15min].
            let window = conds[0].valid_until_ms - conds[0].created_at_ms;
            assert!((30_000..=900_000).contains(&window));
        }
        _ => panic!("expected one surviving condition"),
    }
}

#[tokio::test]
async fn no_trade_rule_suppresses_generation_entirely() {
    // The mock would return a proposal, but the regime gate runs first.
    let response = serde_json::json!([proposal("BTC", 50_100.0)]);
    let mut rig = rig(vec![response.to_string()]);

    rig.knowledge
        .add_regime_rule(&RegimeRule {
            rule_id: "btc_dump_guard".to_string(),
            description: "stand down while BTC dumps".to_string(),
            condition: RuleCondition::BtcChangeBelow { pct: -2.0 },
            action: RegimeAction::NoTrade,
            times_triggered: 0,
            estimated_saves: 0.0,
            active: true,
            created_at_ms: now_ms(),
        })
        .unwrap();

    publish(&rig.bus, "BTC", 50_000.0, -5.0);

    match rig.strategist.generate_once().await {
        GenerationOutcome::Suppressed { rule_id } => {
            assert_eq!(rule_id, "btc_dump_guard");
        }
        _ => panic!("expected suppression"),
    }
    // No LLM spend on a suppressed cycle.
    assert_eq!(rig.metrics.llm_calls_total.get(), 0);
    // The suppressor's trigger counter advanced.
    let rules = rig.knowledge.get_active_rules().unwrap();
    assert_eq!(rules[0].times_triggered, 1);
}

#[tokio::test]
async fn empty_llm_response_is_acceptable() {
    let mut rig = rig(vec!["```json\n[]\n```".to_string()]);
    publish(&rig.bus, "BTC", 50_000.0, 0.5);
    assert!(matches!(
        rig.strategist.generate_once().await,
        GenerationOutcome::Empty
    ));
}

fn outcome_name(outcome: &GenerationOutcome) -> &'static str {
    match outcome {
        GenerationOutcome::Conditions(_) => "conditions",
        GenerationOutcome::Suppressed { .. } => "suppressed",
        GenerationOutcome::Empty => "empty",
        GenerationOutcome::Failed(_) => "failed",
    }
}
