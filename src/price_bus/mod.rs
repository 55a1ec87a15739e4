//! Fan-out of feed ticks to subscribers, plus a latest-tick cache per
//! symbol. Publishing never blocks: a subscriber whose queue is full loses
//! that tick and the loss is counted.

use crate::metrics::Metrics;
use crate::models::Tick;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub struct PriceBus {
    latest: DashMap<String, Tick>,
    subscribers: RwLock<Vec<mpsc::Sender<Tick>>>,
    metrics: Arc<Metrics>,
}

impl PriceBus {
    pub fn new(metrics: Arc<Metrics>) -> Arc<Self> {
        Arc::new(Self {
            latest: DashMap::new(),
            subscribers: RwLock::new(Vec::new()),
            metrics,
        })
    }

    /// Register a subscriber and return its receiving end. Delivery order
    /// per symbol matches arrival order.
    pub fn subscribe(&self, capacity: usize) -> mpsc::Receiver<Tick> {
        let (tx, rx) = mpsc::channel(capacity);
        self.subscribers.write().push(tx);
        rx
    }

    /// Validate and publish one tick. Duplicates of the latest tick for the
    /// symbol (same ts and price) are dropped.
    pub fn publish(&self, tick: Tick) {
        if let Err(e) = tick.validate() {
            self.metrics.ticks_rejected_total.inc();
            warn!("🚌 Tick rejected: {}", e);
            return;
        }

        if let Some(prev) = self.latest.get(&tick.symbol) {
            if prev.ts_ms == tick.ts_ms && prev.price == tick.price {
                return;
            }
        }
        self.latest.insert(tick.symbol.clone(), tick.clone());
        self.metrics.ticks_total.inc();

        let subscribers = self.subscribers.read();
        for tx in subscribers.iter() {
            if let Err(e) = tx.try_send(tick.clone()) {
                match e {
                    mpsc::error::TrySendError::Full(_) => {
                        debug!("🚌 Subscriber queue full, tick for {} dropped", tick.symbol);
                    }
                    mpsc::error::TrySendError::Closed(_) => {}
                }
            }
        }
    }

    pub fn latest(&self, symbol: &str) -> Option<Tick> {
        self.latest.get(symbol).map(|t| t.value().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tick(symbol: &str, price: f64, ts_ms: i64) -> Tick {
        Tick {
            symbol: symbol.to_string(),
            price,
            ts_ms,
            change_24h: None,
        }
    }

    #[tokio::test]
    async fn publish_updates_latest_and_delivers_in_order() {
        let bus = PriceBus::new(Metrics::new());
        let mut rx = bus.subscribe(16);

        bus.publish(tick("BTC", 50_000.0, 2_100_000_000_000));
        bus.publish(tick("BTC", 50_100.0, 2_100_000_001_000));

        assert_eq!(bus.latest("BTC").unwrap().price, 50_100.0);
        assert_eq!(rx.recv().await.unwrap().price, 50_000.0);
        assert_eq!(rx.recv().await.unwrap().price, 50_100.0);
    }

    #[tokio::test]
    async fn duplicate_ticks_are_dropped() {
        let bus = PriceBus::new(Metrics::new());
        let mut rx = bus.subscribe(16);

        bus.publish(tick("ETH", 3_000.0, 2_100_000_000_000));
        bus.publish(tick("ETH", 3_000.0, 2_100_000_000_000));
        bus.publish(tick("ETH", 3_001.0, 2_100_000_000_500));

        assert_eq!(rx.recv().await.unwrap().price, 3_000.0);
        assert_eq!(rx.recv().await.unwrap().price, 3_001.0);
    }

    #[tokio::test]
    async fn invalid_ticks_never_reach_subscribers() {
        let bus = PriceBus::new(Metrics::new());
        let mut rx = bus.subscribe(16);

        // Seconds-scale timestamp and non-positive price both rejected.
        bus.publish(tick("SOL", 150.0, 1_700_000_000));
        bus.publish(tick("SOL", -1.0, 2_100_000_000_000));
        bus.publish(tick("SOL", 150.0, 2_100_000_000_000));

        let delivered = rx.recv().await.unwrap();
        assert_eq!(delivered.ts_ms, 2_100_000_000_000);
        assert!(bus.latest("SOL").is_some());
    }
}
