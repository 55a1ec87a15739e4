//! Price feed sources. The engine only sees the `PriceSource` contract; the
//! Binance adapter and the replay source are the two implementations.

use crate::config::AppConfig;
use crate::models::{Tick, TradingError, TradingResult};
use crate::price_bus::PriceBus;
use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

/// An async producer of ticks. Reconnect and backoff are the source's
/// responsibility; the bus only ever sees validated ticks.
#[async_trait]
pub trait PriceSource: Send + Sync {
    async fn run(&self, bus: Arc<PriceBus>) -> TradingResult<()>;
}

/// Binance combined-stream 24h ticker adapter.
pub struct BinanceFeed {
    ws_url: String,
    /// Exchange ticker (e.g. BTCUSDT) -> canonical symbol (e.g. BTC).
    reverse_map: HashMap<String, String>,
    max_backoff: Duration,
}

#[derive(Debug, Deserialize)]
struct CombinedStreamMessage {
    #[allow(dead_code)]
    stream: String,
    data: TickerData,
}

#[derive(Debug, Deserialize)]
struct TickerData {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "c")]
    last_price: String,
    #[serde(rename = "P")]
    change_pct: Option<String>,
    #[serde(rename = "E")]
    event_time_ms: i64,
}

impl BinanceFeed {
    pub fn new(config: &AppConfig) -> Self {
        let reverse_map = config
            .symbols
            .symbol_map
            .iter()
            .map(|(symbol, ticker)| (ticker.clone(), symbol.clone()))
            .collect();
        Self {
            ws_url: config.feed.ws_url.clone(),
            reverse_map,
            max_backoff: Duration::from_secs(config.feed.reconnect_max_backoff_s),
        }
    }

    fn stream_url(&self) -> String {
        let streams: Vec<String> = self
            .reverse_map
            .keys()
            .map(|ticker| format!("{}@ticker", ticker.to_lowercase()))
            .collect();
        format!("{}?streams={}", self.ws_url, streams.join("/"))
    }

    fn parse_tick(&self, text: &str) -> Option<Tick> {
        let msg: CombinedStreamMessage = serde_json::from_str(text).ok()?;
        let symbol = self.reverse_map.get(&msg.data.symbol)?.clone();
        let price: f64 = msg.data.last_price.parse().ok()?;
        let change_24h = msg.data.change_pct.and_then(|p| p.parse().ok());
        Some(Tick {
            symbol,
            price,
            ts_ms: msg.data.event_time_ms,
            change_24h,
        })
    }
}

#[async_trait]
impl PriceSource for BinanceFeed {
    async fn run(&self, bus: Arc<PriceBus>) -> TradingResult<()> {
        let url = self.stream_url();
        let mut backoff = Duration::from_secs(1);

        loop {
            info!("🌐 Connecting to price feed: {}", url);
            match connect_async(url.as_str()).await {
                Ok((stream, _)) => {
                    info!("✅ Price feed connected");
                    backoff = Duration::from_secs(1);
                    let (_, mut read) = stream.split();

                    while let Some(message) = read.next().await {
                        match message {
                            Ok(Message::Text(text)) => {
                                if let Some(tick) = self.parse_tick(&text) {
                                    bus.publish(tick);
                                } else {
                                    debug!("🌐 Unparsed feed message");
                                }
                            }
                            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
                            Ok(Message::Close(frame)) => {
                                warn!("🌐 Feed closed by server: {:?}", frame);
                                break;
                            }
                            Ok(_) => {}
                            Err(e) => {
                                warn!("🌐 Feed read error: {}", e);
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!("🌐 Feed connect failed: {}", e);
                }
            }

            warn!("🌐 Feed reconnecting in {:?}", backoff);
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(self.max_backoff);
        }
    }
}

/// Channel-fed source for tests and replay runs. The sender side decides
/// pacing; ticks pass through the same validation as live ones.
pub struct ReplayPriceSource {
    rx: Mutex<Option<mpsc::Receiver<Tick>>>,
}

impl ReplayPriceSource {
    pub fn new() -> (mpsc::Sender<Tick>, Self) {
        let (tx, rx) = mpsc::channel(1024);
        (
            tx,
            Self {
                rx: Mutex::new(Some(rx)),
            },
        )
    }
}

#[async_trait]
impl PriceSource for ReplayPriceSource {
    async fn run(&self, bus: Arc<PriceBus>) -> TradingResult<()> {
        let mut rx = self
            .rx
            .lock()
            .await
            .take()
            .ok_or_else(|| TradingError::DataError("replay source already running".to_string()))?;
        while let Some(tick) = rx.recv().await {
            bus.publish(tick);
        }
        info!("🔁 Replay source drained");
        Ok(())
    }
}
