use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Top-level application configuration. One instance is loaded at startup,
/// validated, and injected into every component; nothing else reads the
/// environment for trading parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub engine: EngineConfig,
    pub symbols: SymbolsConfig,
    pub risk: RiskConfig,
    pub strategist: StrategistConfig,
    pub learning: LearningConfig,
    pub llm: LlmConfig,
    pub storage: StorageConfig,
    pub feed: FeedConfig,
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub initial_balance: f64,
    pub log_level: String,
}

/// Canonical symbol set and its exchange-ticker mapping. The two must stay
/// equal as sets; `validate()` refuses startup otherwise.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolsConfig {
    pub tradeable_symbols: Vec<String>,
    pub symbol_map: HashMap<String, String>,
}

impl SymbolsConfig {
    pub fn exchange_ticker(&self, symbol: &str) -> Option<&str> {
        self.symbol_map.get(symbol).map(|s| s.as_str())
    }

    pub fn is_known(&self, symbol: &str) -> bool {
        self.symbol_map.contains_key(symbol)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    pub max_positions: usize,
    pub max_per_symbol: usize,
    pub max_exposure_pct: f64,
    pub min_size_usd: f64,
    pub max_size_usd: f64,
    pub sl_bounds: [f64; 2],
    pub tp_bounds: [f64; 2],
    /// Max distance of a trigger from spot, as a fraction.
    pub max_trigger_distance_pct: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategistConfig {
    pub period_s: u64,
    pub max_conditions_per_cycle: usize,
    pub validity_bounds_s: [u64; 2],
    pub llm_timeout_s: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearningConfig {
    pub reflection_period_h: u64,
    pub reflection_min_trades: u32,
    pub first_reflection_min_trades: u32,
    pub min_trades_for_adaptation: u32,
    pub blacklist_wr: f64,
    pub reduced_wr: f64,
    pub favored_wr: f64,
    pub adaptation_cooldown_h: u64,
    pub effectiveness_min_trades: u32,
    pub effectiveness_max_age_h: u64,
    pub reflection_llm_timeout_s: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    pub endpoint: String,
    pub model: String,
    #[serde(default)]
    pub api_key_env: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub db_path: String,
    pub runtime_flush_s: u64,
    pub journal_queue_bound: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    pub ws_url: String,
    pub reconnect_max_backoff_s: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub enabled: bool,
    pub port: u16,
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_path("configs/sage.toml")
    }

    pub fn load_from_path<P: AsRef<Path>>(config_path: P) -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let defaults = ConfigBuilder::try_from(&AppConfig::default())?;
        let builder = ConfigBuilder::builder()
            .add_source(defaults)
            .add_source(File::with_name(config_path.as_ref().to_str().unwrap_or("")).required(false))
            .add_source(
                Environment::with_prefix("SAGEBOT")
                    .prefix_separator("__")
                    .separator("__"),
            );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Fail-fast startup validation. A failure here is exit code 1; nothing
    /// silently substitutes defaults that would alter the tradeable set.
    pub fn validate(&self) -> Result<(), String> {
        if self.symbols.tradeable_symbols.is_empty() {
            return Err("tradeable_symbols must not be empty".to_string());
        }

        // Set equality between the tradeable list and the symbol map keys.
        let listed: std::collections::HashSet<&str> =
            self.symbols.tradeable_symbols.iter().map(|s| s.as_str()).collect();
        let mapped: std::collections::HashSet<&str> =
            self.symbols.symbol_map.keys().map(|s| s.as_str()).collect();
        if listed != mapped {
            let missing: Vec<&&str> = listed.difference(&mapped).collect();
            let extra: Vec<&&str> = mapped.difference(&listed).collect();
            return Err(format!(
                "tradeable_symbols and symbol_map keys differ (unmapped: {:?}, unlisted: {:?})",
                missing, extra
            ));
        }

        if self.engine.initial_balance <= 0.0 {
            return Err("initial_balance must be positive".to_string());
        }
        if self.risk.max_positions == 0 {
            return Err("max_positions must be at least 1".to_string());
        }
        if !(0.0..=1.0).contains(&self.risk.max_exposure_pct) {
            return Err("max_exposure_pct must be within [0, 1]".to_string());
        }
        if self.risk.min_size_usd > self.risk.max_size_usd {
            return Err("min_size_usd must not exceed max_size_usd".to_string());
        }
        if self.risk.sl_bounds[0] > self.risk.sl_bounds[1]
            || self.risk.tp_bounds[0] > self.risk.tp_bounds[1]
        {
            return Err("sl_bounds/tp_bounds must be ordered [min, max]".to_string());
        }
        if self.strategist.validity_bounds_s[0] > self.strategist.validity_bounds_s[1] {
            return Err("validity_bounds_s must be ordered [min, max]".to_string());
        }
        for (name, wr) in [
            ("blacklist_wr", self.learning.blacklist_wr),
            ("reduced_wr", self.learning.reduced_wr),
            ("favored_wr", self.learning.favored_wr),
        ] {
            if !(0.0..=1.0).contains(&wr) {
                return Err(format!("{} must be within [0, 1]", name));
            }
        }
        if self.llm.endpoint.is_empty() {
            return Err("llm.endpoint must be set".to_string());
        }
        Ok(())
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        let symbols = vec![
            "BTC", "ETH", "SOL", "BNB", "XRP", "ADA", "DOGE", "AVAX", "DOT", "LINK",
            "MATIC", "LTC", "ATOM", "UNI", "APT", "ARB", "OP", "NEAR", "INJ", "SUI",
        ];
        let symbol_map = symbols
            .iter()
            .map(|s| (s.to_string(), format!("{}USDT", s)))
            .collect();

        Self {
            engine: EngineConfig {
                initial_balance: 10_000.0,
                log_level: "info".to_string(),
            },
            symbols: SymbolsConfig {
                tradeable_symbols: symbols.iter().map(|s| s.to_string()).collect(),
                symbol_map,
            },
            risk: RiskConfig {
                max_positions: 5,
                max_per_symbol: 1,
                max_exposure_pct: 0.10,
                min_size_usd: 20.0,
                max_size_usd: 100.0,
                sl_bounds: [0.002, 0.10],
                tp_bounds: [0.002, 0.10],
                max_trigger_distance_pct: 0.10,
            },
            strategist: StrategistConfig {
                period_s: 180,
                max_conditions_per_cycle: 5,
                validity_bounds_s: [30, 900],
                llm_timeout_s: 20,
            },
            learning: LearningConfig {
                reflection_period_h: 1,
                reflection_min_trades: 10,
                first_reflection_min_trades: 5,
                min_trades_for_adaptation: 5,
                blacklist_wr: 0.30,
                reduced_wr: 0.45,
                favored_wr: 0.60,
                adaptation_cooldown_h: 24,
                effectiveness_min_trades: 10,
                effectiveness_max_age_h: 24,
                reflection_llm_timeout_s: 60,
            },
            llm: LlmConfig {
                endpoint: "https://api.mistral.ai/v1/chat/completions".to_string(),
                model: "mistral-large-latest".to_string(),
                api_key_env: "LLM_API_KEY".to_string(),
            },
            storage: StorageConfig {
                db_path: "data/store.db".to_string(),
                runtime_flush_s: 10,
                journal_queue_bound: 10_000,
            },
            feed: FeedConfig {
                ws_url: "wss://stream.binance.com:9443/stream".to_string(),
                reconnect_max_backoff_s: 60,
            },
            api: ApiConfig {
                enabled: true,
                port: 8084,
            },
        }
    }
}
