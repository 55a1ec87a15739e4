use anyhow::Result;
use clap::Parser;
use sage_bot::config::AppConfig;
use sage_bot::feed::{BinanceFeed, PriceSource, ReplayPriceSource};
use sage_bot::llm::HttpChatClient;
use sage_bot::models::TradingError;
use sage_bot::orchestrator::SageBot;
use sage_bot::utils::logging;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "configs/sage.toml")]
    config: String,

    /// Log level
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Override the starting paper balance
    #[arg(long)]
    paper_balance: Option<f64>,

    /// Run without the live feed; ticks arrive only via replay
    #[arg(long)]
    replay: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    match dotenvy::dotenv() {
        Ok(path) => eprintln!("✅ Loaded .env from {:?}", path),
        Err(_) => eprintln!("ℹ️ No .env file found"),
    }

    let args = Args::parse();
    logging::init_logging(&args.log_level)?;

    info!("🤖 sage-bot {} starting up", env!("CARGO_PKG_VERSION"));
    info!("Config file: {}", args.config);

    // Config errors are exit code 1; nothing trades on silent defaults.
    let mut config = match AppConfig::load_from_path(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!("❌ Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };
    if let Some(balance) = args.paper_balance {
        config.engine.initial_balance = balance;
    }
    if let Err(e) = config.validate() {
        error!("❌ Invalid configuration: {}", e);
        std::process::exit(1);
    }
    info!(
        "✅ Configuration loaded ({} tradeable symbols)",
        config.symbols.tradeable_symbols.len()
    );

    let chat = match HttpChatClient::new(&config.llm) {
        Ok(chat) => Arc::new(chat),
        Err(e) => {
            error!("❌ Failed to build chat client: {}", e);
            std::process::exit(1);
        }
    };

    let source: Arc<dyn PriceSource> = if args.replay {
        warn!("🔁 Replay mode: live feed disabled");
        let (_tx, source) = ReplayPriceSource::new();
        Arc::new(source)
    } else {
        Arc::new(BinanceFeed::new(&config))
    };

    let bot = match SageBot::new(config, chat, source).await {
        Ok(bot) => bot,
        Err(TradingError::SchemaError(e)) => {
            error!("❌ Schema mismatch: {}", e);
            std::process::exit(2);
        }
        Err(e) => {
            error!("❌ Engine startup failed: {}", e);
            std::process::exit(3);
        }
    };

    if let Err(e) = bot.run().await {
        error!("❌ Engine terminated abnormally: {}", e);
        std::process::exit(3);
    }

    info!("👋 Clean exit");
    Ok(())
}
