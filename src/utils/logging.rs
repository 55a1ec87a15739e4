use anyhow::Result;
use tracing_subscriber::EnvFilter;

pub fn init_logging(log_level: &str) -> Result<()> {
    // Environment filter wins over the CLI level when RUST_LOG is set
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_ansi(true)
        .with_target(true)
        .init();

    Ok(())
}
