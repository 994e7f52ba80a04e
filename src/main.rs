use anyhow::Context;
use chatbattery::app::{serve, AppState};
use chatbattery::config::AppConfig;
use chatbattery::utils::{logger, validation::Validate};
use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "chatbattery")]
#[command(about = "Interactive battery material exploration server")]
struct Args {
    /// Path to TOML configuration file
    #[arg(short, long, default_value = "chatbattery.toml")]
    config: String,

    /// Override server.host from config
    #[arg(long)]
    host: Option<String>,

    /// Override server.port from config
    #[arg(long)]
    port: Option<u16>,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // 初始化日誌
    logger::init_server_logger(args.verbose, args.json_logs);

    tracing::info!("🚀 Starting chatbattery server");
    tracing::info!("📁 Loading configuration from: {}", args.config);

    let mut config = AppConfig::load_or_default(&args.config)
        .with_context(|| format!("failed to load config file '{}'", args.config))?;

    // 命令列覆蓋設定
    if let Some(host) = args.host {
        config.server.host = Some(host);
    }
    if let Some(port) = args.port {
        config.server.port = Some(port);
    }

    if let Err(e) = config.validate() {
        tracing::error!("❌ Configuration validation failed: {}", e);
        tracing::error!("💡 Suggestion: {}", e.recovery_suggestion());
        eprintln!("❌ {}", e.user_friendly_message());
        std::process::exit(e.exit_code().max(1));
    }

    let state = AppState::from_config(&config).context("failed to initialise services")?;
    serve(state, config.host(), config.port())
        .await
        .with_context(|| format!("server on {}:{} stopped", config.host(), config.port()))?;

    Ok(())
}
