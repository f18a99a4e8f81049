use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::BoxMakeWriter;

use callbridge_bot::directline::DirectLineConnector;
use callbridge_core::config::{Config, LoggingConfig};
use callbridge_gateway::{ConversationBridge, GatewayState};
use callbridge_telephony::acs::AcsCallControl;

#[derive(Parser)]
#[command(
    name = "callbridge",
    about = "Bridge phone calls to a conversational bot",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the webhook gateway
    Serve {
        /// Port to listen on (default: 3000)
        #[arg(long)]
        port: Option<u16>,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Show gateway status
    Status,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration
    Show,
    /// Check the configuration for problems
    Validate,
}

fn init_logging(logging: Option<&LoggingConfig>, verbose: bool) {
    let mut directives = if verbose {
        "debug".to_string()
    } else {
        logging
            .and_then(|l| l.level.clone())
            .unwrap_or_else(|| "info".to_string())
    };
    for extra in logging.map(|l| l.filters.as_slice()).unwrap_or_default() {
        directives.push(',');
        directives.push_str(extra);
    }

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&directives));

    let writer = match logging.map(|l| l.output.as_str()) {
        Some("stdout") => BoxMakeWriter::new(std::io::stdout),
        _ => BoxMakeWriter::new(std::io::stderr),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer);
    match logging.map(|l| l.format.as_str()) {
        Some("json") => builder.json().init(),
        _ => builder.init(),
    }
}

fn report_validation(config: &Config) -> bool {
    let (warnings, errors) = config.validate();
    for w in &warnings {
        tracing::warn!("{w}");
    }
    for e in &errors {
        tracing::error!("{e}");
    }
    errors.is_empty()
}

async fn serve(config: Config, port: Option<u16>) -> anyhow::Result<()> {
    if !report_validation(&config) {
        anyhow::bail!("Configuration is invalid; run `callbridge config validate`");
    }

    let port = port.unwrap_or_else(|| config.gateway_port());
    let telephony = config
        .telephony
        .as_ref()
        .context("Missing telephony section")?;
    let calls = Arc::new(AcsCallControl::from_config(telephony)?);

    let bot = config.bot();
    let connector = Arc::new(DirectLineConnector::from_config(&bot)?);
    let bridge = ConversationBridge::new(connector, bot.resolve_bot_id());

    let state = GatewayState::new(Arc::new(config), calls, bridge);

    #[cfg(feature = "metrics")]
    let state = match callbridge_gateway::metrics::install_prometheus_recorder() {
        Ok(handle) => state.with_prometheus(handle),
        Err(e) => {
            tracing::warn!("{e}");
            state
        }
    };

    tracing::info!("Starting Call Bridge gateway on port {port}");
    callbridge_gateway::start_gateway(Arc::new(state), port).await
}

async fn status(config: &Config, config_path: &std::path::Path) {
    let port = config.gateway_port();
    println!("Call Bridge v{}", env!("CARGO_PKG_VERSION"));
    println!("Config: {}", config_path.display());
    println!("Gateway port: {port}");
    println!(
        "Callback URL: {}",
        config
            .callback_base_url()
            .unwrap_or_else(|| "(not configured)".into())
    );

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(2))
        .build()
        .unwrap_or_default();
    let health = client
        .get(format!("http://127.0.0.1:{port}/health"))
        .send()
        .await;
    match health {
        Ok(resp) if resp.status().is_success() => {
            let body: serde_json::Value = resp.json().await.unwrap_or_default();
            println!("Status: running ({} active calls)", body["sessions"]);
        }
        _ => println!("Status: not running"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .map(std::path::PathBuf::from)
        .unwrap_or_else(Config::config_path);

    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load {}", config_path.display()))?;

    init_logging(config.logging.as_ref(), cli.verbose);

    match cli.command {
        Commands::Serve { port } => serve(config, port).await?,
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                let json = serde_json::to_string_pretty(&config)?;
                println!("{json}");
            }
            ConfigAction::Validate => {
                if !report_validation(&config) {
                    anyhow::bail!("Configuration is invalid");
                }
                println!("Configuration OK: {}", config_path.display());
            }
        },
        Commands::Status => status(&config, &config_path).await,
    }

    Ok(())
}
