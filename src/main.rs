use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing::{error, info};

use fleetd_core::config::AgentConfig;

const EXIT_CONFIG_ERROR: i32 = 1;
const EXIT_SERVICE_ERROR: i32 = 2;

#[derive(Parser)]
#[command(name = "fleetd-agent")]
#[command(about = "Device agent for the fleetd management platform")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Control plane base URL
    #[arg(long, env = "FLEETD_SERVER")]
    server: Option<String>,

    /// Pre-issued device id
    #[arg(long, env = "FLEETD_DEVICE_ID")]
    device_id: Option<String>,

    /// Pre-issued api key
    #[arg(long, env = "FLEETD_API_KEY")]
    api_key: Option<String>,

    /// Verbose logging
    #[arg(short, long)]
    debug: bool,

    /// Agent data directory
    #[arg(long, env = "FLEETD_DATA_DIR")]
    data_dir: Option<String>,

    /// Manage the host service instead of running the agent
    #[arg(long, value_enum)]
    service: Option<ServiceAction>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the agent in the foreground (default)
    Run,
    /// Show the local agent's status via its RPC endpoint
    Status,
    /// Configure the agent
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Initialize configuration with defaults
    Init,
}

#[derive(Clone, Copy, ValueEnum)]
enum ServiceAction {
    Install,
    Uninstall,
    Start,
    Stop,
    Restart,
    Status,
    Enable,
    Disable,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.debug {
        "fleetd_agent=debug,fleetd_core=debug,fleetd=debug"
    } else {
        "fleetd_agent=info,fleetd_core=info,fleetd=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.to_string()),
        )
        .init();

    // Service management short-circuits the agent entirely
    if let Some(action) = cli.service {
        let manager = fleetd_agent::service::detect();
        let result = match action {
            ServiceAction::Install => manager.install().await,
            ServiceAction::Uninstall => manager.uninstall().await,
            ServiceAction::Start => manager.start().await,
            ServiceAction::Stop => manager.stop().await,
            ServiceAction::Restart => manager.restart().await,
            ServiceAction::Status => match manager.status().await {
                Ok(status) => {
                    println!("{}", status);
                    Ok(())
                }
                Err(err) => Err(err),
            },
            ServiceAction::Enable => manager.enable().await,
            ServiceAction::Disable => manager.disable().await,
        };
        if let Err(err) = result {
            error!("Service management failed: {:#}", err);
            std::process::exit(EXIT_SERVICE_ERROR);
        }
        return Ok(());
    }

    match &cli.command {
        Some(Commands::Config { action }) => {
            match action {
                ConfigCommands::Show => {
                    let config = load_config(&cli).await;
                    println!("{:#?}", config);
                }
                ConfigCommands::Init => {
                    let path = match AgentConfig::default_path() {
                        Ok(path) => path,
                        Err(err) => {
                            error!("{:#}", err);
                            std::process::exit(EXIT_CONFIG_ERROR);
                        }
                    };
                    if let Err(err) = AgentConfig::default().save(&path).await {
                        error!("Config init failed: {:#}", err);
                        std::process::exit(EXIT_CONFIG_ERROR);
                    }
                    println!("Configuration initialized at {}", path.display());
                }
            }
            return Ok(());
        }
        Some(Commands::Status) => {
            let config = load_config(&cli).await;
            let url = format!("http://127.0.0.1:{}/v1/info", config.listen_port);
            match reqwest::get(&url).await {
                Ok(response) => {
                    let info: serde_json::Value = response.json().await?;
                    println!("{}", serde_json::to_string_pretty(&info)?);
                }
                Err(err) => {
                    eprintln!("Agent is not reachable at {}: {}", url, err);
                    std::process::exit(EXIT_SERVICE_ERROR);
                }
            }
            return Ok(());
        }
        Some(Commands::Run) | None => {}
    }

    let config = load_config(&cli).await;
    let config_path = cli
        .config
        .clone()
        .map(PathBuf::from)
        .or_else(|| AgentConfig::default_path().ok());

    info!("fleetd-agent {} starting", env!("CARGO_PKG_VERSION"));
    fleetd_agent::run_forever(config, config_path).await
}

/// Config file, then env, then flags. Invalid configuration is fatal with
/// exit code 1.
async fn load_config(cli: &Cli) -> AgentConfig {
    let mut config = match AgentConfig::load(cli.config.as_deref()).await {
        Ok(config) => config,
        Err(err) => {
            error!("Failed to load configuration: {:#}", err);
            std::process::exit(EXIT_CONFIG_ERROR);
        }
    };

    if let Some(server) = &cli.server {
        config.server_url = server.clone();
    }
    if let Some(device_id) = &cli.device_id {
        config.device_id = Some(device_id.clone());
    }
    if let Some(api_key) = &cli.api_key {
        config.api_key = Some(api_key.clone());
    }
    if let Some(data_dir) = &cli.data_dir {
        config.data_dir = data_dir.clone();
    }
    if cli.debug {
        config.debug = true;
    }
    config
}
