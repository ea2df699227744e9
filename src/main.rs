//! `alexa-airplay-bridge`: expose Alexa / Home Assistant speakers as AirPlay
//! receivers.
//!
//! `serve` runs the bridge until Ctrl-C. The other commands manage the OAuth
//! login, the backend device list and the virtual devices offline.

use std::path::PathBuf;
use std::sync::Arc;

use alexa_airplay_bridge::{BackendKind, BridgeContext, Config, DeviceKind, Runtime};
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "alexa-airplay-bridge", version)]
struct Args {
    /// Directory holding config.json and tokens.json
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    /// Control (RTSP) port
    #[arg(long, global = true)]
    port: Option<u16>,

    /// Backend: alexa or home_assistant
    #[arg(long, global = true)]
    backend: Option<String>,

    #[command(subcommand)]
    cmd: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the bridge (default)
    Serve,

    /// Print the login URL to obtain an authorization code
    AuthUrl,

    /// Exchange an authorization code for tokens
    Authorize {
        /// Code from the login redirect
        code: String,
    },

    /// List devices reported by the backend
    Discover,

    /// Manage virtual devices
    Devices {
        #[command(subcommand)]
        action: DevicesCommand,
    },

    /// Inspect or persist the resolved configuration
    Config {
        #[command(subcommand)]
        action: ConfigCommand,
    },
}

#[derive(Subcommand, Debug)]
enum DevicesCommand {
    /// Show registered virtual devices
    List,

    /// Register a virtual device
    Add {
        /// Display name (also the source of its id)
        name: String,

        /// Backend entity to bind immediately
        #[arg(long)]
        entity: Option<String>,

        /// Device stands for a speaker group
        #[arg(long)]
        group: bool,
    },

    /// Remove one virtual device
    Remove { id: String },

    /// Remove every virtual device
    Clear,
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    /// Print the configuration (secrets redacted)
    Show,

    /// Write the persisted subset to config.json
    Save,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing();

    let config = load_config(&args)?;
    tracing::debug!(?config, "resolved configuration");

    match args.cmd.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
        Command::AuthUrl => {
            if config.amazon_client_id.is_empty() {
                bail!("AMAZON_CLIENT_ID is not configured");
            }
            let ctx = BridgeContext::build(config).context("initialize bridge")?;
            println!("{}", ctx.credentials.authorization_url());
            Ok(())
        }
        Command::Authorize { code } => {
            let ctx = BridgeContext::build(config).context("initialize bridge")?;
            ctx.credentials
                .authorize(code.trim())
                .await
                .context("authorization code exchange failed")?;
            println!("Authenticated; tokens saved to {}", ctx.storage.tokens_path().display());
            Ok(())
        }
        Command::Discover => {
            let ctx = BridgeContext::build(config).context("initialize bridge")?;
            let devices = ctx
                .backend
                .list_devices()
                .await
                .with_context(|| format!("list devices from {}", ctx.backend.name()))?;
            if devices.is_empty() {
                println!("No devices found");
            }
            for device in devices {
                println!(
                    "{:<40} {:<30} {:<12} {}",
                    device.id, device.name, device.device_type, device.source_endpoint
                );
            }
            Ok(())
        }
        Command::Devices { action } => {
            let ctx = BridgeContext::build(config).context("initialize bridge")?;
            devices(&ctx, action)
        }
        Command::Config { action } => match action {
            ConfigCommand::Show => {
                println!("{:#?}", config);
                Ok(())
            }
            ConfigCommand::Save => {
                config.save().context("save configuration")?;
                println!("Saved configuration to {}", config.config_dir.join("config.json").display());
                Ok(())
            }
        },
    }
}

async fn serve(config: Config) -> Result<()> {
    let ctx = Arc::new(BridgeContext::build(config).context("initialize bridge")?);
    if ctx.config.backend == BackendKind::Alexa && !ctx.credentials.is_authenticated().await {
        tracing::warn!(
            "Not authenticated with Amazon; run `auth-url` then `authorize <code>` to log in"
        );
    }

    let runtime = Runtime::start(ctx).await.context("start bridge")?;
    tracing::info!("Press Ctrl-C to stop");
    tokio::signal::ctrl_c().await.context("wait for Ctrl-C")?;
    runtime.shutdown().await;
    Ok(())
}

fn devices(ctx: &BridgeContext, action: DevicesCommand) -> Result<()> {
    match action {
        DevicesCommand::List => {
            for device in ctx.registry.list() {
                let entity = if device.is_bound() {
                    device.backend_entity_id.as_str()
                } else {
                    "-"
                };
                println!(
                    "{:<24} {:<24} {:<8} {:<8} {:>3}% {}",
                    device.id,
                    device.display_name,
                    format!("{:?}", device.kind),
                    format!("{:?}", device.playback_state),
                    device.volume,
                    entity
                );
            }
        }
        DevicesCommand::Add { name, entity, group } => {
            let kind = if group { DeviceKind::Group } else { DeviceKind::Device };
            let device = ctx
                .registry
                .register(&name, entity.as_deref().unwrap_or(""), kind)
                .with_context(|| format!("register {name:?}"))?;
            println!("{} ({})", device.id, device.display_name);
        }
        DevicesCommand::Remove { id } => {
            if !ctx.registry.remove(&id) {
                bail!("no virtual device with id {id:?}");
            }
            println!("Removed {id}");
        }
        DevicesCommand::Clear => {
            println!("Removed {} device(s)", ctx.registry.remove_all());
        }
    }
    Ok(())
}

/// Layered config with CLI overrides on top
fn load_config(args: &Args) -> Result<Config> {
    let config_dir = args.config_dir.clone();
    let mut config = Config::load_with(|key| match (key, &config_dir) {
        ("CONFIG_DIR", Some(dir)) => Some(dir.to_string_lossy().into_owned()),
        _ => std::env::var(key).ok(),
    })
    .context("load configuration")?;

    if let Some(port) = args.port {
        config.airplay_port = port;
    }
    if let Some(backend) = &args.backend {
        config.backend = backend.parse::<BackendKind>().context("--backend")?;
    }
    Ok(config)
}

/// `RUST_LOG` wins; otherwise the add-on's `LOG_LEVEL`, otherwise info
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = match std::env::var("LOG_LEVEL")
            .unwrap_or_default()
            .to_ascii_lowercase()
            .as_str()
        {
            "debug" => "debug",
            "warning" | "warn" => "warn",
            "error" => "error",
            _ => "info",
        };
        EnvFilter::new(format!("{level},alexa_airplay_bridge={level}"))
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
