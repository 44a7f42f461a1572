#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::missing_errors_doc,
    clippy::module_name_repetitions,
    clippy::needless_pass_by_value,
    clippy::too_many_lines,
    clippy::uninlined_format_args
)]

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use prospect_relay::{gateway, sessions, Config, SessionCommands};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

/// `prospect-relay` - burst-aware auto replies for inbound sales chats.
#[derive(Parser, Debug)]
#[command(name = "prospect-relay")]
#[command(version)]
#[command(about = "Inbound chat relay with burst debouncing and single-writer replies.", long_about = None)]
struct Cli {
    /// Directory holding config.toml (overrides PROSPECT_RELAY_CONFIG_DIR)
    #[arg(long, global = true)]
    config_dir: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the gateway server (messaging webhook + admin API)
    #[command(long_about = "\
Start the gateway server.

Serves the messaging-gateway webhook on POST /webhook, the session \
admin API under /api, and GET /health. Bind address defaults to the \
values in your config file (gateway.host / gateway.port).

Examples:
  prospect-relay gateway
  prospect-relay gateway -p 8080
  prospect-relay gateway --host 0.0.0.0")]
    Gateway {
        /// Port to listen on; defaults to config gateway.port
        #[arg(short, long)]
        port: Option<u16>,

        /// Host to bind to; defaults to config gateway.host
        #[arg(long)]
        host: Option<String>,
    },

    /// Show the effective configuration summary
    Status,

    /// Manage conversations (start, show, list, ai)
    Session {
        #[command(subcommand)]
        session_command: SessionCommands,
    },
}

fn init_tracing() -> Result<()> {
    // Respects RUST_LOG, defaults to INFO
    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to install tracing subscriber")
}

fn print_status(config: &Config) {
    let burst = &config.burst;
    println!("prospect-relay {}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("Config:      {}", config.config_path.display());
    println!("Database:    {}", config.storage.db_path.display());
    println!(
        "Gateway:     {}:{} (admin API {})",
        config.gateway.host,
        config.gateway.port,
        if config.gateway.api_token.is_some() {
            "token-protected"
        } else {
            "open"
        }
    );
    println!();
    println!("Burst policy:");
    println!("  Initial wait:      {} ms", burst.initial_wait_ms);
    println!("  Check interval:    {} ms", burst.check_interval_ms);
    println!("  Stability window:  {} ms", burst.stability_window_ms);
    println!("  Max total wait:    {} ms", burst.max_total_wait_ms);
    println!("  Lock TTL:          {} s", burst.lock_ttl_secs);
    println!("  Response timeout:  {} s", burst.response_timeout_secs);
    println!();
    println!(
        "Responder:   {} ({})",
        config.responder.model,
        if config.responder.api_key.is_some() {
            "key set"
        } else {
            "no key"
        }
    );
    println!(
        "Messaging:   {} ({})",
        config.messaging.base_url,
        if config.messaging.is_configured() {
            "configured"
        } else {
            "not configured"
        }
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(config_dir) = &cli.config_dir {
        if config_dir.trim().is_empty() {
            bail!("--config-dir cannot be empty");
        }
        std::env::set_var("PROSPECT_RELAY_CONFIG_DIR", config_dir);
    }

    init_tracing()?;

    let mut config = Config::load_or_init().await?;

    match cli.command {
        Commands::Gateway { port, host } => {
            if let Some(port) = port {
                config.gateway.port = port;
            }
            if let Some(host) = host {
                config.gateway.host = host;
            }
            config.validate()?;
            info!(
                host = %config.gateway.host,
                port = config.gateway.port,
                "Starting prospect-relay gateway"
            );
            gateway::run_gateway(config).await
        }

        Commands::Status => {
            print_status(&config);
            Ok(())
        }

        Commands::Session { session_command } => {
            sessions::handle_command(session_command, &config).await
        }
    }
}
