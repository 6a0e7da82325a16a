//! Allowance Engine - Main Server
//!
//! Disbursement scheduler, notification gateway and a command-line client relay.

use allowance_engine::auth::{jwt::encode_session_token, Role, SessionIdentity};
use allowance_engine::relay::{ClientRelay, WsConnector};
use allowance_engine::Config;
use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "allowance-engine")]
#[command(about = "Recurring allowance disbursement and live family notifications")]
struct Cli {
    /// Path to the YAML config file (defaults to ./config.yaml)
    #[arg(short, long, global = true, env = "ALLOWANCE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the notification gateway and the scheduler
    Serve {
        /// Port to listen on (overrides config.yaml)
        #[arg(short, long)]
        port: Option<u16>,

        /// Run the gateway only; disbursements are left to another replica or `tick`
        #[arg(long)]
        no_scheduler: bool,
    },

    /// Run a single disbursement pass and exit
    Tick,

    /// Connect a client relay and log what each tab receives
    Relay {
        /// Gateway WebSocket URL
        #[arg(short, long, default_value = "ws://localhost:8080/ws/notifications")]
        url: String,

        /// Session token sent as a Bearer header
        #[arg(short, long, env = "SESSION_TOKEN")]
        token: Option<String>,

        /// Number of simulated tabs
        #[arg(long, default_value = "1")]
        tabs: usize,
    },

    /// Issue a session token signed with the configured secret
    Token {
        #[arg(long)]
        user: Uuid,

        #[arg(long)]
        family: Uuid,

        /// parent or child
        #[arg(long, default_value = "child")]
        role: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,allowance_engine=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    // Load configuration
    let mut config = Config::from_yaml_and_env(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve { port, no_scheduler } => {
            if let Some(port) = port {
                config.server_port = port;
            }
            if no_scheduler {
                config.scheduler.enabled = false;
            }
            allowance_engine::start_server(config).await
        }
        Commands::Tick => {
            let report = allowance_engine::run_single_tick(config).await?;
            tracing::info!(
                "Tick complete: {} evaluated, {} credited, {} seeded, {} conflicts, {} failed",
                report.evaluated,
                report.credited,
                report.seeded,
                report.conflicts,
                report.failed
            );
            if report.failed > 0 {
                bail!("{} allowances failed; they will be retried next tick", report.failed);
            }
            Ok(())
        }
        Commands::Relay { url, token, tabs } => run_relay(config, url, token, tabs).await,
        Commands::Token { user, family, role } => {
            let Some(auth) = config.auth_config else {
                bail!("No auth section configured; set JWT_SECRET or add `auth:` to config.yaml");
            };
            let role: Role = role.parse()?;
            let identity = SessionIdentity {
                user_uid: user,
                family_uid: family,
                role,
            };
            println!(
                "{}",
                encode_session_token(&identity, &auth.jwt_secret, auth.session_expiry_secs)?
            );
            Ok(())
        }
    }
}

async fn run_relay(config: Config, url: String, token: Option<String>, tabs: usize) -> Result<()> {
    let connector = Arc::new(WsConnector::new(url.clone(), token));
    let relay = ClientRelay::shared(&url, connector, &config.relay);

    for index in 0..tabs.max(1) {
        let mut tab = relay.register_tab();
        tokio::spawn(async move {
            while let Some(message) = tab.recv().await {
                match serde_json::to_string(&message.event) {
                    Ok(json) => tracing::info!(tab = index, "{}", json),
                    Err(e) => tracing::warn!(tab = index, "Unprintable event: {}", e),
                }
            }
        });
    }

    // The CLI has no backend calls to intercept; treat startup as the first one.
    relay.on_backend_response(true).await;
    tracing::info!("Relay running with {} tab(s); Ctrl-C to stop", relay.tab_count());

    tokio::signal::ctrl_c().await?;
    ClientRelay::release_shared(&url).await;
    Ok(())
}
