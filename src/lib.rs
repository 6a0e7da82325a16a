//! Allowance Engine
//!
//! Recurring allowance disbursement with live family notifications:
//! - Schedule evaluation and at-most-once crediting per period
//! - Per-family event topics over a local or NATS pub/sub backend
//! - WebSocket notification gateway authenticated by session token
//! - Client relay sharing one connection across browser tabs

pub mod api;
pub mod auth;
pub mod events;
pub mod relay;
pub mod schedule;
pub mod storage;

#[cfg(test)]
pub(crate) mod test_helpers;

use anyhow::{Context, Result};
use auth::{JwtSessionValidator, SessionValidator, StaticSessionValidator};
use chrono::Utc;
use events::{EventBus, LocalPubSub, NatsPubSub, PubSub};
use relay::RelayConfig;
use schedule::{DisbursementExecutor, Scheduler, SchedulerConfig, TickReport};
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use storage::{DisbursementStore, MemoryStore, SqliteStore};

// ============================================================================
// YAML config structs (deserialization targets)
// ============================================================================

/// Top-level YAML configuration file structure
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct YamlConfig {
    pub server: ServerYamlConfig,
    pub scheduler: SchedulerConfig,
    pub events: EventsYamlConfig,
    pub storage: StorageYamlConfig,
    /// Auth section. If absent, every socket is refused (deny-by-default)
    pub auth: Option<AuthConfig>,
    pub relay: RelayConfig,
}

/// Server configuration section
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerYamlConfig {
    pub port: u16,
    pub bind: String,
    pub ping_interval_secs: u64,
}

impl Default for ServerYamlConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            bind: "0.0.0.0".into(),
            ping_interval_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventsBackend {
    #[default]
    Local,
    Nats,
}

/// Event bus configuration section
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EventsYamlConfig {
    pub backend: EventsBackend,
    pub nats_url: String,
    pub subject_prefix: String,
    /// Per-topic buffer of the local backend
    pub channel_capacity: usize,
    /// Bearer token for `POST /internal/events`. None disables the route
    pub internal_token: Option<String>,
}

impl Default for EventsYamlConfig {
    fn default() -> Self {
        Self {
            backend: EventsBackend::Local,
            nats_url: "nats://localhost:4222".into(),
            subject_prefix: "allowance".into(),
            channel_capacity: 256,
            internal_token: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    #[default]
    Memory,
    Sqlite,
}

/// Storage configuration section
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageYamlConfig {
    pub backend: StorageBackend,
    pub database_url: String,
}

impl Default for StorageYamlConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Memory,
            database_url: "sqlite:allowance.db".into(),
        }
    }
}

/// Session token configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// HS256 secret shared with the service that issues session tokens
    pub jwt_secret: String,
    #[serde(default = "default_session_expiry")]
    pub session_expiry_secs: u64,
}

fn default_session_expiry() -> u64 {
    28800 // 8 hours
}

// ============================================================================
// Runtime config (what the application actually uses)
// ============================================================================

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub server_port: u16,
    pub bind_address: String,
    pub ping_interval: Duration,
    pub scheduler: SchedulerConfig,
    pub events: EventsYamlConfig,
    pub storage: StorageYamlConfig,
    /// Auth config. None means deny-by-default (no auth section in YAML)
    pub auth_config: Option<AuthConfig>,
    pub relay: RelayConfig,
}

impl Config {
    /// Equivalent to `from_yaml_and_env(None)`
    pub fn from_env() -> Result<Self> {
        Self::from_yaml_and_env(None)
    }

    /// Load configuration from an optional YAML file, then override with env vars.
    ///
    /// Priority: env var > YAML > default
    ///
    /// If `yaml_path` is None, tries "config.yaml" in CWD.
    pub fn from_yaml_and_env(yaml_path: Option<&Path>) -> Result<Self> {
        let yaml = Self::load_yaml(yaml_path);

        let mut storage = yaml.storage;
        if let Ok(url) = std::env::var("DATABASE_URL") {
            storage.backend = StorageBackend::Sqlite;
            storage.database_url = url;
        }

        let mut events = yaml.events;
        if let Ok(url) = std::env::var("NATS_URL") {
            events.backend = EventsBackend::Nats;
            events.nats_url = url;
        }
        if let Ok(token) = std::env::var("INTERNAL_EVENTS_TOKEN") {
            events.internal_token = Some(token);
        }

        let auth_config = match std::env::var("JWT_SECRET") {
            Ok(secret) => Some(AuthConfig {
                jwt_secret: secret,
                session_expiry_secs: yaml
                    .auth
                    .as_ref()
                    .map_or_else(default_session_expiry, |a| a.session_expiry_secs),
            }),
            Err(_) => yaml.auth,
        };

        let mut scheduler = yaml.scheduler;
        if let Some(secs) = std::env::var("SCHEDULER_TICK_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
        {
            scheduler.tick_interval_secs = secs;
        }

        Ok(Self {
            server_port: std::env::var("SERVER_PORT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(yaml.server.port),
            bind_address: yaml.server.bind,
            ping_interval: Duration::from_secs(yaml.server.ping_interval_secs.max(1)),
            scheduler,
            events,
            storage,
            auth_config,
            relay: yaml.relay,
        })
    }

    /// Try to load and parse a YAML config file. Returns defaults on any failure.
    fn load_yaml(yaml_path: Option<&Path>) -> YamlConfig {
        let default_path = Path::new("config.yaml");
        let path = yaml_path.unwrap_or(default_path);

        match std::fs::read_to_string(path) {
            Ok(contents) => match serde_yaml::from_str(&contents) {
                Ok(config) => {
                    tracing::info!("Loaded config from {}", path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!("Failed to parse {}: {}. Using defaults.", path.display(), e);
                    YamlConfig::default()
                }
            },
            Err(_) => {
                tracing::debug!(
                    "No config file at {}, using env vars / defaults",
                    path.display()
                );
                YamlConfig::default()
            }
        }
    }
}

// ============================================================================
// Application state
// ============================================================================

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn DisbursementStore>,
    pub event_bus: EventBus,
    pub sessions: Arc<dyn SessionValidator>,
    pub config: Arc<Config>,
}

impl AppState {
    /// Create new application state with all backends connected
    pub async fn new(config: Config) -> Result<Self> {
        let store: Arc<dyn DisbursementStore> = match config.storage.backend {
            StorageBackend::Memory => {
                tracing::warn!("Using in-memory storage; cursors and ledger are not persisted");
                Arc::new(MemoryStore::new())
            }
            StorageBackend::Sqlite => Arc::new(
                SqliteStore::connect(&config.storage.database_url)
                    .await
                    .with_context(|| {
                        format!("Failed to open {}", config.storage.database_url)
                    })?,
            ),
        };

        let backend: Arc<dyn PubSub> = match config.events.backend {
            EventsBackend::Local => Arc::new(LocalPubSub::new(config.events.channel_capacity)),
            EventsBackend::Nats => {
                let client = events::connect_nats(&config.events.nats_url).await?;
                Arc::new(NatsPubSub::new(client, config.events.subject_prefix.clone()))
            }
        };

        let sessions: Arc<dyn SessionValidator> = match &config.auth_config {
            Some(auth) => Arc::new(JwtSessionValidator::new(auth.jwt_secret.clone())),
            None => {
                tracing::warn!("No auth section configured; all notification sockets will be refused");
                Arc::new(StaticSessionValidator::new())
            }
        };

        Ok(Self {
            store,
            event_bus: EventBus::new(backend),
            sessions,
            config: Arc::new(config),
        })
    }

    pub fn server_state(&self) -> api::SharedState {
        Arc::new(api::ServerState {
            event_bus: self.event_bus.clone(),
            sessions: self.sessions.clone(),
            store: self.store.clone(),
            internal_token: self.config.events.internal_token.clone(),
            ping_interval: self.config.ping_interval,
        })
    }

    /// Executor crediting through this state's store and announcing on its bus
    pub fn executor(&self) -> Arc<DisbursementExecutor> {
        Arc::new(DisbursementExecutor::new(
            self.store.clone(),
            Arc::new(self.event_bus.clone()),
            self.config.scheduler.clone(),
        ))
    }
}

// ============================================================================
// Entry points
// ============================================================================

/// Run the HTTP gateway and, if enabled, the scheduler until Ctrl-C
pub async fn start_server(config: Config) -> Result<()> {
    let addr = format!("{}:{}", config.bind_address, config.server_port);
    let state = AppState::new(config).await?;

    let mut scheduler = state
        .config
        .scheduler
        .enabled
        .then(|| Scheduler::new(state.executor()));
    if let Some(scheduler) = scheduler.as_mut() {
        scheduler.start();
    }

    let app = api::create_router(state.server_state());
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    tracing::info!(
        "Allowance engine listening on {} (pubsub: {})",
        addr,
        state.event_bus.backend_name()
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(mut scheduler) = scheduler {
        scheduler.stop().await;
    }
    tracing::info!("Server stopped");
    Ok(())
}

/// One executor pass, for cron-driven deployments
pub async fn run_single_tick(config: Config) -> Result<TickReport> {
    let state = AppState::new(config).await?;
    state.executor().run_tick(Utc::now()).await
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}

// ============================================================================
// Tests
// ============================================================================
