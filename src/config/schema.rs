use anyhow::{Context, Result};
use directories::UserDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
#[cfg(unix)]
use tokio::fs::File;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;

const CONFIG_DIR_ENV: &str = "PROSPECT_RELAY_CONFIG_DIR";
const CONFIG_FILE_NAME: &str = "config.toml";
const DEFAULT_DB_FILE_NAME: &str = "relay.db";

// ── Top-level config ──────────────────────────────────────────────

/// Top-level relay configuration, loaded from `config.toml`.
///
/// Resolution order: `PROSPECT_RELAY_CONFIG_DIR` env → `~/.prospect-relay/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Path to config.toml - computed at load time, not serialized
    #[serde(skip)]
    pub config_path: PathBuf,

    /// HTTP ingress: webhook endpoint and admin API (`[gateway]`).
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Burst detection and lock timing policy (`[burst]`).
    #[serde(default)]
    pub burst: BurstConfig,

    /// Response-generation service (`[responder]`).
    #[serde(default)]
    pub responder: ResponderConfig,

    /// Messaging-gateway send API (`[messaging]`).
    #[serde(default)]
    pub messaging: MessagingConfig,

    /// Session store location (`[storage]`).
    #[serde(default)]
    pub storage: StorageConfig,
}

// ── Gateway ───────────────────────────────────────────────────────

/// Gateway server configuration (`[gateway]` section).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Gateway port (default: 42618)
    #[serde(default = "default_gateway_port")]
    pub port: u16,
    /// Gateway host (default: 127.0.0.1)
    #[serde(default = "default_gateway_host")]
    pub host: String,
    /// Bearer token required by `/api/*` routes. Unset leaves the admin API open.
    #[serde(default)]
    pub api_token: Option<String>,
    /// Token the messaging gateway must send (bearer header or `?token=`) on `/webhook`.
    #[serde(default)]
    pub webhook_token: Option<String>,
    /// Per-request timeout for HTTP handlers.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Maximum accepted request body size.
    #[serde(default = "default_body_limit_bytes")]
    pub body_limit_bytes: usize,
}

fn default_gateway_port() -> u16 {
    42618
}

fn default_gateway_host() -> String {
    "127.0.0.1".into()
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_body_limit_bytes() -> usize {
    256 * 1024
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_gateway_port(),
            host: default_gateway_host(),
            api_token: None,
            webhook_token: None,
            request_timeout_secs: default_request_timeout_secs(),
            body_limit_bytes: default_body_limit_bytes(),
        }
    }
}

// ── Burst coordination ────────────────────────────────────────────

/// Burst detection and single-writer lock policy (`[burst]` section).
///
/// Must satisfy `check_interval < stability_window < max_total_wait` and
/// `response_timeout < lock_ttl`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BurstConfig {
    /// Delay before the first supersession check. Default: `3000`.
    #[serde(default = "default_initial_wait_ms")]
    pub initial_wait_ms: u64,
    /// Poll interval of the stability loop. Default: `2000`.
    #[serde(default = "default_check_interval_ms")]
    pub check_interval_ms: u64,
    /// Quiet period required before a burst counts as complete. Default: `4000`.
    #[serde(default = "default_stability_window_ms")]
    pub stability_window_ms: u64,
    /// Upper bound from invocation start to the lock attempt. Default: `60000`.
    #[serde(default = "default_max_total_wait_ms")]
    pub max_total_wait_ms: u64,
    /// Lock expiry; a crashed winner blocks the session at most this long. Default: `120`.
    #[serde(default = "default_lock_ttl_secs")]
    pub lock_ttl_secs: u64,
    /// Timeout around one response-generation call. Default: `90`.
    #[serde(default = "default_response_timeout_secs")]
    pub response_timeout_secs: u64,
    /// Extra generations allowed when messages arrive mid-generation. Default: `1`.
    #[serde(default = "default_max_regenerations")]
    pub max_regenerations: u32,
    /// Prior messages sent along as transcript context. Default: `30`.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

fn default_initial_wait_ms() -> u64 {
    3_000
}

fn default_check_interval_ms() -> u64 {
    2_000
}

fn default_stability_window_ms() -> u64 {
    4_000
}

fn default_max_total_wait_ms() -> u64 {
    60_000
}

fn default_lock_ttl_secs() -> u64 {
    120
}

fn default_response_timeout_secs() -> u64 {
    90
}

fn default_max_regenerations() -> u32 {
    1
}

fn default_history_limit() -> usize {
    30
}

impl Default for BurstConfig {
    fn default() -> Self {
        Self {
            initial_wait_ms: default_initial_wait_ms(),
            check_interval_ms: default_check_interval_ms(),
            stability_window_ms: default_stability_window_ms(),
            max_total_wait_ms: default_max_total_wait_ms(),
            lock_ttl_secs: default_lock_ttl_secs(),
            response_timeout_secs: default_response_timeout_secs(),
            max_regenerations: default_max_regenerations(),
            history_limit: default_history_limit(),
        }
    }
}

impl BurstConfig {
    pub fn initial_wait(&self) -> Duration {
        Duration::from_millis(self.initial_wait_ms)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }

    pub fn stability_window(&self) -> Duration {
        Duration::from_millis(self.stability_window_ms)
    }

    pub fn max_total_wait(&self) -> Duration {
        Duration::from_millis(self.max_total_wait_ms)
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_secs(self.response_timeout_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.check_interval_ms == 0 {
            anyhow::bail!("burst.check_interval_ms must be greater than 0");
        }
        if self.check_interval_ms >= self.stability_window_ms {
            anyhow::bail!(
                "burst.check_interval_ms ({}) must be less than burst.stability_window_ms ({})",
                self.check_interval_ms,
                self.stability_window_ms
            );
        }
        if self.stability_window_ms >= self.max_total_wait_ms {
            anyhow::bail!(
                "burst.stability_window_ms ({}) must be less than burst.max_total_wait_ms ({})",
                self.stability_window_ms,
                self.max_total_wait_ms
            );
        }
        if self.initial_wait_ms >= self.max_total_wait_ms {
            anyhow::bail!("burst.initial_wait_ms must be less than burst.max_total_wait_ms");
        }
        if self.response_timeout() >= self.lock_ttl() {
            anyhow::bail!(
                "burst.response_timeout_secs ({}) must be less than burst.lock_ttl_secs ({})",
                self.response_timeout_secs,
                self.lock_ttl_secs
            );
        }
        if self.history_limit == 0 {
            anyhow::bail!("burst.history_limit must be greater than 0");
        }
        Ok(())
    }
}

// ── Response generation ───────────────────────────────────────────

/// OpenAI-compatible response service (`[responder]` section).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponderConfig {
    /// API base URL; `/chat/completions` is appended unless already present.
    #[serde(default = "default_responder_base_url")]
    pub base_url: String,
    /// API key. Overridden by `PROSPECT_RELAY_API_KEY` or `OPENAI_API_KEY`.
    #[serde(default)]
    pub api_key: Option<String>,
    /// Model id. Default: `"gpt-4o-mini"`.
    #[serde(default = "default_responder_model")]
    pub model: String,
    /// Sampling temperature (0.0–2.0). Ignored for reasoning model families.
    #[serde(default = "default_responder_temperature")]
    pub temperature: f64,
    /// Conversation profile sent as the system message.
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
    /// Collapse line breaks so each reply reads as one chat paragraph.
    #[serde(default = "default_true")]
    pub single_paragraph: bool,
}

fn default_responder_base_url() -> String {
    "https://api.openai.com/v1".into()
}

fn default_responder_model() -> String {
    "gpt-4o-mini".into()
}

fn default_responder_temperature() -> f64 {
    0.8
}

fn default_system_prompt() -> String {
    "You are a sales prospecting agent chatting with a client over WhatsApp. \
     You are in the middle of an ongoing conversation: never greet or introduce yourself again. \
     Answer what the client said directly, be friendly and persuasive, \
     and keep replies to two or three short sentences in a single paragraph."
        .into()
}

fn default_true() -> bool {
    true
}

impl Default for ResponderConfig {
    fn default() -> Self {
        Self {
            base_url: default_responder_base_url(),
            api_key: None,
            model: default_responder_model(),
            temperature: default_responder_temperature(),
            system_prompt: default_system_prompt(),
            single_paragraph: true,
        }
    }
}

// ── Messaging gateway ─────────────────────────────────────────────

/// W-API send configuration (`[messaging]` section).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagingConfig {
    #[serde(default = "default_messaging_base_url")]
    pub base_url: String,
    /// Instance id appended as `?instanceId=`.
    #[serde(default)]
    pub instance_id: Option<String>,
    /// Bearer token for the send API.
    #[serde(default)]
    pub token: Option<String>,
}

fn default_messaging_base_url() -> String {
    "https://api.w-api.app/v1".into()
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            base_url: default_messaging_base_url(),
            instance_id: None,
            token: None,
        }
    }
}

impl MessagingConfig {
    /// Both the instance id and the token are set to something non-blank.
    pub fn is_configured(&self) -> bool {
        let set = |v: &Option<String>| v.as_deref().is_some_and(|s| !s.trim().is_empty());
        set(&self.instance_id) && set(&self.token)
    }
}

// ── Storage ───────────────────────────────────────────────────────

/// Session store configuration (`[storage]` section).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// SQLite database file. Relative paths resolve against the config directory.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
}

fn default_db_path() -> PathBuf {
    PathBuf::from(DEFAULT_DB_FILE_NAME)
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

// ── Config impl ──────────────────────────────────────────────────

impl Default for Config {
    fn default() -> Self {
        let home =
            UserDirs::new().map_or_else(|| PathBuf::from("."), |u| u.home_dir().to_path_buf());
        let relay_dir = home.join(".prospect-relay");

        Self {
            config_path: relay_dir.join(CONFIG_FILE_NAME),
            gateway: GatewayConfig::default(),
            burst: BurstConfig::default(),
            responder: ResponderConfig::default(),
            messaging: MessagingConfig::default(),
            storage: StorageConfig {
                db_path: relay_dir.join(DEFAULT_DB_FILE_NAME),
            },
        }
    }
}

fn default_config_dir() -> Result<PathBuf> {
    let home = UserDirs::new()
        .map(|u| u.home_dir().to_path_buf())
        .context("Could not find home directory")?;
    Ok(home.join(".prospect-relay"))
}

fn resolve_config_dir() -> Result<PathBuf> {
    match std::env::var(CONFIG_DIR_ENV) {
        Ok(dir) if !dir.trim().is_empty() => Ok(PathBuf::from(dir.trim())),
        _ => default_config_dir(),
    }
}

fn config_dir_creation_error(path: &Path) -> String {
    format!(
        "Failed to create config directory: {}. Set {CONFIG_DIR_ENV} to a writable location.",
        path.display()
    )
}

fn env_non_empty(names: &[&str]) -> Option<String> {
    names.iter().find_map(|name| {
        std::env::var(name)
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    })
}

impl Config {
    pub async fn load_or_init() -> Result<Self> {
        let relay_dir = resolve_config_dir()?;
        Self::load_or_init_in(&relay_dir).await
    }

    /// Load `config.toml` from `relay_dir`, writing defaults on first run.
    pub async fn load_or_init_in(relay_dir: &Path) -> Result<Self> {
        let config_path = relay_dir.join(CONFIG_FILE_NAME);

        fs::create_dir_all(relay_dir)
            .await
            .with_context(|| config_dir_creation_error(relay_dir))?;

        let initialized = !config_path.exists();
        let mut config = if initialized {
            let mut config = Config {
                config_path: config_path.clone(),
                ..Config::default()
            };
            config.storage.db_path = relay_dir.join(DEFAULT_DB_FILE_NAME);
            config.save().await?;

            // Restrict permissions on newly created config file (may contain API keys)
            #[cfg(unix)]
            {
                use std::{fs::Permissions, os::unix::fs::PermissionsExt};
                let _ = fs::set_permissions(&config_path, Permissions::from_mode(0o600)).await;
            }
            config
        } else {
            // Warn if config file is world-readable (may contain API keys)
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                if let Ok(meta) = fs::metadata(&config_path).await {
                    if meta.permissions().mode() & 0o004 != 0 {
                        tracing::warn!(
                            "Config file {:?} is world-readable (mode {:o}). \
                             Consider restricting with: chmod 600 {:?}",
                            config_path,
                            meta.permissions().mode() & 0o777,
                            config_path,
                        );
                    }
                }
            }

            let contents = fs::read_to_string(&config_path)
                .await
                .context("Failed to read config file")?;
            let mut config: Config =
                toml::from_str(&contents).context("Failed to parse config file")?;
            config.config_path = config_path.clone();
            config
        };

        if config.storage.db_path.is_relative() {
            config.storage.db_path = relay_dir.join(&config.storage.db_path);
        }

        config.apply_env_overrides();
        config.validate()?;
        tracing::info!(
            path = %config.config_path.display(),
            db = %config.storage.db_path.display(),
            initialized,
            "Config loaded"
        );
        Ok(config)
    }

    /// Validate configuration values that would cause runtime failures.
    pub fn validate(&self) -> Result<()> {
        if self.gateway.host.trim().is_empty() {
            anyhow::bail!("gateway.host must not be empty");
        }
        if self.gateway.request_timeout_secs == 0 {
            anyhow::bail!("gateway.request_timeout_secs must be greater than 0");
        }
        if self.gateway.body_limit_bytes == 0 {
            anyhow::bail!("gateway.body_limit_bytes must be greater than 0");
        }

        self.burst.validate()?;

        if !(0.0..=2.0).contains(&self.responder.temperature) {
            anyhow::bail!("responder.temperature must be within 0.0..=2.0");
        }
        if self.responder.model.trim().is_empty() {
            anyhow::bail!("responder.model must not be empty");
        }
        reqwest::Url::parse(&self.responder.base_url)
            .with_context(|| format!("responder.base_url is invalid: {}", self.responder.base_url))?;
        reqwest::Url::parse(&self.messaging.base_url)
            .with_context(|| format!("messaging.base_url is invalid: {}", self.messaging.base_url))?;

        Ok(())
    }

    /// Apply environment variable overrides to config
    pub fn apply_env_overrides(&mut self) {
        // API Key: PROSPECT_RELAY_API_KEY or OPENAI_API_KEY
        if let Some(key) = env_non_empty(&["PROSPECT_RELAY_API_KEY", "OPENAI_API_KEY"]) {
            self.responder.api_key = Some(key);
        }

        if let Some(model) = env_non_empty(&["PROSPECT_RELAY_MODEL"]) {
            self.responder.model = model;
        }

        if let Some(url) = env_non_empty(&["PROSPECT_RELAY_RESPONDER_URL"]) {
            self.responder.base_url = url;
        }

        // Gateway port: PROSPECT_RELAY_GATEWAY_PORT or PORT
        if let Some(port_str) = env_non_empty(&["PROSPECT_RELAY_GATEWAY_PORT", "PORT"]) {
            if let Ok(port) = port_str.parse::<u16>() {
                self.gateway.port = port;
            } else {
                tracing::warn!(value = %port_str, "Ignoring invalid gateway port override");
            }
        }

        // Gateway host: PROSPECT_RELAY_GATEWAY_HOST or HOST
        if let Some(host) = env_non_empty(&["PROSPECT_RELAY_GATEWAY_HOST", "HOST"]) {
            self.gateway.host = host;
        }

        if let Some(token) = env_non_empty(&["PROSPECT_RELAY_API_TOKEN"]) {
            self.gateway.api_token = Some(token);
        }

        if let Some(token) = env_non_empty(&["PROSPECT_RELAY_WEBHOOK_TOKEN"]) {
            self.gateway.webhook_token = Some(token);
        }

        if let Some(instance) = env_non_empty(&["PROSPECT_RELAY_WAPI_INSTANCE_ID", "WAPI_INSTANCE_ID"])
        {
            self.messaging.instance_id = Some(instance);
        }

        if let Some(token) = env_non_empty(&["PROSPECT_RELAY_WAPI_TOKEN", "WAPI_TOKEN"]) {
            self.messaging.token = Some(token);
        }

        if let Some(path) = env_non_empty(&["PROSPECT_RELAY_DB_PATH"]) {
            self.storage.db_path = PathBuf::from(path);
        }
    }

    pub async fn save(&self) -> Result<()> {
        let toml_str = toml::to_string_pretty(self).context("Failed to serialize config")?;

        let parent_dir = self
            .config_path
            .parent()
            .context("Config path must have a parent directory")?;

        fs::create_dir_all(parent_dir).await.with_context(|| {
            format!(
                "Failed to create config directory: {}",
                parent_dir.display()
            )
        })?;

        let file_name = self
            .config_path
            .file_name()
            .and_then(|v| v.to_str())
            .unwrap_or(CONFIG_FILE_NAME);
        let temp_path = parent_dir.join(format!(".{file_name}.tmp-{}", uuid::Uuid::new_v4()));
        let backup_path = parent_dir.join(format!("{file_name}.bak"));

        let mut temp_file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| {
                format!(
                    "Failed to create temporary config file: {}",
                    temp_path.display()
                )
            })?;
        temp_file
            .write_all(toml_str.as_bytes())
            .await
            .context("Failed to write temporary config contents")?;
        temp_file
            .sync_all()
            .await
            .context("Failed to fsync temporary config file")?;
        drop(temp_file);

        let had_existing_config = self.config_path.exists();
        if had_existing_config {
            fs::copy(&self.config_path, &backup_path)
                .await
                .with_context(|| {
                    format!(
                        "Failed to create config backup before atomic replace: {}",
                        backup_path.display()
                    )
                })?;
        }

        if let Err(e) = fs::rename(&temp_path, &self.config_path).await {
            let _ = fs::remove_file(&temp_path).await;
            if had_existing_config && backup_path.exists() {
                fs::copy(&backup_path, &self.config_path)
                    .await
                    .context("Failed to restore config backup")?;
            }
            anyhow::bail!("Failed to atomically replace config file: {e}");
        }

        sync_directory(parent_dir).await?;

        if had_existing_config {
            let _ = fs::remove_file(&backup_path).await;
        }

        Ok(())
    }
}

async fn sync_directory(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        let dir = File::open(path)
            .await
            .with_context(|| format!("Failed to open directory for fsync: {}", path.display()))?;
        dir.sync_all()
            .await
            .with_context(|| format!("Failed to fsync directory metadata: {}", path.display()))?;
        Ok(())
    }

    #[cfg(not(unix))]
    {
        let _ = path;
        Ok(())
    }
}
