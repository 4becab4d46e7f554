//! Daemon configuration

use anyhow::{Context, Result};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Daemon configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DaemonConfig {
    /// Frontend listener and on-disk locations
    #[serde(default)]
    pub server: ServerConfig,

    /// Invite throttling
    #[serde(default)]
    pub invite: InviteConfig,

    /// Management API
    #[serde(default)]
    pub api: ApiConfig,

    /// Monitoring configuration
    #[serde(default)]
    pub monitoring: MonitoringConfig,

    /// RPC surface (carried for collaborators)
    #[serde(default)]
    pub rpc: RpcConfig,

    /// Operator SSH console (carried for collaborators)
    #[serde(default)]
    pub ssh: SshConfig,

    /// Static web root for the website collaborator
    #[serde(default)]
    pub web_root: Option<PathBuf>,
}

impl DaemonConfig {
    /// Load configuration from file
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: DaemonConfig = toml::from_str(content)?;
        Ok(config)
    }

    /// Load and merge configuration from file (incremental update)
    ///
    /// Only non-default values from the new config will overwrite existing values.
    pub async fn load_merge(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let other = Self::load(path).await?;
        self.merge(other);
        Ok(())
    }

    /// Merge another config into this one
    ///
    /// Scalars overwrite when the new value differs from the default,
    /// options overwrite when `Some`.
    pub fn merge(&mut self, other: DaemonConfig) {
        let s = other.server;
        if s.address != default_address() {
            self.server.address = s.address;
        }
        if s.port != default_port() {
            self.server.port = s.port;
        }
        if s.private_key != default_private_key() {
            self.server.private_key = s.private_key;
        }
        if s.client_directory != default_client_directory() {
            self.server.client_directory = s.client_directory;
        }
        if s.rule_file.is_some() {
            self.server.rule_file = s.rule_file;
        }
        if s.user_file.is_some() {
            self.server.user_file = s.user_file;
        }
        if s.database.is_some() {
            self.server.database = s.database;
        }
        if s.maintenance_time != default_maintenance_time() {
            self.server.maintenance_time = s.maintenance_time;
        }
        if s.verbose_level != 0 {
            self.server.verbose_level = s.verbose_level;
        }
        if s.log_file.is_some() {
            self.server.log_file = s.log_file;
        }

        let i = other.invite;
        if i.tokens != default_invite_tokens() {
            self.invite.tokens = i.tokens;
        }
        if i.max != default_invite_tokens() {
            self.invite.max = i.max;
        }
        if i.interval != default_invite_interval() {
            self.invite.interval = i.interval;
        }
        if i.player_tokens != default_invite_tokens() {
            self.invite.player_tokens = i.player_tokens;
        }
        if i.player_refill != default_player_refill() {
            self.invite.player_refill = i.player_refill;
        }
        if i.player_cooldown != default_player_cooldown() {
            self.invite.player_cooldown = i.player_cooldown;
        }

        let a = other.api;
        if a.enabled {
            self.api.enabled = true;
        }
        if a.address != default_address() {
            self.api.address = a.address;
        }
        if a.port != default_api_port() {
            self.api.port = a.port;
        }
        if a.secret.is_some() {
            self.api.secret = a.secret;
        }
        if a.auth_file.is_some() {
            self.api.auth_file = a.auth_file;
        }

        if other.monitoring.prometheus_bind != default_prometheus_bind() {
            self.monitoring.prometheus_bind = other.monitoring.prometheus_bind;
        }
        if !other.monitoring.prometheus_enabled {
            self.monitoring.prometheus_enabled = false;
        }

        if other.rpc.address.is_some() {
            self.rpc.address = other.rpc.address;
        }
        if other.rpc.port != 0 {
            self.rpc.port = other.rpc.port;
        }
        if other.ssh.address.is_some() {
            self.ssh.address = other.ssh.address;
        }
        if other.ssh.port != 0 {
            self.ssh.port = other.ssh.port;
        }
        if other.ssh.hostkey.is_some() {
            self.ssh.hostkey = other.ssh.hostkey;
        }
        if other.web_root.is_some() {
            self.web_root = other.web_root;
        }
    }
}

/// Frontend listener configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Listen address for frontend connections
    #[serde(default = "default_address")]
    pub address: String,

    /// Listen port for frontend connections
    #[serde(default = "default_port")]
    pub port: u16,

    /// Backend RSA private key (PEM)
    #[serde(default = "default_private_key")]
    pub private_key: PathBuf,

    /// One subdirectory per registered frontend
    #[serde(default = "default_client_directory")]
    pub client_directory: PathBuf,

    /// Server-scoped rules
    #[serde(default)]
    pub rule_file: Option<PathBuf>,

    /// Operator roster
    #[serde(default)]
    pub user_file: Option<PathBuf>,

    /// Player history file
    #[serde(default)]
    pub database: Option<PathBuf>,

    /// Seconds between maintenance ticks
    #[serde(default = "default_maintenance_time")]
    pub maintenance_time: u64,

    /// 0 = warn, 1 = info, 2 = debug, 3+ = trace
    #[serde(default)]
    pub verbose_level: u8,

    /// Append log output here instead of stdout
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

impl ServerConfig {
    pub fn bind(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_time.max(1))
    }
}

fn default_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    9988
}

fn default_private_key() -> PathBuf {
    PathBuf::from("private.pem")
}

fn default_client_directory() -> PathBuf {
    PathBuf::from("clients")
}

fn default_maintenance_time() -> u64 {
    60
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            port: default_port(),
            private_key: default_private_key(),
            client_directory: default_client_directory(),
            rule_file: None,
            user_file: None,
            database: None,
            maintenance_time: default_maintenance_time(),
            verbose_level: 0,
            log_file: None,
        }
    }
}

/// Invite token buckets
#[derive(Debug, Clone, Deserialize)]
pub struct InviteConfig {
    /// Frontend bucket tokens at startup
    #[serde(default = "default_invite_tokens")]
    pub tokens: u32,

    /// Frontend bucket ceiling
    #[serde(default = "default_invite_tokens")]
    pub max: u32,

    /// Seconds per refilled frontend token
    #[serde(default = "default_invite_interval")]
    pub interval: u64,

    /// Invites a player may send before the refill wait
    #[serde(default = "default_invite_tokens")]
    pub player_tokens: u32,

    /// Seconds after exhaustion before a player's invites refill
    #[serde(default = "default_player_refill")]
    pub player_refill: u64,

    /// Seconds between two invites from the same player
    #[serde(default = "default_player_cooldown")]
    pub player_cooldown: u64,
}

fn default_invite_tokens() -> u32 {
    3
}

fn default_invite_interval() -> u64 {
    300
}

fn default_player_refill() -> u64 {
    600
}

fn default_player_cooldown() -> u64 {
    30
}

impl Default for InviteConfig {
    fn default() -> Self {
        Self {
            tokens: default_invite_tokens(),
            max: default_invite_tokens(),
            interval: default_invite_interval(),
            player_tokens: default_invite_tokens(),
            player_refill: default_player_refill(),
            player_cooldown: default_player_cooldown(),
        }
    }
}

/// Management API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_address")]
    pub address: String,

    #[serde(default = "default_api_port")]
    pub port: u16,

    /// Bearer token required on every `/api` request
    #[serde(default)]
    pub secret: Option<String>,

    /// File holding the bearer token, used when `secret` is unset
    #[serde(default)]
    pub auth_file: Option<PathBuf>,
}

impl ApiConfig {
    pub fn bind(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    /// Resolve the bearer secret, reading `auth_file` when needed
    pub fn resolve_secret(&self) -> Result<Option<String>> {
        if let Some(secret) = &self.secret {
            return Ok(Some(secret.clone()));
        }
        match &self.auth_file {
            Some(path) => {
                let secret = std::fs::read_to_string(path)
                    .with_context(|| format!("reading {}", path.display()))?;
                Ok(Some(secret.trim().to_string()))
            }
            None => Ok(None),
        }
    }
}

fn default_api_port() -> u16 {
    9989
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            address: default_address(),
            port: default_api_port(),
            secret: None,
            auth_file: None,
        }
    }
}

/// Monitoring configuration
#[derive(Debug, Clone, Deserialize)]
pub struct MonitoringConfig {
    /// Prometheus metrics bind address
    #[serde(default = "default_prometheus_bind")]
    pub prometheus_bind: SocketAddr,

    /// Enable Prometheus
    #[serde(default = "default_true")]
    pub prometheus_enabled: bool,
}

fn default_prometheus_bind() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 9090))
}

fn default_true() -> bool {
    true
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            prometheus_bind: default_prometheus_bind(),
            prometheus_enabled: default_true(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RpcConfig {
    #[serde(default)]
    pub address: Option<String>,

    #[serde(default)]
    pub port: u16,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SshConfig {
    #[serde(default)]
    pub address: Option<String>,

    #[serde(default)]
    pub port: u16,

    #[serde(default)]
    pub hostkey: Option<PathBuf>,
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod config_tests;
