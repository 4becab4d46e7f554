//! q2cloud daemon
//!
//! Central administration backend for a fleet of Quake 2 servers. Each
//! frontend keeps one TCP session open to the daemon; the daemon
//! authenticates it, tracks its players, enforces rules and relays
//! teleports and invites between frontends.

pub mod audit;
pub mod auth;
pub mod config;
pub mod dispatch;
pub mod enforcement;
pub mod error;
pub mod frontend;
pub mod handler;
pub mod key_rotation;
pub mod maintenance;
pub mod management;
pub mod metrics;
pub mod obituary;
pub mod players;
pub mod registry;
pub mod rules;
pub mod services;
pub mod teleport;
pub mod users;

#[cfg(test)]
mod test_support;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context as _, Result, bail};
use parking_lot::RwLock;
use q2cloud_crypto::PrivateKey;
use q2cloud_protocol::RSA_KEY_LENGTH;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::DaemonConfig;
use crate::registry::Registry;
use crate::rules::{Rule, Scope, load_rules};
use crate::services::{FileHistory, NullHistory, PlayerHistory, Services};
use crate::users::{User, load_users};

/// Seconds since the unix epoch
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Process-wide state handed to every task
pub struct Context {
    pub config: DaemonConfig,
    pub private_key: PrivateKey,
    pub registry: Registry,
    /// Operator rules; frontends can neither see nor remove these
    pub server_rules: RwLock<Vec<Rule>>,
    pub users: Vec<User>,
    pub services: Services,
    next_session: AtomicU64,
}

impl Context {
    pub fn new(
        config: DaemonConfig,
        private_key: PrivateKey,
        registry: Registry,
        server_rules: Vec<Rule>,
        users: Vec<User>,
        services: Services,
    ) -> Self {
        Self {
            config,
            private_key,
            registry,
            server_rules: RwLock::new(server_rules),
            users,
            services,
            next_session: AtomicU64::new(1),
        }
    }

    /// Load everything the daemon needs before it may accept a connection.
    /// Any failure here is fatal.
    pub fn bootstrap(config: DaemonConfig) -> Result<Self> {
        let server = &config.server;

        let private_key = PrivateKey::load(&server.private_key)
            .with_context(|| format!("loading {}", server.private_key.display()))?;
        if private_key.size() != RSA_KEY_LENGTH {
            bail!(
                "{} is a {}-bit key, expected {}",
                server.private_key.display(),
                private_key.size() * 8,
                RSA_KEY_LENGTH * 8
            );
        }

        let history: Arc<dyn PlayerHistory> = match &server.database {
            Some(path) => Arc::new(
                FileHistory::open(path)
                    .with_context(|| format!("opening database {}", path.display()))?,
            ),
            None => Arc::new(NullHistory),
        };

        let server_rules = match &server.rule_file {
            Some(path) => load_rules(path, Scope::Server)
                .with_context(|| format!("loading rules {}", path.display()))?,
            None => Vec::new(),
        };
        info!("Loaded {} server rules", server_rules.len());

        let users = match &server.user_file {
            Some(path) => load_users(path)?,
            None => Vec::new(),
        };
        info!("Loaded {} users", users.len());

        let registry = Registry::load(&server.client_directory, &config.invite, unix_now())
            .with_context(|| format!("scanning {}", server.client_directory.display()))?;
        info!("Loaded {} frontends", registry.len());

        Ok(Self::new(
            config,
            private_key,
            registry,
            server_rules,
            users,
            Services::system(history),
        ))
    }

    pub fn next_session_id(&self) -> u64 {
        self.next_session.fetch_add(1, Ordering::Relaxed)
    }
}

/// Accept frontend sessions until `shutdown` fires
pub async fn serve(
    ctx: Arc<Context>,
    listener: TcpListener,
    shutdown: CancellationToken,
) -> Result<()> {
    info!("Listening for frontends on {}", listener.local_addr()?);

    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    error!("Accept error: {}", e);
                    continue;
                }
            },
        };
        debug!("New connection from {}", peer);

        let ctx = ctx.clone();
        let cancel = shutdown.child_token();
        tokio::spawn(async move {
            handler::handle_connection(ctx, stream, peer, cancel).await;
        });
    }

    Ok(())
}

/// Cancel `shutdown` once `signal` fires. A handler that cannot be
/// installed is logged and the daemon keeps running.
async fn cancel_on_interrupt(
    signal: impl Future<Output = std::io::Result<()>>,
    shutdown: CancellationToken,
) {
    match signal.await {
        Ok(()) => {
            info!("Interrupt received, shutting down");
            shutdown.cancel();
        }
        Err(e) => error!("Cannot listen for interrupts: {}", e),
    }
}

/// Run the daemon until interrupted
pub async fn run(config: DaemonConfig) -> Result<()> {
    let ctx = Arc::new(Context::bootstrap(config)?);
    let shutdown = CancellationToken::new();

    let listener = TcpListener::bind(ctx.config.server.bind())
        .await
        .with_context(|| format!("binding {}", ctx.config.server.bind()))?;

    let metrics_handle = metrics::start_server(&ctx.config.monitoring);
    let maintenance_handle = tokio::spawn(maintenance::run(ctx.clone(), shutdown.clone()));

    let management_handle = if ctx.config.api.enabled {
        let ctx = ctx.clone();
        let shutdown = shutdown.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = management::start_server(ctx, shutdown).await {
                error!("Management API stopped: {:#}", e);
            }
        }))
    } else {
        None
    };

    tokio::spawn(cancel_on_interrupt(tokio::signal::ctrl_c(), shutdown.clone()));

    serve(ctx.clone(), listener, shutdown.clone()).await?;

    // sessions observe the cancelled parent token and tear down on their own
    let _ = maintenance_handle.await;
    if let Some(handle) = management_handle {
        let _ = handle.await;
    }
    metrics_handle.abort();

    if let Err(e) = ctx.registry.materialize() {
        error!("Failed to persist frontend settings: {}", e);
    }
    info!("Shutdown complete");
    Ok(())
}
