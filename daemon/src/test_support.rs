//! Shared fixtures for unit tests

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use q2cloud_crypto::PrivateKey;
use q2cloud_protocol::{Greeting, PlayerRecord, RSA_KEY_LENGTH, ServerFrame};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use crate::Context;
use crate::config::DaemonConfig;
use crate::frontend::{Frontend, KEY_FILE, SETTINGS_FILE, SessionHandle};
use crate::players::Player;
use crate::registry::Registry;
use crate::rules::{Scope, parse_rules};
use crate::services::Services;

pub const BACKEND_PRIVATE: &str = include_str!("../../tests/fixtures/backend_private.pem");
pub const FRONTEND_PRIVATE: &str = include_str!("../../tests/fixtures/frontend_private.pem");
pub const FRONTEND_PUBLIC: &str = include_str!("../../tests/fixtures/frontend_public.pem");
pub const OTHER_PRIVATE: &str = include_str!("../../tests/fixtures/other_private.pem");

pub fn backend_private() -> PrivateKey {
    PrivateKey::from_pem(BACKEND_PRIVATE).unwrap()
}

pub fn frontend_private() -> PrivateKey {
    PrivateKey::from_pem(FRONTEND_PRIVATE).unwrap()
}

/// Write a frontend directory that allows invites and teleports
pub fn write_frontend(root: &Path, uuid: &str, name: &str) {
    let dir = root.join(name);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(
        dir.join(SETTINGS_FILE),
        format!(
            "uuid = \"{uuid}\"\nname = \"{name}\"\nowner = \"ops@example.net\"\n\
             address = \"{name}.example.net\"\nallow_invite = true\nallow_teleport = true\n"
        ),
    )
    .unwrap();
    std::fs::write(dir.join(KEY_FILE), FRONTEND_PUBLIC).unwrap();
}

pub struct Fixture {
    pub root: TempDir,
    pub ctx: Arc<Context>,
}

impl Fixture {
    pub fn new(frontends: &[(&str, &str)]) -> Self {
        Self::with_rules(frontends, "")
    }

    /// Fixture whose server rule set is parsed from `rules`
    pub fn with_rules(frontends: &[(&str, &str)], rules: &str) -> Self {
        let root = tempfile::tempdir().unwrap();
        for (uuid, name) in frontends {
            write_frontend(root.path(), uuid, name);
        }

        let mut config = DaemonConfig::default();
        config.server.client_directory = root.path().to_path_buf();
        let registry = Registry::load(root.path(), &config.invite, 1_000).unwrap();
        let server_rules = parse_rules(rules, Scope::Server).unwrap();

        let ctx = Context::new(
            config,
            backend_private(),
            registry,
            server_rules,
            Vec::new(),
            Services::offline(),
        );
        Self {
            root,
            ctx: Arc::new(ctx),
        }
    }

    pub fn frontend(&self, uuid: &str) -> Arc<Frontend> {
        self.ctx.registry.find_by_id(uuid).unwrap()
    }
}

static SESSION_IDS: AtomicU64 = AtomicU64::new(1_000);

/// Attach a plaintext trusted session, as if the handshake had completed
pub fn attach(frontend: &Frontend, max_players: u8) -> SessionHandle {
    let handle = SessionHandle {
        id: SESSION_IDS.fetch_add(1, Ordering::Relaxed),
        cancel: CancellationToken::new(),
        peer: "192.0.2.10:40000".parse().unwrap(),
    };
    let greeting = Greeting {
        uuid: frontend.uuid(),
        version: 715,
        port: 27910,
        max_players,
        encrypted: false,
        challenge: Bytes::from(vec![0u8; RSA_KEY_LENGTH]),
    };
    frontend
        .state()
        .begin(handle.clone(), &greeting, None, 1_000);
    handle
}

/// Put a player straight into a slot
pub fn join(frontend: &Frontend, client_id: u8, userinfo: &str, now: u64) {
    let record = PlayerRecord {
        client_id,
        userinfo: userinfo.to_string(),
        version: "q2pro".into(),
    };
    let player = Player::from_record(&record, now, 3);
    frontend.state().players.add(player).unwrap();
}

/// Everything queued for the frontend, decoded
pub fn frames(frontend: &Frontend) -> Vec<ServerFrame> {
    match frontend.state().drain() {
        Some(bytes) => ServerFrame::decode_all(bytes).unwrap(),
        None => Vec::new(),
    }
}
