//! A managed game server and its session state

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use parking_lot::{Mutex, MutexGuard, RwLock};
use q2cloud_crypto::{CryptoError, PublicKey, SessionKey};
use q2cloud_protocol::{Greeting, MessageWriter, PrintLevel, ServerFrame};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::audit::AuditLog;
use crate::config::InviteConfig;
use crate::error::SessionError;
use crate::key_rotation::SessionCrypto;
use crate::metrics::METRICS;
use crate::players::PlayerTable;
use crate::rules::{Rule, RuleError, save_rules};

pub const SETTINGS_FILE: &str = "settings";
pub const KEY_FILE: &str = "key";
pub const RULES_FILE: &str = "rules";
pub const LOG_FILE: &str = "log";

/// Contents of a frontend's `settings` file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrontendSettings {
    pub uuid: String,
    pub name: String,
    pub owner: String,
    pub description: String,
    /// Advertised `host[:port]` used in teleport and invite hints
    pub address: String,
    pub disabled: bool,
    pub allow_invite: bool,
    pub allow_teleport: bool,
    pub verified: bool,
    pub last_seen: u64,
}

/// Throttle for the invite command, refilled by the maintenance loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct InviteBucket {
    pub tokens: u32,
    pub max: u32,
    pub freq: u64,
    pub last_addition: u64,
    pub use_count: u64,
}

impl InviteBucket {
    pub fn new(config: &InviteConfig, now: u64) -> Self {
        Self {
            tokens: config.tokens.min(config.max),
            max: config.max,
            freq: config.interval,
            last_addition: now,
            use_count: 0,
        }
    }

    /// Spend a token if one is available
    pub fn take(&mut self) -> bool {
        if self.tokens == 0 {
            return false;
        }
        self.tokens -= 1;
        self.use_count += 1;
        true
    }

    /// Add at most one token per `freq` seconds, never above `max`
    pub fn refill(&mut self, now: u64) -> bool {
        if self.tokens >= self.max || now.saturating_sub(self.last_addition) < self.freq {
            return false;
        }
        self.tokens += 1;
        self.last_addition = now;
        true
    }
}

/// Identity of the session currently attached to a frontend
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub id: u64,
    pub cancel: CancellationToken,
    pub peer: SocketAddr,
}

/// Everything a session mutates; guarded by the frontend mutex
#[derive(Debug)]
pub struct FrontendState {
    pub session: Option<SessionHandle>,
    pub connected: bool,
    pub trusted: bool,
    pub encrypted: bool,
    pub crypto: Option<SessionCrypto>,
    pub outbound: MessageWriter,
    pub ping_count: u64,
    pub connect_time: u64,
    pub last_seen: u64,
    pub version: u32,
    pub port: u16,
    pub max_players: u8,
    pub current_map: String,
    pub previous_map: String,
    pub players: PlayerTable,
    pub rules: Vec<Rule>,
    pub invites: InviteBucket,
    pub teleport_count: u32,
}

impl FrontendState {
    fn new(rules: Vec<Rule>, invites: InviteBucket) -> Self {
        Self {
            session: None,
            connected: false,
            trusted: false,
            encrypted: false,
            crypto: None,
            outbound: MessageWriter::new(),
            ping_count: 0,
            connect_time: 0,
            last_seen: 0,
            version: 0,
            port: 0,
            max_players: 0,
            current_map: String::new(),
            previous_map: String::new(),
            players: PlayerTable::default(),
            rules,
            invites,
            teleport_count: 0,
        }
    }

    /// Mark the frontend trusted under a new session
    pub fn begin(
        &mut self,
        handle: SessionHandle,
        greeting: &Greeting,
        key: Option<&SessionKey>,
        now: u64,
    ) {
        self.session = Some(handle);
        self.connected = true;
        self.trusted = true;
        self.encrypted = key.is_some();
        self.crypto = key.map(SessionCrypto::new);
        self.outbound.clear();
        self.ping_count = 0;
        self.connect_time = now;
        self.last_seen = now;
        self.version = greeting.version;
        self.port = greeting.port;
        self.max_players = greeting.max_players;
        self.players = PlayerTable::new(greeting.max_players);
        self.rules.retain(|r| !r.def.transient);
    }

    /// Tear down session state if `session_id` is still the attached one
    pub fn end(&mut self, session_id: u64, now: u64) -> bool {
        if !self.is_session(session_id) {
            return false;
        }
        self.session = None;
        self.connected = false;
        self.trusted = false;
        self.encrypted = false;
        self.crypto = None;
        self.outbound.clear();
        self.last_seen = now;
        self.players.clear();
        true
    }

    pub fn is_session(&self, session_id: u64) -> bool {
        self.session.as_ref().is_some_and(|s| s.id == session_id)
    }

    pub fn queue(&mut self, frame: &ServerFrame) {
        frame.encode(&mut self.outbound);
        METRICS.frames_sent.inc();
    }

    pub fn say(&mut self, client_id: u8, level: PrintLevel, text: impl Into<String>) {
        self.queue(&ServerFrame::SayClient {
            client_id,
            level,
            text: line(text.into()),
        });
    }

    pub fn say_all(&mut self, level: PrintLevel, text: impl Into<String>) {
        self.queue(&ServerFrame::SayAll {
            level,
            text: line(text.into()),
        });
    }

    pub fn command(&mut self, command: impl Into<String>) {
        self.queue(&ServerFrame::Command {
            command: command.into(),
        });
    }

    /// Take everything queued, sealed for the wire when encrypted
    pub fn drain(&mut self) -> Option<Bytes> {
        if self.outbound.is_empty() {
            return None;
        }
        let plain = self.outbound.take();
        match self.crypto.as_mut() {
            Some(crypto) => Some(Bytes::from(crypto.seal(&plain))),
            None => Some(plain),
        }
    }

    /// Decrypt one inbound packet if the session is encrypted
    pub fn open(&mut self, packet: &[u8]) -> Result<Bytes, SessionError> {
        match self.crypto.as_mut() {
            Some(crypto) => Ok(Bytes::from(crypto.open(packet)?)),
            None => Ok(Bytes::copy_from_slice(packet)),
        }
    }
}

/// Print text ends with a newline on the Quake side
fn line(mut text: String) -> String {
    if !text.ends_with('\n') {
        text.push('\n');
    }
    text
}

/// One registered frontend
#[derive(Debug)]
pub struct Frontend {
    dir: PathBuf,
    settings: RwLock<FrontendSettings>,
    state: Mutex<FrontendState>,
    wake: Notify,
    audit: AuditLog,
}

impl Frontend {
    pub fn new(
        dir: impl Into<PathBuf>,
        settings: FrontendSettings,
        rules: Vec<Rule>,
        invites: InviteBucket,
    ) -> Self {
        let dir = dir.into();
        Self {
            audit: AuditLog::new(Some(dir.join(LOG_FILE))),
            dir,
            settings: RwLock::new(settings),
            state: Mutex::new(FrontendState::new(rules, invites)),
            wake: Notify::new(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn settings(&self) -> FrontendSettings {
        self.settings.read().clone()
    }

    pub fn update_settings(&self, f: impl FnOnce(&mut FrontendSettings)) {
        f(&mut self.settings.write());
    }

    pub fn name(&self) -> String {
        self.settings.read().name.clone()
    }

    pub fn uuid(&self) -> String {
        self.settings.read().uuid.clone()
    }

    /// Lock the session state. Never hold the guard across an await.
    pub fn state(&self) -> MutexGuard<'_, FrontendState> {
        self.state.lock()
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    pub fn is_trusted(&self) -> bool {
        self.state.lock().trusted
    }

    /// Public key from the `key` file, read fresh for every handshake
    pub fn load_key(&self) -> Result<PublicKey, CryptoError> {
        PublicKey::load(self.dir.join(KEY_FILE))
    }

    /// Queue a frame from outside the session task and wake it to flush.
    ///
    /// Dropped when no trusted session is attached.
    pub fn send(&self, frame: &ServerFrame) -> bool {
        {
            let mut state = self.state.lock();
            if !state.trusted {
                return false;
            }
            state.queue(frame);
        }
        self.wake.notify_one();
        true
    }

    /// Ask the session task to flush
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    pub async fn notified(&self) {
        self.wake.notified().await
    }

    /// `host:port` players should connect to
    pub fn advertised_address(&self) -> String {
        let address = self.settings.read().address.clone();
        let state = self.state.lock();
        if address.is_empty() {
            let host = state
                .session
                .as_ref()
                .map(|s| s.peer.ip().to_string())
                .unwrap_or_default();
            return format!("{}:{}", host, state.port);
        }
        if address.contains(':') || state.port == 0 {
            address
        } else {
            format!("{}:{}", address, state.port)
        }
    }

    /// Write the persistent client rules back to the `rules` file
    pub fn persist_rules(&self) -> Result<(), RuleError> {
        let rules = self.state.lock().rules.clone();
        save_rules(self.dir.join(RULES_FILE), &rules)
    }

    /// Read-only view for operators
    pub fn summary(&self) -> FrontendSummary {
        let settings = self.settings();
        let state = self.state.lock();
        FrontendSummary {
            uuid: settings.uuid,
            name: settings.name,
            owner: settings.owner,
            description: settings.description,
            connected: state.connected,
            trusted: state.trusted,
            encrypted: state.encrypted,
            version: state.version,
            map: state.current_map.clone(),
            players: state.players.count(),
            max_players: state.max_players,
            connect_time: state.connect_time,
            last_seen: state.last_seen.max(settings.last_seen),
            invites: state.invites,
            teleport_count: state.teleport_count,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FrontendSummary {
    pub uuid: String,
    pub name: String,
    pub owner: String,
    pub description: String,
    pub connected: bool,
    pub trusted: bool,
    pub encrypted: bool,
    pub version: u32,
    pub map: String,
    pub players: usize,
    pub max_players: u8,
    pub connect_time: u64,
    pub last_seen: u64,
    pub invites: InviteBucket,
    pub teleport_count: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use q2cloud_protocol::RSA_KEY_LENGTH;

    fn bucket() -> InviteBucket {
        InviteBucket::new(&InviteConfig::default(), 1_000)
    }

    fn greeting() -> Greeting {
        Greeting {
            uuid: "f1".into(),
            version: 715,
            port: 27910,
            max_players: 8,
            encrypted: false,
            challenge: Bytes::from(vec![0u8; RSA_KEY_LENGTH]),
        }
    }

    fn handle(id: u64) -> SessionHandle {
        SessionHandle {
            id,
            cancel: CancellationToken::new(),
            peer: "192.0.2.7:40000".parse().unwrap(),
        }
    }

    #[test]
    fn test_bucket_take_never_negative() {
        let mut b = bucket();
        assert!(b.take());
        assert!(b.take());
        assert!(b.take());
        assert!(!b.take());
        assert_eq!(b.tokens, 0);
        assert_eq!(b.use_count, 3);
    }

    #[test]
    fn test_bucket_refill_rate_and_ceiling() {
        let mut b = bucket();
        assert!(!b.refill(5_000), "full bucket must not grow");

        b.take();
        b.take();
        assert!(!b.refill(1_299));
        assert!(b.refill(1_300));
        assert!(!b.refill(1_300), "one token per interval");
        assert!(b.refill(1_600));
        assert_eq!(b.tokens, 3);
        assert!(!b.refill(10_000));
        assert!(b.tokens <= b.max);
    }

    #[test]
    fn test_begin_and_end_session() {
        let mut state = FrontendState::new(Vec::new(), bucket());
        let key = SessionKey::generate();
        state.begin(handle(7), &greeting(), Some(&key), 2_000);
        assert!(state.trusted && state.encrypted);
        assert_eq!(state.players.capacity(), 8);

        // a stale session must not tear down its replacement
        assert!(!state.end(6, 2_100));
        assert!(state.trusted);

        assert!(state.end(7, 2_100));
        assert!(!state.connected && !state.trusted && !state.encrypted);
        assert_eq!(state.last_seen, 2_100);
    }

    #[test]
    fn test_drain_plain() {
        let mut state = FrontendState::new(Vec::new(), bucket());
        assert!(state.drain().is_none());
        state.say(3, PrintLevel::Chat, "hello");
        state.queue(&ServerFrame::Pong);
        let bytes = state.drain().unwrap();
        assert_eq!(
            ServerFrame::decode_all(bytes).unwrap(),
            vec![
                ServerFrame::SayClient {
                    client_id: 3,
                    level: PrintLevel::Chat,
                    text: "hello\n".into()
                },
                ServerFrame::Pong
            ]
        );
        assert!(state.drain().is_none());
    }

    #[test]
    fn test_send_requires_trust() {
        let dir = tempfile::tempdir().unwrap();
        let frontend = Frontend::new(dir.path(), FrontendSettings::default(), Vec::new(), bucket());
        assert!(!frontend.send(&ServerFrame::Pong));

        frontend
            .state()
            .begin(handle(1), &greeting(), None, 1_000);
        assert!(frontend.send(&ServerFrame::Pong));
        assert!(frontend.state().drain().is_some());
    }

    #[test]
    fn test_advertised_address() {
        let dir = tempfile::tempdir().unwrap();
        let frontend = Frontend::new(dir.path(), FrontendSettings::default(), Vec::new(), bucket());
        frontend
            .state()
            .begin(handle(1), &greeting(), None, 1_000);
        assert_eq!(frontend.advertised_address(), "192.0.2.7:27910");

        frontend.update_settings(|s| s.address = "dm.example.net".into());
        assert_eq!(frontend.advertised_address(), "dm.example.net:27910");

        frontend.update_settings(|s| s.address = "dm.example.net:27911".into());
        assert_eq!(frontend.advertised_address(), "dm.example.net:27911");
    }
}
