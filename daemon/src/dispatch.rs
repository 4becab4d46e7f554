//! Inbound frame handlers
//!
//! One free function per opcode. Each takes the session and the parsed
//! frame, mutates the frontend under its lock and queues any reply; the
//! session loop flushes after every packet.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::MutexGuard;
use q2cloud_protocol::{ClientFrame, PlayerCommand, PlayerRecord, PrintLevel, ServerFrame};
use tracing::{debug, trace, warn};

use crate::enforcement::{self, Pass};
use crate::error::SessionError;
use crate::frontend::{Frontend, FrontendState, SessionHandle};
use crate::metrics::METRICS;
use crate::players::{Player, mute_command, stuff_command};
use crate::services::HistoryEntry;
use crate::{Context, obituary, teleport};

/// Time a new player gets before rules are evaluated, so the reverse
/// lookup has a chance to land
pub const CONNECT_GRACE: Duration = Duration::from_secs(1);

/// What the session loop does after a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Close,
}

/// A trusted session as seen by the handlers
#[derive(Clone)]
pub struct Session {
    pub ctx: Arc<Context>,
    pub frontend: Arc<Frontend>,
    pub handle: SessionHandle,
}

impl Session {
    /// Lock the frontend, failing if another session has taken it over
    pub fn state(&self) -> Result<MutexGuard<'_, FrontendState>, SessionError> {
        let state = self.frontend.state();
        if !state.is_session(self.handle.id) {
            return Err(SessionError::Closed);
        }
        Ok(state)
    }
}

pub fn dispatch(session: &Session, frame: ClientFrame, now: u64) -> Result<Flow, SessionError> {
    match frame {
        ClientFrame::Ping => ping(session, now)?,
        ClientFrame::Print { level, text } => print(session, level, &text)?,
        ClientFrame::Map { name } => map(session, name)?,
        ClientFrame::PlayerList(records) => {
            for record in records {
                if let Err(e) = connect(session, record, now) {
                    if !e.is_recoverable() {
                        return Err(e);
                    }
                    debug!("{}: player list entry skipped: {}", session.frontend.name(), e);
                }
            }
        }
        ClientFrame::PlayerUpdate {
            client_id,
            userinfo,
        } => player_update(session, client_id, &userinfo, now)?,
        ClientFrame::Connect(record) => connect(session, record, now)?,
        ClientFrame::Disconnect { client_id } => disconnect(session, client_id)?,
        ClientFrame::Command(command) => player_command(session, command, now)?,
        ClientFrame::Frag { victim, attacker } => frag(session, victim, attacker)?,
        ClientFrame::Quit => {
            session.frontend.audit().write("frontend quit");
            return Ok(Flow::Close);
        }
        ClientFrame::Hello(_) => return Err(SessionError::Unexpected("hello")),
        ClientFrame::Auth { .. } => return Err(SessionError::Unexpected("auth")),
    }
    Ok(Flow::Continue)
}

fn ping(session: &Session, now: u64) -> Result<(), SessionError> {
    let mut state = session.state()?;
    state.ping_count += 1;
    state.last_seen = now;
    state.queue(&ServerFrame::Pong);

    let count = state.ping_count;
    let state = &mut *state;
    if let Some(crypto) = state.crypto.as_mut() {
        if crypto.should_rotate(count) {
            crypto.stage(&mut state.outbound);
            METRICS.key_rotations.inc();
            debug!("{}: rotating session key", session.frontend.name());
        }
    }
    Ok(())
}

fn print(session: &Session, level: PrintLevel, text: &str) -> Result<(), SessionError> {
    let frontend = &session.frontend;
    match level {
        PrintLevel::Chat => {
            frontend.audit().write(format!("chat: {}", text.trim_end()));
            let mut state = session.state()?;
            let (id, _) = state.players.from_print(text)?;
            let player = state.players.find(id)?;
            if player.stifled {
                let length = player.stifle_length;
                state.command(mute_command(id, Some(length)));
            }
        }
        PrintLevel::High => frontend.audit().write(format!("print: {}", text.trim_end())),
        PrintLevel::Medium => {
            let line = {
                let state = session.state()?;
                obituary::parse(&state.players, text).map(|obit| {
                    let victim = name_of(&state, obit.victim);
                    match obit.attacker {
                        Some(attacker) => format!(
                            "frag: {} killed {} ({})",
                            name_of(&state, attacker),
                            victim,
                            obit.means
                        ),
                        None => format!("death: {} ({})", victim, obit.means),
                    }
                })
            };
            match line {
                Some(line) => frontend.audit().write(line),
                None => trace!("{}: {}", frontend.name(), text.trim_end()),
            }
        }
        PrintLevel::Low => trace!("{}: {}", frontend.name(), text.trim_end()),
    }
    Ok(())
}

fn name_of(state: &FrontendState, id: u8) -> String {
    state
        .players
        .find(id)
        .map(|p| p.name.clone())
        .unwrap_or_default()
}

fn map(session: &Session, name: String) -> Result<(), SessionError> {
    {
        let mut state = session.state()?;
        let previous = std::mem::replace(&mut state.current_map, name.clone());
        state.previous_map = previous;
    }
    session.frontend.audit().write(format!("map: {}", name));
    Ok(())
}

fn connect(session: &Session, record: PlayerRecord, now: u64) -> Result<(), SessionError> {
    let ctx = &session.ctx;
    let frontend = &session.frontend;
    let client_id = record.client_id;

    let player = Player::from_record(&record, now, ctx.config.invite.player_tokens);
    let connect_time = player.connect_time;
    let name = player.name.clone();
    let ip = player.ip;

    let (cookie, wants_vpn) = {
        let mut state = session.state()?;
        let issued = state.players.add(player)?;
        if let Some(cookie) = &issued {
            state.command(stuff_command(client_id, &format!("set cookie {} u", cookie)));
        }
        let cookie = state.players.find(client_id)?.cookie.clone();
        (cookie, state.rules.iter().any(|r| r.def.vpn))
    };
    let wants_vpn = wants_vpn || ctx.server_rules.read().iter().any(|r| r.def.vpn);

    frontend.audit().write(format!(
        "connect: {} [{}] from {}",
        name,
        client_id,
        ip.map(|ip| ip.to_string()).unwrap_or_else(|| "unknown".into())
    ));

    let history = ctx.services.history.clone();
    let entry = HistoryEntry {
        time: now,
        frontend: frontend.name(),
        name,
        ip,
        cookie,
    };
    tokio::spawn(async move {
        if let Err(e) = history.record(entry).await {
            warn!("History write failed: {}", e);
        }
    });

    if let Some(ip) = ip {
        resolve_hostname(session, client_id, connect_time, ip);
    }

    let session = session.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = session.handle.cancel.cancelled() => return,
            _ = tokio::time::sleep(CONNECT_GRACE) => {}
        }

        if wants_vpn {
            if let Some(ip) = ip {
                let vpn = session.ctx.services.vpn.is_vpn(ip).await;
                with_player(&session, client_id, connect_time, |p| p.vpn = vpn);
            }
        }

        if !still_here(&session, client_id, connect_time) {
            return;
        }
        let now = crate::unix_now();
        if let Err(e) =
            enforcement::apply_rules(&session.ctx, &session.frontend, client_id, now, Pass::Full)
        {
            debug!("Rules for client {} not applied: {}", client_id, e);
        }
    });

    Ok(())
}

/// PTR lookup in the background; cancelled with the session
fn resolve_hostname(session: &Session, client_id: u8, connect_time: u64, ip: IpAddr) {
    let session = session.clone();
    let token = session.handle.cancel.child_token();
    tokio::spawn(async move {
        let host = tokio::select! {
            _ = token.cancelled() => return,
            host = session.ctx.services.resolver.reverse(ip) => host,
        };
        if let Some(host) = host {
            debug!("{} is {}", ip, host);
            with_player(&session, client_id, connect_time, |p| p.hostname = Some(host));
        }
    });
}

/// Run `f` on the player if the slot still holds the same connection
fn with_player(session: &Session, client_id: u8, connect_time: u64, f: impl FnOnce(&mut Player)) {
    let Ok(mut state) = session.state() else {
        return;
    };
    if let Ok(player) = state.players.find_mut(client_id) {
        if player.connect_time == connect_time {
            f(player);
        }
    }
}

fn still_here(session: &Session, client_id: u8, connect_time: u64) -> bool {
    session.state().is_ok_and(|state| {
        state
            .players
            .find(client_id)
            .is_ok_and(|p| p.connect_time == connect_time)
    })
}

fn player_update(
    session: &Session,
    client_id: u8,
    userinfo: &str,
    now: u64,
) -> Result<(), SessionError> {
    let changed = {
        let mut state = session.state()?;
        if usize::from(client_id) >= state.players.capacity() {
            return Err(SessionError::InvalidClient(client_id));
        }
        match state.players.find_mut(client_id) {
            Ok(player) => player.set_userinfo(userinfo),
            Err(_) => return Err(SessionError::NameNotInPlayer(client_id)),
        }
    };
    if changed {
        enforcement::apply_rules(&session.ctx, &session.frontend, client_id, now, Pass::Full)?;
    }
    Ok(())
}

fn disconnect(session: &Session, client_id: u8) -> Result<(), SessionError> {
    let player = session.state()?.players.remove(client_id)?;
    if player.is_live() {
        session
            .frontend
            .audit()
            .write(format!("disconnect: {} [{}]", player.name, client_id));
    }
    Ok(())
}

fn frag(session: &Session, victim: u8, attacker: u8) -> Result<(), SessionError> {
    let mut state = session.state()?;
    if victim == attacker {
        let player = state.players.find_mut(victim)?;
        player.suicides += 1;
        player.deaths += 1;
        return Ok(());
    }

    state.players.find(attacker)?;
    state.players.find_mut(victim)?.deaths += 1;
    state.players.find_mut(attacker)?.frags += 1;
    Ok(())
}

fn player_command(session: &Session, command: PlayerCommand, now: u64) -> Result<(), SessionError> {
    match command {
        PlayerCommand::Teleport { client_id, target } => {
            teleport::teleport(&session.ctx, &session.frontend, client_id, &target, now)
        }
        PlayerCommand::Invite { client_id, text } => {
            teleport::invite(&session.ctx, &session.frontend, client_id, &text, now)
        }
        PlayerCommand::Unknown(sub) => {
            debug!("{}: unknown command {}", session.frontend.name(), sub);
            Ok(())
        }
    }
}
