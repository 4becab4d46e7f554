//! Teleport and invite
//!
//! Both commands reach across frontends. Each frontend is locked on its
//! own and released before the next one is touched, so two session locks
//! are never held together.

use std::sync::Arc;

use q2cloud_protocol::{PrintLevel, ServerFrame};
use tracing::{debug, info};

use crate::Context;
use crate::config::InviteConfig;
use crate::error::SessionError;
use crate::frontend::Frontend;
use crate::players::{Player, stuff_command};

/// Move a player to another frontend, or list the destinations when
/// `target` is empty
pub fn teleport(
    ctx: &Context,
    frontend: &Arc<Frontend>,
    client_id: u8,
    target: &str,
    now: u64,
) -> Result<(), SessionError> {
    let target = target.trim();
    frontend.state().players.find(client_id)?;

    if !frontend.settings().allow_teleport {
        reply(frontend, client_id, "Teleporting is disabled on this server");
        return Ok(());
    }

    if target.is_empty() {
        let listing = destinations(ctx);
        reply(frontend, client_id, listing);
        return Ok(());
    }

    let Some(destination) = ctx
        .registry
        .trusted()
        .into_iter()
        .find(|f| f.name().eq_ignore_ascii_case(target))
    else {
        reply(
            frontend,
            client_id,
            format!("Unknown destination \"{}\", teleport with no name for a list", target),
        );
        return Ok(());
    };

    if Arc::ptr_eq(&destination, frontend) {
        reply(frontend, client_id, format!("You are already on {}", destination.name()));
        return Ok(());
    }

    let address = destination.advertised_address();
    let destination_name = destination.name();
    destination.state().teleport_count += 1;

    let player_name = {
        let mut state = frontend.state();
        let player = state.players.find_mut(client_id)?;
        player.teleports += 1;
        player.last_teleport = now;
        let name = player.name.clone();

        state.say_all(
            PrintLevel::High,
            format!("{} teleported to {}", name, destination_name),
        );
        state.command(stuff_command(client_id, &format!("connect {}", address)));
        name
    };
    frontend.wake();

    info!("{} teleported from {} to {}", player_name, frontend.name(), destination_name);
    frontend
        .audit()
        .write(format!("teleport: {} to {} ({})", player_name, destination_name, address));
    Ok(())
}

/// One line per connected frontend: name, map and who is playing
fn destinations(ctx: &Context) -> String {
    let mut lines = vec!["Available destinations:".to_string()];
    for f in ctx.registry.trusted() {
        let name = f.name();
        let state = f.state();
        let players = state.players.names();
        let roster = if players.is_empty() {
            "empty".to_string()
        } else {
            players.join(", ")
        };
        lines.push(format!("  {} [{}] {}", name, state.current_map, roster));
    }
    lines.join("\n")
}

/// Why a player may not invite right now, with seconds left to wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InviteRefusal {
    Cooldown(u64),
    Exhausted(u64),
}

/// Check a player's own invite allowance.
///
/// Returns the invites the player has before this one, after any refill.
pub fn check_player_invite(
    player: &Player,
    now: u64,
    config: &InviteConfig,
) -> Result<u32, InviteRefusal> {
    let since_last = now.saturating_sub(player.last_invite);

    let mut available = player.invites_available;
    if available == 0 {
        if since_last < config.player_refill {
            return Err(InviteRefusal::Exhausted(config.player_refill - since_last));
        }
        available = config.player_tokens;
    }

    if player.last_invite > 0 && since_last < config.player_cooldown {
        return Err(InviteRefusal::Cooldown(config.player_cooldown - since_last));
    }
    Ok(available)
}

/// Advertise this frontend on every other invite-accepting frontend
pub fn invite(
    ctx: &Context,
    frontend: &Arc<Frontend>,
    client_id: u8,
    text: &str,
    now: u64,
) -> Result<(), SessionError> {
    frontend.state().players.find(client_id)?;

    let settings = frontend.settings();
    if !settings.allow_invite {
        reply(frontend, client_id, "Invites are disabled on this server");
        return Ok(());
    }

    let address = frontend.advertised_address();
    let config = &ctx.config.invite;

    let name = {
        let mut state = frontend.state();
        if state.invites.tokens == 0 {
            let wait = state
                .invites
                .freq
                .saturating_sub(now.saturating_sub(state.invites.last_addition));
            state.say(
                client_id,
                PrintLevel::High,
                format!("This server has used its invites, please wait {} seconds", wait),
            );
            drop(state);
            frontend.wake();
            return Ok(());
        }

        let player = state.players.find(client_id)?;
        let available = match check_player_invite(player, now, config) {
            Ok(available) => available,
            Err(refusal) => {
                let message = match refusal {
                    InviteRefusal::Cooldown(secs) => {
                        format!("Please wait {} seconds before inviting again", secs)
                    }
                    InviteRefusal::Exhausted(secs) => {
                        format!("You are out of invites, please wait {} seconds", secs)
                    }
                };
                state.say(client_id, PrintLevel::High, message);
                drop(state);
                frontend.wake();
                return Ok(());
            }
        };

        state.invites.take();
        let player = state.players.find_mut(client_id)?;
        player.invites_available = available - 1;
        player.invites += 1;
        player.last_invite = now;
        player.name.clone()
    };

    let mut message = format!("{} invites you to play at {} ({})", name, settings.name, address);
    let text = text.trim();
    if !text.is_empty() {
        message.push_str(": ");
        message.push_str(text);
    }

    let frame = ServerFrame::SayAll {
        level: PrintLevel::Chat,
        text: format!("{}\n", message),
    };
    let mut reached = 0;
    for target in ctx.registry.trusted() {
        if target.settings().allow_invite && target.send(&frame) {
            reached += 1;
        }
    }

    debug!("Invite from {} reached {} frontends", name, reached);
    frontend.audit().write(format!("invite: {} ({} frontends)", name, reached));
    Ok(())
}

fn reply(frontend: &Frontend, client_id: u8, text: impl Into<String>) {
    frontend
        .state()
        .say(client_id, PrintLevel::Chat, text);
    frontend.wake();
}
