//! Applying matched rules to a live player
//!
//! Evaluation always sees the operator's server rules followed by the
//! frontend's own. Rules already recorded on the player are skipped so a
//! re-evaluation never repeats an action. Rules with a `delay` are applied
//! later by a task that dies with the session.

use std::sync::Arc;
use std::time::Duration;

use q2cloud_protocol::ServerFrame;
use tracing::{debug, info};

use crate::error::SessionError;
use crate::frontend::{Frontend, FrontendState, SessionHandle};
use crate::metrics::METRICS;
use crate::rules::{Rule, RuleKind, evaluate};
use crate::{Context, unix_now};

/// Which rules a pass considers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pass {
    /// Everything, as on connect or a userinfo change
    Full,
    /// Only rules gated on play time or a time window
    Timed,
}

/// Evaluate and apply rules for the player in `client_id`.
///
/// Returns how many rules were applied right away.
pub fn apply_rules(
    ctx: &Context,
    frontend: &Arc<Frontend>,
    client_id: u8,
    now: u64,
    pass: Pass,
) -> Result<usize, SessionError> {
    // server rules are read before the frontend lock is taken
    let server_rules = ctx.server_rules.read().clone();

    let (lines, delayed, session, connect_time) = {
        let mut state = frontend.state();
        if !state.trusted {
            return Ok(0);
        }
        let Some(session) = state.session.clone() else {
            return Ok(0);
        };

        let client_rules = state.rules.clone();
        let player = state.players.find(client_id)?;
        let connect_time = player.connect_time;
        let hits: Vec<Rule> = evaluate(
            server_rules
                .iter()
                .chain(client_rules.iter())
                .filter(|r| pass == Pass::Full || r.is_timed())
                .filter(|r| !player.rules.iter().any(|id| id == r.id())),
            player,
            now,
        )
        .into_iter()
        .cloned()
        .collect();

        if hits.is_empty() {
            return Ok(0);
        }

        let (delayed, immediate): (Vec<Rule>, Vec<Rule>) = hits
            .into_iter()
            .partition(|r| pass == Pass::Full && r.def.delay > 0);
        let lines = commit(&mut state, client_id, &immediate, now)?;
        (lines, delayed, session, connect_time)
    };

    let applied = lines.len();
    finish(frontend, lines);

    for rule in delayed {
        schedule(frontend.clone(), session.clone(), client_id, connect_time, rule);
    }
    Ok(applied)
}

/// Apply `rules` in order under the frontend lock, stopping after a ban
fn commit(
    state: &mut FrontendState,
    client_id: u8,
    rules: &[Rule],
    now: u64,
) -> Result<Vec<String>, SessionError> {
    let mut frames: Vec<ServerFrame> = Vec::new();
    let mut pinned = Vec::new();
    let mut lines = Vec::new();

    let player = state.players.find_mut(client_id)?;
    for rule in rules {
        frames.extend(rule.enforce(player));
        pinned.extend(rule.pinned_mute(player, now));
        lines.push(format!(
            "rule {} {:?} applied to {} [{}]",
            rule.id(),
            rule.kind(),
            player.name,
            client_id
        ));
        if rule.kind() == RuleKind::Ban {
            break;
        }
    }

    for frame in &frames {
        state.queue(frame);
    }
    state.rules.extend(pinned);
    Ok(lines)
}

/// Audit, count and flush after the lock is released
fn finish(frontend: &Frontend, lines: Vec<String>) {
    if lines.is_empty() {
        return;
    }
    for line in &lines {
        info!("{}: {}", frontend.name(), line);
        frontend.audit().write(line);
    }
    METRICS.rule_hits.inc_by(lines.len() as u64);
    frontend.wake();
}

fn schedule(
    frontend: Arc<Frontend>,
    session: SessionHandle,
    client_id: u8,
    connect_time: u64,
    rule: Rule,
) {
    let delay = Duration::from_millis(rule.def.delay);
    debug!(
        "Rule {} for client {} deferred {:?}",
        rule.id(),
        client_id,
        delay
    );

    tokio::spawn(async move {
        tokio::select! {
            _ = session.cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }

        let now = unix_now();
        let lines = {
            let mut state = frontend.state();
            if !state.is_session(session.id) {
                return;
            }
            let Ok(player) = state.players.find(client_id) else {
                return;
            };
            // the slot may have been reused by someone else meanwhile
            if player.connect_time != connect_time
                || player.rules.iter().any(|id| id == rule.id())
                || !rule.matches(player, now)
            {
                return;
            }
            match commit(&mut state, client_id, std::slice::from_ref(&rule), now) {
                Ok(lines) => lines,
                Err(_) => return,
            }
        };
        finish(&frontend, lines);
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::players::STIFLE_MAX;
    use crate::rules::{Scope, parse_rules};
    use crate::test_support::*;
    use q2cloud_protocol::PrintLevel;

    const BAN_AND_MESSAGE: &str = r#"
        [[rule]]
        kind = "MESSAGE"
        address = ["10.0.0.0/8"]
        message = ["welcome"]

        [[rule]]
        kind = "BAN"
        address = ["10.0.0.0/8"]
        message = ["go away"]
    "#;

    #[test]
    fn test_ban_wins_over_everything() {
        let fx = Fixture::with_rules(&[("f1", "dm")], BAN_AND_MESSAGE);
        let dm = fx.frontend("f1");
        attach(&dm, 8);
        join(&dm, 2, "\\name\\bob\\ip\\10.1.2.3:27901", 1_000);

        assert_eq!(apply_rules(&fx.ctx, &dm, 2, 1_001, Pass::Full).unwrap(), 1);
        assert_eq!(
            frames(&dm),
            vec![
                ServerFrame::SayClient {
                    client_id: 2,
                    level: PrintLevel::High,
                    text: "go away\n".into()
                },
                ServerFrame::Command {
                    command: "kick 2\n".into()
                }
            ]
        );
    }

    #[test]
    fn test_applied_rules_not_repeated() {
        let fx = Fixture::with_rules(
            &[("f1", "dm")],
            "[[rule]]\nkind = \"MESSAGE\"\nname = [\"^bob$\"]\nmessage = [\"hi\", \"there\"]\n",
        );
        let dm = fx.frontend("f1");
        attach(&dm, 8);
        join(&dm, 0, "\\name\\bob", 1_000);

        assert_eq!(apply_rules(&fx.ctx, &dm, 0, 1_001, Pass::Full).unwrap(), 1);
        assert_eq!(frames(&dm).len(), 2);
        assert_eq!(apply_rules(&fx.ctx, &dm, 0, 1_002, Pass::Full).unwrap(), 0);
        assert!(frames(&dm).is_empty());
    }

    #[test]
    fn test_mute_is_pinned_to_address() {
        let fx = Fixture::new(&[("f1", "dm")]);
        let dm = fx.frontend("f1");
        attach(&dm, 8);
        dm.state().rules = parse_rules(
            "[[rule]]\nkind = \"MUTE\"\nname = [\"^loud$\"]\nmute_length = 120\n",
            Scope::Client,
        )
        .unwrap();
        join(&dm, 1, "\\name\\loud\\ip\\192.0.2.44:27901", 1_000);

        apply_rules(&fx.ctx, &dm, 1, 1_001, Pass::Full).unwrap();
        assert_eq!(
            frames(&dm),
            vec![ServerFrame::Command {
                command: "sv !mute CL 1 120\n".into()
            }]
        );
        assert_eq!(dm.state().rules.len(), 2);

        // a rename does not escape the mute
        dm.state()
            .players
            .find_mut(1)
            .unwrap()
            .set_userinfo("\\name\\quiet\\ip\\192.0.2.44:27901");
        assert_eq!(apply_rules(&fx.ctx, &dm, 1, 1_002, Pass::Full).unwrap(), 1);
        assert_eq!(
            frames(&dm),
            vec![ServerFrame::Command {
                command: "sv !mute CL 1 120\n".into()
            }]
        );
    }

    #[test]
    fn test_stifle_state() {
        let fx = Fixture::with_rules(
            &[("f1", "dm")],
            "[[rule]]\nkind = \"STIFLE\"\nname = [\"spammer\"]\nstifle_length = 900\n",
        );
        let dm = fx.frontend("f1");
        attach(&dm, 8);
        join(&dm, 3, "\\name\\spammer", 1_000);

        apply_rules(&fx.ctx, &dm, 3, 1_001, Pass::Full).unwrap();
        let state = dm.state();
        let player = state.players.find(3).unwrap();
        assert!(player.stifled);
        assert_eq!(player.stifle_length, STIFLE_MAX);
    }

    #[test]
    fn test_timed_pass_only_sees_timed_rules() {
        let fx = Fixture::with_rules(
            &[("f1", "dm")],
            r#"
            [[rule]]
            kind = "MESSAGE"
            name = ["bob"]
            message = ["always"]

            [[rule]]
            kind = "MESSAGE"
            name = ["bob"]
            message = ["veteran"]
            time_spec = { play_time = 600 }
            "#,
        );
        let dm = fx.frontend("f1");
        attach(&dm, 8);
        join(&dm, 0, "\\name\\bob", 1_000);

        assert_eq!(apply_rules(&fx.ctx, &dm, 0, 1_100, Pass::Timed).unwrap(), 0);
        assert_eq!(apply_rules(&fx.ctx, &dm, 0, 1_600, Pass::Timed).unwrap(), 1);
        assert_eq!(
            frames(&dm),
            vec![ServerFrame::SayClient {
                client_id: 0,
                level: PrintLevel::Medium,
                text: "veteran\n".into()
            }]
        );
    }

    #[test]
    fn test_untrusted_frontend_is_skipped() {
        let fx = Fixture::with_rules(&[("f1", "dm")], BAN_AND_MESSAGE);
        let dm = fx.frontend("f1");
        assert_eq!(apply_rules(&fx.ctx, &dm, 0, 1_000, Pass::Full).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_delayed_rule() {
        let fx = Fixture::with_rules(
            &[("f1", "dm")],
            "[[rule]]\nkind = \"MESSAGE\"\nname = [\"bob\"]\nmessage = [\"later\"]\ndelay = 50\n",
        );
        let dm = fx.frontend("f1");
        attach(&dm, 8);
        join(&dm, 0, "\\name\\bob", unix_now());

        assert_eq!(apply_rules(&fx.ctx, &dm, 0, unix_now(), Pass::Full).unwrap(), 0);
        assert!(frames(&dm).is_empty());

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(frames(&dm).len(), 1);
    }

    #[tokio::test]
    async fn test_delayed_rule_dies_with_session() {
        let fx = Fixture::with_rules(
            &[("f1", "dm")],
            "[[rule]]\nkind = \"MESSAGE\"\nname = [\"bob\"]\nmessage = [\"later\"]\ndelay = 50\n",
        );
        let dm = fx.frontend("f1");
        let handle = attach(&dm, 8);
        join(&dm, 0, "\\name\\bob", unix_now());

        apply_rules(&fx.ctx, &dm, 0, unix_now(), Pass::Full).unwrap();
        handle.cancel.cancel();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(frames(&dm).is_empty());
    }
}
