//! Periodic housekeeping

use std::sync::Arc;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::enforcement::{Pass, apply_rules};
use crate::metrics::METRICS;
use crate::{Context, unix_now};

/// Tick every `maintenance_time` seconds until `shutdown` fires
pub async fn run(ctx: Arc<Context>, shutdown: CancellationToken) {
    let period = ctx.config.server.maintenance_interval();
    info!("Maintenance every {:?}", period);

    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // the first tick completes immediately
    interval.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => tick_once(&ctx, unix_now()),
        }
    }
    debug!("Maintenance stopped");
}

/// One pass over every frontend
pub fn tick_once(ctx: &Context, now: u64) {
    for frontend in ctx.registry.all() {
        let live = {
            let mut state = frontend.state();
            if state.invites.refill(now) {
                trace!("{} invite tokens: {}", frontend.name(), state.invites.tokens);
            }
            state
                .rules
                .retain(|r| !(r.def.transient && r.is_expired(now)));

            if !state.trusted {
                continue;
            }
            state
                .players
                .live()
                .map(|p| p.client_id)
                .collect::<Vec<_>>()
        };

        for client_id in live {
            if let Err(e) = apply_rules(ctx, &frontend, client_id, now, Pass::Timed) {
                debug!("{}: re-evaluation of {} skipped: {}", frontend.name(), client_id, e);
            }
        }
    }

    ctx.services.vpn.cleanup();
    METRICS.refresh(&ctx.registry);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::*;
    use q2cloud_protocol::ServerFrame;

    #[test]
    fn test_refill_one_token_per_interval() {
        let fx = Fixture::new(&[("f1", "dm")]);
        let dm = fx.frontend("f1");
        dm.state().invites.tokens = 0;

        tick_once(&fx.ctx, 1_299);
        assert_eq!(dm.state().invites.tokens, 0);
        tick_once(&fx.ctx, 1_300);
        assert_eq!(dm.state().invites.tokens, 1);
        tick_once(&fx.ctx, 1_400);
        assert_eq!(dm.state().invites.tokens, 1);
        tick_once(&fx.ctx, 1_600);
        assert_eq!(dm.state().invites.tokens, 2);
    }

    #[test]
    fn test_timed_rule_fires_once() {
        let fx = Fixture::with_rules(
            &[("f1", "dm")],
            "[[rule]]\nkind = \"MESSAGE\"\nname = [\"claire\"]\nmessage = [\"thanks for playing\"]\ntime_spec = { play_time = 3600 }\n",
        );
        let dm = fx.frontend("f1");
        attach(&dm, 4);
        join(&dm, 0, "\\name\\claire", 1_000);

        tick_once(&fx.ctx, 2_000);
        assert!(frames(&dm).is_empty());

        tick_once(&fx.ctx, 4_600);
        assert_eq!(frames(&dm).len(), 1);

        tick_once(&fx.ctx, 4_660);
        assert!(frames(&dm).is_empty());
    }

    #[test]
    fn test_expired_session_rules_dropped() {
        let fx = Fixture::with_rules(
            &[("f1", "dm")],
            "[[rule]]\nkind = \"MUTE\"\nname = [\"loud\"]\nlength = 60\n",
        );
        let dm = fx.frontend("f1");
        attach(&dm, 4);
        join(&dm, 0, "\\name\\loud\\ip\\10.0.0.9:27901", 1_000);
        apply_rules(&fx.ctx, &dm, 0, 1_000, Pass::Full).unwrap();
        assert_eq!(
            frames(&dm),
            vec![ServerFrame::Command {
                command: "sv !mute CL 0 60\n".into()
            }]
        );
        assert_eq!(dm.state().rules.len(), 1);

        tick_once(&fx.ctx, 1_059);
        assert_eq!(dm.state().rules.len(), 1);
        tick_once(&fx.ctx, 1_060);
        assert!(dm.state().rules.is_empty());
    }
}
