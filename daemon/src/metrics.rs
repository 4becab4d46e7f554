//! Prometheus metrics

use crate::config::MonitoringConfig;
use crate::registry::Registry;
use prometheus::{IntCounter, IntGauge, Opts, Registry as PromRegistry};
use std::sync::LazyLock;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Global metrics registry
static REGISTRY: LazyLock<PromRegistry> = LazyLock::new(PromRegistry::new);

/// Global metrics instance
pub static METRICS: LazyLock<Metrics> = LazyLock::new(Metrics::new);

/// Metrics struct
pub struct Metrics {
    // Counters
    pub frames_sent: IntCounter,
    pub frames_received: IntCounter,
    pub auth_successes: IntCounter,
    pub auth_failures: IntCounter,
    pub rule_hits: IntCounter,
    pub key_rotations: IntCounter,

    // Gauges
    pub connected_frontends: IntGauge,
    pub connected_players: IntGauge,
}

fn counter(name: &str, help: &str) -> IntCounter {
    let c = IntCounter::with_opts(Opts::new(name, help)).expect("valid counter");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
}

fn gauge(name: &str, help: &str) -> IntGauge {
    let g = IntGauge::with_opts(Opts::new(name, help)).expect("valid gauge");
    REGISTRY.register(Box::new(g.clone())).ok();
    g
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            frames_sent: counter("q2cloud_frames_sent_total", "Total number of frames sent"),
            frames_received: counter(
                "q2cloud_frames_received_total",
                "Total number of frames received",
            ),
            auth_successes: counter(
                "q2cloud_auth_successes_total",
                "Total successful frontend handshakes",
            ),
            auth_failures: counter(
                "q2cloud_auth_failures_total",
                "Total refused frontend handshakes",
            ),
            rule_hits: counter("q2cloud_rule_hits_total", "Total rules applied to players"),
            key_rotations: counter(
                "q2cloud_key_rotations_total",
                "Total session key rotations",
            ),
            connected_frontends: gauge(
                "q2cloud_connected_frontends",
                "Frontends with a trusted session",
            ),
            connected_players: gauge(
                "q2cloud_connected_players",
                "Players across all connected frontends",
            ),
        }
    }

    /// Recompute the gauges from the registry
    pub fn refresh(&self, registry: &Registry) {
        let mut frontends = 0;
        let mut players = 0;
        for frontend in registry.all() {
            let state = frontend.state();
            if state.trusted {
                frontends += 1;
                players += state.players.count() as i64;
            }
        }
        self.connected_frontends.set(frontends);
        self.connected_players.set(players);
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Text exposition of every registered metric
pub fn render() -> Vec<u8> {
    use prometheus::Encoder;

    let encoder = prometheus::TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
        error!("Metrics encoding failed: {}", e);
    }
    buffer
}

/// Start the metrics server
pub fn start_server(config: &MonitoringConfig) -> JoinHandle<()> {
    let bind = config.prometheus_bind;
    let enabled = config.prometheus_enabled;

    tokio::spawn(async move {
        if !enabled {
            info!("Prometheus metrics disabled");
            return;
        }

        use bytes::Bytes;
        use http_body_util::Full;
        use hyper::{Response, server::conn::http1, service::service_fn};
        use hyper_util::rt::TokioIo;

        let listener = match tokio::net::TcpListener::bind(bind).await {
            Ok(l) => l,
            Err(e) => {
                error!("Failed to bind metrics server: {}", e);
                return;
            }
        };

        info!("Prometheus metrics server listening on {}", bind);

        loop {
            let (stream, _) = match listener.accept().await {
                Ok(r) => r,
                Err(e) => {
                    error!("Metrics accept error: {}", e);
                    continue;
                }
            };

            let io = TokioIo::new(stream);

            tokio::spawn(async move {
                let service = service_fn(|_req| async {
                    let mut response = Response::new(Full::new(Bytes::from(render())));
                    response.headers_mut().insert(
                        hyper::header::CONTENT_TYPE,
                        hyper::header::HeaderValue::from_static("text/plain; version=0.0.4"),
                    );
                    Ok::<_, std::convert::Infallible>(response)
                });

                if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                    error!("Metrics connection error: {}", e);
                }
            });
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::*;

    #[test]
    fn test_render_contains_counters() {
        METRICS.rule_hits.inc();
        let text = String::from_utf8(render()).unwrap();
        assert!(text.contains("q2cloud_rule_hits_total"));
        assert!(text.contains("q2cloud_connected_frontends"));
    }

    #[test]
    fn test_refresh_counts_trusted_only() {
        let fx = Fixture::new(&[("f1", "dm"), ("c2", "ctf")]);
        let dm = fx.frontend("f1");
        attach(&dm, 4);
        join(&dm, 0, "\\name\\a", 1_000);
        join(&dm, 1, "\\name\\b", 1_000);

        // a private instance, so parallel tests cannot disturb the gauges
        let metrics = Metrics::new();
        metrics.refresh(&fx.ctx.registry);
        assert_eq!(metrics.connected_frontends.get(), 1);
        assert_eq!(metrics.connected_players.get(), 2);

        metrics.refresh(&Registry::new("/nonexistent"));
        assert_eq!(metrics.connected_frontends.get(), 0);
    }
}
