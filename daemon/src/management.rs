//! Management API
//!
//! Operator endpoints for inspecting frontends and pushing commands,
//! announcements and rules to them. Everything under `/api` requires the
//! configured bearer secret.

use std::convert::Infallible;
use std::sync::Arc;

use anyhow::{Context as _, Result, bail};
use axum::{
    Router,
    extract::{Json, Path, Query, Request, State},
    http::{HeaderMap, StatusCode, header},
    middleware::{self, Next},
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{get, post},
};
use q2cloud_crypto::constant_time_eq;
use q2cloud_protocol::{PrintLevel, ServerFrame};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_stream::{Stream, StreamExt, wrappers::UnboundedReceiverStream};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::frontend::{Frontend, FrontendSummary};
use crate::players::Player;
use crate::registry::RegistryError;
use crate::rules::{Rule, RuleDef, Scope};
use crate::services::HistoryEntry;
use crate::{Context, unix_now};

#[derive(Clone)]
struct AppState {
    ctx: Arc<Context>,
    secret: Arc<str>,
}

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0} has no trusted session")]
    NotConnected(String),

    #[error("{0}")]
    Internal(String),
}

impl From<RegistryError> for ApiError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::UnknownFrontend(_) => Self::NotFound(e.to_string()),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotConnected(_) => StatusCode::CONFLICT,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = serde_json::json!({ "error": self.to_string() });
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

#[derive(Debug, Serialize, Deserialize)]
pub struct Health {
    pub status: String,
    pub frontends: usize,
    pub connected: usize,
}

#[derive(Debug, Deserialize)]
pub struct CommandRequest {
    pub command: String,
}

#[derive(Debug, Deserialize)]
pub struct SayRequest {
    pub text: String,
    /// Quake 2 print level, chat when absent
    #[serde(default)]
    pub level: Option<u8>,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub q: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Created {
    pub uuid: String,
}

/// Every route, with the bearer check on `/api`
fn router(ctx: Arc<Context>, secret: String) -> Router {
    let state = AppState {
        ctx,
        secret: secret.into(),
    };

    let api = Router::new()
        .route("/frontends", get(list_frontends))
        .route("/frontends/:name", get(get_frontend))
        .route("/frontends/:name/players", get(list_players))
        .route("/frontends/:name/command", post(send_command))
        .route("/frontends/:name/say", post(say_all))
        .route("/frontends/:name/rules", post(add_rule))
        .route("/frontends/:name/log", get(follow_log))
        .route("/users/:email/frontends", get(user_frontends))
        .route("/history", get(search_history))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_bearer));

    Router::new()
        .route("/health", get(health))
        .nest("/api", api)
        .with_state(state)
}

/// Serve the management API until `shutdown` fires
pub async fn start_server(ctx: Arc<Context>, shutdown: CancellationToken) -> Result<()> {
    let Some(secret) = ctx.config.api.resolve_secret()? else {
        bail!("management API enabled without a secret or auth_file");
    };
    if secret.is_empty() {
        bail!("management API secret is empty");
    }

    let bind = ctx.config.api.bind();
    let listener = TcpListener::bind(&bind)
        .await
        .with_context(|| format!("binding management API on {}", bind))?;
    info!("Management API listening on {}", bind);

    axum::serve(listener, router(ctx, secret))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    Ok(())
}

fn authorized(headers: &HeaderMap, secret: &str) -> bool {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .is_some_and(|token| constant_time_eq(token.trim().as_bytes(), secret.as_bytes()))
}

async fn require_bearer(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if !authorized(request.headers(), &state.secret) {
        warn!("Management API: unauthorized {} {}", request.method(), request.uri());
        return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
    }
    next.run(request).await
}

async fn health(State(state): State<AppState>) -> Json<Health> {
    let registry = &state.ctx.registry;
    Json(Health {
        status: "ok".into(),
        frontends: registry.len(),
        connected: registry.trusted().len(),
    })
}

async fn list_frontends(State(state): State<AppState>) -> Json<Vec<FrontendSummary>> {
    let summaries = state
        .ctx
        .registry
        .all()
        .iter()
        .map(|f| f.summary())
        .collect();
    Json(summaries)
}

async fn get_frontend(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<FrontendSummary>> {
    let frontend = state.ctx.registry.find_by_name(&name)?;
    Ok(Json(frontend.summary()))
}

async fn list_players(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<Vec<Player>>> {
    let frontend = state.ctx.registry.find_by_name(&name)?;
    let players = frontend.state().players.live().cloned().collect();
    Ok(Json(players))
}

fn send(frontend: &Frontend, frame: &ServerFrame) -> ApiResult<()> {
    if frontend.send(frame) {
        Ok(())
    } else {
        Err(ApiError::NotConnected(frontend.name()))
    }
}

async fn send_command(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(req): Json<CommandRequest>,
) -> ApiResult<StatusCode> {
    let command = req.command.trim();
    if command.is_empty() {
        return Err(ApiError::BadRequest("empty command".into()));
    }

    let frontend = state.ctx.registry.find_by_name(&name)?;
    send(
        &frontend,
        &ServerFrame::Command {
            command: format!("{}\n", command),
        },
    )?;
    frontend.audit().write(format!("api: command {}", command));
    Ok(StatusCode::ACCEPTED)
}

async fn say_all(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(req): Json<SayRequest>,
) -> ApiResult<StatusCode> {
    let text = req.text.trim_end();
    if text.is_empty() {
        return Err(ApiError::BadRequest("empty text".into()));
    }

    let frontend = state.ctx.registry.find_by_name(&name)?;
    let level = req.level.map_or(PrintLevel::Chat, PrintLevel::from_byte);
    send(
        &frontend,
        &ServerFrame::SayAll {
            level,
            text: format!("{}\n", text),
        },
    )?;
    frontend.audit().write(format!("api: say {}", text));
    Ok(StatusCode::ACCEPTED)
}

async fn add_rule(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(mut def): Json<RuleDef>,
) -> ApiResult<(StatusCode, Json<Created>)> {
    let frontend = state.ctx.registry.find_by_name(&name)?;

    def.scope = Scope::Client;
    def.transient = false;
    if def.created == 0 {
        def.created = unix_now();
    }
    let rule = Rule::compile(def).map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let uuid = rule.id().to_string();
    let kind = rule.kind();

    frontend.state().rules.push(rule);
    frontend
        .persist_rules()
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    info!("{}: rule {} ({:?}) added through the API", frontend.name(), uuid, kind);
    frontend.audit().write(format!("api: rule {} added ({:?})", uuid, kind));
    Ok((StatusCode::CREATED, Json(Created { uuid })))
}

async fn follow_log(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Sse<impl Stream<Item = std::result::Result<Event, Infallible>>>> {
    let frontend = state.ctx.registry.find_by_name(&name)?;
    let lines = UnboundedReceiverStream::new(frontend.audit().subscribe())
        .map(|line| Ok(Event::default().data(line)));
    Ok(Sse::new(lines).keep_alive(KeepAlive::default()))
}

async fn user_frontends(
    State(state): State<AppState>,
    Path(email): Path<String>,
) -> Json<Vec<FrontendSummary>> {
    let summaries = state
        .ctx
        .registry
        .by_owner(&email)
        .iter()
        .map(|f| f.summary())
        .collect();
    Json(summaries)
}

async fn search_history(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Json<Vec<HistoryEntry>>> {
    let rows = state
        .ctx
        .services
        .history
        .search(&query.q)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(rows))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::*;
    use axum::http::HeaderValue;

    fn app_state(fx: &Fixture) -> AppState {
        AppState {
            ctx: fx.ctx.clone(),
            secret: "hunter2".into(),
        }
    }

    #[test]
    fn test_bearer_check() {
        let mut headers = HeaderMap::new();
        assert!(!authorized(&headers, "hunter2"));

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer hunter3"));
        assert!(!authorized(&headers, "hunter2"));

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("hunter2"));
        assert!(!authorized(&headers, "hunter2"));

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer hunter2"));
        assert!(authorized(&headers, "hunter2"));
    }

    #[tokio::test]
    async fn test_list_and_players() {
        let fx = Fixture::new(&[("f1", "dm"), ("c2", "ctf")]);
        let dm = fx.frontend("f1");
        attach(&dm, 4);
        join(&dm, 2, "\\name\\claire", 1_000);
        let state = app_state(&fx);

        let Json(all) = list_frontends(State(state.clone())).await;
        assert_eq!(all.len(), 2);

        let Json(players) = list_players(State(state.clone()), Path("dm".into()))
            .await
            .unwrap();
        assert_eq!(players.len(), 1);
        assert_eq!(players[0].name, "claire");

        assert!(matches!(
            list_players(State(state), Path("nope".into())).await,
            Err(ApiError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_command_and_say_reach_the_session() {
        let fx = Fixture::new(&[("f1", "dm"), ("c2", "ctf")]);
        let dm = fx.frontend("f1");
        attach(&dm, 4);
        let state = app_state(&fx);

        let req = CommandRequest {
            command: "map q2dm2".into(),
        };
        send_command(State(state.clone()), Path("dm".into()), Json(req))
            .await
            .unwrap();
        let req = SayRequest {
            text: "restarting".into(),
            level: None,
        };
        say_all(State(state.clone()), Path("dm".into()), Json(req))
            .await
            .unwrap();

        assert_eq!(
            frames(&dm),
            vec![
                ServerFrame::Command {
                    command: "map q2dm2\n".into()
                },
                ServerFrame::SayAll {
                    level: PrintLevel::Chat,
                    text: "restarting\n".into()
                },
            ]
        );

        let req = CommandRequest {
            command: "status".into(),
        };
        assert!(matches!(
            send_command(State(state), Path("ctf".into()), Json(req)).await,
            Err(ApiError::NotConnected(_))
        ));
    }

    #[tokio::test]
    async fn test_rule_added_and_persisted() {
        let fx = Fixture::new(&[("f1", "dm")]);
        let dm = fx.frontend("f1");
        let state = app_state(&fx);

        let def: RuleDef =
            serde_json::from_str(r#"{"kind":"MUTE","name":["^spammer$"],"scope":"server"}"#)
                .unwrap();
        let (status, Json(created)) = add_rule(State(state.clone()), Path("dm".into()), Json(def))
            .await
            .unwrap();
        assert_eq!(status, StatusCode::CREATED);

        {
            let fs = dm.state();
            assert_eq!(fs.rules.len(), 1);
            assert_eq!(fs.rules[0].id(), created.uuid);
            assert_eq!(fs.rules[0].def.scope, Scope::Client);
        }
        let on_disk = std::fs::read_to_string(dm.dir().join("rules")).unwrap();
        assert!(on_disk.contains(&created.uuid));

        let bad: RuleDef = serde_json::from_str(r#"{"kind":"BAN","address":["not-a-net"]}"#).unwrap();
        assert!(matches!(
            add_rule(State(state), Path("dm".into()), Json(bad)).await,
            Err(ApiError::BadRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_user_frontends() {
        let fx = Fixture::new(&[("f1", "dm"), ("c2", "ctf")]);
        let state = app_state(&fx);
        let Json(owned) = user_frontends(State(state.clone()), Path("ops@example.net".into())).await;
        assert_eq!(owned.len(), 2);
        let Json(owned) = user_frontends(State(state), Path("nobody@example.net".into())).await;
        assert!(owned.is_empty());
    }
}
