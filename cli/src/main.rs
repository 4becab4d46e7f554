//! q2cloud control CLI
//!
//! Thin client for the daemon's management API.

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use reqwest::{Client, RequestBuilder, Response};
use serde::Deserialize;
use serde_json::json;
use tabled::{Table, Tabled};

#[derive(Parser, Debug)]
#[command(name = "q2cloudctl")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(long, default_value = "http://127.0.0.1:9989", env = "Q2CLOUD_API")]
    api: String,

    /// Bearer secret configured in `[api]`
    #[arg(long, env = "Q2CLOUD_TOKEN", hide_env_values = true)]
    token: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Daemon liveness
    Health,
    /// List every frontend
    Frontends,
    /// Frontends owned by one operator
    Owned { email: String },
    /// Players on a frontend
    Players { frontend: String },
    /// Run a console command on a frontend
    Command {
        frontend: String,
        #[arg(trailing_var_arg = true, required = true)]
        command: Vec<String>,
    },
    /// Print a message to everyone on a frontend
    Say {
        frontend: String,
        #[arg(long)]
        level: Option<u8>,
        #[arg(trailing_var_arg = true, required = true)]
        text: Vec<String>,
    },
    /// Add a rule to a frontend from a TOML file holding one rule table
    Rule { frontend: String, file: PathBuf },
    /// Follow a frontend's audit log
    Log { frontend: String },
    /// Search the player history
    History { query: String },
}

#[derive(Debug, Deserialize, Tabled)]
struct FrontendRow {
    name: String,
    owner: String,
    trusted: bool,
    map: String,
    players: usize,
    max_players: u8,
    teleport_count: u32,
}

#[derive(Debug, Deserialize, Tabled)]
struct PlayerRow {
    client_id: u8,
    name: String,
    #[tabled(display_with = "display_ip")]
    ip: Option<String>,
    #[tabled(display_with = "display_ip")]
    hostname: Option<String>,
    frags: u32,
    deaths: u32,
}

#[derive(Debug, Deserialize, Tabled)]
struct HistoryRow {
    time: u64,
    frontend: String,
    name: String,
    #[tabled(display_with = "display_ip")]
    ip: Option<String>,
    cookie: String,
}

fn display_ip(value: &Option<String>) -> String {
    value.clone().unwrap_or_else(|| "-".into())
}

struct Api {
    client: Client,
    base: String,
    token: Option<String>,
}

impl Api {
    fn request(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    fn get(&self, path: &str) -> RequestBuilder {
        self.request(self.client.get(format!("{}{}", self.base, path)))
    }

    fn post(&self, path: &str) -> RequestBuilder {
        self.request(self.client.post(format!("{}{}", self.base, path)))
    }
}

async fn check(resp: Response) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    let message = serde_json::from_str::<serde_json::Value>(&body)
        .ok()
        .and_then(|v| v["error"].as_str().map(str::to_string))
        .unwrap_or(body);
    bail!("{}: {}", status, message)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let api = Api {
        client: Client::new(),
        base: args.api.trim_end_matches('/').to_string(),
        token: args.token,
    };

    match args.command {
        Commands::Health => {
            let resp = check(api.get("/health").send().await?).await?;
            let health: serde_json::Value = resp.json().await?;
            println!("{}", serde_json::to_string_pretty(&health)?);
        }
        Commands::Frontends => {
            let resp = check(api.get("/api/frontends").send().await?).await?;
            let rows: Vec<FrontendRow> = resp.json().await?;
            println!("{}", Table::new(rows));
        }
        Commands::Owned { email } => {
            let resp = check(api.get(&format!("/api/users/{}/frontends", email)).send().await?).await?;
            let rows: Vec<FrontendRow> = resp.json().await?;
            println!("{}", Table::new(rows));
        }
        Commands::Players { frontend } => {
            let resp = check(api.get(&format!("/api/frontends/{}/players", frontend)).send().await?)
                .await?;
            let rows: Vec<PlayerRow> = resp.json().await?;
            println!("{}", Table::new(rows));
        }
        Commands::Command { frontend, command } => {
            let body = json!({ "command": command.join(" ") });
            check(
                api.post(&format!("/api/frontends/{}/command", frontend))
                    .json(&body)
                    .send()
                    .await?,
            )
            .await?;
            println!("Command queued");
        }
        Commands::Say {
            frontend,
            level,
            text,
        } => {
            let body = json!({ "text": text.join(" "), "level": level });
            check(
                api.post(&format!("/api/frontends/{}/say", frontend))
                    .json(&body)
                    .send()
                    .await?,
            )
            .await?;
            println!("Message queued");
        }
        Commands::Rule { frontend, file } => {
            let content = std::fs::read_to_string(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            let rule: toml::Value =
                toml::from_str(&content).with_context(|| format!("parsing {}", file.display()))?;
            let resp = check(
                api.post(&format!("/api/frontends/{}/rules", frontend))
                    .json(&rule)
                    .send()
                    .await?,
            )
            .await?;
            let created: serde_json::Value = resp.json().await?;
            println!("Rule {} added", created["uuid"].as_str().unwrap_or("?"));
        }
        Commands::Log { frontend } => {
            let mut resp =
                check(api.get(&format!("/api/frontends/{}/log", frontend)).send().await?).await?;
            let mut pending = String::new();
            while let Some(chunk) = resp.chunk().await? {
                pending.push_str(&String::from_utf8_lossy(&chunk));
                while let Some(end) = pending.find('\n') {
                    let line: String = pending.drain(..=end).collect();
                    if let Some(data) = line.trim_end().strip_prefix("data:") {
                        println!("{}", data.trim_start());
                    }
                }
            }
        }
        Commands::History { query } => {
            let resp = check(api.get("/api/history").query(&[("q", &query)]).send().await?).await?;
            let rows: Vec<HistoryRow> = resp.json().await?;
            println!("{}", Table::new(rows));
        }
    }

    Ok(())
}
