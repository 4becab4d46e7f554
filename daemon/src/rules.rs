//! Rule engine
//!
//! Rules are loaded from TOML, compiled once (CIDRs parsed, regexes built
//! case-insensitive) and then matched against player snapshots. Matching is
//! pure; enforcement turns a matched rule into frames for the frontend.

use std::net::IpAddr;
use std::path::Path;

use ipnet::IpNet;
use q2cloud_protocol::{PrintLevel, ServerFrame};
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::players::{Player, STIFLE_MAX, kick_command, mute_command};

#[derive(Error, Debug)]
pub enum RuleError {
    #[error("Invalid CIDR {0:?}")]
    InvalidCidr(String),

    #[error("Invalid regex: {0}")]
    InvalidRegex(#[from] regex::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Declaration order is application order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RuleKind {
    #[serde(alias = "ban")]
    Ban,
    #[serde(alias = "mute")]
    Mute,
    #[serde(alias = "stifle")]
    Stifle,
    #[serde(alias = "message")]
    Message,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    #[default]
    Client,
    Server,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserinfoPattern {
    pub property: String,
    pub value: String,
}

/// Play-time threshold and absolute window; zero fields are unset
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeSpec {
    /// Seconds the player must have been connected
    pub play_time: u64,
    /// Unix time the rule starts applying
    pub after: u64,
    /// Unix time the rule stops applying
    pub before: u64,
}

impl TimeSpec {
    pub fn is_empty(&self) -> bool {
        self.play_time == 0 && self.after == 0 && self.before == 0
    }

    pub fn satisfied(&self, play_time: u64, now: u64) -> bool {
        play_time >= self.play_time
            && (self.after == 0 || now >= self.after)
            && (self.before == 0 || now < self.before)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExceptionDef {
    pub address: Vec<String>,
    pub hostname: Vec<String>,
    pub name: Vec<String>,
    pub userinfo: Vec<UserinfoPattern>,
    pub expiration: u64,
}

/// A rule as written on disk or posted to the management API
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleDef {
    #[serde(default)]
    pub uuid: String,
    pub kind: RuleKind,
    #[serde(default)]
    pub scope: Scope,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub address: Vec<String>,
    #[serde(default)]
    pub hostname: Vec<String>,
    #[serde(default)]
    pub name: Vec<String>,
    #[serde(default)]
    pub userinfo: Vec<UserinfoPattern>,
    #[serde(default)]
    pub vpn: bool,
    #[serde(default)]
    pub message: Vec<String>,
    #[serde(default)]
    pub created: u64,
    #[serde(default)]
    pub expiration: u64,
    /// Milliseconds to wait before applying
    #[serde(default)]
    pub delay: u64,
    /// Mute or stifle duration in seconds; zero mutes permanently
    #[serde(default, alias = "stifle_length", alias = "mute_length")]
    pub length: u32,
    #[serde(default)]
    pub time_spec: TimeSpec,
    #[serde(default)]
    pub exception: Vec<ExceptionDef>,
    /// Recorded during a session only; never written back to disk
    #[serde(skip)]
    pub transient: bool,
}

/// Compiled predicate families shared by rules and exceptions
#[derive(Debug, Clone, Default)]
struct Matcher {
    addresses: Vec<IpNet>,
    hostnames: Vec<Regex>,
    names: Vec<Regex>,
    userinfo: Vec<(String, Regex)>,
}

fn parse_net(s: &str) -> Result<IpNet, RuleError> {
    s.parse::<IpNet>()
        .or_else(|_| s.parse::<IpAddr>().map(IpNet::from))
        .map_err(|_| RuleError::InvalidCidr(s.to_string()))
}

fn parse_regex(s: &str) -> Result<Regex, RuleError> {
    Ok(RegexBuilder::new(s).case_insensitive(true).build()?)
}

impl Matcher {
    fn compile(
        address: &[String],
        hostname: &[String],
        name: &[String],
        userinfo: &[UserinfoPattern],
    ) -> Result<Self, RuleError> {
        Ok(Self {
            addresses: address.iter().map(|a| parse_net(a)).collect::<Result<_, _>>()?,
            hostnames: hostname.iter().map(|h| parse_regex(h)).collect::<Result<_, _>>()?,
            names: name.iter().map(|n| parse_regex(n)).collect::<Result<_, _>>()?,
            userinfo: userinfo
                .iter()
                .map(|u| Ok((u.property.clone(), parse_regex(&u.value)?)))
                .collect::<Result<_, RuleError>>()?,
        })
    }

    fn declared(&self) -> bool {
        !self.addresses.is_empty()
            || !self.hostnames.is_empty()
            || !self.names.is_empty()
            || !self.userinfo.is_empty()
    }

    /// Every declared family must match; undeclared families are ignored
    fn matches(&self, player: &Player) -> bool {
        if !self.addresses.is_empty() {
            let Some(ip) = player.ip else {
                return false;
            };
            if !self.addresses.iter().any(|net| net.contains(&ip)) {
                return false;
            }
        }

        if !self.hostnames.is_empty() {
            let Some(host) = player.hostname.as_deref() else {
                return false;
            };
            if !self.hostnames.iter().any(|re| re.is_match(host)) {
                return false;
            }
        }

        if !self.names.is_empty() && !self.names.iter().any(|re| re.is_match(&player.name)) {
            return false;
        }

        self.userinfo.iter().all(|(property, re)| {
            player
                .info
                .get(property)
                .is_some_and(|value| re.is_match(value))
        })
    }
}

#[derive(Debug, Clone)]
struct Exception {
    matcher: Matcher,
    expiration: u64,
}

/// A compiled rule
#[derive(Debug, Clone)]
pub struct Rule {
    pub def: RuleDef,
    matcher: Matcher,
    exceptions: Vec<Exception>,
}

impl Rule {
    pub fn compile(mut def: RuleDef) -> Result<Self, RuleError> {
        if def.uuid.is_empty() {
            def.uuid = uuid::Uuid::new_v4().to_string();
        }
        let matcher = Matcher::compile(&def.address, &def.hostname, &def.name, &def.userinfo)?;
        let exceptions = def
            .exception
            .iter()
            .map(|e| {
                Ok(Exception {
                    matcher: Matcher::compile(&e.address, &e.hostname, &e.name, &e.userinfo)?,
                    expiration: e.expiration,
                })
            })
            .collect::<Result<_, RuleError>>()?;

        Ok(Self {
            def,
            matcher,
            exceptions,
        })
    }

    pub fn id(&self) -> &str {
        &self.def.uuid
    }

    pub fn kind(&self) -> RuleKind {
        self.def.kind
    }

    pub fn is_timed(&self) -> bool {
        !self.def.time_spec.is_empty()
    }

    pub fn is_expired(&self, now: u64) -> bool {
        self.def.expiration != 0 && self.def.expiration <= now
    }

    /// Whether this rule applies to `player` at `now`.
    ///
    /// A rule that declares no predicate at all matches nobody.
    pub fn matches(&self, player: &Player, now: u64) -> bool {
        if self.is_expired(now) {
            return false;
        }
        if !self.matcher.declared() && !self.def.vpn && !self.is_timed() {
            return false;
        }
        if !self.matcher.matches(player) {
            return false;
        }
        if self.def.vpn && !player.vpn {
            return false;
        }
        if !self
            .def
            .time_spec
            .satisfied(player.play_time(now), now)
        {
            return false;
        }

        !self.exceptions.iter().any(|e| {
            (e.expiration == 0 || e.expiration > now)
                && e.matcher.declared()
                && e.matcher.matches(player)
        })
    }

    /// Frames that carry out this rule against `player`, updating the
    /// player's mute and stifle state as a side effect.
    pub fn enforce(&self, player: &mut Player) -> Vec<ServerFrame> {
        let id = player.client_id;
        let first_message = self.def.message.first();
        let mut frames = Vec::new();

        let say = |level: PrintLevel, text: &str| ServerFrame::SayClient {
            client_id: id,
            level,
            text: format!("{}\n", text.trim_end_matches('\n')),
        };

        match self.def.kind {
            RuleKind::Ban => {
                if let Some(msg) = first_message {
                    frames.push(say(PrintLevel::High, msg));
                }
                frames.push(ServerFrame::Command {
                    command: kick_command(id),
                });
            }
            RuleKind::Mute => {
                if let Some(msg) = first_message {
                    frames.push(say(PrintLevel::High, msg));
                }
                let secs = (self.def.length > 0).then_some(self.def.length);
                frames.push(ServerFrame::Command {
                    command: mute_command(id, secs),
                });
                player.muted = true;
            }
            RuleKind::Stifle => {
                if let Some(msg) = first_message {
                    frames.push(say(PrintLevel::High, msg));
                }
                player.stifled = true;
                player.stifle_length = match self.def.length {
                    0 => STIFLE_MAX,
                    len => len.min(STIFLE_MAX),
                };
            }
            RuleKind::Message => {
                for msg in &self.def.message {
                    frames.push(say(PrintLevel::Medium, msg));
                }
            }
        }

        if !player.rules.iter().any(|r| r == &self.def.uuid) {
            player.rules.push(self.def.uuid.clone());
        }
        frames
    }

    /// Session-only mute pinned to the player's address, so the mute holds
    /// when the player changes name
    pub fn pinned_mute(&self, player: &Player, now: u64) -> Option<Rule> {
        if self.def.kind != RuleKind::Mute || self.def.transient {
            return None;
        }

        let (address, name) = match player.ip {
            Some(ip) => (vec![ip.to_string()], Vec::new()),
            None => (Vec::new(), vec![format!("^{}$", regex::escape(&player.name))]),
        };
        let def = RuleDef {
            uuid: format!("{}-{}", self.def.uuid, player.client_id),
            kind: RuleKind::Mute,
            scope: Scope::Client,
            description: format!("session mute from {}", self.def.uuid),
            address,
            hostname: Vec::new(),
            name,
            userinfo: Vec::new(),
            vpn: false,
            message: Vec::new(),
            created: now,
            expiration: match self.def.length {
                0 => 0,
                secs => now + u64::from(secs),
            },
            delay: 0,
            length: self.def.length,
            time_spec: TimeSpec::default(),
            exception: Vec::new(),
            transient: true,
        };
        Rule::compile(def).ok()
    }
}

/// Every rule matching `player`, in application order.
///
/// The sort is stable by kind; a ban makes everything after it moot, so
/// only the first ban is returned when one matches.
pub fn evaluate<'a>(
    rules: impl IntoIterator<Item = &'a Rule>,
    player: &Player,
    now: u64,
) -> Vec<&'a Rule> {
    let mut hits: Vec<&Rule> = rules
        .into_iter()
        .filter(|r| r.matches(player, now))
        .collect();
    hits.sort_by_key(|r| r.kind());
    if hits.first().is_some_and(|r| r.kind() == RuleKind::Ban) {
        hits.truncate(1);
    }
    hits
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RuleFile {
    #[serde(default)]
    rule: Vec<RuleDef>,
}

/// Parse a `[[rule]]` TOML document, tagging every rule with `scope`
pub fn parse_rules(content: &str, scope: Scope) -> Result<Vec<Rule>, RuleError> {
    let file: RuleFile = toml::from_str(content)?;
    file.rule
        .into_iter()
        .map(|mut def| {
            def.scope = scope;
            Rule::compile(def)
        })
        .collect()
}

pub fn load_rules(path: impl AsRef<Path>, scope: Scope) -> Result<Vec<Rule>, RuleError> {
    let content = std::fs::read_to_string(path)?;
    parse_rules(&content, scope)
}

/// Write the persistent rules back, replacing the file atomically
pub fn save_rules(path: impl AsRef<Path>, rules: &[Rule]) -> Result<(), RuleError> {
    let path = path.as_ref();
    let file = RuleFile {
        rule: rules
            .iter()
            .filter(|r| !r.def.transient)
            .map(|r| r.def.clone())
            .collect(),
    };
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, toml::to_string(&file)?)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}
