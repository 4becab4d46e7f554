//! Per-session player slots

use std::collections::HashMap;
use std::net::IpAddr;

use q2cloud_crypto::{md5_hex, random_bytes};
use q2cloud_protocol::{PlayerRecord, parse_userinfo};
use serde::Serialize;

use crate::error::SessionError;

/// Longest stifle a rule may impose, in seconds
pub const STIFLE_MAX: u32 = 300;

const DEFAULT_FOV: u32 = 90;

/// A connected game client.
///
/// Players live in their frontend's slot array and are addressed by slot
/// index, which is also the Quake 2 client number.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Player {
    pub client_id: u8,
    pub name: String,
    pub userinfo: String,
    #[serde(skip)]
    pub userinfo_hash: String,
    #[serde(skip)]
    pub info: HashMap<String, String>,
    pub version: String,
    pub ip: Option<IpAddr>,
    pub port: u16,
    /// PTR record, filled in after connect
    pub hostname: Option<String>,
    pub vpn: bool,
    pub fov: u32,
    pub cookie: String,

    pub frags: u32,
    pub deaths: u32,
    pub suicides: u32,
    pub teleports: u32,
    pub last_teleport: u64,
    pub invites: u32,
    pub last_invite: u64,
    pub invites_available: u32,

    pub stifled: bool,
    pub stifle_length: u32,
    pub muted: bool,
    /// Ids of rules already applied to this player
    pub rules: Vec<String>,

    /// Zero marks an empty slot
    pub connect_time: u64,
}

impl Player {
    pub fn from_record(record: &PlayerRecord, now: u64, invites: u32) -> Self {
        let mut player = Self {
            client_id: record.client_id,
            version: record.version.clone(),
            invites_available: invites,
            connect_time: now.max(1),
            ..Self::default()
        };
        player.set_userinfo(&record.userinfo);
        player
    }

    pub fn is_live(&self) -> bool {
        self.connect_time > 0
    }

    /// Replace the userinfo and everything derived from it.
    ///
    /// Returns false when the new string hashes the same as the old one.
    pub fn set_userinfo(&mut self, userinfo: &str) -> bool {
        let hash = md5_hex(userinfo.as_bytes());
        if hash == self.userinfo_hash {
            return false;
        }

        let info = parse_userinfo(userinfo);
        self.name = info.get("name").cloned().unwrap_or_default();
        self.fov = info
            .get("fov")
            .and_then(|f| f.parse().ok())
            .unwrap_or(DEFAULT_FOV);
        if let Some(cookie) = info.get("cookie").filter(|c| !c.is_empty()) {
            self.cookie = cookie.clone();
        }
        if let Some(ip) = info.get("ip").and_then(|ip| ip.parse().ok()) {
            self.ip = Some(ip);
        }
        if let Some(port) = info.get("port").and_then(|p| p.parse().ok()) {
            self.port = port;
        }

        self.userinfo = userinfo.to_string();
        self.userinfo_hash = hash;
        self.info = info;
        true
    }

    /// Seconds since the player connected
    pub fn play_time(&self, now: u64) -> u64 {
        now.saturating_sub(self.connect_time)
    }
}

/// Fixed-length slot array sized by the frontend's `maxclients`
#[derive(Debug, Clone, Default)]
pub struct PlayerTable {
    slots: Vec<Player>,
}

impl PlayerTable {
    pub fn new(max_players: u8) -> Self {
        Self {
            slots: vec![Player::default(); max_players as usize],
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn slot(&self, id: u8) -> Result<&Player, SessionError> {
        self.slots
            .get(id as usize)
            .ok_or(SessionError::InvalidClient(id))
    }

    pub fn find(&self, id: u8) -> Result<&Player, SessionError> {
        let player = self.slot(id)?;
        if !player.is_live() {
            return Err(SessionError::InvalidClient(id));
        }
        Ok(player)
    }

    pub fn find_mut(&mut self, id: u8) -> Result<&mut Player, SessionError> {
        match self.slots.get_mut(id as usize) {
            Some(player) if player.is_live() => Ok(player),
            _ => Err(SessionError::InvalidClient(id)),
        }
    }

    /// Occupy the player's slot. A player without a cookie is given one,
    /// which is returned so the caller can stuff it to the client.
    pub fn add(&mut self, mut player: Player) -> Result<Option<String>, SessionError> {
        let id = player.client_id;
        self.slot(id)?;

        let mut issued = None;
        if player.cookie.is_empty() {
            let cookie = hex::encode(random_bytes::<8>());
            player.cookie = cookie.clone();
            issued = Some(cookie);
        }

        self.slots[id as usize] = player;
        Ok(issued)
    }

    /// Reset a slot to empty, handing back what was there
    pub fn remove(&mut self, id: u8) -> Result<Player, SessionError> {
        self.slot(id)?;
        Ok(std::mem::take(&mut self.slots[id as usize]))
    }

    /// Every live player called exactly `name`
    pub fn by_name(&self, name: &str) -> Vec<&Player> {
        self.live().filter(|p| p.name == name).collect()
    }

    /// Attribute a `"<name>: <message>"` chat line.
    ///
    /// Both halves may contain `": "`, so the split happens after the
    /// longest live player name that prefixes the line.
    pub fn from_print<'a>(&self, text: &'a str) -> Result<(u8, &'a str), SessionError> {
        self.live()
            .filter(|p| !p.name.is_empty())
            .filter_map(|p| {
                let rest = text.strip_prefix(p.name.as_str())?.strip_prefix(": ")?;
                Some((p.name.len(), p.client_id, rest))
            })
            .max_by_key(|(len, _, _)| *len)
            .map(|(_, id, rest)| (id, rest))
            .ok_or(SessionError::NoSpeaker)
    }

    /// Longest live player name at the start of `text`, with the remainder
    pub fn name_prefix<'a>(&self, text: &'a str) -> Option<(u8, &'a str)> {
        self.live()
            .filter(|p| !p.name.is_empty() && text.starts_with(p.name.as_str()))
            .max_by_key(|p| p.name.len())
            .map(|p| (p.client_id, &text[p.name.len()..]))
    }

    pub fn live(&self) -> impl Iterator<Item = &Player> {
        self.slots.iter().filter(|p| p.is_live())
    }

    pub fn live_mut(&mut self) -> impl Iterator<Item = &mut Player> {
        self.slots.iter_mut().filter(|p| p.is_live())
    }

    pub fn count(&self) -> usize {
        self.live().count()
    }

    pub fn names(&self) -> Vec<String> {
        self.live().map(|p| p.name.clone()).collect()
    }

    pub fn clear(&mut self) {
        for slot in &mut self.slots {
            *slot = Player::default();
        }
    }
}

/// Console command for a single client, executed as if typed
pub fn stuff_command(client_id: u8, command: &str) -> String {
    format!("sv !stuff CL {} {}\n", client_id, command)
}

/// Mute a client for `seconds`, or permanently when `None`
pub fn mute_command(client_id: u8, seconds: Option<u32>) -> String {
    match seconds {
        Some(secs) => format!("sv !mute CL {} {}\n", client_id, secs),
        None => format!("sv !mute CL {} PERM\n", client_id),
    }
}

pub fn kick_command(client_id: u8) -> String {
    format!("kick {}\n", client_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use q2cloud_protocol::format_userinfo;

    fn record(id: u8, name: &str) -> PlayerRecord {
        PlayerRecord {
            client_id: id,
            userinfo: format_userinfo([("name", name), ("ip", "10.1.2.3:27901"), ("fov", "110")]),
            version: "q2pro r1504".into(),
        }
    }

    fn table_with(names: &[&str]) -> PlayerTable {
        let mut table = PlayerTable::new(16);
        for (i, name) in names.iter().enumerate() {
            table
                .add(Player::from_record(&record(i as u8, name), 1000, 3))
                .unwrap();
        }
        table
    }

    #[test]
    fn test_player_from_record() {
        let p = Player::from_record(&record(4, "claire"), 1000, 3);
        assert_eq!(p.name, "claire");
        assert_eq!(p.ip, Some("10.1.2.3".parse().unwrap()));
        assert_eq!(p.port, 27901);
        assert_eq!(p.fov, 110);
        assert_eq!(p.invites_available, 3);
        assert!(p.is_live());
    }

    #[test]
    fn test_userinfo_change_detection() {
        let mut p = Player::from_record(&record(0, "claire"), 1000, 3);
        let same = p.userinfo.clone();
        assert!(!p.set_userinfo(&same));
        assert!(p.set_userinfo("\\name\\claire2\\cookie\\abc"));
        assert_eq!(p.name, "claire2");
        assert_eq!(p.cookie, "abc");
        assert_eq!(p.fov, DEFAULT_FOV);
        // address survives userinfo without ip
        assert_eq!(p.ip, Some("10.1.2.3".parse().unwrap()));
    }

    #[test]
    fn test_find_range_and_liveness() {
        let table = table_with(&["a"]);
        assert!(table.find(0).is_ok());
        assert!(matches!(table.find(1), Err(SessionError::InvalidClient(1))));
        assert!(matches!(table.find(16), Err(SessionError::InvalidClient(16))));
        assert!(matches!(table.find(255), Err(SessionError::InvalidClient(255))));
    }

    #[test]
    fn test_add_issues_cookie_once() {
        let mut table = PlayerTable::new(4);
        let cookie = table
            .add(Player::from_record(&record(1, "a"), 10, 3))
            .unwrap();
        assert!(cookie.is_some());
        assert_eq!(table.find(1).unwrap().cookie, cookie.unwrap());

        let with_cookie = PlayerRecord {
            client_id: 2,
            userinfo: "\\name\\b\\cookie\\deadbeef".into(),
            version: String::new(),
        };
        let issued = table
            .add(Player::from_record(&with_cookie, 10, 3))
            .unwrap();
        assert!(issued.is_none());
    }

    #[test]
    fn test_add_out_of_range() {
        let mut table = PlayerTable::new(2);
        assert!(table.add(Player::from_record(&record(2, "x"), 10, 3)).is_err());
    }

    #[test]
    fn test_remove_then_find_fails_until_connect() {
        let mut table = table_with(&["a", "b"]);
        let removed = table.remove(1).unwrap();
        assert_eq!(removed.name, "b");
        assert!(table.find(1).is_err());
        assert_eq!(table.count(), 1);

        table
            .add(Player::from_record(&record(1, "c"), 20, 3))
            .unwrap();
        assert_eq!(table.find(1).unwrap().name, "c");
    }

    #[test]
    fn test_by_name_duplicates() {
        let table = table_with(&["dup", "other", "dup"]);
        let found: Vec<u8> = table.by_name("dup").iter().map(|p| p.client_id).collect();
        assert_eq!(found, vec![0, 2]);
    }

    #[test]
    fn test_from_print_longest_name() {
        let table = table_with(&["bob", "bob: the", "alice"]);
        let (id, msg) = table.from_print("bob: the: builder: hi").unwrap();
        assert_eq!(id, 1);
        assert_eq!(msg, "builder: hi");

        let (id, msg) = table.from_print("bob: hello").unwrap();
        assert_eq!(id, 0);
        assert_eq!(msg, "hello");
    }

    #[test]
    fn test_from_print_no_speaker() {
        let table = table_with(&["alice"]);
        assert!(matches!(
            table.from_print("mallory: hi"),
            Err(SessionError::NoSpeaker)
        ));
        assert!(table.from_print("alice hi").is_err());
    }

    #[test]
    fn test_command_formats() {
        assert_eq!(mute_command(3, Some(60)), "sv !mute CL 3 60\n");
        assert_eq!(mute_command(3, None), "sv !mute CL 3 PERM\n");
        assert_eq!(kick_command(7), "kick 7\n");
        assert_eq!(
            stuff_command(1, "set cookie abc u"),
            "sv !stuff CL 1 set cookie abc u\n"
        );
    }
}
