//! Player records and userinfo strings

use std::collections::HashMap;

use crate::frame::{MessageReader, MessageWriter, ProtocolError};

/// A player as announced by `Connect` and `PlayerList`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerRecord {
    pub client_id: u8,
    pub userinfo: String,
    pub version: String,
}

impl PlayerRecord {
    pub fn decode(r: &mut MessageReader) -> Result<Self, ProtocolError> {
        Ok(Self {
            client_id: r.read_byte()?,
            userinfo: r.read_string()?,
            version: r.read_string()?,
        })
    }

    pub fn encode(&self, w: &mut MessageWriter) {
        w.write_byte(self.client_id);
        w.write_string(&self.userinfo);
        w.write_string(&self.version);
    }
}

/// Parse a `\key\value\key\value` userinfo string.
///
/// Empty keys are dropped, a trailing key without a value maps to an empty
/// string, and an `ip` of the form `addr:port` is split into `ip` and `port`.
pub fn parse_userinfo(info: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    let mut parts = info.strip_prefix('\\').unwrap_or(info).split('\\');

    while let Some(key) = parts.next() {
        let value = parts.next().unwrap_or("");
        if key.is_empty() {
            continue;
        }

        if key == "ip" {
            if let Some((addr, port)) = split_ip_port(value) {
                map.insert("ip".to_string(), addr.to_string());
                map.insert("port".to_string(), port.to_string());
                continue;
            }
        }
        map.insert(key.to_string(), value.to_string());
    }

    map
}

/// Split `a.b.c.d:port` (or `[v6]:port`) into its halves
fn split_ip_port(value: &str) -> Option<(&str, &str)> {
    if let Some(rest) = value.strip_prefix('[') {
        let (addr, tail) = rest.split_once(']')?;
        let port = tail.strip_prefix(':')?;
        return Some((addr, port));
    }
    // a bare v6 address has more than one colon and no port
    if value.matches(':').count() != 1 {
        return None;
    }
    value.split_once(':')
}

/// Rebuild a userinfo string from its parts (used for simulated frontends)
pub fn format_userinfo<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> String {
    let mut out = String::new();
    for (k, v) in pairs {
        out.push('\\');
        out.push_str(k);
        out.push('\\');
        out.push_str(v);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pairs() {
        let map = parse_userinfo("\\k1\\v1\\k2\\v2");
        assert_eq!(map.get("k1").map(String::as_str), Some("v1"));
        assert_eq!(map.get("k2").map(String::as_str), Some("v2"));
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn test_parse_without_leading_slash() {
        let map = parse_userinfo("name\\claire\\skin\\female/athena");
        assert_eq!(map["name"], "claire");
        assert_eq!(map["skin"], "female/athena");
    }

    #[test]
    fn test_ip_splits_into_port() {
        let map = parse_userinfo("\\name\\bob\\ip\\192.168.1.20:27901");
        assert_eq!(map["ip"], "192.168.1.20");
        assert_eq!(map["port"], "27901");
    }

    #[test]
    fn test_ip_v6_with_port() {
        let map = parse_userinfo("\\ip\\[2001:db8::1]:27910");
        assert_eq!(map["ip"], "2001:db8::1");
        assert_eq!(map["port"], "27910");
    }

    #[test]
    fn test_ip_without_port_kept() {
        let map = parse_userinfo("\\ip\\loopback");
        assert_eq!(map["ip"], "loopback");
        assert!(!map.contains_key("port"));
    }

    #[test]
    fn test_empty_key_and_dangling_value() {
        let map = parse_userinfo("\\\\x\\name\\a\\fov");
        assert!(!map.contains_key(""));
        assert_eq!(map["name"], "a");
        assert_eq!(map["fov"], "");
    }

    #[test]
    fn test_format_then_parse() {
        let info = format_userinfo([("name", "spammer"), ("ip", "10.1.2.3:27901")]);
        assert_eq!(info, "\\name\\spammer\\ip\\10.1.2.3:27901");
        let map = parse_userinfo(&info);
        assert_eq!(map["ip"], "10.1.2.3");
    }
}
