//! Operator roster

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub email: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub admin: bool,
}

#[derive(Debug, Default, Deserialize)]
struct UserFile {
    #[serde(default)]
    user: Vec<User>,
}

/// Parse a `[[user]]` TOML roster
pub fn parse_users(content: &str) -> Result<Vec<User>> {
    let file: UserFile = toml::from_str(content)?;
    Ok(file.user)
}

pub fn load_users(path: impl AsRef<Path>) -> Result<Vec<User>> {
    let path = path.as_ref();
    let content =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    parse_users(&content).with_context(|| format!("parsing {}", path.display()))
}

pub fn find_user<'a>(users: &'a [User], email: &str) -> Option<&'a User> {
    users.iter().find(|u| u.email.eq_ignore_ascii_case(email))
}
