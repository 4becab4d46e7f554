//! On-disk frontend catalog
//!
//! One subdirectory of the client directory per frontend, holding
//! `settings`, `key`, optional `rules` and the append-only `log`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::InviteConfig;
use crate::frontend::{Frontend, FrontendSettings, InviteBucket, RULES_FILE, SETTINGS_FILE};
use crate::rules::{Scope, load_rules};

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Unknown frontend {0:?}")]
    UnknownFrontend(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error in {path}: {message}")]
    Parse { path: PathBuf, message: String },
}

/// Process-wide set of frontends, append-only while running
#[derive(Debug)]
pub struct Registry {
    root: PathBuf,
    frontends: RwLock<Vec<Arc<Frontend>>>,
}

impl Registry {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            frontends: RwLock::new(Vec::new()),
        }
    }

    /// Scan `root`, skipping disabled frontends, sorted by name
    pub fn load(
        root: impl Into<PathBuf>,
        invite: &InviteConfig,
        now: u64,
    ) -> Result<Self, RegistryError> {
        let registry = Self::new(root);
        let mut found = Vec::new();

        for entry in std::fs::read_dir(&registry.root)? {
            let dir = entry?.path();
            if !dir.is_dir() {
                continue;
            }
            if let Some(frontend) = load_frontend(&dir, invite, now)? {
                found.push(Arc::new(frontend));
            }
        }

        found.sort_by_key(|f| f.name().to_lowercase());
        for f in &found {
            info!("Frontend {} ({}) owned by {}", f.name(), f.uuid(), f.settings().owner);
        }
        *registry.frontends.write() = found;
        Ok(registry)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn insert(&self, frontend: Arc<Frontend>) {
        let mut frontends = self.frontends.write();
        frontends.push(frontend);
        frontends.sort_by_key(|f| f.name().to_lowercase());
    }

    pub fn find_by_id(&self, uuid: &str) -> Result<Arc<Frontend>, RegistryError> {
        self.frontends
            .read()
            .iter()
            .find(|f| f.uuid() == uuid)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownFrontend(uuid.to_string()))
    }

    /// Names are matched case-insensitively
    pub fn find_by_name(&self, name: &str) -> Result<Arc<Frontend>, RegistryError> {
        self.frontends
            .read()
            .iter()
            .find(|f| f.name().eq_ignore_ascii_case(name))
            .cloned()
            .ok_or_else(|| RegistryError::UnknownFrontend(name.to_string()))
    }

    pub fn by_owner(&self, email: &str) -> Vec<Arc<Frontend>> {
        self.frontends
            .read()
            .iter()
            .filter(|f| f.settings().owner.eq_ignore_ascii_case(email))
            .cloned()
            .collect()
    }

    pub fn all(&self) -> Vec<Arc<Frontend>> {
        self.frontends.read().clone()
    }

    /// Frontends with a trusted session attached
    pub fn trusted(&self) -> Vec<Arc<Frontend>> {
        self.all().into_iter().filter(|f| f.is_trusted()).collect()
    }

    pub fn len(&self) -> usize {
        self.frontends.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rewrite every frontend's `settings` file atomically
    pub fn materialize(&self) -> Result<(), RegistryError> {
        for frontend in self.all() {
            write_settings(frontend.dir(), &frontend.settings())?;
        }
        debug!("Materialized {} frontends", self.len());
        Ok(())
    }
}

fn load_frontend(
    dir: &Path,
    invite: &InviteConfig,
    now: u64,
) -> Result<Option<Frontend>, RegistryError> {
    let settings_path = dir.join(SETTINGS_FILE);
    if !settings_path.exists() {
        debug!("Skipping {}: no settings", dir.display());
        return Ok(None);
    }

    let content = std::fs::read_to_string(&settings_path)?;
    let settings: FrontendSettings = toml::from_str(&content).map_err(|e| RegistryError::Parse {
        path: settings_path.clone(),
        message: e.to_string(),
    })?;
    if settings.disabled {
        info!("Frontend {} disabled, skipping", settings.name);
        return Ok(None);
    }

    let rules_path = dir.join(RULES_FILE);
    let rules = if rules_path.exists() {
        load_rules(&rules_path, Scope::Client).map_err(|e| RegistryError::Parse {
            path: rules_path.clone(),
            message: e.to_string(),
        })?
    } else {
        Vec::new()
    };

    Ok(Some(Frontend::new(
        dir,
        settings,
        rules,
        InviteBucket::new(invite, now),
    )))
}

pub fn write_settings(dir: &Path, settings: &FrontendSettings) -> Result<(), RegistryError> {
    let path = dir.join(SETTINGS_FILE);
    let content = toml::to_string(settings).map_err(|e| RegistryError::Parse {
        path: path.clone(),
        message: e.to_string(),
    })?;
    let tmp = dir.join(format!("{}.tmp", SETTINGS_FILE));
    std::fs::write(&tmp, content)?;
    std::fs::rename(&tmp, &path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn add(root: &Path, dir: &str, body: &str) {
        let path = root.join(dir);
        std::fs::create_dir_all(&path).unwrap();
        std::fs::write(path.join(SETTINGS_FILE), body).unwrap();
    }

    fn sample() -> tempfile::TempDir {
        let root = tempfile::tempdir().unwrap();
        add(
            root.path(),
            "ctf",
            "uuid = \"c2\"\nname = \"ctf\"\nowner = \"ops@example.net\"\n",
        );
        add(
            root.path(),
            "dm",
            "uuid = \"f1\"\nname = \"DM\"\nowner = \"Ops@Example.net\"\nallow_teleport = true\n",
        );
        add(
            root.path(),
            "old",
            "uuid = \"x9\"\nname = \"old\"\ndisabled = true\n",
        );
        std::fs::create_dir_all(root.path().join("empty")).unwrap();
        root
    }

    #[test]
    fn test_load_skips_disabled_and_sorts() {
        let root = sample();
        let registry = Registry::load(root.path(), &InviteConfig::default(), 0).unwrap();
        let names: Vec<String> = registry.all().iter().map(|f| f.name()).collect();
        assert_eq!(names, vec!["ctf", "DM"]);
        assert!(registry.find_by_id("x9").is_err());
    }

    #[test]
    fn test_lookups() {
        let root = sample();
        let registry = Registry::load(root.path(), &InviteConfig::default(), 0).unwrap();

        assert_eq!(registry.find_by_id("f1").unwrap().name(), "DM");
        assert_eq!(registry.find_by_name("dm").unwrap().uuid(), "f1");
        assert!(matches!(
            registry.find_by_name("nope"),
            Err(RegistryError::UnknownFrontend(_))
        ));
        assert_eq!(registry.by_owner("ops@example.net").len(), 2);
        assert!(registry.by_owner("someone@else").is_empty());
        assert!(registry.trusted().is_empty());
    }

    #[test]
    fn test_frontend_rules_loaded() {
        let root = sample();
        std::fs::write(
            root.path().join("dm").join(RULES_FILE),
            "[[rule]]\nkind = \"MESSAGE\"\nname = [\"x\"]\nmessage = [\"hi\"]\n",
        )
        .unwrap();
        let registry = Registry::load(root.path(), &InviteConfig::default(), 0).unwrap();
        let dm = registry.find_by_id("f1").unwrap();
        assert_eq!(dm.state().rules.len(), 1);
    }

    #[test]
    fn test_bad_settings_is_error() {
        let root = sample();
        add(root.path(), "broken", "name = [");
        assert!(matches!(
            Registry::load(root.path(), &InviteConfig::default(), 0),
            Err(RegistryError::Parse { .. })
        ));
    }

    #[test]
    fn test_materialize_roundtrip() {
        let root = sample();
        let registry = Registry::load(root.path(), &InviteConfig::default(), 0).unwrap();
        registry
            .find_by_id("c2")
            .unwrap()
            .update_settings(|s| s.last_seen = 1_234);
        registry.materialize().unwrap();

        let reloaded = Registry::load(root.path(), &InviteConfig::default(), 0).unwrap();
        assert_eq!(reloaded.find_by_id("c2").unwrap().settings().last_seen, 1_234);
        assert!(!root.path().join("ctf").join("settings.tmp").exists());
    }
}
