//! Upload token storage: env var override, token file, migration from the legacy location.

use std::path::{Path, PathBuf};

use ratted_core::TokenProvider;
use tracing::{debug, info, warn};

pub const TOKEN_ENV: &str = "RATTED_SYSTEMS_TOKEN";
const TOKEN_FILE: &str = "ratted.token";

pub struct TokenStore {
    path: PathBuf,
    legacy_path: Option<PathBuf>,
    env_token: Option<String>,
}

impl TokenStore {
    /// Store under ~/.config/ratted-systems, honouring RATTED_SYSTEMS_TOKEN.
    pub fn from_env() -> Option<Self> {
        let dir = crate::config::config_dir()?;
        let legacy = std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config/ratted.token"));
        Some(Self::new(
            dir.join(TOKEN_FILE),
            legacy,
            std::env::var(TOKEN_ENV).ok(),
        ))
    }

    pub fn new(path: PathBuf, legacy_path: Option<PathBuf>, env_token: Option<String>) -> Self {
        Self {
            path,
            legacy_path,
            env_token,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Env token if non-blank, else the trimmed file contents; blank means absent.
    pub fn get(&self) -> Option<String> {
        self.migrate_legacy();
        if let Some(t) = self.env_token.as_deref().map(str::trim) {
            if !t.is_empty() {
                return Some(t.to_string());
            }
        }
        let contents = std::fs::read_to_string(&self.path).ok()?;
        let t = contents.trim();
        (!t.is_empty()).then(|| t.to_string())
    }

    pub fn set(&self, token: &str) -> std::io::Result<()> {
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        debug!(path = %self.path.display(), "writing token");
        std::fs::write(&self.path, token.trim())
    }

    /// Remove the token file. Absent file is not an error.
    pub fn clear(&self) -> std::io::Result<()> {
        match std::fs::remove_file(&self.path) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }

    fn migrate_legacy(&self) {
        let Some(legacy) = self.legacy_path.as_deref() else {
            return;
        };
        if !legacy.exists() || self.path.exists() {
            return;
        }
        warn!(path = %legacy.display(), "old token file found, migrating to new location");
        let moved = std::fs::read_to_string(legacy)
            .and_then(|t| self.set(&t))
            .and_then(|_| std::fs::remove_file(legacy));
        match moved {
            Ok(()) => info!(path = %self.path.display(), "token migrated"),
            Err(e) => warn!(error = %e, "failed to migrate old token"),
        }
    }
}

impl TokenProvider for TokenStore {
    fn token(&self) -> Option<String> {
        self.get()
    }
}
