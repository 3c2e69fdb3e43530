//! Load config from file and environment.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use ratted_core::protocol::DEFAULT_DOMAIN;
use ratted_core::EndpointConfig;
use serde::Deserialize;

/// CLI configuration. File: ~/.config/ratted-systems/config.toml.
/// Env overrides: RATTED_DOMAIN, RATTED_UPLOAD_METHOD, RATTED_SOLVER_THREADS.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Upload host (default ratted.systems).
    #[serde(default = "default_domain")]
    pub domain: String,
    /// How files are uploaded when `--method` is not given.
    #[serde(default)]
    pub upload_method: UploadMethod,
    /// Proof-of-work threads; 0 uses every available core.
    #[serde(default)]
    pub solver_threads: usize,
}

fn default_domain() -> String {
    DEFAULT_DOMAIN.to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            domain: default_domain(),
            upload_method: UploadMethod::default(),
            solver_threads: 0,
        }
    }
}

impl Config {
    pub fn endpoint(&self) -> EndpointConfig {
        EndpointConfig::new(self.domain.clone())
    }

    pub fn solver_workers(&self) -> usize {
        if self.solver_threads == 0 {
            ratted_core::pow::default_workers()
        } else {
            self.solver_threads
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum UploadMethod {
    /// Socket for files over 100 MB, POST otherwise.
    #[default]
    Auto,
    Post,
    Socket,
}

impl FromStr for UploadMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(UploadMethod::Auto),
            "post" => Ok(UploadMethod::Post),
            "socket" => Ok(UploadMethod::Socket),
            other => Err(format!("unknown upload method: {other}")),
        }
    }
}

/// Directory holding config and token: ~/.config/ratted-systems.
pub fn config_dir() -> Option<PathBuf> {
    std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config/ratted-systems"))
}

/// Defaults, overlaid by config.toml, overlaid by RATTED_* env vars.
pub fn load() -> Config {
    let file = config_dir().map(|d| d.join("config.toml"));
    let c = file
        .as_deref()
        .and_then(load_file)
        .unwrap_or_default();
    apply_env(c, |key| std::env::var(key).ok())
}

fn load_file(path: &Path) -> Option<Config> {
    let s = std::fs::read_to_string(path).ok()?;
    match toml::from_str::<Config>(&s) {
        Ok(c) => Some(c),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "ignoring unparsable config file");
            None
        }
    }
}

fn apply_env(mut c: Config, var: impl Fn(&str) -> Option<String>) -> Config {
    if let Some(s) = var("RATTED_DOMAIN") {
        if !s.trim().is_empty() {
            c.domain = s.trim().to_string();
        }
    }
    if let Some(s) = var("RATTED_UPLOAD_METHOD") {
        if let Ok(m) = s.parse() {
            c.upload_method = m;
        }
    }
    if let Some(s) = var("RATTED_SOLVER_THREADS") {
        if let Ok(n) = s.trim().parse::<usize>() {
            c.solver_threads = n;
        }
    }
    c
}
