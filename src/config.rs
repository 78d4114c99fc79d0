//! # Config — Layered Worker Configuration
//!
//! Settings come from three layers, later layers winning:
//!
//! 1. An optional TOML file (`--config crowdmap.toml`)
//! 2. `.env.{environment}` then `.env`, loaded into the process environment
//!    by `dotenvy` (variables already set are never overwritten)
//! 3. Process environment variables
//!
//! | Variable | TOML key | Required |
//! |----------|----------|----------|
//! | `DATABASE_URL` | `database.url` | yes |
//! | `DATABASE_MAX_CONNECTIONS` | `database.max_connections` | no (5) |
//! | `LIVE_STORE_URL` | `live_store.url` | yes |
//! | `LIVE_STORE_AUTH_TOKEN` | `live_store.auth_token` | no |
//! | `LIVE_STORE_ROOT` | `live_store.root` | no (`v2`) |
//! | `LIVE_STORE_TIMEOUT_SECS` | `live_store.timeout_secs` | no (60) |
//! | `TILESERVER_<NAME>_API_KEY` | `tileservers.<name>` | per tile server |
//! | `SYNC_WORKERS` | `sync.workers` | no (1) |
//!
//! Missing required values are reported together as one
//! [`Error::Configuration`] at startup.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use crate::error::{Error, Result};

pub const DEFAULT_LIVE_STORE_ROOT: &str = "v2";
pub const DEFAULT_MAX_CONNECTIONS: u32 = 5;
pub const DEFAULT_TIMEOUT_SECS: u64 = 60;

const TILESERVER_PREFIX: &str = "TILESERVER_";
const TILESERVER_SUFFIX: &str = "_API_KEY";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum Environment {
    Production,
    #[default]
    Development,
}

impl Environment {
    pub fn as_str(self) -> &'static str {
        match self {
            Environment::Production => "production",
            Environment::Development => "development",
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── TOML file ───────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub database: DatabaseSection,
    pub live_store: LiveStoreSection,
    /// Tile-server name → API key.
    pub tileservers: BTreeMap<String, String>,
    pub sync: SyncSection,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DatabaseSection {
    pub url: Option<String>,
    pub max_connections: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LiveStoreSection {
    pub url: Option<String>,
    pub auth_token: Option<String>,
    pub root: Option<String>,
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyncSection {
    pub workers: Option<usize>,
}

impl FileConfig {
    pub fn parse(source: &str) -> Result<Self> {
        toml::from_str(source).map_err(|e| Error::Configuration(format!("invalid config file: {}", e)))
    }

    pub fn read(path: &Path) -> Result<Self> {
        let source = std::fs::read_to_string(path)
            .map_err(|e| Error::Configuration(format!("cannot read {}: {}", path.display(), e)))?;
        Self::parse(&source)
    }
}

// ── Resolved configuration ──────────────────────────────────────

#[derive(Clone)]
pub struct Config {
    pub environment: Environment,
    pub database_url: String,
    pub database_max_connections: u32,
    pub live_store_url: String,
    pub live_store_root: String,
    pub live_store_auth_token: Option<String>,
    pub live_store_timeout: Duration,
    /// Lower-case tile-server name → API key.
    pub tileserver_keys: BTreeMap<String, String>,
    pub sync_workers: usize,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("environment", &self.environment)
            .field("database_url", &"<redacted>")
            .field("database_max_connections", &self.database_max_connections)
            .field("live_store_url", &self.live_store_url)
            .field("live_store_root", &self.live_store_root)
            .field("live_store_auth_token", &self.live_store_auth_token.as_ref().map(|_| "<redacted>"))
            .field("live_store_timeout", &self.live_store_timeout)
            .field("tileservers", &self.tileserver_keys.keys().collect::<Vec<_>>())
            .field("sync_workers", &self.sync_workers)
            .finish()
    }
}

impl Config {
    /// Load from the optional file, the dotenv files and the process
    /// environment.
    pub fn load(environment: Environment, path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(p) => FileConfig::read(p)?,
            None => FileConfig::default(),
        };
        let env_file = format!(".env.{}", environment.as_str());
        if dotenvy::from_filename(&env_file).is_ok() {
            debug!(file = %env_file, "loaded environment file");
        }
        let _ = dotenvy::dotenv();

        let env: BTreeMap<String, String> = std::env::vars().collect();
        Self::from_parts(environment, file, &env)
    }

    /// Merge a parsed file with an environment snapshot. Environment values
    /// win over file values.
    pub fn from_parts(environment: Environment, file: FileConfig, env: &BTreeMap<String, String>) -> Result<Self> {
        let var = |key: &str| env.get(key).filter(|v| !v.trim().is_empty()).cloned();
        let mut missing = Vec::new();

        let database_url = var("DATABASE_URL").or(file.database.url);
        if database_url.is_none() {
            missing.push("DATABASE_URL");
        }
        let live_store_url = var("LIVE_STORE_URL").or(file.live_store.url);
        if live_store_url.is_none() {
            missing.push("LIVE_STORE_URL");
        }
        let (Some(database_url), Some(live_store_url)) = (database_url, live_store_url) else {
            return Err(Error::Configuration(format!("missing required settings: {}", missing.join(", "))));
        };

        let database_max_connections = match var("DATABASE_MAX_CONNECTIONS") {
            Some(v) => parse_number("DATABASE_MAX_CONNECTIONS", &v)?,
            None => file.database.max_connections.unwrap_or(DEFAULT_MAX_CONNECTIONS),
        };
        let timeout_secs = match var("LIVE_STORE_TIMEOUT_SECS") {
            Some(v) => parse_number("LIVE_STORE_TIMEOUT_SECS", &v)?,
            None => file.live_store.timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS),
        };
        let sync_workers = match var("SYNC_WORKERS") {
            Some(v) => parse_number("SYNC_WORKERS", &v)?,
            None => file.sync.workers.unwrap_or(1),
        };

        let mut tileserver_keys: BTreeMap<String, String> = file
            .tileservers
            .into_iter()
            .map(|(name, key)| (name.to_lowercase(), key))
            .collect();
        for (key, value) in env {
            if let Some(name) = tileserver_name(key) {
                if !value.trim().is_empty() {
                    tileserver_keys.insert(name, value.clone());
                }
            }
        }

        Ok(Config {
            environment,
            database_url,
            database_max_connections,
            live_store_url,
            live_store_root: var("LIVE_STORE_ROOT")
                .or(file.live_store.root)
                .unwrap_or_else(|| DEFAULT_LIVE_STORE_ROOT.to_string()),
            live_store_auth_token: var("LIVE_STORE_AUTH_TOKEN").or(file.live_store.auth_token),
            live_store_timeout: Duration::from_secs(timeout_secs),
            tileserver_keys,
            sync_workers: sync_workers.max(1),
        })
    }
}

/// `TILESERVER_MAXAR_PREMIUM_API_KEY` → `maxar_premium`.
fn tileserver_name(var: &str) -> Option<String> {
    let name = var.strip_prefix(TILESERVER_PREFIX)?.strip_suffix(TILESERVER_SUFFIX)?;
    if name.is_empty() {
        None
    } else {
        Some(name.to_lowercase())
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::Configuration(format!("{} must be a number, got '{}'", key, value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn env(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn missing_required_values_are_listed_together() {
        let err = Config::from_parts(Environment::Development, FileConfig::default(), &env(&[])).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("DATABASE_URL"));
        assert!(msg.contains("LIVE_STORE_URL"));
        assert_eq!(err.kind(), crate::error::ErrorKind::Configuration);
    }

    #[test]
    fn environment_overrides_file() {
        let file = FileConfig::parse(
            r#"
            [database]
            url = "postgres://file/db"
            max_connections = 3

            [live_store]
            url = "https://file.test"
            root = "dev"

            [tileservers]
            Bing = "file-key"
            "#,
        )
        .unwrap();
        let cfg = Config::from_parts(
            Environment::Production,
            file,
            &env(&[
                ("DATABASE_URL", "postgres://env/db"),
                ("TILESERVER_BING_API_KEY", "env-key"),
                ("TILESERVER_MAXAR_PREMIUM_API_KEY", "mx"),
            ]),
        )
        .unwrap();
        assert_eq!(cfg.database_url, "postgres://env/db");
        assert_eq!(cfg.database_max_connections, 3);
        assert_eq!(cfg.live_store_url, "https://file.test");
        assert_eq!(cfg.live_store_root, "dev");
        assert_eq!(cfg.tileserver_keys.get("bing").map(String::as_str), Some("env-key"));
        assert_eq!(cfg.tileserver_keys.get("maxar_premium").map(String::as_str), Some("mx"));
    }

    #[test]
    fn defaults_apply() {
        let cfg = Config::from_parts(
            Environment::Development,
            FileConfig::default(),
            &env(&[("DATABASE_URL", "postgres://x/db"), ("LIVE_STORE_URL", "https://x.test")]),
        )
        .unwrap();
        assert_eq!(cfg.live_store_root, DEFAULT_LIVE_STORE_ROOT);
        assert_eq!(cfg.database_max_connections, DEFAULT_MAX_CONNECTIONS);
        assert_eq!(cfg.live_store_timeout, Duration::from_secs(DEFAULT_TIMEOUT_SECS));
        assert_eq!(cfg.sync_workers, 1);
        assert!(cfg.live_store_auth_token.is_none());
    }

    #[test]
    fn blank_values_count_as_missing() {
        let err = Config::from_parts(
            Environment::Development,
            FileConfig::default(),
            &env(&[("DATABASE_URL", "  "), ("LIVE_STORE_URL", "https://x.test")]),
        )
        .unwrap_err();
        assert!(err.to_string().contains("DATABASE_URL"));
    }

    #[test]
    fn non_numeric_worker_count_is_rejected() {
        let err = Config::from_parts(
            Environment::Development,
            FileConfig::default(),
            &env(&[
                ("DATABASE_URL", "postgres://x/db"),
                ("LIVE_STORE_URL", "https://x.test"),
                ("SYNC_WORKERS", "many"),
            ]),
        )
        .unwrap_err();
        assert!(err.to_string().contains("SYNC_WORKERS"));
    }

    #[test]
    fn unknown_file_keys_are_rejected() {
        assert!(FileConfig::parse("[database]\nhost = \"x\"\n").is_err());
    }

    #[test]
    fn reads_file_from_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[sync]\nworkers = 4").unwrap();
        let parsed = FileConfig::read(file.path()).unwrap();
        assert_eq!(parsed.sync.workers, Some(4));
        assert!(FileConfig::read(Path::new("/nonexistent/crowdmap.toml")).is_err());
    }

    #[test]
    fn tileserver_names_are_lower_case() {
        assert_eq!(tileserver_name("TILESERVER_MAPBOX_API_KEY").as_deref(), Some("mapbox"));
        assert_eq!(tileserver_name("TILESERVER__API_KEY"), None);
        assert_eq!(tileserver_name("MAPBOX_API_KEY"), None);
    }

    #[test]
    fn debug_output_redacts_secrets() {
        let cfg = Config::from_parts(
            Environment::Development,
            FileConfig::default(),
            &env(&[
                ("DATABASE_URL", "postgres://user:secret@x/db"),
                ("LIVE_STORE_URL", "https://x.test"),
                ("LIVE_STORE_AUTH_TOKEN", "tok"),
            ]),
        )
        .unwrap();
        let dbg = format!("{:?}", cfg);
        assert!(!dbg.contains("secret"));
        assert!(!dbg.contains("tok\""));
    }
}
