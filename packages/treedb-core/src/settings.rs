//! Process-level settings: listener address, session timeout and the default
//! configuration offered to new sessions.
//!
//! Values are layered: built-in defaults, then an optional TOML document, then
//! environment variables.

use std::path::PathBuf;
use std::time::Duration;

#[cfg(feature = "serde")]
use serde::Deserialize;

use crate::config::{parse_bool, Config, DEFAULT_TABLE};
use crate::error::{Error, Result};

pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(1800);
pub const DEFAULT_PORT: u16 = 3000;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Settings {
    pub host: String,
    pub port: u16,
    pub base_dir: PathBuf,
    /// Idle time after which a session is swept. Zero disables expiry.
    pub session_timeout: Duration,
    pub defaults: Config,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            base_dir: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            session_timeout: DEFAULT_SESSION_TIMEOUT,
            defaults: Config::new(
                PathBuf::from("data").join("databases").join("treedb.sqlite"),
                DEFAULT_TABLE,
            ),
        }
    }
}

#[cfg(feature = "serde")]
#[derive(Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
struct SettingsFile {
    host: Option<String>,
    port: Option<u16>,
    base_dir: Option<PathBuf>,
    session_timeout_seconds: Option<u64>,
    db_path: Option<PathBuf>,
    table_name: Option<String>,
    id_field: Option<String>,
    parent_field: Option<String>,
    order_field: Option<String>,
    auto_bootstrap: Option<bool>,
}

impl Settings {
    /// Defaults overlaid with the process environment.
    pub fn from_env() -> Result<Self> {
        let mut settings = Self::default();
        settings.apply_env(|key| std::env::var(key).ok())?;
        Ok(settings)
    }

    /// Overlay a TOML document on the defaults.
    #[cfg(feature = "serde")]
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let file: SettingsFile = toml::from_str(text)
            .map_err(|e| Error::Validation(format!("invalid settings file: {e}")))?;
        let mut settings = Self::default();
        if let Some(host) = file.host {
            settings.host = host;
        }
        if let Some(port) = file.port {
            settings.port = port;
        }
        if let Some(base_dir) = file.base_dir {
            settings.base_dir = base_dir;
        }
        if let Some(secs) = file.session_timeout_seconds {
            settings.session_timeout = Duration::from_secs(secs);
        }
        let defaults = &mut settings.defaults;
        if let Some(path) = file.db_path {
            defaults.data_source_path = path;
        }
        if let Some(table) = file.table_name {
            defaults.table_name = table;
        }
        if let Some(field) = file.id_field {
            defaults.id_field = field;
        }
        if let Some(field) = file.parent_field {
            defaults.parent_field = field;
        }
        if let Some(field) = file.order_field {
            defaults.order_field = field;
        }
        if let Some(flag) = file.auto_bootstrap {
            defaults.auto_bootstrap = flag;
        }
        Ok(settings)
    }

    /// Overlay variables looked up through `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(host) = lookup("HOST") {
            self.host = host;
        }
        if let Some(port) = lookup("PORT") {
            self.port = port
                .trim()
                .parse()
                .map_err(|_| Error::Validation(format!("PORT must be a port number, got {port:?}")))?;
        }
        if let Some(dir) = lookup("TREE_DB_BASE_DIR") {
            self.base_dir = PathBuf::from(dir);
        }
        if let Some(secs) = lookup("SESSION_TIMEOUT_SECONDS") {
            let secs: u64 = secs.trim().parse().map_err(|_| {
                Error::Validation(format!(
                    "SESSION_TIMEOUT_SECONDS must be a whole number, got {secs:?}"
                ))
            })?;
            self.session_timeout = Duration::from_secs(secs);
        }
        let defaults = &mut self.defaults;
        if let Some(path) = lookup("DB_PATH") {
            defaults.data_source_path = PathBuf::from(path);
        }
        if let Some(table) = lookup("TABLE_NAME") {
            defaults.table_name = table;
        }
        if let Some(field) = lookup("ID_FIELD") {
            defaults.id_field = field;
        }
        if let Some(field) = lookup("PARENT_FIELD") {
            defaults.parent_field = field;
        }
        if let Some(field) = lookup("ORDER_FIELD") {
            defaults.order_field = field;
        }
        if let Some(flag) = lookup("AUTO_BOOTSTRAP") {
            // Anything but an explicit "false" keeps bootstrapping on.
            defaults.auto_bootstrap = parse_bool(&flag).unwrap_or(true);
        }
        Ok(())
    }

    /// The default configuration, normalized against `base_dir`.
    pub fn default_config(&self) -> Result<Config> {
        self.defaults.normalized(&self.base_dir)
    }
}
