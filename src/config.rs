//! Configuration loading with an environment-first override mode.
//!
//! Settings come from a TOML file (`canaryd.toml` in the working directory,
//! `/etc`, or `/usr/local/etc`, or an explicit `--config` path). When the
//! `CANARYD_DB` environment variable is set the file is ignored entirely
//! and every setting is taken from the environment instead — the container
//! deployment path. `CANARYD_LOG_LEVEL` overrides the log level in both
//! modes.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::AppError;

const CONFIG_FILE: &str = "canaryd.toml";
const CONFIG_DIRS: [&str; 3] = [".", "/etc", "/usr/local/etc"];

/// SMTP settings for the notifier.
#[derive(Debug, Clone)]
pub struct EmailConfig {
    /// From-address on outgoing notifications.
    pub sender: String,
    pub host: String,
    pub port: u16,
    /// Username and password must be given together or not at all.
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Log to this file instead of stderr.
    pub file: Option<PathBuf>,
    /// Roll the log file daily.
    pub rotate: bool,
}

/// Fully-resolved daemon configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub auth_key: Option<String>,
    /// SQLite database file.
    pub db_path: PathBuf,
    pub log_level: String,
    pub email: EmailConfig,
    pub logging: LoggingConfig,
}

// ── Raw TOML shape ────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct RawConfig {
    #[serde(default)]
    server: RawServer,
    #[serde(default)]
    storage: RawStorage,
    email: RawEmail,
    #[serde(default)]
    logging: RawLogging,
}

#[derive(Deserialize)]
struct RawServer {
    #[serde(default = "default_port")]
    port: u16,
    #[serde(default)]
    auth_key: Option<String>,
}

impl Default for RawServer {
    fn default() -> Self {
        Self { port: default_port(), auth_key: None }
    }
}

#[derive(Deserialize)]
struct RawStorage {
    #[serde(default = "default_db_path")]
    path: String,
}

impl Default for RawStorage {
    fn default() -> Self {
        Self { path: default_db_path() }
    }
}

#[derive(Deserialize)]
struct RawEmail {
    sender: String,
    #[serde(default = "default_smtp_host")]
    host: String,
    #[serde(default = "default_smtp_port")]
    port: u16,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
}

#[derive(Deserialize)]
struct RawLogging {
    #[serde(default)]
    file: Option<String>,
    #[serde(default)]
    rotate: bool,
    #[serde(default = "default_log_level")]
    level: String,
}

impl Default for RawLogging {
    fn default() -> Self {
        Self { file: None, rotate: false, level: default_log_level() }
    }
}

fn default_port() -> u16 {
    8080
}

fn default_db_path() -> String {
    "canaryd.db".to_string()
}

fn default_smtp_host() -> String {
    "localhost".to_string()
}

fn default_smtp_port() -> u16 {
    25
}

fn default_log_level() -> String {
    "info".to_string()
}

// ── Loading ───────────────────────────────────────────────────────────────

/// Load configuration: environment-first when `CANARYD_DB` is set,
/// otherwise from a TOML file.
pub fn load(config_path: Option<&str>) -> Result<Config, AppError> {
    let env = |key: &str| env::var(key).ok();
    if env("CANARYD_DB").is_some() {
        return from_environment(env);
    }

    if let Some(path) = config_path {
        return load_from(Path::new(path), env("CANARYD_LOG_LEVEL").as_deref());
    }

    for dir in CONFIG_DIRS {
        let candidate = Path::new(dir).join(CONFIG_FILE);
        if candidate.exists() {
            return load_from(&candidate, env("CANARYD_LOG_LEVEL").as_deref());
        }
    }
    Err(AppError::Config(format!(
        "could not find {CONFIG_FILE} in {CONFIG_DIRS:?}"
    )))
}

/// Parse a specific config file. Tests call this directly with an explicit
/// log-level override instead of mutating process environment.
pub fn load_from(path: &Path, log_level_override: Option<&str>) -> Result<Config, AppError> {
    let raw = fs::read_to_string(path)
        .map_err(|e| AppError::Config(format!("cannot read {}: {e}", path.display())))?;
    let parsed: RawConfig = toml::from_str(&raw)
        .map_err(|e| AppError::Config(format!("parse error in {}: {e}", path.display())))?;

    let config = Config {
        port: parsed.server.port,
        auth_key: parsed.server.auth_key,
        db_path: PathBuf::from(parsed.storage.path),
        log_level: log_level_override.unwrap_or(&parsed.logging.level).to_string(),
        email: EmailConfig {
            sender: parsed.email.sender,
            host: parsed.email.host,
            port: parsed.email.port,
            username: parsed.email.username,
            password: parsed.email.password,
        },
        logging: LoggingConfig {
            file: parsed.logging.file.map(PathBuf::from),
            rotate: parsed.logging.rotate,
        },
    };
    validate(config)
}

/// Environment-only configuration. `lookup` abstracts `env::var` so tests
/// can pass a closure.
pub fn from_environment(lookup: impl Fn(&str) -> Option<String>) -> Result<Config, AppError> {
    let db = lookup("CANARYD_DB")
        .ok_or_else(|| AppError::Config("CANARYD_DB environment variable not set".into()))?;
    let sender = lookup("EMAIL_SENDER")
        .ok_or_else(|| AppError::Config("EMAIL_SENDER environment variable not set".into()))?;

    let port = match lookup("CANARYD_PORT") {
        Some(raw) => raw
            .parse()
            .map_err(|_| AppError::Config(format!("malformed CANARYD_PORT {raw}")))?,
        None => default_port(),
    };
    let smtp_port = match lookup("SMTP_PORT") {
        Some(raw) => raw
            .parse()
            .map_err(|_| AppError::Config(format!("malformed SMTP_PORT {raw}")))?,
        None => default_smtp_port(),
    };

    let config = Config {
        port,
        auth_key: lookup("CANARYD_AUTH_KEY"),
        db_path: PathBuf::from(db),
        log_level: lookup("CANARYD_LOG_LEVEL").unwrap_or_else(default_log_level),
        email: EmailConfig {
            sender,
            host: lookup("SMTP_HOST").unwrap_or_else(default_smtp_host),
            port: smtp_port,
            username: lookup("SMTP_USERNAME"),
            password: lookup("SMTP_PASSWORD"),
        },
        logging: LoggingConfig { file: None, rotate: false },
    };
    validate(config)
}

fn validate(config: Config) -> Result<Config, AppError> {
    if config.email.username.is_some() != config.email.password.is_some() {
        return Err(AppError::Config(
            "must specify both or neither of email username and password".into(),
        ));
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_config(text: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(text.as_bytes()).unwrap();
        file
    }

    #[test]
    fn minimal_file_gets_defaults() {
        let file = write_config("[email]\nsender = \"canaryd@example.com\"\n");
        let config = load_from(file.path(), None).unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.db_path, PathBuf::from("canaryd.db"));
        assert_eq!(config.email.host, "localhost");
        assert_eq!(config.email.port, 25);
        assert_eq!(config.log_level, "info");
        assert!(config.auth_key.is_none());
        assert!(config.logging.file.is_none());
    }

    #[test]
    fn full_file_parses() {
        let file = write_config(
            "[server]\nport = 9000\nauth_key = \"sekrit\"\n\
             [storage]\npath = \"/var/lib/canaryd/canaries.db\"\n\
             [email]\nsender = \"c@example.com\"\nhost = \"mail\"\nport = 587\n\
             username = \"user\"\npassword = \"pass\"\n\
             [logging]\nfile = \"/var/log/canaryd.log\"\nrotate = true\nlevel = \"debug\"\n",
        );
        let config = load_from(file.path(), None).unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.auth_key.as_deref(), Some("sekrit"));
        assert_eq!(config.db_path, PathBuf::from("/var/lib/canaryd/canaries.db"));
        assert_eq!(config.email.username.as_deref(), Some("user"));
        assert!(config.logging.rotate);
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn log_level_override_wins() {
        let file = write_config("[email]\nsender = \"c@example.com\"\n[logging]\nlevel = \"warn\"\n");
        let config = load_from(file.path(), Some("trace")).unwrap();
        assert_eq!(config.log_level, "trace");
    }

    #[test]
    fn username_without_password_is_rejected() {
        let file = write_config("[email]\nsender = \"c@example.com\"\nusername = \"user\"\n");
        assert!(load_from(file.path(), None).is_err());
    }

    #[test]
    fn missing_sender_is_rejected() {
        let file = write_config("[server]\nport = 9000\n");
        assert!(load_from(file.path(), None).is_err());
    }

    #[test]
    fn environment_mode() {
        let vars = |key: &str| -> Option<String> {
            match key {
                "CANARYD_DB" => Some("/tmp/c.db".into()),
                "EMAIL_SENDER" => Some("c@example.com".into()),
                "SMTP_HOST" => Some("relay".into()),
                "CANARYD_PORT" => Some("9001".into()),
                "CANARYD_AUTH_KEY" => Some("sekrit".into()),
                _ => None,
            }
        };
        let config = from_environment(vars).unwrap();
        assert_eq!(config.db_path, PathBuf::from("/tmp/c.db"));
        assert_eq!(config.port, 9001);
        assert_eq!(config.email.host, "relay");
        assert_eq!(config.auth_key.as_deref(), Some("sekrit"));
    }

    #[test]
    fn environment_mode_requires_sender() {
        let vars = |key: &str| -> Option<String> {
            (key == "CANARYD_DB").then(|| "/tmp/c.db".to_string())
        };
        assert!(from_environment(vars).is_err());
    }

    #[test]
    fn malformed_env_port_is_rejected() {
        let vars = |key: &str| -> Option<String> {
            match key {
                "CANARYD_DB" => Some("/tmp/c.db".into()),
                "EMAIL_SENDER" => Some("c@example.com".into()),
                "CANARYD_PORT" => Some("eighty".into()),
                _ => None,
            }
        };
        assert!(from_environment(vars).is_err());
    }
}
