use anyhow::{Context, Result, anyhow, bail};
use serde::Deserialize;
use std::{
    fmt, fs,
    path::{Path, PathBuf},
    time::Duration,
};

pub const DEFAULT_DATABASE_PATH: &str = "./subbed.db";
pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_STATIC_ROOT: &str = "./static";
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;

pub const DATABASE_PATH_ENV: &str = "DATABASE_PATH";
pub const CREDENTIALS_ENV: &str = "ADMIN_CREDENTIALS";
pub const DEBUG_ENV: &str = "DEBUG";
pub const HOST_ENV: &str = "SUBBED_HOST";
pub const PORT_ENV: &str = "SUBBED_PORT";
pub const STATIC_ROOT_ENV: &str = "SUBBED_STATIC_ROOT";

/// Optional settings read from a TOML file. Every key may be omitted.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub database_path: Option<PathBuf>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub static_root: Option<PathBuf>,
    pub admin_credentials: Option<String>,
    pub debug: Option<bool>,
    pub busy_timeout_ms: Option<u64>,
    pub request_timeout_ms: Option<u64>,
}

/// Values given on the command line; they win over everything else.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub database_path: Option<PathBuf>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub static_root: Option<PathBuf>,
    pub debug: bool,
}

/// The single username/password pair guarding the admin endpoints.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    /// Parses `username:password`. The password may itself contain `:`.
    pub fn parse(raw: &str) -> Result<Self> {
        let (username, password) = raw
            .split_once(':')
            .ok_or_else(|| anyhow!("invalid credentials format, expected username:password"))?;
        if username.is_empty() {
            bail!("invalid credentials format, username is empty");
        }
        Ok(Self {
            username: username.to_owned(),
            password: password.to_owned(),
        })
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: PathBuf,
    pub host: String,
    pub port: u16,
    pub static_root: PathBuf,
    pub credentials: Credentials,
    pub debug: bool,
    pub busy_timeout: Duration,
    pub request_timeout: Duration,
}

pub fn read_file_config(path: &Path) -> Result<Option<FileConfig>> {
    if !path.exists() {
        return Ok(None);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    let cfg = toml::from_str(&content).with_context(|| format!("Parsing {}", path.display()))?;
    Ok(Some(cfg))
}

/// Reads the process environment and layers it over `file`.
pub fn load(file: Option<&Path>, overrides: Overrides) -> Result<Config> {
    load_with_env(file, overrides, |key| std::env::var(key).ok())
}

/// Layers defaults, the optional TOML file, the environment (through `env`)
/// and finally `overrides`.
pub fn load_with_env<F>(file: Option<&Path>, overrides: Overrides, env: F) -> Result<Config>
where
    F: Fn(&str) -> Option<String>,
{
    let cfg = match file {
        Some(path) => read_file_config(path)?
            .ok_or_else(|| anyhow!("Missing config file at {}", path.display()))?,
        None => FileConfig::default(),
    };
    let env = |key: &str| env(key).filter(|value| !value.is_empty());

    let database_path = overrides
        .database_path
        .or_else(|| env(DATABASE_PATH_ENV).map(PathBuf::from))
        .or(cfg.database_path)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DATABASE_PATH));

    let host = overrides
        .host
        .or_else(|| env(HOST_ENV))
        .or(cfg.host)
        .unwrap_or_else(|| DEFAULT_HOST.to_string());

    let port = match (overrides.port, env(PORT_ENV)) {
        (Some(port), _) => port,
        (None, Some(raw)) => raw
            .parse()
            .with_context(|| format!("Parsing {PORT_ENV} value {raw:?}"))?,
        (None, None) => cfg.port.unwrap_or(DEFAULT_PORT),
    };

    let static_root = overrides
        .static_root
        .or_else(|| env(STATIC_ROOT_ENV).map(PathBuf::from))
        .or(cfg.static_root)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_STATIC_ROOT));

    let raw_credentials = env(CREDENTIALS_ENV)
        .or(cfg.admin_credentials)
        .ok_or_else(|| anyhow!("{CREDENTIALS_ENV} is not set"))?;
    let credentials = Credentials::parse(&raw_credentials)
        .with_context(|| format!("Parsing admin credentials from {CREDENTIALS_ENV}"))?;

    let debug = overrides.debug
        || env(DEBUG_ENV).map(|value| value == "true").unwrap_or(false)
        || cfg.debug.unwrap_or(false);

    Ok(Config {
        database_path,
        host,
        port,
        static_root,
        credentials,
        debug,
        busy_timeout: Duration::from_millis(cfg.busy_timeout_ms.unwrap_or(DEFAULT_BUSY_TIMEOUT_MS)),
        request_timeout: Duration::from_millis(
            cfg.request_timeout_ms.unwrap_or(DEFAULT_REQUEST_TIMEOUT_MS),
        ),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn make_config(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", contents).unwrap();
        file
    }

    fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_only_credentials_are_set() {
        let cfg = load_with_env(
            None,
            Overrides::default(),
            env_from(&[(CREDENTIALS_ENV, "admin:secret")]),
        )
        .unwrap();
        assert_eq!(cfg.database_path, PathBuf::from(DEFAULT_DATABASE_PATH));
        assert_eq!(cfg.port, DEFAULT_PORT);
        assert_eq!(cfg.host, DEFAULT_HOST);
        assert!(!cfg.debug);
        assert_eq!(cfg.credentials.username, "admin");
        assert_eq!(cfg.credentials.password, "secret");
        assert_eq!(cfg.busy_timeout, Duration::from_millis(DEFAULT_BUSY_TIMEOUT_MS));
    }

    #[test]
    fn missing_credentials_is_an_error() {
        let err = load_with_env(None, Overrides::default(), env_from(&[])).unwrap_err();
        assert!(err.to_string().contains(CREDENTIALS_ENV));
    }

    #[test]
    fn malformed_credentials_are_rejected() {
        assert!(Credentials::parse("nocolon").is_err());
        assert!(Credentials::parse(":pw").is_err());
        let creds = Credentials::parse("user:pa:ss").unwrap();
        assert_eq!(creds.password, "pa:ss");
    }

    #[test]
    fn file_values_are_overridden_by_env_and_cli() {
        let file = make_config(
            "database_path = \"/data/file.db\"\nport = 4000\nhost = \"127.0.0.1\"\nadmin_credentials = \"f:f\"\nbusy_timeout_ms = 250\n",
        );
        let cfg = load_with_env(
            Some(file.path()),
            Overrides {
                port: Some(5000),
                ..Overrides::default()
            },
            env_from(&[(DATABASE_PATH_ENV, "/data/env.db"), (DEBUG_ENV, "true")]),
        )
        .unwrap();
        assert_eq!(cfg.database_path, PathBuf::from("/data/env.db"));
        assert_eq!(cfg.port, 5000);
        assert_eq!(cfg.host, "127.0.0.1");
        assert_eq!(cfg.credentials.username, "f");
        assert!(cfg.debug);
        assert_eq!(cfg.busy_timeout, Duration::from_millis(250));
    }

    #[test]
    fn unknown_keys_in_file_are_rejected() {
        let file = make_config("databse_path = \"typo.db\"\n");
        assert!(read_file_config(file.path()).is_err());
    }

    #[test]
    fn invalid_port_in_env_is_reported() {
        let err = load_with_env(
            None,
            Overrides::default(),
            env_from(&[(CREDENTIALS_ENV, "a:b"), (PORT_ENV, "http")]),
        )
        .unwrap_err();
        assert!(err.to_string().contains(PORT_ENV));
    }

    #[test]
    fn debug_output_hides_the_password() {
        let creds = Credentials::parse("admin:hunter2").unwrap();
        assert!(!format!("{creds:?}").contains("hunter2"));
    }
}
