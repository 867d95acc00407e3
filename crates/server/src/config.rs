use std::collections::HashMap;
use std::env;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::fs;
use std::path::Path;

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse { line: usize },
    Missing(&'static str),
    Invalid(&'static str),
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(err) => write!(f, "configuration unreadable: {}", err),
            Self::Parse { line } => write!(f, "configuration parse failure on line {}", line),
            Self::Missing(key) => write!(f, "configuration key missing: {}", key),
            Self::Invalid(key) => write!(f, "configuration value invalid: {}", key),
        }
    }
}

impl Error for ConfigError {}

#[derive(Clone)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub dbname: String,
}

impl DatabaseConfig {
    pub fn dsn(&self) -> String {
        format!(
            "host={} port={} user={} password={} dbname={}",
            self.host, self.port, self.user, self.password, self.dbname
        )
    }

    pub fn same_endpoint(&self, other: &DatabaseConfig) -> bool {
        self.host == other.host
            && self.port == other.port
            && self.user == other.user
            && self.password == other.password
            && self.dbname == other.dbname
    }
}

#[derive(Clone)]
pub struct CacheConfig {
    pub host: String,
    pub port: u16,
}

impl CacheConfig {
    pub fn url(&self) -> String {
        format!("redis://{}:{}/", self.host, self.port)
    }
}

#[derive(Clone)]
pub struct SentinelConfig {
    pub host: String,
    pub port: u16,
    pub master_name: String,
}

#[derive(Clone)]
pub struct LimitsConfig {
    pub heartbeat_idle_seconds: u64,
    pub heartbeat_dead_seconds: u64,
    pub presence_grace_seconds: u64,
    pub history_limit: i64,
}

#[derive(Clone)]
pub struct ServerConfig {
    pub bind: String,
    pub gateway_id: String,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub database: DatabaseConfig,
    pub database_replica: DatabaseConfig,
    pub cache: CacheConfig,
    pub sentinel: Option<SentinelConfig>,
    pub limits: LimitsConfig,
}

impl ServerConfig {
    /// Replica DSN to hand to storage; `None` collapses to single-node mode.
    pub fn replica_dsn(&self) -> Option<String> {
        if self.database.same_endpoint(&self.database_replica) {
            None
        } else {
            Some(self.database_replica.dsn())
        }
    }
}

// Flat view of the config file: `[section]` headers qualify the keys that
// follow, so `host` under `[cache]` is stored as `cache.host`. Comments are
// stripped before tokenizing, which means a literal `#` cannot appear in a
// value.
struct RawConfig {
    values: HashMap<String, String>,
}

impl RawConfig {
    fn parse(contents: &str) -> Result<Self, ConfigError> {
        let mut values = HashMap::new();
        let mut section = String::new();
        for (index, raw_line) in contents.lines().enumerate() {
            let line = raw_line
                .split_once('#')
                .map(|(head, _)| head)
                .unwrap_or(raw_line)
                .trim();
            if line.is_empty() {
                continue;
            }
            if let Some(header) = line.strip_prefix('[') {
                let name = header
                    .strip_suffix(']')
                    .ok_or(ConfigError::Parse { line: index + 1 })?;
                section = name.trim().to_string();
                continue;
            }
            let (key, value) = line
                .split_once('=')
                .ok_or(ConfigError::Parse { line: index + 1 })?;
            let qualified = if section.is_empty() {
                key.trim().to_string()
            } else {
                format!("{}.{}", section, key.trim())
            };
            values.insert(qualified, unquote(value.trim()).to_string());
        }
        Ok(RawConfig { values })
    }

    fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }

    // Environment wins over the file for the keys that expose an override.
    fn resolve(&self, env_key: &str, file_key: &str) -> Option<String> {
        env::var(env_key).ok().or_else(|| self.get(file_key))
    }
}

fn unquote(value: &str) -> &str {
    value
        .strip_prefix('"')
        .and_then(|rest| rest.strip_suffix('"'))
        .unwrap_or(value)
}

fn require(value: Option<String>, key: &'static str) -> Result<String, ConfigError> {
    value.ok_or(ConfigError::Missing(key))
}

fn port_or(value: Option<String>, key: &'static str, default: u16) -> Result<u16, ConfigError> {
    match value {
        Some(raw) => raw.parse::<u16>().map_err(|_| ConfigError::Invalid(key)),
        None => Ok(default),
    }
}

fn seconds_or(value: Option<String>, key: &'static str, default: u64) -> Result<u64, ConfigError> {
    match value {
        Some(raw) => raw.parse::<u64>().map_err(|_| ConfigError::Invalid(key)),
        None => Ok(default),
    }
}

/// Loads the edge configuration from the filesystem with environment
/// overrides applied on top.
pub fn load_configuration(path: &Path) -> Result<ServerConfig, ConfigError> {
    let contents = fs::read_to_string(path).map_err(ConfigError::Io)?;
    let raw = RawConfig::parse(&contents)?;

    let bind = require(raw.resolve("EDGECHAT_BIND", "server.bind"), "server.bind")?;
    let gateway_id = raw
        .resolve("EDGECHAT_GATEWAY_ID", "server.gateway_id")
        .unwrap_or_else(|| "1".to_string());
    let tls_cert = raw.resolve("EDGECHAT_TLS_CERT", "server.tls_cert");
    let tls_key = raw.resolve("EDGECHAT_TLS_KEY", "server.tls_key");
    if tls_cert.is_some() != tls_key.is_some() {
        return Err(ConfigError::Invalid("server.tls_cert/server.tls_key"));
    }

    let database = DatabaseConfig {
        host: require(raw.resolve("EDGECHAT_DB_HOST", "database.host"), "database.host")?,
        port: port_or(
            raw.resolve("EDGECHAT_DB_PORT", "database.port"),
            "database.port",
            5432,
        )?,
        user: require(raw.resolve("EDGECHAT_DB_USER", "database.user"), "database.user")?,
        password: raw
            .resolve("EDGECHAT_DB_PASSWORD", "database.password")
            .unwrap_or_default(),
        dbname: require(raw.resolve("EDGECHAT_DB_NAME", "database.dbname"), "database.dbname")?,
    };

    // A partial replica section inherits the remaining fields from the
    // primary; an absent section mirrors the primary entirely.
    let database_replica = DatabaseConfig {
        host: raw
            .get("database_replica.host")
            .unwrap_or_else(|| database.host.clone()),
        port: port_or(
            raw.get("database_replica.port"),
            "database_replica.port",
            database.port,
        )?,
        user: raw
            .get("database_replica.user")
            .unwrap_or_else(|| database.user.clone()),
        password: raw
            .get("database_replica.password")
            .unwrap_or_else(|| database.password.clone()),
        dbname: raw
            .get("database_replica.dbname")
            .unwrap_or_else(|| database.dbname.clone()),
    };

    let cache = CacheConfig {
        host: require(raw.resolve("EDGECHAT_CACHE_HOST", "cache.host"), "cache.host")?,
        port: port_or(
            raw.resolve("EDGECHAT_CACHE_PORT", "cache.port"),
            "cache.port",
            6379,
        )?,
    };

    let sentinel = match raw.get("sentinel.host") {
        Some(host) => Some(SentinelConfig {
            host,
            port: require(raw.get("sentinel.port"), "sentinel.port")?
                .parse::<u16>()
                .map_err(|_| ConfigError::Invalid("sentinel.port"))?,
            master_name: require(raw.get("sentinel.master_name"), "sentinel.master_name")?,
        }),
        None => None,
    };

    let limits = LimitsConfig {
        heartbeat_idle_seconds: seconds_or(
            raw.get("limits.heartbeat_idle"),
            "limits.heartbeat_idle",
            60,
        )?,
        heartbeat_dead_seconds: seconds_or(
            raw.get("limits.heartbeat_dead"),
            "limits.heartbeat_dead",
            120,
        )?,
        presence_grace_seconds: seconds_or(
            raw.get("limits.presence_grace"),
            "limits.presence_grace",
            2,
        )?,
        history_limit: seconds_or(raw.get("limits.history_limit"), "limits.history_limit", 50)?
            as i64,
    };
    if limits.heartbeat_dead_seconds <= limits.heartbeat_idle_seconds {
        return Err(ConfigError::Invalid("limits.heartbeat_dead"));
    }

    Ok(ServerConfig {
        bind,
        gateway_id,
        tls_cert,
        tls_key,
        database,
        database_replica,
        cache,
        sentinel,
        limits,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::path::PathBuf;

    #[test]
    fn parse_configuration_minimal() {
        let mut path = PathBuf::from(env::temp_dir());
        path.push("edgechat_test_config.toml");
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(
            b"# edge under test\n[server]\nbind=\"127.0.0.1:8080\"\ngateway_id=\"g1\"\n[database]\nhost=\"localhost\"\nuser=\"edgechat\"\npassword=\"pw\"\ndbname=\"edgechat\"\n[cache]\nhost=\"localhost\" # default port\n",
        )
        .unwrap();
        let config = load_configuration(&path).unwrap();
        assert_eq!(config.bind, "127.0.0.1:8080");
        assert_eq!(config.gateway_id, "g1");
        assert_eq!(config.database.port, 5432);
        assert_eq!(config.cache.port, 6379);
        assert!(config.sentinel.is_none());
        assert!(config.tls_cert.is_none());
        assert_eq!(config.limits.heartbeat_idle_seconds, 60);
        assert_eq!(config.limits.heartbeat_dead_seconds, 120);
        assert_eq!(config.limits.presence_grace_seconds, 2);
        // No replica section: single node mode.
        assert!(config.replica_dsn().is_none());
        fs::remove_file(path).unwrap();
    }

    #[test]
    fn parse_configuration_with_replica() {
        let mut path = PathBuf::from(env::temp_dir());
        path.push("edgechat_test_config_replica.toml");
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(
            b"[server]\nbind=\"0.0.0.0:8080\"\n[database]\nhost=\"db1\"\nuser=\"u\"\npassword=\"p\"\ndbname=\"chat\"\n[database_replica]\nhost=\"db2\"\n[cache]\nhost=\"cache\"\nport=\"6380\"\n[limits]\nheartbeat_idle=\"30\"\nheartbeat_dead=\"90\"\n",
        )
        .unwrap();
        let config = load_configuration(&path).unwrap();
        let replica = config.replica_dsn().expect("replica configured");
        assert!(replica.contains("host=db2"));
        assert!(replica.contains("dbname=chat"));
        assert_eq!(config.cache.url(), "redis://cache:6380/");
        assert_eq!(config.limits.heartbeat_idle_seconds, 30);
        fs::remove_file(path).unwrap();
    }

    #[test]
    fn reject_dead_interval_not_beyond_idle() {
        let mut path = PathBuf::from(env::temp_dir());
        path.push("edgechat_test_config_bad.toml");
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(
            b"[server]\nbind=\"0.0.0.0:8080\"\n[database]\nhost=\"db\"\nuser=\"u\"\ndbname=\"chat\"\n[cache]\nhost=\"cache\"\n[limits]\nheartbeat_idle=\"120\"\nheartbeat_dead=\"120\"\n",
        )
        .unwrap();
        assert!(matches!(
            load_configuration(&path),
            Err(ConfigError::Invalid("limits.heartbeat_dead"))
        ));
        fs::remove_file(path).unwrap();
    }

    #[test]
    fn parse_reports_offending_line() {
        let mut path = PathBuf::from(env::temp_dir());
        path.push("edgechat_test_config_parse.toml");
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(b"[server]\nbind=\"0.0.0.0:8080\"\nno equals sign here\n").unwrap();
        assert!(matches!(
            load_configuration(&path),
            Err(ConfigError::Parse { line: 3 })
        ));
        fs::remove_file(path).unwrap();
    }
}
