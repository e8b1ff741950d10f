use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

const DEFAULT_BIND_ADDR: &str = "0.0.0.0:2052";
const DEFAULT_OUTBOUND_QUEUE: usize = 64;
const DEFAULT_SEND_TIMEOUT_MS: u64 = 5000;
const DEFAULT_MAX_MESSAGE_LEN: usize = 4096;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{name} has an invalid value {value:?}")]
    Invalid { name: &'static str, value: String },
    #[error("CARELINK_TLS_CERT and CARELINK_TLS_KEY must be set together")]
    PartialTls,
}

#[derive(Debug, Clone)]
pub struct TlsPaths {
    pub cert: PathBuf,
    pub key: PathBuf,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    /// Snapshot file for the store; `None` keeps everything in memory.
    pub data_path: Option<PathBuf>,
    pub tls: Option<TlsPaths>,
    pub static_dir: Option<PathBuf>,
    pub outbound_queue: usize,
    pub send_timeout: Duration,
    pub idle_timeout: Option<Duration>,
    pub max_message_len: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 2052)),
            data_path: None,
            tls: None,
            static_dir: None,
            outbound_queue: DEFAULT_OUTBOUND_QUEUE,
            send_timeout: Duration::from_millis(DEFAULT_SEND_TIMEOUT_MS),
            idle_timeout: None,
            max_message_len: DEFAULT_MAX_MESSAGE_LEN,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|name| env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let bind_addr = parse_or(&lookup, "CARELINK_BIND_ADDR", DEFAULT_BIND_ADDR.parse().ok())?;
        let outbound_queue = nonzero(
            "CARELINK_OUTBOUND_QUEUE",
            parse_or(&lookup, "CARELINK_OUTBOUND_QUEUE", Some(DEFAULT_OUTBOUND_QUEUE))?,
        )?;
        let send_timeout_ms: u64 = nonzero(
            "CARELINK_SEND_TIMEOUT_MS",
            parse_or(&lookup, "CARELINK_SEND_TIMEOUT_MS", Some(DEFAULT_SEND_TIMEOUT_MS))?,
        )?;
        let idle_timeout_secs: Option<u64> =
            match parse_optional(&lookup, "CARELINK_IDLE_TIMEOUT_SECS")? {
                Some(secs) => Some(nonzero("CARELINK_IDLE_TIMEOUT_SECS", secs)?),
                None => None,
            };
        let max_message_len =
            parse_or(&lookup, "CARELINK_MAX_MESSAGE_LEN", Some(DEFAULT_MAX_MESSAGE_LEN))?;

        let tls = match (path(&lookup, "CARELINK_TLS_CERT"), path(&lookup, "CARELINK_TLS_KEY")) {
            (Some(cert), Some(key)) => Some(TlsPaths { cert, key }),
            (None, None) => None,
            _ => return Err(ConfigError::PartialTls),
        };

        Ok(Config {
            bind_addr,
            data_path: path(&lookup, "CARELINK_DATA_PATH"),
            tls,
            static_dir: path(&lookup, "CARELINK_STATIC_DIR"),
            outbound_queue,
            send_timeout: Duration::from_millis(send_timeout_ms),
            idle_timeout: idle_timeout_secs.map(Duration::from_secs),
            max_message_len,
        })
    }
}

fn path(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<PathBuf> {
    lookup(name)
        .filter(|value| !value.trim().is_empty())
        .map(PathBuf::from)
}

fn nonzero<T>(name: &'static str, value: T) -> Result<T, ConfigError>
where
    T: Default + PartialEq + ToString,
{
    if value == T::default() {
        Err(ConfigError::Invalid {
            name,
            value: value.to_string(),
        })
    } else {
        Ok(value)
    }
}

fn parse_optional<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(name).filter(|value| !value.trim().is_empty()) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { name, value }),
    }
}

fn parse_or<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: Option<T>,
) -> Result<T, ConfigError> {
    match parse_optional(lookup, name)? {
        Some(value) => Ok(value),
        None => default.ok_or(ConfigError::Invalid {
            name,
            value: String::new(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        Config::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = load(&[]).unwrap();
        assert_eq!(config.bind_addr, SocketAddr::from(([0, 0, 0, 0], 2052)));
        assert_eq!(config.outbound_queue, 64);
        assert_eq!(config.send_timeout, Duration::from_secs(5));
        assert!(config.idle_timeout.is_none());
        assert!(config.data_path.is_none());
        assert!(config.tls.is_none());
    }

    #[test]
    fn overrides_are_parsed() {
        let config = load(&[
            ("CARELINK_BIND_ADDR", "127.0.0.1:9000"),
            ("CARELINK_DATA_PATH", "/var/lib/carelink/store.json"),
            ("CARELINK_IDLE_TIMEOUT_SECS", "300"),
            ("CARELINK_MAX_MESSAGE_LEN", "100"),
            ("CARELINK_TLS_CERT", "cert.pem"),
            ("CARELINK_TLS_KEY", "key.pem"),
        ])
        .unwrap();
        assert_eq!(config.bind_addr.port(), 9000);
        assert_eq!(config.idle_timeout, Some(Duration::from_secs(300)));
        assert_eq!(config.max_message_len, 100);
        assert_eq!(
            config.data_path,
            Some(PathBuf::from("/var/lib/carelink/store.json"))
        );
        assert!(config.tls.is_some());
    }

    #[test]
    fn bad_values_are_rejected() {
        assert!(matches!(
            load(&[("CARELINK_OUTBOUND_QUEUE", "lots")]),
            Err(ConfigError::Invalid { name: "CARELINK_OUTBOUND_QUEUE", .. })
        ));
        assert!(matches!(
            load(&[("CARELINK_OUTBOUND_QUEUE", "0")]),
            Err(ConfigError::Invalid { .. })
        ));
        assert!(matches!(
            load(&[("CARELINK_IDLE_TIMEOUT_SECS", "0")]),
            Err(ConfigError::Invalid { name: "CARELINK_IDLE_TIMEOUT_SECS", .. })
        ));
        assert!(matches!(
            load(&[("CARELINK_SEND_TIMEOUT_MS", "0")]),
            Err(ConfigError::Invalid { name: "CARELINK_SEND_TIMEOUT_MS", .. })
        ));
        assert!(matches!(
            load(&[("CARELINK_TLS_CERT", "cert.pem")]),
            Err(ConfigError::PartialTls)
        ));
    }
}
