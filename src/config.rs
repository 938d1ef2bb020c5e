use std::io::{self, ErrorKind};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Certificate and key for TLS, PEM encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsFiles {
    pub cert: PathBuf,
    pub key: PathBuf,
}

/// Server settings, read from `APPOINTD_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    /// WAL appends since the last compaction that trigger the next one.
    pub compact_threshold: u64,
    pub compact_interval: Duration,
    pub tls: Option<TlsFiles>,
    /// Prometheus exporter port; disabled when unset.
    pub metrics_port: Option<u16>,
}

impl Config {
    pub fn from_env() -> io::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Numbers that fail to parse fall back to
    /// their defaults; a half-configured TLS pair is an error.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> io::Result<Self> {
        let tls = match (get("APPOINTD_TLS_CERT"), get("APPOINTD_TLS_KEY")) {
            (None, None) => None,
            (Some(cert), Some(key)) => Some(TlsFiles {
                cert: cert.into(),
                key: key.into(),
            }),
            _ => {
                return Err(io::Error::new(
                    ErrorKind::InvalidInput,
                    "both APPOINTD_TLS_CERT and APPOINTD_TLS_KEY must be set, or neither",
                ));
            }
        };

        Ok(Self {
            port: number(&get, "APPOINTD_PORT").unwrap_or(5433),
            bind: get("APPOINTD_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            data_dir: get("APPOINTD_DATA_DIR")
                .unwrap_or_else(|| "./data".into())
                .into(),
            password: get("APPOINTD_PASSWORD").unwrap_or_else(|| "appointd".into()),
            max_connections: number::<usize>(&get, "APPOINTD_MAX_CONNECTIONS")
                .filter(|n| *n > 0)
                .unwrap_or(256),
            compact_threshold: number(&get, "APPOINTD_COMPACT_THRESHOLD").unwrap_or(1000),
            compact_interval: Duration::from_secs(
                number::<u64>(&get, "APPOINTD_COMPACT_INTERVAL_SECS")
                    .filter(|n| *n > 0)
                    .unwrap_or(60),
            ),
            tls,
            metrics_port: number(&get, "APPOINTD_METRICS_PORT"),
        })
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("appointd.wal")
    }
}

fn number<T: FromStr>(get: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    get(key).and_then(|v| v.trim().parse().ok())
}
