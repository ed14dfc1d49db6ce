use std::path::PathBuf;

/// Server configuration, read from `MILKRUN_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    /// WAL appends after which the compactor rewrites a tenant's log.
    pub compact_threshold: u64,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    /// Prometheus exporter port; metrics are not exported when unset.
    pub metrics_port: Option<u16>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 5433,
            bind: "0.0.0.0".into(),
            data_dir: PathBuf::from("./data"),
            password: "milkrun".into(),
            max_connections: 256,
            compact_threshold: 1000,
            tls_cert: None,
            tls_key: None,
            metrics_port: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Unparseable numbers fall back to the default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let parsed = |key: &str| lookup(key).and_then(|v| v.trim().parse().ok());
        Self {
            port: parsed("MILKRUN_PORT").unwrap_or(defaults.port),
            bind: lookup("MILKRUN_BIND").unwrap_or(defaults.bind),
            data_dir: lookup("MILKRUN_DATA_DIR").map(PathBuf::from).unwrap_or(defaults.data_dir),
            password: lookup("MILKRUN_PASSWORD").unwrap_or(defaults.password),
            max_connections: lookup("MILKRUN_MAX_CONNECTIONS")
                .and_then(|v| v.trim().parse().ok())
                .filter(|n| *n > 0)
                .unwrap_or(defaults.max_connections),
            compact_threshold: lookup("MILKRUN_COMPACT_THRESHOLD")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(defaults.compact_threshold),
            tls_cert: lookup("MILKRUN_TLS_CERT"),
            tls_key: lookup("MILKRUN_TLS_KEY"),
            metrics_port: parsed("MILKRUN_METRICS_PORT"),
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}
