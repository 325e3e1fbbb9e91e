use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

/// Top-level configuration for the Meshbus runtime.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub shutdown: ShutdownConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// Identity of this mesh node. `env` qualifies every client group key; two
/// nodes with different `env` values never share groups.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_server_ip")]
    pub ip: String,
    #[serde(default = "default_cluster")]
    pub cluster: String,
    #[serde(default = "default_env")]
    pub env: String,
    #[serde(default = "default_idc")]
    pub idc: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// A session with no heartbeat for this long is evicted.
    #[serde(default = "default_session_expired_ms")]
    pub expired_ms: u64,
    /// Cadence of the unacknowledged-delivery expiry sweep.
    #[serde(default = "default_unack_sweep_ms")]
    pub unack_expired_sweep_ms: u64,
    /// Outbound channel depth per session.
    #[serde(default = "default_downstream_buffer")]
    pub downstream_buffer: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// Deliveries with no eligible session are returned to the backend at
    /// most this many times before being dropped.
    #[serde(default = "default_send_back_max_times")]
    pub send_back_max_times: u32,
    /// Unacknowledged deliveries expire after this long.
    #[serde(default = "default_msg_ttl_ms")]
    pub msg_ttl_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ShutdownConfig {
    /// Pause between shutdown phases so in-flight work settles.
    #[serde(default = "default_grace_interval_ms")]
    pub grace_interval_ms: u64,
    /// Pause after the last group teardown before the process exits.
    #[serde(default = "default_final_pause_ms")]
    pub final_pause_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryConfig {
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

impl Config {
    /// Load configuration from a path resolved via MESHBUS_CONFIG, falling
    /// back to built-in defaults when neither is present.
    pub fn load_from_env() -> Result<Self> {
        match std::env::var("MESHBUS_CONFIG") {
            Ok(path) => Self::load(PathBuf::from(path)),
            Err(_) => Ok(Self::default()),
        }
    }

    /// Load configuration from a specific TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path_ref = path.as_ref();
        let data = fs::read_to_string(path_ref)
            .with_context(|| format!("unable to read config {}", path_ref.display()))?;
        let cfg: Self = toml::from_str(&data)
            .with_context(|| format!("invalid TOML config {}", path_ref.display()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Schema-level invariants checked before startup.
    pub fn validate(&self) -> Result<()> {
        if self.server.env.is_empty() {
            bail!("server.env must be non-empty");
        }
        if self.server.cluster.is_empty() {
            bail!("server.cluster must be non-empty");
        }
        if self.session.expired_ms == 0 {
            bail!("session.expired_ms must be > 0");
        }
        if self.session.unack_expired_sweep_ms == 0 {
            bail!("session.unack_expired_sweep_ms must be > 0");
        }
        if self.session.downstream_buffer == 0 {
            bail!("session.downstream_buffer must be > 0");
        }
        if self.queue.msg_ttl_ms == 0 {
            bail!("queue.msg_ttl_ms must be > 0");
        }
        Ok(())
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            ip: default_server_ip(),
            cluster: default_cluster(),
            env: default_env(),
            idc: default_idc(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            expired_ms: default_session_expired_ms(),
            unack_expired_sweep_ms: default_unack_sweep_ms(),
            downstream_buffer: default_downstream_buffer(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            send_back_max_times: default_send_back_max_times(),
            msg_ttl_ms: default_msg_ttl_ms(),
        }
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            grace_interval_ms: default_grace_interval_ms(),
            final_pause_ms: default_final_pause_ms(),
        }
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_filter: default_log_filter(),
        }
    }
}

fn default_server_ip() -> String {
    "127.0.0.1".into()
}

fn default_cluster() -> String {
    "default".into()
}

fn default_env() -> String {
    "prd".into()
}

fn default_idc() -> String {
    "idc0".into()
}

const fn default_session_expired_ms() -> u64 {
    60_000
}

const fn default_unack_sweep_ms() -> u64 {
    5_000
}

const fn default_downstream_buffer() -> usize {
    1_024
}

const fn default_send_back_max_times() -> u32 {
    3
}

const fn default_msg_ttl_ms() -> u64 {
    120_000
}

const fn default_grace_interval_ms() -> u64 {
    1_000
}

const fn default_final_pause_ms() -> u64 {
    1_000
}

fn default_log_filter() -> String {
    "info".into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn defaults_are_valid() {
        let cfg = Config::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.session.expired_ms, 60_000);
        assert_eq!(cfg.queue.send_back_max_times, 3);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let cfg: Config = toml::from_str(
            r#"
[server]
env = "dev"

[session]
expired_ms = 5000
"#,
        )
        .unwrap();
        assert_eq!(cfg.server.env, "dev");
        assert_eq!(cfg.server.cluster, "default");
        assert_eq!(cfg.session.expired_ms, 5_000);
        assert_eq!(cfg.session.downstream_buffer, 1_024);
    }

    #[test]
    fn zero_expiry_rejected() {
        let cfg: Config = toml::from_str("[session]\nexpired_ms = 0\n").unwrap();
        let err = cfg.validate().unwrap_err();
        assert!(format!("{err:?}").contains("expired_ms"));
    }

    #[test]
    fn load_reads_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("meshbus.toml");
        fs::write(&path, "[server]\ncluster = \"east\"\n").unwrap();
        let cfg = Config::load(&path).unwrap();
        assert_eq!(cfg.server.cluster, "east");
    }

    #[test]
    fn load_missing_file_fails() {
        let dir = tempdir().unwrap();
        assert!(Config::load(dir.path().join("nope.toml")).is_err());
    }
}
