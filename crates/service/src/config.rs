use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

pub const DEFAULT_BURP_MCP_URL: &str = "http://127.0.0.1:9876/sse";
pub const DEFAULT_OAST_SERVER_URL: &str = "https://oast.pro";

fn default_burp_mcp_url() -> String {
    DEFAULT_BURP_MCP_URL.to_string()
}

fn default_oast_server_url() -> String {
    DEFAULT_OAST_SERVER_URL.to_string()
}

fn default_replay_ttl_secs() -> u64 {
    3600
}

fn default_replay_sweep_secs() -> u64 {
    300
}

fn default_oast_ring_capacity() -> usize {
    512
}

fn default_flow_rescan_window() -> usize {
    50
}

fn default_history_page_size() -> usize {
    1000
}

/// Configuration stored in `.sectap/config.json`. Unknown fields are
/// ignored so newer daemons can read older files and vice versa.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub version: String,
    pub initialized_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub last_init_mode: Option<String>,
    #[serde(default = "default_burp_mcp_url")]
    pub burp_mcp_url: String,
    #[serde(skip_serializing_if = "std::ops::Not::not", default)]
    pub preserve_guides: bool,

    // Policy knobs; defaults apply when the file predates them.
    #[serde(default = "default_oast_server_url")]
    pub oast_server_url: String,
    #[serde(default = "default_replay_ttl_secs")]
    pub replay_ttl_secs: u64,
    #[serde(default = "default_replay_sweep_secs")]
    pub replay_sweep_secs: u64,
    #[serde(default = "default_oast_ring_capacity")]
    pub oast_ring_capacity: usize,
    #[serde(default = "default_flow_rescan_window")]
    pub flow_rescan_window: usize,
    #[serde(default = "default_history_page_size")]
    pub history_page_size: usize,
}

impl Config {
    pub fn new(version: &str) -> Self {
        Config {
            version: version.to_string(),
            initialized_at: Utc::now(),
            last_init_mode: None,
            burp_mcp_url: default_burp_mcp_url(),
            preserve_guides: false,
            oast_server_url: default_oast_server_url(),
            replay_ttl_secs: default_replay_ttl_secs(),
            replay_sweep_secs: default_replay_sweep_secs(),
            oast_ring_capacity: default_oast_ring_capacity(),
            flow_rescan_window: default_flow_rescan_window(),
            history_page_size: default_history_page_size(),
        }
    }

    /// Read and parse the config file. A missing file surfaces the
    /// underlying `NotFound` error so callers can fall back to defaults.
    pub fn load(path: &Path) -> io::Result<Config> {
        let data = std::fs::read(path)?;
        let mut cfg: Config = serde_json::from_slice(&data)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        if cfg.burp_mcp_url.is_empty() {
            cfg.burp_mcp_url = default_burp_mcp_url();
        }
        Ok(cfg)
    }

    pub fn load_or_default(path: &Path, version: &str) -> io::Result<Config> {
        match Config::load(path) {
            Ok(cfg) => Ok(cfg),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(Config::new(version)),
            Err(err) => Err(err),
        }
    }

    /// Write the config file with owner-only permissions.
    pub fn save(&self, path: &Path) -> io::Result<()> {
        let data = serde_json::to_vec_pretty(self)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        let mut opts = std::fs::OpenOptions::new();
        opts.write(true).create(true).truncate(true).mode(0o600);
        let mut file = opts.open(path)?;
        use std::io::Write;
        file.write_all(&data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_disk() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.json");

        let mut cfg = Config::new("0.1.0");
        cfg.burp_mcp_url = "http://127.0.0.1:1234/sse".into();
        cfg.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.version, "0.1.0");
        assert_eq!(loaded.burp_mcp_url, "http://127.0.0.1:1234/sse");
        assert_eq!(loaded.replay_ttl_secs, 3600);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = Config::load_or_default(&tmp.path().join("absent.json"), "9.9.9").unwrap();
        assert_eq!(cfg.version, "9.9.9");
        assert_eq!(cfg.burp_mcp_url, DEFAULT_BURP_MCP_URL);
    }

    #[test]
    fn tolerates_unknown_fields_and_fills_burp_url() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"version":"0.0.1","initialized_at":"2026-01-02T03:04:05Z","burp_mcp_url":"","mystery":42}"#,
        )
        .unwrap();

        let cfg = Config::load(&path).unwrap();
        assert_eq!(cfg.burp_mcp_url, DEFAULT_BURP_MCP_URL);
        assert_eq!(cfg.oast_ring_capacity, 512);
        assert_eq!(cfg.last_init_mode, None);
    }
}
