use clap::Parser;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

/// Default location of the TOML config file.
pub const DEFAULT_CONFIG_PATH: &str = "./wedding-realtime.toml";

/// Command-line arguments. Only values actually given on the command line
/// (or through their env var) are serialized, so unset flags never mask the
/// TOML layer.
#[derive(Parser, Serialize, Clone, Debug, Default)]
#[command(name = "wedding-realtime", version, about = "Wedding site live activity server")]
pub struct Cli {
    /// Port to listen on [default: 3001]
    #[arg(long, env = "WEDDING_PORT")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// Bind address [default: 0.0.0.0]
    #[arg(long, env = "WEDDING_BIND_ADDRESS")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind_address: Option<String>,

    /// Path to TOML config file [default: ./wedding-realtime.toml]
    #[arg(long)]
    #[serde(skip)]
    pub config: Option<String>,

    /// Enable structured JSON logging (for Docker/production)
    #[arg(long, env = "WEDDING_JSON_LOGS")]
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub json_logs: bool,

    /// Output a commented TOML config template and exit
    #[arg(long)]
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub generate_config: bool,

    /// Data directory for the activity database [default: ./data]
    #[arg(long, env = "WEDDING_DATA_DIR")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<String>,
}

/// Resolved server configuration.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Config {
    pub port: u16,
    pub bind_address: String,
    pub json_logs: bool,
    #[serde(default)]
    pub generate_config: bool,
    pub data_dir: String,

    /// Realtime tuning (loaded from [realtime] section in TOML).
    #[serde(default)]
    pub realtime: RealtimeConfig,
}

/// Connection lifecycle and fan-out tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeConfig {
    /// Seconds between heartbeat sweeps (default: 30)
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,

    /// Seconds of silence before a connection is evicted (default: 60)
    #[serde(default = "default_stale_timeout")]
    pub stale_timeout_secs: u64,

    /// Activities replayed to a new subscriber (default: 10)
    #[serde(default = "default_backfill_limit")]
    pub backfill_limit: usize,

    /// Outbound messages queued per connection before it counts as a slow consumer (default: 64)
    #[serde(default = "default_outbound_buffer")]
    pub outbound_buffer: usize,

    /// Bridge the database change feed into broadcasts (default: true)
    #[serde(default = "default_change_feed")]
    pub change_feed: bool,

    /// Milliseconds between change-feed polls (default: 1000)
    #[serde(default = "default_change_feed_poll")]
    pub change_feed_poll_ms: u64,

    /// Seconds to wait before re-opening a lost change feed (default: 5)
    #[serde(default = "default_change_feed_retry")]
    pub change_feed_retry_secs: u64,

    /// Recently published activity ids remembered for de-duplication (default: 1024)
    #[serde(default = "default_dedupe_window")]
    pub dedupe_window: usize,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 30,
            stale_timeout_secs: 60,
            backfill_limit: 10,
            outbound_buffer: 64,
            change_feed: true,
            change_feed_poll_ms: 1000,
            change_feed_retry_secs: 5,
            dedupe_window: 1024,
        }
    }
}

fn default_heartbeat_interval() -> u64 {
    30
}

fn default_stale_timeout() -> u64 {
    60
}

fn default_backfill_limit() -> usize {
    10
}

fn default_outbound_buffer() -> usize {
    64
}

fn default_change_feed() -> bool {
    true
}

fn default_change_feed_poll() -> u64 {
    1000
}

fn default_change_feed_retry() -> u64 {
    5
}

fn default_dedupe_window() -> usize {
    1024
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 3001,
            bind_address: "0.0.0.0".to_string(),
            json_logs: false,
            generate_config: false,
            data_dir: "./data".to_string(),
            realtime: RealtimeConfig::default(),
        }
    }
}

impl Config {
    /// Load config with layered precedence:
    /// built-in defaults < TOML file < env vars (WEDDING_*) < CLI args
    pub fn load() -> Result<Self, figment::Error> {
        Self::figment(Cli::parse()).extract()
    }

    fn figment(cli: Cli) -> Figment {
        let config_path = cli
            .config
            .clone()
            .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());

        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(&config_path))
            .merge(Env::prefixed("WEDDING_").split("__"))
            .merge(Serialized::defaults(cli))
    }
}

/// Generate a commented TOML config template
pub fn generate_config_template() -> String {
    r#"# Wedding Realtime Server Configuration
# Place this file at ./wedding-realtime.toml or specify with --config <path>
# All settings can be overridden via environment variables (WEDDING_PORT,
# WEDDING_REALTIME__BACKFILL_LIMIT, etc.) or CLI flags (--port, etc.)

# Server port (default: 3001)
# port = 3001

# Bind address (default: 0.0.0.0, all interfaces)
# bind_address = "0.0.0.0"

# Enable structured JSON logging for Docker/production
# json_logs = false

# Data directory for the SQLite activity database
# data_dir = "./data"

# ---- Realtime ----
# [realtime]

# Heartbeat: ping every interval, evict after stale_timeout of silence
# heartbeat_interval_secs = 30
# stale_timeout_secs = 60

# Recent activities sent right after subscribing to "activities"
# backfill_limit = 10

# Per-connection outbound queue; a full queue disconnects the client
# outbound_buffer = 64

# Change feed: broadcast rows written to the database by other services
# change_feed = true
# change_feed_poll_ms = 1000
# change_feed_retry_secs = 5

# Activity ids remembered so one write is never broadcast twice
# dedupe_window = 1024
"#
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn template_parses_to_defaults() {
        let parsed: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::string(&generate_config_template()))
            .extract()
            .unwrap();
        assert_eq!(parsed.port, 3001);
        assert_eq!(parsed.realtime.stale_timeout_secs, 60);
    }

    #[test]
    fn toml_realtime_section_overrides_defaults() {
        let toml = r#"
            port = 4000
            [realtime]
            backfill_limit = 5
        "#;
        let parsed: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::string(toml))
            .extract()
            .unwrap();
        assert_eq!(parsed.port, 4000);
        assert_eq!(parsed.realtime.backfill_limit, 5);
        assert_eq!(parsed.realtime.heartbeat_interval_secs, 30);
    }

    fn write_toml(dir: &tempfile::TempDir, contents: &str) -> String {
        let path = dir.path().join("wedding-realtime.toml");
        std::fs::write(&path, contents).unwrap();
        path.to_str().unwrap().to_string()
    }

    #[test]
    fn toml_file_values_apply_when_flags_are_absent() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_toml(
            &dir,
            r#"
                port = 4000
                data_dir = "/var/lib/wedding"
                json_logs = true
                [realtime]
                heartbeat_interval_secs = 15
            "#,
        );

        let cli = Cli::parse_from(["wedding-realtime", "--config", path.as_str()]);
        let config: Config = Config::figment(cli).extract().unwrap();

        assert_eq!(config.port, 4000);
        assert_eq!(config.data_dir, "/var/lib/wedding");
        assert!(config.json_logs);
        assert_eq!(config.bind_address, "0.0.0.0");
        assert_eq!(config.realtime.heartbeat_interval_secs, 15);
    }

    #[test]
    fn explicit_flags_override_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_toml(&dir, "port = 4000\nbind_address = \"10.0.0.1\"\n");

        let cli = Cli::parse_from(["wedding-realtime", "--config", path.as_str(), "--port", "5000"]);
        let config: Config = Config::figment(cli).extract().unwrap();

        assert_eq!(config.port, 5000);
        assert_eq!(config.bind_address, "10.0.0.1");
    }

    #[test]
    fn missing_config_file_falls_back_to_defaults() {
        let cli = Cli::parse_from(["wedding-realtime", "--config", "/nonexistent/wedding.toml"]);
        let config: Config = Config::figment(cli).extract().unwrap();

        assert_eq!(config.port, 3001);
        assert_eq!(config.data_dir, "./data");
        assert_eq!(config.realtime.backfill_limit, 10);
    }
}
