use crate::automation::config::{AutomationConfig, ConfigDraft};
use crate::scheduler::FirstPass;
use anyhow::Context;
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    /// Initial automation settings; a config saved through the API wins
    #[serde(default)]
    pub automation: ConfigDraft,
}

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// LND REST endpoint, e.g. https://localhost:8080
    pub base_url: String,
    /// Path to an admin (or fee-capable) macaroon
    pub macaroon_path: PathBuf,
    /// Path to LND's tls.cert; system roots are used when unset
    #[serde(default)]
    pub tls_cert_path: Option<PathBuf>,
    /// Skip TLS verification (self-signed test nodes only)
    #[serde(default)]
    pub accept_invalid_certs: bool,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Bound on each channel's graph edge lookup; a late edge leaves only
    /// that channel without a known policy
    #[serde(default = "default_edge_timeout")]
    pub edge_timeout_secs: u64,
    /// Maximum concurrent requests against LND
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
}

#[derive(Debug, Deserialize)]
pub struct GeneralConfig {
    /// Path to the SQLite database
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Address of the HTTP control API
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Start fee automation as soon as the daemon is up
    #[serde(default)]
    pub autostart: bool,
    /// Dry-run mode: log decisions but never touch the node
    #[serde(default)]
    pub dry_run: bool,
}

#[derive(Debug, Deserialize)]
pub struct EngineConfig {
    /// Bound on fetching the channel list
    #[serde(default = "default_provider_timeout")]
    pub provider_timeout_secs: u64,
    /// Bound on a single fee-update call
    #[serde(default = "default_update_timeout")]
    pub update_timeout_secs: u64,
    /// Bound on all retries for one channel
    #[serde(default = "default_channel_timeout")]
    pub channel_timeout_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
    #[serde(default = "default_max_concurrent_updates")]
    pub max_concurrent_updates: usize,
    /// Run the first pass right after start, or one interval later
    #[serde(default)]
    pub first_pass: FirstPass,
}

// Default value functions
fn default_request_timeout() -> u64 {
    30
}
fn default_edge_timeout() -> u64 {
    5
}
fn default_max_in_flight() -> usize {
    8
}
fn default_database_path() -> PathBuf {
    PathBuf::from("lnd-feeboss.db")
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_listen_addr() -> String {
    "127.0.0.1:5000".to_string()
}
fn default_provider_timeout() -> u64 {
    30
}
fn default_update_timeout() -> u64 {
    15
}
fn default_channel_timeout() -> u64 {
    60
}
fn default_max_attempts() -> u32 {
    3
}
fn default_retry_base_ms() -> u64 {
    1000
}
fn default_max_concurrent_updates() -> usize {
    4
}

// Default implementations
impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            log_level: default_log_level(),
            listen_addr: default_listen_addr(),
            autostart: false,
            dry_run: false,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            provider_timeout_secs: default_provider_timeout(),
            update_timeout_secs: default_update_timeout(),
            channel_timeout_secs: default_channel_timeout(),
            max_attempts: default_max_attempts(),
            retry_base_ms: default_retry_base_ms(),
            max_concurrent_updates: default_max_concurrent_updates(),
            first_pass: FirstPass::Immediate,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config at {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config at {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.server.base_url.trim().is_empty() {
            anyhow::bail!("server.base_url must not be empty");
        }
        if self.server.edge_timeout_secs == 0 {
            anyhow::bail!("server.edge_timeout_secs must be greater than zero");
        }
        if self.server.max_in_flight == 0 {
            anyhow::bail!("server.max_in_flight must be at least 1");
        }
        if self.engine.provider_timeout_secs == 0
            || self.engine.update_timeout_secs == 0
            || self.engine.channel_timeout_secs == 0
        {
            anyhow::bail!("engine timeouts must be greater than zero");
        }
        if self.engine.channel_timeout_secs < self.engine.update_timeout_secs {
            anyhow::bail!(
                "channel_timeout_secs ({}) below update_timeout_secs ({})",
                self.engine.channel_timeout_secs,
                self.engine.update_timeout_secs
            );
        }
        if self.engine.max_attempts == 0 {
            anyhow::bail!("engine.max_attempts must be at least 1");
        }
        if self.engine.max_concurrent_updates == 0 {
            anyhow::bail!("engine.max_concurrent_updates must be at least 1");
        }
        if self.general.listen_addr.parse::<std::net::SocketAddr>().is_err() {
            anyhow::bail!(
                "general.listen_addr ({}) is not a socket address",
                self.general.listen_addr
            );
        }
        self.initial_automation()?;
        if !self.server.macaroon_path.exists() {
            anyhow::bail!(
                "Macaroon not found at: {}",
                self.server.macaroon_path.display()
            );
        }
        Ok(())
    }

    /// The `[automation]` table as a validated config.
    pub fn initial_automation(&self) -> anyhow::Result<AutomationConfig> {
        self.automation
            .clone()
            .validate()
            .context("Invalid [automation] section")
    }

    /// Create a config with all defaults for testing purposes.
    /// The macaroon path is set to the provided path (must exist for validation).
    #[cfg(test)]
    pub fn test_default(macaroon_path: PathBuf) -> Self {
        Self {
            server: ServerConfig {
                base_url: "https://localhost:8080".to_string(),
                macaroon_path,
                tls_cert_path: None,
                accept_invalid_certs: false,
                request_timeout_secs: default_request_timeout(),
                edge_timeout_secs: default_edge_timeout(),
                max_in_flight: default_max_in_flight(),
            },
            general: GeneralConfig::default(),
            engine: EngineConfig::default(),
            automation: ConfigDraft::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fees::Strategy;
    use std::io::Write;

    fn make_valid_config() -> Config {
        // /dev/null always exists on macOS/Linux
        Config::test_default(PathBuf::from("/dev/null"))
    }

    #[test]
    fn test_validate_defaults_pass() {
        let config = make_valid_config();
        assert!(config.validate().is_ok(), "{}", config.validate().unwrap_err());
    }

    #[test]
    fn test_validate_empty_base_url() {
        let mut config = make_valid_config();
        config.server.base_url = "  ".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("base_url"));
    }

    #[test]
    fn test_validate_zero_timeouts() {
        let mut config = make_valid_config();
        config.engine.update_timeout_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_channel_timeout_below_call_timeout() {
        let mut config = make_valid_config();
        config.engine.update_timeout_secs = 30;
        config.engine.channel_timeout_secs = 10;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("channel_timeout_secs"));
    }

    #[test]
    fn test_validate_zero_edge_timeout() {
        let mut config = make_valid_config();
        config.server.edge_timeout_secs = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("edge_timeout_secs"));
    }

    #[test]
    fn test_validate_zero_attempts_and_concurrency() {
        let mut config = make_valid_config();
        config.engine.max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = make_valid_config();
        config.engine.max_concurrent_updates = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_bad_listen_addr() {
        let mut config = make_valid_config();
        config.general.listen_addr = "localhost".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("listen_addr"));
    }

    #[test]
    fn test_validate_bad_automation_section() {
        let mut config = make_valid_config();
        config.automation.update_interval_secs = 5;
        let err = config.validate().unwrap_err();
        assert!(format!("{:#}", err).contains("update_interval_secs"));
    }

    #[test]
    fn test_validate_macaroon_missing() {
        let mut config = make_valid_config();
        config.server.macaroon_path = PathBuf::from("/nonexistent/admin.macaroon");
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("Macaroon not found"));
    }

    #[test]
    fn test_toml_deserialize_minimal() {
        let toml_str = r#"
[server]
base_url = "https://localhost:8080"
macaroon_path = "/tmp/admin.macaroon"
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.base_url, "https://localhost:8080");
        // Defaults should be applied
        assert!(config.server.tls_cert_path.is_none());
        assert_eq!(config.server.edge_timeout_secs, 5);
        assert_eq!(config.general.listen_addr, "127.0.0.1:5000");
        assert!(!config.general.autostart);
        assert_eq!(config.engine.max_attempts, 3);
        assert_eq!(config.engine.first_pass, FirstPass::Immediate);
        assert_eq!(config.automation, ConfigDraft::default());
    }

    #[test]
    fn test_toml_partial_automation_section() {
        let toml_str = r#"
[server]
base_url = "https://localhost:8080"
macaroon_path = "/tmp/admin.macaroon"

[automation]
strategy = "profitable"
update_interval_secs = 600
excluded_channels = ["42"]
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        let automation = config.initial_automation().unwrap();
        assert_eq!(automation.strategy, Strategy::Profitable);
        assert_eq!(automation.update_interval_secs, 600);
        assert!(automation.is_excluded("42"));
        // Untouched fields keep their defaults
        assert_eq!(automation.max_fee_rate, 1000);
    }

    #[test]
    fn test_toml_unknown_automation_key_rejected() {
        let toml_str = r#"
[server]
base_url = "https://localhost:8080"
macaroon_path = "/tmp/admin.macaroon"

[automation]
fee_multiplier = 2
"#;
        assert!(toml::from_str::<Config>(toml_str).is_err());
    }

    #[test]
    fn test_load_from_file() {
        let macaroon = tempfile::NamedTempFile::new().unwrap();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            "[server]\nbase_url = \"https://127.0.0.1:8080\"\nmacaroon_path = \"{}\"\n\n[general]\ndry_run = true\n",
            macaroon.path().display()
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert!(config.general.dry_run);
        assert_eq!(config.server.macaroon_path, macaroon.path());
    }

    #[test]
    fn test_load_missing_file() {
        let err = Config::load(Path::new("/nonexistent/lnd-feeboss.toml")).unwrap_err();
        assert!(err.to_string().contains("Failed to read config"));
    }
}
