//! relaygrid.toml configuration parser.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::retry::{PollPolicy, RetryPolicy};
use crate::secret::Secret;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetConfig {
    #[serde(default)]
    pub registry: RegistryConfig,
    pub panel: PanelConfig,
    #[serde(default)]
    pub remote: RemoteConfig,
    #[serde(default)]
    pub balancer: BalancerConfig,
    #[serde(default)]
    pub provision: ProvisionConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    #[serde(default = "default_registry_path")]
    pub path: PathBuf,
    /// Per-node lock files shared by every relayctl process. Defaults to
    /// `locks/` next to the registry file.
    #[serde(default)]
    pub lock_dir: Option<PathBuf>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            path: default_registry_path(),
            lock_dir: None,
        }
    }
}

impl RegistryConfig {
    pub fn lock_dir(&self) -> PathBuf {
        match &self.lock_dir {
            Some(dir) => dir.clone(),
            None => self
                .path
                .parent()
                .unwrap_or_else(|| Path::new("."))
                .join("locks"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PanelConfig {
    /// Base URL of the control-plane API, e.g. `https://panel:8000/api`.
    pub url: String,
    pub username: String,
    /// May be left out of the file and supplied through the environment.
    pub password: Option<Secret>,
    /// Accept self-signed panel certificates.
    #[serde(default)]
    pub insecure: bool,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    #[serde(default = "default_attempts")]
    pub attempts: u32,
    #[serde(default = "default_backoff_secs")]
    pub backoff_secs: u64,
    /// Minimum spacing between SSH connection attempts, fleet-wide.
    #[serde(default = "default_rate_limit_ms")]
    pub rate_limit_ms: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
    /// SSH keep-alive interval; 0 disables it.
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            attempts: default_attempts(),
            backoff_secs: default_backoff_secs(),
            rate_limit_ms: default_rate_limit_ms(),
            connect_timeout_secs: default_connect_timeout_secs(),
            command_timeout_secs: default_command_timeout_secs(),
            keepalive_secs: default_keepalive_secs(),
        }
    }
}

/// A static SNI route served by the main server itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MainRuleConfig {
    pub domain: String,
    /// `host:port` the main server forwards this domain to.
    pub target: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalancerConfig {
    /// Live config path on the main server.
    #[serde(default = "default_lb_config_path")]
    pub config_path: PathBuf,
    /// Live config path on every node.
    #[serde(default = "default_lb_config_path_string")]
    pub remote_config_path: String,
    /// Validator; the config path is appended as the last argument.
    #[serde(default = "default_validate_command")]
    pub validate_command: String,
    #[serde(default = "default_reload_command")]
    pub reload_command: String,
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// Port each node's proxy service is reached on, unless overridden per node.
    #[serde(default = "default_backend_port")]
    pub default_backend_port: u16,
    /// Nodes handled in parallel per sync pass. 1 keeps passes sequential.
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    #[serde(default)]
    pub main_rules: Vec<MainRuleConfig>,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            config_path: default_lb_config_path(),
            remote_config_path: default_lb_config_path_string(),
            validate_command: default_validate_command(),
            reload_command: default_reload_command(),
            listen_port: default_listen_port(),
            default_backend_port: default_backend_port(),
            max_parallel: default_max_parallel(),
            main_rules: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionConfig {
    #[serde(default = "default_cert_poll_attempts")]
    pub cert_poll_attempts: u32,
    #[serde(default = "default_cert_poll_interval_secs")]
    pub cert_poll_interval_secs: u64,
    #[serde(default = "default_verify_attempts")]
    pub verify_attempts: u32,
    #[serde(default = "default_verify_interval_secs")]
    pub verify_interval_secs: u64,
    #[serde(default = "default_cert_path")]
    pub cert_path: String,
    #[serde(default = "default_env_path")]
    pub env_path: String,
    /// Directory holding the node's compose project.
    #[serde(default = "default_service_dir")]
    pub service_dir: String,
    #[serde(default = "default_service_port")]
    pub service_port: u16,
    #[serde(default = "default_api_port")]
    pub api_port: u16,
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            cert_poll_attempts: default_cert_poll_attempts(),
            cert_poll_interval_secs: default_cert_poll_interval_secs(),
            verify_attempts: default_verify_attempts(),
            verify_interval_secs: default_verify_interval_secs(),
            cert_path: default_cert_path(),
            env_path: default_env_path(),
            service_dir: default_service_dir(),
            service_port: default_service_port(),
            api_port: default_api_port(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_monitor_interval_secs")]
    pub interval_secs: u64,
    /// Wait between a self-healing restart and the re-check.
    #[serde(default = "default_recheck_delay_secs")]
    pub recheck_delay_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_monitor_interval_secs(),
            recheck_delay_secs: default_recheck_delay_secs(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotifyConfig {
    /// Optional HTTP endpoint receiving fleet events as JSON.
    pub webhook_url: Option<String>,
}

impl FleetConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: FleetConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.panel.url.trim().is_empty() {
            anyhow::bail!("panel.url must not be empty");
        }
        if self.balancer.max_parallel == 0 {
            anyhow::bail!("balancer.max_parallel must be at least 1");
        }
        for rule in &self.balancer.main_rules {
            if !rule.target.contains(':') {
                anyhow::bail!("main rule for {} needs a host:port target", rule.domain);
            }
        }
        Ok(())
    }
}

impl PanelConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl RemoteConfig {
    /// The bounded policy shared by SSH and HTTP calls.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.attempts, Duration::from_secs(self.backoff_secs))
    }

    pub fn rate_limit(&self) -> Duration {
        Duration::from_millis(self.rate_limit_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn keepalive(&self) -> Option<Duration> {
        (self.keepalive_secs > 0).then(|| Duration::from_secs(self.keepalive_secs))
    }
}

impl ProvisionConfig {
    pub fn cert_poll(&self) -> PollPolicy {
        PollPolicy::new(
            self.cert_poll_attempts,
            Duration::from_secs(self.cert_poll_interval_secs),
        )
    }

    pub fn verify_poll(&self) -> PollPolicy {
        PollPolicy::new(
            self.verify_attempts,
            Duration::from_secs(self.verify_interval_secs),
        )
    }
}

impl MonitorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn recheck_delay(&self) -> Duration {
        Duration::from_secs(self.recheck_delay_secs)
    }
}

fn default_registry_path() -> PathBuf {
    PathBuf::from("/var/lib/relaygrid/registry.redb")
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_attempts() -> u32 {
    3
}

fn default_backoff_secs() -> u64 {
    5
}

fn default_rate_limit_ms() -> u64 {
    1000
}

fn default_command_timeout_secs() -> u64 {
    60
}

fn default_keepalive_secs() -> u64 {
    15
}

fn default_lb_config_path() -> PathBuf {
    PathBuf::from(default_lb_config_path_string())
}

fn default_lb_config_path_string() -> String {
    "/etc/haproxy/haproxy.cfg".to_string()
}

fn default_validate_command() -> String {
    "haproxy -c -f".to_string()
}

fn default_reload_command() -> String {
    "systemctl reload haproxy".to_string()
}

fn default_listen_port() -> u16 {
    443
}

fn default_backend_port() -> u16 {
    443
}

fn default_max_parallel() -> usize {
    1
}

fn default_cert_poll_attempts() -> u32 {
    30
}

fn default_cert_poll_interval_secs() -> u64 {
    2
}

fn default_verify_attempts() -> u32 {
    20
}

fn default_verify_interval_secs() -> u64 {
    3
}

fn default_cert_path() -> String {
    "/var/lib/marzban-node/ssl_client_cert.pem".to_string()
}

fn default_env_path() -> String {
    "/opt/marzban-node/.env".to_string()
}

fn default_service_dir() -> String {
    "/opt/marzban-node".to_string()
}

fn default_service_port() -> u16 {
    62050
}

fn default_api_port() -> u16 {
    62051
}

fn default_monitor_interval_secs() -> u64 {
    300
}

fn default_recheck_delay_secs() -> u64 {
    20
}
