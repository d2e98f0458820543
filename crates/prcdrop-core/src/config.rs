//! PrcDrop configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{PrcDropError, Result};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PrcDropConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub selectors: SelectorsConfig,
    #[serde(default)]
    pub email: EmailConfig,
    #[serde(default)]
    pub probe: ProbeConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
}

impl PrcDropConfig {
    /// Load config from the default path (~/.prcdrop/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| PrcDropError::Config(format!("Failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| PrcDropError::Config(format!("Failed to parse config: {e}")))?;
        Ok(config)
    }

    /// Save config to a specific path.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| PrcDropError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the PrcDrop home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".prcdrop")
    }
}

/// Expand `~` in a configured path.
pub fn expand_path(p: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(p).to_string())
}

/// HTTP gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_host")]
    pub host: String,
    /// Origin allowed by CORS (the public front end).
    #[serde(default = "default_cors_origin")]
    pub cors_origin: String,
}

fn default_port() -> u16 { 8000 }
fn default_host() -> String { "0.0.0.0".into() }
fn default_cors_origin() -> String { "https://prcdrop.co.za".into() }

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
            cors_origin: default_cors_origin(),
        }
    }
}

/// Backoff shape for failed probes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RetryBackoff {
    #[default]
    Fixed,
    Exponential,
}

/// Scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
    /// Maximum concurrently running probes.
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,
    /// Interval between successful checks that saw no drop.
    #[serde(default = "default_recheck_interval")]
    pub recheck_interval_secs: u64,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,
    #[serde(default)]
    pub retry_backoff: RetryBackoff,
    /// Cap for exponential backoff.
    #[serde(default = "default_retry_max_delay")]
    pub retry_max_delay_secs: u64,
    /// Delivery attempts for a price-drop alert.
    #[serde(default = "default_notify_attempts")]
    pub notify_attempts: u32,
    #[serde(default = "default_notify_retry_delay")]
    pub notify_retry_delay_secs: u64,
    /// How often the store is swept for due checks the queue missed.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

fn default_db_path() -> String { "~/.prcdrop/subscriptions.db".into() }
fn default_workers() -> usize { 4 }
fn default_probe_timeout() -> u64 { 60 }
fn default_recheck_interval() -> u64 { 20 * 60 }
fn default_retry_delay() -> u64 { 5 * 60 }
fn default_max_failures() -> u32 { 5 }
fn default_retry_max_delay() -> u64 { 60 * 60 }
fn default_notify_attempts() -> u32 { 3 }
fn default_notify_retry_delay() -> u64 { 30 }
fn default_sweep_interval() -> u64 { 60 }

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            workers: default_workers(),
            probe_timeout_secs: default_probe_timeout(),
            recheck_interval_secs: default_recheck_interval(),
            retry_delay_secs: default_retry_delay(),
            max_failures: default_max_failures(),
            retry_backoff: RetryBackoff::default(),
            retry_max_delay_secs: default_retry_max_delay(),
            notify_attempts: default_notify_attempts(),
            notify_retry_delay_secs: default_notify_retry_delay(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

/// Where the price selector table lives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectorsConfig {
    #[serde(default = "default_selectors_path")]
    pub path: String,
}

fn default_selectors_path() -> String { "~/.prcdrop/price_selectors.json".into() }

impl Default for SelectorsConfig {
    fn default() -> Self {
        Self {
            path: default_selectors_path(),
        }
    }
}

/// Outbound SMTP configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailConfig {
    #[serde(default = "default_smtp_host")]
    pub smtp_host: String,
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    #[serde(default)]
    pub sender_email: String,
    #[serde(default)]
    pub sender_password: String,
    /// Operator address for "unsupported site" requests and delivery failures.
    #[serde(default)]
    pub support_email: String,
    #[serde(default)]
    pub display_name: Option<String>,
}

fn default_smtp_host() -> String { "smtp.gmail.com".into() }
fn default_smtp_port() -> u16 { 587 }

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            smtp_host: default_smtp_host(),
            smtp_port: default_smtp_port(),
            sender_email: String::new(),
            sender_password: String::new(),
            support_email: String::new(),
            display_name: None,
        }
    }
}

impl EmailConfig {
    /// True when every field needed to send mail is filled in.
    pub fn is_valid(&self) -> bool {
        !self.smtp_host.is_empty()
            && !self.sender_email.is_empty()
            && !self.sender_password.is_empty()
            && !self.support_email.is_empty()
    }
}

/// Operator escalation channel.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotifyConfig {
    /// Webhook that receives a JSON copy of every operator alert
    /// (undeliverable price-drop alerts, unsupported-site requests).
    #[serde(default)]
    pub operator_webhook: Option<String>,
}

/// HTTP probe configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeConfig {
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_user_agent() -> String {
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36".into()
}
fn default_request_timeout() -> u64 { 20 }

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            user_agent: default_user_agent(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}
