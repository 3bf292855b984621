//! Plugin configuration

use anyhow::{Context, Result};
use cni_lib::networking::{RetryPolicy, UdevWait};
use config::builder::DefaultState;
use config::{ConfigBuilder, Environment, File};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Plugin configuration, read from `CNI_*` variables
///
/// The runtime's own `CNI_COMMAND`, `CNI_NETNS`, ... share the prefix and are
/// ignored here.
#[derive(Debug, Clone, Deserialize)]
pub struct PluginConfig {
    /// Daemon base URL
    #[serde(default = "default_api_url")]
    pub api_url: String,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Append logs here; stderr when unset
    #[serde(default)]
    pub log_file: Option<PathBuf>,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default = "default_true")]
    pub wait_for_udev: bool,

    #[serde(default = "default_udev_prefix")]
    pub wait_for_udev_prefix: String,

    #[serde(default = "default_udev_delay")]
    pub wait_for_udev_delay_ms: u64,

    #[serde(default = "default_udev_timeout")]
    pub wait_for_udev_timeout_ms: u64,

    #[serde(default)]
    pub enable_netlink_retry: bool,

    #[serde(default = "default_retry_interval")]
    pub netlink_retry_interval_ms: u64,

    #[serde(default = "default_retry_max_wait")]
    pub netlink_retry_max_wait_ms: u64,
}

fn default_api_url() -> String {
    "http://127.0.0.1:4242".to_string()
}

fn default_request_timeout() -> u64 {
    120
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_udev_prefix() -> String {
    "eth".to_string()
}

fn default_udev_delay() -> u64 {
    100
}

fn default_udev_timeout() -> u64 {
    5000
}

fn default_retry_interval() -> u64 {
    100
}

fn default_retry_max_wait() -> u64 {
    2000
}

impl PluginConfig {
    /// Load configuration from the optional config file and environment
    pub fn load() -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Ok(path) = std::env::var("CNI_CONFIG_FILE") {
            if !path.is_empty() {
                builder = builder.add_source(File::with_name(&path).required(false));
            }
        }
        Self::from_builder(builder.add_source(Environment::with_prefix("CNI")))
    }

    fn from_builder(builder: ConfigBuilder<DefaultState>) -> Result<Self> {
        builder
            .build()
            .context("failed to read plugin configuration")?
            .try_deserialize()
            .context("invalid plugin configuration")
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn udev_wait(&self) -> UdevWait {
        UdevWait {
            enabled: self.wait_for_udev,
            prefix: self.wait_for_udev_prefix.clone(),
            delay: Duration::from_millis(self.wait_for_udev_delay_ms),
            timeout: Duration::from_millis(self.wait_for_udev_timeout_ms),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            interval: Duration::from_millis(self.netlink_retry_interval_ms),
            max_wait: Duration::from_millis(self.netlink_retry_max_wait_ms),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn from_overrides(pairs: &[(&str, &str)]) -> PluginConfig {
        let mut builder = config::Config::builder();
        for (key, value) in pairs {
            builder = builder.set_override(*key, *value).unwrap();
        }
        PluginConfig::from_builder(builder).unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = from_overrides(&[]);

        assert_eq!(config.api_url, "http://127.0.0.1:4242");
        assert_eq!(config.request_timeout(), Duration::from_secs(120));
        assert!(config.log_file.is_none());
        assert!(!config.enable_netlink_retry);

        let udev = config.udev_wait();
        assert!(udev.enabled);
        assert_eq!(udev.prefix, "eth");
        assert_eq!(udev.delay, Duration::from_millis(100));
        assert_eq!(udev.timeout, Duration::from_millis(5000));
    }

    #[test]
    fn test_overrides() {
        let config = from_overrides(&[
            ("wait_for_udev", "false"),
            ("wait_for_udev_prefix", "ens"),
            ("netlink_retry_interval_ms", "50"),
            ("netlink_retry_max_wait_ms", "1000"),
            ("log_file", "/var/log/openstack-cni.log"),
        ]);

        assert!(!config.udev_wait().enabled);
        assert_eq!(config.udev_wait().prefix, "ens");
        let policy = config.retry_policy();
        assert_eq!(policy.interval, Duration::from_millis(50));
        assert_eq!(policy.max_wait, Duration::from_millis(1000));
        assert_eq!(policy.max_backoff, RetryPolicy::default().max_backoff);
        assert_eq!(config.log_file, Some(PathBuf::from("/var/log/openstack-cni.log")));
    }

    #[test]
    fn test_runtime_variables_are_ignored() {
        let config = from_overrides(&[("command", "ADD"), ("netns", "/proc/1/ns/net")]);
        assert_eq!(config.api_url, "http://127.0.0.1:4242");
    }
}
