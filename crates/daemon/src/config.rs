//! Daemon configuration

use anyhow::{anyhow, Context, Result};
use cni_lib::models::PortDefaults;
use cni_lib::openstack::OpenStackConfig;
use cni_lib::server::ReaperConfig;
use config::builder::DefaultState;
use config::{ConfigBuilder, Environment, File};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

/// Daemon configuration, read from `CNI_*` variables
#[derive(Debug, Clone, Deserialize)]
pub struct DaemonConfig {
    /// URL the plugin uses to reach the daemon; the daemon listens on its host:port
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// Deadline for a single CNI command
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Timeout for each OpenStack API call
    #[serde(default = "default_cloud_timeout")]
    pub cloud_timeout_secs: u64,

    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_secs: u64,

    #[serde(default = "default_reap_interval")]
    pub reap_interval_secs: u64,

    #[serde(default = "default_min_port_age")]
    pub min_port_age_secs: u64,

    #[serde(default)]
    pub skip_reaping: bool,

    /// Log reapable ports instead of deleting them
    #[serde(default)]
    pub skip_reap_delete: bool,

    /// Host proc filesystem mount; enables the reaper's namespace check
    #[serde(default)]
    pub proc_mount: Option<PathBuf>,

    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    #[serde(default = "default_port_name")]
    pub port_name: String,

    #[serde(default)]
    pub port_device_owner: String,

    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_api_url() -> String {
    "http://127.0.0.1:4242".to_string()
}

fn default_request_timeout() -> u64 {
    60
}

fn default_cloud_timeout() -> u64 {
    30
}

fn default_cache_ttl() -> u64 {
    300
}

fn default_reap_interval() -> u64 {
    300
}

fn default_min_port_age() -> u64 {
    300
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("/host/etc/cni/net.d/openstack-cni-state")
}

fn default_port_name() -> String {
    "openstack-cni".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Optional settings file named by `CNI_CONFIG_FILE`, format from its extension
fn with_config_file(builder: ConfigBuilder<DefaultState>) -> ConfigBuilder<DefaultState> {
    match std::env::var("CNI_CONFIG_FILE") {
        Ok(path) if !path.is_empty() => builder.add_source(File::with_name(&path).required(false)),
        _ => builder,
    }
}

impl DaemonConfig {
    /// Load configuration from the optional config file and environment
    pub fn load() -> Result<Self> {
        let builder = with_config_file(config::Config::builder())
            .add_source(Environment::with_prefix("CNI"));
        Self::from_builder(builder)
    }

    fn from_builder(builder: ConfigBuilder<DefaultState>) -> Result<Self> {
        builder
            .build()
            .context("failed to read daemon configuration")?
            .try_deserialize()
            .context("invalid daemon configuration")
    }

    /// `host:port` taken from `api_url`
    pub fn listen_addr(&self) -> Result<String> {
        let url = Url::parse(&self.api_url)
            .with_context(|| format!("invalid CNI_API_URL {}", self.api_url))?;
        let host = url
            .host_str()
            .ok_or_else(|| anyhow!("CNI_API_URL {} has no host", self.api_url))?;
        let port = url
            .port_or_known_default()
            .ok_or_else(|| anyhow!("CNI_API_URL {} has no port", self.api_url))?;
        Ok(format!("{}:{}", host, port))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn cloud_timeout(&self) -> Duration {
        Duration::from_secs(self.cloud_timeout_secs)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn reaper(&self) -> ReaperConfig {
        ReaperConfig {
            interval: Duration::from_secs(self.reap_interval_secs),
            min_port_age: Duration::from_secs(self.min_port_age_secs),
            skip_delete: self.skip_reap_delete,
            proc_mount: self.proc_mount.clone(),
        }
    }

    /// Ports land in the authenticated project unless the network config names one
    pub fn port_defaults(&self) -> PortDefaults {
        PortDefaults {
            port_name: self.port_name.clone(),
            project_name: None,
            device_owner: (!self.port_device_owner.is_empty())
                .then(|| self.port_device_owner.clone()),
        }
    }
}

/// OpenStack credentials, read from the standard `OS_*` variables
pub fn load_openstack() -> Result<OpenStackConfig> {
    config::Config::builder()
        .add_source(Environment::with_prefix("OS"))
        .build()
        .context("failed to read OpenStack configuration")?
        .try_deserialize()
        .context("OS_AUTH_URL, OS_USERNAME, OS_PASSWORD and OS_PROJECT_NAME must be set")
}
