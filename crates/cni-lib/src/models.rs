//! Core data models shared by the daemon and the plugin
//!
//! [`CniCommand`] is the wire form of a single CNI invocation as forwarded by
//! the plugin; [`CniConfig`] is the network configuration the runtime writes
//! on the plugin's stdin; [`CniContext`] joins the two for the handlers.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

/// CNI verb carried by a command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Command {
    Add,
    Del,
    Check,
    Version,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Add => "ADD",
            Command::Del => "DEL",
            Command::Check => "CHECK",
            Command::Version => "VERSION",
        }
    }

    /// Whether the runtime must supply a network namespace for this verb
    pub fn requires_netns(&self) -> bool {
        matches!(self, Command::Add | Command::Check)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Command {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ADD" => Ok(Command::Add),
            "DEL" => Ok(Command::Del),
            "CHECK" => Ok(Command::Check),
            "VERSION" => Ok(Command::Version),
            other => Err(ValidationError::UnknownCommand(other.to_string())),
        }
    }
}

/// Inbound command rejected before any work is done
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("unknown command: {0}")]
    UnknownCommand(String),
}

/// A single CNI invocation as forwarded from the plugin to the daemon
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CniCommand {
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub container_id: String,
    #[serde(default)]
    pub netns: String,
    #[serde(default)]
    pub ifname: String,
    #[serde(default)]
    pub args: String,
    #[serde(default)]
    pub path: String,
    /// Raw network configuration from the runtime, base64 on the wire
    #[serde(default, with = "base64_bytes")]
    pub stdindata: Vec<u8>,
}

impl CniCommand {
    /// Check the required fields and resolve the verb
    ///
    /// command, container id, ifname and stdin are always required; netns is
    /// required for ADD and CHECK only.
    pub fn validate(&self) -> Result<Command, ValidationError> {
        if self.command.is_empty() {
            return Err(ValidationError::MissingField("command"));
        }
        let command: Command = self.command.parse()?;

        if self.container_id.is_empty() {
            return Err(ValidationError::MissingField("container_id"));
        }
        if self.ifname.is_empty() {
            return Err(ValidationError::MissingField("ifname"));
        }
        if self.stdindata.is_empty() {
            return Err(ValidationError::MissingField("stdindata"));
        }
        if command.requires_netns() && self.netns.is_empty() {
            return Err(ValidationError::MissingField("netns"));
        }

        Ok(command)
    }
}

impl fmt::Display for CniCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "command={} container_id={} netns={} ifname={} args={} path={}",
            self.command, self.container_id, self.netns, self.ifname, self.args, self.path
        )
    }
}

mod base64_bytes {
    use super::*;

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        match Option::<String>::deserialize(deserializer)? {
            Some(encoded) => STANDARD.decode(encoded).map_err(serde::de::Error::custom),
            None => Ok(Vec::new()),
        }
    }
}

/// Allowed address pair entry for a Neutron port
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressPair {
    pub ip_address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac_address: Option<String>,
}

/// Network configuration written by the runtime on the plugin's stdin
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CniConfig {
    #[serde(rename = "cniVersion", default)]
    pub cni_version: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub plugin_type: String,

    /// Name of the Neutron network to create the port in
    #[serde(default)]
    pub network: String,
    /// Pin the port to this subnet of the network
    #[serde(default)]
    pub subnet_name: Option<String>,
    /// Project owning the security groups
    #[serde(default)]
    pub project_name: Option<String>,
    /// Security group names, resolved in order
    #[serde(default)]
    pub security_groups: Option<Vec<String>>,
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub mac_address: Option<String>,
    #[serde(default)]
    pub admin_state_up: Option<bool>,
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub device_owner: Option<String>,
    #[serde(default)]
    pub port_name: Option<String>,
    #[serde(default)]
    pub port_description: Option<String>,
    #[serde(default)]
    pub allowed_address_pairs: Vec<AddressPair>,
    #[serde(default)]
    pub value_specs: HashMap<String, String>,

    #[serde(default = "default_port_security")]
    pub port_security_enabled: Option<bool>,
    #[serde(rename = "binding:host_id", default)]
    pub host_id: Option<String>,
    #[serde(rename = "binding:vnic_type", default)]
    pub vnic_type: Option<String>,
    #[serde(rename = "binding:profile", default)]
    pub profile: serde_json::Map<String, serde_json::Value>,
}

fn default_port_security() -> Option<bool> {
    Some(true)
}

impl CniConfig {
    /// Decode the runtime's stdin and fill the unset fields from `defaults`
    pub fn from_slice(data: &[u8], defaults: &PortDefaults) -> Result<Self, serde_json::Error> {
        let mut config: CniConfig = serde_json::from_slice(data)?;

        if config.port_name.as_deref().map_or(true, str::is_empty) {
            config.port_name = Some(defaults.port_name.clone());
        }
        if config.project_name.is_none() {
            config.project_name = defaults.project_name.clone();
        }
        if config.device_owner.is_none() {
            config.device_owner = defaults.device_owner.clone();
        }
        if config.port_security_enabled.is_none() {
            config.port_security_enabled = default_port_security();
        }

        Ok(config)
    }
}

/// Daemon-side fallbacks for fields the network configuration leaves unset
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortDefaults {
    pub port_name: String,
    pub project_name: Option<String>,
    pub device_owner: Option<String>,
}

impl Default for PortDefaults {
    fn default() -> Self {
        Self {
            port_name: "openstack-cni".to_string(),
            project_name: None,
            device_owner: None,
        }
    }
}

/// Parse the runtime's `CNI_ARGS` string (`K1=V1;K2=V2`)
///
/// Any pair that does not split into exactly one key and one value makes the
/// whole string invalid and yields an empty map.
pub fn parse_cni_args(args: &str) -> HashMap<String, String> {
    let mut parsed = HashMap::new();
    if args.is_empty() {
        return parsed;
    }

    for pair in args.split(';') {
        match pair.split_once('=') {
            Some((key, value)) if !value.contains('=') => {
                parsed.insert(key.to_string(), value.to_string());
            }
            _ => return HashMap::new(),
        }
    }

    parsed
}

/// Everything a handler needs to know about one command
#[derive(Debug, Clone)]
pub struct CniContext {
    pub command: CniCommand,
    pub args: HashMap<String, String>,
    pub config: CniConfig,
    pub hostname: String,
}

impl CniContext {
    pub fn new(
        command: CniCommand,
        hostname: impl Into<String>,
        defaults: &PortDefaults,
    ) -> Result<Self, serde_json::Error> {
        let config = CniConfig::from_slice(&command.stdindata, defaults)?;
        let args = parse_cni_args(&command.args);

        Ok(Self {
            command,
            args,
            config,
            hostname: hostname.into(),
        })
    }

    /// Kubernetes pod name from the runtime args, when present
    pub fn pod_name(&self) -> Option<&str> {
        self.args.get("K8S_POD_NAME").map(String::as_str)
    }

    /// Kubernetes pod namespace from the runtime args, when present
    pub fn pod_namespace(&self) -> Option<&str> {
        self.args.get("K8S_POD_NAMESPACE").map(String::as_str)
    }
}

/// Record of an interface bound into a container, kept by the daemon's state store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IfaceInfo {
    pub container_id: String,
    pub ifname: String,
    pub netns: String,
    pub ip_address: String,
    #[serde(default)]
    pub pod_name: String,
    #[serde(default)]
    pub namespace: String,
}
