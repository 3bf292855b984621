//! OpenStack integration
//!
//! The rest of the crate talks to the cloud only through [`CloudClient`].
//! [`OpenStackClient`] implements it over the Keystone, Nova and Neutron REST
//! APIs, [`CachedClient`] decorates any implementation with a read-through
//! TTL cache, and [`PortManager`] drives the multi-call port workflows.

mod cache;
mod client;
mod port_manager;
mod types;

#[cfg(any(test, feature = "test-util"))]
pub mod mock;

pub use cache::{CachedClient, TtlCache};
pub use client::{OpenStackClient, OpenStackConfig};
pub use port_manager::{
    PortError, PortManager, SetupPortError, SetupPortOpts, SetupPortResult, TearDownPortOpts,
};
pub use types::*;

use async_trait::async_trait;
use thiserror::Error;

/// Errors returned by cloud clients
///
/// The `*NotFound` variants are sentinels callers branch on; everything
/// else is a transport or API failure.
#[derive(Debug, Error)]
pub enum CloudError {
    #[error("server not found")]
    ServerNotFound,

    #[error("network not found")]
    NetworkNotFound,

    #[error("port not found")]
    PortNotFound,

    #[error("project not found")]
    ProjectNotFound,

    #[error("security group not found")]
    SecurityGroupNotFound,

    #[error("subnet not found")]
    SubnetNotFound,

    #[error("{method} {url} returned {status}: {body}")]
    Api {
        method: String,
        url: String,
        status: u16,
        body: String,
    },

    #[error("request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("no {service} endpoint in the service catalog")]
    MissingEndpoint { service: String },

    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),

    #[error("failed to encode request body: {0}")]
    Encode(#[from] serde_json::Error),
}

impl CloudError {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            CloudError::ServerNotFound
                | CloudError::NetworkNotFound
                | CloudError::PortNotFound
                | CloudError::ProjectNotFound
                | CloudError::SecurityGroupNotFound
                | CloudError::SubnetNotFound
        )
    }
}

/// Capability interface over the compute, network and identity APIs
#[async_trait]
pub trait CloudClient: Send + Sync {
    /// Plug a port into a server
    async fn assign_port(&self, port_id: &str, server_id: &str) -> Result<Attachment, CloudError>;

    /// Create a port; `extra` is only sent when it carries at least one field
    async fn create_port(
        &self,
        opts: &CreatePortOpts,
        extra: Option<&ExtraCreatePortOpts>,
    ) -> Result<Port, CloudError>;

    async fn delete_port(&self, port_id: &str) -> Result<(), CloudError>;

    /// Unplug a port from a server
    async fn detach_port(&self, port_id: &str, server_id: &str) -> Result<(), CloudError>;

    /// Replace every tag on a port
    async fn set_port_tags(&self, port_id: &str, tags: &[String]) -> Result<(), CloudError>;

    async fn get_network_by_name(&self, name: &str) -> Result<Network, CloudError>;

    async fn get_port(&self, port_id: &str) -> Result<Port, CloudError>;

    async fn get_ports_by_device_id(&self, device_id: &str) -> Result<Vec<Port>, CloudError>;

    /// First port carrying all of `tags`
    async fn get_port_by_tags(&self, tags: &[String]) -> Result<Port, CloudError>;

    /// Every port carrying all of `tags`
    async fn get_ports_by_tags(&self, tags: &[String]) -> Result<Vec<Port>, CloudError>;

    async fn get_project_by_name(&self, name: &str) -> Result<Project, CloudError>;

    /// Exact-match lookup by server name
    async fn get_server_by_name(&self, name: &str) -> Result<Server, CloudError>;

    async fn get_security_group_by_name(
        &self,
        name: &str,
        project_id: Option<&str>,
    ) -> Result<SecurityGroup, CloudError>;

    async fn get_subnet(&self, subnet_id: &str) -> Result<Subnet, CloudError>;

    async fn get_subnet_by_name(&self, name: &str, network_id: &str)
        -> Result<Subnet, CloudError>;
}
