//! Count of ports this system has attached to the local server

use super::port_tags::has_marker_tag;
use crate::openstack::{CloudClient, CloudError};
use std::sync::Arc;
use tracing::warn;

pub struct PortCounter {
    client: Arc<dyn CloudClient>,
    hostname: String,
}

impl PortCounter {
    pub fn new(client: Arc<dyn CloudClient>, hostname: impl Into<String>) -> Self {
        Self {
            client,
            hostname: hostname.into(),
        }
    }

    async fn try_count(&self) -> Result<usize, CloudError> {
        let server = self.client.get_server_by_name(&self.hostname).await?;
        let ports = self.client.get_ports_by_device_id(&server.id).await?;
        Ok(ports.iter().filter(|p| has_marker_tag(&p.tags)).count())
    }

    /// Marker-tagged ports attached to this host's server, 0 when the cloud cannot be asked
    pub async fn count(&self) -> usize {
        match self.try_count().await {
            Ok(count) => count,
            Err(e) => {
                warn!(hostname = %self.hostname, error = %e, "Failed to count ports");
                0
            }
        }
    }
}
