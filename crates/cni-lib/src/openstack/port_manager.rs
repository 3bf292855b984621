//! Port setup and teardown workflows
//!
//! Setup resolves the server, network, security groups and subnet, creates
//! and tags the port and plugs it into the server. Every step depends on the
//! previous one; the first failure stops the run and hands back whatever was
//! resolved so far. Teardown finds the port by its tags, unplugs it and
//! deletes it, and succeeds when there is nothing left to remove.

use super::types::*;
use super::{CloudClient, CloudError};
use crate::models::{AddressPair, CniContext};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

/// Failure of a single port workflow step
#[derive(Debug, Error)]
pub enum PortError {
    #[error("server {0} not found")]
    ServerNotFound(String),

    #[error("network {0} not found")]
    NetworkNotFound(String),

    #[error("project {0} not found")]
    ProjectNotFound(String),

    #[error("security group {0} not found")]
    SecurityGroupNotFound(String),

    #[error("subnet {name} not found in network {network_id}")]
    SubnetNotFound { name: String, network_id: String },

    #[error("port {0} has no fixed ips")]
    NoFixedIps(String),

    #[error("{step}: {source}")]
    Cloud {
        step: &'static str,
        #[source]
        source: CloudError,
    },
}

/// Setup failure together with everything resolved before it
#[derive(Debug, Error)]
#[error("{source}")]
pub struct SetupPortError {
    pub partial: Box<SetupPortResult>,
    #[source]
    pub source: PortError,
}

/// Resources gathered while setting up a port
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SetupPortResult {
    pub server: Option<Server>,
    pub network: Option<Network>,
    pub subnet: Option<Subnet>,
    pub port: Option<Port>,
    pub attachment: Option<Attachment>,
}

#[derive(Debug, Clone, Default)]
pub struct SetupPortOpts {
    pub admin_state_up: Option<bool>,
    pub allowed_address_pairs: Vec<AddressPair>,
    pub device_id: Option<String>,
    pub device_owner: Option<String>,
    /// Name of the compute server hosting this node
    pub hostname: String,
    pub mac_address: Option<String>,
    pub network_name: String,
    pub port_description: Option<String>,
    pub port_name: Option<String>,
    pub project_name: Option<String>,
    pub security_groups: Option<Vec<String>>,
    pub subnet_name: Option<String>,
    pub skip_port_attach: bool,
    pub tags: Vec<String>,
    pub tenant_id: Option<String>,
    pub value_specs: HashMap<String, String>,
    pub extra: ExtraCreatePortOpts,
}

impl SetupPortOpts {
    pub fn from_context(ctx: &CniContext, tags: Vec<String>) -> Self {
        let config = &ctx.config;
        Self {
            admin_state_up: config.admin_state_up,
            allowed_address_pairs: config.allowed_address_pairs.clone(),
            device_id: config.device_id.clone(),
            device_owner: config.device_owner.clone(),
            hostname: ctx.hostname.clone(),
            mac_address: config.mac_address.clone(),
            network_name: config.network.clone(),
            port_description: config.port_description.clone(),
            port_name: config.port_name.clone(),
            project_name: config.project_name.clone(),
            security_groups: config.security_groups.clone(),
            subnet_name: config.subnet_name.clone(),
            skip_port_attach: false,
            tags,
            tenant_id: config.tenant_id.clone(),
            value_specs: config.value_specs.clone(),
            extra: ExtraCreatePortOpts {
                port_security_enabled: config.port_security_enabled,
                host_id: config.host_id.clone(),
                vnic_type: config.vnic_type.clone(),
                profile: config.profile.clone(),
            },
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TearDownPortOpts {
    pub hostname: String,
    pub tags: Vec<String>,
    pub skip_port_detach: bool,
}

impl TearDownPortOpts {
    pub fn from_context(ctx: &CniContext, tags: Vec<String>) -> Self {
        Self {
            hostname: ctx.hostname.clone(),
            tags,
            skip_port_detach: false,
        }
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|s| !s.is_empty())
}

/// Map a lookup failure to `not_found` when it is a not-found sentinel
fn lookup_err(step: &'static str, not_found: PortError) -> impl FnOnce(CloudError) -> PortError {
    move |source| {
        if source.is_not_found() {
            not_found
        } else {
            PortError::Cloud { step, source }
        }
    }
}

fn step_err(step: &'static str) -> impl FnOnce(CloudError) -> PortError {
    move |source| PortError::Cloud { step, source }
}

/// Runs the port workflows against a cloud client
#[derive(Clone)]
pub struct PortManager {
    client: Arc<dyn CloudClient>,
}

impl PortManager {
    pub fn new(client: Arc<dyn CloudClient>) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &Arc<dyn CloudClient> {
        &self.client
    }

    /// Create, tag and attach a port
    ///
    /// On failure the error carries the partially-filled result; callers
    /// must not treat any populated field as a sign of success.
    pub async fn setup_port(&self, opts: &SetupPortOpts) -> Result<SetupPortResult, SetupPortError> {
        let mut result = SetupPortResult::default();
        match self.run_setup(opts, &mut result).await {
            Ok(()) => Ok(result),
            Err(source) => Err(SetupPortError {
                partial: Box::new(result),
                source,
            }),
        }
    }

    async fn run_setup(
        &self,
        opts: &SetupPortOpts,
        result: &mut SetupPortResult,
    ) -> Result<(), PortError> {
        let server = self
            .client
            .get_server_by_name(&opts.hostname)
            .await
            .map_err(lookup_err(
                "get server",
                PortError::ServerNotFound(opts.hostname.clone()),
            ))?;
        result.server = Some(server.clone());

        let network = self
            .client
            .get_network_by_name(&opts.network_name)
            .await
            .map_err(lookup_err(
                "get network",
                PortError::NetworkNotFound(opts.network_name.clone()),
            ))?;
        result.network = Some(network.clone());

        let security_groups = match &opts.security_groups {
            Some(names) if !names.is_empty() => {
                Some(self.resolve_security_groups(opts, names).await?)
            }
            _ => None,
        };

        let mut create = CreatePortOpts {
            network_id: network.id.clone(),
            name: opts.port_name.clone(),
            description: opts.port_description.clone(),
            admin_state_up: opts.admin_state_up.unwrap_or(true),
            mac_address: non_empty(&opts.mac_address).map(str::to_string),
            fixed_ips: Vec::new(),
            device_id: non_empty(&opts.device_id).map(str::to_string),
            device_owner: non_empty(&opts.device_owner).map(str::to_string),
            tenant_id: non_empty(&opts.tenant_id).map(str::to_string),
            security_groups,
            allowed_address_pairs: opts.allowed_address_pairs.clone(),
            value_specs: opts.value_specs.clone(),
        };

        if let Some(subnet_name) = non_empty(&opts.subnet_name) {
            let subnet = self
                .client
                .get_subnet_by_name(subnet_name, &network.id)
                .await
                .map_err(lookup_err(
                    "get subnet by name",
                    PortError::SubnetNotFound {
                        name: subnet_name.to_string(),
                        network_id: network.id.clone(),
                    },
                ))?;
            create.fixed_ips.push(FixedIpRequest {
                subnet_id: subnet.id,
            });
        }

        let extra = (!opts.extra.is_empty()).then_some(&opts.extra);
        let mut port = self
            .client
            .create_port(&create, extra)
            .await
            .map_err(step_err("create port"))?;
        info!(
            port_id = %port.id,
            network_id = %network.id,
            mac = %port.mac_address,
            "Created port"
        );
        result.port = Some(port.clone());

        if !opts.tags.is_empty() {
            self.client
                .set_port_tags(&port.id, &opts.tags)
                .await
                .map_err(step_err("set port tags"))?;
            port.tags = opts.tags.clone();
            result.port = Some(port.clone());
            debug!(port_id = %port.id, tags = ?opts.tags, "Tagged port");
        }

        let subnet_id = port
            .fixed_ips
            .first()
            .map(|ip| ip.subnet_id.clone())
            .ok_or_else(|| PortError::NoFixedIps(port.id.clone()))?;
        let subnet = self
            .client
            .get_subnet(&subnet_id)
            .await
            .map_err(step_err("get subnet"))?;
        result.subnet = Some(subnet);

        if !opts.skip_port_attach {
            let attachment = self
                .client
                .assign_port(&port.id, &server.id)
                .await
                .map_err(step_err("attach port"))?;
            info!(
                port_id = %port.id,
                server_id = %server.id,
                mac = %attachment.mac_addr,
                "Attached port to server"
            );
            result.attachment = Some(attachment);
        }

        Ok(())
    }

    /// Resolve every named group; a single miss fails the whole setup
    async fn resolve_security_groups(
        &self,
        opts: &SetupPortOpts,
        names: &[String],
    ) -> Result<Vec<String>, PortError> {
        let project_id = match non_empty(&opts.project_name) {
            Some(project_name) => {
                let project = self
                    .client
                    .get_project_by_name(project_name)
                    .await
                    .map_err(lookup_err(
                        "get project",
                        PortError::ProjectNotFound(project_name.to_string()),
                    ))?;
                Some(project.id)
            }
            None => None,
        };

        let mut ids = Vec::with_capacity(names.len());
        for name in names {
            let group = self
                .client
                .get_security_group_by_name(name, project_id.as_deref())
                .await
                .map_err(lookup_err(
                    "get security group",
                    PortError::SecurityGroupNotFound(name.clone()),
                ))?;
            ids.push(group.id);
        }

        Ok(ids)
    }

    /// Detach and delete the port carrying `opts.tags`
    ///
    /// A missing port means an earlier teardown already finished.
    pub async fn teardown_port(&self, opts: &TearDownPortOpts) -> Result<(), PortError> {
        let port = match self.client.get_port_by_tags(&opts.tags).await {
            Ok(port) => port,
            Err(CloudError::PortNotFound) => {
                info!(tags = ?opts.tags, "No port carries these tags, nothing to tear down");
                return Ok(());
            }
            Err(source) => {
                return Err(PortError::Cloud {
                    step: "get port by tags",
                    source,
                })
            }
        };

        if !opts.skip_port_detach {
            let server = self
                .client
                .get_server_by_name(&opts.hostname)
                .await
                .map_err(lookup_err(
                    "get server",
                    PortError::ServerNotFound(opts.hostname.clone()),
                ))?;
            self.client
                .detach_port(&port.id, &server.id)
                .await
                .map_err(step_err("detach port"))?;
            info!(port_id = %port.id, server_id = %server.id, "Detached port");
        }

        self.client
            .delete_port(&port.id)
            .await
            .map_err(step_err("delete port"))?;
        info!(port_id = %port.id, "Deleted port");

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::openstack::mock::MockCloudClient;

    fn setup_opts() -> SetupPortOpts {
        SetupPortOpts {
            hostname: "node-1".to_string(),
            network_name: "netA".to_string(),
            port_name: Some("openstack-cni".to_string()),
            tags: vec!["openstack-cni=true".to_string(), "host=node-1".to_string()],
            ..Default::default()
        }
    }

    fn manager() -> (Arc<MockCloudClient>, PortManager) {
        let mock = Arc::new(MockCloudClient::with_defaults());
        (mock.clone(), PortManager::new(mock))
    }

    #[tokio::test]
    async fn test_setup_port_fills_every_field() {
        let (mock, manager) = manager();

        let result = manager.setup_port(&setup_opts()).await.unwrap();

        assert_eq!(result.server.unwrap().id, "srv-1");
        assert_eq!(result.network.unwrap().id, "net-1");
        assert_eq!(result.subnet.unwrap().id, "sub-1");
        let port = result.port.unwrap();
        let attachment = result.attachment.unwrap();
        assert_eq!(attachment.port_id, port.id);
        assert_eq!(port.tags, setup_opts().tags);

        let stored = mock.port(&port.id).unwrap();
        assert_eq!(stored.tags, setup_opts().tags);
        assert_eq!(stored.device_id, "srv-1");
    }

    #[tokio::test]
    async fn test_setup_port_server_not_found() {
        let (mock, manager) = manager();
        let opts = SetupPortOpts {
            hostname: "node-9".to_string(),
            ..setup_opts()
        };

        let err = manager.setup_port(&opts).await.unwrap_err();

        assert!(matches!(err.source, PortError::ServerNotFound(ref name) if name == "node-9"));
        assert_eq!(*err.partial, SetupPortResult::default());
        assert_eq!(mock.calls("create_port"), 0);
    }

    #[tokio::test]
    async fn test_setup_port_returns_partial_result() {
        let (mock, manager) = manager();
        let opts = SetupPortOpts {
            network_name: "netB".to_string(),
            ..setup_opts()
        };

        let err = manager.setup_port(&opts).await.unwrap_err();

        assert!(matches!(err.source, PortError::NetworkNotFound(_)));
        assert_eq!(err.partial.server.as_ref().unwrap().id, "srv-1");
        assert!(err.partial.network.is_none());
        assert!(err.partial.port.is_none());
        assert_eq!(mock.calls("create_port"), 0);
    }

    #[tokio::test]
    async fn test_setup_port_resolves_security_groups_in_order() {
        let (mock, manager) = manager();
        mock.add_project("proj-1", "tenant-a");
        mock.add_security_group("sg-1", "web", "proj-1");
        mock.add_security_group("sg-2", "ssh", "proj-1");
        let opts = SetupPortOpts {
            project_name: Some("tenant-a".to_string()),
            security_groups: Some(vec!["ssh".to_string(), "web".to_string()]),
            ..setup_opts()
        };

        manager.setup_port(&opts).await.unwrap();

        assert_eq!(mock.calls("get_project_by_name"), 1);
        assert_eq!(mock.calls("get_security_group_by_name"), 2);
    }

    #[tokio::test]
    async fn test_setup_port_empty_security_groups_skip_lookups() {
        let (mock, manager) = manager();
        let opts = SetupPortOpts {
            project_name: Some("unknown-project".to_string()),
            security_groups: Some(vec![]),
            ..setup_opts()
        };

        let result = manager.setup_port(&opts).await.unwrap();

        assert!(result.port.is_some());
        assert_eq!(mock.calls("get_project_by_name"), 0);
        assert_eq!(mock.calls("get_security_group_by_name"), 0);
    }

    #[tokio::test]
    async fn test_setup_port_fails_on_any_missing_security_group() {
        let (mock, manager) = manager();
        mock.add_security_group("sg-1", "web", "");
        let opts = SetupPortOpts {
            security_groups: Some(vec!["web".to_string(), "missing".to_string()]),
            ..setup_opts()
        };

        let err = manager.setup_port(&opts).await.unwrap_err();

        assert!(matches!(err.source, PortError::SecurityGroupNotFound(ref name) if name == "missing"));
        assert_eq!(mock.calls("create_port"), 0);
        assert!(mock.ports().is_empty());
    }

    #[tokio::test]
    async fn test_setup_port_pins_subnet() {
        let (mock, manager) = manager();
        mock.add_subnet(Subnet {
            id: "sub-2".to_string(),
            name: "subB".to_string(),
            network_id: "net-1".to_string(),
            cidr: "10.1.0.0/24".to_string(),
            gateway_ip: None,
            dns_nameservers: vec![],
            host_routes: vec![],
        });
        let opts = SetupPortOpts {
            subnet_name: Some("subB".to_string()),
            ..setup_opts()
        };

        let result = manager.setup_port(&opts).await.unwrap();

        assert_eq!(result.subnet.unwrap().id, "sub-2");
        assert_eq!(result.port.unwrap().fixed_ips[0].subnet_id, "sub-2");
    }

    #[tokio::test]
    async fn test_setup_port_unknown_subnet() {
        let (_mock, manager) = manager();
        let opts = SetupPortOpts {
            subnet_name: Some("nope".to_string()),
            ..setup_opts()
        };

        let err = manager.setup_port(&opts).await.unwrap_err();
        assert!(matches!(err.source, PortError::SubnetNotFound { .. }));
        assert!(err.partial.network.is_some());
    }

    #[tokio::test]
    async fn test_setup_port_skip_attach() {
        let (mock, manager) = manager();
        let opts = SetupPortOpts {
            skip_port_attach: true,
            ..setup_opts()
        };

        let result = manager.setup_port(&opts).await.unwrap();

        assert!(result.attachment.is_none());
        assert!(result.subnet.is_some());
        assert_eq!(mock.calls("assign_port"), 0);
    }

    #[tokio::test]
    async fn test_setup_port_attach_failure_keeps_created_port() {
        let (mock, manager) = manager();
        mock.fail_on("assign_port", "nova unavailable");

        let err = manager.setup_port(&setup_opts()).await.unwrap_err();

        assert!(matches!(err.source, PortError::Cloud { step: "attach port", .. }));
        assert!(err.partial.port.is_some());
        assert!(err.partial.subnet.is_some());
        assert!(err.partial.attachment.is_none());
    }

    #[tokio::test]
    async fn test_teardown_without_port_is_ok() {
        let (mock, manager) = manager();
        let opts = TearDownPortOpts {
            hostname: "node-1".to_string(),
            tags: vec!["containerid=deadbeef".to_string()],
            skip_port_detach: false,
        };

        manager.teardown_port(&opts).await.unwrap();

        assert_eq!(mock.calls("detach_port"), 0);
        assert_eq!(mock.calls("delete_port"), 0);
    }

    #[tokio::test]
    async fn test_teardown_detaches_and_deletes() {
        let (mock, manager) = manager();
        let created = manager.setup_port(&setup_opts()).await.unwrap();
        let port_id = created.port.unwrap().id;

        let opts = TearDownPortOpts {
            hostname: "node-1".to_string(),
            tags: setup_opts().tags,
            skip_port_detach: false,
        };
        manager.teardown_port(&opts).await.unwrap();

        assert_eq!(mock.calls("detach_port"), 1);
        assert!(mock.port(&port_id).is_none());

        // a repeated DEL finds nothing and succeeds
        manager.teardown_port(&opts).await.unwrap();
        assert_eq!(mock.calls("delete_port"), 1);
    }

    #[tokio::test]
    async fn test_teardown_skip_detach() {
        let (mock, manager) = manager();
        manager.setup_port(&setup_opts()).await.unwrap();

        let opts = TearDownPortOpts {
            hostname: "node-1".to_string(),
            tags: setup_opts().tags,
            skip_port_detach: true,
        };
        manager.teardown_port(&opts).await.unwrap();

        assert_eq!(mock.calls("detach_port"), 0);
        assert_eq!(mock.calls("get_server_by_name"), 1);
        assert!(mock.ports().is_empty());
    }

    #[tokio::test]
    async fn test_teardown_propagates_delete_failure() {
        let (mock, manager) = manager();
        manager.setup_port(&setup_opts()).await.unwrap();
        mock.fail_on("delete_port", "neutron unavailable");

        let opts = TearDownPortOpts {
            hostname: "node-1".to_string(),
            tags: setup_opts().tags,
            skip_port_detach: false,
        };
        let err = manager.teardown_port(&opts).await.unwrap_err();
        assert!(matches!(err, PortError::Cloud { step: "delete port", .. }));
    }
}
