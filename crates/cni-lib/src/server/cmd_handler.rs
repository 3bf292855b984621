//! ADD, DEL and CHECK handling on the daemon side
//!
//! Turns a [`CniCommand`] into port manager calls and projects the resulting
//! cloud resources into a CNI result.

use crate::cni::{CniResult, Dns, Interface, IpConfig, Route, CNI_VERSION};
use crate::models::{CniCommand, CniContext, PortDefaults};
use crate::openstack::{
    PortError, PortManager, SetupPortError, SetupPortOpts, SetupPortResult, TearDownPortOpts,
};
use crate::server::port_tags::PortTags;
use crate::state::FileStateStore;
use async_trait::async_trait;
use ipnetwork::IpNetwork;
use std::net::IpAddr;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("invalid network configuration: {0}")]
    InvalidConfig(#[from] serde_json::Error),

    #[error("setup port result is incomplete")]
    IncompletePortResult,

    #[error("invalid address {value}: {reason}")]
    InvalidAddress { value: String, reason: String },

    #[error("failed to set up port: {0}")]
    Setup(#[from] SetupPortError),

    #[error("failed to tear down port: {0}")]
    Teardown(#[from] PortError),
}

/// Handles the three CNI verbs
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn add(&self, cmd: CniCommand) -> Result<CniResult, HandlerError>;

    async fn del(&self, cmd: CniCommand) -> Result<(), HandlerError>;

    async fn check(&self, cmd: CniCommand) -> Result<(), HandlerError>;
}

/// [`CommandHandler`] backed by a [`PortManager`]
pub struct CniCommandHandler {
    port_manager: PortManager,
    hostname: String,
    defaults: PortDefaults,
    state_store: Option<FileStateStore>,
}

impl CniCommandHandler {
    pub fn new(port_manager: PortManager, hostname: impl Into<String>, defaults: PortDefaults) -> Self {
        Self {
            port_manager,
            hostname: hostname.into(),
            defaults,
            state_store: None,
        }
    }

    /// Interface records used to recover the netns when DEL arrives without one
    pub fn with_state_store(mut self, store: FileStateStore) -> Self {
        self.state_store = Some(store);
        self
    }

    /// Fill in an empty netns from the record written after ADD
    async fn recover_netns(&self, cmd: &mut CniCommand) {
        if !cmd.netns.is_empty() {
            return;
        }
        let Some(store) = &self.state_store else {
            return;
        };
        match store.get(&cmd.container_id, &cmd.ifname).await {
            Ok(info) => {
                debug!(
                    container_id = %cmd.container_id,
                    ifname = %cmd.ifname,
                    netns = %info.netns,
                    "Recovered netns from interface state"
                );
                cmd.netns = info.netns;
            }
            Err(err) => warn!(
                container_id = %cmd.container_id,
                ifname = %cmd.ifname,
                error = %err,
                "DEL without netns and no usable interface state"
            ),
        }
    }

    fn context(&self, cmd: CniCommand) -> Result<CniContext, HandlerError> {
        Ok(CniContext::new(cmd, self.hostname.clone(), &self.defaults)?)
    }

    async fn teardown(&self, mut cmd: CniCommand) -> Result<(), HandlerError> {
        self.recover_netns(&mut cmd).await;
        let tags = PortTags::new(&cmd, &self.hostname).neutron_tags();
        let ctx = self.context(cmd)?;
        self.port_manager
            .teardown_port(&TearDownPortOpts::from_context(&ctx, tags))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl CommandHandler for CniCommandHandler {
    async fn add(&self, cmd: CniCommand) -> Result<CniResult, HandlerError> {
        let tags = PortTags::new(&cmd, &self.hostname).neutron_tags();
        let ctx = self.context(cmd)?;

        let result = self
            .port_manager
            .setup_port(&SetupPortOpts::from_context(&ctx, tags))
            .await?;

        let cni_result = project_to_cni_result(&result, &ctx.command)?;
        info!(
            container_id = %ctx.command.container_id,
            ifname = %ctx.command.ifname,
            address = ?cni_result.primary_ip(),
            "Port ready"
        );
        Ok(cni_result)
    }

    /// Failures are logged and swallowed so the runtime's cleanup is never blocked
    async fn del(&self, cmd: CniCommand) -> Result<(), HandlerError> {
        let container_id = cmd.container_id.clone();
        let ifname = cmd.ifname.clone();

        if let Err(err) = self.teardown(cmd).await {
            warn!(
                container_id = %container_id,
                ifname = %ifname,
                hostname = %self.hostname,
                error = %err,
                "Failed to tear down port"
            );
        }
        Ok(())
    }

    async fn check(&self, _cmd: CniCommand) -> Result<(), HandlerError> {
        Ok(())
    }
}

fn invalid_address(value: &str, reason: impl ToString) -> HandlerError {
    HandlerError::InvalidAddress {
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

/// Build the CNI result for a fully set up port
///
/// Attachment, network, port and subnet must all be present.
pub fn project_to_cni_result(
    result: &SetupPortResult,
    cmd: &CniCommand,
) -> Result<CniResult, HandlerError> {
    let (Some(attachment), Some(_), Some(port), Some(subnet)) = (
        &result.attachment,
        &result.network,
        &result.port,
        &result.subnet,
    ) else {
        return Err(HandlerError::IncompletePortResult);
    };

    let fixed_ip = port
        .fixed_ips
        .first()
        .ok_or_else(|| invalid_address(&port.id, "port has no fixed ips"))?;
    let ip: IpAddr = fixed_ip
        .ip_address
        .parse()
        .map_err(|e| invalid_address(&fixed_ip.ip_address, e))?;
    let cidr: IpNetwork = subnet
        .cidr
        .parse()
        .map_err(|e| invalid_address(&subnet.cidr, e))?;
    let address = IpNetwork::new(ip, cidr.prefix()).map_err(|e| invalid_address(&subnet.cidr, e))?;

    let gateway = match subnet.gateway_ip.as_deref().filter(|g| !g.is_empty()) {
        Some(gw) => Some(gw.parse::<IpAddr>().map_err(|e| invalid_address(gw, e))?),
        None => None,
    };

    let routes = subnet
        .host_routes
        .iter()
        .filter_map(|route| {
            let dst = route.destination.parse::<IpNetwork>();
            let gw = route.nexthop.parse::<IpAddr>();
            match (dst, gw) {
                (Ok(dst), Ok(gw)) => Some(Route { dst, gw: Some(gw) }),
                _ => {
                    warn!(
                        subnet_id = %subnet.id,
                        destination = %route.destination,
                        nexthop = %route.nexthop,
                        "Skipping unparsable host route"
                    );
                    None
                }
            }
        })
        .collect();

    let version = if ip.is_ipv4() { "4" } else { "6" };

    Ok(CniResult {
        cni_version: CNI_VERSION.to_string(),
        interfaces: vec![Interface {
            name: cmd.ifname.clone(),
            mac: attachment.mac_addr.clone(),
            sandbox: cmd.netns.clone(),
        }],
        ips: vec![IpConfig {
            version: Some(version.to_string()),
            interface: Some(0),
            address,
            gateway,
        }],
        routes,
        dns: Dns {
            nameservers: subnet.dns_nameservers.clone(),
            ..Default::default()
        },
    })
}
