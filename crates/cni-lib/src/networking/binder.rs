//! Hands the cloud-attached interface over to the container
//!
//! After ADD the port's device shows up on the host under whatever name
//! the kernel and udev give it. The binder waits for it by MAC, then moves
//! it into the container's namespace, renames it, addresses it and brings
//! it up.

use super::{Link, Netlink, NetlinkError};
use ipnetwork::IpNetwork;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

/// The node's primary interface, never handed to a container
pub const RESERVED_IFACE: &str = "eth0";

#[derive(Debug, Error)]
pub enum BindError {
    #[error("failed to {step} ns={netns} iface_index={index} dest_iface={dest_name} addr={address}: {source}")]
    Configure {
        step: &'static str,
        netns: String,
        index: u32,
        dest_name: String,
        address: IpNetwork,
        #[source]
        source: NetlinkError,
    },

    #[error("refusing to configure eth0 for mac {mac}")]
    ReservedInterface { mac: String },

    #[error("no interface found for mac {mac}")]
    NotFound { mac: String },

    #[error("failed to look up interface for mac {mac}: {source}")]
    Lookup {
        mac: String,
        #[source]
        source: NetlinkError,
    },

    #[error("timed out after {elapsed:?} waiting for interface with mac {mac}")]
    Timeout { mac: String, elapsed: Duration },
}

/// Target of [`InterfaceBinder::configure`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkInterface {
    /// Host-side link index
    pub index: u32,
    /// Name inside the container
    pub dest_name: String,
    pub address: IpNetwork,
}

/// How long to wait for the host device and what counts as "not settled yet"
#[derive(Debug, Clone)]
pub struct UdevWait {
    pub enabled: bool,
    /// Names still carrying this prefix have not been renamed by udev yet
    pub prefix: String,
    pub delay: Duration,
    pub timeout: Duration,
}

impl Default for UdevWait {
    fn default() -> Self {
        Self {
            enabled: true,
            prefix: "eth".to_string(),
            delay: Duration::from_millis(100),
            timeout: Duration::from_millis(5000),
        }
    }
}

pub struct InterfaceBinder {
    netlink: Arc<dyn Netlink>,
    udev: UdevWait,
}

impl InterfaceBinder {
    pub fn new(netlink: Arc<dyn Netlink>, udev: UdevWait) -> Self {
        Self { netlink, udev }
    }

    /// Wait for the interface carrying `mac` and configure it in `netns`
    pub async fn bind(
        &self,
        netns: &str,
        mac: &str,
        dest_name: &str,
        address: IpNetwork,
    ) -> Result<Link, BindError> {
        let link = self.wait_for_interface(mac).await?;
        let iface = NetworkInterface {
            index: link.index,
            dest_name: dest_name.to_string(),
            address,
        };
        self.configure(netns, &iface).await?;
        Ok(link)
    }

    /// Poll for the link carrying `mac` until udev has settled its name
    ///
    /// `eth0` fails at once. With waiting disabled the first lookup decides.
    pub async fn wait_for_interface(&self, mac: &str) -> Result<Link, BindError> {
        let start = Instant::now();

        loop {
            match self.netlink.link_by_mac(mac).await {
                Ok(Some(link)) => {
                    if link.name == RESERVED_IFACE {
                        return Err(BindError::ReservedInterface {
                            mac: mac.to_string(),
                        });
                    }
                    if !self.udev.enabled || !self.has_unsettled_name(&link) {
                        info!(mac, iface = %link.name, index = link.index, "Found interface");
                        return Ok(link);
                    }
                    debug!(
                        mac,
                        iface = %link.name,
                        prefix = %self.udev.prefix,
                        "Interface still has the udev prefix, waiting"
                    );
                }
                Ok(None) if !self.udev.enabled => {
                    return Err(BindError::NotFound {
                        mac: mac.to_string(),
                    })
                }
                Ok(None) => debug!(mac, "Interface not present yet, waiting"),
                Err(source) if !self.udev.enabled => {
                    return Err(BindError::Lookup {
                        mac: mac.to_string(),
                        source,
                    })
                }
                Err(e) => warn!(mac, error = %e, "Failed to look up interface, waiting"),
            }

            let elapsed = start.elapsed();
            if elapsed >= self.udev.timeout {
                warn!(mac, elapsed_ms = elapsed.as_millis() as u64, "Reached udev wait timeout");
                return Err(BindError::Timeout {
                    mac: mac.to_string(),
                    elapsed,
                });
            }
            sleep(self.udev.delay).await;
        }
    }

    fn has_unsettled_name(&self, link: &Link) -> bool {
        !self.udev.prefix.is_empty() && link.name.starts_with(&self.udev.prefix)
    }

    /// Move, rename, address and raise the link, in that order
    ///
    /// There is no rollback. The original namespace is restored whenever the
    /// switch into `netns` succeeded, whatever fails after it.
    pub async fn configure(&self, netns: &str, iface: &NetworkInterface) -> Result<(), BindError> {
        let fail = |step: &'static str| {
            move |source: NetlinkError| BindError::Configure {
                step,
                netns: netns.to_string(),
                index: iface.index,
                dest_name: iface.dest_name.clone(),
                address: iface.address,
                source,
            }
        };

        let link = self
            .netlink
            .link_by_index(iface.index)
            .await
            .map_err(fail("look up link"))?;
        debug!(iface = %link.name, mac = %link.mac, netns, "Found link");

        let target = self.netlink.open_netns(netns).map_err(fail("open namespace"))?;
        self.netlink
            .link_set_ns_fd(&link, &target)
            .await
            .map_err(fail("move link into namespace"))?;

        let guard = self
            .netlink
            .enter_netns(&target)
            .map_err(fail("enter namespace"))?;

        self.netlink
            .link_set_down(&link)
            .await
            .map_err(fail("set link down"))?;
        self.netlink
            .link_set_name(&link, &iface.dest_name)
            .await
            .map_err(fail("rename link"))?;
        self.netlink
            .addr_replace(&link, iface.address)
            .await
            .map_err(fail("replace address"))?;
        self.netlink
            .link_set_up(&link)
            .await
            .map_err(fail("set link up"))?;

        drop(guard);
        info!(
            netns,
            iface = %link.name,
            dest_iface = %iface.dest_name,
            address = %iface.address,
            "Configured interface"
        );
        Ok(())
    }
}
