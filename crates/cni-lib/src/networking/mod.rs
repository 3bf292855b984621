//! Kernel networking for the plugin side
//!
//! [`Netlink`] is the seam between the interface binder and the kernel:
//! [`RtNetlink`] talks rtnetlink, [`RetryNetlink`] decorates any
//! implementation with bounded exponential backoff, and tests substitute a
//! recording double.

pub mod binder;
mod netns;
mod retry;
mod rtnl;

pub use binder::{BindError, InterfaceBinder, NetworkInterface, UdevWait};
pub use netns::NetnsGuard;
pub use retry::{RetryNetlink, RetryPolicy};
pub use rtnl::RtNetlink;

use async_trait::async_trait;
use ipnetwork::IpNetwork;
use std::fs::File;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// A kernel network link as seen from the current namespace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    pub index: u32,
    pub name: String,
    /// Lowercase, colon separated
    pub mac: String,
}

#[derive(Debug, Error)]
pub enum NetlinkError {
    #[error("failed to open netlink socket: {0}")]
    Connection(#[source] io::Error),

    #[error("{op} on link {index}: {source}")]
    Request {
        op: &'static str,
        index: u32,
        #[source]
        source: rtnetlink::Error,
    },

    #[error("failed to list links: {0}")]
    List(#[source] rtnetlink::Error),

    #[error("link {0} not found")]
    LinkNotFound(u32),

    #[error("network namespace {path}: {source}")]
    Netns {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Format a hardware address the way the cloud reports MACs
pub fn format_mac(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":")
}

/// Link and namespace operations needed to hand an interface to a container
///
/// Link operations act on the namespace the calling thread is in when they
/// are issued.
#[async_trait]
pub trait Netlink: Send + Sync {
    async fn link_by_index(&self, index: u32) -> Result<Link, NetlinkError>;

    /// `None` when no link carries `mac`
    async fn link_by_mac(&self, mac: &str) -> Result<Option<Link>, NetlinkError>;

    fn open_netns(&self, path: &str) -> Result<File, NetlinkError>;

    /// Switch the calling thread into `netns` until the guard drops
    fn enter_netns(&self, netns: &File) -> Result<NetnsGuard, NetlinkError>;

    async fn link_set_ns_fd(&self, link: &Link, netns: &File) -> Result<(), NetlinkError>;

    async fn link_set_down(&self, link: &Link) -> Result<(), NetlinkError>;

    async fn link_set_name(&self, link: &Link, name: &str) -> Result<(), NetlinkError>;

    /// Add the address, or replace it when already present
    async fn addr_replace(&self, link: &Link, address: IpNetwork) -> Result<(), NetlinkError>;

    async fn link_set_up(&self, link: &Link) -> Result<(), NetlinkError>;
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_mac() {
        assert_eq!(
            format_mac(&[0xfa, 0x16, 0x3e, 0x0a, 0xb0, 0x01]),
            "fa:16:3e:0a:b0:01"
        );
        assert_eq!(format_mac(&[]), "");
    }
}
