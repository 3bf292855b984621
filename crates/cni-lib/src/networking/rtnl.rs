//! [`Netlink`] over rtnetlink
//!
//! Each call opens its own netlink socket, so the socket always belongs to
//! the namespace the calling thread is in at that moment.

use super::{format_mac, Link, Netlink, NetlinkError, NetnsGuard};
use async_trait::async_trait;
use futures::TryStreamExt;
use ipnetwork::IpNetwork;
use rtnetlink::packet_route::link::{LinkAttribute, LinkMessage};
use rtnetlink::{Handle, LinkUnspec};
use std::fs::File;
use std::os::fd::AsRawFd;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, Default)]
pub struct RtNetlink;

impl RtNetlink {
    fn handle() -> Result<Handle, NetlinkError> {
        let (connection, handle, _) =
            rtnetlink::new_connection().map_err(NetlinkError::Connection)?;
        tokio::spawn(connection);
        Ok(handle)
    }

    async fn set(op: &'static str, index: u32, message: LinkMessage) -> Result<(), NetlinkError> {
        Self::handle()?
            .link()
            .set(message)
            .execute()
            .await
            .map_err(|source| NetlinkError::Request { op, index, source })
    }
}

fn link_from_message(message: &LinkMessage) -> Link {
    let mut link = Link {
        index: message.header.index,
        name: String::new(),
        mac: String::new(),
    };
    for attr in &message.attributes {
        match attr {
            LinkAttribute::IfName(name) => link.name = name.clone(),
            LinkAttribute::Address(bytes) => link.mac = format_mac(bytes),
            _ => {}
        }
    }
    link
}

#[async_trait]
impl Netlink for RtNetlink {
    async fn link_by_index(&self, index: u32) -> Result<Link, NetlinkError> {
        let mut links = Self::handle()?.link().get().match_index(index).execute();
        match links.try_next().await {
            Ok(Some(message)) => Ok(link_from_message(&message)),
            Ok(None) => Err(NetlinkError::LinkNotFound(index)),
            Err(source) => Err(NetlinkError::Request {
                op: "get link",
                index,
                source,
            }),
        }
    }

    async fn link_by_mac(&self, mac: &str) -> Result<Option<Link>, NetlinkError> {
        let mac = mac.to_ascii_lowercase();
        let mut links = Self::handle()?.link().get().execute();
        while let Some(message) = links.try_next().await.map_err(NetlinkError::List)? {
            let link = link_from_message(&message);
            if link.mac == mac {
                return Ok(Some(link));
            }
        }
        Ok(None)
    }

    fn open_netns(&self, path: &str) -> Result<File, NetlinkError> {
        File::open(path).map_err(|source| NetlinkError::Netns {
            path: PathBuf::from(path),
            source,
        })
    }

    fn enter_netns(&self, netns: &File) -> Result<NetnsGuard, NetlinkError> {
        NetnsGuard::enter(netns)
    }

    async fn link_set_ns_fd(&self, link: &Link, netns: &File) -> Result<(), NetlinkError> {
        let message = LinkUnspec::new_with_index(link.index)
            .setns_by_fd(netns.as_raw_fd())
            .build();
        Self::set("move link to namespace", link.index, message).await
    }

    async fn link_set_down(&self, link: &Link) -> Result<(), NetlinkError> {
        let message = LinkUnspec::new_with_index(link.index).down().build();
        Self::set("set link down", link.index, message).await
    }

    async fn link_set_name(&self, link: &Link, name: &str) -> Result<(), NetlinkError> {
        let message = LinkUnspec::new_with_index(link.index)
            .name(name.to_string())
            .build();
        Self::set("rename link", link.index, message).await
    }

    async fn addr_replace(&self, link: &Link, address: IpNetwork) -> Result<(), NetlinkError> {
        Self::handle()?
            .address()
            .add(link.index, address.ip(), address.prefix())
            .replace()
            .execute()
            .await
            .map_err(|source| NetlinkError::Request {
                op: "replace address",
                index: link.index,
                source,
            })
    }

    async fn link_set_up(&self, link: &Link) -> Result<(), NetlinkError> {
        let message = LinkUnspec::new_with_index(link.index).up().build();
        Self::set("set link up", link.index, message).await
    }
}
