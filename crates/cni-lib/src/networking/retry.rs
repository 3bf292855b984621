//! Exponential backoff around any [`Netlink`]

use super::{Link, Netlink, NetlinkError, NetnsGuard};
use async_trait::async_trait;
use ipnetwork::IpNetwork;
use std::fs::File;
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// First delay between attempts
    pub interval: Duration,
    /// Upper bound for a single delay
    pub max_backoff: Duration,
    /// Give up once the next attempt would start past this
    pub max_wait: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(100),
            max_backoff: Duration::from_millis(500),
            max_wait: Duration::from_millis(2000),
        }
    }
}

/// Retries every kernel call that errors until the policy's wait budget runs out
///
/// Namespace handles are plain file operations and pass straight through.
pub struct RetryNetlink<N> {
    inner: N,
    policy: RetryPolicy,
}

impl<N: Netlink> RetryNetlink<N> {
    pub fn new(inner: N, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    async fn retry<T, F, Fut>(&self, op: &'static str, mut attempt: F) -> Result<T, NetlinkError>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T, NetlinkError>> + Send,
        T: Send,
    {
        let start = Instant::now();
        let mut backoff = self.policy.interval;
        let mut attempts = 1u32;

        loop {
            match attempt().await {
                Ok(value) => return Ok(value),
                Err(e) if start.elapsed() + backoff > self.policy.max_wait => {
                    debug!(op, attempts, error = %e, "Giving up on netlink call");
                    return Err(e);
                }
                Err(e) => {
                    debug!(
                        op,
                        attempts,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Netlink call failed, retrying"
                    );
                    sleep(backoff).await;
                    backoff = std::cmp::min(backoff * 2, self.policy.max_backoff);
                    attempts += 1;
                }
            }
        }
    }
}

#[async_trait]
impl<N: Netlink> Netlink for RetryNetlink<N> {
    async fn link_by_index(&self, index: u32) -> Result<Link, NetlinkError> {
        let inner = &self.inner;
        self.retry("link_by_index", move || inner.link_by_index(index))
            .await
    }

    async fn link_by_mac(&self, mac: &str) -> Result<Option<Link>, NetlinkError> {
        let inner = &self.inner;
        self.retry("link_by_mac", move || inner.link_by_mac(mac)).await
    }

    fn open_netns(&self, path: &str) -> Result<File, NetlinkError> {
        self.inner.open_netns(path)
    }

    fn enter_netns(&self, netns: &File) -> Result<NetnsGuard, NetlinkError> {
        self.inner.enter_netns(netns)
    }

    async fn link_set_ns_fd(&self, link: &Link, netns: &File) -> Result<(), NetlinkError> {
        let inner = &self.inner;
        self.retry("link_set_ns_fd", move || inner.link_set_ns_fd(link, netns))
            .await
    }

    async fn link_set_down(&self, link: &Link) -> Result<(), NetlinkError> {
        let inner = &self.inner;
        self.retry("link_set_down", move || inner.link_set_down(link))
            .await
    }

    async fn link_set_name(&self, link: &Link, name: &str) -> Result<(), NetlinkError> {
        let inner = &self.inner;
        self.retry("link_set_name", move || inner.link_set_name(link, name))
            .await
    }

    async fn addr_replace(&self, link: &Link, address: IpNetwork) -> Result<(), NetlinkError> {
        let inner = &self.inner;
        self.retry("addr_replace", move || inner.addr_replace(link, address))
            .await
    }

    async fn link_set_up(&self, link: &Link) -> Result<(), NetlinkError> {
        let inner = &self.inner;
        self.retry("link_set_up", move || inner.link_set_up(link))
            .await
    }
}
