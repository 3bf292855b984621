//! Read-through TTL cache in front of a [`CloudClient`]
//!
//! Lookups are keyed by operation name and arguments joined with `|`.
//! Only successful results are stored. Tag lookups always go to the cloud.
//! Deleting a port purges every cached port read that contains it; nothing
//! else invalidates entries before their TTL runs out.

use super::types::*;
use super::{CloudClient, CloudError};
use async_trait::async_trait;
use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

const OP_GET_SERVER_BY_NAME: &str = "GetServerByName";
const OP_GET_NETWORK_BY_NAME: &str = "GetNetworkByName";
const OP_GET_PORT: &str = "GetPort";
const OP_GET_PORTS_BY_DEVICE_ID: &str = "GetPortsByDeviceId";
const OP_GET_PROJECT_BY_NAME: &str = "GetProjectByName";
const OP_GET_SECURITY_GROUP_BY_NAME: &str = "GetSecurityGroupByName";
const OP_GET_SUBNET: &str = "GetSubnet";
const OP_GET_SUBNET_BY_NAME: &str = "GetSubnetByName";

/// Prefix shared by every port read operation
const PORT_READ_PREFIX: &str = "GetPort";

struct CacheEntry<V> {
    value: V,
    expires_at: Instant,
}

/// Concurrent key-value store where every entry lives for a fixed TTL
pub struct TtlCache<V> {
    entries: DashMap<String, CacheEntry<V>>,
    ttl: Duration,
}

impl<V: Clone> TtlCache<V> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    /// Unexpired value for `key`; an expired entry is dropped on the way out
    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        if let Some(entry) = self.entries.get(key) {
            if entry.expires_at > now {
                return Some(entry.value.clone());
            }
        }
        self.entries.remove_if(key, |_, entry| entry.expires_at <= now);
        None
    }

    pub fn insert(&self, key: impl Into<String>, value: V) {
        self.entries.insert(
            key.into(),
            CacheEntry {
                value,
                expires_at: Instant::now() + self.ttl,
            },
        );
    }

    pub fn remove(&self, key: &str) {
        self.entries.remove(key);
    }

    /// Remove every entry matching `pred`, returning how many were dropped
    pub fn purge<F>(&self, pred: F) -> usize
    where
        F: Fn(&str, &V) -> bool,
    {
        let mut removed = 0;
        self.entries.retain(|key, entry| {
            let matched = pred(key, &entry.value);
            if matched {
                removed += 1;
            }
            !matched
        });
        removed
    }

    /// Drop entries whose TTL has run out
    pub fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}

/// Build a cache key from an operation name and its arguments
pub(crate) fn make_key(op: &str, args: &[&str]) -> String {
    let mut key = String::from(op);
    for arg in args {
        key.push('|');
        key.push_str(arg);
    }
    key
}

/// Any value the cached client can hold
#[derive(Debug, Clone)]
enum CachedValue {
    Server(Server),
    Network(Network),
    Port(Port),
    Ports(Vec<Port>),
    Project(Project),
    SecurityGroup(SecurityGroup),
    Subnet(Subnet),
}

impl CachedValue {
    fn contains_port(&self, port_id: &str) -> bool {
        match self {
            CachedValue::Port(port) => port.id == port_id,
            CachedValue::Ports(ports) => ports.iter().any(|p| p.id == port_id),
            _ => false,
        }
    }
}

trait Cacheable: Clone + Send + Sized {
    fn into_cached(self) -> CachedValue;
    fn from_cached(value: CachedValue) -> Option<Self>;
}

macro_rules! cacheable {
    ($ty:ty, $variant:ident) => {
        impl Cacheable for $ty {
            fn into_cached(self) -> CachedValue {
                CachedValue::$variant(self)
            }

            fn from_cached(value: CachedValue) -> Option<Self> {
                match value {
                    CachedValue::$variant(inner) => Some(inner),
                    _ => None,
                }
            }
        }
    };
}

cacheable!(Server, Server);
cacheable!(Network, Network);
cacheable!(Port, Port);
cacheable!(Vec<Port>, Ports);
cacheable!(Project, Project);
cacheable!(SecurityGroup, SecurityGroup);
cacheable!(Subnet, Subnet);

/// [`CloudClient`] decorator caching read calls for a fixed TTL
pub struct CachedClient {
    inner: Arc<dyn CloudClient>,
    cache: TtlCache<CachedValue>,
}

impl CachedClient {
    pub fn new(inner: Arc<dyn CloudClient>, ttl: Duration) -> Self {
        Self {
            inner,
            cache: TtlCache::new(ttl),
        }
    }

    /// Drop expired entries; the daemon calls this periodically
    pub fn evict_expired(&self) -> usize {
        self.cache.evict_expired()
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    async fn read_through<T, F>(&self, key: String, fetch: F) -> Result<T, CloudError>
    where
        T: Cacheable,
        F: Future<Output = Result<T, CloudError>> + Send,
    {
        if let Some(value) = self.cache.get(&key).and_then(T::from_cached) {
            debug!(key = %key, "Cache hit");
            return Ok(value);
        }

        let value = fetch.await?;
        self.cache.insert(key, value.clone().into_cached());
        Ok(value)
    }
}

#[async_trait]
impl CloudClient for CachedClient {
    async fn assign_port(&self, port_id: &str, server_id: &str) -> Result<Attachment, CloudError> {
        self.inner.assign_port(port_id, server_id).await
    }

    async fn create_port(
        &self,
        opts: &CreatePortOpts,
        extra: Option<&ExtraCreatePortOpts>,
    ) -> Result<Port, CloudError> {
        self.inner.create_port(opts, extra).await
    }

    async fn delete_port(&self, port_id: &str) -> Result<(), CloudError> {
        let purged = self.cache.purge(|key, value| {
            key.starts_with(PORT_READ_PREFIX) && value.contains_port(port_id)
        });
        debug!(port_id = %port_id, purged, "Purged cached port reads");

        self.inner.delete_port(port_id).await
    }

    async fn detach_port(&self, port_id: &str, server_id: &str) -> Result<(), CloudError> {
        self.inner.detach_port(port_id, server_id).await
    }

    async fn set_port_tags(&self, port_id: &str, tags: &[String]) -> Result<(), CloudError> {
        self.inner.set_port_tags(port_id, tags).await
    }

    async fn get_network_by_name(&self, name: &str) -> Result<Network, CloudError> {
        let key = make_key(OP_GET_NETWORK_BY_NAME, &[name]);
        self.read_through(key, self.inner.get_network_by_name(name))
            .await
    }

    async fn get_port(&self, port_id: &str) -> Result<Port, CloudError> {
        let key = make_key(OP_GET_PORT, &[port_id]);
        self.read_through(key, self.inner.get_port(port_id)).await
    }

    async fn get_ports_by_device_id(&self, device_id: &str) -> Result<Vec<Port>, CloudError> {
        let key = make_key(OP_GET_PORTS_BY_DEVICE_ID, &[device_id]);
        self.read_through(key, self.inner.get_ports_by_device_id(device_id))
            .await
    }

    async fn get_port_by_tags(&self, tags: &[String]) -> Result<Port, CloudError> {
        self.inner.get_port_by_tags(tags).await
    }

    async fn get_ports_by_tags(&self, tags: &[String]) -> Result<Vec<Port>, CloudError> {
        self.inner.get_ports_by_tags(tags).await
    }

    async fn get_project_by_name(&self, name: &str) -> Result<Project, CloudError> {
        let key = make_key(OP_GET_PROJECT_BY_NAME, &[name]);
        self.read_through(key, self.inner.get_project_by_name(name))
            .await
    }

    async fn get_server_by_name(&self, name: &str) -> Result<Server, CloudError> {
        let key = make_key(OP_GET_SERVER_BY_NAME, &[name]);
        self.read_through(key, self.inner.get_server_by_name(name))
            .await
    }

    async fn get_security_group_by_name(
        &self,
        name: &str,
        project_id: Option<&str>,
    ) -> Result<SecurityGroup, CloudError> {
        let key = make_key(
            OP_GET_SECURITY_GROUP_BY_NAME,
            &[name, project_id.unwrap_or_default()],
        );
        self.read_through(key, self.inner.get_security_group_by_name(name, project_id))
            .await
    }

    async fn get_subnet(&self, subnet_id: &str) -> Result<Subnet, CloudError> {
        let key = make_key(OP_GET_SUBNET, &[subnet_id]);
        self.read_through(key, self.inner.get_subnet(subnet_id))
            .await
    }

    async fn get_subnet_by_name(
        &self,
        name: &str,
        network_id: &str,
    ) -> Result<Subnet, CloudError> {
        let key = make_key(OP_GET_SUBNET_BY_NAME, &[name, network_id]);
        self.read_through(key, self.inner.get_subnet_by_name(name, network_id))
            .await
    }
}
