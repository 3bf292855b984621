//! In-memory [`CloudClient`] for tests
//!
//! Holds servers, networks, subnets and ports in plain maps, counts calls per
//! method and can be told to fail any method.

use super::types::*;
use super::{CloudClient, CloudError};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

#[derive(Default)]
struct World {
    servers: Vec<Server>,
    networks: Vec<Network>,
    subnets: Vec<Subnet>,
    projects: Vec<Project>,
    security_groups: Vec<SecurityGroup>,
    ports: BTreeMap<String, Port>,
}

/// Record-based cloud double
#[derive(Default)]
pub struct MockCloudClient {
    world: Mutex<World>,
    calls: Mutex<HashMap<&'static str, usize>>,
    failures: Mutex<HashMap<&'static str, String>>,
    next_id: AtomicUsize,
}

impl MockCloudClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// A cloud with server `node-1`, network `netA` and subnet `subA` (10.0.0.0/24)
    pub fn with_defaults() -> Self {
        let mock = Self::new();
        mock.add_server("srv-1", "node-1");
        mock.add_network("net-1", "netA");
        mock.add_subnet(Subnet {
            id: "sub-1".to_string(),
            name: "subA".to_string(),
            network_id: "net-1".to_string(),
            cidr: "10.0.0.0/24".to_string(),
            gateway_ip: Some("10.0.0.1".to_string()),
            dns_nameservers: vec!["10.0.0.2".to_string()],
            host_routes: vec![HostRoute {
                destination: "192.168.0.0/16".to_string(),
                nexthop: "10.0.0.254".to_string(),
            }],
        });
        mock
    }

    pub fn add_server(&self, id: &str, name: &str) {
        self.lock().servers.push(Server {
            id: id.to_string(),
            name: name.to_string(),
        });
    }

    pub fn add_network(&self, id: &str, name: &str) {
        self.lock().networks.push(Network {
            id: id.to_string(),
            name: name.to_string(),
            subnets: Vec::new(),
        });
    }

    pub fn add_subnet(&self, subnet: Subnet) {
        let mut world = self.lock();
        if let Some(network) = world.networks.iter_mut().find(|n| n.id == subnet.network_id) {
            network.subnets.push(subnet.id.clone());
        }
        world.subnets.push(subnet);
    }

    pub fn add_project(&self, id: &str, name: &str) {
        self.lock().projects.push(Project {
            id: id.to_string(),
            name: name.to_string(),
        });
    }

    pub fn add_security_group(&self, id: &str, name: &str, project_id: &str) {
        self.lock().security_groups.push(SecurityGroup {
            id: id.to_string(),
            name: name.to_string(),
            project_id: project_id.to_string(),
        });
    }

    pub fn insert_port(&self, port: Port) {
        self.lock().ports.insert(port.id.clone(), port);
    }

    pub fn port(&self, id: &str) -> Option<Port> {
        self.lock().ports.get(id).cloned()
    }

    pub fn ports(&self) -> Vec<Port> {
        self.lock().ports.values().cloned().collect()
    }

    /// Make every later call to `method` fail with an API error
    pub fn fail_on(&self, method: &'static str, message: &str) {
        self.failures
            .lock()
            .unwrap()
            .insert(method, message.to_string());
    }

    pub fn clear_failures(&self) {
        self.failures.lock().unwrap().clear();
    }

    /// Number of calls made to `method`
    pub fn calls(&self, method: &str) -> usize {
        self.calls.lock().unwrap().get(method).copied().unwrap_or(0)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, World> {
        self.world.lock().unwrap()
    }

    fn enter(&self, method: &'static str) -> Result<(), CloudError> {
        *self.calls.lock().unwrap().entry(method).or_insert(0) += 1;
        match self.failures.lock().unwrap().get(method) {
            Some(message) => Err(CloudError::Api {
                method: "MOCK".to_string(),
                url: method.to_string(),
                status: 500,
                body: message.clone(),
            }),
            None => Ok(()),
        }
    }

    fn next_id(&self) -> usize {
        self.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }
}

fn has_all_tags(port: &Port, tags: &[String]) -> bool {
    tags.iter().all(|tag| port.has_tag(tag))
}

#[async_trait]
impl CloudClient for MockCloudClient {
    async fn assign_port(&self, port_id: &str, server_id: &str) -> Result<Attachment, CloudError> {
        self.enter("assign_port")?;
        let mut world = self.lock();
        let port = world.ports.get_mut(port_id).ok_or(CloudError::PortNotFound)?;
        port.device_id = server_id.to_string();
        port.device_owner = "compute:nova".to_string();
        port.status = "ACTIVE".to_string();

        Ok(Attachment {
            port_id: port.id.clone(),
            net_id: port.network_id.clone(),
            mac_addr: port.mac_address.clone(),
            port_state: port.status.clone(),
            fixed_ips: port.fixed_ips.clone(),
        })
    }

    async fn create_port(
        &self,
        opts: &CreatePortOpts,
        _extra: Option<&ExtraCreatePortOpts>,
    ) -> Result<Port, CloudError> {
        self.enter("create_port")?;
        let n = self.next_id();
        let mut world = self.lock();

        let subnet_id = match opts.fixed_ips.first() {
            Some(pin) => pin.subnet_id.clone(),
            None => world
                .subnets
                .iter()
                .find(|s| s.network_id == opts.network_id)
                .map(|s| s.id.clone())
                .ok_or(CloudError::SubnetNotFound)?,
        };

        let port = Port {
            id: format!("port-{}", n),
            name: opts.name.clone().unwrap_or_default(),
            network_id: opts.network_id.clone(),
            mac_address: opts
                .mac_address
                .clone()
                .unwrap_or_else(|| format!("fa:16:3e:00:00:{:02x}", n % 256)),
            status: Port::STATUS_DOWN.to_string(),
            device_id: opts.device_id.clone().unwrap_or_default(),
            device_owner: opts.device_owner.clone().unwrap_or_default(),
            fixed_ips: vec![FixedIp {
                subnet_id,
                ip_address: format!("10.0.0.{}", 10 + n % 200),
            }],
            tags: Vec::new(),
            created_at: Some(Utc::now()),
        };
        world.ports.insert(port.id.clone(), port.clone());
        Ok(port)
    }

    async fn delete_port(&self, port_id: &str) -> Result<(), CloudError> {
        self.enter("delete_port")?;
        self.lock()
            .ports
            .remove(port_id)
            .map(|_| ())
            .ok_or(CloudError::PortNotFound)
    }

    async fn detach_port(&self, port_id: &str, _server_id: &str) -> Result<(), CloudError> {
        self.enter("detach_port")?;
        let mut world = self.lock();
        let port = world.ports.get_mut(port_id).ok_or(CloudError::PortNotFound)?;
        port.device_id.clear();
        port.device_owner.clear();
        port.status = Port::STATUS_DOWN.to_string();
        Ok(())
    }

    async fn set_port_tags(&self, port_id: &str, tags: &[String]) -> Result<(), CloudError> {
        self.enter("set_port_tags")?;
        let mut world = self.lock();
        let port = world.ports.get_mut(port_id).ok_or(CloudError::PortNotFound)?;
        port.tags = tags.to_vec();
        Ok(())
    }

    async fn get_network_by_name(&self, name: &str) -> Result<Network, CloudError> {
        self.enter("get_network_by_name")?;
        self.lock()
            .networks
            .iter()
            .find(|n| n.name == name)
            .cloned()
            .ok_or(CloudError::NetworkNotFound)
    }

    async fn get_port(&self, port_id: &str) -> Result<Port, CloudError> {
        self.enter("get_port")?;
        self.port(port_id).ok_or(CloudError::PortNotFound)
    }

    async fn get_ports_by_device_id(&self, device_id: &str) -> Result<Vec<Port>, CloudError> {
        self.enter("get_ports_by_device_id")?;
        Ok(self
            .lock()
            .ports
            .values()
            .filter(|p| p.device_id == device_id)
            .cloned()
            .collect())
    }

    async fn get_port_by_tags(&self, tags: &[String]) -> Result<Port, CloudError> {
        self.enter("get_port_by_tags")?;
        self.lock()
            .ports
            .values()
            .find(|p| has_all_tags(p, tags))
            .cloned()
            .ok_or(CloudError::PortNotFound)
    }

    async fn get_ports_by_tags(&self, tags: &[String]) -> Result<Vec<Port>, CloudError> {
        self.enter("get_ports_by_tags")?;
        Ok(self
            .lock()
            .ports
            .values()
            .filter(|p| has_all_tags(p, tags))
            .cloned()
            .collect())
    }

    async fn get_project_by_name(&self, name: &str) -> Result<Project, CloudError> {
        self.enter("get_project_by_name")?;
        self.lock()
            .projects
            .iter()
            .find(|p| p.name == name)
            .cloned()
            .ok_or(CloudError::ProjectNotFound)
    }

    async fn get_server_by_name(&self, name: &str) -> Result<Server, CloudError> {
        self.enter("get_server_by_name")?;
        self.lock()
            .servers
            .iter()
            .find(|s| s.name == name)
            .cloned()
            .ok_or(CloudError::ServerNotFound)
    }

    async fn get_security_group_by_name(
        &self,
        name: &str,
        project_id: Option<&str>,
    ) -> Result<SecurityGroup, CloudError> {
        self.enter("get_security_group_by_name")?;
        self.lock()
            .security_groups
            .iter()
            .find(|g| g.name == name && project_id.map_or(true, |id| g.project_id == id))
            .cloned()
            .ok_or(CloudError::SecurityGroupNotFound)
    }

    async fn get_subnet(&self, subnet_id: &str) -> Result<Subnet, CloudError> {
        self.enter("get_subnet")?;
        self.lock()
            .subnets
            .iter()
            .find(|s| s.id == subnet_id)
            .cloned()
            .ok_or(CloudError::SubnetNotFound)
    }

    async fn get_subnet_by_name(
        &self,
        name: &str,
        network_id: &str,
    ) -> Result<Subnet, CloudError> {
        self.enter("get_subnet_by_name")?;
        self.lock()
            .subnets
            .iter()
            .find(|s| s.name == name && s.network_id == network_id)
            .cloned()
            .ok_or(CloudError::SubnetNotFound)
    }
}
