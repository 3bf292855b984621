//! REST client for Keystone, Nova and Neutron
//!
//! Authenticates with a Keystone v3 password, caches the token until shortly
//! before it expires and resolves the compute and network endpoints from the
//! token's service catalog.

use super::types::*;
use super::{CloudClient, CloudError};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use reqwest::{Client, Method, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info};
use url::Url;

/// Tokens are refreshed this long before Keystone says they expire
const TOKEN_EXPIRY_MARGIN_SECS: i64 = 60;

/// Credentials and endpoint selection for the OpenStack APIs
#[derive(Debug, Clone, Deserialize)]
pub struct OpenStackConfig {
    /// Keystone v3 endpoint, e.g. `https://keystone:5000/v3`
    pub auth_url: String,
    pub username: String,
    pub password: String,
    pub project_name: String,
    #[serde(default = "default_domain")]
    pub user_domain_name: String,
    #[serde(default = "default_domain")]
    pub project_domain_name: String,
    #[serde(default = "default_region")]
    pub region_name: String,
    /// Catalog interface to use (public, internal or admin)
    #[serde(default = "default_interface")]
    pub interface: String,
    /// Overrides the kernel hostname as this host's server name
    #[serde(default)]
    pub vm_name: Option<String>,
}

fn default_domain() -> String {
    "Default".to_string()
}

fn default_region() -> String {
    "RegionOne".to_string()
}

fn default_interface() -> String {
    "public".to_string()
}

#[derive(Debug, Clone, Copy)]
enum Service {
    Compute,
    Network,
    Identity,
}

#[derive(Debug, Clone)]
struct Session {
    token: String,
    expires_at: DateTime<Utc>,
    compute: Url,
    network: Url,
}

impl Session {
    fn is_fresh(&self) -> bool {
        self.expires_at - ChronoDuration::seconds(TOKEN_EXPIRY_MARGIN_SECS) > Utc::now()
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    token: TokenBody,
}

#[derive(Deserialize)]
struct TokenBody {
    expires_at: DateTime<Utc>,
    #[serde(default)]
    catalog: Vec<CatalogEntry>,
}

#[derive(Deserialize)]
struct CatalogEntry {
    #[serde(rename = "type")]
    service_type: String,
    #[serde(default)]
    endpoints: Vec<CatalogEndpoint>,
}

#[derive(Deserialize)]
struct CatalogEndpoint {
    interface: String,
    #[serde(default)]
    region_id: Option<String>,
    #[serde(default)]
    region: Option<String>,
    url: String,
}

#[derive(Deserialize)]
struct ServersBody {
    servers: Vec<Server>,
}

#[derive(Deserialize)]
struct NetworksBody {
    networks: Vec<Network>,
}

#[derive(Deserialize)]
struct PortBody {
    port: Port,
}

#[derive(Deserialize)]
struct PortsBody {
    ports: Vec<Port>,
}

#[derive(Deserialize)]
struct ProjectsBody {
    projects: Vec<Project>,
}

#[derive(Deserialize)]
struct SecurityGroupsBody {
    security_groups: Vec<SecurityGroup>,
}

#[derive(Deserialize)]
struct SubnetBody {
    subnet: Subnet,
}

#[derive(Deserialize)]
struct SubnetsBody {
    subnets: Vec<Subnet>,
}

#[derive(Deserialize)]
struct AttachmentBody {
    #[serde(rename = "interfaceAttachment")]
    interface_attachment: Attachment,
}

/// [`CloudClient`] over the OpenStack REST APIs
pub struct OpenStackClient {
    http: Client,
    config: OpenStackConfig,
    identity: Url,
    session: RwLock<Option<Session>>,
}

impl OpenStackClient {
    /// Create a client; every request is bounded by `timeout`
    pub fn new(config: OpenStackConfig, timeout: Duration) -> Result<Self, CloudError> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|source| CloudError::Http {
                url: config.auth_url.clone(),
                source,
            })?;
        let identity = base_url(&config.auth_url)?;

        Ok(Self {
            http,
            config,
            identity,
            session: RwLock::new(None),
        })
    }

    async fn session(&self) -> Result<Session, CloudError> {
        if let Some(session) = self.session.read().await.as_ref() {
            if session.is_fresh() {
                return Ok(session.clone());
            }
        }

        let mut guard = self.session.write().await;
        if let Some(session) = guard.as_ref() {
            if session.is_fresh() {
                return Ok(session.clone());
            }
        }

        let session = self.authenticate().await?;
        *guard = Some(session.clone());
        Ok(session)
    }

    async fn invalidate_session(&self) {
        self.session.write().await.take();
    }

    async fn authenticate(&self) -> Result<Session, CloudError> {
        let url = self.identity.join("auth/tokens")?;
        let body = json!({
            "auth": {
                "identity": {
                    "methods": ["password"],
                    "password": {
                        "user": {
                            "name": self.config.username,
                            "domain": { "name": self.config.user_domain_name },
                            "password": self.config.password,
                        }
                    }
                },
                "scope": {
                    "project": {
                        "name": self.config.project_name,
                        "domain": { "name": self.config.project_domain_name },
                    }
                }
            }
        });

        let response = self
            .http
            .post(url.clone())
            .json(&body)
            .send()
            .await
            .map_err(|source| CloudError::Http {
                url: url.to_string(),
                source,
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(CloudError::Auth(format!("{}: {}", status, body)));
        }

        let token = response
            .headers()
            .get("X-Subject-Token")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| CloudError::Auth("response has no X-Subject-Token header".into()))?;

        let body: TokenResponse = response.json().await.map_err(|source| CloudError::Http {
            url: url.to_string(),
            source,
        })?;

        let compute = self.endpoint(&body.token.catalog, "compute")?;
        let mut network = self.endpoint(&body.token.catalog, "network")?;
        if !network.path().trim_end_matches('/').ends_with("v2.0") {
            network = network.join("v2.0/")?;
        }

        info!(
            expires_at = %body.token.expires_at,
            compute = %compute,
            network = %network,
            "Authenticated with Keystone"
        );

        Ok(Session {
            token,
            expires_at: body.token.expires_at,
            compute,
            network,
        })
    }

    fn endpoint(&self, catalog: &[CatalogEntry], service_type: &str) -> Result<Url, CloudError> {
        let region = self.config.region_name.as_str();
        let url = catalog
            .iter()
            .filter(|entry| entry.service_type == service_type)
            .flat_map(|entry| entry.endpoints.iter())
            .find(|ep| {
                ep.interface == self.config.interface
                    && (region.is_empty()
                        || ep.region_id.as_deref() == Some(region)
                        || ep.region.as_deref() == Some(region))
            })
            .map(|ep| ep.url.as_str())
            .ok_or_else(|| CloudError::MissingEndpoint {
                service: service_type.to_string(),
            })?;

        base_url(url)
    }

    async fn send(
        &self,
        method: Method,
        service: Service,
        path: &str,
        query: &[(&str, &str)],
        body: Option<&Value>,
    ) -> Result<Response, CloudError> {
        let session = self.session().await?;
        let base = match service {
            Service::Compute => &session.compute,
            Service::Network => &session.network,
            Service::Identity => &self.identity,
        };

        let mut url = base.join(path)?;
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query);
        }

        debug!(method = %method, url = %url, "OpenStack request");

        let mut request = self
            .http
            .request(method.clone(), url.clone())
            .header("X-Auth-Token", &session.token);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(|source| CloudError::Http {
            url: url.to_string(),
            source,
        })?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if status == StatusCode::UNAUTHORIZED {
            self.invalidate_session().await;
        }

        let body = response.text().await.unwrap_or_default();
        Err(CloudError::Api {
            method: method.to_string(),
            url: url.to_string(),
            status: status.as_u16(),
            body,
        })
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        service: Service,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T, CloudError> {
        let response = self.send(Method::GET, service, path, query, None).await?;
        decode(response).await
    }
}

/// Parse `raw` as a base URL that relative paths can be joined onto
fn base_url(raw: &str) -> Result<Url, CloudError> {
    if raw.ends_with('/') {
        Ok(Url::parse(raw)?)
    } else {
        Ok(Url::parse(&format!("{}/", raw))?)
    }
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, CloudError> {
    let url = response.url().to_string();
    response
        .json()
        .await
        .map_err(|source| CloudError::Http { url, source })
}

/// `{"port": ...}` with any non-empty extension fields merged in
fn create_port_body(
    opts: &CreatePortOpts,
    extra: Option<&ExtraCreatePortOpts>,
) -> Result<Value, CloudError> {
    let mut port = serde_json::to_value(opts)?;
    if let Some(extra) = extra.filter(|extra| !extra.is_empty()) {
        if let (Value::Object(fields), Value::Object(extension)) =
            (&mut port, serde_json::to_value(extra)?)
        {
            fields.extend(extension);
        }
    }
    Ok(json!({ "port": port }))
}

/// Map a 404 from a by-id lookup onto the matching sentinel
fn not_found_on_404<T>(result: Result<T, CloudError>, sentinel: CloudError) -> Result<T, CloudError> {
    match result {
        Err(CloudError::Api { status: 404, .. }) => Err(sentinel),
        other => other,
    }
}

/// Matches only the exact name; Nova treats the name filter as a regex
fn exact_name(name: &str) -> String {
    format!("^{}$", name)
}

#[async_trait]
impl CloudClient for OpenStackClient {
    async fn assign_port(&self, port_id: &str, server_id: &str) -> Result<Attachment, CloudError> {
        let body = json!({ "interfaceAttachment": { "port_id": port_id } });
        let path = format!("servers/{}/os-interface", server_id);
        let response = self
            .send(Method::POST, Service::Compute, &path, &[], Some(&body))
            .await?;
        let body: AttachmentBody = decode(response).await?;
        Ok(body.interface_attachment)
    }

    async fn create_port(
        &self,
        opts: &CreatePortOpts,
        extra: Option<&ExtraCreatePortOpts>,
    ) -> Result<Port, CloudError> {
        let body = create_port_body(opts, extra)?;
        let response = self
            .send(Method::POST, Service::Network, "ports", &[], Some(&body))
            .await?;
        let body: PortBody = decode(response).await?;
        Ok(body.port)
    }

    async fn delete_port(&self, port_id: &str) -> Result<(), CloudError> {
        let path = format!("ports/{}", port_id);
        let result = self
            .send(Method::DELETE, Service::Network, &path, &[], None)
            .await;
        not_found_on_404(result, CloudError::PortNotFound).map(|_| ())
    }

    async fn detach_port(&self, port_id: &str, server_id: &str) -> Result<(), CloudError> {
        let path = format!("servers/{}/os-interface/{}", server_id, port_id);
        self.send(Method::DELETE, Service::Compute, &path, &[], None)
            .await
            .map(|_| ())
    }

    async fn set_port_tags(&self, port_id: &str, tags: &[String]) -> Result<(), CloudError> {
        let path = format!("ports/{}/tags", port_id);
        let body = json!({ "tags": tags });
        self.send(Method::PUT, Service::Network, &path, &[], Some(&body))
            .await
            .map(|_| ())
    }

    async fn get_network_by_name(&self, name: &str) -> Result<Network, CloudError> {
        let body: NetworksBody = self
            .get_json(Service::Network, "networks", &[("name", name)])
            .await?;
        body.networks
            .into_iter()
            .next()
            .ok_or(CloudError::NetworkNotFound)
    }

    async fn get_port(&self, port_id: &str) -> Result<Port, CloudError> {
        let path = format!("ports/{}", port_id);
        let result: Result<PortBody, _> = self.get_json(Service::Network, &path, &[]).await;
        not_found_on_404(result, CloudError::PortNotFound).map(|body| body.port)
    }

    async fn get_ports_by_device_id(&self, device_id: &str) -> Result<Vec<Port>, CloudError> {
        let body: PortsBody = self
            .get_json(Service::Network, "ports", &[("device_id", device_id)])
            .await?;
        Ok(body.ports)
    }

    async fn get_port_by_tags(&self, tags: &[String]) -> Result<Port, CloudError> {
        self.get_ports_by_tags(tags)
            .await?
            .into_iter()
            .next()
            .ok_or(CloudError::PortNotFound)
    }

    async fn get_ports_by_tags(&self, tags: &[String]) -> Result<Vec<Port>, CloudError> {
        let joined = tags.join(",");
        let body: PortsBody = self
            .get_json(Service::Network, "ports", &[("tags", joined.as_str())])
            .await?;
        Ok(body.ports)
    }

    async fn get_project_by_name(&self, name: &str) -> Result<Project, CloudError> {
        let body: ProjectsBody = self
            .get_json(Service::Identity, "projects", &[("name", name)])
            .await?;
        body.projects
            .into_iter()
            .next()
            .ok_or(CloudError::ProjectNotFound)
    }

    async fn get_server_by_name(&self, name: &str) -> Result<Server, CloudError> {
        let pattern = exact_name(name);
        let body: ServersBody = self
            .get_json(
                Service::Compute,
                "servers",
                &[("name", pattern.as_str()), ("limit", "1")],
            )
            .await?;
        body.servers
            .into_iter()
            .next()
            .ok_or(CloudError::ServerNotFound)
    }

    async fn get_security_group_by_name(
        &self,
        name: &str,
        project_id: Option<&str>,
    ) -> Result<SecurityGroup, CloudError> {
        let mut query = vec![("name", name)];
        if let Some(project_id) = project_id.filter(|id| !id.is_empty()) {
            query.push(("project_id", project_id));
        }
        let body: SecurityGroupsBody = self
            .get_json(Service::Network, "security-groups", &query)
            .await?;
        body.security_groups
            .into_iter()
            .next()
            .ok_or(CloudError::SecurityGroupNotFound)
    }

    async fn get_subnet(&self, subnet_id: &str) -> Result<Subnet, CloudError> {
        let path = format!("subnets/{}", subnet_id);
        let result: Result<SubnetBody, _> = self.get_json(Service::Network, &path, &[]).await;
        not_found_on_404(result, CloudError::SubnetNotFound).map(|body| body.subnet)
    }

    async fn get_subnet_by_name(
        &self,
        name: &str,
        network_id: &str,
    ) -> Result<Subnet, CloudError> {
        let body: SubnetsBody = self
            .get_json(
                Service::Network,
                "subnets",
                &[("name", name), ("network_id", network_id)],
            )
            .await?;
        body.subnets
            .into_iter()
            .next()
            .ok_or(CloudError::SubnetNotFound)
    }
}
