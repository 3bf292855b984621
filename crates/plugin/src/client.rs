//! HTTP client for the node daemon

use cni_lib::models::{CniCommand, IfaceInfo};
use cni_lib::{CniResult, ErrorResult};
use reqwest::{Client, Response, StatusCode};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use url::Url;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid daemon URL {url}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("failed to build HTTP client: {0}")]
    Build(#[source] reqwest::Error),

    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// The daemon handled the command and reported a CNI error
    #[error("daemon error: {0}")]
    Daemon(ErrorResult),

    #[error("daemon returned {status}: {body}")]
    Status { status: StatusCode, body: String },

    #[error("failed to decode daemon response: {0}")]
    Decode(#[source] reqwest::Error),

    #[error("daemon returned {status} without a result")]
    EmptyResult { status: StatusCode },
}

/// Client for the daemon's `/cni` and `/state` endpoints
pub struct DaemonClient {
    client: Client,
    base_url: Url,
}

impl DaemonClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ClientError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(ClientError::Build)?;

        let base_url = Url::parse(base_url).map_err(|source| ClientError::InvalidUrl {
            url: base_url.to_string(),
            source,
        })?;

        Ok(Self { client, base_url })
    }

    fn url(&self, path: &str) -> Result<Url, ClientError> {
        self.base_url.join(path).map_err(|source| ClientError::InvalidUrl {
            url: format!("{}{}", self.base_url, path),
            source,
        })
    }

    async fn send(&self, request: reqwest::RequestBuilder, url: &Url) -> Result<Response, ClientError> {
        request.send().await.map_err(|source| ClientError::Transport {
            url: url.to_string(),
            source,
        })
    }

    /// Forward one CNI command
    ///
    /// Returns the CNI result for ADD and `None` for DEL and CHECK.
    pub async fn cni(&self, cmd: &CniCommand) -> Result<Option<CniResult>, ClientError> {
        let url = self.url("cni")?;
        debug!(url = %url, command = %cmd.command, container_id = %cmd.container_id, "Sending CNI command");

        let response = self.send(self.client.post(url.clone()).json(cmd), &url).await?;
        let status = response.status();

        match status {
            StatusCode::OK => response.json().await.map(Some).map_err(ClientError::Decode),
            StatusCode::NO_CONTENT => Ok(None),
            StatusCode::INTERNAL_SERVER_ERROR => {
                let body = response.text().await.unwrap_or_default();
                match serde_json::from_str::<ErrorResult>(&body) {
                    Ok(err) => Err(ClientError::Daemon(err)),
                    Err(_) => Err(ClientError::Status { status, body }),
                }
            }
            _ => Err(ClientError::Status {
                status,
                body: response.text().await.unwrap_or_default(),
            }),
        }
    }

    /// ADD through [`cni`](Self::cni), insisting on a result
    pub async fn add(&self, cmd: &CniCommand) -> Result<CniResult, ClientError> {
        self.cni(cmd)
            .await?
            .ok_or(ClientError::EmptyResult { status: StatusCode::NO_CONTENT })
    }

    pub async fn put_state(&self, info: &IfaceInfo) -> Result<(), ClientError> {
        let url = self.url("state")?;
        let response = self.send(self.client.post(url.clone()).json(info), &url).await?;
        expect_no_content(response).await
    }

    /// Remove a state record; a missing record is not an error
    pub async fn delete_state(&self, container_id: &str, ifname: &str) -> Result<(), ClientError> {
        let url = self.url(&format!("state/{}/{}", container_id, ifname))?;
        let response = self.send(self.client.delete(url.clone()), &url).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        expect_no_content(response).await
    }
}

async fn expect_no_content(response: Response) -> Result<(), ClientError> {
    let status = response.status();
    if status == StatusCode::NO_CONTENT {
        return Ok(());
    }
    Err(ClientError::Status {
        status,
        body: response.text().await.unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    fn command(verb: &str) -> CniCommand {
        CniCommand {
            command: verb.to_string(),
            container_id: "0123456789abcdef".to_string(),
            netns: "/proc/42/ns/net".to_string(),
            ifname: "eth1".to_string(),
            args: String::new(),
            path: "/opt/cni/bin".to_string(),
            stdindata: br#"{"network":"netA"}"#.to_vec(),
        }
    }

    fn client(server: &mockito::Server) -> DaemonClient {
        DaemonClient::new(&server.url(), Duration::from_secs(5)).unwrap()
    }

    const RESULT: &str = r#"{
        "cniVersion": "0.4.0",
        "interfaces": [{"name": "eth1", "mac": "fa:16:3e:00:00:01", "sandbox": "/proc/42/ns/net"}],
        "ips": [{"version": "4", "interface": 0, "address": "10.0.0.11/24", "gateway": "10.0.0.1"}],
        "routes": [],
        "dns": {"nameservers": ["10.0.0.2"]}
    }"#;

    #[tokio::test]
    async fn test_add_decodes_result() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/cni")
            .match_body(Matcher::PartialJsonString(
                r#"{"command":"ADD","container_id":"0123456789abcdef","stdindata":"eyJuZXR3b3JrIjoibmV0QSJ9"}"#
                    .to_string(),
            ))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(RESULT)
            .create_async()
            .await;

        let result = client(&server).add(&command("ADD")).await.unwrap();

        mock.assert_async().await;
        assert_eq!(result.interfaces[0].mac, "fa:16:3e:00:00:01");
        assert_eq!(result.primary_ip(), Some("10.0.0.11".parse().unwrap()));
    }

    #[tokio::test]
    async fn test_del_no_content() {
        let mut server = mockito::Server::new_async().await;
        server.mock("POST", "/cni").with_status(204).create_async().await;

        let result = client(&server).cni(&command("DEL")).await.unwrap();

        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_add_without_result_is_an_error() {
        let mut server = mockito::Server::new_async().await;
        server.mock("POST", "/cni").with_status(204).create_async().await;

        let err = client(&server).add(&command("ADD")).await.unwrap_err();

        assert!(matches!(err, ClientError::EmptyResult { .. }));
    }

    #[tokio::test]
    async fn test_daemon_error_is_passed_through() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/cni")
            .with_status(500)
            .with_body(r#"{"cniVersion":"0.4.0","code":999,"msg":"error during ADD","details":"boom"}"#)
            .create_async()
            .await;

        let err = client(&server).add(&command("ADD")).await.unwrap_err();

        match err {
            ClientError::Daemon(result) => {
                assert_eq!(result.msg, "error during ADD");
                assert_eq!(result.details, "boom");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_bad_request_keeps_body() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/cni")
            .with_status(400)
            .with_body("missing required field: netns")
            .create_async()
            .await;

        let err = client(&server).cni(&command("CHECK")).await.unwrap_err();

        match err {
            ClientError::Status { status, body } => {
                assert_eq!(status, StatusCode::BAD_REQUEST);
                assert!(body.contains("netns"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_transport_error() {
        // Nothing listens on the discard port
        let client = DaemonClient::new("http://127.0.0.1:9", Duration::from_secs(1)).unwrap();

        let err = client.cni(&command("DEL")).await.unwrap_err();

        assert!(matches!(err, ClientError::Transport { .. }));
    }

    #[tokio::test]
    async fn test_state_calls() {
        let mut server = mockito::Server::new_async().await;
        let put = server
            .mock("POST", "/state")
            .match_body(Matcher::PartialJsonString(
                r#"{"container_id":"0123456789abcdef","ifname":"eth1"}"#.to_string(),
            ))
            .with_status(204)
            .create_async()
            .await;
        let missing = server
            .mock("DELETE", "/state/0123456789abcdef/eth1")
            .with_status(404)
            .create_async()
            .await;
        let client = client(&server);

        client
            .put_state(&IfaceInfo {
                container_id: "0123456789abcdef".to_string(),
                ifname: "eth1".to_string(),
                netns: "/proc/42/ns/net".to_string(),
                ip_address: "10.0.0.11".to_string(),
                pod_name: String::new(),
                namespace: String::new(),
            })
            .await
            .unwrap();
        client.delete_state("0123456789abcdef", "eth1").await.unwrap();

        put.assert_async().await;
        missing.assert_async().await;
    }

    #[test]
    fn test_invalid_url() {
        assert!(matches!(
            DaemonClient::new("not a url", Duration::from_secs(1)),
            Err(ClientError::InvalidUrl { .. })
        ));
    }
}
