//! Health check infrastructure for the CNI daemon
//!
//! Backs `GET /health`. Each [`Check`] is run on every request and the
//! daemon is healthy only when every check passes.

use crate::openstack::{CloudClient, CloudError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Name looked up to prove the compute API answers
pub const ABSENT_SERVER_NAME: &str = "serverthatdoesntexist";

/// Result of a single named check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckResult {
    pub name: String,
    pub is_healthy: bool,
    #[serde(default)]
    pub error: String,
}

/// Overall health response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub is_healthy: bool,
    pub checks: Vec<CheckResult>,
}

impl HealthResponse {
    pub fn from_checks(checks: Vec<CheckResult>) -> Self {
        Self {
            is_healthy: checks.iter().all(|c| c.is_healthy),
            checks,
        }
    }
}

#[async_trait]
pub trait Check: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self) -> Result<(), String>;
}

/// Cloud reachability, checked with a lookup for a server that never exists
///
/// A not-found answer proves the API round trip works.
pub struct CloudCheck {
    client: Arc<dyn CloudClient>,
}

impl CloudCheck {
    pub fn new(client: Arc<dyn CloudClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Check for CloudCheck {
    fn name(&self) -> &str {
        "openstack"
    }

    async fn run(&self) -> Result<(), String> {
        match self.client.get_server_by_name(ABSENT_SERVER_NAME).await {
            Ok(_) | Err(CloudError::ServerNotFound) => Ok(()),
            Err(err) => Err(err.to_string()),
        }
    }
}

/// Runs the registered checks in order
#[derive(Clone, Default)]
pub struct HealthChecker {
    checks: Vec<Arc<dyn Check>>,
}

impl HealthChecker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_check(mut self, check: impl Check + 'static) -> Self {
        self.checks.push(Arc::new(check));
        self
    }

    pub async fn health(&self) -> HealthResponse {
        let mut results = Vec::with_capacity(self.checks.len());
        for check in &self.checks {
            let result = match check.run().await {
                Ok(()) => CheckResult {
                    name: check.name().to_string(),
                    is_healthy: true,
                    error: String::new(),
                },
                Err(error) => CheckResult {
                    name: check.name().to_string(),
                    is_healthy: false,
                    error,
                },
            };
            results.push(result);
        }
        HealthResponse::from_checks(results)
    }
}
