//! Background garbage collection of orphaned ports
//!
//! Every tick lists the ports tagged for this host and deletes the ones
//! that pass every gate below. Leaving an orphan behind is acceptable,
//! deleting a live port is not, so any doubt means skip.
//!
//! 1. carries the marker tag
//! 2. older than the minimum age
//! 3. status DOWN
//! 4. no device id
//! 5. when a host proc mount is configured, the port's network namespace is gone

use super::port_tags::{has_marker_tag, key_tags, tag_value, TAG_NETNS};
use crate::observability::Metrics;
use crate::openstack::{CloudClient, CloudError, Port};
use chrono::Utc;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{interval_at, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct ReaperConfig {
    pub interval: Duration,
    pub min_port_age: Duration,
    /// Evaluate and log candidates without deleting them
    pub skip_delete: bool,
    /// Host proc filesystem, mounted into the daemon's container
    pub proc_mount: Option<PathBuf>,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            min_port_age: Duration::from_secs(300),
            skip_delete: false,
            proc_mount: None,
        }
    }
}

/// Why a candidate port was left alone
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    MissingMarkerTag,
    TooYoung,
    NotDown(String),
    HasDevice(String),
    UnknownNetns(String),
    ProcNotMounted,
    NetnsAlive(String),
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::MissingMarkerTag => write!(f, "missing marker tag"),
            SkipReason::TooYoung => write!(f, "younger than the minimum port age"),
            SkipReason::NotDown(status) => write!(f, "status is {}", status),
            SkipReason::HasDevice(device_id) => write!(f, "attached to device {}", device_id),
            SkipReason::UnknownNetns(netns) => write!(f, "unrecognised netns tag {:?}", netns),
            SkipReason::ProcNotMounted => write!(f, "host proc is not mounted"),
            SkipReason::NetnsAlive(netns) => write!(f, "netns {} still exists", netns),
        }
    }
}

/// Outcome of one reaper pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReapSummary {
    pub candidates: usize,
    pub deleted: usize,
    pub failed: usize,
    pub skipped: usize,
}

pub struct PortReaper {
    client: Arc<dyn CloudClient>,
    hostname: String,
    config: ReaperConfig,
    metrics: Metrics,
}

impl PortReaper {
    pub fn new(
        client: Arc<dyn CloudClient>,
        hostname: impl Into<String>,
        config: ReaperConfig,
        metrics: Metrics,
    ) -> Self {
        Self {
            client,
            hostname: hostname.into(),
            config,
            metrics,
        }
    }

    /// Reap on every interval until shutdown; the first pass runs one interval after start
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            min_port_age_secs = self.config.min_port_age.as_secs(),
            dry_run = self.config.skip_delete,
            "Starting port reaper"
        );

        let mut ticker = interval_at(Instant::now() + self.config.interval, self.config.interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.reap_once().await {
                        Ok(summary) => debug!(
                            candidates = summary.candidates,
                            deleted = summary.deleted,
                            failed = summary.failed,
                            skipped = summary.skipped,
                            "Reaper pass complete"
                        ),
                        Err(e) => warn!(error = %e, "Failed to list ports for reaping"),
                    }
                }
                _ = shutdown.recv() => {
                    info!("Shutting down port reaper");
                    break;
                }
            }
        }
    }

    /// One pass over this host's ports
    ///
    /// Only the listing can fail the pass; a failed delete is counted and the
    /// remaining candidates are still processed.
    pub async fn reap_once(&self) -> Result<ReapSummary, CloudError> {
        let ports = self.client.get_ports_by_tags(&key_tags(&self.hostname)).await?;
        let mut summary = ReapSummary {
            candidates: ports.len(),
            ..Default::default()
        };

        for port in &ports {
            if let Err(reason) = self.evaluate(port) {
                debug!(port_id = %port.id, reason = %reason, "Skipping port");
                summary.skipped += 1;
                continue;
            }

            if self.config.skip_delete {
                info!(port_id = %port.id, "Port is reapable, dry run leaves it in place");
                summary.skipped += 1;
                continue;
            }

            match self.client.delete_port(&port.id).await {
                Ok(()) => {
                    info!(port_id = %port.id, tags = ?port.tags, "Reaped orphaned port");
                    self.metrics.inc_reaped();
                    summary.deleted += 1;
                }
                Err(e) => {
                    warn!(port_id = %port.id, error = %e, "Failed to reap port");
                    self.metrics.inc_reap_failed();
                    summary.failed += 1;
                }
            }
        }

        Ok(summary)
    }

    /// Apply every gate; the first failing one is returned
    pub fn evaluate(&self, port: &Port) -> Result<(), SkipReason> {
        if !has_marker_tag(&port.tags) {
            return Err(SkipReason::MissingMarkerTag);
        }

        // a port without a creation time is never old enough
        let age = port
            .created_at
            .and_then(|created| (Utc::now() - created).to_std().ok())
            .ok_or(SkipReason::TooYoung)?;
        if age <= self.config.min_port_age {
            return Err(SkipReason::TooYoung);
        }

        if !port.is_down() {
            return Err(SkipReason::NotDown(port.status.clone()));
        }
        if !port.device_id.is_empty() {
            return Err(SkipReason::HasDevice(port.device_id.clone()));
        }

        if let Some(proc_mount) = &self.config.proc_mount {
            check_netns_gone(proc_mount, tag_value(&port.tags, TAG_NETNS).unwrap_or_default())?;
        }

        Ok(())
    }
}

/// Pid of a `/proc/<pid>/ns/net` path
fn netns_pid(netns: &str) -> Option<u32> {
    netns
        .strip_prefix("/proc/")?
        .strip_suffix("/ns/net")?
        .parse()
        .ok()
}

fn check_netns_gone(proc_mount: &Path, netns: &str) -> Result<(), SkipReason> {
    let pid = netns_pid(netns).ok_or_else(|| SkipReason::UnknownNetns(netns.to_string()))?;

    if !proc_mount.join("1").exists() {
        return Err(SkipReason::ProcNotMounted);
    }
    if proc_mount.join(pid.to_string()).join("ns/net").exists() {
        return Err(SkipReason::NetnsAlive(netns.to_string()));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::openstack::mock::MockCloudClient;
    use crate::server::port_tags::MARKER_TAG;
    use tempfile::TempDir;

    fn orphan(id: &str, netns_pid: u32) -> Port {
        Port {
            id: id.to_string(),
            name: "openstack-cni".to_string(),
            network_id: "net-1".to_string(),
            mac_address: "fa:16:3e:00:00:01".to_string(),
            status: "DOWN".to_string(),
            device_id: String::new(),
            device_owner: String::new(),
            fixed_ips: vec![],
            tags: vec![
                "containerid=abc".to_string(),
                "ifname=eth1".to_string(),
                format!("netns=/proc/{}/ns/net", netns_pid),
                MARKER_TAG.to_string(),
                "host=node-1".to_string(),
            ],
            created_at: Some(Utc::now() - chrono::Duration::seconds(600)),
        }
    }

    fn reaper(mock: &Arc<MockCloudClient>, config: ReaperConfig) -> PortReaper {
        PortReaper::new(mock.clone(), "node-1", config, Metrics::new())
    }

    fn config() -> ReaperConfig {
        ReaperConfig {
            min_port_age: Duration::from_secs(60),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_reaps_eligible_port_once() {
        let mock = Arc::new(MockCloudClient::new());
        mock.insert_port(orphan("p-1", 100));
        let reaper = reaper(&mock, config());

        let summary = reaper.reap_once().await.unwrap();
        assert_eq!(summary.deleted, 1);
        assert!(mock.port("p-1").is_none());

        let summary = reaper.reap_once().await.unwrap();
        assert_eq!(summary, ReapSummary::default());
        assert_eq!(mock.calls("delete_port"), 1);
    }

    #[tokio::test]
    async fn test_young_port_is_kept() {
        let mock = Arc::new(MockCloudClient::new());
        let mut port = orphan("p-1", 100);
        port.created_at = Some(Utc::now() - chrono::Duration::seconds(10));
        mock.insert_port(port);

        let summary = reaper(&mock, config()).reap_once().await.unwrap();

        assert_eq!(summary.skipped, 1);
        assert!(mock.port("p-1").is_some());
    }

    #[tokio::test]
    async fn test_port_without_creation_time_is_kept() {
        let mock = Arc::new(MockCloudClient::new());
        let mut port = orphan("p-1", 100);
        port.created_at = None;

        assert_eq!(reaper(&mock, config()).evaluate(&port), Err(SkipReason::TooYoung));
    }

    #[tokio::test]
    async fn test_port_without_marker_is_never_reaped() {
        let mock = Arc::new(MockCloudClient::new());
        let mut port = orphan("p-1", 100);
        port.tags.retain(|t| t != MARKER_TAG);
        port.created_at = Some(Utc::now() - chrono::Duration::days(30));

        assert_eq!(
            reaper(&mock, config()).evaluate(&port),
            Err(SkipReason::MissingMarkerTag)
        );
    }

    #[tokio::test]
    async fn test_active_or_attached_port_is_kept() {
        let mock = Arc::new(MockCloudClient::new());
        let mut active = orphan("p-1", 100);
        active.status = "ACTIVE".to_string();
        let mut attached = orphan("p-2", 100);
        attached.device_id = "srv-1".to_string();
        mock.insert_port(active);
        mock.insert_port(attached);

        let summary = reaper(&mock, config()).reap_once().await.unwrap();

        assert_eq!(summary.candidates, 2);
        assert_eq!(summary.skipped, 2);
        assert_eq!(mock.calls("delete_port"), 0);
    }

    #[tokio::test]
    async fn test_other_hosts_are_not_listed() {
        let mock = Arc::new(MockCloudClient::new());
        let mut port = orphan("p-1", 100);
        port.tags.retain(|t| !t.starts_with("host="));
        port.tags.push("host=node-2".to_string());
        mock.insert_port(port);

        let summary = reaper(&mock, config()).reap_once().await.unwrap();

        assert_eq!(summary.candidates, 0);
        assert!(mock.port("p-1").is_some());
    }

    #[tokio::test]
    async fn test_delete_failure_does_not_stop_the_pass() {
        let mock = Arc::new(MockCloudClient::new());
        mock.insert_port(orphan("p-1", 100));
        mock.insert_port(orphan("p-2", 101));
        mock.fail_on("delete_port", "conflict");

        let summary = reaper(&mock, config()).reap_once().await.unwrap();

        assert_eq!(summary.failed, 2);
        assert_eq!(mock.calls("delete_port"), 2);
    }

    #[tokio::test]
    async fn test_list_failure_fails_the_pass() {
        let mock = Arc::new(MockCloudClient::new());
        mock.fail_on("get_ports_by_tags", "unavailable");

        assert!(reaper(&mock, config()).reap_once().await.is_err());
    }

    #[tokio::test]
    async fn test_dry_run_deletes_nothing() {
        let mock = Arc::new(MockCloudClient::new());
        mock.insert_port(orphan("p-1", 100));
        let config = ReaperConfig {
            skip_delete: true,
            ..config()
        };

        let summary = reaper(&mock, config).reap_once().await.unwrap();

        assert_eq!(summary.skipped, 1);
        assert_eq!(mock.calls("delete_port"), 0);
    }

    #[tokio::test]
    async fn test_proc_gate() {
        let proc = TempDir::new().unwrap();
        std::fs::create_dir_all(proc.path().join("1/ns")).unwrap();
        std::fs::create_dir_all(proc.path().join("200/ns")).unwrap();
        std::fs::write(proc.path().join("200/ns/net"), b"").unwrap();

        let mock = Arc::new(MockCloudClient::new());
        let reaper = reaper(
            &mock,
            ReaperConfig {
                proc_mount: Some(proc.path().to_path_buf()),
                ..config()
            },
        );

        assert_eq!(reaper.evaluate(&orphan("p-1", 100)), Ok(()));
        assert!(matches!(
            reaper.evaluate(&orphan("p-2", 200)),
            Err(SkipReason::NetnsAlive(_))
        ));

        let mut odd = orphan("p-3", 100);
        odd.tags[2] = "netns=/var/run/netns/cni-1".to_string();
        assert!(matches!(reaper.evaluate(&odd), Err(SkipReason::UnknownNetns(_))));
    }

    #[tokio::test]
    async fn test_proc_gate_requires_proc_fs() {
        let empty = TempDir::new().unwrap();
        let mock = Arc::new(MockCloudClient::new());
        let reaper = reaper(
            &mock,
            ReaperConfig {
                proc_mount: Some(empty.path().to_path_buf()),
                ..config()
            },
        );

        assert_eq!(
            reaper.evaluate(&orphan("p-1", 100)),
            Err(SkipReason::ProcNotMounted)
        );
    }

    #[test]
    fn test_netns_pid() {
        assert_eq!(netns_pid("/proc/42/ns/net"), Some(42));
        assert_eq!(netns_pid("/proc/self/ns/net"), None);
        assert_eq!(netns_pid("/var/run/netns/x"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_shutdown() {
        let mock = Arc::new(MockCloudClient::new());
        let reaper = reaper(&mock, config());
        let (tx, rx) = broadcast::channel(1);

        let handle = tokio::spawn(reaper.run(rx));
        tokio::time::sleep(Duration::from_secs(301)).await;
        tx.send(()).unwrap();
        handle.await.unwrap();

        assert_eq!(mock.calls("get_ports_by_tags"), 1);
    }
}
