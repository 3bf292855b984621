//! ADD: have the daemon attach a port, then hand its interface to the container

use super::{requested_version, PluginError};
use crate::client::DaemonClient;
use cni_lib::models::{parse_cni_args, CniCommand, IfaceInfo};
use cni_lib::networking::InterfaceBinder;
use cni_lib::CniResult;
use tracing::{info, warn};

pub async fn run(
    client: &DaemonClient,
    binder: &InterfaceBinder,
    cmd: &CniCommand,
) -> Result<CniResult, PluginError> {
    let version = requested_version(&cmd.stdindata)?;
    let result = client.add(cmd).await?;

    let iface = result
        .interfaces
        .first()
        .ok_or(PluginError::IncompleteResult("interface"))?;
    let ip = result.ips.first().ok_or(PluginError::IncompleteResult("ip"))?;

    let link = binder.bind(&cmd.netns, &iface.mac, &iface.name, ip.address).await?;
    info!(
        container_id = %cmd.container_id,
        mac = %iface.mac,
        host_iface = %link.name,
        ifname = %iface.name,
        address = %ip.address,
        "Interface handed to container"
    );

    record_state(client, cmd, &ip.address.to_string()).await;

    Ok(result.for_version(&version))
}

/// Best effort; a failed write never fails the ADD
async fn record_state(client: &DaemonClient, cmd: &CniCommand, address: &str) {
    let args = parse_cni_args(&cmd.args);
    let info = IfaceInfo {
        container_id: cmd.container_id.clone(),
        ifname: cmd.ifname.clone(),
        netns: cmd.netns.clone(),
        ip_address: address.to_string(),
        pod_name: args.get("K8S_POD_NAME").cloned().unwrap_or_default(),
        namespace: args.get("K8S_POD_NAMESPACE").cloned().unwrap_or_default(),
    };

    if let Err(e) = client.put_state(&info).await {
        warn!(container_id = %cmd.container_id, ifname = %cmd.ifname, error = %e, "Failed to record interface state");
    }
}
