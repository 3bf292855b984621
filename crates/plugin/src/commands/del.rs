//! DEL: release the port and forget the interface record

use super::PluginError;
use crate::client::DaemonClient;
use cni_lib::models::CniCommand;
use tracing::warn;

pub async fn run(client: &DaemonClient, cmd: &CniCommand) -> Result<(), PluginError> {
    client.cni(cmd).await?;

    if let Err(e) = client.delete_state(&cmd.container_id, &cmd.ifname).await {
        warn!(container_id = %cmd.container_id, ifname = %cmd.ifname, error = %e, "Failed to remove interface state");
    }
    Ok(())
}
