//! CHECK: forwarded to the daemon as is

use super::PluginError;
use crate::client::DaemonClient;
use cni_lib::models::CniCommand;

pub async fn run(client: &DaemonClient, cmd: &CniCommand) -> Result<(), PluginError> {
    client.cni(cmd).await?;
    Ok(())
}
