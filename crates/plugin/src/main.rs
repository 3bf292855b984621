//! OpenStack CNI plugin
//!
//! Invoked by the container runtime once per ADD, DEL, CHECK or VERSION.
//! Forwards the command to the node daemon and, on ADD, moves the attached
//! Neutron interface into the container's network namespace.

mod client;
mod commands;
mod config;
mod output;

use clap::Parser;
use cni_lib::models::{CniCommand, Command};
use cni_lib::networking::{InterfaceBinder, Netlink, RetryNetlink, RtNetlink};
use cni_lib::{CniResult, ErrorResult, VersionResult};
use commands::PluginError;
use std::fs::OpenOptions;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tracing::{error, info};
use tracing_subscriber::{fmt, fmt::writer::BoxMakeWriter, prelude::*, EnvFilter};

/// CNI plugin that plumbs Neutron ports into containers
#[derive(Parser)]
#[command(name = "openstack-cni")]
#[command(version, about = "CNI plugin that plumbs Neutron ports into containers", long_about = None)]
pub struct Cli {
    /// CNI verb (ADD, DEL, CHECK or VERSION)
    #[arg(long, env = "CNI_COMMAND")]
    pub command: String,

    #[arg(long, env = "CNI_CONTAINERID", default_value = "")]
    pub container_id: String,

    /// Path to the container's network namespace
    #[arg(long, env = "CNI_NETNS", default_value = "")]
    pub netns: String,

    /// Interface name inside the container
    #[arg(long, env = "CNI_IFNAME", default_value = "")]
    pub ifname: String,

    /// Extra `K=V;K=V` arguments from the runtime
    #[arg(long, env = "CNI_ARGS", default_value = "")]
    pub args: String,

    /// Plugin search path
    #[arg(long, env = "CNI_PATH", default_value = "")]
    pub path: String,
}

impl Cli {
    fn into_command(self, stdindata: Vec<u8>) -> CniCommand {
        CniCommand {
            command: self.command,
            container_id: self.container_id,
            netns: self.netns,
            ifname: self.ifname,
            args: self.args,
            path: self.path,
            stdindata,
        }
    }
}

/// Logs go to the configured file, or stderr; stdout is reserved for CNI output
fn init_logging(config: &config::PluginConfig) {
    let mut file_error = None;
    let writer = match &config.log_file {
        Some(path) => match OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => BoxMakeWriter::new(std::sync::Mutex::new(file)),
            Err(e) => {
                file_error = Some(format!("{}: {}", path.display(), e));
                BoxMakeWriter::new(std::io::stderr)
            }
        },
        None => BoxMakeWriter::new(std::io::stderr),
    };

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level)))
        .with(fmt::layer().json().with_writer(writer))
        .init();

    if let Some(reason) = file_error {
        error!(reason = %reason, "Failed to open log file, logging to stderr");
    }
}

fn emit<T: serde::Serialize>(value: &T) -> ExitCode {
    match output::print_json(value) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Failed to write CNI output");
            ExitCode::FAILURE
        }
    }
}

fn fail(result: &ErrorResult) -> ExitCode {
    let _ = emit(result);
    ExitCode::FAILURE
}

async fn run(
    config: &config::PluginConfig,
    verb: Command,
    cmd: &CniCommand,
) -> Result<Option<CniResult>, PluginError> {
    let client = client::DaemonClient::new(&config.api_url, config.request_timeout())?;

    match verb {
        Command::Add => {
            let netlink: Arc<dyn Netlink> = if config.enable_netlink_retry {
                info!("Netlink retry enabled");
                Arc::new(RetryNetlink::new(RtNetlink, config.retry_policy()))
            } else {
                Arc::new(RtNetlink)
            };
            let binder = InterfaceBinder::new(netlink, config.udev_wait());
            commands::add::run(&client, &binder, cmd).await.map(Some)
        }
        Command::Del => commands::del::run(&client, cmd).await.map(|()| None),
        Command::Check => commands::check::run(&client, cmd).await.map(|()| None),
        Command::Version => Ok(None),
    }
}

// Namespace switches are per OS thread, so every await must resume on this one
#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let verb: Command = match cli.command.parse() {
        Ok(verb) => verb,
        Err(e) => {
            return fail(&ErrorResult::internal(
                format!("unsupported command {}", cli.command),
                e.to_string(),
            ))
        }
    };
    if verb == Command::Version {
        return emit(&VersionResult::default());
    }

    let config = match config::PluginConfig::load() {
        Ok(config) => config,
        Err(e) => {
            return fail(&ErrorResult::internal(
                "failed to load plugin configuration",
                format!("{:#}", e),
            ))
        }
    };
    init_logging(&config);

    let mut stdin = Vec::new();
    if let Err(e) = tokio::io::stdin().read_to_end(&mut stdin).await {
        return fail(&ErrorResult::internal("failed to read network configuration", e.to_string()));
    }

    let cmd = cli.into_command(stdin);
    info!(
        command = %verb,
        container_id = %cmd.container_id,
        netns = %cmd.netns,
        ifname = %cmd.ifname,
        "Handling CNI command"
    );

    match run(&config, verb, &cmd).await {
        Ok(Some(result)) => emit(&result),
        Ok(None) => ExitCode::SUCCESS,
        Err(e) => {
            error!(command = %verb, container_id = %cmd.container_id, error = %e, "CNI command failed");
            fail(&e.to_error_result(verb.as_str()))
        }
    }
}
