//! relayctl: the relaygrid fleet orchestrator CLI.
//!
//! # Usage
//!
//! ```text
//! relayctl provision --name de-1 --address 203.0.113.7 --domain de1.example.com
//! relayctl sync
//! relayctl monitor
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, Subcommand};
use relaygrid_core::{FleetConfig, Secret};
use relayctl::Fleet;
use tracing_subscriber::EnvFilter;

mod commands;

use commands::Format;
use commands::node::ProvisionArgs;

#[derive(Parser)]
#[command(
    name = "relayctl",
    about = "relaygrid proxy fleet provisioning and config sync",
    version,
    propagate_version = true
)]
struct Cli {
    /// Path to relaygrid.toml.
    #[arg(
        short,
        long,
        global = true,
        env = "RELAYGRID_CONFIG",
        default_value = "/etc/relaygrid/relaygrid.toml"
    )]
    config: PathBuf,

    /// Control-plane admin password; overrides panel.password.
    #[arg(long, global = true, env = "RELAYGRID_PANEL_PASSWORD", hide_env_values = true)]
    panel_password: Option<String>,

    /// Output format.
    #[arg(long, global = true, value_enum, default_value_t = Format::Text)]
    format: Format,

    /// Write logs as JSON lines.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Onboard a new node and sync the fleet.
    Provision {
        #[arg(long)]
        name: String,
        /// IPv4 or IPv6 address of the node.
        #[arg(long)]
        address: String,
        /// SNI hostname routed to the node.
        #[arg(long)]
        domain: String,
        #[arg(long, default_value = "root")]
        ssh_user: String,
        #[arg(long, default_value_t = 22)]
        ssh_port: u16,
        /// SSH password. Without it (or --ssh-key) the local agent is used.
        #[arg(long, env = "RELAYGRID_SSH_PASSWORD", hide_env_values = true, conflicts_with = "ssh_key")]
        ssh_password: Option<String>,
        /// Private key file.
        #[arg(long)]
        ssh_key: Option<PathBuf>,
        /// Port the load balancer forwards to on the node.
        #[arg(long)]
        backend_port: Option<u16>,
    },
    /// Continue a failed or interrupted onboarding.
    Resume { name: String },
    /// Deregister a node, drop its routing rule and delete it.
    Remove {
        name: String,
        /// Keep the record as `removed` instead of deleting it.
        #[arg(long)]
        retain: bool,
    },
    /// Push the rendered load-balancer config to the fleet.
    Sync {
        /// Sync only this node.
        #[arg(long)]
        node: Option<String>,
    },
    /// Control-plane connection status of every serving node.
    Health,
    /// Show the registry.
    List,
    /// Print the load-balancer config rendered from the registry.
    Render,
    /// Run the drift and health monitor until Ctrl-C.
    Monitor,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let mut config = FleetConfig::from_file(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    if let Some(password) = cli.panel_password {
        config.panel.password = Some(Secret::new(password));
    }
    let fleet = Fleet::from_config(config)?;
    let format = cli.format;

    match cli.command {
        Command::Provision {
            name,
            address,
            domain,
            ssh_user,
            ssh_port,
            ssh_password,
            ssh_key,
            backend_port,
        } => {
            let args = ProvisionArgs {
                name,
                address,
                domain,
                ssh_user,
                ssh_port,
                ssh_password,
                ssh_key,
                backend_port,
            };
            commands::node::provision(&fleet, args, format).await
        }
        Command::Resume { name } => commands::node::resume(&fleet, &name, format).await,
        Command::Remove { name, retain } => {
            commands::node::remove(&fleet, &name, retain, format).await
        }
        Command::Sync { node } => commands::sync::sync(&fleet, node.as_deref(), format).await,
        Command::Health => commands::health::health(&fleet, format).await,
        Command::List => commands::node::list(&fleet, format),
        Command::Render => commands::sync::render(&fleet),
        Command::Monitor => commands::health::monitor(&fleet).await,
    }
}

/// Logs go to stderr; stdout carries command output.
fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}
