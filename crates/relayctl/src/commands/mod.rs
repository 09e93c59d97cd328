pub mod health;
pub mod node;
pub mod sync;

use std::process::ExitCode;

use clap::ValueEnum;
use relaygrid_balancer::SyncReport;
use serde::Serialize;
use tokio::sync::watch;
use tracing::info;

/// Exit status for a run that left some node's config in an unknown state.
pub const EXIT_UNKNOWN: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Format {
    Text,
    Json,
}

pub fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Exit status of a command whose result includes a sync pass.
pub fn sync_exit(report: &SyncReport) -> ExitCode {
    if report.has_unknown() {
        ExitCode::from(EXIT_UNKNOWN)
    } else {
        ExitCode::SUCCESS
    }
}

pub fn print_sync(report: &SyncReport) {
    let counts = report.counts();
    println!(
        "sync: {} applied, {} rolled back, {} unreachable",
        counts.applied, counts.rolled_back, counts.unreachable
    );
    for f in &report.rolled_back {
        println!("  rolled back  {:<16} {}", f.node, f.reason);
    }
    for f in &report.unreachable {
        println!("  unreachable  {:<16} {}", f.node, f.reason);
    }
    for f in &report.failed {
        println!("  failed       {:<16} {}", f.node, f.reason);
    }
    for f in &report.unknown {
        println!("  UNKNOWN      {:<16} {} (manual attention required)", f.node, f.reason);
    }
    for node in &report.skipped {
        println!("  skipped      {node}");
    }
}

/// A stop signal that flips on Ctrl-C.
pub fn ctrl_c_signal() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            let _ = tx.send(true);
        }
    });
    rx
}
