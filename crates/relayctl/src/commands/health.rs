use std::process::ExitCode;

use relayctl::Fleet;
use tracing::info;

use super::{Format, ctrl_c_signal, print_json};

pub async fn health(fleet: &Fleet, format: Format) -> anyhow::Result<ExitCode> {
    let report = fleet.check_health().await?;
    match format {
        Format::Json => print_json(&report)?,
        Format::Text => {
            for node in &report.healthy {
                println!("{node:<16} connected");
            }
            for u in &report.unhealthy {
                println!("{:<16} {}", u.node, u.status);
            }
        }
    }
    Ok(if report.is_healthy() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

pub async fn monitor(fleet: &Fleet) -> anyhow::Result<ExitCode> {
    let monitor = fleet.monitor();
    let shutdown = ctrl_c_signal();
    info!(
        interval_secs = fleet.config().monitor.interval_secs,
        "starting fleet monitor, Ctrl-C to stop"
    );
    monitor.run(shutdown).await;
    Ok(ExitCode::SUCCESS)
}
