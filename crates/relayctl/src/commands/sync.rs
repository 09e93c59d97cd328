use std::process::ExitCode;

use relayctl::Fleet;

use super::{Format, ctrl_c_signal, print_json, print_sync, sync_exit};

pub async fn sync(fleet: &Fleet, node: Option<&str>, format: Format) -> anyhow::Result<ExitCode> {
    let report = match node {
        Some(name) => fleet.sync_one(name).await?,
        None => fleet.sync_all(Some(ctrl_c_signal())).await?,
    };
    match format {
        Format::Json => print_json(&report)?,
        Format::Text => {
            if let Some(snapshot) = &report.snapshot {
                println!("config {}", snapshot.short());
            }
            print_sync(&report);
        }
    }
    Ok(sync_exit(&report))
}

pub fn render(fleet: &Fleet) -> anyhow::Result<ExitCode> {
    print!("{}", fleet.render()?);
    Ok(ExitCode::SUCCESS)
}
