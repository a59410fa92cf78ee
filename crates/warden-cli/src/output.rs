use anyhow::Result;
use colored::Colorize;

use warden_core::{CommandOutput, StatusReport};
use warden_types::{SystemMode, SystemState};

/// Print a command result, as pretty JSON or for a terminal.
pub fn print_output(output: &CommandOutput, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(output)?);
        return Ok(());
    }
    match output {
        CommandOutput::Status(report) => print_status(report),
        CommandOutput::Mode(state) => print_mode(state),
        CommandOutput::Restarted { agent, state } => {
            print_success(&format!("{agent} restarted, now {state}"));
        }
        CommandOutput::LedgerVerified { entries } => {
            print_success(&format!("Ledger intact: {entries} entries verified"));
        }
        CommandOutput::Snapshot(manifest) => {
            print_success(&format!(
                "Snapshot {} v{} ({} files)",
                manifest.snapshot_id,
                manifest.version,
                manifest.files.len()
            ));
            println!("  merkle root: {}", manifest.merkle_root);
            println!("  created at:  {}", manifest.created_at.to_rfc3339());
        }
        CommandOutput::Versions { id, versions } => {
            if versions.is_empty() {
                print_info(&format!("No snapshots for {id}"));
            } else {
                let list: Vec<String> = versions.iter().map(|v| format!("v{v}")).collect();
                println!("{}: {}", id.bold(), list.join(", "));
            }
        }
        CommandOutput::Scan(report) => {
            println!(
                "Scan: {} ok, {} new, {} mismatched, {} skipped",
                report.ok.len(),
                report.new.len(),
                report.mismatched.len(),
                report.skipped.len()
            );
            for name in &report.mismatched {
                print_error(&format!("mismatch: {name}"));
            }
            for (name, why) in &report.skipped {
                println!("  skipped {name}: {why}");
            }
        }
        CommandOutput::Released {
            artifact,
            content_hash,
        } => print_success(&format!("Released {artifact} ({content_hash})")),
        CommandOutput::Attested { artifact } => print_success(&format!("Attested {artifact}")),
        CommandOutput::ChainpackExported {
            path,
            entries,
            head,
        } => {
            print_success(&format!("Chainpack written to {}", path.display()));
            println!("  entries: {entries}");
            println!("  head:    {head}");
        }
    }
    Ok(())
}

fn mode_label(mode: SystemMode) -> String {
    let label = mode.to_string();
    match mode {
        SystemMode::Normal => label.green().bold().to_string(),
        SystemMode::SafeMode | SystemMode::Fallback => label.yellow().bold().to_string(),
        SystemMode::Lockdown => label.red().bold().to_string(),
    }
}

fn print_mode(state: &SystemState) {
    println!(
        "Mode: {} ({}, since {})",
        mode_label(state.mode),
        state.reason,
        state.since.to_rfc3339()
    );
}

fn print_status(report: &StatusReport) {
    print_mode(&report.state);
    println!(
        "Ledger: {} entries, head {}",
        report.ledger_entries,
        report
            .ledger_head
            .map(|h| h.to_string())
            .unwrap_or_else(|| "-".into())
    );
    println!("Exceptions: {}", report.exception_count);

    println!("\n{}", "Agents".bold());
    if report.agents.is_empty() {
        println!("  (none)");
    }
    for agent in &report.agents {
        println!(
            "  {:<16} {:<13} errors={} restarts={} circuit={:?}",
            agent.id.to_string(),
            agent.state.to_string(),
            agent.error_count,
            agent.restarts_in_window,
            agent.circuit
        );
    }

    println!("\n{}", "Artifacts".bold());
    if report.artifacts.is_empty() {
        println!("  (none)");
    }
    for artifact in &report.artifacts {
        println!(
            "  {:<24} {:?} {}",
            artifact.name, artifact.status, artifact.content_hash
        );
    }
}

pub fn print_info(msg: &str) {
    println!("{} {}", "ℹ".blue(), msg);
}

pub fn print_error(msg: &str) {
    eprintln!("{} {}", "✗".red(), msg.red());
}

pub fn print_success(msg: &str) {
    println!("{} {}", "✓".green(), msg);
}
