//! Interactive menu, status dashboard, and log viewer. Thin shell over the
//! same operations the flags expose.

use crate::orchestrator::Orchestrator;
use crate::probe::Capabilities;
use crate::verifier;
use anon_config::{Paths, Settings};
use anon_firewall::backend_for;
use anon_net::{dns, sysctl, NamespaceManager};
use anon_tor::{ControlClient, TorSupervisor};
use anyhow::Result;
use std::io::Write as _;
use std::path::Path;

pub async fn print_status(
    orchestrator: &Orchestrator,
    paths: &Paths,
    settings: &Settings,
    caps: &Capabilities,
) -> Result<()> {
    let state = orchestrator.state()?;

    println!("anonmanager status");
    println!("  active:    {}", state.anonymity_active);
    println!("  mode:      {}", state.mode);
    println!("  profile:   {}", state.profile);
    println!("  distro:    {}", state.distro_family);
    println!("  backend:   {}", state.firewall_backend);

    let supervisor = TorSupervisor::new(
        &caps.tor_user,
        &settings.tor_data_dir,
        paths.torrc(),
        paths.tor_pid_file(),
    );
    let tor_running = supervisor.is_running();
    println!("  tor:       {}", if tor_running { "running" } else { "stopped" });

    if tor_running {
        let control = ControlClient::new(&settings.tor_data_dir);
        match control.bootstrap_progress().await {
            Ok((percent, tag)) => println!("  bootstrap: {percent}% ({tag})"),
            Err(_) => println!("  bootstrap: unknown"),
        }
    }

    println!(
        "  namespace: {}",
        if NamespaceManager::exists() { "present" } else { "absent" }
    );
    let killswitch = match backend_for(caps.firewall_backend) {
        Ok(engine) => engine.is_active().await,
        Err(_) => false,
    };
    println!("  killswitch: {}", if killswitch { "engaged" } else { "off" });
    println!(
        "  dns lock:  {}",
        if dns::points_at_loopback(Path::new("/etc/resolv.conf")) { "locked" } else { "open" }
    );
    println!(
        "  ipv6:      {}",
        match sysctl::read_proc("net.ipv6.conf.all.disable_ipv6").as_deref() {
            Some("1") => "disabled",
            _ => "enabled",
        }
    );

    if state.anonymity_active {
        match orchestrator.exit_ip().await {
            Some(ip) => println!("  exit ip:   {ip}"),
            None => println!("  exit ip:   unavailable"),
        }
    }
    Ok(())
}

pub fn print_verify_summary(summary: &verifier::VerifySummary) {
    println!("verification");
    for result in &summary.results {
        println!("  [{}] {:<14} {}", result.status, result.name, result.detail);
    }
    println!(
        "{} passed, {} warned, {} failed",
        summary.passed(),
        summary.warned(),
        summary.failed()
    );
}

/// Tail both logs to stdout.
pub fn show_logs(paths: &Paths) -> Result<()> {
    for (label, path) in [("activity", paths.activity_log()), ("security", paths.security_log())] {
        println!("--- {label} log ({}) ---", path.display());
        match std::fs::read_to_string(&path) {
            Ok(content) => {
                let lines: Vec<&str> = content.lines().collect();
                let start = lines.len().saturating_sub(40);
                for line in &lines[start..] {
                    println!("{line}");
                }
            }
            Err(_) => println!("(empty)"),
        }
    }
    Ok(())
}

/// Numbered dispatch loop; runs until the operator quits.
pub async fn run(
    orchestrator: &Orchestrator,
    paths: &Paths,
    settings: &Settings,
    caps: &Capabilities,
) -> Result<()> {
    loop {
        println!();
        println!("anonmanager");
        println!("  1) enable extreme mode");
        println!("  2) enable partial mode");
        println!("  3) disable (clean teardown)");
        println!("  4) status");
        println!("  5) verify");
        println!("  6) new tor identity");
        println!("  7) emergency restore");
        println!("  8) view logs");
        println!("  0) quit");
        print!("> ");
        std::io::stdout().flush()?;

        let mut choice = String::new();
        if std::io::stdin().read_line(&mut choice)? == 0 {
            return Ok(());
        }

        let outcome = match choice.trim() {
            "1" => orchestrator.enable_extreme().await,
            "2" => orchestrator.enable_partial().await,
            "3" => orchestrator.disable().await,
            "4" => print_status(orchestrator, paths, settings, caps).await,
            "5" => {
                let summary = verifier::run(paths, settings, caps).await;
                print_verify_summary(&summary);
                Ok(())
            }
            "6" => orchestrator.new_identity().await,
            "7" => orchestrator.emergency_restore().await,
            "8" => show_logs(paths),
            "0" | "q" | "quit" | "exit" => return Ok(()),
            other => {
                println!("unrecognized choice {other:?}");
                Ok(())
            }
        };

        if let Err(e) = outcome {
            eprintln!("error: {e:#}");
        }
    }
}
