//! anonmanager — reversible Tor anonymization for a Linux workstation.
//!
//! The binary is the orchestrator: it probes the host, snapshots what it is
//! about to change, routes everything through a Tor instance inside an
//! isolated network namespace behind a fail-closed killswitch, and puts the
//! host back exactly as it found it.

mod logging;
mod menu;
mod orchestrator;
mod packages;
mod probe;
mod verifier;
mod watchdog;

use anon_common::Fault;
use anon_config::{load_settings, Paths};
use anon_state::ProcessLock;
use anyhow::Result;
use clap::{ArgGroup, Parser};
use nix::unistd::geteuid;
use orchestrator::Orchestrator;
use std::path::PathBuf;
use tracing::warn;

#[derive(Debug, Parser)]
#[command(
    name = "anonmanager",
    version,
    about = "Route the whole host through Tor in an isolated namespace, reversibly",
    group(ArgGroup::new("action").multiple(false))
)]
struct Cli {
    /// Enable extreme mode: killswitch, sysctl hardening, MAC rotation
    #[arg(long, group = "action")]
    extreme: bool,

    /// Enable partial mode: Tor routing and DNS only
    #[arg(long, group = "action")]
    partial: bool,

    /// Clean ordered teardown back to the pre-enable state
    #[arg(long, group = "action")]
    disable: bool,

    /// Print the status dashboard
    #[arg(long, group = "action")]
    status: bool,

    /// Run the ten-point verification
    #[arg(long, group = "action")]
    verify: bool,

    /// Request a new Tor identity
    #[arg(long, group = "action")]
    newid: bool,

    /// Emergency restore from arbitrary intermediate state
    #[arg(long, group = "action")]
    restore: bool,

    /// Show the activity and security logs
    #[arg(long, group = "action")]
    logs: bool,

    #[arg(long, group = "action", hide = true)]
    watchdog_daemon: bool,

    /// Alternate configuration root (primarily for the spawned watchdog)
    #[arg(long, hide = true, value_name = "DIR")]
    config_root: Option<PathBuf>,
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            use clap::error::ErrorKind;
            let code = match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
                _ => 1,
            };
            let _ = e.print();
            std::process::exit(code);
        }
    };

    if let Err(e) = run(cli) {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}

#[tokio::main]
async fn run(cli: Cli) -> Result<()> {
    if !geteuid().is_root() {
        return Err(Fault::Permission.into());
    }

    let paths = cli.config_root.clone().map(Paths::at).unwrap_or_else(Paths::system);
    paths.ensure_layout()?;
    logging::init(&paths)?;
    let settings = load_settings(paths.config_file())?;

    // The daemon mutates nothing; it runs alongside whoever holds the lock.
    if cli.watchdog_daemon {
        return watchdog::run_daemon(paths, settings).await;
    }

    let _lock = ProcessLock::acquire(paths.lock_file())?;

    let caps = probe::probe(&settings).await?;
    let orchestrator = Orchestrator::new(paths.clone(), settings.clone(), caps.clone());

    if cli.extreme || cli.partial {
        probe::require_supported(&caps)?;
        if cli.extreme {
            return cancellable(orchestrator.enable_extreme(), &orchestrator).await;
        } else {
            return cancellable(orchestrator.enable_partial(), &orchestrator).await;
        }
    }
    if cli.disable {
        return cancellable(orchestrator.disable(), &orchestrator).await;
    }
    if cli.restore {
        return orchestrator.emergency_restore().await;
    }
    if cli.status {
        return menu::print_status(&orchestrator, &paths, &settings, &caps).await;
    }
    if cli.verify {
        let summary = verifier::run(&paths, &settings, &caps).await;
        menu::print_verify_summary(&summary);
        return Ok(());
    }
    if cli.newid {
        return orchestrator.new_identity().await;
    }
    if cli.logs {
        return menu::show_logs(&paths);
    }

    menu::run(&orchestrator, &paths, &settings, &caps).await
}

/// Run an operation, diverting to emergency restore if a termination signal
/// lands mid-flight. The lock is released by drop on the way out.
async fn cancellable(
    op: impl std::future::Future<Output = Result<()>>,
    orchestrator: &Orchestrator,
) -> Result<()> {
    tokio::select! {
        result = op => result,
        _ = termination_signal() => {
            warn!("termination signal received; restoring");
            orchestrator.emergency_restore().await?;
            anyhow::bail!("interrupted by signal; system restored")
        }
    }
}

async fn termination_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(_) => {
            // Fall back to Ctrl-C only.
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}
