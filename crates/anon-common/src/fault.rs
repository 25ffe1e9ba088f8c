use thiserror::Error;

/// Typed faults surfaced to the operator.
///
/// Every terminal message names one remedial action so a failed run is never
/// a dead end.
#[derive(Debug, Error)]
pub enum Fault {
    #[error("not invoked as root; run with elevated privileges (sudo)")]
    Permission,

    #[error("another instance holds the system lock (pid {0}); let it finish or remove the stale lock file")]
    LockContention(i32),

    #[error("unsupported host: {0}; install a supported firewall backend (nftables or iptables)")]
    UnsupportedHost(String),

    #[error("snapshot '{0}' is absent or incomplete; use --restore to fall back to safe defaults")]
    SnapshotInvalid(String),

    #[error("step '{step}' failed: {detail}; use --restore to recover")]
    Step { step: &'static str, detail: String },

    #[error("Tor did not reach 100% bootstrap within {0} s; check upstream connectivity, then use --restore to recover")]
    BootstrapTimeout(u64),

    #[error("required tool '{tool}' not found; install package {package}")]
    ToolMissing { tool: String, package: String },

    #[error("'{command}' exceeded its {}-second bound", .timeout.as_secs())]
    Transient { command: String, timeout: std::time::Duration },
}

impl Fault {
    pub fn step(step: &'static str, detail: impl Into<String>) -> Self {
        Fault::Step { step, detail: detail.into() }
    }

    pub fn tool_missing(tool: impl Into<String>) -> Self {
        let tool = tool.into();
        Fault::ToolMissing { package: tool.clone(), tool }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn every_terminal_message_names_a_remedy() {
        let faults = [
            Fault::Permission,
            Fault::LockContention(4242),
            Fault::UnsupportedHost("no firewall backend".into()),
            Fault::SnapshotInvalid("initial".into()),
            Fault::step("firewall engage", "nft exited 1"),
            Fault::BootstrapTimeout(180),
            Fault::tool_missing("nft"),
            Fault::Transient { command: "sysctl -w".into(), timeout: Duration::from_secs(2) },
        ];
        for fault in faults {
            let msg = fault.to_string();
            let remedial = msg.contains("sudo")
                || msg.contains("install")
                || msg.contains("--restore")
                || msg.contains("lock file")
                || msg.contains("bound");
            assert!(remedial, "no remedy in: {msg}");
        }
    }
}
