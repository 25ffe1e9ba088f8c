//! Bounded runner for the host's network tooling.
//!
//! Every mutation of kernel state goes through an external binary (`ip`,
//! `nft`, `iptables`, `sysctl`, ...). Each invocation is argv-exact (no shell
//! involved), captures stderr, is bounded by a timeout, and surfaces its exit
//! code as a typed fault.

use crate::fault::Fault;
use std::io::ErrorKind;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::trace;

/// No call into the kernel may block the pipeline longer than this.
pub const KERNEL_BOUND: Duration = Duration::from_secs(2);

/// Captured result of a finished command.
#[derive(Clone, Debug)]
pub struct Output {
    pub stdout: String,
    pub stderr: String,
    pub code: i32,
}

impl Output {
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

/// Run `bin` with `args` under the default kernel bound, requiring exit 0.
pub async fn run(bin: &str, args: &[&str]) -> Result<Output, Fault> {
    run_bounded(bin, args, None, KERNEL_BOUND, true).await
}

/// Same as [`run`] but a non-zero exit is returned, not a fault.
pub async fn run_unchecked(bin: &str, args: &[&str]) -> Result<Output, Fault> {
    run_bounded(bin, args, None, KERNEL_BOUND, false).await
}

/// Run with an explicit bound, for the few slow paths (tor launch, curl).
pub async fn run_with_bound(bin: &str, args: &[&str], bound: Duration) -> Result<Output, Fault> {
    run_bounded(bin, args, None, bound, true).await
}

/// Explicit bound, non-zero exit tolerated. Service restarts use this.
pub async fn run_unchecked_with_bound(
    bin: &str,
    args: &[&str],
    bound: Duration,
) -> Result<Output, Fault> {
    run_bounded(bin, args, None, bound, false).await
}

/// Feed `stdin` to the command, requiring exit 0. Used for `nft -f -` and
/// the `iptables-restore` family so rule payloads never hit a shell.
pub async fn run_with_stdin(bin: &str, args: &[&str], stdin: &str) -> Result<Output, Fault> {
    run_bounded(bin, args, Some(stdin), KERNEL_BOUND, true).await
}

async fn run_bounded(
    bin: &str,
    args: &[&str],
    stdin: Option<&str>,
    bound: Duration,
    check: bool,
) -> Result<Output, Fault> {
    trace!(bin, ?args, "exec");

    let mut command = Command::new(bin);
    command
        .args(args)
        .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command.spawn().map_err(|e| match e.kind() {
        ErrorKind::NotFound => Fault::tool_missing(bin),
        _ => Fault::step("exec", format!("failed to spawn {bin}: {e}")),
    })?;

    if let Some(data) = stdin
        && let Some(mut pipe) = child.stdin.take()
    {
        pipe.write_all(data.as_bytes())
            .await
            .map_err(|e| Fault::step("exec", format!("failed to feed stdin to {bin}: {e}")))?;
        drop(pipe);
    }

    let gathered = timeout(bound, child.wait_with_output())
        .await
        .map_err(|_| Fault::Transient { command: describe(bin, args), timeout: bound })?
        .map_err(|e| Fault::step("exec", format!("failed to collect output of {bin}: {e}")))?;

    let output = Output {
        stdout: String::from_utf8_lossy(&gathered.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&gathered.stderr).into_owned(),
        code: gathered.status.code().unwrap_or(-1),
    };

    if check && !output.success() {
        return Err(Fault::step(
            "exec",
            format!("{} exited {}: {}", describe(bin, args), output.code, output.stderr.trim()),
        ));
    }

    Ok(output)
}

fn describe(bin: &str, args: &[&str]) -> String {
    let mut s = bin.to_string();
    for a in args.iter().take(4) {
        s.push(' ');
        s.push_str(a);
    }
    s
}

/// Whether `name` is resolvable on the search path.
pub fn tool_exists(name: &str) -> bool {
    which::which(name).is_ok()
}

/// Validate a name that ends up inside a rule or link operation.
///
/// Interface, namespace, and connection identifiers come from probing the
/// host; anything outside this charset is refused before it reaches argv.
pub fn checked_name(name: &str) -> Result<&str, Fault> {
    let ok = !name.is_empty()
        && name.len() <= 64
        && name.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if ok {
        Ok(name)
    } else {
        Err(Fault::step("validate", format!("refusing suspicious identifier {name:?}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let out = run("true", &[]).await.unwrap();
        assert!(out.success());

        let out = run_unchecked("false", &[]).await.unwrap();
        assert_eq!(out.code, 1);
    }

    #[tokio::test]
    async fn nonzero_exit_is_a_step_fault_when_checked() {
        let err = run("false", &[]).await.unwrap_err();
        assert!(matches!(err, Fault::Step { .. }));
    }

    #[tokio::test]
    async fn missing_binary_is_a_tool_fault() {
        let err = run("definitely-not-a-real-binary-9917", &[]).await.unwrap_err();
        assert!(matches!(err, Fault::ToolMissing { .. }));
    }

    #[tokio::test]
    async fn exceeding_the_bound_is_transient() {
        let err = run_bounded("sleep", &["5"], None, Duration::from_millis(50), true)
            .await
            .unwrap_err();
        assert!(matches!(err, Fault::Transient { .. }));
    }

    #[tokio::test]
    async fn stdin_is_fed_verbatim() {
        let out = run_with_stdin("cat", &[], "line one\nline two\n").await.unwrap();
        assert_eq!(out.stdout, "line one\nline two\n");
    }

    #[test]
    fn identifier_validation_rejects_shell_metacharacters() {
        assert!(checked_name("eth0").is_ok());
        assert!(checked_name("veth_host").is_ok());
        assert!(checked_name("wlp3s0.101").is_ok());
        assert!(checked_name("eth0; rm -rf /").is_err());
        assert!(checked_name("$(reboot)").is_err());
        assert!(checked_name("").is_err());
    }
}
