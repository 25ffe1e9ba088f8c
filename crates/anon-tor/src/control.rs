//! Minimal Tor control-port client: cookie authentication, one query per
//! connection. Enough for bootstrap polling and identity rotation, nothing
//! more.

use anon_common::topology::{CONTROL_PORT, TOR_IP};
use anon_common::Fault;
use anyhow::{bail, Context, Result};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, warn};

const IO_BOUND: Duration = Duration::from_secs(5);
const POLL_PERIOD: Duration = Duration::from_secs(2);

pub struct ControlClient {
    addr: SocketAddr,
    cookie_path: PathBuf,
}

impl ControlClient {
    /// Client for the in-namespace control endpoint; the cookie lives in
    /// the Tor data directory.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            addr: SocketAddr::from((TOR_IP, CONTROL_PORT)),
            cookie_path: data_dir.into().join("control_auth_cookie"),
        }
    }

    /// Current bootstrap progress as `(percent, phase tag)`.
    pub async fn bootstrap_progress(&self) -> Result<(u8, String)> {
        let reply = self.query("GETINFO status/bootstrap-phase").await?;
        reply
            .iter()
            .find_map(|line| parse_bootstrap_line(line))
            .context("no bootstrap phase in control reply")
    }

    /// Poll until Tor reports 100%, the process dies, or the window closes.
    pub async fn wait_until_done(
        &self,
        window: Duration,
        tor_alive: impl Fn() -> bool,
    ) -> Result<()> {
        let deadline = Instant::now() + window;
        loop {
            if !tor_alive() {
                bail!("tor exited before completing bootstrap");
            }
            match self.bootstrap_progress().await {
                Ok((percent, tag)) => {
                    debug!(percent, %tag, "bootstrap progress");
                    if percent >= 100 {
                        return Ok(());
                    }
                }
                // The control port may not be up yet; keep polling.
                Err(e) => debug!(error = %e, "control port not answering yet"),
            }
            if Instant::now() >= deadline {
                return Err(Fault::BootstrapTimeout(window.as_secs()).into());
            }
            sleep(POLL_PERIOD).await;
        }
    }

    /// Request a fresh circuit identity.
    pub async fn new_identity(&self) -> Result<()> {
        self.query("SIGNAL NEWNYM").await?;
        Ok(())
    }

    /// One authenticated command over a short-lived connection.
    async fn query(&self, command: &str) -> Result<Vec<String>> {
        let cookie = std::fs::read(&self.cookie_path)
            .with_context(|| format!("failed to read auth cookie {}", self.cookie_path.display()))?;
        let cookie_hex: String = cookie.iter().map(|b| format!("{b:02x}")).collect();

        let stream = timeout(IO_BOUND, TcpStream::connect(self.addr))
            .await
            .map_err(|_| Fault::Transient {
                command: format!("connect {}", self.addr),
                timeout: IO_BOUND,
            })?
            .context("failed to connect to control port")?;
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        send_line(&mut write_half, &format!("AUTHENTICATE {cookie_hex}")).await?;
        let auth = read_reply(&mut reader).await?;
        if !reply_ok(&auth) {
            bail!("control port refused authentication: {auth:?}");
        }

        send_line(&mut write_half, command).await?;
        let reply = read_reply(&mut reader).await?;
        if !reply_ok(&reply) {
            bail!("control command {command:?} failed: {reply:?}");
        }

        if let Err(e) = send_line(&mut write_half, "QUIT").await {
            warn!(error = %e, "control connection did not close cleanly");
        }
        Ok(reply)
    }
}

async fn send_line(
    stream: &mut tokio::net::tcp::OwnedWriteHalf,
    line: &str,
) -> Result<()> {
    let payload = format!("{line}\r\n");
    timeout(IO_BOUND, stream.write_all(payload.as_bytes()))
        .await
        .map_err(|_| Fault::Transient { command: "control write".into(), timeout: IO_BOUND })?
        .context("control write failed")?;
    Ok(())
}

/// Read one reply: lines up to and including the final `NNN ` line.
async fn read_reply(
    reader: &mut BufReader<tokio::net::tcp::OwnedReadHalf>,
) -> Result<Vec<String>> {
    let mut lines = Vec::new();
    loop {
        let mut line = String::new();
        let n = timeout(IO_BOUND, reader.read_line(&mut line))
            .await
            .map_err(|_| Fault::Transient { command: "control read".into(), timeout: IO_BOUND })?
            .context("control read failed")?;
        if n == 0 {
            bail!("control connection closed mid-reply");
        }
        let trimmed = line.trim_end().to_string();
        let is_final = trimmed.len() >= 4 && trimmed.as_bytes()[3] == b' ';
        lines.push(trimmed);
        if is_final {
            return Ok(lines);
        }
    }
}

fn reply_ok(lines: &[String]) -> bool {
    lines.last().is_some_and(|line| line.starts_with("250"))
}

/// Extract `(percent, tag)` from a bootstrap status line such as
/// `250-status/bootstrap-phase=NOTICE BOOTSTRAP PROGRESS=85 TAG=ap_conn ...`.
fn parse_bootstrap_line(line: &str) -> Option<(u8, String)> {
    let progress = line.split("PROGRESS=").nth(1)?;
    let percent: u8 = progress
        .chars()
        .take_while(char::is_ascii_digit)
        .collect::<String>()
        .parse()
        .ok()?;
    let tag = line
        .split("TAG=")
        .nth(1)
        .map(|rest| rest.split_whitespace().next().unwrap_or("").to_string())
        .unwrap_or_default();
    Some((percent.min(100), tag))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_mid_bootstrap_line() {
        let line = r#"250-status/bootstrap-phase=NOTICE BOOTSTRAP PROGRESS=85 TAG=ap_handshake_done SUMMARY="Handshake finished with a relay to build circuits""#;
        let (percent, tag) = parse_bootstrap_line(line).unwrap();
        assert_eq!(percent, 85);
        assert_eq!(tag, "ap_handshake_done");
    }

    #[test]
    fn parses_the_done_line() {
        let line = r#"250-status/bootstrap-phase=NOTICE BOOTSTRAP PROGRESS=100 TAG=done SUMMARY="Done""#;
        assert_eq!(parse_bootstrap_line(line).unwrap(), (100, "done".to_string()));
    }

    #[test]
    fn ignores_lines_without_progress() {
        assert!(parse_bootstrap_line("250 OK").is_none());
        assert!(parse_bootstrap_line("").is_none());
    }

    #[test]
    fn final_reply_detection() {
        assert!(reply_ok(&["250-something".into(), "250 OK".into()]));
        assert!(!reply_ok(&["515 Bad authentication".into()]));
        assert!(!reply_ok(&[]));
    }
}
