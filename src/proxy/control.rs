//! Proxy control-channel client.
//!
//! Line-oriented cooperative session on the loopback control port. The
//! client authenticates with the hex of a cookie file from the proxy's
//! data directory, then issues `GETINFO status/bootstrap-phase` queries
//! and `SIGNAL` commands. Replies are `250`-prefixed lines; anything else
//! is a command failure.

use std::path::Path;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

/// Per-command timeout.
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(3);

/// Cookie file name inside the proxy data directory.
pub const COOKIE_FILE_NAME: &str = "control_auth_cookie";

/// Control-channel errors.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("control i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("control command timed out")]
    Timeout,

    #[error("authentication rejected: {0}")]
    AuthRejected(String),

    #[error("command failed: {0}")]
    CommandFailed(String),

    #[error("control cookie not found in data directory")]
    MissingCookie,
}

/// Parsed bootstrap phase.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BootstrapPhase {
    /// Progress percentage, 0..=100.
    pub progress: u8,
    /// Human-readable summary from the proxy.
    pub summary: String,
}

impl BootstrapPhase {
    /// Whether the proxy is fully bootstrapped.
    pub fn is_complete(&self) -> bool {
        self.progress >= 100
    }
}

/// Extract `PROGRESS=<int>` and `SUMMARY="..."` tokens from a bootstrap
/// status line. Returns None when no progress token is present.
pub fn parse_bootstrap_line(line: &str) -> Option<BootstrapPhase> {
    let progress_start = line.find("PROGRESS=")?;
    let progress_str: String = line[progress_start + "PROGRESS=".len()..]
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    let progress: u8 = progress_str.parse().ok()?;

    let summary = line
        .find("SUMMARY=\"")
        .and_then(|start| {
            let rest = &line[start + "SUMMARY=\"".len()..];
            rest.find('"').map(|end| rest[..end].to_string())
        })
        .unwrap_or_default();

    Some(BootstrapPhase {
        progress: progress.min(100),
        summary,
    })
}

/// Read the control cookie and return its hex form.
pub fn read_cookie_hex(data_dir: &Path) -> Result<String, ControlError> {
    let path = data_dir.join(COOKIE_FILE_NAME);
    let bytes = std::fs::read(&path).map_err(|_| ControlError::MissingCookie)?;
    Ok(hex::encode(bytes))
}

/// An authenticated control session.
pub struct ControlClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl ControlClient {
    /// Connect to the loopback control port.
    pub async fn connect(port: u16) -> Result<Self, ControlError> {
        let stream = timeout(COMMAND_TIMEOUT, TcpStream::connect(("127.0.0.1", port)))
            .await
            .map_err(|_| ControlError::Timeout)??;
        let (read_half, write_half) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(read_half),
            writer: write_half,
        })
    }

    /// Authenticate with a cookie hex credential.
    pub async fn authenticate(&mut self, cookie_hex: &str) -> Result<(), ControlError> {
        let reply = self
            .exchange(&format!("AUTHENTICATE {}", cookie_hex))
            .await?;
        if reply.starts_with("250") {
            Ok(())
        } else {
            Err(ControlError::AuthRejected(reply))
        }
    }

    /// Query the bootstrap phase.
    pub async fn bootstrap_phase(&mut self) -> Result<BootstrapPhase, ControlError> {
        let reply = self.exchange("GETINFO status/bootstrap-phase").await?;
        if !reply.starts_with("250") {
            return Err(ControlError::CommandFailed(reply));
        }
        parse_bootstrap_line(&reply)
            .ok_or_else(|| ControlError::CommandFailed(format!("no PROGRESS token: {}", reply)))
    }

    /// Nudge the proxy after a network path change or app foreground.
    pub async fn signal_active(&mut self) -> Result<(), ControlError> {
        self.signal("ACTIVE").await
    }

    /// Ask the proxy to shut down (restart path).
    pub async fn signal_shutdown(&mut self) -> Result<(), ControlError> {
        self.signal("SHUTDOWN").await
    }

    async fn signal(&mut self, name: &str) -> Result<(), ControlError> {
        let reply = self.exchange(&format!("SIGNAL {}", name)).await?;
        if reply.starts_with("250") {
            Ok(())
        } else {
            Err(ControlError::CommandFailed(reply))
        }
    }

    /// Send one command and read its reply, under the command timeout.
    ///
    /// Replies may span several `250-` continuation lines before the
    /// final status line; the first line carries the data we parse and
    /// the rest is drained so the next exchange starts clean.
    async fn exchange(&mut self, command: &str) -> Result<String, ControlError> {
        timeout(COMMAND_TIMEOUT, async {
            self.writer
                .write_all(format!("{}\r\n", command).as_bytes())
                .await?;

            let mut first = String::new();
            self.reader.read_line(&mut first).await?;
            let first = first.trim_end().to_string();

            let mut last = first.clone();
            while last.starts_with("250-") || last.starts_with("250+") {
                let mut next = String::new();
                if self.reader.read_line(&mut next).await? == 0 {
                    break;
                }
                last = next.trim_end().to_string();
            }

            debug!(command, reply = %first, "Control exchange");
            Ok::<String, std::io::Error>(first)
        })
        .await
        .map_err(|_| ControlError::Timeout)?
        .map_err(ControlError::Io)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bootstrap_line_full() {
        let line = r#"250-status/bootstrap-phase=NOTICE BOOTSTRAP PROGRESS=85 TAG=ap_handshake_done SUMMARY="Handshake finished with a relay to build circuits""#;
        let phase = parse_bootstrap_line(line).unwrap();
        assert_eq!(phase.progress, 85);
        assert_eq!(
            phase.summary,
            "Handshake finished with a relay to build circuits"
        );
        assert!(!phase.is_complete());
    }

    #[test]
    fn test_parse_bootstrap_line_done() {
        let line = r#"250-status/bootstrap-phase=NOTICE BOOTSTRAP PROGRESS=100 TAG=done SUMMARY="Done""#;
        let phase = parse_bootstrap_line(line).unwrap();
        assert_eq!(phase.progress, 100);
        assert_eq!(phase.summary, "Done");
        assert!(phase.is_complete());
    }

    #[test]
    fn test_parse_bootstrap_line_missing_summary() {
        let phase = parse_bootstrap_line("PROGRESS=40").unwrap();
        assert_eq!(phase.progress, 40);
        assert_eq!(phase.summary, "");
    }

    #[test]
    fn test_parse_bootstrap_line_no_progress() {
        assert_eq!(parse_bootstrap_line("250 OK"), None);
        assert_eq!(parse_bootstrap_line("PROGRESS=abc"), None);
    }

    #[test]
    fn test_parse_bootstrap_line_clamps() {
        let phase = parse_bootstrap_line("PROGRESS=250").unwrap();
        assert_eq!(phase.progress, 100);
    }

    #[test]
    fn test_read_cookie_hex() {
        let dir = std::env::temp_dir().join(format!("nightjar-cookie-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(COOKIE_FILE_NAME), [0xde, 0xad, 0xbe, 0xef]).unwrap();

        assert_eq!(read_cookie_hex(&dir).unwrap(), "deadbeef");

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_read_cookie_missing() {
        let dir = std::env::temp_dir().join("nightjar-no-such-dir");
        assert!(matches!(
            read_cookie_hex(&dir),
            Err(ControlError::MissingCookie)
        ));
    }
}
