//! IPMI serial-over-LAN console
//!
//! Redfish has no serial console, so console streams come from an
//! `ipmitool sol activate` child process talking to the BMC over
//! `lanplus`. The password is handed over through `IPMI_PASSWORD` (`-E`),
//! never on the command line. The child is killed when the stream drops.

use super::{ConsoleStream, Credentials, OutOfBandError};
use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, warn};

const DEACTIVATE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SolSettings {
    pub program: PathBuf,
    pub interface: String,
    pub port: u16,
}

impl Default for SolSettings {
    fn default() -> Self {
        Self {
            program: PathBuf::from("ipmitool"),
            interface: "lanplus".to_string(),
            port: 623,
        }
    }
}

impl SolSettings {
    fn command(&self, host: &str, credentials: &Credentials, action: &str) -> Command {
        let mut command = Command::new(&self.program);
        command
            .arg("-I")
            .arg(&self.interface)
            .arg("-H")
            .arg(host)
            .arg("-p")
            .arg(self.port.to_string())
            .arg("-U")
            .arg(&credentials.user)
            .arg("-E")
            .args(["sol", action])
            .env("IPMI_PASSWORD", &credentials.password)
            .kill_on_drop(true);
        command
    }
}

/// Open the serial console of the BMC at `host`
///
/// A stale SOL session left by an earlier client is deactivated first.
pub async fn activate(
    settings: &SolSettings,
    host: &str,
    credentials: &Credentials,
) -> Result<ConsoleStream, OutOfBandError> {
    let mut deactivate = settings.command(host, credentials, "deactivate");
    deactivate
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    match tokio::time::timeout(DEACTIVATE_TIMEOUT, deactivate.status()).await {
        Ok(Ok(status)) => debug!(bmc = %host, %status, "sol deactivate finished"),
        Ok(Err(e)) => {
            return Err(OutOfBandError::Console(format!(
                "could not run {}: {}",
                settings.program.display(),
                e
            )))
        }
        Err(_) => warn!(bmc = %host, "sol deactivate timed out"),
    }

    let mut child = settings
        .command(host, credentials, "activate")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| {
            OutOfBandError::Console(format!("could not run {}: {}", settings.program.display(), e))
        })?;

    let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
        return Err(OutOfBandError::Console("console pipes unavailable".to_string()));
    };
    debug!(bmc = %host, "sol console activated");
    Ok(Box::new(SolStream {
        _child: child,
        stdin,
        stdout,
    }))
}

/// Reads from the child's stdout, writes to its stdin
struct SolStream {
    _child: Child,
    stdin: ChildStdin,
    stdout: ChildStdout,
}

impl AsyncRead for SolStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stdout).poll_read(cx, buf)
    }
}

impl AsyncWrite for SolStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stdin).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stdin).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stdin).poll_shutdown(cx)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    // Stands in for ipmitool: checks its arguments, then echoes stdin
    const FAKE_IPMITOOL: &str = r#"#!/bin/sh
case "$*" in
  "-I lanplus -H 10.0.0.5 -p 623 -U ADMIN -E sol deactivate") exit 0 ;;
  "-I lanplus -H 10.0.0.5 -p 623 -U ADMIN -E sol activate") ;;
  *) exit 2 ;;
esac
[ "$IPMI_PASSWORD" = "secret" ] || exit 3
printf '[SOL Session operational]\n'
exec cat
"#;

    fn fake_ipmitool(dir: &tempfile::TempDir) -> PathBuf {
        let path = dir.path().join("ipmitool");
        std::fs::write(&path, FAKE_IPMITOOL).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    async fn read_until(stream: &mut ConsoleStream, needle: &str) -> String {
        let mut seen = String::new();
        let mut buf = [0u8; 128];
        while !seen.contains(needle) {
            let n = stream.read(&mut buf).await.unwrap();
            assert!(n > 0, "console closed, got {seen:?}");
            seen.push_str(&String::from_utf8_lossy(&buf[..n]));
        }
        seen
    }

    #[tokio::test]
    async fn test_console_is_piped_through_ipmitool() {
        let dir = tempfile::tempdir().unwrap();
        let settings = SolSettings {
            program: fake_ipmitool(&dir),
            ..SolSettings::default()
        };

        let mut console = activate(&settings, "10.0.0.5", &Credentials::new("ADMIN", "secret"))
            .await
            .unwrap();
        read_until(&mut console, "operational").await;

        console.write_all(b"root\n").await.unwrap();
        read_until(&mut console, "root\n").await;
    }

    #[tokio::test]
    async fn test_missing_program() {
        let settings = SolSettings {
            program: PathBuf::from("/nonexistent/ipmitool"),
            ..SolSettings::default()
        };
        let result = activate(&settings, "10.0.0.5", &Credentials::new("ADMIN", "secret")).await;
        assert!(matches!(result, Err(OutOfBandError::Console(_))));
    }
}
