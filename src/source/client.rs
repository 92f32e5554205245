//! Vendor ASR client process
//!
//! The device's recognizer runs as a separate binary that takes line
//! commands on stdin (`wakeup`, `asrtimeout,{ms}`, `exit`). Its output is
//! forwarded into tracing; its recognition results reach us through the
//! debug log read by [`super::LogTailSource`].

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::Mutex;

use crate::{Error, Result};

/// Device client configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceClientConfig {
    /// Path of the vendor client binary
    pub program: PathBuf,
    /// Extra arguments passed to the binary
    pub args: Vec<String>,
    /// Launch through `sudo`
    pub use_sudo: bool,
    /// ASR timeout sent on startup, in milliseconds
    pub asr_timeout_ms: u64,
    /// How long `exit` is given before the process is killed
    pub graceful_timeout: Duration,
}

impl Default for DeviceClientConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("/system/bin/MiVpmClient"),
            args: Vec::new(),
            use_sudo: true,
            asr_timeout_ms: 5000,
            graceful_timeout: Duration::from_secs(3),
        }
    }
}

/// Running vendor ASR client
pub struct DeviceClient {
    child: Mutex<Child>,
    stdin: Mutex<Option<ChildStdin>>,
    graceful_timeout: Duration,
}

impl DeviceClient {
    /// Spawn the client and send the startup ASR timeout
    ///
    /// # Errors
    ///
    /// Returns error if the binary cannot be spawned or does not accept
    /// commands
    pub async fn spawn(config: &DeviceClientConfig) -> Result<Self> {
        let mut cmd = if config.use_sudo {
            let mut c = Command::new("sudo");
            c.arg(&config.program);
            c
        } else {
            Command::new(&config.program)
        };

        cmd.args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            Error::Device(format!(
                "failed to spawn {}: {e}",
                config.program.display()
            ))
        })?;

        let stdin = child.stdin.take();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump_output(stdout, "stdout"));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump_output(stderr, "stderr"));
        }

        tracing::info!(
            program = %config.program.display(),
            pid = ?child.id(),
            "device client started"
        );

        let client = Self {
            child: Mutex::new(child),
            stdin: Mutex::new(stdin),
            graceful_timeout: config.graceful_timeout,
        };

        client
            .send_command(&format!("asrtimeout,{}", config.asr_timeout_ms))
            .await?;

        Ok(client)
    }

    /// Send one line command
    ///
    /// # Errors
    ///
    /// Returns error if the process has exited or its stdin is closed
    pub async fn send_command(&self, command: &str) -> Result<()> {
        let mut guard = self.stdin.lock().await;
        let stdin = guard
            .as_mut()
            .ok_or_else(|| Error::Device("client stdin closed".into()))?;

        let line = format!("{}\n", command.trim());
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| Error::Device(format!("write failed: {e}")))?;
        stdin
            .flush()
            .await
            .map_err(|e| Error::Device(format!("flush failed: {e}")))?;

        tracing::debug!(command = command.trim(), "device command sent");
        Ok(())
    }

    /// Re-arm the recognizer after a query
    ///
    /// # Errors
    ///
    /// Returns error if the command cannot be delivered
    pub async fn wakeup(&self) -> Result<()> {
        self.send_command("wakeup").await
    }

    /// Whether the process is still alive
    pub async fn is_running(&self) -> bool {
        matches!(self.child.lock().await.try_wait(), Ok(None))
    }

    /// Ask the client to exit, killing it after the graceful timeout
    ///
    /// # Errors
    ///
    /// Returns error if the process cannot be killed
    pub async fn shutdown(&self) -> Result<()> {
        if let Err(e) = self.send_command("exit").await {
            tracing::debug!(error = %e, "exit command not delivered");
        }
        // Closing stdin is a second exit signal for clients reading to EOF
        self.stdin.lock().await.take();

        let mut child = self.child.lock().await;
        if let Ok(status) = tokio::time::timeout(self.graceful_timeout, child.wait()).await {
            tracing::info!(status = ?status.ok(), "device client exited");
            return Ok(());
        }

        tracing::warn!("device client ignored exit, killing");
        child
            .kill()
            .await
            .map_err(|e| Error::Device(format!("kill failed: {e}")))
    }
}

/// Forward a child output stream into tracing, line by line
async fn pump_output<R: AsyncRead + Unpin>(stream: R, tag: &'static str) {
    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => tracing::debug!(stream = tag, "{line}"),
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(stream = tag, error = %e, "device output read failed");
                break;
            }
        }
    }
}
