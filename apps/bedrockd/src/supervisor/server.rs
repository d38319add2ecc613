use std::path::Path;
use std::process::Stdio;

use anyhow::{Context, Result};
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration};
use tracing::{info, warn};

/// What the stdout reader task forwards to the control loop.
#[derive(Debug)]
pub enum ServerEvent {
    Line(String),
    /// stdout reached EOF: the server process is gone or going.
    Closed,
}

/// Handle on the running bedrock_server child: its stdin for protocol
/// commands, and the child itself for shutdown.
pub struct ServerHandle {
    child: Child,
    stdin: ChildStdin,
}

/// Point-in-time stats for the server child.
#[derive(Debug)]
pub struct ResourceUsage {
    pub cpu_percent: f32,
    pub memory_bytes: u64,
}

impl ServerHandle {
    /// Spawns the server with piped stdio. Stdout lines are forwarded as
    /// events; stderr lines go straight to the log.
    pub async fn spawn(
        executable: &Path,
        server_root: &Path,
    ) -> Result<(Self, mpsc::Receiver<ServerEvent>)> {
        let mut child = Command::new(executable)
            .current_dir(server_root)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to spawn server {}", executable.display()))?;

        let stdin = child
            .stdin
            .take()
            .context("server child has no stdin pipe")?;
        let stdout = child
            .stdout
            .take()
            .context("server child has no stdout pipe")?;

        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if tx.send(ServerEvent::Line(line)).await.is_err() {
                    return;
                }
            }
            let _ = tx.send(ServerEvent::Closed).await;
        });

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    warn!("[server stderr] {line}");
                }
            });
        }

        info!(pid = child.id().unwrap_or_default(), "server process started");
        Ok((Self { child, stdin }, rx))
    }

    /// Writes one protocol command; the server expects CRLF line endings.
    pub async fn write_line(&mut self, line: &str) -> Result<()> {
        self.stdin
            .write_all(format!("{line}\r\n").as_bytes())
            .await
            .context("failed to write to server stdin")?;
        self.stdin.flush().await.context("failed to flush server stdin")
    }

    /// Samples the child's cpu and memory. Cpu usage needs two samples a
    /// short interval apart, so this takes a beat. Returns None once the
    /// child is gone.
    pub async fn resource_usage(&self) -> Option<ResourceUsage> {
        let pid = Pid::from_u32(self.child.id()?);
        let refresh = ProcessRefreshKind::nothing().with_cpu().with_memory();
        let mut system = System::new();
        system.refresh_processes_specifics(ProcessesToUpdate::Some(&[pid]), true, refresh);
        sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL).await;
        system.refresh_processes_specifics(ProcessesToUpdate::Some(&[pid]), true, refresh);
        let process = system.process(pid)?;
        Some(ResourceUsage {
            cpu_percent: process.cpu_usage(),
            memory_bytes: process.memory(),
        })
    }

    /// Waits up to `grace` for the child to exit on its own, then kills it.
    pub async fn wait_for_exit(mut self, grace: Duration) {
        let deadline = tokio::time::Instant::now() + grace;
        loop {
            match self.child.try_wait() {
                Ok(Some(status)) => {
                    info!(code = status.code(), "server process exited");
                    return;
                }
                Ok(None) => {}
                Err(err) => {
                    warn!("failed to poll server process: {err}");
                    return;
                }
            }
            if tokio::time::Instant::now() >= deadline {
                warn!("server did not exit within grace period, killing it");
                let _ = self.child.kill().await;
                return;
            }
            sleep(Duration::from_millis(250)).await;
        }
    }
}
