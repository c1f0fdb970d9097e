//! Runs a fixed set of cells as child processes and aggregates their output.

use anyhow::{anyhow, Context, Result};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tracing::{info, warn};

pub const LOG_CAPACITY: usize = 1000;
pub const STOP_GRACE: Duration = Duration::from_secs(2);
/// Chaos mode never takes the cluster below this many running cells.
pub const MIN_ALIVE: usize = 2;

/// Most recent output lines across all cells, oldest first.
#[derive(Debug)]
pub struct LogBuffer {
    lines: VecDeque<String>,
    capacity: usize,
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, line: String) {
        if self.capacity == 0 {
            return;
        }
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.iter().cloned().collect()
    }
}

pub fn format_log_line(port: u16, line: &str) -> String {
    format!(
        "[{}] [Cell-{port}] {}",
        chrono::Local::now().format("%H:%M:%S"),
        line.trim_end()
    )
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClusterStatus {
    pub active_ports: Vec<u16>,
    pub total_ports: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChaosAction {
    Kill(u16),
    Revive(u16),
}

/// Picks one port at random: a running one is killed when enough others
/// stay up, a stopped one is revived.
pub fn choose_chaos_action<R: Rng>(all: &[u16], active: &[u16], rng: &mut R) -> Option<ChaosAction> {
    let port = *all.choose(rng)?;
    if active.contains(&port) {
        (active.len() > MIN_ALIVE).then_some(ChaosAction::Kill(port))
    } else {
        Some(ChaosAction::Revive(port))
    }
}

#[derive(Debug, Clone)]
pub struct ClusterSpec {
    pub ports: Vec<u16>,
    pub node_bin: PathBuf,
    pub storage_root: PathBuf,
    pub config: Option<PathBuf>,
}

impl ClusterSpec {
    pub fn neighbors_of(&self, port: u16) -> Vec<u16> {
        self.ports.iter().copied().filter(|p| *p != port).collect()
    }

    pub fn storage_dir(&self, port: u16) -> PathBuf {
        self.storage_root.join(format!("storage_{port}"))
    }
}

pub struct Supervisor {
    spec: ClusterSpec,
    children: BTreeMap<u16, Child>,
    logs: Arc<Mutex<LogBuffer>>,
    echo: bool,
}

impl Supervisor {
    pub fn new(spec: ClusterSpec) -> Self {
        Self {
            spec,
            children: BTreeMap::new(),
            logs: Arc::new(Mutex::new(LogBuffer::new(LOG_CAPACITY))),
            echo: true,
        }
    }

    /// Keeps output in the buffer without printing it.
    pub fn quiet(mut self) -> Self {
        self.echo = false;
        self
    }

    /// Removes every cell's storage directory so the cluster starts empty.
    pub fn wipe_storage(&self) -> Result<()> {
        for port in &self.spec.ports {
            let dir = self.spec.storage_dir(*port);
            if dir.exists() {
                fs::remove_dir_all(&dir)
                    .with_context(|| format!("failed to wipe {}", dir.display()))?;
            }
        }
        Ok(())
    }

    pub fn start(&mut self, port: u16) -> Result<()> {
        if !self.spec.ports.contains(&port) {
            return Err(anyhow!("port {port} is not part of this cluster"));
        }
        if self.is_running(port) {
            return Ok(());
        }

        let mut command = Command::new(&self.spec.node_bin);
        command
            .arg("--port")
            .arg(port.to_string())
            .arg("--storage-root")
            .arg(&self.spec.storage_root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let neighbors = self.spec.neighbors_of(port);
        if !neighbors.is_empty() {
            let joined: Vec<String> = neighbors.iter().map(u16::to_string).collect();
            command.arg("--neighbors").arg(joined.join(","));
        }
        if let Some(config) = &self.spec.config {
            command.arg("--config").arg(config);
        }

        let mut child = command
            .spawn()
            .with_context(|| format!("failed to launch {}", self.spec.node_bin.display()))?;
        if let Some(stdout) = child.stdout.take() {
            self.pump(port, stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            self.pump(port, stderr);
        }
        info!(port, pid = ?child.id(), "Cell process started");
        self.children.insert(port, child);
        Ok(())
    }

    pub fn revive(&mut self, port: u16) -> Result<()> {
        self.start(port)
    }

    /// Asks the cell to shut down and force-kills it after [`STOP_GRACE`].
    pub async fn stop(&mut self, port: u16) -> Result<()> {
        let Some(mut child) = self.children.remove(&port) else {
            return Ok(());
        };
        request_terminate(&child);
        match tokio::time::timeout(STOP_GRACE, child.wait()).await {
            Ok(status) => {
                info!(port, status = ?status.ok(), "Cell process stopped");
                Ok(())
            }
            Err(_) => {
                warn!(port, "Cell ignored termination, killing it");
                child
                    .kill()
                    .await
                    .with_context(|| format!("failed to kill cell {port}"))
            }
        }
    }

    pub async fn kill(&mut self, port: u16) -> Result<()> {
        let Some(mut child) = self.children.remove(&port) else {
            return Ok(());
        };
        child
            .kill()
            .await
            .with_context(|| format!("failed to kill cell {port}"))?;
        warn!(port, "Cell process killed");
        Ok(())
    }

    pub async fn stop_all(&mut self) {
        let ports: Vec<u16> = self.children.keys().copied().collect();
        for port in ports {
            if let Err(e) = self.stop(port).await {
                warn!(port, error = %e, "Failed to stop cell");
            }
        }
    }

    /// Also forgets children that have exited on their own.
    pub fn status(&mut self) -> ClusterStatus {
        self.children
            .retain(|_, child| matches!(child.try_wait(), Ok(None)));
        ClusterStatus {
            active_ports: self.children.keys().copied().collect(),
            total_ports: self.spec.ports.len(),
        }
    }

    pub fn logs(&self) -> Vec<String> {
        match self.logs.lock() {
            Ok(buffer) => buffer.lines(),
            Err(poisoned) => poisoned.into_inner().lines(),
        }
    }

    pub async fn chaos_step<R: Rng>(&mut self, rng: &mut R) -> Result<Option<ChaosAction>> {
        let active = self.status().active_ports;
        let action = choose_chaos_action(&self.spec.ports, &active, rng);
        match action {
            Some(ChaosAction::Kill(port)) => {
                info!(port, "Chaos: killing cell");
                self.kill(port).await?;
            }
            Some(ChaosAction::Revive(port)) => {
                info!(port, "Chaos: reviving cell");
                self.revive(port)?;
            }
            None => {}
        }
        Ok(action)
    }

    fn is_running(&mut self, port: u16) -> bool {
        match self.children.get_mut(&port) {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    fn pump<R>(&self, port: u16, output: R)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let logs = Arc::clone(&self.logs);
        let echo = self.echo;
        tokio::spawn(async move {
            let mut lines = BufReader::new(output).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let entry = format_log_line(port, &line);
                if echo {
                    println!("{entry}");
                }
                match logs.lock() {
                    Ok(mut buffer) => buffer.push(entry),
                    Err(poisoned) => poisoned.into_inner().push(entry),
                }
            }
        });
    }
}

#[cfg(unix)]
fn request_terminate(child: &Child) {
    let Some(pid) = child.id().and_then(|pid| libc::pid_t::try_from(pid).ok()) else {
        return;
    };
    // SAFETY: `pid` is a child we spawned and have not reaped yet.
    if unsafe { libc::kill(pid, libc::SIGTERM) } != 0 {
        warn!(pid, error = %std::io::Error::last_os_error(), "Failed to deliver SIGTERM");
    }
}

#[cfg(not(unix))]
fn request_terminate(_child: &Child) {}

/// Default location of the cell binary: next to the running executable.
pub fn default_node_bin() -> PathBuf {
    let name = format!("cellsync-node{}", std::env::consts::EXE_SUFFIX);
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
        .map(|dir| dir.join(&name))
        .unwrap_or_else(|| PathBuf::from(name))
}
