//! One transcoder process: launch, telemetry, stop and wait.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::progress::{Progress, ProgressParser};

/// Builds the command for a launch. Swapped out in tests to run scripts
/// instead of the real transcoder.
pub trait ProcessLauncher: Send + Sync {
    fn command(&self, program: &Path, args: &[String]) -> Command;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemLauncher;

impl ProcessLauncher for SystemLauncher {
    fn command(&self, program: &Path, args: &[String]) -> Command {
        let mut command = Command::new(program);
        command.args(args);
        command
    }
}

/// Receives telemetry from a running process.
pub trait TelemetrySink: Send + Sync {
    fn on_progress(&self, progress: &Progress);

    /// CPU seconds consumed since the previous report.
    fn on_cpu_seconds(&self, seconds: f64);

    fn on_stderr(&self, _line: &str) {}
}

#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub stop_grace: Duration,
    pub cpu_sample_interval: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessExit {
    Exited { code: Option<i32> },
    Stopped,
    WaitFailed(String),
}

impl ProcessExit {
    pub fn code(&self) -> Option<i32> {
        match self {
            ProcessExit::Exited { code } => *code,
            _ => None,
        }
    }
}

pub struct ProcessRunner {
    pid: Option<u32>,
    cancel: CancellationToken,
    exit_rx: Option<oneshot::Receiver<ProcessExit>>,
    exit: Option<ProcessExit>,
    monitor: JoinHandle<()>,
}

impl fmt::Debug for ProcessRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessRunner")
            .field("pid", &self.pid)
            .field("exit", &self.exit)
            .finish()
    }
}

impl ProcessRunner {
    pub fn start(
        launcher: &dyn ProcessLauncher,
        spec: &LaunchSpec,
        sink: Arc<dyn TelemetrySink>,
    ) -> io::Result<Self> {
        let mut command = launcher.command(&spec.program, &spec.args);
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let mut child = command.spawn()?;
        let pid = child.id();

        if let Some(stdout) = child.stdout.take() {
            let sink = sink.clone();
            tokio::spawn(async move {
                let mut parser = ProgressParser::new();
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if let Some(progress) = parser.feed(&line) {
                        sink.on_progress(&progress);
                    }
                }
            });
        }
        if let Some(stderr) = child.stderr.take() {
            let sink = sink.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    sink.on_stderr(&line);
                }
            });
        }

        let cancel = CancellationToken::new();
        let (tx, rx) = oneshot::channel();
        let stdin = child.stdin.take();
        let monitor = tokio::spawn(monitor_process(
            child,
            stdin,
            pid,
            cancel.clone(),
            spec.stop_grace,
            spec.cpu_sample_interval,
            sink,
            tx,
        ));

        Ok(Self {
            pid,
            cancel,
            exit_rx: Some(rx),
            exit: None,
            monitor,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Requests termination; `wait` observes the result.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub async fn wait(&mut self) -> ProcessExit {
        if let Some(exit) = &self.exit {
            return exit.clone();
        }
        let exit = match self.exit_rx.take() {
            Some(rx) => rx
                .await
                .unwrap_or_else(|_| ProcessExit::WaitFailed("monitor task ended".into())),
            None => ProcessExit::WaitFailed("process already reaped".into()),
        };
        self.exit = Some(exit.clone());
        exit
    }
}

impl Drop for ProcessRunner {
    fn drop(&mut self) {
        self.cancel.cancel();
        if self.exit.is_some() {
            self.monitor.abort();
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn monitor_process(
    mut child: Child,
    stdin: Option<ChildStdin>,
    pid: Option<u32>,
    cancel: CancellationToken,
    stop_grace: Duration,
    cpu_sample_interval: Duration,
    sink: Arc<dyn TelemetrySink>,
    tx: oneshot::Sender<ProcessExit>,
) {
    let mut stdin = stdin;
    let mut cpu = CpuSampler::new(pid);
    let mut ticker = tokio::time::interval(cpu_sample_interval.max(Duration::from_millis(100)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let exit = loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                terminate(&mut child, stdin.take(), stop_grace).await;
                break ProcessExit::Stopped;
            }
            status = child.wait() => {
                break match status {
                    Ok(status) => {
                        if !status.success() {
                            warn!(pid, code = status.code(), "transcoder exited");
                        }
                        ProcessExit::Exited { code: status.code() }
                    }
                    Err(error) => {
                        warn!(pid, %error, "failed waiting for transcoder");
                        ProcessExit::WaitFailed(error.to_string())
                    }
                };
            }
            _ = ticker.tick() => {
                if let Some(delta) = cpu.sample_delta() {
                    sink.on_cpu_seconds(delta);
                }
            }
        }
    };
    let _ = tx.send(exit);
}

/// Asks the transcoder to quit through stdin, then kills it after the grace
/// period.
async fn terminate(child: &mut Child, stdin: Option<ChildStdin>, grace: Duration) {
    if let Some(mut stdin) = stdin {
        let _ = stdin.write_all(b"q").await;
        let _ = stdin.flush().await;
        drop(stdin);
    }
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(_) => debug!(pid = child.id(), "transcoder stopped gracefully"),
        Err(_) => {
            if let Err(error) = child.kill().await {
                warn!(%error, "failed to kill transcoder");
            }
        }
    }
}

struct CpuSampler {
    pid: Option<Pid>,
    system: System,
    last_total: f64,
}

impl CpuSampler {
    fn new(pid: Option<u32>) -> Self {
        Self {
            pid: pid.map(Pid::from_u32),
            system: System::new(),
            last_total: 0.0,
        }
    }

    fn sample_delta(&mut self) -> Option<f64> {
        let pid = self.pid?;
        self.system
            .refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        let total = self.system.process(pid)?.accumulated_cpu_time() as f64 / 1000.0;
        let delta = (total - self.last_total).max(0.0);
        self.last_total = total;
        Some(delta)
    }
}
