//! Worker pool supervisor.
//!
//! The supervisor runs one child process per configured port. Each child is
//! owned by its own task, which waits on it, reports every exit over an mpsc
//! channel and restarts it after a fixed delay. A watch channel tells the
//! tasks to stop their children once shutdown is requested: SIGTERM first so
//! workers can drain in-flight requests, SIGKILL after a grace period.

use anyhow::{Context, Result};
use std::{
    env,
    ffi::OsString,
    future::Future,
    io,
    path::PathBuf,
    process::ExitStatus,
    sync::Arc,
    time::Duration,
};
use tokio::{
    process::{Child, Command},
    sync::{mpsc, watch},
    task::JoinSet,
};
use tracing::{error, info, warn};

pub const DEFAULT_RESTART_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(10);

/// Program and arguments used to start a worker; the port is appended as
/// `--worker-port <port>`.
#[derive(Clone, Debug)]
pub struct WorkerCommand {
    program: PathBuf,
    args: Vec<OsString>,
}

impl WorkerCommand {
    pub fn new<I, A>(program: impl Into<PathBuf>, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<OsString>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Re-run the current executable with the arguments it was started with.
    pub fn current_exe() -> Result<Self> {
        let program = env::current_exe().context("locating the current executable")?;
        Ok(Self::new(program, env::args_os().skip(1)))
    }

    /// Start a worker for `port`. The child is killed if its handle is dropped.
    pub fn spawn(&self, port: u16) -> io::Result<Child> {
        Command::new(&self.program)
            .args(&self.args)
            .arg("--worker-port")
            .arg(port.to_string())
            .kill_on_drop(true)
            .spawn()
    }
}

#[derive(Clone, Debug)]
pub struct SupervisorSettings {
    pub ports: Vec<u16>,
    pub restart_delay: Duration,
    /// How long a worker may take to exit after SIGTERM before it is killed.
    pub stop_grace: Duration,
}

impl SupervisorSettings {
    pub fn new(ports: Vec<u16>) -> Self {
        Self {
            ports,
            restart_delay: DEFAULT_RESTART_DELAY,
            stop_grace: DEFAULT_STOP_GRACE,
        }
    }
}

/// One child exit as seen by its owning task.
#[derive(Debug)]
pub struct WorkerExit {
    pub index: usize,
    pub port: u16,
    /// `Err` when the child could not be spawned or waited on.
    pub status: io::Result<ExitStatus>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SupervisorReport {
    /// Restarts per worker, indexed like `SupervisorSettings::ports`.
    pub restarts: Vec<u32>,
}

pub struct Supervisor {
    command: Arc<WorkerCommand>,
    settings: SupervisorSettings,
}

impl Supervisor {
    pub fn new(command: WorkerCommand, settings: SupervisorSettings) -> Self {
        Self {
            command: Arc::new(command),
            settings,
        }
    }

    /// Run the pool until `shutdown` resolves, then stop every child and wait
    /// for the owning tasks to finish.
    pub async fn run<S>(self, shutdown: S) -> SupervisorReport
    where
        S: Future<Output = ()>,
    {
        let workers = self.settings.ports.len();
        let (exit_tx, mut exit_rx) = mpsc::channel::<WorkerExit>(workers.max(1));
        let (stop_tx, stop_rx) = watch::channel(false);

        let mut tasks = JoinSet::new();
        for (index, &port) in self.settings.ports.iter().enumerate() {
            tasks.spawn(own_worker(
                self.command.clone(),
                index,
                port,
                self.settings.restart_delay,
                self.settings.stop_grace,
                stop_rx.clone(),
                exit_tx.clone(),
            ));
        }
        drop(exit_tx);
        info!(workers, ports = ?self.settings.ports, "Supervisor started");

        let mut report = SupervisorReport {
            restarts: vec![0; workers],
        };
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                exit = exit_rx.recv() => match exit {
                    Some(exit) => {
                        log_exit(&exit, self.settings.restart_delay);
                        report.restarts[exit.index] += 1;
                    }
                    None => break,
                },
            }
        }

        info!("Stopping workers");
        // Tasks blocked on a full channel see it closed and exit.
        let _ = stop_tx.send(true);
        drop(exit_rx);
        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                error!("Worker task failed: {}", err);
            }
        }
        info!(restarts = ?report.restarts, "Supervisor stopped");
        report
    }
}

fn log_exit(exit: &WorkerExit, restart_delay: Duration) {
    match &exit.status {
        Ok(status) => warn!(
            worker = exit.index,
            port = exit.port,
            %status,
            "Worker exited, restarting in {:?}",
            restart_delay
        ),
        Err(err) => error!(
            worker = exit.index,
            port = exit.port,
            error = %err,
            "Worker could not be run, retrying in {:?}",
            restart_delay
        ),
    }
}

async fn own_worker(
    command: Arc<WorkerCommand>,
    index: usize,
    port: u16,
    restart_delay: Duration,
    stop_grace: Duration,
    mut stop: watch::Receiver<bool>,
    exits: mpsc::Sender<WorkerExit>,
) {
    loop {
        if *stop.borrow() {
            return;
        }

        let status = match command.spawn(port) {
            Ok(mut child) => {
                info!(worker = index, port, pid = child.id(), "Worker started");
                tokio::select! {
                    status = child.wait() => status,
                    _ = stop.changed() => {
                        stop_child(&mut child, index, port, stop_grace).await;
                        return;
                    }
                }
            }
            Err(err) => Err(err),
        };

        if exits.send(WorkerExit { index, port, status }).await.is_err() {
            return;
        }

        tokio::select! {
            _ = tokio::time::sleep(restart_delay) => {}
            _ = stop.changed() => return,
        }
    }
}

async fn stop_child(child: &mut Child, index: usize, port: u16, grace: Duration) {
    if child.id().is_none() {
        // Already reaped.
        return;
    }

    if request_stop(child, index, port) {
        match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(status)) => {
                info!(worker = index, port, %status, "Worker stopped");
                return;
            }
            Ok(Err(err)) => {
                error!(worker = index, port, error = %err, "Failed to wait for worker")
            }
            Err(_) => warn!(
                worker = index,
                port,
                "Worker still running {:?} after SIGTERM, killing it",
                grace
            ),
        }
    }

    match child.kill().await {
        Ok(()) => info!(worker = index, port, "Worker killed"),
        Err(err) => error!(worker = index, port, error = %err, "Failed to kill worker"),
    }
}

/// Ask the child to shut down gracefully. Returns false when no signal was
/// sent and the caller should kill it outright.
#[cfg(unix)]
fn request_stop(child: &Child, index: usize, port: u16) -> bool {
    use nix::{
        sys::signal::{Signal, kill},
        unistd::Pid,
    };

    let Some(pid) = child.id().and_then(|pid| i32::try_from(pid).ok()) else {
        return false;
    };
    match kill(Pid::from_raw(pid), Signal::SIGTERM) {
        Ok(()) => true,
        Err(err) => {
            warn!(worker = index, port, error = %err, "Failed to send SIGTERM");
            false
        }
    }
}

#[cfg(not(unix))]
fn request_stop(_child: &Child, _index: usize, _port: u16) -> bool {
    false
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Instant;

    fn sh(script: &str) -> WorkerCommand {
        WorkerCommand::new("sh", ["-c", script])
    }

    #[tokio::test]
    async fn restarts_workers_that_exit() {
        let settings = SupervisorSettings {
            ports: vec![9001, 9002],
            restart_delay: Duration::from_millis(20),
            stop_grace: Duration::from_secs(5),
        };
        let report = Supervisor::new(sh("exit 3"), settings)
            .run(tokio::time::sleep(Duration::from_millis(600)))
            .await;

        assert_eq!(report.restarts.len(), 2);
        assert!(report.restarts.iter().all(|&n| n >= 2), "{:?}", report);
    }

    #[tokio::test]
    async fn shutdown_kills_running_workers_promptly() {
        let settings = SupervisorSettings {
            ports: vec![9001, 9002, 9003],
            restart_delay: Duration::from_millis(20),
            stop_grace: Duration::from_secs(5),
        };
        let started = Instant::now();
        let report = tokio::time::timeout(
            Duration::from_secs(10),
            Supervisor::new(sh("exec sleep 30"), settings)
                .run(tokio::time::sleep(Duration::from_millis(200))),
        )
        .await
        .expect("supervisor did not stop");

        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(report.restarts, vec![0, 0, 0]);
    }

    #[tokio::test]
    async fn shutdown_lets_workers_exit_on_sigterm() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("stopped");
        let script = format!(
            "trap 'echo drained > {}; exit 0' TERM; while :; do sleep 0.05; done",
            marker.display()
        );
        let settings = SupervisorSettings {
            ports: vec![9001],
            restart_delay: Duration::from_millis(20),
            stop_grace: Duration::from_secs(5),
        };
        let report = Supervisor::new(sh(&script), settings)
            .run(tokio::time::sleep(Duration::from_millis(500)))
            .await;

        assert_eq!(report.restarts, vec![0]);
        let written = std::fs::read_to_string(&marker).unwrap();
        assert_eq!(written.trim(), "drained");
    }

    #[tokio::test]
    async fn workers_ignoring_sigterm_are_killed_after_the_grace_period() {
        let settings = SupervisorSettings {
            ports: vec![9001],
            restart_delay: Duration::from_millis(20),
            stop_grace: Duration::from_millis(200),
        };
        let started = Instant::now();
        let report = tokio::time::timeout(
            Duration::from_secs(10),
            Supervisor::new(sh("trap '' TERM; exec sleep 30"), settings)
                .run(tokio::time::sleep(Duration::from_millis(300))),
        )
        .await
        .expect("supervisor did not stop");

        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(report.restarts, vec![0]);
    }

    #[tokio::test]
    async fn spawn_failures_are_reported_and_retried() {
        let settings = SupervisorSettings {
            ports: vec![9001],
            restart_delay: Duration::from_millis(20),
            stop_grace: Duration::from_secs(5),
        };
        let command = WorkerCommand::new("/nonexistent/image-gallery-worker", Vec::<String>::new());
        let report = Supervisor::new(command, settings)
            .run(tokio::time::sleep(Duration::from_millis(300)))
            .await;

        assert!(report.restarts[0] >= 2, "{:?}", report);
    }

    #[tokio::test]
    async fn worker_port_is_appended_to_the_command() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("args");
        let script = format!("echo \"$@\" > {}", out.display());
        // `sh -c script name args...`: $0 is "worker", the rest are "$@".
        let command = WorkerCommand::new("sh", ["-c".to_string(), script, "worker".to_string()]);

        let status = command.spawn(8123).unwrap().wait().await.unwrap();
        assert!(status.success());
        let written = std::fs::read_to_string(&out).unwrap();
        assert_eq!(written.trim(), "--worker-port 8123");
    }
}
