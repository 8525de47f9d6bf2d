use std::{io, path::PathBuf, process::ExitStatus, time::Duration};

#[cfg(unix)]
use nix::{
    sys::signal::{kill, Signal},
    unistd::Pid,
};
use tokio::{
    process::{Child, Command},
    sync::{mpsc, oneshot},
    time::timeout,
};

use crate::{
    error::RunError,
    hooks::{parse_hook_command, HookScript},
};

pub const APP_TOKEN_ENV: &str = "SLACK_CLI_XAPP";
pub const BOT_TOKEN_ENV: &str = "SLACK_CLI_XOXB";
pub const STOP_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// How a delegate run ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelegateExit {
    /// The process exited with status zero.
    Exited,
    /// The process was stopped or replaced through [`DelegateProcess::stop`]
    /// or a newer [`DelegateProcess::start`].
    Stopped,
}

#[derive(Debug, Clone)]
pub struct DelegateSpec {
    pub hook: HookScript,
    pub app_token: String,
    pub bot_token: String,
    pub working_dir: PathBuf,
    pub extra_env: Vec<(String, String)>,
    pub stop_grace: Duration,
}

impl DelegateSpec {
    pub fn new(hook: HookScript, app_token: &str, bot_token: &str, working_dir: PathBuf) -> Self {
        Self {
            hook,
            app_token: app_token.to_string(),
            bot_token: bot_token.to_string(),
            working_dir,
            extra_env: Vec::new(),
            stop_grace: STOP_GRACE_PERIOD,
        }
    }
}

enum ExitReport {
    Status(ExitStatus),
    WaitFailed(io::Error),
    Stopped,
}

type StartReply = oneshot::Sender<Result<oneshot::Receiver<ExitReport>, RunError>>;

enum DelegateCommand {
    Start { reply: StartReply },
    Stop { reply: oneshot::Sender<()> },
    IsRunning { reply: oneshot::Sender<bool> },
}

struct Running {
    child: Child,
    exit: oneshot::Sender<ExitReport>,
}

/// Handle to the task that owns the SDK-managed subprocess. At most one
/// process runs at a time; clones talk to the same owner.
#[derive(Clone)]
pub struct DelegateProcess {
    commands: mpsc::Sender<DelegateCommand>,
    hook: HookScript,
}

impl DelegateProcess {
    pub fn spawn(spec: DelegateSpec) -> Self {
        let (tx, rx) = mpsc::channel(8);
        let hook = spec.hook.clone();
        tokio::spawn(run_owner(spec, rx));
        Self { commands: tx, hook }
    }

    /// Starts the start hook, replacing any running process, and waits for
    /// it to end.
    pub async fn start(&self) -> Result<DelegateExit, RunError> {
        self.hook.get()?;

        let (reply, started) = oneshot::channel();
        if self
            .commands
            .send(DelegateCommand::Start { reply })
            .await
            .is_err()
        {
            return Ok(DelegateExit::Stopped);
        }
        let exit = match started.await {
            Ok(result) => result?,
            Err(_) => return Ok(DelegateExit::Stopped),
        };

        match exit.await {
            Ok(ExitReport::Status(status)) => classify_exit(&self.hook, status),
            Ok(ExitReport::WaitFailed(error)) => Err(RunError::hook_failed(format!(
                "Failed to wait for '{}' hook: {error}",
                self.hook.name
            ))),
            Ok(ExitReport::Stopped) | Err(_) => Ok(DelegateExit::Stopped),
        }
    }

    /// Interrupts the running process, if any. Safe to call when idle.
    pub async fn stop(&self) {
        let (reply, done) = oneshot::channel();
        if self
            .commands
            .send(DelegateCommand::Stop { reply })
            .await
            .is_ok()
        {
            let _ = done.await;
        }
    }

    pub async fn is_running(&self) -> bool {
        let (reply, answer) = oneshot::channel();
        if self
            .commands
            .send(DelegateCommand::IsRunning { reply })
            .await
            .is_err()
        {
            return false;
        }
        answer.await.unwrap_or(false)
    }
}

fn classify_exit(hook: &HookScript, status: ExitStatus) -> Result<DelegateExit, RunError> {
    if status.success() {
        return Ok(DelegateExit::Exited);
    }
    match status.code() {
        None => Err(RunError::ProcessInterrupted),
        Some(code) => Err(RunError::HookInvocationFailed {
            message: format!("The '{}' hook exited with an error: {status}", hook.name),
            exit_code: Some(code),
        }),
    }
}

async fn run_owner(spec: DelegateSpec, mut commands: mpsc::Receiver<DelegateCommand>) {
    let mut current: Option<Running> = None;

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(DelegateCommand::Start { reply }) => {
                    if let Some(running) = current.take() {
                        stop_running(running, spec.stop_grace).await;
                    }
                    match spawn_delegate(&spec) {
                        Ok(child) => {
                            let (exit, exit_rx) = oneshot::channel();
                            current = Some(Running { child, exit });
                            let _ = reply.send(Ok(exit_rx));
                        }
                        Err(error) => {
                            let _ = reply.send(Err(error));
                        }
                    }
                }
                Some(DelegateCommand::Stop { reply }) => {
                    if let Some(running) = current.take() {
                        stop_running(running, spec.stop_grace).await;
                    }
                    let _ = reply.send(());
                }
                Some(DelegateCommand::IsRunning { reply }) => {
                    let _ = reply.send(current.is_some());
                }
                None => {
                    if let Some(running) = current.take() {
                        stop_running(running, spec.stop_grace).await;
                    }
                    break;
                }
            },
            status = wait_current(&mut current) => {
                if let Some(running) = current.take() {
                    let report = match status {
                        Ok(status) => ExitReport::Status(status),
                        Err(error) => ExitReport::WaitFailed(error),
                    };
                    let _ = running.exit.send(report);
                }
            }
        }
    }
}

async fn wait_current(current: &mut Option<Running>) -> io::Result<ExitStatus> {
    match current {
        Some(running) => running.child.wait().await,
        None => std::future::pending().await,
    }
}

fn spawn_delegate(spec: &DelegateSpec) -> Result<Child, RunError> {
    let (program, args) = parse_hook_command(&spec.hook)?;

    let mut cmd = Command::new(&program);
    cmd.args(&args)
        .current_dir(&spec.working_dir)
        .envs(spec.extra_env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .env(APP_TOKEN_ENV, &spec.app_token)
        .env(BOT_TOKEN_ENV, &spec.bot_token)
        .kill_on_drop(true);

    let child = cmd.spawn().map_err(|error| {
        RunError::hook_failed(format!("Failed to start '{}' hook: {error}", spec.hook.name))
    })?;
    tracing::debug!(
        target = "local_run::delegate",
        pid = child.id(),
        command = %program,
        "started delegate process"
    );
    Ok(child)
}

/// Interrupts the child, escalating to a kill once `grace` elapses.
async fn stop_running(mut running: Running, grace: Duration) {
    let child = &mut running.child;

    #[cfg(unix)]
    {
        let interrupted = child
            .id()
            .map(|pid| kill(Pid::from_raw(pid as i32), Signal::SIGINT).is_ok())
            .unwrap_or(false);
        if !interrupted {
            let _ = child.start_kill();
        }
    }

    #[cfg(not(unix))]
    {
        let _ = child.start_kill();
    }

    if timeout(grace, child.wait()).await.is_err() {
        tracing::debug!(target = "local_run::delegate", "delegate ignored interrupt, killing");
        let _ = child.kill().await;
    }

    let _ = running.exit.send(ExitReport::Stopped);
}
