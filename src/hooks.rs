use std::{
    io::{self, Write},
    path::PathBuf,
    process::Stdio,
};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader},
    process::Command,
};

use crate::error::RunError;

pub const START_HOOK: &str = "start";

/// A named command declared by the project SDK.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(from = "String")]
pub struct HookScript {
    pub name: String,
    pub command: String,
}

impl From<String> for HookScript {
    fn from(command: String) -> Self {
        Self {
            name: String::new(),
            command,
        }
    }
}

impl HookScript {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
        }
    }

    pub fn is_available(&self) -> bool {
        !self.command.trim().is_empty()
    }

    pub fn get(&self) -> Result<&str, RunError> {
        if self.is_available() {
            Ok(self.command.trim())
        } else {
            Err(RunError::HookNotFound(self.name.clone()))
        }
    }
}

/// Echoes hook stderr line by line as it arrives and returns everything read.
async fn relay_stderr<R, W>(reader: R, mut sink: W) -> String
where
    R: AsyncRead + Unpin,
    W: Write,
{
    let mut lines = BufReader::new(reader).lines();
    let mut captured = String::new();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let _ = writeln!(sink, "{line}");
                captured.push_str(&line);
                captured.push('\n');
            }
            Ok(None) => break,
            Err(error) => {
                tracing::debug!(target = "local_run::hooks", error = %error, "failed to read hook stderr");
                break;
            }
        }
    }
    captured
}

/// Splits a hook command into the program and its arguments.
pub fn parse_hook_command(hook: &HookScript) -> Result<(String, Vec<String>), RunError> {
    let command = hook.get()?;
    let mut parts = shlex::split(command)
        .ok_or_else(|| RunError::hook_failed(format!("Invalid '{}' hook command: {command}", hook.name)))?
        .into_iter();
    let program = parts
        .next()
        .ok_or_else(|| RunError::HookNotFound(hook.name.clone()))?;
    Ok((program, parts.collect()))
}

#[derive(Debug)]
pub struct HookExecOpts<'a> {
    pub hook: &'a HookScript,
    pub stdin: Option<Vec<u8>>,
    pub env: Vec<(String, String)>,
}

#[async_trait]
pub trait HookExecutor: Send + Sync {
    /// Runs the hook to completion and returns its trimmed stdout.
    async fn execute(&self, opts: HookExecOpts<'_>) -> Result<String, RunError>;
}

/// Runs hooks as child processes inside the project directory.
#[derive(Debug, Clone)]
pub struct ShellHookExecutor {
    working_dir: PathBuf,
}

impl ShellHookExecutor {
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: working_dir.into(),
        }
    }
}

#[async_trait]
impl HookExecutor for ShellHookExecutor {
    async fn execute(&self, opts: HookExecOpts<'_>) -> Result<String, RunError> {
        let (program, args) = parse_hook_command(opts.hook)?;

        let mut cmd = Command::new(&program);
        cmd.args(&args)
            .current_dir(&self.working_dir)
            .envs(opts.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(if opts.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|error| {
            RunError::hook_failed(format!("Failed to start '{}' hook: {error}", opts.hook.name))
        })?;

        if let (Some(input), Some(mut stdin)) = (opts.stdin, child.stdin.take()) {
            tokio::spawn(async move {
                // A hook that exits without reading its input closes the pipe early.
                if let Err(error) = stdin.write_all(&input).await {
                    tracing::debug!(target = "local_run::hooks", error = %error, "hook stdin closed early");
                }
            });
        }

        let stderr_relay = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(relay_stderr(stderr, io::stderr())));

        let output = child.wait_with_output().await?;
        let stderr = match stderr_relay {
            Some(relay) => relay.await.unwrap_or_default(),
            None => String::new(),
        };
        if !output.status.success() {
            let mut message = format!(
                "Error running '{}' command: {}",
                opts.hook.name, output.status
            );
            if !stderr.trim().is_empty() {
                message.push_str(&format!("\n{}", stderr.trim()));
            }
            return Err(RunError::hook_failed(message));
        }

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if opts.hook.name != START_HOOK {
            return Ok(stdout);
        }

        // The start hook may log freely; only its final line is the response.
        match stdout.rsplit_once('\n') {
            Some((logs, response)) => {
                if !logs.trim().is_empty() {
                    println!("{}", logs.trim_end());
                }
                Ok(response.trim().to_string())
            }
            None => Ok(stdout),
        }
    }
}
