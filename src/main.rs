use std::{io, process::ExitCode, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;

use local_run::{
    activity::stream_activity,
    api::{InstallState, PlatformClient},
    cleanup::CleanupGroup,
    config::{ActivityCommand, Cli, Command, RunCommand},
    error::RunError,
    events::{init_logging, EventEmitter},
    hooks::ShellHookExecutor,
    run::{run, RunDeps},
    sdk_config::SdkCliConfig,
    transport::WsDialer,
};

/// Upper bound on waiting for shutdown routines after the run returns.
const CLEANUP_WAIT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(error) = init_logging(cli.log_level.as_deref()) {
        eprintln!("failed to initialise logging: {error}");
    }

    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_signal(cancel.clone()));

    match dispatch(cli, cancel).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("Error: {error:#}");
            let code = error
                .downcast_ref::<RunError>()
                .and_then(RunError::exit_code)
                .unwrap_or(1);
            ExitCode::from(u8::try_from(code).unwrap_or(1))
        }
    }
}

async fn dispatch(cli: Cli, cancel: CancellationToken) -> Result<()> {
    let events = EventEmitter::new(cli.json_output);
    let api = Arc::new(PlatformClient::new(&cli.api_host));

    match cli.command {
        Command::Run(cmd) => run_command(cmd, &cli.token, &cli.api_host, api, events, cancel).await,
        Command::Activity(cmd) => activity_command(cmd, &cli.token, api, cancel).await,
    }
}

async fn run_command(
    cmd: RunCommand,
    token: &str,
    api_host: &str,
    api: Arc<PlatformClient>,
    events: EventEmitter,
    cancel: CancellationToken,
) -> Result<()> {
    let args = cmd.into_args(token, api_host);
    let sdk_config = SdkCliConfig::load(&args.project_dir)
        .with_context(|| format!("failed to load project config from {}", args.project_dir.display()))?;
    let cleanup = CleanupGroup::new();

    let deps = RunDeps {
        api,
        dialer: Arc::new(WsDialer),
        hooks: Arc::new(ShellHookExecutor::new(sdk_config.working_directory.clone())),
        sdk_config,
        cleanup: cleanup.clone(),
        events,
    };

    let result = run(deps, args, cancel).await;

    if tokio::time::timeout(CLEANUP_WAIT, cleanup.wait()).await.is_err() {
        tracing::warn!(
            target = "local_run::main",
            pending = cleanup.pending(),
            "shutdown routines did not finish in time"
        );
    }

    match result? {
        InstallState::Success => {}
        InstallState::RequestPending => {
            println!("App install request is pending approval by a workspace admin. Try again once it is approved.")
        }
        InstallState::RequestCancelled => println!("App install request was cancelled."),
        InstallState::RequestNotSent => println!("App install request was not sent."),
    }
    Ok(())
}

async fn activity_command(
    cmd: ActivityCommand,
    token: &str,
    api: Arc<PlatformClient>,
    cancel: CancellationToken,
) -> Result<()> {
    let args = cmd.into_args();
    let mut out = io::stdout();
    stream_activity(api.as_ref(), token, &args, &mut out, &cancel)
        .await
        .context("failed to stream activity")?;
    Ok(())
}

#[cfg(unix)]
async fn cancel_on_signal(cancel: CancellationToken) {
    let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(error) => {
            tracing::warn!(target = "local_run::main", error = %error, "failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            cancel.cancel();
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!(target = "local_run::main", "received interrupt, shutting down");
        }
        _ = sigterm.recv() => {
            tracing::info!(target = "local_run::main", "received SIGTERM, shutting down");
        }
    }
    cancel.cancel();
}

#[cfg(not(unix))]
async fn cancel_on_signal(cancel: CancellationToken) {
    if tokio::signal::ctrl_c().await.is_ok() {
        tracing::info!(target = "local_run::main", "received interrupt, shutting down");
    }
    cancel.cancel();
}
