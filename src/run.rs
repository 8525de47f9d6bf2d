use std::{
    collections::BTreeMap,
    io::{self, ErrorKind as IoErrorKind},
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use serde_json::json;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::{
    activity::{stream_activity, ActivityArgs},
    api::{InstallRequest, InstallResult, InstallState, PlatformApi},
    cleanup::{CleanupGroup, CleanupGuard},
    delegate::{DelegateProcess, DelegateSpec},
    error::{ErrorKind, RunError},
    events::EventEmitter,
    hooks::{HookExecutor, START_HOOK},
    protocol::LocalHostedContext,
    sdk_config::SdkCliConfig,
    server::{LocalServer, LocalServerOptions},
    transport::Dialer,
    watcher::{watch_app, watch_manifest, AppInstaller},
};

pub const DOTENV_FILE: &str = ".env";
pub const API_URL_ENV: &str = "SLACK_API_URL";

/// Bound on how long finished runs wait for sibling tasks to wind down.
const TASK_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunArgs {
    pub token: String,
    pub app_id: String,
    pub team_id: String,
    pub api_host: String,
    pub project_dir: PathBuf,
    pub activity: bool,
    pub activity_level: String,
    pub cleanup: bool,
    pub org_grant_workspace_id: Option<String>,
}

/// Collaborators a run talks to.
pub struct RunDeps {
    pub api: Arc<dyn PlatformApi>,
    pub dialer: Arc<dyn Dialer>,
    pub hooks: Arc<dyn HookExecutor>,
    pub sdk_config: SdkCliConfig,
    pub cleanup: CleanupGroup,
    pub events: EventEmitter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunTask {
    Activity,
    ManifestWatch,
    Relay,
}

/// Installs the app through the developer-install endpoint.
pub struct ApiInstaller {
    api: Arc<dyn PlatformApi>,
    token: String,
    request: InstallRequest,
}

impl ApiInstaller {
    pub fn new(api: Arc<dyn PlatformApi>, token: &str, request: InstallRequest) -> Self {
        Self {
            api,
            token: token.to_string(),
            request,
        }
    }
}

#[async_trait]
impl AppInstaller for ApiInstaller {
    async fn install(&self) -> Result<InstallResult, RunError> {
        self.api.install_local_app(&self.token, &self.request).await
    }
}

/// Runs the app locally until cancelled or a task fails. Returns the install
/// state; anything other than success means the relay never started.
pub async fn run(
    deps: RunDeps,
    args: RunArgs,
    cancel: CancellationToken,
) -> Result<InstallState, RunError> {
    let session = deps
        .api
        .validate_session(&args.token)
        .await
        .map_err(RunError::local_app_run)?;

    if !deps.sdk_config.hooks.start.is_available() {
        return Err(RunError::HookNotFound(START_HOOK.to_string()));
    }

    let installer = Arc::new(ApiInstaller::new(
        deps.api.clone(),
        &args.token,
        InstallRequest {
            app_id: args.app_id.clone(),
            org_grant_workspace_id: args.org_grant_workspace_id.clone(),
        },
    ));
    let install = installer.install().await.map_err(RunError::local_app_run)?;
    if install.state != InstallState::Success {
        tracing::info!(target = "local_run::run", state = ?install.state, "app install is awaiting approval, not starting");
        return Ok(install.state);
    }

    let variables = load_env_file(&args.project_dir, &args.api_host).map_err(RunError::local_app_run)?;
    let hook_env: Vec<(String, String)> = variables
        .get(API_URL_ENV)
        .map(|url| vec![(API_URL_ENV.to_string(), url.clone())])
        .unwrap_or_default();

    let team_id = session
        .team_id
        .clone()
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| args.team_id.clone());
    let context = LocalHostedContext {
        bot_access_token: install.bot_token.clone(),
        app_id: install.app_id.clone(),
        team_id: team_id.clone(),
        variables,
    };

    let server = Arc::new(LocalServer::new(LocalServerOptions {
        api: deps.api.clone(),
        dialer: deps.dialer.clone(),
        hooks: deps.hooks.clone(),
        start_hook: deps.sdk_config.hooks.start.clone(),
        hook_env: hook_env.clone(),
        app_token: install.app_level_token.clone(),
        context,
        cleanup: deps.cleanup.clone(),
        events: deps.events.clone(),
    }));

    let run_cancel = cancel.child_token();
    let terminate = tokio::spawn(terminate_on_cancel(TerminateRoutine {
        server: server.clone(),
        api: deps.api.clone(),
        token: args.token.clone(),
        app_id: install.app_id.clone(),
        delete_app: args.cleanup,
        interrupted: cancel.clone(),
        finished: run_cancel.clone(),
        events: deps.events.clone(),
        _registration: deps.cleanup.guard(),
    }));

    deps.events.emit(
        "run_start",
        json!({"app_id": install.app_id, "team_id": team_id}),
    );

    let mut tasks: JoinSet<(RunTask, Result<(), RunError>)> = JoinSet::new();

    if args.activity {
        let api = deps.api.clone();
        let token = args.token.clone();
        let activity_args = ActivityArgs::for_local_run(&team_id, &install.app_id, &args.activity_level);
        let cancel = run_cancel.clone();
        tasks.spawn(async move {
            let mut out = io::stdout();
            let result = stream_activity(api.as_ref(), &token, &activity_args, &mut out, &cancel).await;
            (RunTask::Activity, result)
        });
    }

    {
        let spec = deps.sdk_config.manifest_watch();
        let installer: Arc<dyn AppInstaller> = installer.clone();
        let events = deps.events.clone();
        let cancel = run_cancel.clone();
        tasks.spawn(async move {
            (
                RunTask::ManifestWatch,
                watch_manifest(spec, installer, events, cancel).await,
            )
        });
    }

    if deps.sdk_config.config.sdk_managed_connection_enabled {
        tracing::debug!(target = "local_run::run", "delegating connection to the SDK start hook");
        let mut spec = DelegateSpec::new(
            deps.sdk_config.hooks.start.clone(),
            &install.app_level_token,
            &install.bot_token,
            deps.sdk_config.working_directory.clone(),
        );
        spec.extra_env = hook_env;
        let delegate = DelegateProcess::spawn(spec);
        let app_watch = deps.sdk_config.app_watch();
        let events = deps.events.clone();
        let cancel = run_cancel.clone();
        tasks.spawn(async move {
            (
                RunTask::Relay,
                watch_app(app_watch, delegate, events, cancel).await,
            )
        });
    } else {
        let server = server.clone();
        let cancel = run_cancel.clone();
        tasks.spawn(async move { (RunTask::Relay, server.start(cancel).await) });
    }

    let result = loop {
        match tasks.join_next().await {
            Some(Ok((RunTask::Relay, result))) => break result,
            Some(Ok((task, Err(error)))) => {
                tracing::debug!(target = "local_run::run", task = ?task, error = %error, "run task failed");
                break Err(error);
            }
            Some(Ok((task, Ok(())))) => {
                tracing::debug!(target = "local_run::run", task = ?task, "run task finished");
            }
            Some(Err(error)) => break Err(RunError::Io(io::Error::other(error.to_string()))),
            None => break Ok(()),
        }
    };

    run_cancel.cancel();
    let drained = tokio::time::timeout(TASK_SHUTDOWN_GRACE, async {
        while tasks.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        tracing::debug!(target = "local_run::run", "aborting tasks that did not stop in time");
        tasks.abort_all();
    }
    if let Err(error) = terminate.await {
        tracing::warn!(target = "local_run::run", error = %error, "terminate routine failed");
    }

    match result {
        Ok(()) => Ok(InstallState::Success),
        Err(error) if error.kind() == ErrorKind::HookInvocationFailed => Err(error),
        Err(error) => Err(RunError::local_app_run(error)),
    }
}

struct TerminateRoutine {
    server: Arc<LocalServer>,
    api: Arc<dyn PlatformApi>,
    token: String,
    app_id: String,
    delete_app: bool,
    interrupted: CancellationToken,
    finished: CancellationToken,
    events: EventEmitter,
    _registration: CleanupGuard,
}

/// Once the run ends, asks the peer to close the relay connection and, if
/// the user interrupted with `--cleanup`, removes the local app.
async fn terminate_on_cancel(routine: TerminateRoutine) {
    routine.finished.cancelled().await;
    tracing::debug!(target = "local_run::run", "run finished, cleaning up and shutting down");

    routine.server.send_close_control().await;

    if routine.delete_app && routine.interrupted.is_cancelled() {
        tracing::debug!(target = "local_run::run", app_id = %routine.app_id, "removing the local app from the workspace");
        match routine.api.delete_app(&routine.token, &routine.app_id).await {
            Ok(()) => tracing::info!(target = "local_run::run", "local app removed"),
            Err(error) => {
                tracing::warn!(target = "local_run::run", error = %error, "failed to remove local app")
            }
        }
    }

    routine.events.emit("run_stop", json!({"app_id": routine.app_id}));
}

/// Reads `.env` from the project directory. A missing file is empty;
/// `SLACK_API_URL` defaults to the API host.
pub fn load_env_file(project_dir: &Path, api_host: &str) -> Result<BTreeMap<String, String>, RunError> {
    let mut variables = BTreeMap::new();
    match dotenvy::from_path_iter(project_dir.join(DOTENV_FILE)) {
        Ok(entries) => {
            for entry in entries {
                let (key, value) = entry.map_err(dotenv_error)?;
                variables.insert(key, value);
            }
        }
        Err(dotenvy::Error::Io(error)) if error.kind() == IoErrorKind::NotFound => {}
        Err(error) => return Err(dotenv_error(error)),
    }

    variables
        .entry(API_URL_ENV.to_string())
        .or_insert_with(|| format!("{}/api/", api_host.trim_end_matches('/')));
    Ok(variables)
}

fn dotenv_error(error: dotenvy::Error) -> RunError {
    RunError::Io(io::Error::new(
        IoErrorKind::InvalidData,
        format!("Failed to read the local .env file: {error}"),
    ))
}
