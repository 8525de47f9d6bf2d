use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use notify::{
    event::{CreateKind, ModifyKind, RenameMode},
    Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher,
};
use regex::Regex;
use serde_json::json;
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{
    api::InstallResult,
    delegate::{DelegateExit, DelegateProcess},
    error::RunError,
    events::EventEmitter,
    sdk_config::WatchSpec,
};

/// Reinstalls the app after a manifest change.
#[async_trait]
pub trait AppInstaller: Send + Sync {
    async fn install(&self) -> Result<InstallResult, RunError>;
}

/// Filesystem watch over a set of roots that yields at most one pending
/// change at a time.
pub struct FileWatcher {
    _watcher: RecommendedWatcher,
    changes: mpsc::Receiver<PathBuf>,
}

impl FileWatcher {
    pub fn new(spec: &WatchSpec) -> Result<Self, RunError> {
        let filter = spec
            .filter
            .as_deref()
            .map(Regex::new)
            .transpose()
            .map_err(|e| RunError::WatchConfig(e.to_string()))?;

        let (tx, changes) = mpsc::channel(1);
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                if !is_write(&event.kind) {
                    return;
                }
                if let Some(path) = event
                    .paths
                    .into_iter()
                    .find(|path| passes_filter(filter.as_ref(), path))
                {
                    // A full channel already holds a pending change.
                    let _ = tx.try_send(path);
                }
            }
            Err(error) => {
                tracing::warn!(target = "local_run::watcher", error = %error, "file watcher error")
            }
        })
        .map_err(|e| RunError::WatchConfig(e.to_string()))?;

        for path in &spec.paths {
            if let Err(error) = watcher.watch(path, RecursiveMode::Recursive) {
                tracing::warn!(
                    target = "local_run::watcher",
                    path = %path.display(),
                    error = %error,
                    "failed to watch path"
                );
            }
        }

        Ok(Self {
            _watcher: watcher,
            changes,
        })
    }

    /// Next qualifying change, or `None` once the watcher has shut down.
    pub async fn next_change(&mut self) -> Option<PathBuf> {
        self.changes.recv().await
    }
}

fn is_write(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Modify(ModifyKind::Data(_))
            | EventKind::Modify(ModifyKind::Any)
            | EventKind::Modify(ModifyKind::Name(RenameMode::To))
            | EventKind::Create(CreateKind::File)
    )
}

/// Filters are matched against the file name, not the full path.
fn passes_filter(filter: Option<&Regex>, path: &Path) -> bool {
    match filter {
        Some(filter) => path
            .file_name()
            .is_some_and(|name| filter.is_match(&name.to_string_lossy())),
        None => true,
    }
}

/// Reinstalls the app whenever a manifest file changes. Reinstall failures
/// are logged and watching continues.
pub async fn watch_manifest(
    spec: Option<WatchSpec>,
    installer: Arc<dyn AppInstaller>,
    events: EventEmitter,
    cancel: CancellationToken,
) -> Result<(), RunError> {
    let Some(spec) = spec else {
        tracing::debug!(target = "local_run::watcher", "no watch configuration, manifest watcher disabled");
        return Ok(());
    };
    if !spec.is_enabled() {
        tracing::debug!(target = "local_run::watcher", "manifest watching disabled");
        return Ok(());
    }

    let mut watcher = FileWatcher::new(&spec)?;
    tracing::info!(target = "local_run::watcher", paths = ?spec.paths, "watching for manifest changes");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            change = watcher.next_change() => {
                let Some(path) = change else {
                    return Ok(());
                };
                tracing::info!(target = "local_run::watcher", path = %path.display(), "manifest change detected, reinstalling app");
                events.emit("watch_change", json!({"concern": "manifest", "path": path}));
                match installer.install().await {
                    Ok(_) => tracing::info!(target = "local_run::watcher", "app reinstalled"),
                    Err(error) => tracing::warn!(target = "local_run::watcher", error = %error, "reinstall failed"),
                }
            }
        }
    }
}

/// Runs the SDK-managed delegate and restarts it whenever app code changes.
/// Returns when the initial process ends on its own, when the watcher
/// shuts down and the current process ends, or on cancellation.
pub async fn watch_app(
    spec: Option<WatchSpec>,
    delegate: DelegateProcess,
    events: EventEmitter,
    cancel: CancellationToken,
) -> Result<(), RunError> {
    let mut watcher = match spec.filter(WatchSpec::is_enabled) {
        Some(spec) => {
            let watcher = FileWatcher::new(&spec)?;
            tracing::info!(target = "local_run::watcher", paths = ?spec.paths, "watching for app changes");
            Some(watcher)
        }
        None => None,
    };

    let mut current = Some(spawn_start(&delegate));
    let mut restarted = false;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                delegate.stop().await;
                return Ok(());
            }
            result = join_current(&mut current) => {
                current = None;
                match (result, restarted) {
                    (Ok(DelegateExit::Stopped), _) => {}
                    (Ok(DelegateExit::Exited), false) => return Ok(()),
                    (Err(error), false) => return Err(error),
                    (Ok(DelegateExit::Exited), true) => {
                        tracing::debug!(target = "local_run::watcher", "restarted app process exited")
                    }
                    (Err(error), true) => {
                        tracing::debug!(target = "local_run::watcher", error = %error, "restarted app process failed")
                    }
                }
                if watcher.is_none() {
                    return Ok(());
                }
            }
            change = next_change(&mut watcher) => {
                let Some(path) = change else {
                    watcher = None;
                    if current.is_none() {
                        return Ok(());
                    }
                    continue;
                };
                tracing::info!(target = "local_run::watcher", path = %path.display(), "app change detected, restarting");
                events.emit("watch_change", json!({"concern": "app", "path": path}));
                delegate.stop().await;
                current = Some(spawn_start(&delegate));
                restarted = true;
            }
        }
    }
}

fn spawn_start(delegate: &DelegateProcess) -> JoinHandle<Result<DelegateExit, RunError>> {
    let delegate = delegate.clone();
    tokio::spawn(async move { delegate.start().await })
}

async fn join_current(
    current: &mut Option<JoinHandle<Result<DelegateExit, RunError>>>,
) -> Result<DelegateExit, RunError> {
    match current {
        Some(handle) => match handle.await {
            Ok(result) => result,
            Err(error) => Err(RunError::hook_failed(format!("app process task failed: {error}"))),
        },
        None => std::future::pending().await,
    }
}

async fn next_change(watcher: &mut Option<FileWatcher>) -> Option<PathBuf> {
    match watcher {
        Some(watcher) => watcher.next_change().await,
        None => std::future::pending().await,
    }
}


#[cfg(all(test, unix))]
mod app_tests {
    use std::{path::Path, time::Duration};

    use tokio_util::sync::CancellationToken;

    use super::watch_app;
    use crate::{
        delegate::{DelegateProcess, DelegateSpec},
        error::ErrorKind,
        events::EventEmitter,
        hooks::HookScript,
        sdk_config::WatchSpec,
    };

    fn delegate(command: &str, dir: &Path) -> DelegateProcess {
        let mut spec = DelegateSpec::new(HookScript::new("start", command), "xapp-1", "xoxb-1", dir.to_path_buf());
        spec.stop_grace = Duration::from_secs(2);
        DelegateProcess::spawn(spec)
    }

    fn runs(log: &Path) -> usize {
        std::fs::read_to_string(log)
            .map(|body| body.lines().count())
            .unwrap_or(0)
    }

    async fn wait_for_runs(log: &Path, at_least: usize) {
        for _ in 0..500 {
            if runs(log) >= at_least {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {at_least} runs, saw {}", runs(log));
    }

    async fn touch_until_restarted(app_file: &Path, log: &Path, at_least: usize) {
        for attempt in 0..50 {
            std::fs::write(app_file, format!("// edit {attempt}\n")).unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;
            if runs(log) >= at_least {
                return;
            }
        }
        panic!("app change never restarted the process");
    }

    #[tokio::test]
    async fn app_change_restarts_delegate_and_cancel_stops_it() {
        let app_dir = tempfile::tempdir().unwrap();
        let log_dir = tempfile::tempdir().unwrap();
        let app_file = app_dir.path().join("app.js");
        std::fs::write(&app_file, "// v0\n").unwrap();
        let log = log_dir.path().join("runs.log");

        let process = delegate(&format!("sh -c 'echo run >> {}; sleep 30'", log.display()), app_dir.path());
        let cancel = CancellationToken::new();
        let task = tokio::spawn(watch_app(
            Some(WatchSpec {
                paths: vec![app_dir.path().to_path_buf()],
                filter: Some(r"\.js$".into()),
            }),
            process.clone(),
            EventEmitter::default(),
            cancel.clone(),
        ));

        wait_for_runs(&log, 1).await;
        touch_until_restarted(&app_file, &log, 2).await;
        assert!(!task.is_finished());

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(10), task)
            .await
            .expect("watch_app should stop on cancel")
            .unwrap()
            .unwrap();
        assert!(!process.is_running().await);
    }

    #[tokio::test]
    async fn restarted_process_failure_is_not_fatal() {
        let app_dir = tempfile::tempdir().unwrap();
        let log_dir = tempfile::tempdir().unwrap();
        let app_file = app_dir.path().join("app.js");
        std::fs::write(&app_file, "// v0\n").unwrap();
        let log = log_dir.path().join("runs.log");

        let command = format!(
            "sh -c 'echo run >> {log}; if [ $(wc -l < {log}) -gt 1 ]; then exit 3; fi; sleep 30'",
            log = log.display()
        );
        let process = delegate(&command, app_dir.path());
        let cancel = CancellationToken::new();
        let task = tokio::spawn(watch_app(
            Some(WatchSpec {
                paths: vec![app_dir.path().to_path_buf()],
                filter: None,
            }),
            process,
            EventEmitter::default(),
            cancel.clone(),
        ));

        wait_for_runs(&log, 1).await;
        touch_until_restarted(&app_file, &log, 2).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!task.is_finished());

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(10), task)
            .await
            .expect("watch_app should stop on cancel")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn initial_process_result_ends_the_watch() {
        let app_dir = tempfile::tempdir().unwrap();
        let spec = WatchSpec {
            paths: vec![app_dir.path().to_path_buf()],
            filter: None,
        };

        let err = watch_app(
            Some(spec.clone()),
            delegate("sh -c 'exit 3'", app_dir.path()),
            EventEmitter::default(),
            CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::HookInvocationFailed);
        assert_eq!(err.exit_code(), Some(3));

        watch_app(
            Some(spec),
            delegate("true", app_dir.path()),
            EventEmitter::default(),
            CancellationToken::new(),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn without_app_watch_the_delegate_result_is_returned() {
        let app_dir = tempfile::tempdir().unwrap();
        watch_app(
            None,
            delegate("true", app_dir.path()),
            EventEmitter::default(),
            CancellationToken::new(),
        )
        .await
        .unwrap();
    }
}
