use std::fmt;

use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Stable tag attached to every [`RunError`] so callers can branch on the
/// failure class without matching message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    SocketConnection,
    LocalAppRun,
    HookNotFound,
    HookInvocationFailed,
    ProcessInterrupted,
    StreamingActivityLogs,
    AuthToken,
    Api,
    Install,
    WatchConfig,
    Io,
    Json,
}

impl ErrorKind {
    pub fn code(self) -> &'static str {
        match self {
            Self::SocketConnection => "socket_connection_error",
            Self::LocalAppRun => "local_app_run_error",
            Self::HookNotFound => "sdk_hook_not_found",
            Self::HookInvocationFailed => "sdk_hook_invocation_failed",
            Self::ProcessInterrupted => "process_interrupted",
            Self::StreamingActivityLogs => "streaming_activity_logs_error",
            Self::AuthToken => "auth_token_error",
            Self::Api => "api_error",
            Self::Install => "install_error",
            Self::WatchConfig => "watch_config_error",
            Self::Io => "io_error",
            Self::Json => "json_error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error("{context}: {source}")]
    SocketConnection {
        context: String,
        #[source]
        source: BoxError,
    },
    #[error("Couldn't run app locally: {0}")]
    LocalAppRun(#[source] Box<RunError>),
    #[error("The command for '{0}' was not found")]
    HookNotFound(String),
    #[error("{message}")]
    HookInvocationFailed {
        message: String,
        exit_code: Option<i32>,
    },
    #[error("The process received an interrupt signal")]
    ProcessInterrupted,
    #[error("Failed to stream the most recent activity logs: {0}")]
    StreamingActivityLogs(#[source] Box<RunError>),
    #[error("You must be logged in to use this command")]
    AuthToken,
    #[error("{method} responded with error '{code}'")]
    Api { method: String, code: String },
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Failed to install the app: {0}")]
    Install(String),
    #[error("Invalid watch configuration: {0}")]
    WatchConfig(String),
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Json(#[from] serde_json::Error),
}

impl RunError {
    pub fn socket(context: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::SocketConnection {
            context: context.into(),
            source: source.into(),
        }
    }

    pub fn hook_failed(message: impl Into<String>) -> Self {
        Self::HookInvocationFailed {
            message: message.into(),
            exit_code: None,
        }
    }

    /// Wraps `err` as a local-run failure unless it already is one.
    pub fn local_app_run(err: RunError) -> Self {
        match err {
            Self::LocalAppRun(_) => err,
            other => Self::LocalAppRun(Box::new(other)),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::SocketConnection { .. } => ErrorKind::SocketConnection,
            Self::LocalAppRun(_) => ErrorKind::LocalAppRun,
            Self::HookNotFound(_) => ErrorKind::HookNotFound,
            Self::HookInvocationFailed { .. } => ErrorKind::HookInvocationFailed,
            Self::ProcessInterrupted => ErrorKind::ProcessInterrupted,
            Self::StreamingActivityLogs(_) => ErrorKind::StreamingActivityLogs,
            Self::AuthToken => ErrorKind::AuthToken,
            Self::Api { .. } | Self::Http(_) => ErrorKind::Api,
            Self::Install(_) => ErrorKind::Install,
            Self::WatchConfig(_) => ErrorKind::WatchConfig,
            Self::Io(_) => ErrorKind::Io,
            Self::Json(_) => ErrorKind::Json,
        }
    }

    /// Exit status of the delegate process when it caused this failure.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::HookInvocationFailed { exit_code, .. } => *exit_code,
            Self::LocalAppRun(inner) | Self::StreamingActivityLogs(inner) => inner.exit_code(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ErrorKind, RunError};

    #[test]
    fn kind_codes_are_stable() {
        assert_eq!(ErrorKind::SocketConnection.code(), "socket_connection_error");
        assert_eq!(ErrorKind::HookNotFound.code(), "sdk_hook_not_found");
        assert_eq!(
            ErrorKind::HookInvocationFailed.code(),
            "sdk_hook_invocation_failed"
        );
        assert_eq!(ErrorKind::ProcessInterrupted.to_string(), "process_interrupted");
    }

    #[test]
    fn local_app_run_does_not_double_wrap() {
        let once = RunError::local_app_run(RunError::ProcessInterrupted);
        let twice = RunError::local_app_run(once);
        match twice {
            RunError::LocalAppRun(inner) => {
                assert_eq!(inner.kind(), ErrorKind::ProcessInterrupted)
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn exit_code_survives_wrapping() {
        let err = RunError::local_app_run(RunError::HookInvocationFailed {
            message: "The 'start' hook exited with an error".into(),
            exit_code: Some(3),
        });
        assert_eq!(err.kind(), ErrorKind::LocalAppRun);
        assert_eq!(err.exit_code(), Some(3));
        assert_eq!(RunError::AuthToken.exit_code(), None);
    }

    #[test]
    fn socket_error_message_includes_cause() {
        let err = RunError::socket("Error fetching socket connection URL", "pipes are clogged");
        assert_eq!(
            err.to_string(),
            "Error fetching socket connection URL: pipes are clogged"
        );
        assert_eq!(err.kind(), ErrorKind::SocketConnection);
    }

    #[test]
    fn hook_not_found_names_the_hook() {
        let err = RunError::HookNotFound("start".into());
        assert_eq!(err.to_string(), "The command for 'start' was not found");
    }
}
