use std::{sync::Arc, time::Duration};

use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    api::PlatformApi,
    cleanup::CleanupGroup,
    error::RunError,
    events::EventEmitter,
    hooks::{HookExecOpts, HookExecutor, HookScript},
    protocol::{LinkResponse, LocalHostedContext, Message, MessageKind, SocketEvent},
    transport::{Dialer, SocketConnection},
};

/// How long a cancelled listener waits for the peer to echo a close.
pub const CLOSE_ECHO_GRACE: Duration = Duration::from_secs(2);
pub const CONTROL_CLOSE_DEADLINE: Duration = Duration::from_secs(1);

/// Result of relaying on one connection.
#[derive(Debug)]
pub enum ListenOutcome {
    /// Cancelled, or the peer closed normally.
    CleanExit,
    /// The connection should be replaced with a fresh one.
    Restart,
    Fault(RunError),
}

/// Relays platform events between the relay connection and the start hook.
pub struct LocalServer {
    api: Arc<dyn PlatformApi>,
    dialer: Arc<dyn Dialer>,
    hooks: Arc<dyn HookExecutor>,
    start_hook: HookScript,
    hook_env: Vec<(String, String)>,
    app_token: String,
    context: LocalHostedContext,
    cleanup: CleanupGroup,
    events: EventEmitter,
    connection: Mutex<Option<Arc<dyn SocketConnection>>>,
    close_echo_grace: Duration,
}

pub struct LocalServerOptions {
    pub api: Arc<dyn PlatformApi>,
    pub dialer: Arc<dyn Dialer>,
    pub hooks: Arc<dyn HookExecutor>,
    pub start_hook: HookScript,
    /// Extra environment for every start hook invocation.
    pub hook_env: Vec<(String, String)>,
    pub app_token: String,
    pub context: LocalHostedContext,
    pub cleanup: CleanupGroup,
    pub events: EventEmitter,
}

impl LocalServer {
    pub fn new(opts: LocalServerOptions) -> Self {
        Self {
            api: opts.api,
            dialer: opts.dialer,
            hooks: opts.hooks,
            start_hook: opts.start_hook,
            hook_env: opts.hook_env,
            app_token: opts.app_token,
            context: opts.context,
            cleanup: opts.cleanup,
            events: opts.events,
            connection: Mutex::new(None),
            close_echo_grace: CLOSE_ECHO_GRACE,
        }
    }

    pub fn with_close_echo_grace(mut self, grace: Duration) -> Self {
        self.close_echo_grace = grace;
        self
    }

    pub fn context(&self) -> &LocalHostedContext {
        &self.context
    }

    /// Keeps a relay connection open until the run is cancelled, the peer
    /// closes normally, or a fault occurs. Connection-open failures are
    /// returned without retrying.
    pub async fn start(self: &Arc<Self>, cancel: CancellationToken) -> Result<(), RunError> {
        let mut connects = 0u32;
        loop {
            tracing::debug!(target = "local_run::server", "retrieving relay connection url");
            let url = self
                .api
                .connections_open(&self.app_token)
                .await
                .map_err(|e| RunError::socket("Error fetching socket connection URL", e))?;
            let conn = self
                .dialer
                .open(&url)
                .await
                .map_err(|e| RunError::socket("Error establishing socket connection", e))?;

            let status = if connects == 0 { "connected" } else { "reconnected" };
            connects += 1;
            self.events.emit("connection", json!({"status": status}));

            let outcome = self.serve_connection(conn, cancel.clone()).await;
            match outcome {
                ListenOutcome::CleanExit => {
                    tracing::debug!(target = "local_run::server", "relay connection closed cleanly");
                    return Ok(());
                }
                ListenOutcome::Restart => {
                    tracing::debug!(target = "local_run::server", "reconnecting relay connection");
                }
                ListenOutcome::Fault(error) => return Err(RunError::local_app_run(error)),
            }
        }
    }

    /// Runs one listener for `conn` and tears the connection down whatever
    /// the outcome.
    async fn serve_connection(
        self: &Arc<Self>,
        conn: Arc<dyn SocketConnection>,
        cancel: CancellationToken,
    ) -> ListenOutcome {
        let _registration = self.cleanup.guard();
        *self.connection.lock() = Some(conn.clone());

        let (outcome_tx, mut outcome_rx) = mpsc::channel(1);
        let listener = {
            let server = Arc::clone(self);
            let conn = conn.clone();
            tokio::spawn(async move { server.listen(conn, cancel, outcome_tx).await })
        };

        let outcome = match outcome_rx.recv().await {
            Some(outcome) => outcome,
            None => ListenOutcome::Fault(RunError::socket(
                "Error reading from socket connection",
                "relay listener stopped without reporting",
            )),
        };
        if let Err(error) = listener.await {
            tracing::warn!(target = "local_run::server", error = %error, "relay listener task failed");
        }

        if matches!(outcome, ListenOutcome::Fault(_)) {
            if let Err(error) = conn.send_close_control(CONTROL_CLOSE_DEADLINE).await {
                tracing::debug!(target = "local_run::server", error = %error, "failed to send close control");
            }
        }

        self.connection.lock().take();
        if let Err(error) = conn.close().await {
            tracing::debug!(target = "local_run::server", error = %error, "failed to close relay connection");
        }
        outcome
    }

    /// Asks the peer to close the live connection, if there is one. The peer's
    /// echo unblocks a listener parked in `receive`.
    pub async fn send_close_control(&self) {
        let conn = self.connection.lock().clone();
        if let Some(conn) = conn {
            if let Err(error) = conn.send_close_control(CONTROL_CLOSE_DEADLINE).await {
                tracing::debug!(target = "local_run::server", error = %error, "failed to send close control");
            }
        }
    }

    /// Relays envelopes from `conn` until it reports exactly one outcome.
    pub async fn listen(
        &self,
        conn: Arc<dyn SocketConnection>,
        cancel: CancellationToken,
        outcome: mpsc::Sender<ListenOutcome>,
    ) {
        tracing::info!(target = "local_run::server", "relay connection established, listening for events");
        let result = self.relay(conn.as_ref(), &cancel).await;
        let _ = outcome.send(result).await;
    }

    async fn relay(&self, conn: &dyn SocketConnection, cancel: &CancellationToken) -> ListenOutcome {
        loop {
            if cancel.is_cancelled() {
                return ListenOutcome::CleanExit;
            }

            let frame = tokio::select! {
                frame = conn.receive() => frame,
                _ = self.close_echo_elapsed(cancel) => {
                    tracing::debug!(target = "local_run::server", "no close echo from peer, ending listener");
                    return ListenOutcome::CleanExit;
                }
            };

            let frame = match frame {
                Ok(frame) => frame,
                Err(error) if error.is_clean_close() => return ListenOutcome::CleanExit,
                Err(error) => {
                    return ListenOutcome::Fault(RunError::socket(
                        "Error reading from socket connection",
                        error,
                    ))
                }
            };

            let message: Message = match serde_json::from_slice(&frame) {
                Ok(message) => message,
                Err(error) => {
                    tracing::debug!(
                        target = "local_run::server",
                        error = %error,
                        "re-establishing socket connection after unexpected frame"
                    );
                    return ListenOutcome::Restart;
                }
            };

            match message.kind() {
                MessageKind::Hello => {
                    tracing::debug!(target = "local_run::server", host = ?message.debug_info.host, "relay hello");
                }
                MessageKind::Disconnect => {
                    tracing::debug!(target = "local_run::server", reason = %message.reason, "relay requested disconnect");
                    return ListenOutcome::Restart;
                }
                MessageKind::Event => {
                    if let Err(error) = self.handle_event(conn, &message).await {
                        return ListenOutcome::Fault(error);
                    }
                }
            }
        }
    }

    async fn close_echo_elapsed(&self, cancel: &CancellationToken) {
        cancel.cancelled().await;
        tokio::time::sleep(self.close_echo_grace).await;
    }

    async fn handle_event(&self, conn: &dyn SocketConnection, message: &Message) -> Result<(), RunError> {
        let event = SocketEvent {
            body: message.payload.as_deref(),
            context: &self.context,
        };
        let stdin = serde_json::to_vec(&event)?;
        self.start_hook.get()?;

        let output = match self
            .hooks
            .execute(HookExecOpts {
                hook: &self.start_hook,
                stdin: Some(stdin),
                env: self.hook_env.clone(),
            })
            .await
        {
            Ok(output) => output,
            Err(error) => {
                tracing::warn!(
                    target = "local_run::server",
                    envelope_id = %message.envelope_id,
                    error = %error,
                    "start hook failed to handle event"
                );
                self.events.emit(
                    "hook_result",
                    json!({"envelope_id": message.envelope_id, "ok": false}),
                );
                return Ok(());
            }
        };

        self.events.emit(
            "hook_result",
            json!({"envelope_id": message.envelope_id, "ok": true}),
        );
        let response = LinkResponse::new(message.envelope_id.clone(), &output)
            .map_err(|e| RunError::socket("Invalid response payload from start hook", e))?;
        send_link_response(conn, &response).await
    }
}

/// Serializes `response` and writes it as one frame.
pub async fn send_link_response(
    conn: &dyn SocketConnection,
    response: &LinkResponse,
) -> Result<(), RunError> {
    let payload = serde_json::to_vec(response)?;
    conn.send(payload)
        .await
        .map_err(|e| RunError::socket("Error writing to socket connection", e))
}
