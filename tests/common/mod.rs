//! Scripted stand-ins for the platform API, relay endpoint and start hook.
#![allow(dead_code)]

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::Notify;

use local_run::{
    api::{
        ActivityRequest, ActivityResult, AuthSession, InstallRequest, InstallResult, PlatformApi,
    },
    error::RunError,
    hooks::{HookExecOpts, HookExecutor},
    transport::{Dialer, ReceiveError, SocketConnection, TransportError, CLOSE_NORMAL_CLOSURE},
};

pub fn hello_frame() -> Vec<u8> {
    json!({"type": "hello", "debug_info": {"host": "relay-1"}})
        .to_string()
        .into_bytes()
}

pub fn disconnect_frame() -> Vec<u8> {
    json!({"type": "disconnect", "reason": "refresh_requested"})
        .to_string()
        .into_bytes()
}

pub fn event_frame(envelope_id: &str) -> Vec<u8> {
    json!({
        "type": "events_api",
        "envelope_id": envelope_id,
        "payload": {"event": {"type": "app_mention", "text": "hi"}},
        "accepts_response_payload": true,
    })
    .to_string()
    .into_bytes()
}

pub fn normal_close() -> Result<Vec<u8>, ReceiveError> {
    Err(ReceiveError::Closed {
        code: Some(CLOSE_NORMAL_CLOSURE),
        reason: String::new(),
    })
}

/// Replays queued frames, then parks until a close control is sent. When
/// `echo_close` is set the peer answers that control with a normal closure.
pub struct MockConnection {
    script: Mutex<VecDeque<Result<Vec<u8>, ReceiveError>>>,
    echo_close: bool,
    close_requested: Notify,
    pub fail_sends: AtomicBool,
    pub receives: AtomicUsize,
    pub sent: Mutex<Vec<Vec<u8>>>,
    pub close_controls: AtomicUsize,
    pub closes: AtomicUsize,
}

impl MockConnection {
    pub fn scripted(frames: Vec<Result<Vec<u8>, ReceiveError>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(frames.into()),
            echo_close: true,
            close_requested: Notify::new(),
            fail_sends: AtomicBool::new(false),
            receives: AtomicUsize::new(0),
            sent: Mutex::new(Vec::new()),
            close_controls: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
        })
    }

    /// A peer that never echoes close controls.
    pub fn silent() -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(VecDeque::new()),
            echo_close: false,
            close_requested: Notify::new(),
            fail_sends: AtomicBool::new(false),
            receives: AtomicUsize::new(0),
            sent: Mutex::new(Vec::new()),
            close_controls: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
        })
    }

    pub fn sent_json(&self) -> Vec<serde_json::Value> {
        self.sent
            .lock()
            .iter()
            .map(|frame| serde_json::from_slice(frame).unwrap())
            .collect()
    }
}

#[async_trait]
impl SocketConnection for MockConnection {
    async fn receive(&self) -> Result<Vec<u8>, ReceiveError> {
        self.receives.fetch_add(1, Ordering::SeqCst);
        let next = self.script.lock().pop_front();
        if let Some(next) = next {
            return next;
        }
        loop {
            self.close_requested.notified().await;
            if self.echo_close {
                return normal_close();
            }
        }
    }

    async fn send(&self, payload: Vec<u8>) -> Result<(), TransportError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(TransportError::Send("broken pipe".into()));
        }
        self.sent.lock().push(payload);
        Ok(())
    }

    async fn send_close_control(&self, _deadline: Duration) -> Result<(), TransportError> {
        self.close_controls.fetch_add(1, Ordering::SeqCst);
        self.close_requested.notify_one();
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Hands out the queued connections in order.
pub struct MockDialer {
    connections: Mutex<VecDeque<Arc<MockConnection>>>,
    pub opened: AtomicUsize,
}

impl MockDialer {
    pub fn new(connections: Vec<Arc<MockConnection>>) -> Arc<Self> {
        Arc::new(Self {
            connections: Mutex::new(connections.into()),
            opened: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl Dialer for MockDialer {
    async fn open(&self, _url: &str) -> Result<Arc<dyn SocketConnection>, TransportError> {
        let next = self.connections.lock().pop_front();
        match next {
            Some(conn) => {
                self.opened.fetch_add(1, Ordering::SeqCst);
                Ok(conn)
            }
            None => Err(TransportError::Open("no more scripted connections".into())),
        }
    }
}

pub struct MockApi {
    pub session: Result<AuthSession, String>,
    pub install: InstallResult,
    pub connections_open_error: Option<String>,
    pub connections_opened: AtomicUsize,
    pub installs: AtomicUsize,
    pub deletes: AtomicUsize,
}

impl MockApi {
    pub fn new() -> Self {
        Self {
            session: Ok(AuthSession {
                user_id: Some("U1".into()),
                user_name: Some("dev".into()),
                team_id: Some("T1".into()),
                team_name: Some("Acme".into()),
            }),
            install: InstallResult {
                app_id: "A1".into(),
                bot_token: "xoxb-1".into(),
                app_level_token: "xapp-1".into(),
                ..InstallResult::default()
            },
            connections_open_error: None,
            connections_opened: AtomicUsize::new(0),
            installs: AtomicUsize::new(0),
            deletes: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl PlatformApi for MockApi {
    async fn connections_open(&self, _app_token: &str) -> Result<String, RunError> {
        self.connections_opened.fetch_add(1, Ordering::SeqCst);
        match &self.connections_open_error {
            Some(code) => Err(RunError::Api {
                method: "apps.connections.open".into(),
                code: code.clone(),
            }),
            None => Ok("wss://relay.test/link".into()),
        }
    }

    async fn validate_session(&self, _token: &str) -> Result<AuthSession, RunError> {
        self.session.clone().map_err(|code| RunError::Api {
            method: "auth.test".into(),
            code,
        })
    }

    async fn activity(
        &self,
        _token: &str,
        _request: &ActivityRequest,
    ) -> Result<ActivityResult, RunError> {
        Ok(ActivityResult::default())
    }

    async fn install_local_app(
        &self,
        _token: &str,
        _request: &InstallRequest,
    ) -> Result<InstallResult, RunError> {
        self.installs.fetch_add(1, Ordering::SeqCst);
        Ok(self.install.clone())
    }

    async fn delete_app(&self, _token: &str, _app_id: &str) -> Result<(), RunError> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub enum HookReply {
    Output(String),
    Fail,
}

/// Start hook double that records every invocation's stdin and env.
pub struct MockHooks {
    reply: HookReply,
    pub stdin: Mutex<Vec<serde_json::Value>>,
    pub env: Mutex<Vec<Vec<(String, String)>>>,
}

impl MockHooks {
    pub fn new(reply: HookReply) -> Arc<Self> {
        Arc::new(Self {
            reply,
            stdin: Mutex::new(Vec::new()),
            env: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl HookExecutor for MockHooks {
    async fn execute(&self, opts: HookExecOpts<'_>) -> Result<String, RunError> {
        if let Some(stdin) = &opts.stdin {
            self.stdin.lock().push(serde_json::from_slice(stdin).unwrap());
        }
        self.env.lock().push(opts.env.clone());
        match &self.reply {
            HookReply::Output(output) => Ok(output.clone()),
            HookReply::Fail => Err(RunError::hook_failed("Error running 'start' command: exit status: 1")),
        }
    }
}
