use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use tokio::{net::TcpStream, sync::Mutex, time::timeout};
use tokio_tungstenite::{
    tungstenite::{
        self,
        protocol::{frame::coding::CloseCode, CloseFrame},
        Message,
    },
    MaybeTlsStream, WebSocketStream,
};

pub const CLOSE_NORMAL_CLOSURE: u16 = 1000;
pub const CLOSE_GOING_AWAY: u16 = 1001;

const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum ReceiveError {
    #[error("websocket closed by peer (code {code:?}): {reason}")]
    Closed { code: Option<u16>, reason: String },
    #[error("websocket stream ended")]
    StreamEnded,
    #[error("websocket transport error: {0}")]
    Transport(String),
}

impl ReceiveError {
    /// True when the peer closed with normal-closure or going-away, which
    /// ends a connection without being a fault.
    pub fn is_clean_close(&self) -> bool {
        matches!(
            self,
            Self::Closed {
                code: Some(CLOSE_NORMAL_CLOSURE | CLOSE_GOING_AWAY),
                ..
            }
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to open websocket: {0}")]
    Open(String),
    #[error("failed to write to websocket: {0}")]
    Send(String),
    #[error("timed out writing to websocket")]
    Timeout,
}

/// One duplex message stream to the relay endpoint.
#[async_trait]
pub trait SocketConnection: Send + Sync {
    /// Blocks until a data frame arrives or the socket fails.
    async fn receive(&self) -> Result<Vec<u8>, ReceiveError>;

    async fn send(&self, payload: Vec<u8>) -> Result<(), TransportError>;

    /// Asks the peer to close the connection. Callers treat failures as
    /// advisory only.
    async fn send_close_control(&self, deadline: Duration) -> Result<(), TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}

#[async_trait]
pub trait Dialer: Send + Sync {
    async fn open(&self, url: &str) -> Result<Arc<dyn SocketConnection>, TransportError>;
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// `tokio-tungstenite` connection split so a close control can be written
/// while another task is parked in `receive`.
pub struct WsConnection {
    sink: Mutex<SplitSink<WsStream, Message>>,
    stream: Mutex<SplitStream<WsStream>>,
}

impl WsConnection {
    pub fn new(ws: WsStream) -> Self {
        let (sink, stream) = ws.split();
        Self {
            sink: Mutex::new(sink),
            stream: Mutex::new(stream),
        }
    }
}

#[async_trait]
impl SocketConnection for WsConnection {
    async fn receive(&self) -> Result<Vec<u8>, ReceiveError> {
        let mut stream = self.stream.lock().await;
        loop {
            match stream.next().await {
                Some(Ok(Message::Text(text))) => return Ok(text.into_bytes()),
                Some(Ok(Message::Binary(bytes))) => return Ok(bytes),
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => continue,
                Some(Ok(Message::Close(frame))) => {
                    return Err(match frame {
                        Some(frame) => ReceiveError::Closed {
                            code: Some(u16::from(frame.code)),
                            reason: frame.reason.into_owned(),
                        },
                        None => ReceiveError::Closed {
                            code: None,
                            reason: String::new(),
                        },
                    })
                }
                Some(Err(tungstenite::Error::ConnectionClosed)) | None => {
                    return Err(ReceiveError::StreamEnded)
                }
                Some(Err(error)) => return Err(ReceiveError::Transport(error.to_string())),
            }
        }
    }

    async fn send(&self, payload: Vec<u8>) -> Result<(), TransportError> {
        let text = String::from_utf8(payload).map_err(|e| TransportError::Send(e.to_string()))?;
        self.sink
            .lock()
            .await
            .send(Message::Text(text))
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn send_close_control(&self, deadline: Duration) -> Result<(), TransportError> {
        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: "".into(),
        };
        let mut sink = self.sink.lock().await;
        match timeout(deadline, sink.send(Message::Close(Some(frame)))).await {
            Ok(result) => result.map_err(|e| TransportError::Send(e.to_string())),
            Err(_) => Err(TransportError::Timeout),
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        let mut sink = self.sink.lock().await;
        match timeout(CLOSE_TIMEOUT, sink.close()).await {
            Ok(Ok(())) | Ok(Err(tungstenite::Error::ConnectionClosed)) => Ok(()),
            Ok(Err(tungstenite::Error::AlreadyClosed)) => Ok(()),
            Ok(Err(error)) => Err(TransportError::Send(error.to_string())),
            Err(_) => Err(TransportError::Timeout),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WsDialer;

#[async_trait]
impl Dialer for WsDialer {
    async fn open(&self, url: &str) -> Result<Arc<dyn SocketConnection>, TransportError> {
        let (ws, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| TransportError::Open(e.to_string()))?;
        tracing::debug!(target = "local_run::transport", "websocket connection established");
        Ok(Arc::new(WsConnection::new(ws)))
    }
}
