//! Control channel over one persistent socket: JSON envelopes as text frames, raw bytes as
//! binary frames, op-filtered receives with per-call timeouts.

use std::borrow::Cow;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::USER_AGENT;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace};

use crate::config::EndpointConfig;
use crate::protocol::Envelope;
use crate::wire;

/// Transport-level frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    Close,
}

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("send failed: {0}")]
    Send(String),
    #[error("receive failed: {0}")]
    Receive(String),
    #[error(transparent)]
    Encode(#[from] wire::EncodeError),
    #[error("channel is closed")]
    Closed,
}

/// Moves frames over a socket. One owner; no concurrent writers.
#[async_trait]
pub trait FrameTransport: Send {
    async fn send_frame(&mut self, frame: Frame) -> Result<(), ChannelError>;

    /// Next data or close frame; `Ok(None)` once the underlying stream has ended.
    async fn recv_frame(&mut self) -> Result<Option<Frame>, ChannelError>;
}

/// WebSocket transport (TLS via rustls).
pub struct WsTransport {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl WsTransport {
    pub async fn connect(endpoint: &EndpointConfig) -> Result<Self, ChannelError> {
        let uri = endpoint.socket_uri();
        let mut request = uri
            .as_str()
            .into_client_request()
            .map_err(|e| ChannelError::Connect(e.to_string()))?;
        let agent = HeaderValue::from_str(&endpoint.user_agent)
            .map_err(|e| ChannelError::Connect(e.to_string()))?;
        request.headers_mut().insert(USER_AGENT, agent);
        let (stream, response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| ChannelError::Connect(e.to_string()))?;
        debug!(%uri, status = %response.status(), "websocket handshake complete");
        Ok(Self { stream })
    }
}

#[async_trait]
impl FrameTransport for WsTransport {
    async fn send_frame(&mut self, frame: Frame) -> Result<(), ChannelError> {
        let result = match frame {
            Frame::Text(text) => self.stream.send(Message::Text(text)).await,
            Frame::Binary(bytes) => self.stream.send(Message::Binary(bytes)).await,
            Frame::Close => {
                self.stream
                    .close(Some(CloseFrame {
                        code: CloseCode::Normal,
                        reason: Cow::Borrowed("Closing"),
                    }))
                    .await
            }
        };
        result.map_err(|e| ChannelError::Send(e.to_string()))
    }

    async fn recv_frame(&mut self) -> Result<Option<Frame>, ChannelError> {
        loop {
            match self.stream.next().await {
                None | Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) => {
                    return Ok(None)
                }
                Some(Err(e)) => return Err(ChannelError::Receive(e.to_string())),
                Some(Ok(Message::Text(text))) => return Ok(Some(Frame::Text(text))),
                Some(Ok(Message::Binary(bytes))) => return Ok(Some(Frame::Binary(bytes))),
                Some(Ok(Message::Close(_))) => return Ok(Some(Frame::Close)),
                // Pings are answered by tungstenite itself.
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => continue,
            }
        }
    }
}

/// Timeout convention of the wire protocol: negative means wait indefinitely.
pub fn timeout_from_millis(millis: i64) -> Option<Duration> {
    u64::try_from(millis).ok().map(Duration::from_millis)
}

/// Envelope/raw-frame channel over one exclusively owned transport.
pub struct FramedMessageChannel<T> {
    transport: T,
    closed: bool,
    peer_closed: bool,
}

impl FramedMessageChannel<WsTransport> {
    /// Open a WebSocket to the endpoint's upload socket.
    pub async fn connect(endpoint: &EndpointConfig) -> Result<Self, ChannelError> {
        Ok(Self::new(WsTransport::connect(endpoint).await?))
    }
}

impl<T: FrameTransport> FramedMessageChannel<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            closed: false,
            peer_closed: false,
        }
    }

    /// Neither side has closed.
    pub fn is_open(&self) -> bool {
        !self.closed && !self.peer_closed
    }

    /// The peer sent a close frame or the stream ended.
    pub fn peer_closed(&self) -> bool {
        self.peer_closed
    }

    /// Send `{"op": op, "data": data}` as a text frame. No retry.
    pub async fn send_operation<D: Serialize + ?Sized>(
        &mut self,
        op: &str,
        data: &D,
    ) -> Result<(), ChannelError> {
        if self.closed {
            return Err(ChannelError::Closed);
        }
        let text = wire::encode_envelope(op, &data)?;
        trace!(op, "sending operation");
        self.transport.send_frame(Frame::Text(text)).await
    }

    /// Send bytes verbatim as one binary frame.
    pub async fn send_raw(&mut self, bytes: Vec<u8>) -> Result<(), ChannelError> {
        if self.closed {
            return Err(ChannelError::Closed);
        }
        self.transport.send_frame(Frame::Binary(bytes)).await
    }

    /// Wait for an envelope with `op == expected`, discarding any other envelopes. `Ok(None)` on
    /// timeout or peer close; `None` timeout waits indefinitely.
    pub async fn receive_operation(
        &mut self,
        expected: &str,
        timeout: Option<Duration>,
    ) -> Result<Option<Envelope>, ChannelError> {
        self.receive_within(Some(expected), timeout).await
    }

    /// Like [`receive_operation`](Self::receive_operation) but accepts the first well-formed
    /// envelope of any op.
    pub async fn receive_next_operation(
        &mut self,
        timeout: Option<Duration>,
    ) -> Result<Option<Envelope>, ChannelError> {
        self.receive_within(None, timeout).await
    }

    /// Resolve once the peer closes, discarding every envelope that arrives meanwhile.
    /// Cancel-safe: dropping the future loses no frame that would otherwise be kept.
    pub async fn peer_close(&mut self) -> Result<(), ChannelError> {
        while self.is_open() {
            if let Some(env) = self.next_matching(None).await? {
                debug!(op = %env.op, "discarding envelope while idle");
            }
        }
        Ok(())
    }

    /// Send a close frame. Idempotent; send failures while closing are ignored.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(e) = self.transport.send_frame(Frame::Close).await {
            debug!(error = %e, "close frame not delivered");
        }
    }

    async fn receive_within(
        &mut self,
        expected: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<Option<Envelope>, ChannelError> {
        if !self.is_open() {
            return Ok(None);
        }
        let wait = self.next_matching(expected);
        match timeout {
            None => wait.await,
            Some(limit) => match tokio::time::timeout(limit, wait).await {
                Ok(result) => result,
                Err(_) => {
                    debug!(?expected, ?limit, "timed out waiting for operation");
                    Ok(None)
                }
            },
        }
    }

    async fn next_matching(
        &mut self,
        expected: Option<&str>,
    ) -> Result<Option<Envelope>, ChannelError> {
        loop {
            let frame = match self.transport.recv_frame().await? {
                Some(frame) => frame,
                None => {
                    self.peer_closed = true;
                    return Ok(None);
                }
            };
            match frame {
                Frame::Close => {
                    debug!("peer closed the channel");
                    self.peer_closed = true;
                    return Ok(None);
                }
                Frame::Binary(bytes) => {
                    trace!(len = bytes.len(), "ignoring binary frame");
                }
                Frame::Text(text) => match wire::decode_envelope(&text) {
                    Ok(env) if expected.map_or(true, |op| env.op == op) => return Ok(Some(env)),
                    Ok(env) => debug!(op = %env.op, ?expected, "discarding envelope"),
                    Err(e) => debug!(error = %e, "discarding malformed text frame"),
                },
            }
        }
    }
}
