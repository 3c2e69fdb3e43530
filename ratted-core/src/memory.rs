//! In-memory transport pair for exercising the channel and session against a scripted peer.

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::channel::{ChannelError, Frame, FrameTransport};
use crate::protocol::Envelope;
use crate::wire;

pub struct MemoryTransport {
    tx: mpsc::UnboundedSender<Frame>,
    rx: mpsc::UnboundedReceiver<Frame>,
}

/// Two connected ends; frames sent on one are received on the other.
pub fn pair() -> (MemoryTransport, MemoryTransport) {
    let (a_tx, b_rx) = mpsc::unbounded_channel();
    let (b_tx, a_rx) = mpsc::unbounded_channel();
    (
        MemoryTransport { tx: a_tx, rx: a_rx },
        MemoryTransport { tx: b_tx, rx: b_rx },
    )
}

#[async_trait]
impl FrameTransport for MemoryTransport {
    async fn send_frame(&mut self, frame: Frame) -> Result<(), ChannelError> {
        self.tx
            .send(frame)
            .map_err(|_| ChannelError::Send("peer dropped".into()))
    }

    async fn recv_frame(&mut self) -> Result<Option<Frame>, ChannelError> {
        Ok(self.rx.recv().await)
    }
}

/// Helpers for the scripted (server) end.
impl MemoryTransport {
    pub async fn send(&mut self, frame: Frame) {
        let _ = self.send_frame(frame).await;
    }

    pub async fn send_envelope(&mut self, op: &str, data: Value) {
        let text = wire::encode_envelope(op, &data).expect("encode");
        self.send(Frame::Text(text)).await;
    }

    pub async fn next(&mut self) -> Option<Frame> {
        self.rx.recv().await
    }

    /// Next frame, which must be a text envelope.
    pub async fn expect_envelope(&mut self) -> Envelope {
        match self.next().await {
            Some(Frame::Text(text)) => wire::decode_envelope(&text).expect("decode"),
            other => panic!("expected text envelope, got {other:?}"),
        }
    }

    /// Next frame, which must be binary.
    pub async fn expect_binary(&mut self) -> Vec<u8> {
        match self.next().await {
            Some(Frame::Binary(bytes)) => bytes,
            other => panic!("expected binary frame, got {other:?}"),
        }
    }

    /// Drain until the other end is dropped; number of close frames seen.
    pub async fn count_closes(&mut self) -> usize {
        let mut closes = 0;
        while let Some(frame) = self.next().await {
            if frame == Frame::Close {
                closes += 1;
            }
        }
        closes
    }
}
