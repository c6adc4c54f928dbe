//! Framed send/receive over one WebSocket.
//!
//! A connection is split in two: [`TunnelConn`] is the shared, thread-safe
//! writer (one mutex serializes frames, a closed flag makes `send` fail fast),
//! and [`TunnelReader`] is the receive half, owned by exactly one message loop.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::channel::mpsc as frame_channel;
use futures::{future, Sink, SinkExt, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;

use super::message::TunnelMessage;
use crate::error::{Result, TunnelError};

/// Bound on how long `close` waits for an in-flight write before giving up.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Transport-neutral view of an inbound WebSocket frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    /// Ping/pong; never surfaced to the message loop.
    Control,
    Close,
}

impl From<axum::extract::ws::Message> for Frame {
    fn from(msg: axum::extract::ws::Message) -> Self {
        use axum::extract::ws::Message;
        match msg {
            Message::Text(t) => Frame::Text(t.as_str().to_owned()),
            Message::Binary(b) => Frame::Binary(b.to_vec()),
            Message::Ping(_) | Message::Pong(_) => Frame::Control,
            Message::Close(_) => Frame::Close,
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Message> for Frame {
    fn from(msg: tokio_tungstenite::tungstenite::Message) -> Self {
        use tokio_tungstenite::tungstenite::Message;
        match msg {
            Message::Text(t) => Frame::Text(t.as_str().to_owned()),
            Message::Binary(b) => Frame::Binary(b.to_vec()),
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => Frame::Control,
            Message::Close(_) => Frame::Close,
        }
    }
}

type FrameSink = Pin<Box<dyn Sink<String, Error = TunnelError> + Send>>;
type FrameStream = Pin<Box<dyn Stream<Item = Result<Frame>> + Send>>;

/// Writer half of a tunnel connection. Shared behind an `Arc`.
pub struct TunnelConn {
    sink: Mutex<FrameSink>,
    closed: AtomicBool,
    shutdown: CancellationToken,
}

/// Reader half of a tunnel connection. Not `Clone`: one owner per connection.
pub struct TunnelReader {
    stream: FrameStream,
    shutdown: CancellationToken,
}

impl TunnelConn {
    /// Build a connection from any text-frame sink and frame stream.
    pub fn new<S, R>(sink: S, stream: R) -> (Arc<Self>, TunnelReader)
    where
        S: Sink<String, Error = TunnelError> + Send + 'static,
        R: Stream<Item = Result<Frame>> + Send + 'static,
    {
        let shutdown = CancellationToken::new();
        let conn = Arc::new(Self {
            sink: Mutex::new(Box::pin(sink)),
            closed: AtomicBool::new(false),
            shutdown: shutdown.clone(),
        });
        let reader = TunnelReader {
            stream: Box::pin(stream),
            shutdown,
        };
        (conn, reader)
    }

    /// Wrap a manager-side (server) WebSocket accepted by axum.
    pub fn from_axum(socket: axum::extract::ws::WebSocket) -> (Arc<Self>, TunnelReader) {
        let (sink, stream) = socket.split();
        let sink = sink.sink_map_err(TunnelError::from).with(|text: String| {
            future::ready(Ok::<_, TunnelError>(axum::extract::ws::Message::Text(
                text.into(),
            )))
        });
        let stream = stream.map(|r| r.map(Frame::from).map_err(TunnelError::from));
        Self::new(sink, stream)
    }

    /// Wrap an agent-side (client) WebSocket dialed with tokio-tungstenite.
    pub fn from_tungstenite<T>(ws: WebSocketStream<T>) -> (Arc<Self>, TunnelReader)
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, stream) = ws.split();
        let sink = sink.sink_map_err(TunnelError::from).with(|text: String| {
            future::ready(Ok::<_, TunnelError>(
                tokio_tungstenite::tungstenite::Message::Text(text.into()),
            ))
        });
        let stream = stream.map(|r| r.map(Frame::from).map_err(TunnelError::from));
        Self::new(sink, stream)
    }

    /// Two connections wired back to back in memory. Whatever one side sends,
    /// the other side receives; closing one ends the other's stream.
    pub fn pair() -> ((Arc<Self>, TunnelReader), (Arc<Self>, TunnelReader)) {
        let (a_tx, a_rx) = frame_channel::unbounded::<String>();
        let (b_tx, b_rx) = frame_channel::unbounded::<String>();
        let a = Self::new(
            a_tx.sink_map_err(|_| TunnelError::TransportClosed),
            b_rx.map(|text| Ok(Frame::Text(text))),
        );
        let b = Self::new(
            b_tx.sink_map_err(|_| TunnelError::TransportClosed),
            a_rx.map(|text| Ok(Frame::Text(text))),
        );
        (a, b)
    }

    /// Serialize and write one frame. Fails fast with `TransportClosed` once
    /// the connection has been closed, without touching the write lock.
    pub async fn send(&self, msg: &TunnelMessage) -> Result<()> {
        if self.is_closed() {
            return Err(TunnelError::TransportClosed);
        }
        let text = msg.encode()?;
        let mut sink = self.sink.lock().await;
        // Closed while we were queued behind another writer.
        if self.is_closed() {
            return Err(TunnelError::TransportClosed);
        }
        sink.send(text).await
    }

    /// Idempotent. Flips the closed flag first so concurrent senders observe
    /// it, wakes the reader, then closes the socket.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.cancel();
        let _ = tokio::time::timeout(CLOSE_TIMEOUT, async {
            let mut sink = self.sink.lock().await;
            let _ = sink.close().await;
        })
        .await;
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Resolves once `close` has been called.
    pub async fn closed(&self) {
        self.shutdown.cancelled().await;
    }
}

impl TunnelReader {
    /// Block on the next message. Control frames are skipped; a close frame,
    /// end of stream or a local `close()` yields `TransportClosed`; an
    /// undecodable frame yields `Protocol`.
    pub async fn receive(&mut self) -> Result<TunnelMessage> {
        loop {
            let frame = tokio::select! {
                () = self.shutdown.cancelled() => return Err(TunnelError::TransportClosed),
                frame = self.stream.next() => frame,
            };
            match frame {
                None | Some(Ok(Frame::Close)) => return Err(TunnelError::TransportClosed),
                Some(Err(e)) => return Err(e),
                Some(Ok(Frame::Text(text))) => return TunnelMessage::decode(&text),
                Some(Ok(Frame::Binary(bytes))) => return Ok(serde_json::from_slice(&bytes)?),
                Some(Ok(Frame::Control)) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pair_delivers_in_order() {
        let ((a, _a_reader), (_b, mut b_reader)) = TunnelConn::pair();
        a.send(&TunnelMessage::HeartbeatAck { id: "1".into() })
            .await
            .unwrap();
        a.send(&TunnelMessage::WsClose { id: "2".into() })
            .await
            .unwrap();
        assert_eq!(b_reader.receive().await.unwrap().id(), "1");
        assert_eq!(b_reader.receive().await.unwrap().id(), "2");
    }

    #[tokio::test]
    async fn send_after_close_fails_immediately() {
        let ((a, _a_reader), _b) = TunnelConn::pair();
        a.close().await;
        assert!(a.is_closed());
        let res = tokio::time::timeout(
            Duration::from_millis(100),
            a.send(&TunnelMessage::heartbeat()),
        )
        .await
        .expect("send on a closed connection must not block");
        assert_eq!(res, Err(TunnelError::TransportClosed));
    }

    #[tokio::test]
    async fn close_is_idempotent_and_ends_peer_stream() {
        let ((a, mut a_reader), (_b, mut b_reader)) = TunnelConn::pair();
        a.close().await;
        a.close().await;
        assert_eq!(a_reader.receive().await, Err(TunnelError::TransportClosed));
        assert_eq!(b_reader.receive().await, Err(TunnelError::TransportClosed));
    }

    #[tokio::test]
    async fn malformed_frame_is_protocol_error() {
        let (tx, rx) = frame_channel::unbounded::<Result<Frame>>();
        let (_conn, mut reader) = TunnelConn::new(
            futures::sink::drain().sink_map_err(|_| TunnelError::TransportClosed),
            rx,
        );
        tx.unbounded_send(Ok(Frame::Control)).unwrap();
        tx.unbounded_send(Ok(Frame::Text("{oops".into()))).unwrap();
        tx.unbounded_send(Ok(Frame::Text(r#"{"type":"stream_end","id":"x"}"#.into())))
            .unwrap();
        assert!(matches!(
            reader.receive().await,
            Err(TunnelError::Protocol(_))
        ));
        // The reader itself survives; the caller decides whether to stop.
        assert_eq!(reader.receive().await.unwrap().id(), "x");
    }

    #[tokio::test]
    async fn close_frame_ends_receive() {
        let (tx, rx) = frame_channel::unbounded::<Result<Frame>>();
        let (_conn, mut reader) = TunnelConn::new(
            futures::sink::drain().sink_map_err(|_| TunnelError::TransportClosed),
            rx,
        );
        tx.unbounded_send(Ok(Frame::Close)).unwrap();
        assert_eq!(reader.receive().await, Err(TunnelError::TransportClosed));
    }
}
