//! WebSocket transport backed by `tokio-tungstenite`.
//!
//! Unlike a long-running bot connection, this transport does not retry on
//! its own: a single instance represents exactly one dial, and ends its
//! inbound stream on close or error. The client crate's reconnect manager
//! decides whether and when to open a new instance.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use futures::stream::{BoxStream, SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{trace, warn};
use url::Url;

use homelink_core::{Message, Transport, TransportError, TransportId, TransportResult};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, WsMessage>;
type WsSource = SplitStream<WsStream>;

static NEXT_TRANSPORT_ID: AtomicU64 = AtomicU64::new(1);

/// A single WebSocket connection.
pub struct WsTransport {
    id: TransportId,
    message_tx: mpsc::Sender<String>,
    shutdown_tx: watch::Sender<bool>,
    inbound_rx: Option<mpsc::Receiver<TransportResult<Message>>>,
}

#[async_trait]
impl Transport for WsTransport {
    async fn open(url: Url) -> TransportResult<Self> {
        let (ws_stream, _response) =
            connect_async(url.as_str())
                .await
                .map_err(|e| TransportError::ConnectionFailed {
                    url: url.to_string(),
                    reason: e.to_string(),
                })?;
        let (ws_tx, ws_rx) = ws_stream.split();

        let (message_tx, message_rx) = mpsc::channel::<String>(256);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (inbound_tx, inbound_rx) = mpsc::channel(256);

        let id = TransportId(NEXT_TRANSPORT_ID.fetch_add(1, Ordering::Relaxed));

        tokio::spawn(run_connection(ws_tx, ws_rx, message_rx, shutdown_rx, inbound_tx));

        Ok(Self {
            id,
            message_tx,
            shutdown_tx,
            inbound_rx: Some(inbound_rx),
        })
    }

    fn inbound(&mut self) -> BoxStream<'static, TransportResult<Message>> {
        let rx = self
            .inbound_rx
            .take()
            .expect("inbound() called more than once on a WsTransport");
        Box::pin(tokio_stream_from_receiver(rx))
    }

    async fn send_text(&self, text: String) -> TransportResult<()> {
        self.message_tx
            .send(text)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    fn cancel(&self, reason: &str) {
        trace!(reason, "closing websocket transport");
        let _ = self.shutdown_tx.send(true);
    }

    fn id(&self) -> TransportId {
        self.id
    }
}

fn tokio_stream_from_receiver(
    rx: mpsc::Receiver<TransportResult<Message>>,
) -> impl futures::Stream<Item = TransportResult<Message>> {
    futures::stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|v| (v, rx)) })
}

async fn run_connection(
    mut ws_tx: WsSink,
    mut ws_rx: WsSource,
    mut message_rx: mpsc::Receiver<String>,
    mut shutdown_rx: watch::Receiver<bool>,
    inbound_tx: mpsc::Sender<TransportResult<Message>>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    let _ = ws_tx.send(WsMessage::Close(None)).await;
                    break;
                }
            }

            Some(text) = message_rx.recv() => {
                if let Err(e) = ws_tx.send(WsMessage::Text(text.into())).await {
                    warn!(error = %e, "failed to send frame");
                    let _ = inbound_tx
                        .send(Err(TransportError::SendFailed(e.to_string())))
                        .await;
                    break;
                }
            }

            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(WsMessage::Text(text))) => {
                        if inbound_tx.send(Ok(Message::Text(text.to_string()))).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(WsMessage::Binary(data))) => {
                        if inbound_tx.send(Ok(Message::Binary(data.to_vec()))).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(WsMessage::Ping(data))) => {
                        let _ = ws_tx.send(WsMessage::Pong(data)).await;
                    }
                    Some(Ok(WsMessage::Pong(_))) => {}
                    Some(Ok(WsMessage::Close(_))) | Some(Ok(WsMessage::Frame(_))) => {
                        let _ = inbound_tx.send(Ok(Message::Close)).await;
                        break;
                    }
                    Some(Err(e)) => {
                        let _ = inbound_tx
                            .send(Err(TransportError::ConnectionClosed { reason: e.to_string() }))
                            .await;
                        break;
                    }
                    None => {
                        let _ = inbound_tx
                            .send(Err(TransportError::ConnectionClosed {
                                reason: "stream ended".into(),
                            }))
                            .await;
                        break;
                    }
                }
            }
        }
    }
}
