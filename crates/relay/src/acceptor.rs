//! WebSocket endpoint subscribers connect to. Inbound frames carry no
//! protocol and are only logged.

use std::{io, net::SocketAddr, sync::Arc, time::Duration};

use async_trait::async_trait;
use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use metrics::counter;
use thiserror::Error;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{watch, Mutex, Notify},
    time::timeout,
};
use tokio_tungstenite::{
    accept_async,
    tungstenite::{self, Message},
    WebSocketStream,
};
use tracing::{debug, error, info, warn};

use crate::registry::{DeliveryError, MessageSink, SubscriberId, SubscriberRegistry};

#[derive(Debug, Error)]
pub enum AcceptError {
    #[error("failed to bind `{addr}`: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("listening socket failed: {0}")]
    Accept(#[source] io::Error),
}

/// Default upper bound for the upgrade request of a freshly accepted socket.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
/// Upper bound for writing the close frame of a torn-down connection.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

type WsWriter = SplitSink<WebSocketStream<TcpStream>, Message>;

struct WsSink {
    writer: Mutex<WsWriter>,
    closed: Notify,
}

impl WsSink {
    fn new(writer: WsWriter) -> Self {
        Self {
            writer: Mutex::new(writer),
            closed: Notify::new(),
        }
    }

    /// Best-effort close frame; a peer that stopped reading does not get one.
    async fn finish(&self) {
        let attempt = async {
            let mut writer = self.writer.lock().await;
            writer.close().await
        };
        match timeout(CLOSE_TIMEOUT, attempt).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => debug!(%err, "close frame not sent"),
            Err(_) => debug!("close frame timed out"),
        }
    }
}

#[async_trait]
impl MessageSink for WsSink {
    async fn send_text(&self, message: &str) -> Result<(), DeliveryError> {
        let mut writer = self.writer.lock().await;
        writer
            .send(Message::Text(message.to_owned()))
            .await
            .map_err(|err| match err {
                tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
                    DeliveryError::Closed
                }
                other => DeliveryError::Transport(other.to_string()),
            })
    }

    fn close(&self) {
        // Stores a permit, so the read loop sees it even if it is not
        // polling yet.
        self.closed.notify_one();
    }
}

/// Unregisters the subscriber on every exit path of its connection task.
struct Registration {
    registry: Arc<SubscriberRegistry>,
    id: SubscriberId,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.remove(self.id);
    }
}

pub struct ConnectionAcceptor {
    listener: TcpListener,
    registry: Arc<SubscriberRegistry>,
    handshake_timeout: Duration,
}

impl ConnectionAcceptor {
    pub async fn bind(addr: &str, registry: Arc<SubscriberRegistry>) -> Result<Self, AcceptError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| AcceptError::Bind {
                addr: addr.to_string(),
                source,
            })?;
        Ok(Self {
            listener,
            registry,
            handshake_timeout: HANDSHAKE_TIMEOUT,
        })
    }

    pub fn with_handshake_timeout(mut self, handshake_timeout: Duration) -> Self {
        self.handshake_timeout = handshake_timeout;
        self
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts until shutdown is signalled. Connections already open are left
    /// to close on their own.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), AcceptError> {
        loop {
            tokio::select! {
                biased;
                _ = shutdown.wait_for(|stop| *stop) => {
                    info!("connection acceptor stopped accepting");
                    return Ok(());
                }
                accepted = self.listener.accept() => {
                    let (stream, peer) = accepted.map_err(|err| {
                        error!(%err, "accept failed");
                        AcceptError::Accept(err)
                    })?;
                    tokio::spawn(serve_connection(
                        stream,
                        peer,
                        Arc::clone(&self.registry),
                        self.handshake_timeout,
                    ));
                }
            }
        }
    }
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    registry: Arc<SubscriberRegistry>,
    handshake_timeout: Duration,
) {
    if let Err(err) = stream.set_nodelay(true) {
        debug!(%peer, %err, "failed to set TCP_NODELAY");
    }
    let ws = match timeout(handshake_timeout, accept_async(stream)).await {
        Ok(Ok(ws)) => ws,
        Ok(Err(err)) => {
            counter!("relay_connections_total", "result" => "handshake_failed").increment(1);
            warn!(%peer, %err, "websocket handshake failed");
            return;
        }
        Err(_) => {
            counter!("relay_connections_total", "result" => "handshake_timeout").increment(1);
            warn!(%peer, "websocket handshake timed out");
            return;
        }
    };
    counter!("relay_connections_total", "result" => "accepted").increment(1);

    let (writer, mut reader) = ws.split();
    let sink = Arc::new(WsSink::new(writer));
    let id = registry.add(Some(peer), Arc::clone(&sink) as Arc<dyn MessageSink>);
    let registration = Registration {
        registry: Arc::clone(&registry),
        id,
    };
    info!(subscriber = %id, %peer, "subscriber connected");

    loop {
        let frame = tokio::select! {
            _ = sink.closed.notified() => {
                info!(subscriber = %id, %peer, "closing subscriber after failed delivery");
                break;
            }
            frame = reader.next() => frame,
        };
        let Some(frame) = frame else {
            break;
        };
        match frame {
            Ok(Message::Text(text)) => debug!(subscriber = %id, %text, "inbound message ignored"),
            Ok(Message::Binary(bytes)) => {
                debug!(subscriber = %id, len = bytes.len(), "inbound binary ignored")
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(err) => {
                debug!(subscriber = %id, %err, "subscriber read failed");
                break;
            }
        }
    }

    drop(registration);
    sink.finish().await;
    info!(subscriber = %id, %peer, "subscriber disconnected");
}
