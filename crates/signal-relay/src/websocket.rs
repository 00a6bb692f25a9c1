use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use url::Url;

use crate::wire::{ControlFrame, TOPICS_PATH};
use crate::{settle, ChannelStatus, Relay, RelayChannel, RelayError, RelayLink, RelayResult};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Relay client for the `drink-cam-relay` WebSocket server.
#[derive(Debug, Clone)]
pub struct WsRelay {
    base: Url,
    heartbeat: Duration,
}

impl WsRelay {
    pub fn new(base: &str) -> RelayResult<Self> {
        Ok(Self {
            base: derive_websocket_url(base)?,
            heartbeat: HEARTBEAT_INTERVAL,
        })
    }

    pub fn with_heartbeat(mut self, heartbeat: Duration) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    pub fn topic_url(&self, topic: &str) -> RelayResult<Url> {
        let mut url = self.base.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| RelayError::Transport("relay url cannot carry a path".into()))?;
            segments.pop_if_empty();
            segments.push(TOPICS_PATH);
            segments.push(topic);
        }
        Ok(url)
    }
}

impl Relay for WsRelay {
    fn join(&self, topic: &str) -> RelayChannel {
        let (status_tx, status_rx) = watch::channel(ChannelStatus::Subscribing);
        let status_tx = Arc::new(status_tx);
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<Bytes>();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel::<Message>();

        let task = match self.topic_url(topic) {
            Ok(url) => Some(tokio::spawn(run_connection(
                url,
                topic.to_string(),
                self.heartbeat,
                Arc::clone(&status_tx),
                inbound_tx,
                outbound_rx,
            ))),
            Err(err) => {
                settle(&status_tx, ChannelStatus::Failed(err.to_string()));
                None
            }
        };

        let link = WsLink {
            outbound: outbound_tx,
            status: status_tx,
            task: Mutex::new(task),
        };
        RelayChannel::new(topic, Arc::new(link), status_rx, inbound_rx)
    }
}

struct WsLink {
    outbound: mpsc::UnboundedSender<Message>,
    status: Arc<watch::Sender<ChannelStatus>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RelayLink for WsLink {
    fn publish(&self, payload: Bytes) -> RelayResult<()> {
        self.outbound
            .send(Message::Binary(payload.to_vec()))
            .map_err(|_| RelayError::Closed)
    }

    fn close(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        self.status.send_replace(ChannelStatus::Closed);
    }
}

async fn run_connection(
    url: Url,
    topic: String,
    heartbeat: Duration,
    status: Arc<watch::Sender<ChannelStatus>>,
    inbound: mpsc::UnboundedSender<Bytes>,
    mut outbound: mpsc::UnboundedReceiver<Message>,
) {
    let (stream, _) = match connect_async(url.as_str()).await {
        Ok(connected) => connected,
        Err(err) => {
            tracing::warn!(target = "signal_relay", %url, error = %err, "relay connect failed");
            settle(&status, ChannelStatus::Failed(format!("connect failed: {err}")));
            return;
        }
    };
    tracing::debug!(target = "signal_relay", %url, "relay websocket connected");
    let (mut ws_write, mut ws_read) = stream.split();

    let writer = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(heartbeat);
        ticker.tick().await;
        loop {
            let message = tokio::select! {
                next = outbound.recv() => match next {
                    Some(message) => message,
                    None => break,
                },
                _ = ticker.tick() => Message::Ping(Vec::new()),
            };
            if ws_write.send(message).await.is_err() {
                break;
            }
        }
        let _ = ws_write.close().await;
    });

    let failure = loop {
        let Some(next) = ws_read.next().await else {
            break "relay connection ended".to_string();
        };
        match next {
            Ok(Message::Text(text)) => match ControlFrame::from_text(&text) {
                Ok(ControlFrame::Subscribed { topic: joined }) => {
                    tracing::debug!(
                        target = "signal_relay",
                        topic = %joined,
                        "relay subscription ready",
                    );
                    settle(&status, ChannelStatus::Ready);
                }
                Ok(ControlFrame::Error { message }) => {
                    break format!("relay rejected subscription: {message}");
                }
                Err(err) => {
                    tracing::debug!(
                        target = "signal_relay",
                        error = %err,
                        "ignoring unknown control frame",
                    );
                }
            },
            Ok(Message::Binary(data)) => {
                tracing::trace!(
                    target = "signal_relay",
                    topic = %topic,
                    len = data.len(),
                    "relay payload in",
                );
                if inbound.send(Bytes::from(data)).is_err() {
                    break "relay consumer dropped".to_string();
                }
            }
            Ok(Message::Close(_)) => break "relay closed the connection".to_string(),
            Ok(_) => {}
            Err(err) => {
                match &err {
                    WsError::ConnectionClosed | WsError::AlreadyClosed => {
                        tracing::debug!(target = "signal_relay", "relay websocket closed: {err}");
                    }
                    _ => {
                        tracing::warn!(target = "signal_relay", "relay websocket error: {err}");
                    }
                }
                break err.to_string();
            }
        }
    };

    writer.abort();
    settle(&status, ChannelStatus::Failed(failure));
}

fn derive_websocket_url(base: &str) -> RelayResult<Url> {
    let mut url = Url::parse(base)
        .map_err(|err| RelayError::Transport(format!("invalid relay url {base}: {err}")))?;
    let scheme = match url.scheme() {
        "ws" | "http" => "ws",
        "wss" | "https" => "wss",
        other => {
            return Err(RelayError::Transport(format!(
                "unsupported relay url scheme: {other}"
            )));
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| RelayError::Transport("invalid websocket scheme".into()))?;
    url.set_query(None);
    url.set_fragment(None);
    Ok(url)
}
