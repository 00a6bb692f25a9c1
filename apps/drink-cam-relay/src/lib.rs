//! WebSocket fan-out server for drink-cam signaling.
//!
//! Clients connect to `/topics/{topic}`, wait for a `subscribed` control frame, then every
//! binary frame they send is delivered to all connections on the same topic, the sender
//! included.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    response::Response,
    routing::get,
    Json, Router,
};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use signal_relay::wire::ControlFrame;
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

pub mod config;
mod hub;

pub use hub::{validate_topic, TopicHub};

pub fn router(hub: TopicHub) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/topics/:topic", get(topic_socket))
        .with_state(hub)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

pub async fn serve(listener: TcpListener, hub: TopicHub) -> std::io::Result<()> {
    axum::serve(listener, router(hub)).await
}

#[derive(Serialize)]
struct HealthStatus {
    status: &'static str,
    topics: usize,
}

async fn health_check(State(hub): State<TopicHub>) -> Json<HealthStatus> {
    Json(HealthStatus {
        status: "ok",
        topics: hub.topic_count(),
    })
}

async fn topic_socket(
    ws: WebSocketUpgrade,
    Path(topic): Path<String>,
    State(hub): State<TopicHub>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, topic, hub))
}

fn control(frame: &ControlFrame) -> Option<Message> {
    frame.to_text().ok().map(Message::Text)
}

async fn handle_socket(socket: WebSocket, topic: String, hub: TopicHub) {
    let (mut sender, mut receiver) = socket.split();

    if let Err(reason) = validate_topic(&topic) {
        warn!(topic = %topic, reason, "rejecting subscription");
        if let Some(frame) = control(&ControlFrame::Error {
            message: reason.to_string(),
        }) {
            let _ = sender.send(frame).await;
        }
        let _ = sender.close().await;
        return;
    }

    let (publisher, mut subscription) = hub.subscribe(&topic);
    let subscribed = control(&ControlFrame::Subscribed {
        topic: topic.clone(),
    });
    let acknowledged = match subscribed {
        Some(frame) => sender.send(frame).await.is_ok(),
        None => false,
    };
    if !acknowledged {
        drop(subscription);
        hub.release(&topic);
        return;
    }
    debug!(topic = %topic, subscribers = hub.subscriber_count(&topic), "subscriber joined");

    let fanout_topic = topic.clone();
    let mut forward = tokio::spawn(async move {
        loop {
            match subscription.recv().await {
                Ok(payload) => {
                    if sender.send(Message::Binary(payload.to_vec())).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(topic = %fanout_topic, skipped, "subscriber lagged; payloads dropped");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    let forward_finished = loop {
        tokio::select! {
            next = receiver.next() => match next {
                Some(Ok(Message::Binary(data))) => {
                    let _ = publisher.send(Bytes::from(data));
                }
                Some(Ok(Message::Text(text))) => {
                    let _ = publisher.send(Bytes::from(text));
                }
                Some(Ok(Message::Close(_))) | None => break false,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    debug!(topic = %topic, error = %err, "subscriber socket error");
                    break false;
                }
            },
            _ = &mut forward => break true,
        }
    };

    if !forward_finished {
        forward.abort();
        let _ = forward.await;
    }
    hub.release(&topic);
    debug!(topic = %topic, "subscriber left");
}
