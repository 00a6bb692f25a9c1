use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use bytes::Bytes;
use drink_cam_relay::TopicHub;
use signal_relay::{ChannelStatus, Relay, RelayError, WsRelay};
use test_timeout::tokio_timeout_test;
use tokio::net::TcpListener;
use tower::ServiceExt;

async fn start_server() -> (String, TopicHub) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let hub = TopicHub::new();
    tokio::spawn(drink_cam_relay::serve(listener, hub.clone()));
    (format!("ws://{addr}"), hub)
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    while !condition() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio_timeout_test(10)]
async fn payloads_reach_every_subscriber_of_the_topic() {
    let (url, hub) = start_server().await;
    let relay = WsRelay::new(&url).expect("relay url");

    let mut camera = relay.join("webrtc:WEDDING");
    let mut viewer = relay.join("webrtc:WEDDING");
    let mut other = relay.join("webrtc:BIRTHDAY");
    camera.ready().await.expect("camera ready");
    viewer.ready().await.expect("viewer ready");
    other.ready().await.expect("other ready");
    assert_eq!(hub.subscriber_count("webrtc:WEDDING"), 2);

    let mut camera_rx = camera.take_messages().expect("camera inbound");
    let mut viewer_rx = viewer.take_messages().expect("viewer inbound");
    let mut other_rx = other.take_messages().expect("other inbound");

    let offer = Bytes::from_static(br#"{"type":"offer","sdp":"v=0","role":"camera"}"#);
    camera.send(offer.clone()).expect("send");

    assert_eq!(viewer_rx.recv().await, Some(offer.clone()));
    assert_eq!(camera_rx.recv().await, Some(offer));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(other_rx.try_recv().is_err());
}

#[tokio_timeout_test(10)]
async fn publish_order_is_preserved() {
    let (url, _hub) = start_server().await;
    let relay = WsRelay::new(&url).expect("relay url");
    let mut camera = relay.join("webrtc:WEDDING");
    let mut viewer = relay.join("webrtc:WEDDING");
    camera.ready().await.expect("camera ready");
    viewer.ready().await.expect("viewer ready");
    let mut viewer_rx = viewer.take_messages().expect("viewer inbound");

    for n in 0..20u8 {
        camera.send(Bytes::from(vec![n])).expect("send");
    }
    for n in 0..20u8 {
        assert_eq!(viewer_rx.recv().await, Some(Bytes::from(vec![n])));
    }
}

#[tokio_timeout_test(10)]
async fn closing_a_channel_releases_the_topic() {
    let (url, hub) = start_server().await;
    let relay = WsRelay::new(&url).expect("relay url");
    let mut viewer = relay.join("webrtc:WEDDING");
    viewer.ready().await.expect("viewer ready");
    assert_eq!(hub.topic_count(), 1);

    viewer.close();
    assert_eq!(viewer.status(), ChannelStatus::Closed);
    assert_eq!(
        viewer.send(Bytes::from_static(b"late")),
        Err(RelayError::Closed)
    );
    eventually(|| hub.topic_count() == 0).await;
}

#[tokio_timeout_test(10)]
async fn unreachable_relay_is_unavailable() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);

    let relay = WsRelay::new(&format!("ws://{addr}")).expect("relay url");
    let mut channel = relay.join("webrtc:WEDDING");
    assert!(matches!(
        channel.ready().await,
        Err(RelayError::Unavailable(_))
    ));
}

#[tokio_timeout_test(10)]
async fn health_reports_topic_count() {
    let hub = TopicHub::new();
    let (_publisher, _subscription) = hub.subscribe("webrtc:WEDDING");
    let response = drink_cam_relay::router(hub)
        .oneshot(Request::builder().uri("/health").body(Body::empty()).expect("request"))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    let value: serde_json::Value = serde_json::from_slice(&body).expect("json");
    assert_eq!(value, serde_json::json!({"status": "ok", "topics": 1}));
}
