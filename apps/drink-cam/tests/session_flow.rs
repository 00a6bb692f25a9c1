use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use drink_cam_core::media::mock::MockCamera;
use drink_cam_core::media::{InboundStream, MediaSource, StreamSink, TrackSettings};
use drink_cam_core::peer::mock::{MockCall, MockPeerFactory};
use drink_cam_core::peer::{PeerState, SdpKind};
use drink_cam_core::protocol::{IceCandidate, Signal, SignalMessage};
use drink_cam_core::{
    ConnectionState, Role, RoomCode, SessionConfig, SessionDeps, SessionError, SessionHandle,
    SessionNotice,
};
use parking_lot::Mutex;
use signal_relay::{LocalRelay, Relay};
use test_timeout::tokio_timeout_test;
use tokio::sync::mpsc;

const ROOM: &str = "WEDDING";

struct Side {
    handle: SessionHandle,
    peers: MockPeerFactory,
}

#[derive(Default)]
struct RecordingSink {
    attached: Mutex<Vec<String>>,
    detached: Mutex<usize>,
}

impl StreamSink for RecordingSink {
    fn attach(&self, stream: InboundStream) {
        self.attached.lock().push(stream.stream_id);
    }

    fn detach(&self) {
        *self.detached.lock() += 1;
    }
}

fn room() -> RoomCode {
    RoomCode::parse(ROOM).expect("room code")
}

fn spawn(
    relay: Arc<dyn Relay>,
    config: SessionConfig,
    media: Option<Arc<dyn MediaSource>>,
    sink: Option<Arc<dyn StreamSink>>,
) -> Side {
    let peers = MockPeerFactory::new();
    let handle = SessionHandle::spawn(
        config,
        SessionDeps {
            relay,
            peers: Arc::new(peers.clone()),
            media,
            sink,
        },
    );
    Side { handle, peers }
}

fn camera(relay: &Arc<LocalRelay>, source: Arc<MockCamera>) -> Side {
    spawn(
        relay.clone(),
        SessionConfig::new(Role::Camera).with_room(room()),
        Some(source),
        None,
    )
}

fn viewer(relay: &Arc<LocalRelay>, sink: Arc<RecordingSink>) -> Side {
    spawn(
        relay.clone(),
        SessionConfig::new(Role::Viewer).with_room(room()),
        None,
        Some(sink),
    )
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    while !condition() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

async fn drain(rx: &mut mpsc::UnboundedReceiver<Bytes>) -> Vec<SignalMessage> {
    tokio::time::sleep(Duration::from_millis(50)).await;
    let mut messages = Vec::new();
    while let Ok(payload) = rx.try_recv() {
        messages.push(SignalMessage::decode(&payload).expect("decodable signal"));
    }
    messages
}

/// Brings both sides to streaming and returns them.
async fn connect(relay: &Arc<LocalRelay>) -> (Side, Side, Arc<RecordingSink>) {
    let sink = Arc::new(RecordingSink::default());
    let viewer = viewer(relay, sink.clone());
    viewer.handle.start().await.expect("viewer start");
    assert_eq!(viewer.handle.state(), ConnectionState::Listening);
    assert_eq!(viewer.handle.status_label(), "Waiting for camera");

    let camera = camera(relay, Arc::new(MockCamera::hd()));
    camera.handle.start().await.expect("camera start");
    assert_eq!(camera.handle.state(), ConnectionState::Connecting);

    viewer
        .handle
        .wait_for_state(ConnectionState::Connecting)
        .await
        .expect("viewer connecting");
    eventually(|| {
        camera.peers.calls().contains(&MockCall::SetRemote {
            generation: 1,
            kind: SdpKind::Answer,
        })
    })
    .await;

    camera.peers.latest().expect("camera peer").emit_state(PeerState::Connected);
    viewer.peers.latest().expect("viewer peer").emit_state(PeerState::Connected);
    camera
        .handle
        .wait_for_state(ConnectionState::Streaming)
        .await
        .expect("camera streaming");
    viewer
        .handle
        .wait_for_state(ConnectionState::Streaming)
        .await
        .expect("viewer streaming");
    (camera, viewer, sink)
}

#[tokio_timeout_test(10)]
async fn camera_and_viewer_reach_streaming() {
    let relay = Arc::new(LocalRelay::new());
    let (camera, viewer, _sink) = connect(&relay).await;

    let viewer_calls = viewer.peers.calls();
    assert!(viewer_calls.contains(&MockCall::Create {
        generation: 1,
        role: Role::Viewer
    }));
    assert!(viewer_calls.contains(&MockCall::SetRemote {
        generation: 1,
        kind: SdpKind::Offer
    }));
    assert!(viewer_calls.contains(&MockCall::CreateAnswer { generation: 1 }));
    assert!(camera.peers.calls().contains(&MockCall::AddLocalMedia { generation: 1 }));
    assert_eq!(camera.handle.status_label(), "Streaming");
}

#[tokio_timeout_test(10)]
async fn local_candidates_reach_the_other_side() {
    let relay = Arc::new(LocalRelay::new());
    let (camera, viewer, _sink) = connect(&relay).await;

    let candidate = IceCandidate::new("candidate:1 1 udp 2122260223 192.168.1.20 50000 typ host")
        .with_mid("0", 0);
    assert!(camera
        .peers
        .latest()
        .expect("camera peer")
        .emit_local_candidate(candidate.clone()));

    eventually(|| viewer.peers.applied_candidates(1) == vec![candidate.candidate.clone()]).await;
    // The camera hears its own candidate echoed back and ignores it.
    assert!(camera.peers.applied_candidates(1).is_empty());
}

#[tokio_timeout_test(10)]
async fn remote_stop_is_not_rebroadcast() {
    let relay = Arc::new(LocalRelay::new());
    let (camera, viewer, sink) = connect(&relay).await;
    let mut spy = relay.join(&room().topic());
    spy.ready().await.expect("spy ready");
    let mut spy_rx = spy.take_messages().expect("spy inbound");
    let mut notices = viewer.handle.notices();

    camera.handle.stop().await.expect("camera stop");
    assert_eq!(camera.handle.state(), ConnectionState::Stopped);
    viewer
        .handle
        .wait_for_state(ConnectionState::Stopped)
        .await
        .expect("viewer stopped");

    assert_eq!(viewer.peers.open_sessions(), 0);
    assert_eq!(camera.peers.open_sessions(), 0);
    assert_eq!(*sink.detached.lock(), 1);
    assert_eq!(notices.recv().await.expect("notice"), SessionNotice::RemoteStopped);

    let messages = drain(&mut spy_rx).await;
    assert_eq!(messages, vec![Signal::Stop.tagged(Role::Camera)]);
}

#[tokio_timeout_test(10)]
async fn camera_restart_replaces_the_viewer_connection() {
    let relay = Arc::new(LocalRelay::new());
    let (camera, viewer, _sink) = connect(&relay).await;

    camera.handle.start().await.expect("camera restart");
    assert_eq!(camera.handle.state(), ConnectionState::Connecting);
    assert_eq!(camera.peers.max_open_sessions(), 1);

    eventually(|| viewer.peers.sessions().len() == 2).await;
    viewer
        .handle
        .wait_for_state(ConnectionState::Connecting)
        .await
        .expect("viewer reconnecting");
    assert_eq!(viewer.peers.max_open_sessions(), 1);
    assert!(viewer.peers.calls().contains(&MockCall::Close { generation: 1 }));

    // The superseded connection no longer reports anything.
    let sessions = camera.peers.sessions();
    assert!(!sessions[0].emit_state(PeerState::Connected));
    assert_eq!(camera.handle.state(), ConnectionState::Connecting);
}

#[tokio_timeout_test(10)]
async fn remote_track_is_handed_to_the_sink() {
    let relay = Arc::new(LocalRelay::new());
    let (_camera, viewer, sink) = connect(&relay).await;
    let mut notices = viewer.handle.notices();

    let (_tx, packets) = mpsc::channel(4);
    let stream = InboundStream {
        stream_id: "drink-cam".into(),
        track_id: "video".into(),
        mime_type: "video/VP8".into(),
        packets,
    };
    assert!(viewer.peers.latest().expect("viewer peer").emit_remote_track(stream));

    assert_eq!(
        notices.recv().await.expect("notice"),
        SessionNotice::StreamAttached {
            stream_id: "drink-cam".into()
        }
    );
    assert_eq!(*sink.attached.lock(), vec!["drink-cam".to_string()]);
}

#[tokio_timeout_test(10)]
async fn disruption_is_reported_without_state_change() {
    let relay = Arc::new(LocalRelay::new());
    let (camera, _viewer, _sink) = connect(&relay).await;
    let mut notices = camera.handle.notices();

    camera.peers.latest().expect("camera peer").emit_state(PeerState::Failed);
    assert_eq!(
        notices.recv().await.expect("notice"),
        SessionNotice::Disrupted(PeerState::Failed)
    );
    assert_eq!(camera.handle.state(), ConnectionState::Streaming);
    assert_eq!(camera.peers.open_sessions(), 1);
}

#[tokio_timeout_test(10)]
async fn rejected_capture_profile_falls_back() {
    let relay = Arc::new(LocalRelay::new());
    let source = Arc::new(MockCamera::new(TrackSettings {
        width: 3840,
        height: 2160,
        frame_rate: 30,
    }));
    let camera = camera(&relay, source.clone());

    camera.handle.start().await.expect("camera start");
    assert_eq!(source.attempts().len(), 2);
    assert_eq!(source.attempts()[1].max_width, None);
    assert_eq!(camera.handle.state(), ConnectionState::Connecting);
}

#[tokio_timeout_test(10)]
async fn denied_camera_leaves_nothing_open() {
    let relay = Arc::new(LocalRelay::new());
    let camera = camera(&relay, Arc::new(MockCamera::denied("NotAllowedError")));

    let err = camera.handle.start().await.unwrap_err();
    assert!(matches!(err, SessionError::MediaAcquisitionDenied(_)));
    assert_eq!(camera.peers.open_sessions(), 0);
    assert_eq!(camera.handle.state(), ConnectionState::Idle);
}

#[tokio_timeout_test(10)]
async fn unavailable_relay_fails_start() {
    let relay = Arc::new(LocalRelay::unavailable("CHANNEL_ERROR"));
    let source = Arc::new(MockCamera::hd());
    let camera = camera(&relay, source.clone());

    let err = camera.handle.start().await.unwrap_err();
    assert!(matches!(
        err,
        SessionError::RelayUnavailable(reason) if reason.contains("CHANNEL_ERROR")
    ));
    assert!(source.attempts().is_empty());
    assert!(camera.peers.calls().is_empty());
    assert_eq!(camera.handle.state(), ConnectionState::Idle);
}

#[tokio_timeout_test(10)]
async fn access_key_gates_start() {
    let relay = Arc::new(LocalRelay::new());
    let viewer = spawn(
        relay,
        SessionConfig::new(Role::Viewer)
            .with_room(room())
            .with_access_key(Some("cheers".into())),
        None,
        None,
    );

    assert!(!viewer.handle.can_operate());
    assert!(matches!(viewer.handle.start().await, Err(SessionError::AccessRequired)));
    assert!(matches!(viewer.handle.grant_access("salud").await, Err(SessionError::AccessDenied)));
    assert!(!viewer.handle.can_operate());

    viewer.handle.grant_access("cheers").await.expect("grant");
    assert!(viewer.handle.can_operate());
    viewer.handle.start().await.expect("start");
    assert_eq!(viewer.handle.state(), ConnectionState::Listening);
}

#[tokio_timeout_test(10)]
async fn room_code_is_required_and_locked_while_running() {
    let relay = Arc::new(LocalRelay::new());
    let viewer = spawn(relay, SessionConfig::new(Role::Viewer), None, None);

    assert!(!viewer.handle.can_operate());
    assert!(matches!(viewer.handle.start().await, Err(SessionError::MissingRoomCode)));
    assert!(matches!(
        viewer.handle.set_room_code("   ").await,
        Err(SessionError::InvalidRoomCode(_))
    ));

    viewer.handle.set_room_code(" WEDDING ").await.expect("room");
    assert!(viewer.handle.can_operate());
    viewer.handle.start().await.expect("start");
    assert!(matches!(
        viewer.handle.set_room_code("BIRTHDAY").await,
        Err(SessionError::Busy)
    ));

    viewer.handle.stop().await.expect("stop");
    viewer.handle.set_room_code("BIRTHDAY").await.expect("room after stop");
}

#[tokio_timeout_test(10)]
async fn stop_without_start_is_harmless() {
    let relay = Arc::new(LocalRelay::new());
    let camera = camera(&relay, Arc::new(MockCamera::hd()));
    camera.handle.stop().await.expect("first stop");
    camera.handle.stop().await.expect("second stop");
    assert_eq!(camera.handle.state(), ConnectionState::Stopped);
    assert!(camera.peers.calls().is_empty());

    camera.handle.shutdown().await;
    assert!(matches!(camera.handle.start().await, Err(SessionError::Closed)));
}
