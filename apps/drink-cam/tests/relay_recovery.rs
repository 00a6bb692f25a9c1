use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use drink_cam_core::media::MediaSource;
use drink_cam_core::media::mock::MockCamera;
use drink_cam_core::peer::mock::MockPeerFactory;
use drink_cam_core::protocol::{Signal, SignalMessage};
use drink_cam_core::{
    ConnectionState, Role, RoomCode, SessionConfig, SessionDeps, SessionHandle, SessionNotice,
};
use parking_lot::Mutex;
use signal_relay::{ChannelStatus, Relay, RelayChannel, RelayError, RelayLink, RelayResult};
use test_timeout::tokio_timeout_test;
use tokio::sync::{broadcast, mpsc, watch};

const OFFER: &str = "v=0\r\no=camera 7 0 IN IP4 0.0.0.0\r\n";

/// One joined channel, driven from the test side.
struct Joined {
    status: watch::Sender<ChannelStatus>,
    inbound: mpsc::UnboundedSender<Bytes>,
    sent: Arc<Mutex<Vec<Bytes>>>,
}

/// Relay whose channels are ready at once and whose status, inbound traffic and
/// publish outcome are controlled by the test.
#[derive(Default)]
struct ScriptedRelay {
    joined: Mutex<Vec<Joined>>,
    refuse_publish: Arc<AtomicBool>,
}

struct ScriptedLink {
    sent: Arc<Mutex<Vec<Bytes>>>,
    refuse: Arc<AtomicBool>,
}

impl RelayLink for ScriptedLink {
    fn publish(&self, payload: Bytes) -> RelayResult<()> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(RelayError::Transport("publish refused".into()));
        }
        self.sent.lock().push(payload);
        Ok(())
    }

    fn close(&self) {}
}

impl Relay for ScriptedRelay {
    fn join(&self, topic: &str) -> RelayChannel {
        let (status_tx, status_rx) = watch::channel(ChannelStatus::Ready);
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let sent = Arc::new(Mutex::new(Vec::new()));
        let link = ScriptedLink {
            sent: sent.clone(),
            refuse: self.refuse_publish.clone(),
        };
        self.joined.lock().push(Joined {
            status: status_tx,
            inbound: inbound_tx,
            sent,
        });
        RelayChannel::new(topic, Arc::new(link), status_rx, inbound_rx)
    }
}

impl ScriptedRelay {
    fn joins(&self) -> usize {
        self.joined.lock().len()
    }

    fn fail(&self, index: usize, reason: &str) {
        self.joined.lock()[index]
            .status
            .send_replace(ChannelStatus::Failed(reason.into()));
    }

    fn deliver(&self, index: usize, message: SignalMessage) {
        let payload = message.encode().expect("encodable");
        self.joined.lock()[index]
            .inbound
            .send(payload)
            .expect("session still subscribed");
    }

    fn sent(&self, index: usize) -> Vec<SignalMessage> {
        self.joined.lock()[index]
            .sent
            .lock()
            .iter()
            .map(|payload| SignalMessage::decode(payload).expect("decodable"))
            .collect()
    }

    fn refuse_publish(&self, refuse: bool) {
        self.refuse_publish.store(refuse, Ordering::SeqCst);
    }
}

fn session(role: Role, relay: &Arc<ScriptedRelay>) -> (SessionHandle, MockPeerFactory) {
    let peers = MockPeerFactory::new();
    let media: Option<Arc<dyn MediaSource>> = match role {
        Role::Camera => Some(Arc::new(MockCamera::hd())),
        Role::Viewer => None,
    };
    let handle = SessionHandle::spawn(
        SessionConfig::new(role).with_room(RoomCode::parse("WEDDING").expect("room")),
        SessionDeps {
            relay: relay.clone(),
            peers: Arc::new(peers.clone()),
            media,
            sink: None,
        },
    );
    (handle, peers)
}

async fn next_notice(notices: &mut broadcast::Receiver<SessionNotice>) -> SessionNotice {
    notices.recv().await.expect("notice")
}

fn offers(messages: &[SignalMessage]) -> usize {
    messages
        .iter()
        .filter(|message| matches!(message.signal, Signal::Offer { .. }))
        .count()
}

#[tokio_timeout_test(5)]
async fn viewer_rejoins_after_relay_loss() {
    let relay = Arc::new(ScriptedRelay::default());
    let (viewer, peers) = session(Role::Viewer, &relay);
    let mut notices = viewer.notices();

    viewer.start().await.expect("start");
    assert_eq!(viewer.state(), ConnectionState::Listening);
    assert_eq!(relay.joins(), 1);

    relay.fail(0, "CHANNEL_ERROR");
    assert_eq!(
        next_notice(&mut notices).await,
        SessionNotice::RelayLost("CHANNEL_ERROR".into())
    );

    viewer.start().await.expect("rejoin");
    assert_eq!(relay.joins(), 2);
    assert_eq!(viewer.state(), ConnectionState::Listening);

    // A live channel makes a further start a no-op.
    viewer.start().await.expect("already listening");
    assert_eq!(relay.joins(), 2);

    relay.deliver(1, Signal::Offer { sdp: OFFER.into() }.tagged(Role::Camera));
    viewer
        .wait_for_state(ConnectionState::Connecting)
        .await
        .expect("connecting");
    let sent = relay.sent(1);
    assert!(matches!(
        sent.as_slice(),
        [SignalMessage { signal: Signal::Answer { .. }, role: Role::Viewer }]
    ));
    assert_eq!(peers.open_sessions(), 1);
}

#[tokio_timeout_test(5)]
async fn camera_rejoins_after_relay_loss() {
    let relay = Arc::new(ScriptedRelay::default());
    let (camera, peers) = session(Role::Camera, &relay);
    let mut notices = camera.notices();

    camera.start().await.expect("start");
    assert_eq!(camera.state(), ConnectionState::Connecting);
    assert_eq!(offers(&relay.sent(0)), 1);

    relay.fail(0, "CHANNEL_ERROR");
    assert_eq!(
        next_notice(&mut notices).await,
        SessionNotice::RelayLost("CHANNEL_ERROR".into())
    );

    camera.start().await.expect("rejoin");
    assert_eq!(relay.joins(), 2);
    assert_eq!(offers(&relay.sent(1)), 1);
    assert_eq!(offers(&relay.sent(0)), 1);
    assert_eq!(peers.open_sessions(), 1);
    assert_eq!(peers.max_open_sessions(), 1);
    assert_eq!(camera.state(), ConnectionState::Connecting);
}

#[tokio_timeout_test(5)]
async fn rejected_answer_stops_the_camera() {
    let relay = Arc::new(ScriptedRelay::default());
    let (camera, peers) = session(Role::Camera, &relay);
    let mut notices = camera.notices();

    camera.start().await.expect("start");
    assert_eq!(peers.open_sessions(), 1);

    relay.deliver(
        0,
        Signal::Answer {
            sdp: "not a session description".into(),
        }
        .tagged(Role::Viewer),
    );
    assert!(matches!(
        next_notice(&mut notices).await,
        SessionNotice::NegotiationFailed(_)
    ));
    assert_eq!(camera.state(), ConnectionState::Stopped);
    assert_eq!(camera.status_label(), "Stopped");
    assert_eq!(peers.open_sessions(), 0);
}

#[tokio_timeout_test(5)]
async fn undelivered_answer_returns_viewer_to_listening() {
    let relay = Arc::new(ScriptedRelay::default());
    let (viewer, peers) = session(Role::Viewer, &relay);
    let mut notices = viewer.notices();

    viewer.start().await.expect("start");
    relay.refuse_publish(true);
    relay.deliver(0, Signal::Offer { sdp: OFFER.into() }.tagged(Role::Camera));
    assert!(matches!(
        next_notice(&mut notices).await,
        SessionNotice::NegotiationFailed(_)
    ));
    assert_eq!(viewer.state(), ConnectionState::Listening);
    assert_eq!(peers.open_sessions(), 0);

    // Still in the room: the next offer is answered once publishing works again.
    relay.refuse_publish(false);
    relay.deliver(0, Signal::Offer { sdp: OFFER.into() }.tagged(Role::Camera));
    viewer
        .wait_for_state(ConnectionState::Connecting)
        .await
        .expect("connecting");
    assert_eq!(peers.open_sessions(), 1);
}

#[tokio_timeout_test(5)]
async fn rejected_reoffer_returns_viewer_to_listening() {
    let relay = Arc::new(ScriptedRelay::default());
    let (viewer, peers) = session(Role::Viewer, &relay);
    let mut notices = viewer.notices();

    viewer.start().await.expect("start");
    relay.deliver(0, Signal::Offer { sdp: OFFER.into() }.tagged(Role::Camera));
    viewer
        .wait_for_state(ConnectionState::Connecting)
        .await
        .expect("connecting");

    relay.deliver(
        0,
        Signal::Offer {
            sdp: "garbage".into(),
        }
        .tagged(Role::Camera),
    );
    assert!(matches!(
        next_notice(&mut notices).await,
        SessionNotice::NegotiationFailed(_)
    ));
    assert_eq!(viewer.state(), ConnectionState::Listening);
    assert_eq!(peers.open_sessions(), 0);
}
