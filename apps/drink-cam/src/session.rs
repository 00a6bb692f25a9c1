//! Session facade.
//!
//! A [`SessionHandle`] drives one camera or viewer session running as a tokio task. The
//! task owns the relay channel, the peer controller and the state machine, and processes
//! commands, relay payloads and peer events one at a time.

use std::future::pending;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use signal_relay::{ChannelStatus, Relay, RelayChannel};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, info, trace, warn};

use crate::access::AccessGate;
use crate::controller::{PeerController, PeerUpdate};
use crate::error::SessionError;
use crate::handler::{HandlerOutcome, SignalHandler};
use crate::media::{
    CameraError, CaptureConstraints, MediaSource, StreamSink, acquire_with_fallback,
};
use crate::peer::{PeerEvent, PeerFactory, PeerState};
use crate::protocol::{Role, RoomCode, Signal, SignalMessage};
use crate::state::{ConnectionState, SessionStateMachine};
use crate::telemetry::logging::hexdump;

const NOTICE_CAPACITY: usize = 32;
const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct SessionConfig {
    pub role: Role,
    pub room: Option<RoomCode>,
    pub access_key: Option<String>,
    pub ready_timeout: Duration,
    pub capture: CaptureConstraints,
}

impl SessionConfig {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            room: None,
            access_key: None,
            ready_timeout: DEFAULT_READY_TIMEOUT,
            capture: CaptureConstraints::preferred(),
        }
    }

    pub fn with_room(mut self, room: RoomCode) -> Self {
        self.room = Some(room);
        self
    }

    pub fn with_access_key(mut self, key: Option<String>) -> Self {
        self.access_key = key;
        self
    }

    pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }
}

/// Collaborators a session runs against.
#[derive(Clone)]
pub struct SessionDeps {
    pub relay: Arc<dyn Relay>,
    pub peers: Arc<dyn PeerFactory>,
    /// Required to start a camera session.
    pub media: Option<Arc<dyn MediaSource>>,
    /// Receives the remote stream of a viewer session.
    pub sink: Option<Arc<dyn StreamSink>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionNotice {
    /// The peer connection failed or dropped; Start retries.
    Disrupted(PeerState),
    RelayLost(String),
    NegotiationFailed(String),
    StreamAttached { stream_id: String },
    RemoteStopped,
}

impl SessionNotice {
    pub fn message(&self) -> String {
        match self {
            SessionNotice::Disrupted(_) => {
                "Connection interrupted. Press Start to retry.".to_string()
            }
            SessionNotice::RelayLost(reason) => {
                format!("Signaling relay lost ({reason}). Press Start to rejoin.")
            }
            SessionNotice::NegotiationFailed(reason) => format!("Could not connect: {reason}"),
            SessionNotice::StreamAttached { .. } => "Receiving video.".to_string(),
            SessionNotice::RemoteStopped => "The other side stopped the stream.".to_string(),
        }
    }
}

type Reply = oneshot::Sender<Result<(), SessionError>>;

enum Command {
    Start(Reply),
    Stop(Reply),
    SetRoomCode(String, Reply),
    GrantAccess(String, Reply),
    Shutdown(oneshot::Sender<()>),
}

#[derive(Clone)]
pub struct SessionHandle {
    role: Role,
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    operable: watch::Receiver<bool>,
    notices: broadcast::Sender<SessionNotice>,
}

impl SessionHandle {
    /// Spawns the session task on the current runtime.
    pub fn spawn(config: SessionConfig, deps: SessionDeps) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(ConnectionState::Idle);
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
        let (controller, peer_events) = PeerController::new(config.role, deps.peers);
        let access = AccessGate::new(config.access_key);
        let (operable_tx, operable) = watch::channel(access.is_granted() && config.room.is_some());

        let actor = SessionActor {
            role: config.role,
            room: config.room,
            access,
            ready_timeout: config.ready_timeout,
            capture: config.capture,
            relay: deps.relay,
            media: deps.media,
            sink: deps.sink,
            controller,
            handler: SignalHandler::new(config.role),
            machine: SessionStateMachine::new(config.role),
            channel: None,
            inbound: None,
            relay_status: None,
            state_tx,
            operable_tx,
            notices: notices.clone(),
        };
        tokio::spawn(actor.run(command_rx, peer_events));

        Self {
            role: config.role,
            commands,
            state,
            operable,
            notices,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub async fn start(&self) -> Result<(), SessionError> {
        self.request(Command::Start).await
    }

    pub async fn stop(&self) -> Result<(), SessionError> {
        self.request(Command::Stop).await
    }

    pub async fn set_room_code(&self, code: &str) -> Result<(), SessionError> {
        let code = code.to_string();
        self.request(|reply| Command::SetRoomCode(code, reply)).await
    }

    pub async fn grant_access(&self, key: &str) -> Result<(), SessionError> {
        let key = key.to_string();
        self.request(|reply| Command::GrantAccess(key, reply)).await
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn status_label(&self) -> &'static str {
        self.state().label()
    }

    /// True once access is granted and a room code is set.
    pub fn can_operate(&self) -> bool {
        *self.operable.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub async fn wait_for_state(&self, target: ConnectionState) -> Result<(), SessionError> {
        let mut state = self.state.clone();
        state
            .wait_for(|current| *current == target)
            .await
            .map(|_| ())
            .map_err(|_| SessionError::Closed)
    }

    pub fn notices(&self) -> broadcast::Receiver<SessionNotice> {
        self.notices.subscribe()
    }

    /// Tears the session down without broadcasting `stop` and ends the task.
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    async fn request(&self, command: impl FnOnce(Reply) -> Command) -> Result<(), SessionError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Closed)?
    }
}

struct SessionActor {
    role: Role,
    room: Option<RoomCode>,
    access: AccessGate,
    ready_timeout: Duration,
    capture: CaptureConstraints,
    relay: Arc<dyn Relay>,
    media: Option<Arc<dyn MediaSource>>,
    sink: Option<Arc<dyn StreamSink>>,
    controller: PeerController,
    handler: SignalHandler,
    machine: SessionStateMachine,
    channel: Option<RelayChannel>,
    inbound: Option<mpsc::UnboundedReceiver<Bytes>>,
    relay_status: Option<watch::Receiver<ChannelStatus>>,
    state_tx: watch::Sender<ConnectionState>,
    operable_tx: watch::Sender<bool>,
    notices: broadcast::Sender<SessionNotice>,
}

async fn next_payload(inbound: &mut Option<mpsc::UnboundedReceiver<Bytes>>) -> Option<Bytes> {
    match inbound {
        Some(rx) => rx.recv().await,
        None => pending().await,
    }
}

async fn next_status(status: &mut Option<watch::Receiver<ChannelStatus>>) -> ChannelStatus {
    match status {
        Some(rx) => {
            if rx.changed().await.is_err() {
                return pending().await;
            }
            rx.borrow_and_update().clone()
        }
        None => pending().await,
    }
}

impl SessionActor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut peer_events: mpsc::UnboundedReceiver<PeerEvent>,
    ) {
        let mut shutdown_reply = None;
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown(reply)) => {
                        shutdown_reply = Some(reply);
                        break;
                    }
                    Some(command) => self.on_command(command).await,
                    None => break,
                },
                Some(event) = peer_events.recv() => self.on_peer_event(event),
                payload = next_payload(&mut self.inbound) => match payload {
                    Some(payload) => self.on_payload(payload).await,
                    None => {
                        debug!(target = "drink_cam::session", "relay inbound stream ended");
                        self.inbound = None;
                    }
                },
                status = next_status(&mut self.relay_status) => self.on_relay_status(status),
            }
        }

        self.teardown().await;
        debug!(target = "drink_cam::session", role = %self.role, "session task finished");
        if let Some(reply) = shutdown_reply {
            let _ = reply.send(());
        }
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Start(reply) => {
                let result = self.start().await;
                if let Err(err) = &result {
                    warn!(
                        target = "drink_cam::session",
                        role = %self.role,
                        error = %err,
                        "start failed",
                    );
                    self.controller.close().await;
                    if self.machine.state().is_active() {
                        self.machine.stopped();
                    }
                    self.publish_state();
                }
                let _ = reply.send(result);
            }
            Command::Stop(reply) => {
                let result = self.stop().await;
                let _ = reply.send(result);
            }
            Command::SetRoomCode(code, reply) => {
                let _ = reply.send(self.set_room_code(&code));
            }
            Command::GrantAccess(key, reply) => {
                let result = self.access.grant(&key);
                self.publish_operable();
                let _ = reply.send(result);
            }
            Command::Shutdown(_) => {}
        }
    }

    async fn start(&mut self) -> Result<(), SessionError> {
        self.access.check()?;
        let room = self.room.clone().ok_or(SessionError::MissingRoomCode)?;
        // A viewer that lost its relay channel stays active but has to rejoin.
        if self.role == Role::Viewer && self.machine.state().is_active() && self.joined() {
            debug!(target = "drink_cam::session", "viewer already listening");
            return Ok(());
        }

        self.join(&room).await?;
        match self.role {
            Role::Viewer => {
                self.machine.listening();
                self.publish_state();
                Ok(())
            }
            Role::Camera => self.start_camera().await,
        }
    }

    fn joined(&self) -> bool {
        self.channel
            .as_ref()
            .is_some_and(|channel| channel.status() == ChannelStatus::Ready)
    }

    async fn join(&mut self, room: &RoomCode) -> Result<(), SessionError> {
        if self.joined() {
            return Ok(());
        }
        self.drop_channel();

        info!(
            target = "drink_cam::session",
            role = %self.role,
            room = %room.masked(),
            "joining room",
        );
        let mut channel = self.relay.join(&room.topic());
        match tokio::time::timeout(self.ready_timeout, channel.ready()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                channel.close();
                return Err(err.into());
            }
            Err(_) => {
                channel.close();
                return Err(SessionError::RelayUnavailable(format!(
                    "not ready after {}ms",
                    self.ready_timeout.as_millis()
                )));
            }
        }

        self.inbound = channel.take_messages();
        self.relay_status = Some(channel.status_watch());
        self.channel = Some(channel);
        debug!(target = "drink_cam::session", role = %self.role, "relay channel ready");
        Ok(())
    }

    async fn start_camera(&mut self) -> Result<(), SessionError> {
        let source = self
            .media
            .clone()
            .ok_or(SessionError::MediaAcquisitionDenied(CameraError::Unsupported))?;
        // The previous capture has to be released before the device is opened again.
        self.controller.close().await;
        let media = acquire_with_fallback(source.as_ref(), &self.capture).await?;
        info!(
            target = "drink_cam::session",
            width = media.settings().width,
            height = media.settings().height,
            fps = media.settings().frame_rate,
            "camera acquired"
        );

        let sdp = self.controller.create_as_offerer(media).await?;
        self.broadcast(Signal::Offer { sdp })?;
        self.machine.offer_sent();
        self.publish_state();
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), SessionError> {
        self.access.check()?;
        if self.channel.is_some() {
            if let Err(err) = self.broadcast(Signal::Stop) {
                debug!(target = "drink_cam::session", error = %err, "stop not delivered");
            }
        }
        self.teardown().await;
        Ok(())
    }

    fn set_room_code(&mut self, code: &str) -> Result<(), SessionError> {
        if self.machine.state().is_active() {
            return Err(SessionError::Busy);
        }
        let room = RoomCode::parse(code).map_err(SessionError::InvalidRoomCode)?;
        if self.room.as_ref() != Some(&room) {
            self.drop_channel();
        }
        self.room = Some(room);
        self.publish_operable();
        Ok(())
    }

    async fn teardown(&mut self) {
        self.controller.close().await;
        if let Some(sink) = &self.sink {
            sink.detach();
        }
        self.drop_channel();
        self.machine.stopped();
        self.publish_state();
    }

    fn drop_channel(&mut self) {
        self.inbound = None;
        self.relay_status = None;
        if let Some(channel) = self.channel.take() {
            channel.close();
        }
    }

    fn broadcast(&self, signal: Signal) -> Result<(), SessionError> {
        let channel = self
            .channel
            .as_ref()
            .ok_or_else(|| SessionError::RelayUnavailable("not joined".into()))?;
        let kind = signal.kind();
        let payload = self
            .handler
            .outbound(signal)
            .encode()
            .map_err(|err| SessionError::NegotiationFailed(err.to_string()))?;
        channel.send(payload)?;
        trace!(target = "drink_cam::session", role = %self.role, kind, "signal sent");
        Ok(())
    }

    async fn on_payload(&mut self, payload: Bytes) {
        let message = match SignalMessage::decode(&payload) {
            Ok(message) => message,
            Err(err) => {
                debug!(target = "drink_cam::session", error = %err, "dropping undecodable payload");
                trace!(target = "drink_cam::session", "payload:\n{}", hexdump(&payload));
                return;
            }
        };
        trace!(
            target = "drink_cam::session",
            kind = message.signal.kind(),
            from = %message.role,
            "signal received"
        );

        match self
            .handler
            .handle(message, &mut self.controller, &mut self.machine)
            .await
        {
            Ok(HandlerOutcome::Reply(signal)) => {
                if let Err(err) = self.broadcast(signal) {
                    warn!(target = "drink_cam::session", error = %err, "reply not delivered");
                    self.controller.close().await;
                    self.machine.connection_lost();
                    self.notify(SessionNotice::NegotiationFailed(err.to_string()));
                }
            }
            Ok(HandlerOutcome::RemoteStop) => {
                info!(target = "drink_cam::session", role = %self.role, "remote side stopped");
                self.teardown().await;
                self.notify(SessionNotice::RemoteStopped);
            }
            Ok(HandlerOutcome::Applied | HandlerOutcome::Ignored(_)) => {}
            Err(err) => {
                warn!(target = "drink_cam::session", error = %err, "negotiation failed");
                if !self.controller.has_connection() {
                    self.machine.connection_lost();
                }
                self.notify(SessionNotice::NegotiationFailed(err.to_string()));
            }
        }
        self.publish_state();
    }

    fn on_peer_event(&mut self, event: PeerEvent) {
        let Some(update) = self.controller.accept(event) else {
            return;
        };
        match update {
            PeerUpdate::LocalCandidate(candidate) => {
                if let Err(err) = self.broadcast(Signal::Ice { candidate }) {
                    debug!(target = "drink_cam::session", error = %err, "local candidate not sent");
                }
            }
            PeerUpdate::StateChanged(PeerState::Connected) => {
                if self.machine.peer_connected().is_some() {
                    info!(target = "drink_cam::session", role = %self.role, "streaming");
                    self.publish_state();
                }
            }
            PeerUpdate::StateChanged(state) if state.is_disrupted() => {
                warn!(
                    target = "drink_cam::session",
                    role = %self.role,
                    ?state,
                    "peer connection disrupted",
                );
                self.notify(SessionNotice::Disrupted(state));
            }
            PeerUpdate::StateChanged(state) => {
                trace!(target = "drink_cam::session", ?state, "peer state");
            }
            PeerUpdate::RemoteTrack(stream) => match &self.sink {
                Some(sink) => {
                    let stream_id = stream.stream_id.clone();
                    sink.attach(stream);
                    self.notify(SessionNotice::StreamAttached { stream_id });
                }
                None => debug!(target = "drink_cam::session", "no sink for remote stream"),
            },
        }
    }

    fn on_relay_status(&mut self, status: ChannelStatus) {
        if let ChannelStatus::Failed(reason) = status {
            warn!(
                target = "drink_cam::session",
                role = %self.role,
                %reason,
                "relay channel failed",
            );
            self.drop_channel();
            self.notify(SessionNotice::RelayLost(reason));
        }
    }

    fn notify(&self, notice: SessionNotice) {
        let _ = self.notices.send(notice);
    }

    fn publish_state(&self) {
        let next = self.machine.state();
        self.state_tx.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
    }

    fn publish_operable(&self) {
        let operable = self.access.is_granted() && self.room.is_some();
        self.operable_tx.send_if_modified(|current| {
            if *current == operable {
                return false;
            }
            *current = operable;
            true
        });
    }
}
