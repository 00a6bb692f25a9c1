use tracing::debug;

use crate::controller::{ControllerError, PeerController};
use crate::protocol::{Role, Signal, SignalMessage};
use crate::state::SessionStateMachine;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// Not meant for this role; nothing changed.
    Ignored(&'static str),
    /// Applied locally with nothing to send back.
    Applied,
    /// Must be broadcast to the room.
    Reply(Signal),
    /// The other side ended the session. Tear down locally without broadcasting.
    RemoteStop,
}

/// Routes inbound signals for one role to the peer controller.
#[derive(Debug, Clone, Copy)]
pub struct SignalHandler {
    role: Role,
}

impl SignalHandler {
    pub fn new(role: Role) -> Self {
        Self { role }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn outbound(&self, signal: Signal) -> SignalMessage {
        signal.tagged(self.role)
    }

    pub async fn handle(
        &self,
        message: SignalMessage,
        controller: &mut PeerController,
        machine: &mut SessionStateMachine,
    ) -> Result<HandlerOutcome, ControllerError> {
        if message.role == self.role {
            return Ok(ignored("own role"));
        }

        match message.signal {
            Signal::Offer { sdp } => {
                if self.role != Role::Viewer {
                    return Ok(ignored("offer at camera"));
                }
                if !machine.state().is_active() {
                    return Ok(ignored("offer while not listening"));
                }
                controller.create_as_answerer().await?;
                let answer = controller.apply_remote_offer(&sdp).await?;
                machine.offer_received();
                Ok(HandlerOutcome::Reply(Signal::Answer { sdp: answer }))
            }
            Signal::Answer { sdp } => {
                if self.role != Role::Camera {
                    return Ok(ignored("answer at viewer"));
                }
                if !controller.has_connection() {
                    return Ok(ignored("answer without connection"));
                }
                controller.apply_remote_answer(&sdp).await?;
                Ok(HandlerOutcome::Applied)
            }
            Signal::Ice { candidate } => {
                let disposition = controller.add_remote_candidate(candidate).await;
                debug!(target = "drink_cam::handler", ?disposition, "remote candidate");
                Ok(HandlerOutcome::Applied)
            }
            Signal::Stop => {
                controller.close().await;
                machine.stopped();
                Ok(HandlerOutcome::RemoteStop)
            }
        }
    }
}

fn ignored(reason: &'static str) -> HandlerOutcome {
    debug!(target = "drink_cam::handler", reason, "ignoring signal");
    HandlerOutcome::Ignored(reason)
}
