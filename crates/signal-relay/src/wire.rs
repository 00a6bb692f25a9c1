//! Control frames exchanged between [`crate::WsRelay`] and the relay server.
//!
//! Payloads never travel inside these frames: they are sent as binary WebSocket
//! messages and fanned out verbatim. Text frames carry one [`ControlFrame`] as JSON.

use serde::{Deserialize, Serialize};

pub const TOPICS_PATH: &str = "topics";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlFrame {
    Subscribed { topic: String },
    Error { message: String },
}

impl ControlFrame {
    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_frames_are_tagged_by_type() {
        let frame = ControlFrame::Subscribed {
            topic: "webrtc:WEDDING".into(),
        };
        assert_eq!(
            frame.to_text().unwrap(),
            r#"{"type":"subscribed","topic":"webrtc:WEDDING"}"#
        );
        let parsed = ControlFrame::from_text(r#"{"type":"error","message":"bad topic"}"#).unwrap();
        assert_eq!(
            parsed,
            ControlFrame::Error {
                message: "bad topic".into()
            }
        );
    }
}
