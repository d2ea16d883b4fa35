use serde::{Deserialize, Serialize};

/// Events delivered by the device session SDK. The bridge consumes these
/// from a channel; producing them is the SDK collaborator's job.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeviceEvent {
    /// A transcription segment. Only finalized segments drive the bridge;
    /// interim ones are ignored.
    Transcription { text: String, is_final: bool },

    /// Head orientation changed.
    HeadPosition { position: HeadPosition },

    /// A notification arrived on the paired phone.
    PhoneNotification {
        app: String,
        title: String,
        content: String,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeadPosition {
    Up,
    Down,
}

impl DeviceEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Transcription { .. } => "transcription",
            Self::HeadPosition { .. } => "head_position",
            Self::PhoneNotification { .. } => "phone_notification",
        }
    }
}
