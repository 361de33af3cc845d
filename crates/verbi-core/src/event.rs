use std::fmt;

use serde::Serialize;

use crate::conversation::Role;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AnimationState {
    Idle,
    Listening,
    Thinking,
    Speaking,
}

impl AnimationState {
    pub fn as_str(self) -> &'static str {
        match self {
            AnimationState::Idle => "idle",
            AnimationState::Listening => "listening",
            AnimationState::Thinking => "thinking",
            AnimationState::Speaking => "speaking",
        }
    }
}

impl fmt::Display for AnimationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The four steps of a turn, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Stage {
    Record,
    Transcribe,
    Respond,
    Speak,
}

impl Stage {
    pub const ALL: [Stage; 4] = [Stage::Record, Stage::Transcribe, Stage::Respond, Stage::Speak];

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Record => "Record",
            Stage::Transcribe => "Transcribe",
            Stage::Respond => "Respond",
            Stage::Speak => "Speak",
        }
    }

    pub fn failure_prefix(self) -> &'static str {
        match self {
            Stage::Record => "Recording failed",
            Stage::Transcribe => "Transcription failed",
            Stage::Respond => "Response generation failed",
            Stage::Speak => "Text-to-speech failed",
        }
    }

    pub fn error_code(self) -> &'static str {
        match self {
            Stage::Record => "E_RECORD_FAILED",
            Stage::Transcribe => "E_TRANSCRIBE_FAILED",
            Stage::Respond => "E_RESPOND_FAILED",
            Stage::Speak => "E_SPEAK_FAILED",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Notification from a running turn to whoever renders it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum StageEvent {
    StatusChanged(String),
    AnimationChanged(AnimationState),
    MessageAppended { role: Role, text: String },
    Failed(String),
}

impl StageEvent {
    pub fn status(text: impl Into<String>) -> Self {
        StageEvent::StatusChanged(text.into())
    }

    pub fn is_terminal_status(&self) -> bool {
        matches!(self, StageEvent::StatusChanged(s) if s == READY_STATUS)
    }
}

pub const READY_STATUS: &str = "Ready";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageFailure {
    pub stage: Stage,
    pub message: String,
}

impl StageFailure {
    pub fn new(stage: Stage, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
        }
    }
}

impl fmt::Display for StageFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.stage.failure_prefix(), self.message)
    }
}

impl std::error::Error for StageFailure {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_failure_display_has_prefix_and_message() {
        let f = StageFailure::new(Stage::Transcribe, "401 Unauthorized");
        assert_eq!(f.to_string(), "Transcription failed: 401 Unauthorized");
    }

    #[test]
    fn stages_are_ordered() {
        assert_eq!(
            Stage::ALL.map(Stage::as_str),
            ["Record", "Transcribe", "Respond", "Speak"]
        );
    }

    #[test]
    fn ready_status_is_terminal() {
        assert!(StageEvent::status("Ready").is_terminal_status());
        assert!(!StageEvent::status("Thinking...").is_terminal_status());
        assert!(!StageEvent::AnimationChanged(AnimationState::Idle).is_terminal_status());
    }
}
