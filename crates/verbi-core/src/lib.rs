pub mod conversation;
pub mod event;

pub use conversation::{ConversationHistory, Message, Role, DEFAULT_SYSTEM_PROMPT};
pub use event::{AnimationState, Stage, StageEvent, StageFailure, READY_STATUS};
