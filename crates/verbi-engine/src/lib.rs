pub mod audio;
pub mod orchestrator;
pub mod sink;
pub mod temp_files;

pub use audio::{CommandPlayer, CommandRecorder, FileRecorder, MutePlayer, Player, Recorder};
pub use orchestrator::{ConversationOrchestrator, OrchestratorBuilder, Stages, TurnOutcome};
pub use sink::{ui_channel, CallbackSink, ChannelSink, EventSink, UiEvents};
pub use temp_files::{TempFiles, TempScope};
