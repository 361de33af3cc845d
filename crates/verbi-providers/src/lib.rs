//! Capability traits for the three network-backed turn stages and one
//! implementation per supported provider.

use std::path::{Path, PathBuf};

use anyhow::Result;
use verbi_core::Message;

pub mod config;
pub mod http;
pub mod keys;
pub mod ollama;
pub mod openai_compat;
pub mod probe;
pub mod speech;
pub mod transcribe;

pub use config::{
    ConfigError, ProviderConfig, Providers, ResponderKind, SynthesizerKind, TranscriberKind,
    ValidationIssue,
};
pub use keys::{ApiKeyStatus, Vendor};
pub use probe::ProbeResult;

pub trait Transcriber: Send + Sync {
    fn name(&self) -> &'static str;

    /// Returns the transcript. An empty string means nothing was said.
    fn transcribe(&self, audio: &Path) -> Result<String>;
}

pub trait Responder: Send + Sync {
    fn name(&self) -> &'static str;

    fn respond(&self, history: &[Message]) -> Result<String>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpeechOutput {
    /// Audio was written here and still has to be played.
    File(PathBuf),
    /// Audio already went to the speakers while it was generated.
    Streamed,
}

pub trait Synthesizer: Send + Sync {
    fn name(&self) -> &'static str;

    fn file_extension(&self) -> &'static str;

    fn synthesize(&self, text: &str, output: &Path) -> Result<SpeechOutput>;
}
