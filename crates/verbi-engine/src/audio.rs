use std::{
    path::{Path, PathBuf},
    process::{Command, Stdio},
};

use anyhow::{anyhow, Context, Result};
use verbi_providers::speech::is_ffplay;

pub trait Recorder: Send + Sync {
    fn name(&self) -> &'static str;

    fn file_extension(&self) -> &'static str {
        "wav"
    }

    /// Blocks until the recording is complete and written to `output`.
    fn record(&self, output: &Path) -> Result<()>;
}

pub trait Player: Send + Sync {
    /// Blocks until playback finishes.
    fn play(&self, path: &Path) -> Result<()>;
}

fn last_stderr_line(stderr: &[u8]) -> String {
    String::from_utf8_lossy(stderr)
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .last()
        .unwrap_or("")
        .to_string()
}

fn run_blocking(mut cmd: Command, program: &str) -> Result<()> {
    let out = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .output()
        .with_context(|| format!("run {program} failed"))?;
    if !out.status.success() {
        return Err(anyhow!(
            "{program} exited with {}: {}",
            out.status,
            last_stderr_line(&out.stderr)
        ));
    }
    Ok(())
}

/// Microphone capture through SoX `rec`: 16 kHz mono 16-bit WAV, ends after
/// a stretch of silence or at the time cap.
#[derive(Debug, Clone)]
pub struct CommandRecorder {
    program: String,
    max_seconds: u32,
    silence_seconds: f64,
}

impl CommandRecorder {
    pub fn new(program: &str, max_seconds: u32, silence_seconds: f64) -> Self {
        Self {
            program: program.to_string(),
            max_seconds,
            silence_seconds,
        }
    }

    fn command(&self, output: &Path) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(["-q", "-c", "1", "-r", "16000", "-b", "16"])
            .arg(output)
            .args(["silence", "1", "0.1", "1%", "1"])
            .arg(format!("{:.1}", self.silence_seconds))
            .arg("1%")
            .args(["trim", "0"])
            .arg(self.max_seconds.to_string());
        cmd
    }
}

impl Recorder for CommandRecorder {
    fn name(&self) -> &'static str {
        "sox"
    }

    fn record(&self, output: &Path) -> Result<()> {
        run_blocking(self.command(output), &self.program)?;
        let len = std::fs::metadata(output)
            .with_context(|| format!("recording missing: {}", output.display()))?
            .len();
        if len == 0 {
            return Err(anyhow!("recording is empty: {}", output.display()));
        }
        Ok(())
    }
}

/// Replays a prerecorded file as if it had just been captured.
#[derive(Debug, Clone)]
pub struct FileRecorder {
    source: PathBuf,
}

impl FileRecorder {
    pub fn new(source: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
        }
    }
}

impl Recorder for FileRecorder {
    fn name(&self) -> &'static str {
        "fixture"
    }

    fn file_extension(&self) -> &'static str {
        match self.source.extension().and_then(|e| e.to_str()) {
            Some("mp3") => "mp3",
            Some("ogg") => "ogg",
            Some("flac") => "flac",
            _ => "wav",
        }
    }

    fn record(&self, output: &Path) -> Result<()> {
        std::fs::copy(&self.source, output).with_context(|| {
            format!("copy fixture failed: {}", self.source.display())
        })?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct CommandPlayer {
    program: String,
}

impl CommandPlayer {
    pub fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
        }
    }

    fn command(&self, path: &Path) -> Command {
        let mut cmd = Command::new(&self.program);
        if is_ffplay(&self.program) {
            cmd.args(["-nodisp", "-autoexit", "-loglevel", "error"]);
        }
        cmd.arg(path);
        cmd
    }
}

impl Player for CommandPlayer {
    fn play(&self, path: &Path) -> Result<()> {
        if !path.exists() {
            return Err(anyhow!("audio file missing: {}", path.display()));
        }
        run_blocking(self.command(path), &self.program)
    }
}

/// Discards audio; used for headless runs.
#[derive(Debug, Clone, Default)]
pub struct MutePlayer;

impl Player for MutePlayer {
    fn play(&self, path: &Path) -> Result<()> {
        tracing::info!("playback muted: {}", path.display());
        Ok(())
    }
}
