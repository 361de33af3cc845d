use std::{
    path::Path,
    sync::atomic::{AtomicBool, Ordering},
};

use anyhow::{anyhow, Context, Result};
use reqwest::blocking::{multipart, Client};
use serde::Deserialize;

use crate::{http, Transcriber};

pub const OPENAI_TRANSCRIPTIONS_URL: &str = "https://api.openai.com/v1/audio/transcriptions";
pub const GROQ_TRANSCRIPTIONS_URL: &str =
    "https://api.groq.com/openai/v1/audio/transcriptions";
pub const DEEPGRAM_LISTEN_URL: &str = "https://api.deepgram.com/v1/listen";
pub const FASTWHISPERAPI_URL: &str = "http://localhost:8000";
/// The server is always asked for its `base` model.
pub const FASTWHISPERAPI_MODEL: &str = "base";
const LANGUAGE: &str = "en";

#[derive(Debug, Deserialize)]
struct TextResp {
    text: Option<String>,
}

fn audio_part(audio: &Path) -> Result<multipart::Part> {
    let bytes = std::fs::read(audio)
        .with_context(|| format!("read audio failed: {}", audio.display()))?;
    let file_name = audio
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("audio.wav")
        .to_string();
    multipart::Part::bytes(bytes)
        .file_name(file_name)
        .mime_str(http::audio_mime(audio))
        .context("invalid audio mime")
}

/// OpenAI-style `/audio/transcriptions` (OpenAI `whisper-1`, Groq `whisper-large-v3`).
pub struct WhisperApi {
    label: &'static str,
    url: String,
    model: String,
    api_key: String,
    client: Client,
}

impl WhisperApi {
    pub fn openai(api_key: String) -> Result<Self> {
        Ok(Self {
            label: "openai",
            url: OPENAI_TRANSCRIPTIONS_URL.to_string(),
            model: "whisper-1".to_string(),
            api_key,
            client: http::client()?,
        })
    }

    pub fn groq(api_key: String) -> Result<Self> {
        Ok(Self {
            label: "groq",
            url: GROQ_TRANSCRIPTIONS_URL.to_string(),
            model: "whisper-large-v3".to_string(),
            api_key,
            client: http::client()?,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

impl Transcriber for WhisperApi {
    fn name(&self) -> &'static str {
        self.label
    }

    fn transcribe(&self, audio: &Path) -> Result<String> {
        let form = multipart::Form::new()
            .part("file", audio_part(audio)?)
            .text("model", self.model.clone())
            .text("language", LANGUAGE);
        let resp = self
            .client
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .with_context(|| format!("{} transcription request failed", self.label))?;
        let resp = http::check_status(self.label, resp)?;
        let r: TextResp = resp
            .json()
            .with_context(|| format!("{} transcription parse failed", self.label))?;
        Ok(r.text.unwrap_or_default().trim().to_string())
    }
}

#[derive(Debug, Deserialize)]
struct DeepgramResp {
    results: DeepgramResults,
}

#[derive(Debug, Deserialize)]
struct DeepgramResults {
    channels: Vec<DeepgramChannel>,
}

#[derive(Debug, Deserialize)]
struct DeepgramChannel {
    alternatives: Vec<DeepgramAlternative>,
}

#[derive(Debug, Deserialize)]
struct DeepgramAlternative {
    transcript: String,
}

fn deepgram_transcript(r: DeepgramResp) -> Result<String> {
    let alt = r
        .results
        .channels
        .into_iter()
        .next()
        .and_then(|c| c.alternatives.into_iter().next())
        .ok_or_else(|| anyhow!("deepgram response missing channels[0].alternatives[0]"))?;
    Ok(alt.transcript.trim().to_string())
}

/// Deepgram prerecorded audio, `nova-2` with smart formatting.
pub struct Deepgram {
    api_key: String,
    client: Client,
}

impl Deepgram {
    pub fn new(api_key: String) -> Result<Self> {
        Ok(Self {
            api_key,
            client: http::client()?,
        })
    }

    pub(crate) fn send(&self, client: &Client, body: Vec<u8>, mime: &str) -> Result<String> {
        let resp = client
            .post(DEEPGRAM_LISTEN_URL)
            .query(&[("model", "nova-2"), ("smart_format", "true")])
            .header("Authorization", format!("Token {}", self.api_key))
            .header("Content-Type", mime)
            .body(body)
            .send()
            .context("deepgram request failed")?;
        let resp = http::check_status("deepgram", resp)?;
        let r: DeepgramResp = resp.json().context("deepgram response parse failed")?;
        deepgram_transcript(r)
    }
}

impl Transcriber for Deepgram {
    fn name(&self) -> &'static str {
        "deepgram"
    }

    fn transcribe(&self, audio: &Path) -> Result<String> {
        let bytes = std::fs::read(audio)
            .with_context(|| format!("read audio failed: {}", audio.display()))?;
        self.send(&self.client, bytes, http::audio_mime(audio))
    }
}

/// Self-hosted FastWhisperAPI server. The `/info` check runs once per instance.
pub struct FastWhisperApi {
    base_url: String,
    model: String,
    checked: AtomicBool,
    client: Client,
}

impl FastWhisperApi {
    pub fn new(base_url: &str) -> Result<Self> {
        Ok(Self {
            base_url: base_url.trim().trim_end_matches('/').to_string(),
            model: FASTWHISPERAPI_MODEL.to_string(),
            checked: AtomicBool::new(false),
            client: http::client()?,
        })
    }

    fn ensure_running(&self) -> Result<()> {
        if self.checked.load(Ordering::Acquire) {
            return Ok(());
        }
        let url = format!("{}/info", self.base_url);
        let ok = self
            .client
            .get(&url)
            .send()
            .map(|r| r.status().is_success())
            .unwrap_or(false);
        if !ok {
            return Err(anyhow!("FastWhisperAPI is not running at {}", self.base_url));
        }
        self.checked.store(true, Ordering::Release);
        Ok(())
    }
}

impl Transcriber for FastWhisperApi {
    fn name(&self) -> &'static str {
        "fastwhisperapi"
    }

    fn transcribe(&self, audio: &Path) -> Result<String> {
        self.ensure_running()?;
        let form = multipart::Form::new()
            .part("file", audio_part(audio)?)
            .text("model", self.model.clone())
            .text("language", LANGUAGE)
            .text("vad_filter", "true");
        let resp = self
            .client
            .post(format!("{}/v1/transcriptions", self.base_url))
            .bearer_auth("dummy_api_key")
            .multipart(form)
            .send()
            .context("fastwhisperapi request failed")?;
        let resp = http::check_status("fastwhisperapi", resp)?;
        let r: TextResp = resp.json().context("fastwhisperapi response parse failed")?;
        Ok(r.text.unwrap_or_default().trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deepgram_transcript_takes_first_alternative() {
        let r: DeepgramResp = serde_json::from_str(
            r#"{"results":{"channels":[{"alternatives":[{"transcript":" Hi there. ","confidence":0.9}]}]}}"#,
        )
        .unwrap();
        assert_eq!(deepgram_transcript(r).unwrap(), "Hi there.");
    }

    #[test]
    fn deepgram_without_channels_is_an_error() {
        let r: DeepgramResp = serde_json::from_str(r#"{"results":{"channels":[]}}"#).unwrap();
        assert!(deepgram_transcript(r).is_err());
    }

    #[test]
    fn missing_audio_file_fails_before_any_request() {
        let td = tempfile::tempdir().unwrap();
        let t = WhisperApi::openai("sk-test".to_string()).unwrap();
        let err = t.transcribe(&td.path().join("nope.wav")).unwrap_err();
        assert!(format!("{err:#}").contains("read audio failed"));
        assert_eq!(t.model(), "whisper-1");
    }

    #[test]
    fn fastwhisperapi_unreachable_server_is_reported() {
        let td = tempfile::tempdir().unwrap();
        let audio = td.path().join("a.wav");
        std::fs::write(&audio, crate::http::wav_bytes(&[0u8; 320], 1, 16_000, 16)).unwrap();
        // Port 9 (discard) is not an HTTP server.
        let t = FastWhisperApi::new("http://127.0.0.1:9/").unwrap();
        assert_eq!(t.base_url, "http://127.0.0.1:9");
        assert_eq!(t.model, "base");
        let err = t.transcribe(&audio).unwrap_err();
        assert!(err.to_string().contains("FastWhisperAPI is not running"));
    }
}
