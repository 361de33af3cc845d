use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::blocking::Client;
use serde::Serialize;
use verbi_core::Message;
use verbi_storage::Settings;

use crate::{
    http::{self, HttpStatusError},
    keys::{self, Vendor},
    openai_compat::{ChatCompletions, GROQ_BASE_URL, OPENAI_BASE_URL},
    speech::{cartesia_body, CARTESIA_TTS_URL, CARTESIA_VERSION},
    transcribe::Deepgram,
};

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Outcome of one connectivity check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeResult {
    pub provider: String,
    pub ok: bool,
    pub message: String,
}

impl ProbeResult {
    fn new(vendor: Vendor, ok: bool, message: impl Into<String>) -> Self {
        Self {
            provider: vendor.display_name().to_string(),
            ok,
            message: message.into(),
        }
    }
}

fn short_error(text: &str) -> String {
    let head: String = text.chars().take(50).collect();
    format!("Error: {head}")
}

/// Maps a failed check to the short message shown next to the provider.
pub fn classify(status: Option<u16>, text: &str) -> String {
    match status {
        Some(401) | Some(403) => return "Invalid API key".to_string(),
        Some(429) if text.to_ascii_lowercase().contains("quota") => {
            return "Quota exceeded".to_string()
        }
        Some(429) => return "Rate limit exceeded".to_string(),
        _ => {}
    }
    let t = text.to_ascii_lowercase();
    if t.contains("timed out") || t.contains("timeout") {
        "Connection timeout".to_string()
    } else if t.contains("api_key")
        || t.contains("api key")
        || t.contains("authentication")
        || t.contains("unauthorized")
    {
        "Invalid API key".to_string()
    } else if t.contains("quota") || t.contains("insufficient") {
        "Quota exceeded".to_string()
    } else if t.contains("rate") {
        "Rate limit exceeded".to_string()
    } else if let Some(s) = status {
        format!("Error: Status {s}")
    } else {
        short_error(text)
    }
}

fn classify_error(e: &anyhow::Error) -> String {
    if let Some(h) = e.downcast_ref::<HttpStatusError>() {
        return classify(Some(h.status), &h.body);
    }
    let timed_out = e.chain().any(|c| {
        c.downcast_ref::<reqwest::Error>()
            .is_some_and(|r| r.is_timeout())
    });
    if timed_out {
        return "Connection timeout".to_string();
    }
    classify(None, &format!("{e:#}"))
}

fn run(vendor: Vendor, key: Option<String>, check: impl FnOnce(&Client, String) -> Result<()>) -> ProbeResult {
    let Some(key) = key.filter(|k| !k.trim().is_empty()) else {
        return ProbeResult::new(vendor, false, "API key not provided");
    };
    let r = http::client_with_timeout(PROBE_TIMEOUT).and_then(|c| check(&c, key));
    match r {
        Ok(()) => ProbeResult::new(vendor, true, "Connected successfully"),
        Err(e) => {
            tracing::debug!("{vendor} probe failed: {e:#}");
            ProbeResult::new(vendor, false, classify_error(&e))
        }
    }
}

fn probe_chat(
    client: &Client,
    label: &'static str,
    base_url: &str,
    model: &str,
    key: String,
) -> Result<()> {
    let c = ChatCompletions::new(label, base_url, model, Some(key))?.with_client(client.clone());
    c.complete(&[Message::new(verbi_core::Role::User, "test")], Some(5))?;
    Ok(())
}

pub fn probe_openai(key: Option<String>) -> ProbeResult {
    run(Vendor::OpenAi, key, |c, k| {
        probe_chat(c, "openai", OPENAI_BASE_URL, "gpt-4o-mini", k)
    })
}

pub fn probe_groq(key: Option<String>) -> ProbeResult {
    run(Vendor::Groq, key, |c, k| {
        probe_chat(c, "groq", GROQ_BASE_URL, "llama3-8b-8192", k)
    })
}

pub fn probe_deepgram(key: Option<String>) -> ProbeResult {
    run(Vendor::Deepgram, key, |c, k| {
        // 0.1 s of 16 kHz mono silence.
        let wav = http::wav_bytes(&[0u8; 3200], 1, 16_000, 16);
        Deepgram::new(k)?.send(c, wav, "audio/wav")?;
        Ok(())
    })
}

pub fn probe_elevenlabs(key: Option<String>) -> ProbeResult {
    run(Vendor::ElevenLabs, key, |c, k| {
        let resp = c
            .get("https://api.elevenlabs.io/v1/voices")
            .header("xi-api-key", k)
            .send()
            .context("elevenlabs request failed")?;
        http::check_status("elevenlabs", resp)?;
        Ok(())
    })
}

pub fn probe_cartesia(key: Option<String>) -> ProbeResult {
    run(Vendor::Cartesia, key, |c, k| {
        let resp = c
            .post(CARTESIA_TTS_URL)
            .header("X-API-Key", k)
            .header("Cartesia-Version", CARTESIA_VERSION)
            .json(&cartesia_body("test"))
            .send()
            .context("cartesia request failed")?;
        http::check_status("cartesia", resp)?;
        Ok(())
    })
}

pub fn probe(vendor: Vendor, key: Option<String>) -> ProbeResult {
    match vendor {
        Vendor::OpenAi => probe_openai(key),
        Vendor::Groq => probe_groq(key),
        Vendor::Deepgram => probe_deepgram(key),
        Vendor::ElevenLabs => probe_elevenlabs(key),
        Vendor::Cartesia => probe_cartesia(key),
    }
}

/// Checks every vendor in a fixed order with the keys the app would use.
pub fn probe_all(settings: &Settings) -> Vec<ProbeResult> {
    Vendor::ALL
        .into_iter()
        .map(|v| {
            tracing::info!("testing {} API...", v.display_name());
            probe(v, keys::resolve_api_key(v, settings))
        })
        .collect()
}
