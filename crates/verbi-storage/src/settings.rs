use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_TRANSCRIPTION_MODEL: &str = "deepgram";
pub const DEFAULT_RESPONSE_MODEL: &str = "openai";
pub const DEFAULT_TTS_MODEL: &str = "openai";
pub const DEFAULT_OPENAI_LLM: &str = "gpt-4o";
pub const DEFAULT_GROQ_LLM: &str = "llama3-8b-8192";
pub const DEFAULT_OLLAMA_LLM: &str = "llama3:8b";
pub const DEFAULT_OLLAMA_BASE_URL: &str = "http://localhost:11434";
pub const DEFAULT_LMSTUDIO_BASE_URL: &str = "http://localhost:1234";
pub const DEFAULT_LMSTUDIO_MODEL: &str = "local-model";
pub const DEFAULT_RECORD_PROGRAM: &str = "rec";
pub const DEFAULT_PLAYER_PROGRAM: &str = "ffplay";
pub const DEFAULT_RECORD_MAX_SECONDS: u32 = 30;
pub const DEFAULT_RECORD_SILENCE_SECONDS: f64 = 2.0;

/// Flat key/value settings file. Every key is optional; accessors fall back
/// to the defaults above.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct Settings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transcription_model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tts_model: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub openai_llm: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub groq_llm: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ollama_llm: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ollama_base_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lmstudio_base_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lmstudio_model: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub openai_api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub groq_api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deepgram_api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elevenlabs_api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cartesia_api_key: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub record_program: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub player_program: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record_max_seconds: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record_silence_seconds: Option<f64>,
}

fn or_default<'a>(v: &'a Option<String>, default: &'a str) -> &'a str {
    v.as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or(default)
}

impl Settings {
    pub fn transcription_model(&self) -> &str {
        or_default(&self.transcription_model, DEFAULT_TRANSCRIPTION_MODEL)
    }

    pub fn response_model(&self) -> &str {
        or_default(&self.response_model, DEFAULT_RESPONSE_MODEL)
    }

    pub fn tts_model(&self) -> &str {
        or_default(&self.tts_model, DEFAULT_TTS_MODEL)
    }

    pub fn openai_llm(&self) -> &str {
        or_default(&self.openai_llm, DEFAULT_OPENAI_LLM)
    }

    pub fn groq_llm(&self) -> &str {
        or_default(&self.groq_llm, DEFAULT_GROQ_LLM)
    }

    pub fn ollama_llm(&self) -> &str {
        or_default(&self.ollama_llm, DEFAULT_OLLAMA_LLM)
    }

    pub fn ollama_base_url(&self) -> &str {
        or_default(&self.ollama_base_url, DEFAULT_OLLAMA_BASE_URL)
    }

    pub fn lmstudio_base_url(&self) -> &str {
        or_default(&self.lmstudio_base_url, DEFAULT_LMSTUDIO_BASE_URL)
    }

    pub fn lmstudio_model(&self) -> &str {
        or_default(&self.lmstudio_model, DEFAULT_LMSTUDIO_MODEL)
    }

    pub fn record_program(&self) -> &str {
        or_default(&self.record_program, DEFAULT_RECORD_PROGRAM)
    }

    pub fn player_program(&self) -> &str {
        or_default(&self.player_program, DEFAULT_PLAYER_PROGRAM)
    }

    pub fn record_max_seconds(&self) -> u32 {
        self.record_max_seconds
            .filter(|v| *v > 0)
            .unwrap_or(DEFAULT_RECORD_MAX_SECONDS)
    }

    pub fn record_silence_seconds(&self) -> f64 {
        self.record_silence_seconds
            .filter(|v| v.is_finite() && *v > 0.0)
            .unwrap_or(DEFAULT_RECORD_SILENCE_SECONDS)
    }

    /// Copy safe to print: stored API keys keep only their last four chars.
    pub fn redacted(&self) -> Settings {
        let mask = |v: &Option<String>| {
            v.as_deref().filter(|s| !s.is_empty()).map(|s| {
                let tail: String = s.chars().rev().take(4).collect::<Vec<_>>().into_iter().rev().collect();
                format!("****{tail}")
            })
        };
        Settings {
            openai_api_key: mask(&self.openai_api_key),
            groq_api_key: mask(&self.groq_api_key),
            deepgram_api_key: mask(&self.deepgram_api_key),
            elevenlabs_api_key: mask(&self.elevenlabs_api_key),
            cartesia_api_key: mask(&self.cartesia_api_key),
            ..self.clone()
        }
    }
}

pub const SETTINGS_KEYS: &[&str] = &[
    "transcription_model",
    "response_model",
    "tts_model",
    "openai_llm",
    "groq_llm",
    "ollama_llm",
    "ollama_base_url",
    "lmstudio_base_url",
    "lmstudio_model",
    "openai_api_key",
    "groq_api_key",
    "deepgram_api_key",
    "elevenlabs_api_key",
    "cartesia_api_key",
    "record_program",
    "player_program",
    "record_max_seconds",
    "record_silence_seconds",
];

pub fn settings_path(data_dir: &Path) -> PathBuf {
    data_dir.join("settings.json")
}

pub fn load_settings(data_dir: &Path) -> Result<Settings> {
    let p = settings_path(data_dir);
    if !p.exists() {
        return Ok(Settings::default());
    }
    let s = fs::read_to_string(&p).context("read settings.json failed")?;
    let v: Settings = serde_json::from_str(&s).context("parse settings.json failed")?;
    Ok(v)
}

/// Loads settings; an unreadable file is moved aside and defaults are used.
pub fn load_settings_or_recover(data_dir: &Path) -> Settings {
    match load_settings(data_dir) {
        Ok(s) => s,
        Err(e) => {
            let p = settings_path(data_dir);
            let ts = chrono::Utc::now().timestamp_millis();
            let aside = data_dir.join(format!("settings.json.bad-{ts}"));
            tracing::warn!("settings unreadable, moving to {}: {e:#}", aside.display());
            let _ = fs::rename(&p, &aside);
            Settings::default()
        }
    }
}

pub fn save_settings(data_dir: &Path, settings: &Settings) -> Result<()> {
    fs::create_dir_all(data_dir).context("create data dir failed")?;
    let p = settings_path(data_dir);
    let tmp = data_dir.join("settings.json.tmp");
    let s = serde_json::to_string_pretty(settings).context("serialize settings failed")?;
    fs::write(&tmp, s).context("write settings.json failed")?;
    fs::rename(&tmp, &p).context("replace settings.json failed")?;
    Ok(())
}

/// Parses `key=value`. An empty value clears the key.
pub fn parse_assignment(s: &str) -> Result<(String, String)> {
    let (k, v) = s
        .split_once('=')
        .ok_or_else(|| anyhow!("expected key=value, got {s:?}"))?;
    let k = k.trim();
    if !SETTINGS_KEYS.contains(&k) {
        return Err(anyhow!("unknown settings key: {k}"));
    }
    Ok((k.to_string(), v.trim().to_string()))
}

pub type SettingsPatch = Vec<(String, String)>;

pub fn apply_patch(mut cur: Settings, patch: &SettingsPatch) -> Result<Settings> {
    for (k, v) in patch {
        set_value(&mut cur, k, v)?;
    }
    Ok(cur)
}

fn set_value(s: &mut Settings, key: &str, value: &str) -> Result<()> {
    let text = || (!value.is_empty()).then(|| value.to_string());
    match key {
        "transcription_model" => s.transcription_model = text(),
        "response_model" => s.response_model = text(),
        "tts_model" => s.tts_model = text(),
        "openai_llm" => s.openai_llm = text(),
        "groq_llm" => s.groq_llm = text(),
        "ollama_llm" => s.ollama_llm = text(),
        "ollama_base_url" => s.ollama_base_url = text(),
        "lmstudio_base_url" => s.lmstudio_base_url = text(),
        "lmstudio_model" => s.lmstudio_model = text(),
        "openai_api_key" => s.openai_api_key = text(),
        "groq_api_key" => s.groq_api_key = text(),
        "deepgram_api_key" => s.deepgram_api_key = text(),
        "elevenlabs_api_key" => s.elevenlabs_api_key = text(),
        "cartesia_api_key" => s.cartesia_api_key = text(),
        "record_program" => s.record_program = text(),
        "player_program" => s.player_program = text(),
        "record_max_seconds" => {
            s.record_max_seconds = match text() {
                None => None,
                Some(v) => Some(
                    v.parse::<u32>()
                        .with_context(|| format!("record_max_seconds must be an integer: {v}"))?,
                ),
            }
        }
        "record_silence_seconds" => {
            s.record_silence_seconds = match text() {
                None => None,
                Some(v) => Some(
                    v.parse::<f64>()
                        .with_context(|| format!("record_silence_seconds must be a number: {v}"))?,
                ),
            }
        }
        _ => return Err(anyhow!("unknown settings key: {key}")),
    }
    Ok(())
}
