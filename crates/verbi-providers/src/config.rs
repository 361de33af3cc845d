use std::{collections::BTreeMap, fmt, str::FromStr, sync::Arc};

use anyhow::Result;
use verbi_storage::Settings;

use crate::{
    keys::{self, Vendor},
    ollama::OllamaChat,
    openai_compat::ChatCompletions,
    speech::{self, CartesiaSpeech, DeepgramSpeech, ElevenLabsSpeech, LocalSpeech, OpenAiSpeech},
    transcribe::{Deepgram, FastWhisperApi, WhisperApi, FASTWHISPERAPI_URL},
    Responder, Synthesizer, Transcriber,
};

/// Problem with the selected providers, worded for the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssue {
    pub key: String,
    pub message: String,
}

impl ValidationIssue {
    fn new(key: &str, message: impl Into<String>) -> Self {
        Self {
            key: key.to_string(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.key, self.message)
    }
}

#[derive(Debug, Clone)]
pub struct ConfigError {
    pub issues: Vec<ValidationIssue>,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.issues.iter().map(|i| i.to_string()).collect();
        write!(f, "invalid provider settings: {}", parts.join("; "))
    }
}

impl std::error::Error for ConfigError {}

macro_rules! provider_tag {
    ($name:ident, $setting:literal, { $($variant:ident => $tag:literal, $vendor:expr;)+ }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub enum $name {
            $($variant,)+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant,)+];
            pub const SETTING: &'static str = $setting;

            pub fn as_str(self) -> &'static str {
                match self {
                    $($name::$variant => $tag,)+
                }
            }

            /// Vendor whose API key this provider needs, if any.
            pub fn vendor(self) -> Option<Vendor> {
                match self {
                    $($name::$variant => $vendor,)+
                }
            }
        }

        impl FromStr for $name {
            type Err = ValidationIssue;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let t = s.trim().to_ascii_lowercase();
                $name::ALL
                    .iter()
                    .copied()
                    .find(|k| k.as_str() == t)
                    .ok_or_else(|| {
                        let known: Vec<&str> = $name::ALL.iter().map(|k| k.as_str()).collect();
                        ValidationIssue::new(
                            $setting,
                            format!("unknown provider {s:?} (expected one of: {})", known.join(", ")),
                        )
                    })
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

provider_tag!(TranscriberKind, "transcription_model", {
    OpenAi => "openai", Some(Vendor::OpenAi);
    Groq => "groq", Some(Vendor::Groq);
    Deepgram => "deepgram", Some(Vendor::Deepgram);
    FastWhisperApi => "fastwhisperapi", None;
});

provider_tag!(ResponderKind, "response_model", {
    OpenAi => "openai", Some(Vendor::OpenAi);
    Groq => "groq", Some(Vendor::Groq);
    Ollama => "ollama", None;
    LmStudio => "lmstudio", None;
});

provider_tag!(SynthesizerKind, "tts_model", {
    OpenAi => "openai", Some(Vendor::OpenAi);
    Deepgram => "deepgram", Some(Vendor::Deepgram);
    ElevenLabs => "elevenlabs", Some(Vendor::ElevenLabs);
    Cartesia => "cartesia", Some(Vendor::Cartesia);
    Local => "local", None;
});

/// Provider selection resolved once at startup.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub transcriber: TranscriberKind,
    pub responder: ResponderKind,
    pub synthesizer: SynthesizerKind,
    pub openai_llm: String,
    pub groq_llm: String,
    pub ollama_llm: String,
    pub ollama_base_url: String,
    pub lmstudio_base_url: String,
    pub lmstudio_model: String,
    pub player_program: String,
    keys: BTreeMap<Vendor, String>,
}

pub struct Providers {
    pub transcriber: Arc<dyn Transcriber>,
    pub responder: Arc<dyn Responder>,
    pub synthesizer: Arc<dyn Synthesizer>,
}

impl ProviderConfig {
    pub fn from_settings(s: &Settings) -> Result<Self, ConfigError> {
        Self::from_settings_with(s, keys::resolve_api_key)
    }

    /// Same as [`ProviderConfig::from_settings`] with a caller-supplied key lookup.
    pub fn from_settings_with(
        s: &Settings,
        resolve_key: impl Fn(Vendor, &Settings) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let mut issues = Vec::new();
        let transcriber = s
            .transcription_model()
            .parse::<TranscriberKind>()
            .map_err(|e| issues.push(e))
            .ok();
        let responder = s
            .response_model()
            .parse::<ResponderKind>()
            .map_err(|e| issues.push(e))
            .ok();
        let synthesizer = s
            .tts_model()
            .parse::<SynthesizerKind>()
            .map_err(|e| issues.push(e))
            .ok();

        let mut needed: Vec<(&str, &str, Vendor)> = Vec::new();
        if let Some(v) = transcriber.and_then(|k| k.vendor()) {
            needed.push((TranscriberKind::SETTING, transcriber.map_or("", |k| k.as_str()), v));
        }
        if let Some(v) = responder.and_then(|k| k.vendor()) {
            needed.push((ResponderKind::SETTING, responder.map_or("", |k| k.as_str()), v));
        }
        if let Some(v) = synthesizer.and_then(|k| k.vendor()) {
            needed.push((SynthesizerKind::SETTING, synthesizer.map_or("", |k| k.as_str()), v));
        }

        if synthesizer == Some(SynthesizerKind::Cartesia) && !speech::is_ffplay(s.player_program()) {
            issues.push(ValidationIssue::new(
                "player_program",
                format!(
                    "tts_model=cartesia streams raw PCM and needs ffplay, not {:?}",
                    s.player_program()
                ),
            ));
        }

        let mut keys = BTreeMap::new();
        for (setting, tag, vendor) in needed {
            if keys.contains_key(&vendor) {
                continue;
            }
            match resolve_key(vendor, s) {
                Some(k) => {
                    keys.insert(vendor, k);
                }
                None => issues.push(ValidationIssue::new(
                    vendor.settings_key(),
                    format!(
                        "{} API key is required for {setting}={tag} (set {} or run `verbi keys set {vendor}`)",
                        vendor.display_name(),
                        vendor.env_var()
                    ),
                )),
            }
        }

        match (transcriber, responder, synthesizer) {
            (Some(transcriber), Some(responder), Some(synthesizer)) if issues.is_empty() => {
                Ok(Self {
                    transcriber,
                    responder,
                    synthesizer,
                    openai_llm: s.openai_llm().to_string(),
                    groq_llm: s.groq_llm().to_string(),
                    ollama_llm: s.ollama_llm().to_string(),
                    ollama_base_url: s.ollama_base_url().to_string(),
                    lmstudio_base_url: s.lmstudio_base_url().to_string(),
                    lmstudio_model: s.lmstudio_model().to_string(),
                    player_program: s.player_program().to_string(),
                    keys,
                })
            }
            _ => Err(ConfigError { issues }),
        }
    }

    /// User-visible problems with the current settings; empty means usable.
    pub fn validate(s: &Settings) -> Vec<ValidationIssue> {
        match Self::from_settings(s) {
            Ok(_) => Vec::new(),
            Err(e) => e.issues,
        }
    }

    fn key(&self, vendor: Vendor) -> String {
        self.keys.get(&vendor).cloned().unwrap_or_default()
    }

    pub fn build(&self) -> Result<Providers> {
        let transcriber: Arc<dyn Transcriber> = match self.transcriber {
            TranscriberKind::OpenAi => Arc::new(WhisperApi::openai(self.key(Vendor::OpenAi))?),
            TranscriberKind::Groq => Arc::new(WhisperApi::groq(self.key(Vendor::Groq))?),
            TranscriberKind::Deepgram => Arc::new(Deepgram::new(self.key(Vendor::Deepgram))?),
            TranscriberKind::FastWhisperApi => Arc::new(FastWhisperApi::new(FASTWHISPERAPI_URL)?),
        };
        let responder: Arc<dyn Responder> = match self.responder {
            ResponderKind::OpenAi => Arc::new(ChatCompletions::openai(
                &self.openai_llm,
                self.key(Vendor::OpenAi),
            )?),
            ResponderKind::Groq => {
                Arc::new(ChatCompletions::groq(&self.groq_llm, self.key(Vendor::Groq))?)
            }
            ResponderKind::Ollama => {
                Arc::new(OllamaChat::new(&self.ollama_base_url, &self.ollama_llm)?)
            }
            ResponderKind::LmStudio => Arc::new(ChatCompletions::lmstudio(
                &self.lmstudio_base_url,
                &self.lmstudio_model,
            )?),
        };
        let synthesizer: Arc<dyn Synthesizer> = match self.synthesizer {
            SynthesizerKind::OpenAi => Arc::new(OpenAiSpeech::new(self.key(Vendor::OpenAi))?),
            SynthesizerKind::Deepgram => Arc::new(DeepgramSpeech::new(self.key(Vendor::Deepgram))?),
            SynthesizerKind::ElevenLabs => {
                Arc::new(ElevenLabsSpeech::new(self.key(Vendor::ElevenLabs))?)
            }
            SynthesizerKind::Cartesia => Arc::new(CartesiaSpeech::new(
                self.key(Vendor::Cartesia),
                &self.player_program,
            )?),
            SynthesizerKind::Local => Arc::new(LocalSpeech::new()),
        };
        tracing::info!(
            transcriber = self.transcriber.as_str(),
            responder = self.responder.as_str(),
            synthesizer = self.synthesizer.as_str(),
            "providers selected"
        );
        Ok(Providers {
            transcriber,
            responder,
            synthesizer,
        })
    }
}
