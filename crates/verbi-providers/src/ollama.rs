use anyhow::{anyhow, Context, Result};
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use verbi_core::Message;

use crate::{http, Responder};

#[derive(Debug, Serialize)]
struct OllamaReq<'a> {
    model: &'a str,
    messages: &'a [Message],
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct OllamaResp {
    message: Option<OllamaMessage>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OllamaMessage {
    content: String,
}

/// Native Ollama chat endpoint, non-streaming.
pub struct OllamaChat {
    base_url: String,
    model: String,
    client: Client,
}

impl OllamaChat {
    pub fn new(base_url: &str, model: &str) -> Result<Self> {
        Ok(Self {
            base_url: base_url.trim().trim_end_matches('/').to_string(),
            model: model.trim().to_string(),
            client: http::client()?,
        })
    }

    pub fn endpoint(&self) -> String {
        format!("{}/api/chat", self.base_url)
    }
}

impl Responder for OllamaChat {
    fn name(&self) -> &'static str {
        "ollama"
    }

    fn respond(&self, history: &[Message]) -> Result<String> {
        let req = OllamaReq {
            model: &self.model,
            messages: history,
            stream: false,
        };
        let resp = self
            .client
            .post(self.endpoint())
            .json(&req)
            .send()
            .with_context(|| format!("ollama request failed ({})", self.base_url))?;
        let resp = http::check_status("ollama", resp)?;
        let r: OllamaResp = resp.json().context("ollama response parse failed")?;
        if let Some(e) = r.error {
            return Err(anyhow!("ollama error: {e}"));
        }
        let content = r
            .message
            .map(|m| m.content.trim().to_string())
            .unwrap_or_default();
        if content.is_empty() {
            return Err(anyhow!("ollama returned empty content"));
        }
        Ok(content)
    }
}
