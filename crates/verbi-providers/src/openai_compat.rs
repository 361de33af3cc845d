use anyhow::{anyhow, Context, Result};
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use verbi_core::Message;

use crate::{http, Responder};

pub const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
pub const GROQ_BASE_URL: &str = "https://api.groq.com/openai/v1";

#[derive(Debug, Serialize)]
struct ChatReq<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResp {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

/// Accepts a bare host, a `/v1` base, or a pasted `/chat/completions` endpoint.
pub fn normalize_base_url(s: &str, default: &str) -> String {
    let mut t = s.trim().trim_end_matches('/').to_string();
    if t.is_empty() {
        return default.to_string();
    }
    if let Some(stripped) = t.strip_suffix("/chat/completions") {
        t = stripped.trim_end_matches('/').to_string();
    }
    if !t.ends_with("/v1") && !t.contains("/v1/") {
        t.push_str("/v1");
    }
    t
}

/// Any `/chat/completions` endpoint: OpenAI, Groq, LM Studio.
pub struct ChatCompletions {
    label: &'static str,
    base_url: String,
    model: String,
    api_key: Option<String>,
    client: Client,
}

impl ChatCompletions {
    pub fn new(
        label: &'static str,
        base_url: &str,
        model: &str,
        api_key: Option<String>,
    ) -> Result<Self> {
        Ok(Self {
            label,
            base_url: normalize_base_url(base_url, OPENAI_BASE_URL),
            model: model.trim().to_string(),
            api_key,
            client: http::client()?,
        })
    }

    pub fn openai(model: &str, api_key: String) -> Result<Self> {
        Self::new("openai", OPENAI_BASE_URL, model, Some(api_key))
    }

    pub fn groq(model: &str, api_key: String) -> Result<Self> {
        Self::new("groq", GROQ_BASE_URL, model, Some(api_key))
    }

    pub fn lmstudio(base_url: &str, model: &str) -> Result<Self> {
        Self::new("lmstudio", base_url, model, None)
    }

    pub(crate) fn with_client(mut self, client: Client) -> Self {
        self.client = client;
        self
    }

    pub fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    pub(crate) fn complete(&self, messages: &[Message], max_tokens: Option<u32>) -> Result<String> {
        let req = ChatReq {
            model: &self.model,
            messages: messages
                .iter()
                .map(|m| ChatMessage {
                    role: m.role.as_str(),
                    content: &m.content,
                })
                .collect(),
            max_tokens,
        };
        let mut rb = self.client.post(self.endpoint()).json(&req);
        if let Some(k) = &self.api_key {
            rb = rb.bearer_auth(k);
        }
        let resp = rb
            .send()
            .with_context(|| format!("{} chat request failed", self.label))?;
        let resp = http::check_status(self.label, resp)?;
        let r: ChatResp = resp
            .json()
            .with_context(|| format!("{} chat response parse failed", self.label))?;
        let content = r
            .choices
            .first()
            .ok_or_else(|| anyhow!("{} response missing choices[0]", self.label))?
            .message
            .content
            .as_deref()
            .unwrap_or_default()
            .trim()
            .to_string();
        if content.is_empty() {
            return Err(anyhow!("{} returned empty content", self.label));
        }
        Ok(content)
    }
}

impl Responder for ChatCompletions {
    fn name(&self) -> &'static str {
        self.label
    }

    fn respond(&self, history: &[Message]) -> Result<String> {
        self.complete(history, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_base_url_handles_empty_host_and_endpoint_suffix() {
        assert_eq!(normalize_base_url("", OPENAI_BASE_URL), OPENAI_BASE_URL);
        assert_eq!(
            normalize_base_url(" https://api.openai.com/v1/ ", OPENAI_BASE_URL),
            "https://api.openai.com/v1"
        );
        assert_eq!(
            normalize_base_url("http://localhost:1234", OPENAI_BASE_URL),
            "http://localhost:1234/v1"
        );
        assert_eq!(
            normalize_base_url("http://api.server/v1/chat/completions/", OPENAI_BASE_URL),
            "http://api.server/v1"
        );
        assert_eq!(normalize_base_url(GROQ_BASE_URL, OPENAI_BASE_URL), GROQ_BASE_URL);
    }

    #[test]
    fn lmstudio_points_at_local_server() {
        let c = ChatCompletions::lmstudio("http://localhost:1234/", "local-model").unwrap();
        assert_eq!(c.endpoint(), "http://localhost:1234/v1/chat/completions");
        assert_eq!(c.name(), "lmstudio");
        assert!(c.api_key.is_none());
    }

    #[test]
    fn request_carries_full_history_in_order() {
        let mut h = verbi_core::ConversationHistory::default();
        h.push_user("Hi");
        let req = ChatReq {
            model: "gpt-4o",
            messages: h
                .entries()
                .iter()
                .map(|m| ChatMessage {
                    role: m.role.as_str(),
                    content: &m.content,
                })
                .collect(),
            max_tokens: None,
        };
        let v = serde_json::to_value(&req).unwrap();
        assert_eq!(v["messages"][0]["role"], "system");
        assert_eq!(v["messages"][1]["content"], "Hi");
        assert!(v.get("max_tokens").is_none());
    }
}
