use std::{fmt, fs, path::Path, str::FromStr};

use chrono::{TimeZone, Utc};
use serde::Serialize;
use verbi_core::{Message, Role};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportError {
    pub code: String,
    pub message: String,
}

impl ExportError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ExportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for ExportError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Text,
    Markdown,
    Json,
}

impl ExportFormat {
    pub fn extension(self) -> &'static str {
        match self {
            ExportFormat::Text => "txt",
            ExportFormat::Markdown => "md",
            ExportFormat::Json => "json",
        }
    }
}

impl FromStr for ExportFormat {
    type Err = ExportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" | "txt" => Ok(ExportFormat::Text),
            "markdown" | "md" => Ok(ExportFormat::Markdown),
            "json" => Ok(ExportFormat::Json),
            other => Err(ExportError::new(
                "E_EXPORT_FORMAT_UNKNOWN",
                format!("unknown export format: {other}"),
            )),
        }
    }
}

fn role_label(role: Role) -> &'static str {
    match role {
        Role::System => "System",
        Role::User => "You",
        Role::Assistant => "Verbi",
    }
}

fn format_ts(ms: i64) -> String {
    Utc.timestamp_millis_opt(ms)
        .single()
        .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| ms.to_string())
}

#[derive(Serialize)]
struct JsonExport<'a> {
    exported_at: String,
    message_count: usize,
    messages: &'a [Message],
}

/// Renders a conversation. Text and markdown leave out the system prompt.
pub fn render(
    messages: &[Message],
    format: ExportFormat,
    exported_at_ms: i64,
) -> Result<String, ExportError> {
    if !messages.iter().any(|m| m.role != Role::System) {
        return Err(ExportError::new(
            "E_EXPORT_EMPTY_CONVERSATION",
            "conversation has no messages to export",
        ));
    }
    let when = format_ts(exported_at_ms);
    let visible = messages.iter().filter(|m| m.role != Role::System);

    let out = match format {
        ExportFormat::Text => {
            let mut s = format!("Verbi conversation\nExported: {when}\n\n");
            for m in visible {
                s.push_str(&format!("{}:\n{}\n\n{}\n\n", role_label(m.role), m.content, "-".repeat(40)));
            }
            s
        }
        ExportFormat::Markdown => {
            let mut s = format!("# Verbi conversation\n\n_Exported: {when}_\n\n");
            for m in visible {
                s.push_str(&format!("### {}\n\n{}\n\n---\n\n", role_label(m.role), m.content));
            }
            s
        }
        ExportFormat::Json => {
            let doc = JsonExport {
                exported_at: when,
                message_count: messages.len(),
                messages,
            };
            serde_json::to_string_pretty(&doc).map_err(|e| {
                ExportError::new("E_EXPORT_SERIALIZE", format!("serialize export failed: {e}"))
            })?
        }
    };
    Ok(out)
}

pub fn write_export(
    path: &Path,
    messages: &[Message],
    format: ExportFormat,
    exported_at_ms: i64,
) -> Result<(), ExportError> {
    let body = render(messages, format, exported_at_ms)?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| {
            ExportError::new("E_EXPORT_WRITE", format!("create export dir failed: {e}"))
        })?;
    }
    fs::write(path, body).map_err(|e| {
        ExportError::new(
            "E_EXPORT_WRITE",
            format!("write export failed ({}): {e}", path.display()),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use verbi_core::ConversationHistory;

    fn sample() -> Vec<Message> {
        let mut h = ConversationHistory::default();
        h.push_user("Hi");
        h.push_assistant("Hello!");
        h.entries().to_vec()
    }

    #[test]
    fn text_and_markdown_skip_system_prompt() {
        let msgs = sample();
        let text = render(&msgs, ExportFormat::Text, 0).unwrap();
        assert!(text.contains("You:\nHi"));
        assert!(text.contains("Verbi:\nHello!"));
        assert!(!text.contains("helpful Assistant"));
        assert!(text.contains("1970-01-01 00:00:00 UTC"));

        let md = render(&msgs, ExportFormat::Markdown, 0).unwrap();
        assert!(md.starts_with("# Verbi conversation"));
        assert!(md.contains("### You\n\nHi\n\n---"));
        assert!(!md.contains("helpful Assistant"));
    }

    #[test]
    fn json_keeps_every_entry() {
        let msgs = sample();
        let raw = render(&msgs, ExportFormat::Json, 0).unwrap();
        let v: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(v["message_count"], 3);
        assert_eq!(v["messages"][0]["role"], "system");
        assert_eq!(v["messages"][2]["content"], "Hello!");
    }

    #[test]
    fn fresh_conversation_is_rejected() {
        let msgs = ConversationHistory::default().entries().to_vec();
        let err = render(&msgs, ExportFormat::Markdown, 0).unwrap_err();
        assert_eq!(err.code, "E_EXPORT_EMPTY_CONVERSATION");
    }

    #[test]
    fn format_parsing_and_write() {
        assert_eq!("MD".parse::<ExportFormat>().unwrap(), ExportFormat::Markdown);
        assert_eq!("txt".parse::<ExportFormat>().unwrap().extension(), "txt");
        assert_eq!(
            "pdf".parse::<ExportFormat>().unwrap_err().code,
            "E_EXPORT_FORMAT_UNKNOWN"
        );

        let td = tempfile::tempdir().unwrap();
        let p = td.path().join("out").join("chat.json");
        write_export(&p, &sample(), ExportFormat::Json, 0).unwrap();
        assert!(fs::read_to_string(&p).unwrap().contains("Hello!"));
    }
}
