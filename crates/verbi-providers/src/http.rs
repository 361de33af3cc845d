use std::{fmt, path::Path, time::Duration};

use anyhow::{Context, Result};
use reqwest::blocking::{Client, Response};

pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_ERROR_BODY: usize = 512;

pub fn client() -> Result<Client> {
    client_with_timeout(REQUEST_TIMEOUT)
}

pub fn client_with_timeout(timeout: Duration) -> Result<Client> {
    Client::builder()
        .timeout(timeout)
        .connect_timeout(CONNECT_TIMEOUT.min(timeout))
        .build()
        .context("build http client failed")
}

/// Non-2xx reply from a provider. Kept as a typed error so callers can
/// classify by status code.
#[derive(Debug, Clone)]
pub struct HttpStatusError {
    pub provider: &'static str,
    pub status: u16,
    pub body: String,
}

impl fmt::Display for HttpStatusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.body.is_empty() {
            write!(f, "{} http {}", self.provider, self.status)
        } else {
            write!(f, "{} http {}: {}", self.provider, self.status, self.body)
        }
    }
}

impl std::error::Error for HttpStatusError {}

pub fn truncate_body(body: &str, max: usize) -> String {
    if body.len() <= max {
        return body.to_string();
    }
    let mut end = max;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...(truncated)", &body[..end])
}

/// Passes successful responses through; anything else becomes [`HttpStatusError`].
pub fn check_status(provider: &'static str, resp: Response) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().unwrap_or_default();
    Err(HttpStatusError {
        provider,
        status: status.as_u16(),
        body: truncate_body(body.trim(), MAX_ERROR_BODY),
    }
    .into())
}

pub fn audio_mime(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("mp3") => "audio/mpeg",
        Some("ogg") => "audio/ogg",
        Some("flac") => "audio/flac",
        Some("m4a") => "audio/mp4",
        Some("webm") => "audio/webm",
        _ => "audio/wav",
    }
}

/// Canonical 44-byte-header PCM WAV.
pub fn wav_bytes(pcm: &[u8], channels: u16, sample_rate: u32, bits_per_sample: u16) -> Vec<u8> {
    let block_align = channels * (bits_per_sample / 8);
    let byte_rate = sample_rate * block_align as u32;
    let data_len = pcm.len() as u32;
    let mut out = Vec::with_capacity(44 + pcm.len());
    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&(36u32 + data_len).to_le_bytes());
    out.extend_from_slice(b"WAVE");
    out.extend_from_slice(b"fmt ");
    out.extend_from_slice(&16u32.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes()); // PCM
    out.extend_from_slice(&channels.to_le_bytes());
    out.extend_from_slice(&sample_rate.to_le_bytes());
    out.extend_from_slice(&byte_rate.to_le_bytes());
    out.extend_from_slice(&block_align.to_le_bytes());
    out.extend_from_slice(&bits_per_sample.to_le_bytes());
    out.extend_from_slice(b"data");
    out.extend_from_slice(&data_len.to_le_bytes());
    out.extend_from_slice(pcm);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate_body("short", 10), "short");
        assert_eq!(truncate_body("ééé", 3), "é...(truncated)");
    }

    #[test]
    fn mime_follows_extension() {
        assert_eq!(audio_mime(Path::new("a.MP3")), "audio/mpeg");
        assert_eq!(audio_mime(Path::new("a.wav")), "audio/wav");
        assert_eq!(audio_mime(Path::new("noext")), "audio/wav");
    }

    #[test]
    fn wav_header_describes_payload() {
        let pcm = vec![0u8; 3200];
        let wav = wav_bytes(&pcm, 1, 16_000, 16);
        assert_eq!(wav.len(), 44 + 3200);
        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(u32::from_le_bytes([wav[24], wav[25], wav[26], wav[27]]), 16_000);
        assert_eq!(u32::from_le_bytes([wav[40], wav[41], wav[42], wav[43]]), 3200);
    }

    #[test]
    fn status_error_display_includes_body() {
        let e = HttpStatusError {
            provider: "openai",
            status: 401,
            body: "Unauthorized".to_string(),
        };
        assert_eq!(e.to_string(), "openai http 401: Unauthorized");
    }
}
