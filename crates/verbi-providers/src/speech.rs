use std::{
    io,
    path::Path,
    process::{Command, Stdio},
};

use anyhow::{anyhow, Context, Result};
use reqwest::blocking::Client;
use serde_json::json;

use crate::{http, SpeechOutput, Synthesizer};

pub const OPENAI_SPEECH_URL: &str = "https://api.openai.com/v1/audio/speech";
pub const ELEVENLABS_TTS_URL: &str = "https://api.elevenlabs.io/v1/text-to-speech";
pub const CARTESIA_TTS_URL: &str = "https://api.cartesia.ai/tts/bytes";
pub const CARTESIA_VERSION: &str = "2024-06-10";
pub const DEEPGRAM_SPEAK_URL: &str = "https://api.deepgram.com/v1/speak";

const OPENAI_VOICE: &str = "fable";
const ELEVENLABS_VOICE_ID: &str = "21m00Tcm4TlvDq8ikWAM";
const ELEVENLABS_MODEL: &str = "eleven_turbo_v2";
pub(crate) const CARTESIA_VOICE_ID: &str = "a0e99841-438c-4a64-b679-ae501e7d6091";
pub(crate) const CARTESIA_MODEL: &str = "sonic-english";
const CARTESIA_SAMPLE_RATE: u32 = 44_100;
const DEEPGRAM_VOICE: &str = "aura-arcas-en";

/// True when `program` names ffplay, with or without a directory or `.exe`.
pub fn is_ffplay(program: &str) -> bool {
    Path::new(program.trim())
        .file_stem()
        .and_then(|s| s.to_str())
        .is_some_and(|s| s.eq_ignore_ascii_case("ffplay"))
}

fn write_body(resp: reqwest::blocking::Response, output: &Path) -> Result<()> {
    let bytes = resp.bytes().context("read speech body failed")?;
    if bytes.is_empty() {
        return Err(anyhow!("speech response was empty"));
    }
    std::fs::write(output, &bytes)
        .with_context(|| format!("write speech file failed: {}", output.display()))
}

pub struct OpenAiSpeech {
    api_key: String,
    client: Client,
}

impl OpenAiSpeech {
    pub fn new(api_key: String) -> Result<Self> {
        Ok(Self {
            api_key,
            client: http::client()?,
        })
    }
}

impl Synthesizer for OpenAiSpeech {
    fn name(&self) -> &'static str {
        "openai"
    }

    fn file_extension(&self) -> &'static str {
        "mp3"
    }

    fn synthesize(&self, text: &str, output: &Path) -> Result<SpeechOutput> {
        let resp = self
            .client
            .post(OPENAI_SPEECH_URL)
            .bearer_auth(&self.api_key)
            .json(&json!({
                "model": "tts-1",
                "voice": OPENAI_VOICE,
                "input": text,
                "response_format": "mp3",
            }))
            .send()
            .context("openai speech request failed")?;
        let resp = http::check_status("openai", resp)?;
        write_body(resp, output)?;
        Ok(SpeechOutput::File(output.to_path_buf()))
    }
}

pub struct ElevenLabsSpeech {
    api_key: String,
    voice_id: String,
    client: Client,
}

impl ElevenLabsSpeech {
    pub fn new(api_key: String) -> Result<Self> {
        Ok(Self {
            api_key,
            voice_id: ELEVENLABS_VOICE_ID.to_string(),
            client: http::client()?,
        })
    }
}

impl Synthesizer for ElevenLabsSpeech {
    fn name(&self) -> &'static str {
        "elevenlabs"
    }

    fn file_extension(&self) -> &'static str {
        "mp3"
    }

    fn synthesize(&self, text: &str, output: &Path) -> Result<SpeechOutput> {
        let resp = self
            .client
            .post(format!("{ELEVENLABS_TTS_URL}/{}", self.voice_id))
            .header("xi-api-key", &self.api_key)
            .header("Accept", "audio/mpeg")
            .json(&json!({
                "text": text,
                "model_id": ELEVENLABS_MODEL,
            }))
            .send()
            .context("elevenlabs request failed")?;
        let resp = http::check_status("elevenlabs", resp)?;
        write_body(resp, output)?;
        Ok(SpeechOutput::File(output.to_path_buf()))
    }
}

/// Deepgram Aura, mp3 output.
pub struct DeepgramSpeech {
    api_key: String,
    client: Client,
}

impl DeepgramSpeech {
    pub fn new(api_key: String) -> Result<Self> {
        Ok(Self {
            api_key,
            client: http::client()?,
        })
    }

    fn request(&self, text: &str) -> reqwest::blocking::RequestBuilder {
        self.client
            .post(DEEPGRAM_SPEAK_URL)
            .query(&[("model", DEEPGRAM_VOICE), ("encoding", "mp3")])
            .header("Authorization", format!("Token {}", self.api_key))
            .json(&json!({ "text": text }))
    }
}

impl Synthesizer for DeepgramSpeech {
    fn name(&self) -> &'static str {
        "deepgram"
    }

    fn file_extension(&self) -> &'static str {
        "mp3"
    }

    fn synthesize(&self, text: &str, output: &Path) -> Result<SpeechOutput> {
        let resp = self
            .request(text)
            .send()
            .context("deepgram speech request failed")?;
        let resp = http::check_status("deepgram", resp)?;
        write_body(resp, output)?;
        Ok(SpeechOutput::File(output.to_path_buf()))
    }
}

pub(crate) fn cartesia_body(text: &str) -> serde_json::Value {
    json!({
        "model_id": CARTESIA_MODEL,
        "transcript": text,
        "voice": {"mode": "id", "id": CARTESIA_VOICE_ID},
        "output_format": {
            "container": "raw",
            "encoding": "pcm_f32le",
            "sample_rate": CARTESIA_SAMPLE_RATE,
        },
    })
}

/// Streams raw PCM from Cartesia straight into the player's stdin.
/// Only ffplay can be told the raw sample format, so no other player is accepted.
pub struct CartesiaSpeech {
    api_key: String,
    player_program: String,
    client: Client,
}

impl CartesiaSpeech {
    pub fn new(api_key: String, player_program: &str) -> Result<Self> {
        if !is_ffplay(player_program) {
            return Err(anyhow!(
                "cartesia streams raw PCM and needs ffplay as the player, got {player_program:?}"
            ));
        }
        Ok(Self {
            api_key,
            player_program: player_program.to_string(),
            client: http::client()?,
        })
    }

    fn player_args() -> Vec<String> {
        let mut args: Vec<String> = ["-f", "f32le", "-ar"].map(String::from).to_vec();
        args.push(CARTESIA_SAMPLE_RATE.to_string());
        args.extend(
            ["-ac", "1", "-nodisp", "-autoexit", "-loglevel", "error", "-i", "-"].map(String::from),
        );
        args
    }
}

impl Synthesizer for CartesiaSpeech {
    fn name(&self) -> &'static str {
        "cartesia"
    }

    fn file_extension(&self) -> &'static str {
        "pcm"
    }

    fn synthesize(&self, text: &str, _output: &Path) -> Result<SpeechOutput> {
        let mut resp = self
            .client
            .post(CARTESIA_TTS_URL)
            .header("X-API-Key", &self.api_key)
            .header("Cartesia-Version", CARTESIA_VERSION)
            .json(&cartesia_body(text))
            .send()
            .context("cartesia request failed")?;
        resp = http::check_status("cartesia", resp)?;

        let mut child = Command::new(&self.player_program)
            .args(Self::player_args())
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("spawn player failed: {}", self.player_program))?;
        let copied = match child.stdin.take() {
            Some(mut stdin) => io::copy(&mut resp, &mut stdin).map(|_| ()),
            None => Err(io::Error::new(io::ErrorKind::BrokenPipe, "player stdin missing")),
        };
        let out = child.wait_with_output().context("wait for player failed")?;
        copied.context("stream audio to player failed")?;
        if !out.status.success() {
            let err = String::from_utf8_lossy(&out.stderr);
            return Err(anyhow!(
                "player exited with {}: {}",
                out.status,
                err.lines().last().unwrap_or("")
            ));
        }
        Ok(SpeechOutput::Streamed)
    }
}

/// Offline speech through the platform's command-line synthesizer.
pub struct LocalSpeech {
    program: String,
}

impl LocalSpeech {
    pub fn new() -> Self {
        let program = if cfg!(target_os = "macos") { "say" } else { "espeak" };
        Self {
            program: program.to_string(),
        }
    }

    pub fn with_program(program: &str) -> Self {
        Self {
            program: program.to_string(),
        }
    }

    fn command(&self, text: &str, output: &Path) -> Command {
        let mut cmd = Command::new(&self.program);
        if self.program.ends_with("say") {
            cmd.args(["--file-format=WAVE", "--data-format=LEI16@22050", "-o"])
                .arg(output)
                .arg(text);
        } else {
            cmd.arg("-w").arg(output).arg(text);
        }
        cmd
    }
}

impl Default for LocalSpeech {
    fn default() -> Self {
        Self::new()
    }
}

impl Synthesizer for LocalSpeech {
    fn name(&self) -> &'static str {
        "local"
    }

    fn file_extension(&self) -> &'static str {
        "wav"
    }

    fn synthesize(&self, text: &str, output: &Path) -> Result<SpeechOutput> {
        let out = self
            .command(text, output)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .with_context(|| format!("run {} failed", self.program))?;
        if !out.status.success() {
            let err = String::from_utf8_lossy(&out.stderr);
            return Err(anyhow!(
                "{} exited with {}: {}",
                self.program,
                out.status,
                err.lines().last().unwrap_or("")
            ));
        }
        if !output.exists() {
            return Err(anyhow!("{} produced no audio", self.program));
        }
        Ok(SpeechOutput::File(output.to_path_buf()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cartesia_requests_raw_float_pcm() {
        let v = cartesia_body("hello");
        assert_eq!(v["transcript"], "hello");
        assert_eq!(v["output_format"]["encoding"], "pcm_f32le");
        assert_eq!(v["voice"]["id"], CARTESIA_VOICE_ID);
        let args = CartesiaSpeech::player_args();
        assert_eq!(args.last().map(String::as_str), Some("-"));
        assert!(args.contains(&"44100".to_string()));
    }

    #[test]
    fn ffplay_is_recognised_by_file_stem() {
        assert!(is_ffplay("ffplay"));
        assert!(is_ffplay("/usr/local/bin/ffplay"));
        assert!(is_ffplay("C:/ffmpeg/bin/FFPLAY.exe"));
        assert!(!is_ffplay("mpv"));
        assert!(!is_ffplay("/usr/bin/aplay"));
        assert!(!is_ffplay(""));
    }

    #[test]
    fn cartesia_refuses_players_that_cannot_take_raw_pcm() {
        let err = CartesiaSpeech::new("ck".to_string(), "mpv").err().unwrap();
        assert!(err.to_string().contains("needs ffplay"), "{err}");
        assert!(CartesiaSpeech::new("ck".to_string(), "/opt/ffmpeg/ffplay").is_ok());
    }

    #[test]
    fn deepgram_speech_posts_text_with_token_auth() {
        let s = DeepgramSpeech::new("dg-key".to_string()).unwrap();
        let req = s.request("hello there").build().unwrap();
        assert_eq!(req.method(), reqwest::Method::POST);
        let url = req.url();
        assert_eq!(url.path(), "/v1/speak");
        assert!(url.query().unwrap_or("").contains("model=aura-arcas-en"));
        assert_eq!(req.headers()["authorization"], "Token dg-key");
        let body = req.body().and_then(|b| b.as_bytes()).unwrap();
        let v: serde_json::Value = serde_json::from_slice(body).unwrap();
        assert_eq!(v, json!({"text": "hello there"}));
        assert_eq!(s.file_extension(), "mp3");
    }

    #[test]
    fn local_speech_uses_wav_and_program_specific_flags() {
        let td = tempfile::tempdir().unwrap();
        let out = td.path().join("speech.wav");

        let espeak = LocalSpeech::with_program("espeak");
        let cmd = espeak.command("hi", &out);
        let args: Vec<_> = cmd.get_args().map(|a| a.to_string_lossy().to_string()).collect();
        assert_eq!(args[0], "-w");
        assert_eq!(args.last().map(String::as_str), Some("hi"));
        assert_eq!(espeak.file_extension(), "wav");

        let say = LocalSpeech::with_program("say");
        let args: Vec<_> = say
            .command("hi", &out)
            .get_args()
            .map(|a| a.to_string_lossy().to_string())
            .collect();
        assert!(args.contains(&"--file-format=WAVE".to_string()));
    }

    #[test]
    fn local_speech_reports_missing_program() {
        let td = tempfile::tempdir().unwrap();
        let s = LocalSpeech::with_program("verbi-no-such-synth");
        let err = s.synthesize("hi", &td.path().join("x.wav")).unwrap_err();
        assert!(err.to_string().contains("verbi-no-such-synth"));
    }
}
