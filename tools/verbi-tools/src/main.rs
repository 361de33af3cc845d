use std::{
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use verbi_engine::{
    CallbackSink, CommandPlayer, ConversationOrchestrator, EventSink, FileRecorder, MutePlayer,
    Player, Stages, TempFiles,
};
use verbi_observability::{logging, metrics, trace::now_ms, Tracer};
use verbi_providers::{http, keys, probe, ProbeResult, ProviderConfig, Vendor};
use verbi_storage::{data_dir, settings};

#[derive(Parser)]
#[command(name = "verbi-tools", about = "Verbi developer tools")]
struct Cli {
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check each provider API key against its service
    Probe {
        /// Only this vendor
        #[arg(long)]
        vendor: Option<Vendor>,
        /// One JSON object per line instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Run one full turn from an audio file through the configured providers
    E2e {
        /// Input recording; a generated test tone when omitted
        #[arg(long)]
        audio: Option<PathBuf>,
        /// Play the reply through the configured player
        #[arg(long)]
        play: bool,
        #[arg(long, default_value_t = 180)]
        timeout_secs: u64,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init("info");
    let dir = match cli.data_dir {
        Some(d) => d,
        None => data_dir::data_dir()?,
    };
    match cli.command {
        Commands::Probe { vendor, json } => run_probe(&dir, vendor, json),
        Commands::E2e {
            audio,
            play,
            timeout_secs,
        } => run_e2e(&dir, audio, play, Duration::from_secs(timeout_secs)),
    }
}

fn run_probe(dir: &Path, vendor: Option<Vendor>, json: bool) -> Result<()> {
    let s = settings::load_settings_or_recover(dir);
    let results: Vec<ProbeResult> = match vendor {
        Some(v) => vec![probe::probe(v, keys::resolve_api_key(v, &s))],
        None => probe::probe_all(&s),
    };
    for r in &results {
        if json {
            println!("{}", serde_json::to_string(r)?);
        } else {
            let mark = if r.ok { "ok  " } else { "FAIL" };
            println!("{mark} {:<12} {}", r.provider, r.message);
        }
    }
    let failed = results.iter().filter(|r| !r.ok).count();
    if failed > 0 {
        return Err(anyhow!("{failed} of {} providers failed", results.len()));
    }
    Ok(())
}

/// One second of a 440 Hz sine, 16 kHz mono 16-bit.
fn test_tone(path: &Path) -> Result<()> {
    const RATE: u32 = 16_000;
    let mut pcm = Vec::with_capacity(RATE as usize * 2);
    for i in 0..RATE {
        let t = i as f64 / RATE as f64;
        let v = ((t * 440.0 * std::f64::consts::TAU).sin() * 0.3 * i16::MAX as f64) as i16;
        pcm.extend_from_slice(&v.to_le_bytes());
    }
    std::fs::write(path, http::wav_bytes(&pcm, 1, RATE, 16))
        .with_context(|| format!("write test tone failed: {}", path.display()))
}

#[derive(Debug, Default, Serialize)]
struct E2eReport {
    started_at_ms: i64,
    transcriber: String,
    responder: String,
    synthesizer: String,
    audio: String,
    statuses: Vec<String>,
    transcript: Option<String>,
    reply: Option<String>,
    error: Option<String>,
    elapsed_ms: u64,
}

fn run_e2e(dir: &Path, audio: Option<PathBuf>, play: bool, timeout: Duration) -> Result<()> {
    let s = settings::load_settings_or_recover(dir);
    let cfg = ProviderConfig::from_settings(&s)?;
    let temp = TempFiles::new(data_dir::scratch_dir(dir))?;

    let audio = match audio {
        Some(p) => p,
        None => {
            let p = temp.path_for("tone", "wav");
            test_tone(&p)?;
            p
        }
    };
    let player: Arc<dyn Player> = if play {
        Arc::new(CommandPlayer::new(s.player_program()))
    } else {
        Arc::new(MutePlayer)
    };
    let stages = Stages::new(cfg.build()?, Arc::new(FileRecorder::new(&audio)), player);

    let report = Arc::new(Mutex::new(E2eReport {
        started_at_ms: now_ms(),
        transcriber: cfg.transcriber.to_string(),
        responder: cfg.responder.to_string(),
        synthesizer: cfg.synthesizer.to_string(),
        audio: audio.display().to_string(),
        ..E2eReport::default()
    }));
    let sink: Arc<dyn EventSink> = {
        let (a, b, c) = (report.clone(), report.clone(), report.clone());
        Arc::new(
            CallbackSink::new()
                .on_status(move |st| {
                    println!("[{st}]");
                    if let Ok(mut r) = a.lock() {
                        r.statuses.push(st);
                    }
                })
                .on_message(move |role, text| {
                    println!("{role}: {text}");
                    if let Ok(mut r) = b.lock() {
                        match role {
                            verbi_core::Role::User => r.transcript = Some(text),
                            _ => r.reply = Some(text),
                        }
                    }
                })
                .on_error(move |e| {
                    eprintln!("error: {e}");
                    if let Ok(mut r) = c.lock() {
                        r.error = Some(e);
                    }
                }),
        )
    };

    let orch = ConversationOrchestrator::builder(stages, sink, temp.clone())
        .tracer(Tracer::from_env(dir))
        .metrics_dir(dir)
        .build();
    orch.start()?
        .ok_or_else(|| anyhow!("orchestrator refused to start"))?;
    let finished = orch.wait_idle(timeout);
    if !finished {
        orch.stop();
    }
    temp.cleanup_all();

    let mut r = report
        .lock()
        .map_err(|_| anyhow!("report lock poisoned"))?;
    r.elapsed_ms = (now_ms() - r.started_at_ms).max(0) as u64;
    if !finished {
        r.error = Some(format!("timed out after {}s", timeout.as_secs()));
    }
    let line = serde_json::json!({"type": "e2e_report", "report": &*r});
    metrics::append_best_effort(dir, &line);
    println!("{}", serde_json::to_string_pretty(&*r)?);

    match &r.error {
        Some(e) => Err(anyhow!("e2e failed: {e}")),
        None if r.reply.is_none() => {
            Err(anyhow!("e2e produced no reply (no speech detected in input?)"))
        }
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use verbi_core::StageEvent;

    use super::*;

    #[test]
    fn test_tone_is_one_second_of_pcm() {
        let td = tempfile::tempdir().unwrap();
        let p = td.path().join("tone.wav");
        test_tone(&p).unwrap();
        let bytes = std::fs::read(&p).unwrap();
        assert_eq!(&bytes[..4], b"RIFF");
        assert_eq!(bytes.len(), 44 + 32_000);
    }

    #[test]
    fn statuses_route_into_report() {
        let report = Arc::new(Mutex::new(E2eReport::default()));
        let r2 = report.clone();
        let sink = CallbackSink::new().on_status(move |s| r2.lock().unwrap().statuses.push(s));
        sink.emit(StageEvent::status("Ready"));
        assert_eq!(report.lock().unwrap().statuses, ["Ready"]);
    }
}
