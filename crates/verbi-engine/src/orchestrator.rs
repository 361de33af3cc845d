use std::{
    any::Any,
    panic::{catch_unwind, AssertUnwindSafe},
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, RwLock,
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Result};
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use verbi_core::{
    AnimationState, ConversationHistory, Role, Stage, StageEvent, StageFailure,
    DEFAULT_SYSTEM_PROMPT, READY_STATUS,
};
use verbi_observability::{metrics, Tracer};
use verbi_providers::{Providers, Responder, SpeechOutput, Synthesizer, Transcriber};

use crate::{
    audio::{Player, Recorder},
    sink::EventSink,
    temp_files::TempFiles,
};

pub const STATUS_LISTENING: &str = "Listening...";
pub const STATUS_TRANSCRIBING: &str = "Transcribing...";
pub const STATUS_NO_SPEECH: &str = "No speech detected";
pub const STATUS_THINKING: &str = "Thinking...";
pub const STATUS_SPEAKING: &str = "Speaking...";

/// The five collaborators a turn calls, in order.
#[derive(Clone)]
pub struct Stages {
    pub recorder: Arc<dyn Recorder>,
    pub transcriber: Arc<dyn Transcriber>,
    pub responder: Arc<dyn Responder>,
    pub synthesizer: Arc<dyn Synthesizer>,
    pub player: Arc<dyn Player>,
}

impl Stages {
    pub fn new(providers: Providers, recorder: Arc<dyn Recorder>, player: Arc<dyn Player>) -> Self {
        Self {
            recorder,
            transcriber: providers.transcriber,
            responder: providers.responder,
            synthesizer: providers.synthesizer,
            player,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnOutcome {
    Completed,
    NoSpeech,
    Failed(Stage),
    Cancelled(Stage),
    Crashed,
}

impl TurnOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            TurnOutcome::Completed => "completed",
            TurnOutcome::NoSpeech => "no_speech",
            TurnOutcome::Failed(_) | TurnOutcome::Crashed => "failed",
            TurnOutcome::Cancelled(_) => "cancelled",
        }
    }

    fn stage(self) -> Option<Stage> {
        match self {
            TurnOutcome::Failed(s) | TurnOutcome::Cancelled(s) => Some(s),
            _ => None,
        }
    }
}

struct ActiveTurn {
    turn_id: String,
    token: CancellationToken,
}

/// The most recent turn thread. `settled` flips once the turn has released
/// its slot, which happens before the thread emits its final events and exits.
struct Worker {
    handle: JoinHandle<()>,
    settled: Arc<AtomicBool>,
}

impl Worker {
    fn in_stage(&self) -> bool {
        !self.settled.load(Ordering::Acquire) && !self.handle.is_finished()
    }
}

struct Inner {
    active: Mutex<Option<ActiveTurn>>,
    worker: Mutex<Option<Worker>>,
    history: RwLock<ConversationHistory>,
    stages: Stages,
    sink: Arc<dyn EventSink>,
    temp: TempFiles,
    tracer: Tracer,
    metrics_dir: Option<PathBuf>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Runs one record → transcribe → respond → speak turn at a time on a
/// dedicated worker thread and reports progress through an [`EventSink`].
///
/// Cloning is cheap; clones drive the same turn slot and history.
#[derive(Clone)]
pub struct ConversationOrchestrator {
    inner: Arc<Inner>,
}

pub struct OrchestratorBuilder {
    stages: Stages,
    sink: Arc<dyn EventSink>,
    temp: TempFiles,
    tracer: Tracer,
    metrics_dir: Option<PathBuf>,
    system_prompt: String,
}

impl OrchestratorBuilder {
    pub fn tracer(mut self, tracer: Tracer) -> Self {
        self.tracer = tracer;
        self
    }

    /// Directory that receives `metrics.jsonl` turn summaries.
    pub fn metrics_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.metrics_dir = Some(dir.into());
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn build(self) -> ConversationOrchestrator {
        ConversationOrchestrator {
            inner: Arc::new(Inner {
                active: Mutex::new(None),
                worker: Mutex::new(None),
                history: RwLock::new(ConversationHistory::new(self.system_prompt)),
                stages: self.stages,
                sink: self.sink,
                temp: self.temp,
                tracer: self.tracer,
                metrics_dir: self.metrics_dir,
            }),
        }
    }
}

impl ConversationOrchestrator {
    pub fn builder(stages: Stages, sink: Arc<dyn EventSink>, temp: TempFiles) -> OrchestratorBuilder {
        OrchestratorBuilder {
            stages,
            sink,
            temp,
            tracer: Tracer::disabled(),
            metrics_dir: None,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
        }
    }

    pub fn is_busy(&self) -> bool {
        lock(&self.inner.active).is_some()
    }

    pub fn active_turn_id(&self) -> Option<String> {
        lock(&self.inner.active).as_ref().map(|a| a.turn_id.clone())
    }

    /// True while a stopped turn is still inside the stage it was running.
    fn worker_in_stage(&self) -> bool {
        lock(&self.inner.worker).as_ref().is_some_and(Worker::in_stage)
    }

    /// Starts a turn and returns its id, or `None` when one is already running.
    ///
    /// Safe to call from an [`EventSink`] reacting to "Ready": the previous
    /// thread is joined by the new one, so its last events still come first.
    pub fn start(&self) -> Result<Option<String>> {
        let mut worker = lock(&self.inner.worker);
        {
            let active = lock(&self.inner.active);
            if let Some(a) = active.as_ref() {
                tracing::warn!(turn_id = %a.turn_id, "turn already in progress; start ignored");
                return Ok(None);
            }
        }
        if worker.as_ref().is_some_and(Worker::in_stage) {
            tracing::warn!("previous turn is still finishing its current stage; start ignored");
            return Ok(None);
        }
        let previous = worker.take().map(|w| w.handle);

        let turn_id = Uuid::new_v4().to_string();
        let token = CancellationToken::new();
        *lock(&self.inner.active) = Some(ActiveTurn {
            turn_id: turn_id.clone(),
            token: token.clone(),
        });

        let this = self.clone();
        let id = turn_id.clone();
        let settled = Arc::new(AtomicBool::new(false));
        let flag = settled.clone();
        let spawned = std::thread::Builder::new()
            .name("verbi-turn".to_string())
            .spawn(move || {
                if let Some(prev) = previous {
                    let _ = prev.join();
                }
                this.run_turn(id, token, flag)
            });
        match spawned {
            Ok(handle) => {
                *worker = Some(Worker { handle, settled });
                tracing::info!(turn_id = %turn_id, "turn started");
                Ok(Some(turn_id))
            }
            Err(e) => {
                *lock(&self.inner.active) = None;
                Err(anyhow!("spawn turn worker failed: {e}"))
            }
        }
    }

    /// Cancels the running turn and clears busy at once. The stage already in
    /// flight runs to completion; later stages are skipped.
    pub fn stop(&self) -> bool {
        match lock(&self.inner.active).take() {
            Some(a) => {
                a.token.cancel();
                tracing::info!(turn_id = %a.turn_id, "turn stop requested");
                true
            }
            None => false,
        }
    }

    pub fn history(&self) -> ConversationHistory {
        self.inner
            .history
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Resets the history to the system prompt. Refused while a turn runs.
    pub fn clear_history(&self) -> bool {
        if self.is_busy() || self.worker_in_stage() {
            return false;
        }
        self.inner
            .history
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        tracing::info!("chat history cleared");
        true
    }

    /// Waits until no turn is active and the latest worker thread has exited.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let running = lock(&self.inner.worker)
                .as_ref()
                .is_some_and(|w| !w.handle.is_finished());
            if !self.is_busy() && !running {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    fn emit(&self, ev: StageEvent) {
        self.inner.sink.emit(ev);
    }

    fn run_turn(&self, turn_id: String, token: CancellationToken, settled: Arc<AtomicBool>) {
        let _guard = TurnGuard {
            orch: self,
            turn_id: &turn_id,
            settled,
        };
        let started = Instant::now();
        let mut stage_ms = Map::new();
        let body = catch_unwind(AssertUnwindSafe(|| {
            self.turn_body(&turn_id, &token, &mut stage_ms)
        }));
        let outcome = match body {
            Ok(o) => o,
            Err(p) => {
                let msg = panic_message(p.as_ref());
                tracing::error!(turn_id = %turn_id, "turn crashed: {msg}");
                self.inner.tracer.event(
                    Some(&turn_id),
                    "Turn",
                    "TURN.crash",
                    "err",
                    Some(json!({"message": msg})),
                );
                self.emit(StageEvent::Failed(format!("Conversation error: {msg}")));
                TurnOutcome::Crashed
            }
        };
        self.record_summary(&turn_id, outcome, started.elapsed(), stage_ms);
    }

    fn record_summary(&self, turn_id: &str, outcome: TurnOutcome, total: Duration, stage_ms: Map<String, Value>) {
        let history = self.history();
        let summary = json!({
            "type": "turn_summary",
            "ts_ms": verbi_observability::trace::now_ms(),
            "turn_id": turn_id,
            "outcome": outcome.as_str(),
            "stage": outcome.stage().map(Stage::as_str),
            "total_ms": total.as_millis() as u64,
            "stage_ms": stage_ms,
            "history_len": history.len(),
            "history_digest": history.digest(),
        });
        self.inner.tracer.event(
            Some(turn_id),
            "Turn",
            "TURN.done",
            outcome.as_str(),
            Some(summary.clone()),
        );
        if let Some(dir) = &self.inner.metrics_dir {
            metrics::append_best_effort(dir, &summary);
        }
        tracing::info!(turn_id, outcome = outcome.as_str(), total_ms = total.as_millis() as u64, "turn finished");
    }

    /// Boundary check, announcement and traced execution of one stage.
    #[allow(clippy::too_many_arguments)]
    fn run_stage<T>(
        &self,
        turn_id: &str,
        token: &CancellationToken,
        stage_ms: &mut Map<String, Value>,
        stage: Stage,
        status: &str,
        animation: AnimationState,
        f: impl FnOnce() -> Result<T>,
    ) -> Result<T, TurnOutcome> {
        let step_id = format!("TURN.{}", stage.as_str().to_ascii_lowercase());
        if token.is_cancelled() {
            self.inner
                .tracer
                .event(Some(turn_id), stage.as_str(), &step_id, "cancelled", None);
            tracing::info!(turn_id, stage = stage.as_str(), "turn cancelled before stage");
            return Err(TurnOutcome::Cancelled(stage));
        }
        self.emit(StageEvent::status(status));
        self.emit(StageEvent::AnimationChanged(animation));

        let span = self.inner.tracer.span(Some(turn_id), stage.as_str(), &step_id, None);
        let t0 = Instant::now();
        let r = f();
        stage_ms.insert(stage.as_str().to_string(), json!(t0.elapsed().as_millis() as u64));
        match r {
            Ok(v) => {
                span.ok(None);
                Ok(v)
            }
            Err(e) => {
                span.err_anyhow("stage", stage.error_code(), &e, None);
                let failure = StageFailure::new(stage, format!("{e:#}"));
                tracing::error!(turn_id, "{failure}");
                self.emit(StageEvent::Failed(failure.to_string()));
                Err(TurnOutcome::Failed(stage))
            }
        }
    }

    fn turn_body(
        &self,
        turn_id: &str,
        token: &CancellationToken,
        stage_ms: &mut Map<String, Value>,
    ) -> TurnOutcome {
        match self.turn_stages(turn_id, token, stage_ms) {
            Ok(o) | Err(o) => o,
        }
    }

    fn turn_stages(
        &self,
        turn_id: &str,
        token: &CancellationToken,
        stage_ms: &mut Map<String, Value>,
    ) -> Result<TurnOutcome, TurnOutcome> {
        let stages = &self.inner.stages;
        let mut scratch = self.inner.temp.scope();

        let input = scratch.path_for("input", stages.recorder.file_extension());
        self.run_stage(
            turn_id,
            token,
            stage_ms,
            Stage::Record,
            STATUS_LISTENING,
            AnimationState::Listening,
            || stages.recorder.record(&input),
        )?;

        let transcript = self.run_stage(
            turn_id,
            token,
            stage_ms,
            Stage::Transcribe,
            STATUS_TRANSCRIBING,
            AnimationState::Thinking,
            || stages.transcriber.transcribe(&input),
        )?;
        let transcript = transcript.trim().to_string();
        if transcript.is_empty() {
            tracing::warn!(turn_id, "empty transcription received");
            self.emit(StageEvent::status(STATUS_NO_SPEECH));
            return Ok(TurnOutcome::NoSpeech);
        }

        let reply = self.run_stage(
            turn_id,
            token,
            stage_ms,
            Stage::Respond,
            STATUS_THINKING,
            AnimationState::Thinking,
            || {
                let snapshot = {
                    let mut h = self.inner.history.write().unwrap_or_else(|e| e.into_inner());
                    h.push_user(transcript.clone());
                    h.entries().to_vec()
                };
                self.emit(StageEvent::MessageAppended {
                    role: Role::User,
                    text: transcript.clone(),
                });
                let reply = stages.responder.respond(&snapshot)?;
                self.inner
                    .history
                    .write()
                    .unwrap_or_else(|e| e.into_inner())
                    .push_assistant(reply.clone());
                self.emit(StageEvent::MessageAppended {
                    role: Role::Assistant,
                    text: reply.clone(),
                });
                Ok(reply)
            },
        )?;

        let speech_path = scratch.path_for("speech", stages.synthesizer.file_extension());
        self.run_stage(
            turn_id,
            token,
            stage_ms,
            Stage::Speak,
            STATUS_SPEAKING,
            AnimationState::Speaking,
            || match stages.synthesizer.synthesize(&reply, &speech_path)? {
                SpeechOutput::File(p) => stages.player.play(&p),
                SpeechOutput::Streamed => {
                    self.inner
                        .tracer
                        .span(Some(turn_id), Stage::Speak.as_str(), "TURN.play", None)
                        .skipped("synthesizer already played the audio", None);
                    Ok(())
                }
            },
        )?;

        Ok(TurnOutcome::Completed)
    }
}

/// Clears the active slot (if it still belongs to this turn), marks the
/// worker settled and then emits the terminal events, on every exit path.
struct TurnGuard<'a> {
    orch: &'a ConversationOrchestrator,
    turn_id: &'a str,
    settled: Arc<AtomicBool>,
}

impl Drop for TurnGuard<'_> {
    fn drop(&mut self) {
        {
            let mut g = lock(&self.orch.inner.active);
            if g.as_ref().map(|a| a.turn_id.as_str()) == Some(self.turn_id) {
                *g = None;
            }
        }
        self.settled.store(true, Ordering::Release);
        self.orch.emit(StageEvent::status(READY_STATUS));
        self.orch.emit(StageEvent::AnimationChanged(AnimationState::Idle));
    }
}

fn panic_message(p: &(dyn Any + Send)) -> String {
    if let Some(s) = p.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = p.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        path::Path,
        sync::{Condvar, OnceLock},
    };

    use super::*;

    type Reply = Box<dyn Fn() -> Result<String> + Send + Sync>;

    #[derive(Default)]
    struct Gate {
        open: Mutex<bool>,
        cv: Condvar,
        entered: Mutex<bool>,
        entered_cv: Condvar,
    }

    impl Gate {
        fn pass(&self) {
            *self.entered.lock().unwrap() = true;
            self.entered_cv.notify_all();
            let mut open = self.open.lock().unwrap();
            while !*open {
                open = self.cv.wait(open).unwrap();
            }
        }

        fn wait_entered(&self) {
            let mut e = self.entered.lock().unwrap();
            while !*e {
                e = self.entered_cv.wait(e).unwrap();
            }
        }

        fn open(&self) {
            *self.open.lock().unwrap() = true;
            self.cv.notify_all();
        }
    }

    struct FakeRecorder {
        calls: Mutex<usize>,
        gate: Option<Arc<Gate>>,
    }

    impl Recorder for FakeRecorder {
        fn name(&self) -> &'static str {
            "fake"
        }

        fn record(&self, output: &Path) -> Result<()> {
            *self.calls.lock().unwrap() += 1;
            if let Some(g) = &self.gate {
                g.pass();
            }
            std::fs::write(output, b"RIFF")?;
            Ok(())
        }
    }

    struct FakeTranscriber(Reply);

    impl Transcriber for FakeTranscriber {
        fn name(&self) -> &'static str {
            "fake"
        }

        fn transcribe(&self, audio: &Path) -> Result<String> {
            assert!(audio.exists(), "recording should exist during transcription");
            (self.0)()
        }
    }

    struct FakeResponder {
        reply: Reply,
        seen: Mutex<Vec<Vec<verbi_core::Message>>>,
        gate: Option<Arc<Gate>>,
    }

    impl Responder for FakeResponder {
        fn name(&self) -> &'static str {
            "fake"
        }

        fn respond(&self, history: &[verbi_core::Message]) -> Result<String> {
            self.seen.lock().unwrap().push(history.to_vec());
            if let Some(g) = &self.gate {
                g.pass();
            }
            (self.reply)()
        }
    }

    struct FakeSynth {
        streamed: bool,
        spoken: Mutex<Vec<String>>,
    }

    impl Synthesizer for FakeSynth {
        fn name(&self) -> &'static str {
            "fake"
        }

        fn file_extension(&self) -> &'static str {
            "mp3"
        }

        fn synthesize(&self, text: &str, output: &Path) -> Result<SpeechOutput> {
            self.spoken.lock().unwrap().push(text.to_string());
            if self.streamed {
                return Ok(SpeechOutput::Streamed);
            }
            std::fs::write(output, b"ID3")?;
            Ok(SpeechOutput::File(output.to_path_buf()))
        }
    }

    #[derive(Default)]
    struct FakePlayer {
        played: Mutex<Vec<PathBuf>>,
    }

    impl Player for FakePlayer {
        fn play(&self, path: &Path) -> Result<()> {
            assert!(path.exists());
            self.played.lock().unwrap().push(path.to_path_buf());
            Ok(())
        }
    }

    /// Records events; on "Ready" it also records whether the orchestrator was
    /// busy and, while `starts_on_ready` is positive, starts the next turn.
    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<StageEvent>>,
        busy_at_ready: Mutex<Vec<bool>>,
        starts_on_ready: Mutex<usize>,
        started_on_ready: Mutex<Vec<Option<String>>>,
        orch: OnceLock<std::sync::Weak<Inner>>,
    }

    impl EventSink for RecordingSink {
        fn emit(&self, event: StageEvent) {
            let terminal = event.is_terminal_status();
            let inner = self.orch.get().and_then(|w| w.upgrade());
            if terminal {
                if let Some(inner) = &inner {
                    let busy = lock(&inner.active).is_some();
                    self.busy_at_ready.lock().unwrap().push(busy);
                }
            }
            self.events.lock().unwrap().push(event);

            if !terminal {
                return;
            }
            let mut pending = self.starts_on_ready.lock().unwrap();
            if *pending > 0 {
                *pending -= 1;
                drop(pending);
                if let Some(inner) = inner {
                    let orch = ConversationOrchestrator { inner };
                    let id = orch.start().unwrap();
                    self.started_on_ready.lock().unwrap().push(id);
                }
            }
        }
    }

    impl RecordingSink {
        fn events(&self) -> Vec<StageEvent> {
            self.events.lock().unwrap().clone()
        }

        fn failures(&self) -> Vec<String> {
            self.events()
                .into_iter()
                .filter_map(|e| match e {
                    StageEvent::Failed(s) => Some(s),
                    _ => None,
                })
                .collect()
        }

        fn statuses(&self) -> Vec<String> {
            self.events()
                .into_iter()
                .filter_map(|e| match e {
                    StageEvent::StatusChanged(s) => Some(s),
                    _ => None,
                })
                .collect()
        }
    }

    struct Harness {
        orch: ConversationOrchestrator,
        sink: Arc<RecordingSink>,
        recorder: Arc<FakeRecorder>,
        responder: Arc<FakeResponder>,
        synth: Arc<FakeSynth>,
        player: Arc<FakePlayer>,
        temp: TempFiles,
        _td: tempfile::TempDir,
    }

    fn ok(s: &'static str) -> Reply {
        Box::new(move || -> Result<String> { Ok(s.to_string()) })
    }

    fn fail(s: &'static str) -> Reply {
        Box::new(move || -> Result<String> { Err(anyhow!(s)) })
    }

    fn harness_with(
        transcript: Reply,
        reply: Reply,
        streamed: bool,
        gate: Option<Arc<Gate>>,
    ) -> Harness {
        gated_harness(transcript, reply, streamed, gate, None)
    }

    fn gated_harness(
        transcript: Reply,
        reply: Reply,
        streamed: bool,
        record_gate: Option<Arc<Gate>>,
        respond_gate: Option<Arc<Gate>>,
    ) -> Harness {
        let td = tempfile::tempdir().unwrap();
        let temp = TempFiles::new(td.path().join("tmp")).unwrap();
        let sink = Arc::new(RecordingSink::default());
        let recorder = Arc::new(FakeRecorder {
            calls: Mutex::new(0),
            gate: record_gate,
        });
        let responder = Arc::new(FakeResponder {
            reply,
            seen: Mutex::new(Vec::new()),
            gate: respond_gate,
        });
        let synth = Arc::new(FakeSynth {
            streamed,
            spoken: Mutex::new(Vec::new()),
        });
        let player = Arc::new(FakePlayer::default());
        let stages = Stages {
            recorder: recorder.clone(),
            transcriber: Arc::new(FakeTranscriber(transcript)),
            responder: responder.clone(),
            synthesizer: synth.clone(),
            player: player.clone(),
        };
        let orch = ConversationOrchestrator::builder(stages, sink.clone(), temp.clone())
            .tracer(Tracer::new(td.path(), verbi_observability::TraceConfig::default()))
            .metrics_dir(td.path())
            .build();
        let _ = sink.orch.set(Arc::downgrade(&orch.inner));
        Harness {
            orch,
            sink,
            recorder,
            responder,
            synth,
            player,
            temp,
            _td: td,
        }
    }

    fn harness(transcript: Reply, reply: Reply) -> Harness {
        harness_with(transcript, reply, false, None)
    }

    fn run_one(h: &Harness) {
        assert!(!h.orch.is_busy());
        assert!(h.orch.start().unwrap().is_some());
        assert!(h.orch.wait_idle(Duration::from_secs(5)));
    }

    fn assert_ends_ready_idle(h: &Harness) {
        let ev = h.sink.events();
        let n = ev.len();
        assert!(n >= 2);
        assert_eq!(ev[n - 2], StageEvent::status("Ready"));
        assert_eq!(ev[n - 1], StageEvent::AnimationChanged(AnimationState::Idle));
        assert_eq!(*h.sink.busy_at_ready.lock().unwrap(), vec![false]);
        assert!(!h.orch.is_busy());
    }

    #[test]
    fn full_turn_appends_user_then_assistant_and_speaks_reply() {
        let h = harness(ok("Hi"), ok("Hello!"));
        run_one(&h);

        let entries = h.orch.history().entries().to_vec();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].role, Role::System);
        assert_eq!(entries[1], verbi_core::Message::new(Role::User, "Hi"));
        assert_eq!(entries[2], verbi_core::Message::new(Role::Assistant, "Hello!"));

        // Responder saw system + user only.
        let seen = h.responder.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].len(), 2);

        assert_eq!(*h.synth.spoken.lock().unwrap(), vec!["Hello!".to_string()]);
        assert_eq!(h.player.played.lock().unwrap().len(), 1);

        assert_eq!(
            h.sink.statuses(),
            ["Listening...", "Transcribing...", "Thinking...", "Speaking...", "Ready"]
        );
        let ev = h.sink.events();
        assert_eq!(ev[1], StageEvent::AnimationChanged(AnimationState::Listening));
        assert!(ev.contains(&StageEvent::MessageAppended {
            role: Role::Assistant,
            text: "Hello!".to_string()
        }));
        assert!(h.sink.failures().is_empty());
        assert_ends_ready_idle(&h);
    }

    #[test]
    fn empty_transcript_ends_turn_without_touching_history() {
        let h = harness(ok("   "), ok("unused"));
        run_one(&h);

        assert!(h.orch.history().is_fresh());
        assert!(h.responder.seen.lock().unwrap().is_empty());
        assert!(h.synth.spoken.lock().unwrap().is_empty());
        assert!(h.sink.failures().is_empty());
        assert!(h.sink.statuses().contains(&"No speech detected".to_string()));
        assert_ends_ready_idle(&h);
    }

    #[test]
    fn transcription_error_is_reported_with_stage_prefix() {
        let h = harness(fail("401 Unauthorized"), ok("unused"));
        let before = h.orch.history();
        run_one(&h);

        assert_eq!(h.sink.failures(), ["Transcription failed: 401 Unauthorized"]);
        assert_eq!(h.orch.history(), before);
        assert!(h.responder.seen.lock().unwrap().is_empty());
        assert_ends_ready_idle(&h);
    }

    #[test]
    fn respond_error_keeps_user_entry_only() {
        let h = harness(ok("Hi"), fail("quota exceeded"));
        run_one(&h);

        let entries = h.orch.history().entries().to_vec();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].role, Role::User);
        assert_eq!(h.sink.failures(), ["Response generation failed: quota exceeded"]);
        assert!(h.synth.spoken.lock().unwrap().is_empty());
        assert_ends_ready_idle(&h);
    }

    #[test]
    fn start_while_busy_is_a_no_op() {
        let gate = Arc::new(Gate::default());
        let h = harness_with(ok("Hi"), ok("Hello!"), false, Some(gate.clone()));

        let first = h.orch.start().unwrap();
        assert!(first.is_some());
        gate.wait_entered();
        assert!(h.orch.is_busy());
        assert_eq!(h.orch.active_turn_id(), first);

        assert_eq!(h.orch.start().unwrap(), None);
        assert!(h.orch.history().is_fresh());
        assert!(!h.orch.clear_history());

        gate.open();
        assert!(h.orch.wait_idle(Duration::from_secs(5)));
        assert_eq!(*h.recorder.calls.lock().unwrap(), 1);
        assert_eq!(h.orch.history().len(), 3);
        assert_ends_ready_idle(&h);
    }

    #[test]
    fn stop_skips_remaining_stages_and_clears_busy() {
        let gate = Arc::new(Gate::default());
        let h = harness_with(ok("Hi"), ok("Hello!"), false, Some(gate.clone()));

        h.orch.start().unwrap();
        gate.wait_entered();
        assert!(h.orch.stop());
        assert!(!h.orch.is_busy());
        assert!(!h.orch.stop());
        // Worker is still inside the record stage.
        assert_eq!(h.orch.start().unwrap(), None);

        gate.open();
        assert!(h.orch.wait_idle(Duration::from_secs(5)));
        assert!(h.orch.history().is_fresh());
        assert!(h.sink.failures().is_empty());
        assert!(!h.sink.statuses().contains(&"Transcribing...".to_string()));
        assert_ends_ready_idle(&h);

        let raw = std::fs::read_to_string(metrics::metrics_path(h._td.path())).unwrap();
        assert!(raw.contains(r#""outcome":"cancelled""#));
    }

    #[test]
    fn stop_while_responding_keeps_reply_but_skips_speech() {
        let gate = Arc::new(Gate::default());
        let h = gated_harness(ok("Hi"), ok("Hello!"), false, None, Some(gate.clone()));

        h.orch.start().unwrap();
        gate.wait_entered();
        assert!(h.orch.stop());
        assert!(!h.orch.is_busy());

        gate.open();
        assert!(h.orch.wait_idle(Duration::from_secs(5)));
        let entries = h.orch.history().entries().to_vec();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[2], verbi_core::Message::new(Role::Assistant, "Hello!"));
        assert!(h.synth.spoken.lock().unwrap().is_empty());
        assert!(h.player.played.lock().unwrap().is_empty());
        assert!(h.sink.failures().is_empty());
        assert!(!h.sink.statuses().contains(&"Speaking...".to_string()));
        assert_ends_ready_idle(&h);

        let raw = std::fs::read_to_string(metrics::metrics_path(h._td.path())).unwrap();
        let v: Value = serde_json::from_str(raw.lines().last().unwrap()).unwrap();
        assert_eq!(v["outcome"], "cancelled");
        assert_eq!(v["stage"], "Speak");
        assert_eq!(v["history_len"], 3);
    }

    #[test]
    fn start_from_ready_callback_begins_next_turn() {
        let h = harness(ok("Hi"), ok("Hello!"));
        *h.sink.starts_on_ready.lock().unwrap() = 1;

        assert!(h.orch.start().unwrap().is_some());
        let deadline = Instant::now() + Duration::from_secs(5);
        while h.sink.statuses().iter().filter(|s| *s == "Ready").count() < 2 {
            assert!(Instant::now() < deadline, "second turn never finished");
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(h.orch.wait_idle(Duration::from_secs(5)));

        let started = h.sink.started_on_ready.lock().unwrap().clone();
        assert_eq!(started.len(), 1);
        assert!(started[0].is_some());
        assert_eq!(*h.recorder.calls.lock().unwrap(), 2);
        assert_eq!(h.orch.history().len(), 5);
        assert_eq!(*h.sink.busy_at_ready.lock().unwrap(), vec![false, false]);

        // The first turn's Ready/Idle pair precedes the second turn's events.
        let ev = h.sink.events();
        let first_ready = ev
            .iter()
            .position(|e| *e == StageEvent::status("Ready"))
            .unwrap();
        assert_eq!(ev[first_ready + 1], StageEvent::AnimationChanged(AnimationState::Idle));
        assert_eq!(ev[first_ready + 2], StageEvent::status("Listening..."));
        assert_eq!(ev.last(), Some(&StageEvent::AnimationChanged(AnimationState::Idle)));
    }

    #[test]
    fn streamed_speech_skips_playback() {
        let h = harness_with(ok("Hi"), ok("Hello!"), true, None);
        run_one(&h);
        assert_eq!(h.synth.spoken.lock().unwrap().len(), 1);
        assert!(h.player.played.lock().unwrap().is_empty());
        assert_ends_ready_idle(&h);

        let raw = std::fs::read_to_string(h.orch.inner.tracer.path()).unwrap();
        let play_end = raw
            .lines()
            .map(|l| serde_json::from_str::<Value>(l).unwrap())
            .find(|v| v["step_id"] == "TURN.play" && v["op"] == "end")
            .expect("play span should be closed");
        assert_eq!(play_end["status"], "skipped");
        assert_eq!(play_end["error"]["code"], "SKIPPED");
    }

    #[test]
    fn clear_history_is_idempotent_and_keeps_system_prompt() {
        let h = harness(ok("Hi"), ok("Hello!"));
        run_one(&h);
        assert_eq!(h.orch.history().len(), 3);

        assert!(h.orch.clear_history());
        assert!(h.orch.clear_history());
        let hist = h.orch.history();
        assert!(hist.is_fresh());
        assert_eq!(hist.entries()[0].role, Role::System);
        assert_eq!(hist.entries()[0].content, DEFAULT_SYSTEM_PROMPT);
    }

    #[test]
    fn turn_scratch_files_are_removed() {
        let h = harness(ok("Hi"), ok("Hello!"));
        run_one(&h);
        assert!(h.temp.tracked().is_empty());
        assert_eq!(std::fs::read_dir(h.temp.dir()).unwrap().count(), 0);
    }

    #[test]
    fn panicking_stage_still_resets_busy() {
        let h = harness(
            Box::new(|| -> Result<String> { panic!("decoder exploded") }),
            ok("unused"),
        );
        run_one(&h);
        assert_eq!(h.sink.failures(), ["Conversation error: decoder exploded"]);
        assert_ends_ready_idle(&h);
        // A new turn can start afterwards.
        assert!(h.orch.start().unwrap().is_some());
        assert!(h.orch.wait_idle(Duration::from_secs(5)));
    }

    #[test]
    fn turn_summary_is_written_to_metrics() {
        let h = harness(ok("Hi"), ok("Hello!"));
        run_one(&h);
        let raw = std::fs::read_to_string(metrics::metrics_path(h._td.path())).unwrap();
        let v: Value = serde_json::from_str(raw.lines().last().unwrap()).unwrap();
        assert_eq!(v["type"], "turn_summary");
        assert_eq!(v["outcome"], "completed");
        assert_eq!(v["history_len"], 3);
        for s in ["Record", "Transcribe", "Respond", "Speak"] {
            assert!(v["stage_ms"].get(s).is_some(), "missing {s}");
        }
    }
}
