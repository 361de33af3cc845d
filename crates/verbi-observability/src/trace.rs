use std::{
    fs::OpenOptions,
    io::Write,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::{Instant, SystemTime, UNIX_EPOCH},
};

use anyhow::Error as AnyhowError;
use serde::Serialize;
use serde_json::Value;

const DEFAULT_TRACE_MAX_BYTES: u64 = 10_000_000; // 10MB
const DEFAULT_TRACE_MAX_FILES: usize = 5;
const DEFAULT_BACKTRACE_MAX_CHARS: usize = 12_000;
const TRACE_FILE: &str = "trace.jsonl";

pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

pub(crate) fn env_flag(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => {
            let t = v.trim().to_ascii_lowercase();
            match t.as_str() {
                "0" | "false" | "no" | "off" => false,
                "1" | "true" | "yes" | "on" => true,
                _ => default,
            }
        }
        Err(_) => default,
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

#[derive(Debug, Clone)]
pub struct TraceConfig {
    pub enabled: bool,
    pub backtrace: bool,
    pub max_bytes: u64,
    pub max_files: usize,
}

impl TraceConfig {
    /// `VERBI_TRACE_ENABLED`, `VERBI_TRACE_BACKTRACE`, `VERBI_TRACE_MAX_BYTES`,
    /// `VERBI_TRACE_MAX_FILES`. Tracing and backtraces default to on.
    pub fn from_env() -> Self {
        Self {
            enabled: env_flag("VERBI_TRACE_ENABLED", true),
            backtrace: env_flag("VERBI_TRACE_BACKTRACE", true),
            max_bytes: env_parse("VERBI_TRACE_MAX_BYTES", DEFAULT_TRACE_MAX_BYTES),
            max_files: env_parse("VERBI_TRACE_MAX_FILES", DEFAULT_TRACE_MAX_FILES),
        }
    }
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            backtrace: false,
            max_bytes: DEFAULT_TRACE_MAX_BYTES,
            max_files: DEFAULT_TRACE_MAX_FILES,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TraceError {
    pub kind: String,    // http|io|process|logic|parse|provider|unknown
    pub code: String,    // E_* | HTTP_401
    pub message: String, // short
}

#[derive(Debug, Clone, Serialize)]
pub struct TraceEvent {
    pub ts_ms: i64,
    pub turn_id: Option<String>,
    pub stage: String,
    pub step_id: String,
    pub op: String,     // start|end|event
    pub status: String, // ok|err|skipped|aborted
    pub duration_ms: Option<u128>,
    pub error: Option<TraceError>,
    pub ctx: Option<Value>,
}

struct TracerInner {
    dir: PathBuf,
    cfg: TraceConfig,
    write_lock: Mutex<()>,
}

/// Append-only JSONL trace owned by whoever constructs it.
///
/// Clones share the file and the write lock, so lines from concurrent
/// writers never interleave.
#[derive(Clone)]
pub struct Tracer {
    inner: Arc<TracerInner>,
}

impl std::fmt::Debug for Tracer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tracer")
            .field("dir", &self.inner.dir)
            .field("enabled", &self.inner.cfg.enabled)
            .finish()
    }
}

impl Tracer {
    pub fn new(dir: &Path, cfg: TraceConfig) -> Self {
        Self {
            inner: Arc::new(TracerInner {
                dir: dir.to_path_buf(),
                cfg,
                write_lock: Mutex::new(()),
            }),
        }
    }

    pub fn from_env(dir: &Path) -> Self {
        Self::new(dir, TraceConfig::from_env())
    }

    pub fn disabled() -> Self {
        Self::new(
            Path::new(""),
            TraceConfig {
                enabled: false,
                ..TraceConfig::default()
            },
        )
    }

    pub fn enabled(&self) -> bool {
        self.inner.cfg.enabled
    }

    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }

    pub fn path(&self) -> PathBuf {
        self.inner.dir.join(TRACE_FILE)
    }

    pub fn event(
        &self,
        turn_id: Option<&str>,
        stage: &str,
        step_id: &str,
        status: &str,
        ctx: Option<Value>,
    ) {
        self.emit(&TraceEvent {
            ts_ms: now_ms(),
            turn_id: turn_id.map(|s| s.to_string()),
            stage: stage.to_string(),
            step_id: step_id.to_string(),
            op: "event".to_string(),
            status: status.to_string(),
            duration_ms: None,
            error: None,
            ctx,
        });
    }

    pub fn span(
        &self,
        turn_id: Option<&str>,
        stage: &str,
        step_id: &str,
        ctx: Option<Value>,
    ) -> Span {
        Span::start(self, turn_id, stage, step_id, ctx)
    }

    fn emit(&self, ev: &TraceEvent) {
        if !self.enabled() {
            return;
        }
        let _guard = self
            .inner
            .write_lock
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let _ = std::fs::create_dir_all(&self.inner.dir);
        self.rotate_if_needed();

        let p = self.path();
        let mut f = match OpenOptions::new().create(true).append(true).open(&p) {
            Ok(f) => f,
            Err(e) => {
                tracing::warn!("trace: open failed: {}: {e}", p.display());
                return;
            }
        };
        let mut line = match serde_json::to_string(ev) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!("trace: serialize failed: {e}");
                return;
            }
        };
        line.push('\n');
        if let Err(e) = f.write_all(line.as_bytes()) {
            tracing::warn!("trace: write failed: {e}");
        }
    }

    fn rotate_if_needed(&self) {
        let cfg = &self.inner.cfg;
        if cfg.max_files == 0 {
            return;
        }
        let p = self.path();
        let len = match std::fs::metadata(&p) {
            Ok(m) => m.len(),
            Err(_) => return,
        };
        if len <= cfg.max_bytes {
            return;
        }

        let dir = &self.inner.dir;
        let rotated = |i: usize| dir.join(format!("{TRACE_FILE}.{i}"));
        // Drop the oldest first so renames never land on an existing file.
        let _ = std::fs::remove_file(rotated(cfg.max_files));
        for i in (1..cfg.max_files).rev() {
            let src = rotated(i);
            if src.exists() {
                let _ = std::fs::rename(&src, rotated(i + 1));
            }
        }
        let _ = std::fs::rename(&p, rotated(1));
    }

    fn backtrace_string(&self) -> Option<String> {
        if !self.inner.cfg.backtrace {
            return None;
        }
        let bt = std::backtrace::Backtrace::force_capture();
        Some(clamp_chars(
            &redact_user_paths(&format!("{bt:?}")),
            DEFAULT_BACKTRACE_MAX_CHARS,
        ))
    }

    fn error_ctx(&self, err: Option<&AnyhowError>, extra: Option<Value>) -> Option<Value> {
        let mut m = serde_json::Map::new();
        if let Some(err) = err {
            let chain: Vec<String> = err.chain().map(|e| e.to_string()).collect();
            m.insert("err_chain".to_string(), serde_json::json!(chain));
        }
        if let Some(bt) = self.backtrace_string() {
            m.insert("backtrace".to_string(), serde_json::json!(bt));
        }
        if m.is_empty() {
            return extra;
        }
        Some(merge_ctx(m, extra))
    }
}

fn clamp_chars(s: &str, max_chars: usize) -> String {
    s.chars().filter(|c| *c != '\0').take(max_chars).collect()
}

/// Scrubs the user-name segment of home-directory paths.
pub fn redact_user_paths(s: &str) -> String {
    fn scrub_after(hay: &str, marker: &str, sep: char) -> String {
        let mut out = String::with_capacity(hay.len());
        let mut rest = hay;
        while let Some(pos) = rest.find(marker) {
            out.push_str(&rest[..pos + marker.len()]);
            out.push_str("<redacted>");
            let after = &rest[pos + marker.len()..];
            let end = after.find(sep).unwrap_or(after.len());
            rest = &after[end..];
        }
        out.push_str(rest);
        out
    }

    let t = scrub_after(s, "\\Users\\", '\\');
    let t = scrub_after(&t, "/Users/", '/');
    scrub_after(&t, "/home/", '/')
}

fn merge_ctx(base: serde_json::Map<String, Value>, extra: Option<Value>) -> Value {
    let mut out = base;
    match extra {
        None => {}
        Some(Value::Object(m)) => out.extend(m),
        Some(v) => {
            out.insert("extra".to_string(), v);
        }
    }
    Value::Object(out)
}

/// A timed step. Ends with `ok`, `skipped` or `err`; a span dropped without
/// one of those is recorded as `aborted`.
pub struct Span {
    tracer: Tracer,
    turn_id: Option<String>,
    stage: String,
    step_id: String,
    t0: Instant,
    finished: bool,
}

impl Span {
    pub fn start(
        tracer: &Tracer,
        turn_id: Option<&str>,
        stage: &str,
        step_id: &str,
        ctx: Option<Value>,
    ) -> Self {
        tracing::debug!(turn_id, stage, step_id, "span start");
        tracer.emit(&TraceEvent {
            ts_ms: now_ms(),
            turn_id: turn_id.map(|s| s.to_string()),
            stage: stage.to_string(),
            step_id: step_id.to_string(),
            op: "start".to_string(),
            status: "ok".to_string(),
            duration_ms: None,
            error: None,
            ctx,
        });
        Self {
            tracer: tracer.clone(),
            turn_id: turn_id.map(|s| s.to_string()),
            stage: stage.to_string(),
            step_id: step_id.to_string(),
            t0: Instant::now(),
            finished: false,
        }
    }

    pub fn elapsed_ms(&self) -> u128 {
        self.t0.elapsed().as_millis()
    }

    fn end(&mut self, status: &str, error: Option<TraceError>, ctx: Option<Value>) {
        self.finished = true;
        self.tracer.emit(&TraceEvent {
            ts_ms: now_ms(),
            turn_id: self.turn_id.clone(),
            stage: self.stage.clone(),
            step_id: self.step_id.clone(),
            op: "end".to_string(),
            status: status.to_string(),
            duration_ms: Some(self.elapsed_ms()),
            error,
            ctx,
        });
    }

    pub fn ok(mut self, ctx: Option<Value>) {
        self.end("ok", None, ctx);
    }

    pub fn skipped(mut self, reason: &str, ctx: Option<Value>) {
        let error = TraceError {
            kind: "logic".to_string(),
            code: "SKIPPED".to_string(),
            message: reason.to_string(),
        };
        self.end("skipped", Some(error), ctx);
    }

    pub fn err(mut self, kind: &str, code: &str, message: &str, ctx: Option<Value>) {
        tracing::warn!(step_id = %self.step_id, code, "{message}");
        let error = TraceError {
            kind: kind.to_string(),
            code: code.to_string(),
            message: message.to_string(),
        };
        let ctx = self.tracer.error_ctx(None, ctx);
        self.end("err", Some(error), ctx);
    }

    pub fn err_anyhow(mut self, kind: &str, code: &str, err: &AnyhowError, ctx: Option<Value>) {
        tracing::warn!(step_id = %self.step_id, code, "{err:#}");
        let error = TraceError {
            kind: kind.to_string(),
            code: code.to_string(),
            message: err.to_string(),
        };
        let ctx = self.tracer.error_ctx(Some(err), ctx);
        self.end("err", Some(error), ctx);
    }
}

impl Drop for Span {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let error = TraceError {
            kind: "logic".to_string(),
            code: "ABORTED".to_string(),
            message: "span dropped without explicit ok/err".to_string(),
        };
        let ctx = self.tracer.error_ctx(None, None);
        self.end("aborted", Some(error), ctx);
    }
}
