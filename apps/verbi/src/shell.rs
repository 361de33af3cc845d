use std::{
    io::Write,
    path::{Path, PathBuf},
    sync::mpsc::{Receiver, RecvTimeoutError},
    time::Duration,
};

use anyhow::{anyhow, Result};
use verbi_core::{AnimationState, Role, StageEvent};
use verbi_engine::{ConversationOrchestrator, TempFiles, UiEvents};
use verbi_observability::trace::now_ms;
use verbi_storage::{
    export::{self, ExportFormat},
    Journal, JournalEntry,
};

const TICK: Duration = Duration::from_millis(50);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellCommand {
    Talk,
    Stop,
    Clear,
    History,
    Export {
        format: ExportFormat,
        path: Option<PathBuf>,
    },
    Help,
    Quit,
}

pub const HELP: &str = "\
commands:
  <Enter> | talk          record one turn
  stop                    cancel the running turn
  clear                   start a new conversation
  history                 print the conversation so far
  export [fmt] [path]     save the conversation (text|markdown|json)
  help                    this list
  quit                    exit";

pub fn parse_command(line: &str) -> Result<ShellCommand> {
    let mut parts = line.split_whitespace();
    let Some(head) = parts.next() else {
        return Ok(ShellCommand::Talk);
    };
    let cmd = match head.to_ascii_lowercase().as_str() {
        "talk" | "t" => ShellCommand::Talk,
        "stop" | "s" => ShellCommand::Stop,
        "clear" => ShellCommand::Clear,
        "history" | "h" => ShellCommand::History,
        "export" => {
            let format = match parts.next() {
                Some(f) => f.parse::<ExportFormat>().map_err(|e| anyhow!("{e}"))?,
                None => ExportFormat::Markdown,
            };
            ShellCommand::Export {
                format,
                path: parts.next().map(PathBuf::from),
            }
        }
        "help" | "?" => ShellCommand::Help,
        "quit" | "exit" | "q" => ShellCommand::Quit,
        other => return Err(anyhow!("unknown command: {other} (try `help`)")),
    };
    Ok(cmd)
}

fn default_export_path(data_dir: &Path, format: ExportFormat) -> PathBuf {
    let stamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
    data_dir
        .join("exports")
        .join(format!("verbi-{stamp}.{}", format.extension()))
}

/// The UI side of the app: owns stdout, the journal and the event receiver,
/// and is the only place that renders worker events.
pub struct Shell<W: Write> {
    orch: ConversationOrchestrator,
    events: UiEvents,
    journal: Option<Journal>,
    temp: TempFiles,
    data_dir: PathBuf,
    session_id: String,
    seq: i64,
    status: String,
    animation: AnimationState,
    out: W,
}

impl<W: Write> Shell<W> {
    pub fn new(
        orch: ConversationOrchestrator,
        events: UiEvents,
        journal: Option<Journal>,
        temp: TempFiles,
        data_dir: &Path,
        out: W,
    ) -> Self {
        Self {
            orch,
            events,
            journal,
            temp,
            data_dir: data_dir.to_path_buf(),
            session_id: uuid::Uuid::new_v4().to_string(),
            seq: 0,
            status: verbi_core::READY_STATUS.to_string(),
            animation: AnimationState::Idle,
            out,
        }
    }

    pub fn status(&self) -> &str {
        &self.status
    }

    pub fn animation(&self) -> AnimationState {
        self.animation
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn into_output(self) -> W {
        self.out
    }

    /// Runs until `quit` or until the input channel closes.
    pub fn run(mut self, input: Receiver<String>) -> Result<()> {
        writeln!(self.out, "Verbi ready. Press Enter to talk, `help` for commands.")?;
        loop {
            self.pump_events()?;
            match input.recv_timeout(TICK) {
                Ok(line) => {
                    if !self.handle_line(&line)? {
                        break;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<()> {
        if self.orch.stop() {
            writeln!(self.out, "stopping current turn...")?;
        }
        if !self.orch.wait_idle(SHUTDOWN_GRACE) {
            tracing::warn!("turn worker still running at exit");
        }
        self.pump_events()?;
        self.temp.cleanup_all();
        writeln!(self.out, "bye")?;
        Ok(())
    }

    /// Renders every queued worker event. Returns how many were handled.
    pub fn pump_events(&mut self) -> Result<usize> {
        let events = self.events.drain();
        let n = events.len();
        for ev in events {
            self.handle_event(ev)?;
        }
        self.out.flush()?;
        Ok(n)
    }

    fn handle_event(&mut self, ev: StageEvent) -> Result<()> {
        match ev {
            StageEvent::StatusChanged(s) => {
                writeln!(self.out, "[{s}]")?;
                self.status = s;
            }
            StageEvent::AnimationChanged(a) => {
                tracing::debug!(animation = a.as_str(), "animation changed");
                self.animation = a;
            }
            StageEvent::MessageAppended { role, text } => {
                let who = match role {
                    Role::User => "You",
                    Role::Assistant => "Verbi",
                    Role::System => "System",
                };
                writeln!(self.out, "{who}: {text}")?;
                self.journal_append(role, text);
            }
            StageEvent::Failed(reason) => {
                writeln!(self.out, "error: {reason}")?;
            }
        }
        Ok(())
    }

    fn journal_append(&mut self, role: Role, content: String) {
        let Some(journal) = &self.journal else {
            return;
        };
        self.seq += 1;
        let entry = JournalEntry {
            session_id: self.session_id.clone(),
            seq: self.seq,
            created_at_ms: now_ms(),
            role,
            content,
        };
        if let Err(e) = journal.append(&entry) {
            tracing::warn!("journal append failed: {e:#}");
        }
    }

    /// Returns `false` when the shell should exit.
    pub fn handle_line(&mut self, line: &str) -> Result<bool> {
        match parse_command(line) {
            Ok(cmd) => self.handle_command(cmd),
            Err(e) => {
                writeln!(self.out, "{e}")?;
                Ok(true)
            }
        }
    }

    fn handle_command(&mut self, cmd: ShellCommand) -> Result<bool> {
        match cmd {
            ShellCommand::Talk => match self.orch.start() {
                Ok(Some(_)) => {}
                Ok(None) => writeln!(self.out, "busy: a turn is already running")?,
                Err(e) => writeln!(self.out, "error: {e:#}")?,
            },
            ShellCommand::Stop => {
                if !self.orch.stop() {
                    writeln!(self.out, "nothing to stop")?;
                }
            }
            ShellCommand::Clear => {
                if self.orch.clear_history() {
                    self.session_id = uuid::Uuid::new_v4().to_string();
                    self.seq = 0;
                    writeln!(self.out, "Chat history cleared")?;
                } else {
                    writeln!(self.out, "cannot clear while a turn is running")?;
                }
            }
            ShellCommand::History => {
                let history = self.orch.history();
                if history.is_fresh() {
                    writeln!(self.out, "(no messages yet)")?;
                }
                for m in history.entries().iter().filter(|m| m.role != Role::System) {
                    writeln!(self.out, "{}: {}", m.role, m.content)?;
                }
            }
            ShellCommand::Export { format, path } => {
                let path = path.unwrap_or_else(|| default_export_path(&self.data_dir, format));
                let history = self.orch.history();
                match export::write_export(&path, history.entries(), format, now_ms()) {
                    Ok(()) => writeln!(self.out, "exported to {}", path.display())?,
                    Err(e) => writeln!(self.out, "export failed: {e}")?,
                }
            }
            ShellCommand::Help => writeln!(self.out, "{HELP}")?,
            ShellCommand::Quit => return Ok(false),
        }
        Ok(true)
    }
}
