mod shell;

use std::{
    io::{BufRead, Write},
    path::{Path, PathBuf},
    sync::{mpsc, Arc},
};

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use verbi_engine::{ui_channel, CommandPlayer, CommandRecorder, ConversationOrchestrator, Stages, TempFiles};
use verbi_observability::{logging, panic_log, trace::now_ms, Tracer};
use verbi_providers::{keys, ProviderConfig, Vendor};
use verbi_storage::{
    data_dir,
    export::{self, ExportFormat},
    history::entries_to_messages,
    settings, Journal,
};

use crate::shell::Shell;

#[derive(Parser)]
#[command(name = "verbi", about = "Verbi: talk to a language model out loud", version)]
struct Cli {
    /// Data directory (defaults to $VERBI_DATA_DIR or ~/.verbi)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the interactive voice shell (default)
    Run,

    /// Show or change settings.json
    Settings {
        #[command(subcommand)]
        action: SettingsCmd,
    },

    /// Manage provider API keys in the OS keyring
    Keys {
        #[command(subcommand)]
        action: KeysCmd,
    },

    /// Browse and export past conversations
    Sessions {
        #[command(subcommand)]
        action: SessionsCmd,
    },
}

#[derive(Subcommand)]
enum SettingsCmd {
    /// Print effective settings with keys masked
    Show,
    /// Set one or more values, e.g. `tts_model=local`. An empty value resets a key.
    Set {
        #[arg(required = true)]
        assignments: Vec<String>,
    },
    /// Print the settings file location
    Path,
    /// Check that the selected providers can be built
    Validate,
}

#[derive(Subcommand)]
enum KeysCmd {
    /// Store a key; reads it from stdin when --key is omitted
    Set {
        vendor: Vendor,
        #[arg(long)]
        key: Option<String>,
    },
    /// Forget a stored key
    Clear { vendor: Vendor },
    /// Where each vendor's key would come from
    Status,
}

#[derive(Subcommand)]
enum SessionsCmd {
    /// Most recent conversations first
    List {
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    /// Write one conversation to a file
    Export {
        session_id: String,
        #[arg(long, default_value = "markdown")]
        format: ExportFormat,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Delete every journaled conversation
    Clear,
}

fn resolve_data_dir(arg: Option<PathBuf>) -> Result<PathBuf> {
    let dir = match arg {
        Some(d) => d,
        None => data_dir::data_dir()?,
    };
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("create data dir failed: {}", dir.display()))?;
    Ok(dir)
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init("info");
    let dir = resolve_data_dir(cli.data_dir)?;
    panic_log::install_best_effort(&dir);

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_shell(&dir),
        Commands::Settings { action } => settings_cmd(&dir, action),
        Commands::Keys { action } => keys_cmd(&dir, action),
        Commands::Sessions { action } => sessions_cmd(&dir, action),
    }
}

fn spawn_stdin_reader() -> Result<mpsc::Receiver<String>> {
    let (tx, rx) = mpsc::channel();
    std::thread::Builder::new()
        .name("verbi-stdin".to_string())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                let Ok(line) = line else { break };
                if tx.send(line).is_err() {
                    break;
                }
            }
        })
        .context("spawn stdin reader failed")?;
    Ok(rx)
}

fn run_shell(dir: &Path) -> Result<()> {
    let settings = settings::load_settings_or_recover(dir);
    let cfg = ProviderConfig::from_settings(&settings).map_err(|e| {
        anyhow!("{e}\nfix with `verbi settings set key=value` or `verbi keys set <vendor>`")
    })?;
    let providers = cfg.build()?;

    let tracer = Tracer::from_env(dir);
    let temp = TempFiles::new(data_dir::scratch_dir(dir))?;
    // Leftovers from a crashed run.
    if let Ok(rd) = std::fs::read_dir(temp.dir()) {
        for e in rd.flatten() {
            temp.register(&e.path());
        }
        temp.cleanup_all();
    }

    let stages = Stages::new(
        providers,
        Arc::new(CommandRecorder::new(
            settings.record_program(),
            settings.record_max_seconds(),
            settings.record_silence_seconds(),
        )),
        Arc::new(CommandPlayer::new(settings.player_program())),
    );

    let (sink, events) = ui_channel();
    let orch = ConversationOrchestrator::builder(stages, Arc::new(sink), temp.clone())
        .tracer(tracer.clone())
        .metrics_dir(dir)
        .build();
    let journal = Journal::new(&data_dir::journal_path(dir), tracer);

    let input = spawn_stdin_reader()?;
    Shell::new(orch, events, Some(journal), temp, dir, std::io::stdout()).run(input)
}

fn settings_cmd(dir: &Path, action: SettingsCmd) -> Result<()> {
    match action {
        SettingsCmd::Show => {
            let s = settings::load_settings(dir)?;
            println!("{}", serde_json::to_string_pretty(&s.redacted())?);
        }
        SettingsCmd::Path => println!("{}", settings::settings_path(dir).display()),
        SettingsCmd::Set { assignments } => {
            let patch = assignments
                .iter()
                .map(|a| settings::parse_assignment(a))
                .collect::<Result<settings::SettingsPatch>>()?;
            let next = settings::apply_patch(settings::load_settings(dir)?, &patch)?;
            settings::save_settings(dir, &next)?;
            println!("saved {}", settings::settings_path(dir).display());
            for issue in ProviderConfig::validate(&next) {
                println!("warning: {issue}");
            }
        }
        SettingsCmd::Validate => {
            let issues = ProviderConfig::validate(&settings::load_settings(dir)?);
            if !issues.is_empty() {
                for issue in &issues {
                    println!("{issue}");
                }
                return Err(anyhow!("{} settings problem(s)", issues.len()));
            }
            println!("ok");
        }
    }
    Ok(())
}

fn keys_cmd(dir: &Path, action: KeysCmd) -> Result<()> {
    match action {
        KeysCmd::Set { vendor, key } => {
            let key = match key {
                Some(k) => k,
                None => {
                    eprint!("{} API key: ", vendor.display_name());
                    std::io::stderr().flush().ok();
                    let mut line = String::new();
                    std::io::stdin().read_line(&mut line)?;
                    line
                }
            };
            keys::set_api_key(vendor, &key)?;
            println!("{} key stored", vendor.display_name());
        }
        KeysCmd::Clear { vendor } => {
            keys::clear_api_key(vendor)?;
            println!("{} key cleared", vendor.display_name());
        }
        KeysCmd::Status => {
            let s = settings::load_settings_or_recover(dir);
            for vendor in Vendor::ALL {
                let st = keys::api_key_status(vendor, &s);
                let state = if st.configured { "configured" } else { "missing" };
                match st.reason {
                    Some(r) => println!("{:<12} {state:<10} {} ({r})", vendor.display_name(), st.source),
                    None => println!("{:<12} {state:<10} {}", vendor.display_name(), st.source),
                }
            }
        }
    }
    Ok(())
}

fn sessions_cmd(dir: &Path, action: SessionsCmd) -> Result<()> {
    let journal = Journal::new(&data_dir::journal_path(dir), Tracer::from_env(dir));
    match action {
        SessionsCmd::List { limit } => {
            let sessions = journal.list_sessions(limit)?;
            if sessions.is_empty() {
                println!("no conversations yet");
            }
            for s in sessions {
                let when = chrono::DateTime::from_timestamp_millis(s.last_at_ms)
                    .map(|t| t.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M").to_string())
                    .unwrap_or_default();
                println!(
                    "{}  {when}  {:>3} msgs  {}",
                    s.session_id,
                    s.message_count,
                    s.preview.unwrap_or_default()
                );
            }
        }
        SessionsCmd::Export {
            session_id,
            format,
            out,
        } => {
            let entries = journal.load_session(&session_id)?;
            if entries.is_empty() {
                return Err(anyhow!("session not found: {session_id}"));
            }
            let path = out.unwrap_or_else(|| {
                dir.join("exports")
                    .join(format!("verbi-{session_id}.{}", format.extension()))
            });
            export::write_export(&path, &entries_to_messages(&entries), format, now_ms())?;
            println!("exported to {}", path.display());
        }
        SessionsCmd::Clear => {
            journal.clear()?;
            println!("journal cleared");
        }
    }
    Ok(())
}
