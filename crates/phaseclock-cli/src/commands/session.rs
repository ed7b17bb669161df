use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Subcommand;
use serde::Serialize;

use phaseclock_core::storage::SqliteStore;
use phaseclock_core::{
    Config, ControllerOptions, Event, KeyValueStore, ReloadPolicy, SessionController,
    SessionDefinition, SessionStatus, Snapshot,
};

#[derive(Subcommand)]
pub enum SessionAction {
    /// Start the session at its current phase
    Start,
    /// Pause the running phase
    Pause,
    /// Resume a paused phase
    Resume,
    /// End the current phase now
    Skip,
    /// Return to the first phase and forget saved state
    Reset,
    /// Add (or with a negative value, remove) time from the current phase
    Adjust {
        /// Seconds to add; negative to subtract
        #[arg(allow_hyphen_values = true)]
        delta_secs: i64,
    },
    /// Print the current snapshot as JSON
    Status,
    /// Follow the session, printing one JSON event per line until it completes
    Watch,
}

/// What a one-shot command prints.
#[derive(Serialize)]
struct Report<'a> {
    events: &'a [Event],
    snapshot: Snapshot,
}

#[derive(Serialize)]
struct DefinitionSummary<'a> {
    session_id: &'a str,
    session_type: &'static str,
    phase_count: usize,
    total_duration_ms: u64,
    planned_duration_ms: u64,
}

fn open_store(
    config: &Config,
    path: Option<PathBuf>,
) -> Result<SqliteStore, Box<dyn std::error::Error>> {
    let path = match path {
        Some(path) => path,
        None => config.store_path()?,
    };
    Ok(SqliteStore::open(&path)?)
}

pub fn run(
    file: &Path,
    action: SessionAction,
    store_path: Option<PathBuf>,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load_or_default();
    let definition = SessionDefinition::from_path(file)?;
    let store: Arc<dyn KeyValueStore> = Arc::new(open_store(&config, store_path)?);
    // Each invocation continues the stored session; a running phase keeps
    // running between commands whatever the session type's reload policy.
    let options = ControllerOptions::from_config(&config, &definition)
        .with_reload_policy(ReloadPolicy::Resume);
    let mut session = SessionController::open(definition, store, options);

    let events = match action {
        SessionAction::Start => session.start()?,
        SessionAction::Pause => session.pause()?,
        SessionAction::Resume => session.resume()?,
        SessionAction::Skip => session.skip()?,
        SessionAction::Reset => session.reset(),
        SessionAction::Adjust { delta_secs } => session.adjust(delta_secs.saturating_mul(1000))?,
        SessionAction::Status => session.tick(),
        SessionAction::Watch => return watch(session),
    };

    let report = Report {
        events: &events,
        snapshot: session.snapshot(),
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    session.flush();
    Ok(())
}

fn watch(mut session: SessionController) -> Result<(), Box<dyn std::error::Error>> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let shutdown = async {
            let _ = tokio::signal::ctrl_c().await;
        };
        let mut last_second = None;
        session
            .run_until(shutdown, |events, snapshot| {
                for event in events {
                    print_line(event);
                }
                // One snapshot line per displayed second is enough for a terminal.
                let second = snapshot.remaining_ms.div_ceil(1000);
                if !events.is_empty() || last_second != Some(second) {
                    last_second = Some(second);
                    print_line(&Event::StateSnapshot(snapshot.clone()));
                }
            })
            .await;
    });

    if session.status() == SessionStatus::Completed {
        eprintln!("session complete");
    }
    Ok(())
}

fn print_line(event: &Event) {
    match serde_json::to_string(event) {
        Ok(line) => println!("{line}"),
        Err(e) => tracing::warn!(error = %e, "failed to encode event"),
    }
}

pub fn validate(file: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let definition = SessionDefinition::from_path(file)?;
    let summary = DefinitionSummary {
        session_id: definition.session_id(),
        session_type: definition.session_type().as_str(),
        phase_count: definition.len(),
        total_duration_ms: definition.total_duration_ms(),
        planned_duration_ms: definition.planned_duration_ms(),
    };
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
