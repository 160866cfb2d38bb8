use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context as _};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing::Level;

use tandem_core::events::{EventSink, SessionEvent};
use tandem_core::ids::{JobId, SessionId};
use tandem_core::jobs::JobSnapshot;
use tandem_core::messages::Message;
use tandem_core::todos::TodoProgress;
use tandem_engine::vcs;
use tandem_engine::{
    create_default_registry, CancelOptions, ContextConfig, Coordinator, ExecutorConfig,
    ShutdownOptions, SubmitStatus, ToolExecutor, TurnConfig, TurnEngine,
};
use tandem_llm::{EchoProvider, ReliableConfig, ReliableProvider};
use tandem_settings::TandemSettings;
use tandem_store::{Database, MemorySessionStore, SessionStore, SqliteSessionStore};
use tandem_telemetry::{LogFormat, TelemetryConfig};

#[derive(Parser, Debug)]
#[command(name = "tandem", about = "Interactive session over the tandem turn engine")]
struct Args {
    /// Settings file (defaults to ~/.tandem/settings.json).
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Session to resume or create.
    #[arg(long)]
    session: Option<String>,

    /// Keep sessions in memory only.
    #[arg(long)]
    memory: bool,

    /// Session database path, overriding settings.
    #[arg(long)]
    db: Option<PathBuf>,

    /// `pretty` or `json`.
    #[arg(long)]
    log_format: Option<LogFormat>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let settings = match &args.settings {
        Some(path) => tandem_settings::load_settings_from_path(path),
        None => tandem_settings::load_settings(),
    }
    .context("failed to load settings")?;

    tandem_telemetry::init_telemetry(telemetry_config(&settings, args.log_format))
        .context("failed to initialize logging")?;

    let store = open_store(&settings, &args)?;
    let coordinator = Arc::new(build_coordinator(&settings, store)?);

    let session_id = args
        .session
        .as_deref()
        .map(SessionId::from_raw)
        .unwrap_or_default();
    let info = coordinator.start_or_get_session(&session_id).await?;
    println!(
        "session {} ({})",
        info.id,
        if info.created { "new" } else { "resumed" }
    );

    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    if let Some(repo) = vcs::detect(&cwd).await {
        println!("{}", repo.indicator());
    }

    let printer = tokio::spawn(print_events(coordinator.subscribe()));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match run_command(&coordinator, &session_id, line).await {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => eprintln!("error: {e:#}"),
        }
    }

    let reports = coordinator.shutdown_all(ShutdownOptions::default()).await;
    for (id, report) in reports {
        for job in report.orphaned_jobs {
            println!("[{id}] job {} still running: {}", job.job_id, job.command);
        }
    }
    printer.abort();
    tracing::info!("tandem exited");
    Ok(())
}

fn telemetry_config(settings: &TandemSettings, format: Option<LogFormat>) -> TelemetryConfig {
    let logging = &settings.logging;
    let module_levels = logging
        .modules
        .iter()
        .filter_map(|(module, level)| Some((module.clone(), level.parse::<Level>().ok()?)))
        .collect();
    TelemetryConfig {
        log_level: logging.level.parse().unwrap_or(Level::INFO),
        module_levels,
        format: format
            .or_else(|| logging.format.parse().ok())
            .unwrap_or_default(),
    }
}

fn open_store(settings: &TandemSettings, args: &Args) -> anyhow::Result<Arc<dyn SessionStore>> {
    if args.memory || settings.storage.in_memory {
        return Ok(Arc::new(MemorySessionStore::new()));
    }
    let path = args
        .db
        .clone()
        .unwrap_or_else(|| settings.storage.resolved_database_path());
    let db = Database::open(&path).with_context(|| format!("failed to open {}", path.display()))?;
    Ok(Arc::new(SqliteSessionStore::new(db)))
}

fn build_coordinator(
    settings: &TandemSettings,
    store: Arc<dyn SessionStore>,
) -> anyhow::Result<Coordinator> {
    let engine_settings = &settings.engine;
    let retry = &settings.retry;
    let provider = ReliableProvider::new(
        EchoProvider::new(),
        ReliableConfig {
            max_retries: retry.max_retries,
            base_delay: Duration::from_millis(retry.base_delay_ms),
            max_delay: Duration::from_millis(retry.max_delay_ms),
            jitter_factor: retry.jitter_factor,
            circuit_breaker_threshold: retry.circuit_breaker_threshold,
            circuit_breaker_cooldown: Duration::from_millis(retry.circuit_breaker_cooldown_ms),
        },
    );

    let executor = ToolExecutor::new(
        create_default_registry(engine_settings.tool_timeout()),
        ExecutorConfig {
            tool_timeout: engine_settings.tool_timeout(),
            background_grace: engine_settings.background_grace(),
        },
    );
    let config = TurnConfig {
        max_round_trips: engine_settings.max_round_trips,
        request_timeout: engine_settings.request_timeout(),
        ..TurnConfig::default()
    };
    let cwd = std::env::current_dir().context("failed to read working directory")?;
    let engine = TurnEngine::new(Arc::new(provider), Arc::new(executor), store, config)
        .with_events(EventSink::new(engine_settings.event_buffer))
        .with_working_directory(cwd);

    let context = ContextConfig {
        high_water: settings.context.high_water_tokens,
        keep_recent: settings.context.keep_recent,
    };
    Ok(Coordinator::new(Arc::new(engine), context))
}

/// Handle one input line. Returns `false` when the user asked to quit.
async fn run_command(
    coordinator: &Coordinator,
    session_id: &SessionId,
    line: &str,
) -> anyhow::Result<bool> {
    let (command, arg) = match line.split_once(' ') {
        Some((c, a)) => (c, a.trim()),
        None => (line, ""),
    };

    match command {
        "/quit" => return Ok(false),
        "/cancel" => {
            let options = CancelOptions {
                kill_jobs: arg == "jobs",
            };
            let report = coordinator.cancel(session_id, options).await?;
            if report.active_cancelled {
                println!("cancelled ({} queued dropped)", report.dropped);
            } else {
                println!("nothing running");
            }
            for job in &report.killed_jobs {
                println!("killed {} {}", job.job_id, job.command);
            }
        }
        "/jobs" => {
            let jobs = coordinator.jobs().for_session(session_id);
            if jobs.is_empty() {
                println!("no jobs");
            }
            for job in jobs {
                println!("{} {:?} {}", job.job_id, job.status, job.command);
            }
        }
        "/output" => {
            let job = coordinator.job_output(&job_arg(arg)?, 0)?;
            print_job(&job);
        }
        "/kill" => {
            let job = coordinator.job_kill(&job_arg(arg)?).await?;
            print_job(&job);
        }
        "/todos" => {
            let todos = coordinator.todos(session_id)?;
            match TodoProgress::from_items(&todos) {
                Some(progress) => println!("{}", progress.render()),
                None => println!("no todos"),
            }
            for item in todos {
                println!("  [{:?}] {}", item.status, item.content);
            }
        }
        other if other.starts_with('/') => bail!("unknown command: {other}"),
        _ => {
            let receipt = coordinator
                .submit(session_id, Message::user_text(line))
                .await?;
            if let SubmitStatus::Queued { .. } = receipt.status {
                println!("{}", coordinator.queue_indicator(session_id)?);
            }
        }
    }
    Ok(true)
}

fn job_arg(arg: &str) -> anyhow::Result<JobId> {
    if arg.is_empty() {
        bail!("expected a job id");
    }
    Ok(JobId::from_raw(arg))
}

fn print_job(job: &JobSnapshot) {
    println!("{} {:?}", job.job_id, job.status);
    print!("{}", job.output);
}

async fn print_events(mut rx: broadcast::Receiver<SessionEvent>) {
    loop {
        let event = match rx.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!(skipped = n, "event printer lagged");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        match event {
            SessionEvent::TextDelta { delta, .. } => print!("{delta}"),
            SessionEvent::ToolCallStarted { tool_name, .. } => println!("\n> {tool_name}"),
            SessionEvent::ToolCallFinished {
                tool_name,
                is_error,
                result_preview,
                duration_ms,
                ..
            } => {
                let mark = if is_error { "failed" } else { "ok" };
                println!("< {tool_name} {mark} ({duration_ms}ms): {result_preview}");
            }
            SessionEvent::BackgroundJobStarted { job_id, command, .. } => {
                println!("[job {job_id}] {command}");
            }
            SessionEvent::SummarizationOccurred {
                replaced,
                tokens_before,
                tokens_after,
                ..
            } => println!("[summarized {replaced} messages: {tokens_before} -> {tokens_after}]"),
            SessionEvent::SummarizationFailed { error, .. } => {
                println!("[summarization failed: {error}]");
            }
            SessionEvent::TodosUpdated {
                progress: Some(progress),
                ..
            } => println!("[{}]", progress.render()),
            SessionEvent::QueueChanged { queued, .. } => {
                let indicator = tandem_engine::queue_indicator(queued);
                if !indicator.is_empty() {
                    println!("[{indicator}]");
                }
            }
            SessionEvent::TurnCompleted { outcome, .. } => {
                println!("\n[{}]", outcome.label());
            }
            SessionEvent::TurnStarted { .. } | SessionEvent::TodosUpdated { .. } => {}
        }
    }
}
