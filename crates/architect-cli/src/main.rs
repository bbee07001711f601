use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use architect_config::{Config, load_config};
use architect_core::csrf::CsrfStore;
use architect_core::dispatcher::Dispatcher;
use architect_core::http::{self, AppState};
use architect_core::queue::{Queue, SubmitRequest};
use architect_core::responder::{self, CooldownTracker, Detection, PatternCache};
use architect_core::storage::StorageEngine;
use architect_events::EventLog;
use architect_process::tmux;
use architect_state::{DaemonExitCode, DaemonPhase, DaemonStatus, StatusStore, process_is_alive, terminate};
use architect_types::TaskStatus;

mod progress;

#[derive(Parser, Debug)]
#[command(name = "architect", version)]
#[command(about = "Task queue, session dispatcher, and prompt auto-responder for multi-agent development")]
struct Cli {
    /// Path to the SQLite database file (overrides `.architect.toml`).
    #[arg(long, global = true)]
    db_path: Option<PathBuf>,

    /// Directory to look for `.architect.toml` in.
    #[arg(long, global = true, default_value = ".")]
    config_dir: PathBuf,

    /// Directory for PID files, status files, and the event log.
    #[arg(long, global = true, default_value = ".architect-state")]
    state_dir: PathBuf,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Submit a single task to the queue.
    Submit {
        task_type: String,
        /// JSON payload (default: `{}`).
        #[arg(long)]
        payload: Option<String>,
        #[arg(long, default_value_t = 5)]
        priority: i32,
        #[arg(long, default_value_t = 3)]
        max_retries: u32,
        #[arg(long, default_value_t = 300)]
        timeout_seconds: i64,
        #[arg(long)]
        parent_id: Option<i64>,
    },
    /// Submit every task in a JSON array file.
    BulkCreate {
        /// Path to a JSON file containing an array of submit requests.
        file: PathBuf,
    },
    /// Claim the next eligible pending task.
    Claim {
        worker_id: String,
        /// Restrict to tasks matching one of these types (repeatable).
        #[arg(long = "skill")]
        skills: Vec<String>,
    },
    /// Mark a running task completed.
    Complete { id: i64 },
    /// Mark a running task failed (retried or terminal, per its retry budget).
    Fail {
        id: i64,
        #[arg(default_value = "")]
        message: String,
    },
    /// Cancel a task.
    Cancel { id: i64 },
    /// Change a task's priority.
    Prioritize {
        id: i64,
        value: i32,
        /// Treat `value` as a delta against the task's current priority.
        #[arg(long)]
        increment: bool,
    },
    /// Print a count of tasks by status.
    Status,
    /// Re-queue failed/cancelled tasks.
    RetryFailed {
        /// Task ids to retry (omit to retry every failed/cancelled task).
        task_ids: Vec<i64>,
        /// Reset each task's retry counter to 0 as part of the requeue.
        #[arg(long)]
        reset_retries: bool,
    },
    /// Move terminal tasks older than `older_than_days` into the archive table.
    ArchiveTerminal {
        #[arg(long, default_value_t = 30)]
        older_than_days: i64,
    },
    /// Register a reusable task template.
    CreateTemplate {
        name: String,
        task_type: String,
        /// JSON skeleton with `${var}` placeholders (default: `{}`).
        #[arg(long)]
        payload_skeleton: Option<String>,
        #[arg(long, default_value_t = 5)]
        priority: u8,
        #[arg(long, default_value_t = 3)]
        max_retries: u32,
        #[arg(long, default_value_t = 300)]
        timeout_seconds: i64,
    },
    /// Instantiate a task from a template.
    SubmitFromTemplate {
        template_id: i64,
        /// JSON object of `${var}` bindings (default: `{}`).
        #[arg(long)]
        bindings: Option<String>,
        #[arg(long)]
        priority: Option<i32>,
        #[arg(long)]
        parent_id: Option<i64>,
    },
    /// Subscribe a user to a task's lifecycle events.
    Watch {
        task_id: i64,
        task_type: String,
        user_id: String,
        #[arg(long, default_value = "all")]
        watch_type: String,
        #[arg(long)]
        notify_email: bool,
    },
    /// Remove a user's subscription to a task.
    Unwatch { task_id: i64, user_id: String },
    /// Record a completed span of time spent on a task.
    LogWork {
        task_id: i64,
        user_id: String,
        minutes: u32,
        #[arg(long, default_value = "")]
        description: String,
    },
    /// Start a timer for a task. At most one active timer per user.
    TimerStart { task_id: i64, user_id: String },
    /// Stop the caller's active timer, recording it to the worklog.
    TimerStop {
        user_id: String,
        #[arg(long, default_value = "")]
        description: String,
    },
    /// Sprint planning.
    Sprint {
        #[command(subcommand)]
        cmd: SprintCommand,
    },
    /// Webhook subscriptions.
    Webhook {
        #[command(subcommand)]
        cmd: WebhookCommand,
    },
    /// Record that a task was promoted to an external tracker entity.
    Convert { task_id: i64, target_reference: String },
    /// Run the operator HTTP/JSON surface.
    Serve {
        #[arg(long)]
        bind: Option<String>,
    },
    /// Session dispatcher (C2) daemon.
    Dispatcher {
        #[command(subcommand)]
        cmd: DaemonCommand,
    },
    /// Prompt auto-responder (C3) daemon.
    Responder {
        #[command(subcommand)]
        cmd: DaemonCommand,
    },
    /// Print environment diagnostics.
    Doctor,
}

#[derive(Subcommand, Debug)]
enum SprintCommand {
    Create {
        name: String,
        #[arg(long)]
        goal: Option<String>,
        #[arg(long)]
        start_date: Option<chrono::NaiveDate>,
        #[arg(long)]
        end_date: Option<chrono::NaiveDate>,
    },
    List,
    SetStatus { id: i64, status: String },
}

#[derive(Subcommand, Debug)]
enum WebhookCommand {
    Create {
        name: String,
        url: String,
        #[arg(long)]
        secret: Option<String>,
        /// Event names to subscribe to (repeatable), e.g. `task.completed`.
        #[arg(long = "event")]
        events: Vec<String>,
        #[arg(long, default_value_t = 3)]
        retry_count: u32,
        #[arg(long, default_value_t = 10)]
        timeout_seconds: u64,
    },
    List,
}

#[derive(Subcommand, Debug)]
enum DaemonCommand {
    /// Run the daemon loop in the foreground until `Ctrl-C` or `stop`.
    Run {
        #[arg(long, default_value_t = 500)]
        poll_interval_ms: u64,
    },
    /// Send `SIGTERM` to a running daemon's recorded PID.
    Stop,
    /// Print the daemon's last-saved status.
    Status,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config_dir).context("failed to load configuration")?;
    let db_path = resolve_db_path(&cli, &config);

    let code = match cli.cmd {
        Commands::Submit { task_type, payload, priority, max_retries, timeout_seconds, parent_id } => {
            cmd_submit(&db_path, &cli.state_dir, task_type, payload, priority, max_retries, timeout_seconds, parent_id)?
        }
        Commands::BulkCreate { file } => cmd_bulk_create(&db_path, &cli.state_dir, &file)?,
        Commands::Claim { worker_id, skills } => cmd_claim(&db_path, &cli.state_dir, &worker_id, &skills)?,
        Commands::Complete { id } => cmd_complete(&db_path, &cli.state_dir, id)?,
        Commands::Fail { id, message } => cmd_fail(&db_path, &cli.state_dir, id, &message)?,
        Commands::Cancel { id } => cmd_cancel(&db_path, &cli.state_dir, id)?,
        Commands::Prioritize { id, value, increment } => cmd_prioritize(&db_path, &cli.state_dir, id, value, increment)?,
        Commands::Status => cmd_status(&db_path)?,
        Commands::RetryFailed { task_ids, reset_retries } => cmd_retry_failed(&db_path, &cli.state_dir, task_ids, reset_retries)?,
        Commands::ArchiveTerminal { older_than_days } => cmd_archive_terminal(&db_path, older_than_days)?,
        Commands::CreateTemplate { name, task_type, payload_skeleton, priority, max_retries, timeout_seconds } => {
            cmd_create_template(&db_path, name, task_type, payload_skeleton, priority, max_retries, timeout_seconds)?
        }
        Commands::SubmitFromTemplate { template_id, bindings, priority, parent_id } => {
            cmd_submit_from_template(&db_path, &cli.state_dir, template_id, bindings, priority, parent_id)?
        }
        Commands::Watch { task_id, task_type, user_id, watch_type, notify_email } => {
            cmd_watch(&db_path, task_id, &task_type, &user_id, &watch_type, notify_email)?
        }
        Commands::Unwatch { task_id, user_id } => cmd_unwatch(&db_path, task_id, &user_id)?,
        Commands::LogWork { task_id, user_id, minutes, description } => cmd_log_work(&db_path, task_id, &user_id, minutes, &description)?,
        Commands::TimerStart { task_id, user_id } => cmd_timer_start(&db_path, task_id, &user_id)?,
        Commands::TimerStop { user_id, description } => cmd_timer_stop(&db_path, &user_id, &description)?,
        Commands::Sprint { cmd } => cmd_sprint(&db_path, cmd)?,
        Commands::Webhook { cmd } => cmd_webhook(&db_path, cmd)?,
        Commands::Convert { task_id, target_reference } => cmd_convert(&db_path, task_id, &target_reference)?,
        Commands::Serve { bind } => cmd_serve(&db_path, &cli.state_dir, &config, bind)?,
        Commands::Dispatcher { cmd } => cmd_dispatcher(&db_path, &cli.state_dir, &config, cmd)?,
        Commands::Responder { cmd } => cmd_responder(&cli.state_dir, &config, cmd)?,
        Commands::Doctor => cmd_doctor(&db_path, &cli.state_dir, &config)?,
    };

    std::process::exit(code.code());
}

fn resolve_db_path(cli: &Cli, config: &Config) -> PathBuf {
    cli.db_path
        .clone()
        .or_else(|| config.storage.db_path.clone())
        .unwrap_or_else(|| PathBuf::from("architect.db"))
}

fn open_queue(db_path: &Path) -> Result<Queue> {
    let storage = StorageEngine::open(db_path)
        .with_context(|| format!("failed to open database at {}", db_path.display()))?;
    Ok(Queue::new(storage))
}

fn flush_events(events: EventLog, state_dir: &Path) -> Result<()> {
    events
        .write_to_file(&architect_events::events_path(state_dir))
        .context("failed to append to event log")
}

fn print_task(task: &architect_types::Task) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(task)?);
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn cmd_submit(
    db_path: &Path,
    state_dir: &Path,
    task_type: String,
    payload: Option<String>,
    priority: i32,
    max_retries: u32,
    timeout_seconds: i64,
    parent_id: Option<i64>,
) -> Result<DaemonExitCode> {
    let queue = open_queue(db_path)?;
    let mut events = EventLog::new();
    let payload = match payload {
        Some(raw) => serde_json::from_str(&raw).context("--payload must be valid JSON")?,
        None => serde_json::json!({}),
    };

    let req = SubmitRequest {
        task_type,
        payload,
        priority,
        max_retries,
        timeout_seconds,
        parent_id,
        ..Default::default()
    };

    let task = queue.submit(req, &mut events)?;
    print_task(&task)?;
    flush_events(events, state_dir)?;
    Ok(DaemonExitCode::Success)
}

fn cmd_bulk_create(db_path: &Path, state_dir: &Path, file: &Path) -> Result<DaemonExitCode> {
    let content = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read bulk submit file {}", file.display()))?;
    let raw: Vec<serde_json::Value> =
        serde_json::from_str(&content).context("bulk submit file must be a JSON array")?;

    let queue = open_queue(db_path)?;
    let mut events = EventLog::new();
    let mut reporter = progress::ProgressReporter::new(raw.len());
    let mut created = 0usize;
    let mut failed = 0usize;

    for (idx, item) in raw.into_iter().enumerate() {
        let task_type = item
            .get("task_type")
            .and_then(|v| v.as_str())
            .unwrap_or("unspecified")
            .to_string();
        reporter.set_package(idx + 1, &task_type, "pending");

        let req = SubmitRequest {
            task_type,
            payload: item.get("payload").cloned().unwrap_or(serde_json::json!({})),
            priority: item.get("priority").and_then(|v| v.as_i64()).unwrap_or(5) as i32,
            max_retries: item.get("max_retries").and_then(|v| v.as_u64()).unwrap_or(3) as u32,
            timeout_seconds: item.get("timeout_seconds").and_then(|v| v.as_i64()).unwrap_or(300),
            parent_id: item.get("parent_id").and_then(|v| v.as_i64()),
            ..Default::default()
        };

        match queue.submit(req, &mut events) {
            Ok(_) => created += 1,
            Err(e) => {
                failed += 1;
                eprintln!("[warn] bulk submit item {idx} failed: {e}");
            }
        }
        reporter.finish_package();
    }
    reporter.finish();

    flush_events(events, state_dir)?;
    println!("created: {created}, failed: {failed}");
    Ok(if failed == 0 { DaemonExitCode::Success } else { DaemonExitCode::Error })
}

fn cmd_claim(db_path: &Path, state_dir: &Path, worker_id: &str, skills: &[String]) -> Result<DaemonExitCode> {
    let mut queue = open_queue(db_path)?;
    let mut events = EventLog::new();
    match queue.claim_next(worker_id, skills, &mut events)? {
        Some(task) => {
            print_task(&task)?;
            flush_events(events, state_dir)?;
            Ok(DaemonExitCode::Success)
        }
        None => {
            println!("null");
            Ok(DaemonExitCode::NotRunning)
        }
    }
}

fn cmd_complete(db_path: &Path, state_dir: &Path, id: i64) -> Result<DaemonExitCode> {
    let queue = open_queue(db_path)?;
    let mut events = EventLog::new();
    let task = queue.complete(id, &mut events)?;
    print_task(&task)?;
    flush_events(events, state_dir)?;
    Ok(DaemonExitCode::Success)
}

fn cmd_fail(db_path: &Path, state_dir: &Path, id: i64, message: &str) -> Result<DaemonExitCode> {
    let queue = open_queue(db_path)?;
    let mut events = EventLog::new();
    let task = queue.fail(id, message, &mut events)?;
    print_task(&task)?;
    flush_events(events, state_dir)?;
    Ok(DaemonExitCode::Success)
}

fn cmd_cancel(db_path: &Path, state_dir: &Path, id: i64) -> Result<DaemonExitCode> {
    let mut queue = open_queue(db_path)?;
    let mut events = EventLog::new();
    let task = queue.cancel(id, &mut events)?;
    print_task(&task)?;
    flush_events(events, state_dir)?;
    Ok(DaemonExitCode::Success)
}

fn cmd_prioritize(db_path: &Path, state_dir: &Path, id: i64, value: i32, increment: bool) -> Result<DaemonExitCode> {
    let queue = open_queue(db_path)?;
    let mut events = EventLog::new();
    let target = if increment {
        queue.storage().get_task(id)?.priority as i32 + value
    } else {
        value
    };
    let task = queue.update_priority(id, target, &mut events)?;
    print_task(&task)?;
    flush_events(events, state_dir)?;
    Ok(DaemonExitCode::Success)
}

fn cmd_status(db_path: &Path) -> Result<DaemonExitCode> {
    let queue = open_queue(db_path)?;
    for status in [
        TaskStatus::Pending,
        TaskStatus::Scheduled,
        TaskStatus::Running,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Cancelled,
        TaskStatus::Timeout,
        TaskStatus::Converted,
    ] {
        let count = queue.storage().count_by_status(status)?;
        println!("{:<10} {count}", status.as_str());
    }
    Ok(DaemonExitCode::Success)
}

fn cmd_retry_failed(db_path: &Path, state_dir: &Path, task_ids: Vec<i64>, reset_retries: bool) -> Result<DaemonExitCode> {
    let queue = open_queue(db_path)?;
    let mut events = EventLog::new();
    let ids = if task_ids.is_empty() { None } else { Some(task_ids.as_slice()) };
    let retried = queue.retry_failed(ids, reset_retries, &mut events)?;
    println!("retried: {retried:?}");
    flush_events(events, state_dir)?;
    Ok(DaemonExitCode::Success)
}

fn cmd_archive_terminal(db_path: &Path, older_than_days: i64) -> Result<DaemonExitCode> {
    let mut queue = open_queue(db_path)?;
    let older_than = chrono::Utc::now() - chrono::Duration::days(older_than_days);
    let archived = queue.archive_terminal(older_than)?;
    println!("archived: {archived}");
    Ok(DaemonExitCode::Success)
}

#[allow(clippy::too_many_arguments)]
fn cmd_create_template(
    db_path: &Path,
    name: String,
    task_type: String,
    payload_skeleton: Option<String>,
    priority: u8,
    max_retries: u32,
    timeout_seconds: i64,
) -> Result<DaemonExitCode> {
    let queue = open_queue(db_path)?;
    let payload_skeleton = match payload_skeleton {
        Some(raw) => serde_json::from_str(&raw).context("--payload-skeleton must be valid JSON")?,
        None => serde_json::json!({}),
    };
    let id = queue.create_template(architect_core::storage::NewTemplate {
        name,
        task_type,
        payload_skeleton,
        default_priority: priority,
        default_max_retries: max_retries,
        default_timeout_seconds: timeout_seconds,
        created_by: None,
    })?;
    println!("template id: {id}");
    Ok(DaemonExitCode::Success)
}

fn cmd_submit_from_template(
    db_path: &Path,
    state_dir: &Path,
    template_id: i64,
    bindings: Option<String>,
    priority: Option<i32>,
    parent_id: Option<i64>,
) -> Result<DaemonExitCode> {
    let queue = open_queue(db_path)?;
    let mut events = EventLog::new();
    let bindings = match bindings {
        Some(raw) => serde_json::from_str(&raw).context("--bindings must be a JSON object")?,
        None => serde_json::Map::new(),
    };
    let task = queue.submit_from_template(
        template_id,
        bindings,
        architect_core::queue::TemplateOverrides { priority, parent_id, ..Default::default() },
        &mut events,
    )?;
    print_task(&task)?;
    flush_events(events, state_dir)?;
    Ok(DaemonExitCode::Success)
}

fn cmd_watch(db_path: &Path, task_id: i64, task_type: &str, user_id: &str, watch_type: &str, notify_email: bool) -> Result<DaemonExitCode> {
    let queue = open_queue(db_path)?;
    let watch_type = watch_type.parse::<architect_types::WatchType>().map_err(anyhow::Error::msg)?;
    let watcher = queue.storage().upsert_watcher(task_id, task_type, user_id, watch_type, notify_email, true)?;
    println!("{}", serde_json::to_string_pretty(&watcher)?);
    Ok(DaemonExitCode::Success)
}

fn cmd_unwatch(db_path: &Path, task_id: i64, user_id: &str) -> Result<DaemonExitCode> {
    let queue = open_queue(db_path)?;
    queue.storage().delete_watcher(task_id, user_id)?;
    Ok(DaemonExitCode::Success)
}

fn cmd_log_work(db_path: &Path, task_id: i64, user_id: &str, minutes: u32, description: &str) -> Result<DaemonExitCode> {
    let queue = open_queue(db_path)?;
    let id = queue.storage().log_work(task_id, user_id, minutes, chrono::Utc::now().date_naive(), "development", true, description)?;
    println!("worklog id: {id}");
    Ok(DaemonExitCode::Success)
}

fn cmd_timer_start(db_path: &Path, task_id: i64, user_id: &str) -> Result<DaemonExitCode> {
    let queue = open_queue(db_path)?;
    let timer = queue.storage().start_timer(task_id, user_id)?;
    println!("{}", serde_json::to_string_pretty(&timer)?);
    Ok(DaemonExitCode::Success)
}

fn cmd_timer_stop(db_path: &Path, user_id: &str, description: &str) -> Result<DaemonExitCode> {
    let queue = open_queue(db_path)?;
    let entry = queue.storage().stop_timer(user_id, "development", description)?;
    println!("{}", serde_json::to_string_pretty(&entry)?);
    Ok(DaemonExitCode::Success)
}

fn cmd_sprint(db_path: &Path, cmd: SprintCommand) -> Result<DaemonExitCode> {
    let queue = open_queue(db_path)?;
    match cmd {
        SprintCommand::Create { name, goal, start_date, end_date } => {
            let id = queue.storage().create_sprint(&name, goal.as_deref(), start_date, end_date)?;
            println!("sprint id: {id}");
        }
        SprintCommand::List => {
            for sprint in queue.storage().list_sprints()? {
                println!("{}", serde_json::to_string(&sprint)?);
            }
        }
        SprintCommand::SetStatus { id, status } => {
            let status = status.parse::<architect_types::SprintStatus>().map_err(anyhow::Error::msg)?;
            queue.storage().update_sprint_status(id, status)?;
        }
    }
    Ok(DaemonExitCode::Success)
}

fn cmd_webhook(db_path: &Path, cmd: WebhookCommand) -> Result<DaemonExitCode> {
    let queue = open_queue(db_path)?;
    match cmd {
        WebhookCommand::Create { name, url, secret, events, retry_count, timeout_seconds } => {
            let id = queue.storage().create_webhook(&name, &url, secret.as_deref(), &events, None, retry_count, timeout_seconds)?;
            println!("webhook id: {id}");
        }
        WebhookCommand::List => {
            for webhook in queue.storage().list_webhooks()? {
                println!("{}", serde_json::to_string(&webhook)?);
            }
        }
    }
    Ok(DaemonExitCode::Success)
}

fn cmd_convert(db_path: &Path, task_id: i64, target_reference: &str) -> Result<DaemonExitCode> {
    let queue = open_queue(db_path)?;
    let conversion = queue.storage().convert_task(task_id, target_reference)?;
    println!("{}", serde_json::to_string_pretty(&conversion)?);
    Ok(DaemonExitCode::Success)
}

fn cmd_serve(db_path: &Path, state_dir: &Path, config: &Config, bind: Option<String>) -> Result<DaemonExitCode> {
    let bind_addr = bind.unwrap_or_else(|| config.http.bind_addr.clone());
    let queue = open_queue(db_path)?;
    let events = EventLog::read_from_file(&architect_events::events_path(state_dir))
        .unwrap_or_else(|_| EventLog::new());

    let state = AppState {
        queue: std::sync::Arc::new(std::sync::Mutex::new(queue)),
        events: std::sync::Arc::new(std::sync::Mutex::new(events)),
        csrf: std::sync::Arc::new(std::sync::Mutex::new(CsrfStore::new())),
    };

    let runtime = tokio::runtime::Runtime::new().context("failed to start async runtime")?;
    runtime.block_on(async move {
        let listener = tokio::net::TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("failed to bind {bind_addr}"))?;
        tracing::info!(addr = %bind_addr, "operator HTTP surface listening");
        let app = http::router(state);
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .context("HTTP server error")?;
        Ok::<(), anyhow::Error>(())
    })?;

    Ok(DaemonExitCode::Success)
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("received shutdown signal, draining");
}

fn cmd_dispatcher(db_path: &Path, state_dir: &Path, config: &Config, cmd: DaemonCommand) -> Result<DaemonExitCode> {
    let component_dir = state_dir.join("dispatcher");
    match cmd {
        DaemonCommand::Stop => daemon_stop(&component_dir),
        DaemonCommand::Status => daemon_status(&component_dir),
        DaemonCommand::Run { poll_interval_ms } => {
            let store = StatusStore::new(&component_dir);
            if let Some(pid) = store.read_pid()? {
                if process_is_alive(pid) {
                    eprintln!("dispatcher already running (pid {pid})");
                    return Ok(DaemonExitCode::AlreadyRunning);
                }
            }
            store.write_pid(std::process::id())?;
            let mut status = DaemonStatus::new("dispatcher", std::process::id());
            status.phase = DaemonPhase::Running;
            store.save(&status)?;

            let runtime = tokio::runtime::Runtime::new().context("failed to start async runtime")?;
            let result = runtime.block_on(dispatcher_loop(
                db_path,
                state_dir,
                config,
                Duration::from_millis(poll_interval_ms),
                &store,
                status,
            ));

            store.remove_pid()?;
            result?;
            Ok(DaemonExitCode::Success)
        }
    }
}

async fn dispatcher_loop(
    db_path: &Path,
    state_dir: &Path,
    config: &Config,
    poll_interval: Duration,
    store: &StatusStore,
    mut status: DaemonStatus,
) -> Result<()> {
    let mut queue = open_queue(db_path)?;
    let mut events = EventLog::new();
    let mut dispatcher = Dispatcher::new(
        Duration::from_millis(config.dispatcher.poll_interval_ms),
        config.responder.fallback_prompts.clone(),
    );
    let webhook_client = architect_webhook::WebhookClient::new(Duration::from_secs(config.webhook.timeout_seconds));

    let mut signal = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("failed to install SIGTERM handler")?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = signal.recv() => break,
            _ = tokio::time::sleep(poll_interval) => {}
        }

        match queue.reap_timed_out(&mut events) {
            Ok(reaped) if !reaped.is_empty() => {
                tracing::warn!(task_ids = ?reaped, "reaped timed-out tasks");
            }
            Err(e) => tracing::warn!(error = %e, "timeout sweep failed"),
            _ => {}
        }

        for name in tmux::list_sessions().unwrap_or_default() {
            if dispatcher.session(&name).is_none() {
                dispatcher.register_session(&name, Vec::new());
            }
            let Ok(capture) = tmux::capture_pane(&name) else { continue };
            let activity = architect_core::dispatcher::classify_session_capture(&capture, &["$", "> "]);
            let is_idle = activity == architect_types::SessionActivity::Idle;
            dispatcher.record_activity(&name, is_idle, !is_idle);

            if dispatcher.is_ready_for_dispatch(&name) {
                let _guard = dispatcher.task_context();
                let _ = dispatcher.claim_and_dispatch(&name, &mut queue, &mut events, |session, prompt| {
                    tmux::send_keys(session, prompt).map_err(|e| architect_types::CoreError::Transport(e.to_string()))
                });
            }
        }

        if let Err(e) = queue.dispatch_webhooks(&webhook_client, &events) {
            tracing::warn!(error = %e, "webhook dispatch failed");
        }

        status.touch();
        store.save(&status)?;
        flush_events(std::mem::take(&mut events), state_dir)?;
    }

    status.phase = DaemonPhase::Stopped;
    store.save(&status)?;
    Ok(())
}

fn cmd_responder(state_dir: &Path, config: &Config, cmd: DaemonCommand) -> Result<DaemonExitCode> {
    let component_dir = state_dir.join("responder");
    match cmd {
        DaemonCommand::Stop => daemon_stop(&component_dir),
        DaemonCommand::Status => daemon_status(&component_dir),
        DaemonCommand::Run { poll_interval_ms } => {
            let store = StatusStore::new(&component_dir);
            if let Some(pid) = store.read_pid()? {
                if process_is_alive(pid) {
                    eprintln!("responder already running (pid {pid})");
                    return Ok(DaemonExitCode::AlreadyRunning);
                }
            }
            store.write_pid(std::process::id())?;
            let mut status = DaemonStatus::new("responder", std::process::id());
            status.phase = DaemonPhase::Running;
            store.save(&status)?;

            let runtime = tokio::runtime::Runtime::new().context("failed to start async runtime")?;
            let result = runtime.block_on(responder_loop(config, Duration::from_millis(poll_interval_ms), &store, status));

            store.remove_pid()?;
            result?;
            Ok(DaemonExitCode::Success)
        }
    }
}

async fn responder_loop(
    _config: &Config,
    poll_interval: Duration,
    store: &StatusStore,
    mut status: DaemonStatus,
) -> Result<()> {
    let cache = PatternCache::new();
    let mut cooldowns = CooldownTracker::new();

    let mut signal = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("failed to install SIGTERM handler")?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = signal.recv() => break,
            _ = tokio::time::sleep(poll_interval) => {}
        }

        cooldowns.sweep_stale();
        for name in tmux::list_sessions().unwrap_or_default() {
            if cooldowns.in_cooldown(&name) {
                continue;
            }
            let Ok(raw) = tmux::capture_pane(&name) else { continue };
            match responder::detect(&raw, &name, &cache) {
                Detection::Skip => {}
                Detection::Confirm { send_key, risk, .. } => {
                    let delay = responder::sample_delay_ms(risk);
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    let _ = tmux::send_raw_key(&name, &send_key);
                    cooldowns.mark(&name, chrono::Duration::seconds(5));
                }
                Detection::None => {}
            }
        }

        status.touch();
        store.save(&status)?;
    }

    status.phase = DaemonPhase::Stopped;
    store.save(&status)?;
    Ok(())
}

fn daemon_stop(component_dir: &Path) -> Result<DaemonExitCode> {
    let store = StatusStore::new(component_dir);
    match store.read_pid()? {
        Some(pid) if process_is_alive(pid) => {
            terminate(pid)?;
            store.remove_pid()?;
            println!("stopped (pid {pid})");
            Ok(DaemonExitCode::Success)
        }
        _ => {
            println!("not running");
            Ok(DaemonExitCode::NotRunning)
        }
    }
}

fn daemon_status(component_dir: &Path) -> Result<DaemonExitCode> {
    let store = StatusStore::new(component_dir);
    match store.load()? {
        Some(status) => {
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(DaemonExitCode::Success)
        }
        None => {
            println!("not running");
            Ok(DaemonExitCode::NotRunning)
        }
    }
}

fn cmd_doctor(db_path: &Path, state_dir: &Path, config: &Config) -> Result<DaemonExitCode> {
    println!("db_path: {}", db_path.display());
    println!("state_dir: {}", state_dir.display());
    println!("http_bind_addr: {}", config.http.bind_addr);

    match StorageEngine::open(db_path) {
        Ok(_) => println!("storage: ok"),
        Err(e) => println!("storage: error ({e})"),
    }

    for cmd in ["tmux", "git"] {
        match architect_process::run_command(cmd, &["--version"]) {
            Ok(result) if result.success => {
                println!("{cmd}: {}", result.stdout.lines().next().unwrap_or("").trim());
            }
            Ok(result) => println!("{cmd}: --version failed ({})", result.stderr.trim()),
            Err(e) => println!("{cmd}: unavailable ({e})"),
        }
    }

    Ok(DaemonExitCode::Success)
}
