//! `Taskman`: command-line task board client.
//!
//! Talks to the task API over REST, keeps the session in a local file and
//! can follow changes live over the realtime channel. Configuration via CLI
//! flags, environment variables, or config file
//! (`~/.config/taskman/config.toml`).
//!
//! ```bash
//! # Sign in (password read from stdin)
//! cargo run --bin taskman -- login ann@example.com
//!
//! # Board operations
//! cargo run --bin taskman -- create "Write report" --priority high --due 2026-10-20
//! cargo run --bin taskman -- move 7 pending in-progress
//!
//! # Follow changes until Ctrl-C
//! TASKMAN_API_BASE=http://127.0.0.1:8000/api cargo run --bin taskman -- watch
//! ```

use std::io::{self, BufRead, Write};
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing_appender::non_blocking::WorkerGuard;

use taskman::config::{CliArgs, ClientConfig, Command};
use taskman::credentials::CredentialStore;
use taskman::gateway::ApiError;
use taskman::session::Session;
use taskman::sync::{self, SyncCommand, SyncEvent};
use taskman::tasks::{DragPayload, DropOutcome, SyncError, TaskFilter};
use taskman::transport::TransportError;
use taskman::transport::http::ReqwestTransport;
use taskman_proto::task::{NewTask, Task, TaskId, TaskPatch, TaskStatus};

/// Errors that end the process with a failure status.
#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error("failed to read password: {0}")]
    Password(#[from] io::Error),
    #[error("not signed in; run `taskman login <email>` first")]
    NotSignedIn,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = CliArgs::parse();

    // Load and resolve configuration (CLI args > config file > env > defaults).
    let config = match ClientConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Warning: failed to load config file: {e}");
            ClientConfig::from_cli(&cli)
        }
    };

    let _log_guard = init_logging(&cli.log_level, cli.log_file.as_deref());
    tracing::info!(api = %config.api_base, "taskman starting");

    let result = run(cli.command.unwrap_or(Command::Whoami), &config).await;

    tracing::info!("taskman exiting");
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Initialize file-based logging.
///
/// Logs go to a file so they never interleave with command output. Returns
/// a [`WorkerGuard`] that must be held until shutdown to flush buffered
/// entries.
fn init_logging(level: &str, file_path: Option<&Path>) -> Option<WorkerGuard> {
    let default_path = std::env::temp_dir().join("taskman.log");
    let log_path = file_path.unwrap_or(&default_path);

    let log_dir = log_path.parent()?;
    let file_name = log_path.file_name()?.to_str()?;

    let file_appender = tracing_appender::rolling::never(log_dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_env_filter(env_filter)
        .with_ansi(false)
        .init();

    Some(guard)
}

async fn run(command: Command, config: &ClientConfig) -> Result<(), CliError> {
    let credentials = Arc::new(
        config
            .session_file
            .as_ref()
            .map_or_else(CredentialStore::in_memory, CredentialStore::open),
    );
    let transport = ReqwestTransport::new(&config.api_base)?;
    let session = Session::new(transport, credentials);

    match command {
        Command::Login { email, password } => {
            let password = password_or_prompt(password)?;
            let profile = session.api().login(&email, &password).await?;
            println!("Signed in as {} <{}>", profile.name, profile.email);
        }
        Command::Register {
            email,
            name,
            password,
        } => {
            let password = password_or_prompt(password)?;
            let profile = session
                .api()
                .register(&email, &password, name.as_deref())
                .await?;
            println!("Registered and signed in as {} <{}>", profile.name, profile.email);
        }
        Command::Logout => {
            session.api().logout();
            println!("Signed out");
        }
        Command::Whoami => match session.credentials().profile() {
            Some(profile) if session.is_authenticated() => {
                println!("{} <{}>", profile.name, profile.email);
            }
            _ => println!("Not signed in"),
        },
        command => {
            if !session.is_authenticated() {
                return Err(CliError::NotSignedIn);
            }
            run_board(&session, command, config).await?;
        }
    }
    Ok(())
}

/// Commands that need the task list.
async fn run_board(
    session: &Session<ReqwestTransport>,
    command: Command,
    config: &ClientConfig,
) -> Result<(), SyncError> {
    if matches!(command, Command::Watch) {
        return watch(session, config).await;
    }

    let board = session.reconciler();
    board.reload().await?;

    match command {
        Command::List {
            search,
            status,
            priority,
        } => {
            let filter = TaskFilter {
                search,
                status,
                priority,
            };
            for task in board.filter(&filter) {
                print_task(&task);
            }
        }
        Command::Summary => {
            let summary = board.summary(chrono::Local::now().date_naive());
            println!("total        {}", summary.total);
            for status in TaskStatus::ALL {
                println!("{:<12} {}", status.as_str(), summary.status_count(status));
            }
            println!("due today    {}", summary.due_today);
            println!("this week    {}", summary.due_this_week);
            println!("overdue      {}", summary.overdue);
        }
        Command::Create {
            title,
            description,
            status,
            priority,
            due,
        } => {
            let task = NewTask {
                description,
                status: status.unwrap_or_default(),
                priority: priority.unwrap_or_default(),
                due_date: due,
                ..NewTask::titled(title)
            };
            print_task(&board.create(&task).await?);
        }
        Command::Status { id, status } => {
            print_task(&board.change_status(&TaskId::new(id), status).await?);
        }
        Command::Move { id, from, to } => {
            let payload = DragPayload {
                id: TaskId::new(id),
                status: from,
            };
            match board.drop_on_column(&payload, to).await? {
                DropOutcome::Moved(task) => print_task(&task),
                DropOutcome::Unchanged => println!("Unchanged"),
            }
        }
        Command::Update {
            id,
            title,
            description,
            status,
            priority,
            due,
        } => {
            let patch = TaskPatch {
                title,
                description,
                status,
                priority,
                due_date: due,
            };
            print_task(&board.update(&TaskId::new(id), &patch).await?);
        }
        Command::Delete { id } => {
            let id = TaskId::new(id);
            board.delete(&id).await?;
            println!("Deleted {id}");
        }
        Command::Login { .. }
        | Command::Register { .. }
        | Command::Logout
        | Command::Whoami
        | Command::Watch => {}
    }
    Ok(())
}

/// Follow realtime changes until Ctrl-C or the session ends.
async fn watch(
    session: &Session<ReqwestTransport>,
    config: &ClientConfig,
) -> Result<(), SyncError> {
    let (cmd_tx, mut evt_rx) = sync::spawn_sync(session, config.sync_config()).await?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = evt_rx.recv() => {
                let Some(event) = event else { break };
                match event {
                    SyncEvent::Connection(state) => println!("[connection] {state:?}"),
                    SyncEvent::TaskUpserted(task) => print_task(&task),
                    SyncEvent::TaskRemoved(id) => println!("[deleted] {id}"),
                    SyncEvent::Reloaded { count } => println!("[reloaded] {count} tasks"),
                    SyncEvent::CommandFailed { command, error } => {
                        println!("[failed] {command}: {error}");
                    }
                    SyncEvent::SessionEnded => {
                        println!("Session ended; sign in again");
                        break;
                    }
                }
            }
        }
    }

    let _ = cmd_tx.send(SyncCommand::Shutdown).await;
    Ok(())
}

fn print_task(task: &Task) {
    let due = task
        .due_date
        .map_or_else(String::new, |d| format!(" due {d}"));
    println!(
        "{:>6}  [{}] ({}) {}{due}",
        task.id, task.status, task.priority, task.title
    );
}

fn password_or_prompt(password: Option<String>) -> io::Result<String> {
    if let Some(password) = password {
        return Ok(password);
    }
    print!("Password: ");
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}
