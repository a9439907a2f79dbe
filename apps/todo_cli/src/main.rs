use std::{collections::HashSet, io::Write, sync::Arc};

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use client_core::{
    load_settings, AuthSession, ClientEvent, CommandOutcome, HttpGateway, TodoCommand,
    TodoDispatcher,
};
use shared::{
    domain::{Priority, Todo, TodoId, TodoStatus},
    protocol::{CreateTodoRequest, UpdateTodoRequest},
};
use tokio::sync::broadcast;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Cli {
    /// Overrides `api_url` from todo_client.toml and the environment.
    #[arg(long)]
    api_url: Option<String>,
    /// Confirmation reads per mutation before it is rolled back.
    #[arg(long)]
    max_attempts: Option<u32>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    List,
    Add {
        title: String,
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        priority: Option<String>,
        /// RFC 3339, e.g. 2024-03-20T17:00:00Z
        #[arg(long)]
        due_date: Option<String>,
    },
    Toggle {
        id: String,
    },
    Edit {
        id: String,
        #[arg(long)]
        title: Option<String>,
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        priority: Option<String>,
        #[arg(long)]
        due_date: Option<String>,
        /// pending or completed
        #[arg(long)]
        status: Option<String>,
    },
    Delete {
        id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
    let cli = Cli::parse();

    let mut settings = load_settings();
    if let Some(api_url) = cli.api_url {
        settings.api_url = api_url;
    }
    if let Some(max_attempts) = cli.max_attempts {
        settings.poll_max_attempts = max_attempts;
    }

    let (events, _) = broadcast::channel(1024);
    let session = match &settings.token_path {
        Some(path) => AuthSession::load(path.clone()).await?,
        None => AuthSession::anonymous(),
    }
    .notify(events.clone());
    let gateway = HttpGateway::from_settings(&settings, Arc::new(session))?;
    let dispatcher =
        TodoDispatcher::new_with_events(Arc::new(gateway), settings.backoff_policy(), events);
    info!(api_url = %settings.api_url, "todo_cli: starting");

    let watcher = tokio::spawn(watch(
        dispatcher.subscribe_events(),
        std::io::stdout(),
        std::io::stderr(),
    ));
    let result = run(&dispatcher, cli.command).await;
    let todos = dispatcher.store().snapshot().await;

    // Dropping the last sender lets the watcher print what is still queued and exit.
    drop(dispatcher);
    watcher.await.context("event watcher stopped unexpectedly")?;
    result?;

    for todo in todos {
        println!("{}", render(&todo));
    }
    Ok(())
}

async fn run(dispatcher: &TodoDispatcher, command: Command) -> Result<()> {
    settle(dispatcher.dispatch(TodoCommand::Load).await)?;

    let command = match command {
        Command::List => return Ok(()),
        Command::Add {
            title,
            description,
            priority,
            due_date,
        } => TodoCommand::Create(CreateTodoRequest {
            title,
            description,
            priority: priority.as_deref().map(parse_priority).transpose()?,
            due_date: due_date.as_deref().map(parse_due_date).transpose()?,
        }),
        Command::Toggle { id } => TodoCommand::Toggle {
            id: TodoId::new(id),
        },
        Command::Edit {
            id,
            title,
            description,
            priority,
            due_date,
            status,
        } => TodoCommand::Update {
            id: TodoId::new(id),
            patch: UpdateTodoRequest {
                title,
                description,
                status: status.as_deref().map(parse_status).transpose()?,
                priority: priority.as_deref().map(parse_priority).transpose()?,
                due_date: due_date.as_deref().map(parse_due_date).transpose()?,
            },
        },
        Command::Delete { id } => TodoCommand::Delete {
            id: TodoId::new(id),
        },
    };

    settle(dispatcher.dispatch(command).await)
}

fn settle(outcome: CommandOutcome) -> Result<()> {
    match outcome {
        CommandOutcome::Confirmed(_) => Ok(()),
        CommandOutcome::Ignored(reason) => bail!("nothing to do: {reason:?}"),
        CommandOutcome::Superseded => Ok(()),
        CommandOutcome::Failed { message, cause } => Err(anyhow!(cause).context(message)),
    }
}

/// Prints rows while they are still waiting on the backend. Returns once every
/// sender is gone and the queue is drained.
async fn watch<O: Write, E: Write>(
    mut events: broadcast::Receiver<ClientEvent>,
    mut out: O,
    mut err: E,
) -> (O, E) {
    let mut shown = HashSet::new();
    loop {
        match events.recv().await {
            Ok(ClientEvent::TodosChanged(todos)) => {
                for todo in todos.iter().filter(|todo| todo.status.is_transient()) {
                    let line = render(todo);
                    if shown.insert(line.clone()) {
                        let _ = writeln!(out, "{line}");
                    }
                }
            }
            Ok(ClientEvent::Error(message)) => {
                let _ = writeln!(err, "error: {message}");
            }
            Ok(ClientEvent::ErrorCleared) => {}
            Ok(ClientEvent::SessionExpired) => {
                let _ = writeln!(err, "session expired; log in again");
            }
            Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => return (out, err),
        }
    }
}

fn render(todo: &Todo) -> String {
    let mark = if todo.status == TodoStatus::Completed {
        "[x]"
    } else {
        "[ ]"
    };
    let suffix = match todo.status {
        TodoStatus::Creating => " (Creating...)",
        TodoStatus::Deleting => " - Deleting",
        TodoStatus::Completing | TodoStatus::Updating => " (Saving...)",
        TodoStatus::Pending | TodoStatus::Completed => "",
    };
    let due = todo
        .due_date
        .map(|due| format!(" due {}", due.format("%Y-%m-%d %H:%M")))
        .unwrap_or_default();
    format!(
        "{mark} {:<8} {}{suffix} [{:?}]{due}",
        todo.id.as_str(),
        todo.title,
        todo.priority
    )
}

fn parse_priority(raw: &str) -> Result<Priority> {
    match raw.to_ascii_lowercase().as_str() {
        "low" => Ok(Priority::Low),
        "medium" => Ok(Priority::Medium),
        "high" => Ok(Priority::High),
        other => bail!("unknown priority '{other}' (low, medium, high)"),
    }
}

fn parse_status(raw: &str) -> Result<TodoStatus> {
    if raw.eq_ignore_ascii_case("completed") {
        Ok(TodoStatus::Completed)
    } else if raw.eq_ignore_ascii_case("pending") {
        Ok(TodoStatus::Pending)
    } else {
        bail!("status must be pending or completed, got '{raw}'")
    }
}

fn parse_due_date(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|due| due.with_timezone(&Utc))
        .with_context(|| format!("invalid due date '{raw}'"))
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
