mod api;
mod cache;
mod config;
mod db;
mod queue;
mod store;
mod sync;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::Result;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use api::transport::{HttpTransport, Transport};
use api::types::{CreateTaskRequest, TaskPriority, TaskStatus, UpdateTaskRequest};
use api::Api;
use cache::OptimisticCache;
use config::Config;
use db::Database;
use queue::OfflineQueue;
use store::AuthStore;
use sync::{ConnectivityMonitor, MutationOutcome, SyncCoordinator, SyncEvent};

#[derive(Parser, Debug)]
#[command(name = "donepin")]
#[command(about = "A command-line client for the DonePin notes and tasks service")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/donepin/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Do not touch the network; queue mutations for a later `sync`
  #[arg(long)]
  offline: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Log in and persist the auth token
  Login {
    email: String,
    #[arg(long, env = "DONEPIN_PASSWORD", hide_env_values = true)]
    password: String,
  },
  /// Create an account and log in
  Register {
    email: String,
    #[arg(long)]
    name: Option<String>,
    #[arg(long, env = "DONEPIN_PASSWORD", hide_env_values = true)]
    password: String,
  },
  /// Forget the persisted auth token
  Logout,
  /// Capture and manage notes
  Note {
    #[command(subcommand)]
    action: NoteAction,
  },
  /// Manage tasks
  Task {
    #[command(subcommand)]
    action: TaskAction,
  },
  /// Manage tags
  Tag {
    #[command(subcommand)]
    action: TagAction,
  },
  /// Manage people
  People {
    #[command(subcommand)]
    action: PeopleAction,
  },
  /// Search tasks and notes
  Search { query: String },
  /// Replay queued offline mutations
  Sync {
    /// Show queued mutations without replaying them
    #[arg(long)]
    status: bool,
  },
  /// Show completion analytics
  Analytics,
}

#[derive(Subcommand, Debug)]
enum NoteAction {
  /// Capture a new note into the inbox
  Add { content: String },
  List,
  Rm { id: String },
  /// Convert a note into a task
  Convert { id: String },
}

#[derive(Subcommand, Debug)]
enum TaskAction {
  Add {
    title: String,
    #[arg(long)]
    description: Option<String>,
    #[arg(long, value_parser = parse_priority)]
    priority: Option<TaskPriority>,
  },
  List,
  Show { id: String },
  Update {
    id: String,
    #[arg(long)]
    title: Option<String>,
    #[arg(long, value_parser = parse_status)]
    status: Option<TaskStatus>,
    #[arg(long, value_parser = parse_priority)]
    priority: Option<TaskPriority>,
  },
  Rm { id: String },
  /// Show tasks grouped by board column
  Board,
}

#[derive(Subcommand, Debug)]
enum TagAction {
  Add {
    name: String,
    /// Hex display color
    #[arg(long, default_value = "#888888")]
    color: String,
  },
  List,
  Rm { id: String },
}

#[derive(Subcommand, Debug)]
enum PeopleAction {
  Add {
    name: String,
    #[arg(long)]
    email: Option<String>,
  },
  List,
}

fn parse_status(s: &str) -> Result<TaskStatus, String> {
  serde_json::from_value(Value::String(s.to_lowercase()))
    .map_err(|_| format!("expected one of: inbox, todo, in-progress, blocked, done (got {s})"))
}

fn parse_priority(s: &str) -> Result<TaskPriority, String> {
  serde_json::from_value(Value::String(s.to_uppercase()))
    .map_err(|_| format!("expected one of: low, medium, high (got {s})"))
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _log_guard = init_tracing();

  let config = Config::load(args.config.as_deref())?;

  let db = match &config.database_path {
    Some(path) => Database::open_at(path)?,
    None => Database::open()?,
  };
  let auth = AuthStore::new(db.clone());
  let transport: Arc<dyn Transport> = Arc::new(HttpTransport::new(&config, auth.clone())?);
  let queue = Arc::new(OfflineQueue::new(db));
  let cache = OptimisticCache::new();
  let monitor = ConnectivityMonitor::new(!args.offline);
  let (coordinator, mut events) =
    SyncCoordinator::new(transport.clone(), queue, cache, monitor);
  let api = Api::new(transport, coordinator, auth);

  let result = run(args.command, &api).await;
  print_events(&mut events);
  result
}

/// Write logs to a file so stdout stays clean for command output.
fn init_tracing() -> Option<tracing_appender::non_blocking::WorkerGuard> {
  let log_dir = dirs::data_dir()?.join("donepin").join("logs");
  std::fs::create_dir_all(&log_dir).ok()?;

  let appender = tracing_appender::rolling::daily(log_dir, "donepin.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);

  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .with_writer(writer)
    .with_ansi(false)
    .init();

  Some(guard)
}

async fn run(command: Command, api: &Api) -> Result<()> {
  match command {
    Command::Login { email, password } => {
      let user = api.login(&email, &password).await?;
      println!("Logged in as {} ({})", user.name.as_deref().unwrap_or(&user.email), user.email);
    }

    Command::Register {
      email,
      name,
      password,
    } => {
      let user = api.register(&email, &password, name).await?;
      println!("Registered {}", user.email);
    }

    Command::Logout => {
      api.logout()?;
      println!("Logged out");
    }

    Command::Note { action } => match action {
      NoteAction::Add { content } => {
        let outcome = api.create_note(&content).await?;
        report("note captured", &outcome);
      }
      NoteAction::List => {
        for note in api.get_notes().await? {
          let marker = if note.task_id.is_some() { "->" } else { "  " };
          println!(
            "{} {} {} {}",
            note.id,
            note.created_at.format("%Y-%m-%d %H:%M"),
            marker,
            note.content
          );
        }
      }
      NoteAction::Rm { id } => {
        let outcome = api.delete_note(&id).await?;
        report("note deleted", &outcome);
      }
      NoteAction::Convert { id } => {
        let outcome = api.convert_note(&id).await?;
        report("note converted to task", &outcome);
      }
    },

    Command::Task { action } => match action {
      TaskAction::Add {
        title,
        description,
        priority,
      } => {
        let request = CreateTaskRequest {
          title,
          description,
          priority,
          ..Default::default()
        };
        let outcome = api.create_task(&request).await?;
        report("task created", &outcome);
      }
      TaskAction::List => {
        for task in api.get_tasks().await? {
          println!(
            "{}  [{}]  {:?}  {}",
            task.id,
            task.status.label(),
            task.priority,
            task.title
          );
        }
      }
      TaskAction::Show { id } => {
        let task = api.get_task(&id).await?;
        println!("{}  [{}]", task.title, task.status.label());
        println!("  id:       {}", task.id);
        println!("  priority: {:?}", task.priority);
        if let Some(description) = &task.description {
          println!("  {description}");
        }
        if let Some(due) = task.due_date {
          println!("  due:      {}", due.format("%Y-%m-%d"));
        }
        if !task.tags.is_empty() {
          let names: Vec<&str> = task.tags.iter().map(|t| t.name.as_str()).collect();
          println!("  tags:     {}", names.join(", "));
        }
      }
      TaskAction::Update {
        id,
        title,
        status,
        priority,
      } => {
        let request = UpdateTaskRequest {
          title,
          status,
          priority,
          ..Default::default()
        };
        let outcome = api.update_task(&id, &request).await?;
        report("task updated", &outcome);
      }
      TaskAction::Rm { id } => {
        let outcome = api.delete_task(&id).await?;
        report("task deleted", &outcome);
      }
      TaskAction::Board => {
        let board = api.get_board().await?;
        let columns = [
          ("TODO", &board.todo),
          ("IN PROGRESS", &board.in_progress),
          ("BLOCKED", &board.blocked),
          ("DONE", &board.done),
        ];
        for (name, tasks) in columns {
          println!("{} ({})", name, tasks.len());
          for task in tasks {
            println!("  {}  {}", task.id, task.title);
            if let Some(reason) = &task.blocker_reason {
              println!("     blocked: {reason}");
            }
          }
        }
      }
    },

    Command::Tag { action } => match action {
      TagAction::Add { name, color } => {
        let outcome = api.create_tag(&name, &color).await?;
        report("tag created", &outcome);
      }
      TagAction::List => {
        for tag in api.get_tags().await? {
          println!("{}  {}  {}", tag.id, tag.color, tag.name);
        }
      }
      TagAction::Rm { id } => {
        let outcome = api.delete_tag(&id).await?;
        report("tag deleted", &outcome);
      }
    },

    Command::People { action } => match action {
      PeopleAction::Add { name, email } => {
        let outcome = api.create_person(&name, email).await?;
        report("person added", &outcome);
      }
      PeopleAction::List => {
        for person in api.get_people().await? {
          println!(
            "{}  {}  {}",
            person.id,
            person.name,
            person.email.as_deref().unwrap_or("-")
          );
        }
      }
    },

    Command::Search { query } => {
      let results = api.search(&query).await?;
      for task in &results.tasks {
        println!("task  {}  {}", task.id, task.title);
      }
      for note in &results.notes {
        println!("note  {}  {}", note.id, note.content);
      }
      if results.tasks.is_empty() && results.notes.is_empty() {
        println!("No results for \"{query}\"");
      }
    }

    Command::Sync { status } => {
      if status {
        let intents = api.coordinator().queue().peek_all()?;
        if intents.is_empty() {
          println!("Nothing queued");
        }
        for intent in intents {
          println!(
            "{}  {} {}  queued {}  (retries: {})",
            intent.id,
            intent.method,
            intent.endpoint,
            intent.timestamp.format("%Y-%m-%d %H:%M:%S"),
            intent.retries
          );
        }
      } else {
        api.coordinator().monitor().set_online(true);
        let summary = api.coordinator().drain().await?;
        println!(
          "Synced: {} replayed, {} kept for retry, {} dropped",
          summary.replayed, summary.kept, summary.dropped
        );
      }
    }

    Command::Analytics => {
      let analytics = api.get_analytics().await?;
      println!("Total tasks:      {}", analytics.total_tasks);
      println!("Completed:        {}", analytics.completed_tasks);
      println!("In progress:      {}", analytics.in_progress_tasks);
      println!("Done today:       {}", analytics.tasks_completed_today);
      println!(
        "Avg completion:   {:.1} min",
        analytics.average_completion_time
      );
    }
  }

  Ok(())
}

fn report(what: &str, outcome: &MutationOutcome) {
  match outcome {
    MutationOutcome::Confirmed(_) => println!("{what}"),
    MutationOutcome::Queued { .. } => println!("{what} (offline, queued for sync)"),
  }
}

/// Surface pipeline notifications gathered while the command ran.
fn print_events(events: &mut mpsc::UnboundedReceiver<SyncEvent>) {
  while let Ok(event) = events.try_recv() {
    match event {
      SyncEvent::Offline => eprintln!("! offline, actions will be queued"),
      SyncEvent::Online { pending } if pending > 0 => {
        eprintln!("! back online, {pending} queued mutations pending")
      }
      SyncEvent::Online { .. } => {}
      SyncEvent::Queued { method, endpoint, .. } => {
        eprintln!("~ queued {method} {endpoint}")
      }
      SyncEvent::Replayed { endpoint, .. } => eprintln!("+ synced {endpoint}"),
      SyncEvent::Dropped { endpoint, reason, .. } => {
        eprintln!("x dropped {endpoint}: {reason}")
      }
      SyncEvent::RolledBack { endpoint, reason } => {
        eprintln!("x {endpoint} failed, change reverted: {reason}")
      }
      SyncEvent::DrainFinished(_) => {}
    }
  }
}
