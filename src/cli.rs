//! Command-line surface. Thin wrappers over the dispatcher; all task
//! semantics live behind the `TaskManager` boundary.

use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use tracing::info;

use crate::daemon::{self, DaemonClient, Supervisor};
use crate::dispatch::Dispatcher;
use crate::models::{Task, TaskStatus};
use crate::utils::error::{TodoError, TodoResult};
use crate::utils::paths;

#[derive(Debug, Parser)]
#[command(name = "todoat", about = "Task manager federating local and remote backends", version)]
pub struct Cli {
    /// Backend to operate on; optional when exactly one is configured.
    #[arg(short, long, global = true)]
    pub backend: Option<String>,

    #[command(subcommand)]
    pub command: CliCommand,
}

#[derive(Debug, Subcommand)]
pub enum CliCommand {
    /// Show all lists, or the tasks of one list
    List { list: Option<String> },
    /// Add a task to a list (the list is created if missing)
    Add {
        list: String,
        summary: Vec<String>,
        #[arg(short, long)]
        priority: Option<u8>,
        #[arg(short, long, value_name = "YYYY-MM-DD")]
        due: Option<String>,
    },
    /// Mark a task completed (by UID or local id)
    Done { list: String, task: String },
    /// Delete a task (by UID or local id)
    Rm { list: String, task: String },
    /// Report which backends recognise the current environment
    Detect,
    /// Configuration helpers
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Synchronisation and daemon control
    Sync {
        #[command(subcommand)]
        command: SyncCommand,
    },
    /// Daemon lifecycle (alias namespace for `sync daemon ...`)
    #[command(hide = true)]
    Daemon {
        #[command(subcommand)]
        command: DaemonCommand,
    },
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Print resolved configuration and data locations
    Path,
}

#[derive(Debug, Subcommand)]
pub enum SyncCommand {
    /// Run one foreground sync cycle
    Now,
    /// Show queue depth, failures and daemon health
    Status,
    /// List unresolved conflicts
    Conflicts,
    /// Queue maintenance
    Queue {
        #[command(subcommand)]
        command: QueueCommand,
    },
    /// Daemon control
    Daemon {
        #[command(subcommand)]
        command: DaemonCommand,
    },
}

#[derive(Debug, Subcommand)]
pub enum QueueCommand {
    /// Discard all unsynced changes
    Clear,
}

#[derive(Debug, Subcommand)]
pub enum DaemonCommand {
    /// Start the background daemon
    Start {
        /// Override the tick interval for this daemon session
        #[arg(long)]
        interval: Option<u64>,
    },
    /// Run the daemon loop in this process (used by `start` internally)
    #[command(hide = true)]
    Run {
        #[arg(long)]
        interval: Option<u64>,
    },
    /// Ask the daemon to finish its cycle and exit
    Stop,
    /// Show daemon status
    Status,
    /// Force-terminate the daemon
    Kill,
}

pub async fn run(cli: Cli, dispatcher: &Dispatcher) -> TodoResult<()> {
    match cli.command {
        CliCommand::List { list } => cmd_list(dispatcher, cli.backend.as_deref(), list).await,
        CliCommand::Add {
            list,
            summary,
            priority,
            due,
        } => cmd_add(dispatcher, cli.backend.as_deref(), &list, &summary.join(" "), priority, due).await,
        CliCommand::Done { list, task } => {
            cmd_set_done(dispatcher, cli.backend.as_deref(), &list, &task).await
        }
        CliCommand::Rm { list, task } => {
            cmd_rm(dispatcher, cli.backend.as_deref(), &list, &task).await
        }
        CliCommand::Detect => cmd_detect(dispatcher),
        CliCommand::Config { command } => cmd_config(command),
        CliCommand::Sync { command } => cmd_sync(dispatcher, cli.backend.as_deref(), command).await,
        CliCommand::Daemon { command } => cmd_daemon(dispatcher, command).await,
    }
}

fn pick_backend(dispatcher: &Dispatcher, explicit: Option<&str>) -> TodoResult<String> {
    if let Some(name) = explicit {
        return Ok(name.to_string());
    }
    let mut names: Vec<&String> = dispatcher.config().backends.keys().collect();
    names.sort();
    match names.as_slice() {
        [only] => Ok((*only).clone()),
        [] => Err(TodoError::Configuration {
            reason: "no backends configured".to_string(),
        }),
        _ => Err(TodoError::Configuration {
            reason: format!(
                "several backends configured ({}); pass --backend",
                names
                    .iter()
                    .map(|n| n.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        }),
    }
}

async fn cmd_list(
    dispatcher: &Dispatcher,
    backend: Option<&str>,
    list: Option<String>,
) -> TodoResult<()> {
    let backend = pick_backend(dispatcher, backend)?;
    let manager = dispatcher.resolve(&backend).await?;

    match list {
        None => {
            for list in manager.get_lists().await? {
                let tasks = manager.get_tasks(&list.uid).await?;
                let open = tasks.iter().filter(|t| !t.status.is_done()).count();
                println!("{}  ({open}/{} open)", list.name, tasks.len());
            }
        }
        Some(name) => {
            let list = manager
                .get_list_by_name(&name)
                .await?
                .ok_or_else(|| TodoError::NotFound {
                    resource: format!("list {name}"),
                })?;
            for task in manager.get_tasks(&list.uid).await? {
                let marker = match task.status {
                    TaskStatus::NeedsAction => " ",
                    TaskStatus::InProgress => "~",
                    TaskStatus::Completed => "x",
                    TaskStatus::Cancelled => "-",
                };
                let id = task
                    .local_id
                    .map_or_else(|| task.uid.clone(), |id| id.to_string());
                let indent = if task.parent_uid.is_some() { "  " } else { "" };
                let due = task
                    .due
                    .map(|d| format!("  @{}", d.format("%Y-%m-%d")))
                    .unwrap_or_default();
                let priority = if task.priority > 0 {
                    format!("  !{}", task.priority)
                } else {
                    String::new()
                };
                println!("{indent}[{marker}] {id:>4}  {}{priority}{due}", task.summary);
            }
        }
    }
    Ok(())
}

async fn cmd_add(
    dispatcher: &Dispatcher,
    backend: Option<&str>,
    list_name: &str,
    summary: &str,
    priority: Option<u8>,
    due: Option<String>,
) -> TodoResult<()> {
    let backend = pick_backend(dispatcher, backend)?;
    let manager = dispatcher.resolve(&backend).await?;
    let list = manager.create_list(list_name).await?;

    let mut task = Task::new(&list.uid, summary);
    if let Some(priority) = priority {
        task = task.with_priority(priority);
    }
    if let Some(due) = due {
        let date = NaiveDate::parse_from_str(&due, "%Y-%m-%d").map_err(|e| {
            TodoError::InvalidInput {
                field: "due".to_string(),
                reason: format!("{due:?}: {e}"),
            }
        })?;
        if let Some(dt) = date.and_hms_opt(0, 0, 0) {
            task = task.with_due(dt.and_utc());
        }
    }

    let created = manager.create_task(&list.uid, task).await?;
    dispatcher.notify_write();
    println!(
        "added {} to {list_name}",
        created
            .local_id
            .map_or_else(|| created.uid.clone(), |id| format!("#{id}"))
    );
    Ok(())
}

async fn find_task(
    manager: &std::sync::Arc<dyn crate::backends::TaskManager>,
    list_uid: &str,
    key: &str,
) -> TodoResult<Task> {
    let tasks = manager.get_tasks(list_uid).await?;
    let by_id: Option<&Task> = key
        .parse::<i64>()
        .ok()
        .and_then(|id| tasks.iter().find(|t| t.local_id == Some(id)));
    by_id
        .or_else(|| tasks.iter().find(|t| t.uid == key))
        .cloned()
        .ok_or_else(|| TodoError::NotFound {
            resource: format!("task {key}"),
        })
}

async fn cmd_set_done(
    dispatcher: &Dispatcher,
    backend: Option<&str>,
    list_name: &str,
    key: &str,
) -> TodoResult<()> {
    let backend = pick_backend(dispatcher, backend)?;
    let manager = dispatcher.resolve(&backend).await?;
    let list = manager
        .get_list_by_name(list_name)
        .await?
        .ok_or_else(|| TodoError::NotFound {
            resource: format!("list {list_name}"),
        })?;

    let mut task = find_task(&manager, &list.uid, key).await?;
    task.set_status(TaskStatus::Completed, Utc::now());
    manager.update_task(&list.uid, task).await?;
    dispatcher.notify_write();
    println!("done");
    Ok(())
}

async fn cmd_rm(
    dispatcher: &Dispatcher,
    backend: Option<&str>,
    list_name: &str,
    key: &str,
) -> TodoResult<()> {
    let backend = pick_backend(dispatcher, backend)?;
    let manager = dispatcher.resolve(&backend).await?;
    let list = manager
        .get_list_by_name(list_name)
        .await?
        .ok_or_else(|| TodoError::NotFound {
            resource: format!("list {list_name}"),
        })?;

    let task = find_task(&manager, &list.uid, key).await?;
    manager.delete_task(&list.uid, &task.uid).await?;
    dispatcher.notify_write();
    println!("removed {}", task.summary);
    Ok(())
}

fn cmd_detect(dispatcher: &Dispatcher) -> TodoResult<()> {
    let found = dispatcher.detect();
    if found.is_empty() {
        println!("no backend recognises this environment");
    }
    for (name, info) in found {
        println!("{name}: {info}");
    }
    Ok(())
}

fn cmd_config(command: ConfigCommand) -> TodoResult<()> {
    match command {
        ConfigCommand::Path => {
            println!("config:  {}", paths::config_file()?.display());
            println!("data:    {}", paths::data_dir()?.display());
            println!("runtime: {}", paths::runtime_dir()?.display());
        }
    }
    Ok(())
}

async fn cmd_sync(
    dispatcher: &Dispatcher,
    backend: Option<&str>,
    command: SyncCommand,
) -> TodoResult<()> {
    match command {
        SyncCommand::Now => {
            let names = match backend {
                Some(name) => vec![name.to_string()],
                None => dispatcher.config().remote_backends(),
            };
            if names.is_empty() {
                println!("no remote backends configured");
                return Ok(());
            }
            for name in names {
                let engine = dispatcher.engine(&name).await?;
                let outcome = engine.run_cycle().await?;
                if outcome.skipped {
                    println!("{name}: unreachable, changes stay queued");
                } else {
                    println!(
                        "{name}: pulled {}, pushed {}, conflicts {} ({} resolved), failed {}",
                        outcome.pulled,
                        outcome.pushed,
                        outcome.conflicts_detected,
                        outcome.conflicts_resolved,
                        outcome.failed
                    );
                }
            }
            Ok(())
        }
        SyncCommand::Status => {
            for name in dispatcher.config().remote_backends() {
                let engine = dispatcher.engine(&name).await?;
                let stats = engine.queue().stats().await?;
                println!(
                    "{name}: {} pending, {} processing, {} failed, {} done",
                    stats.pending, stats.processing, stats.failed, stats.done
                );
                for op in engine.queue().failed().await? {
                    println!(
                        "  failed #{} {} {} after {} retries: {}",
                        op.seq,
                        op.kind.as_str(),
                        op.target_uid,
                        op.retries,
                        op.last_error.unwrap_or_default()
                    );
                }
            }

            let client = DaemonClient::new(&paths::socket_path()?);
            match client.status().await {
                Ok(status) => {
                    println!(
                        "daemon: pid {} every {}s, {} syncs, {}",
                        status.pid,
                        status.interval_secs,
                        status.sync_count,
                        if status.healthy { "healthy" } else { "unhealthy" }
                    );
                    for (name, backend) in status.backends {
                        println!("  {name}: circuit {} ({} failures)", backend.circuit, backend.failures);
                    }
                }
                Err(_) => println!("daemon: not running"),
            }
            Ok(())
        }
        SyncCommand::Conflicts => {
            for name in dispatcher.config().remote_backends() {
                let cache = dispatcher.cache(&name).await?;
                for conflict in cache.unresolved_conflicts().await? {
                    let remote = conflict
                        .remote
                        .as_ref()
                        .map_or("deleted remotely".to_string(), |t| t.summary.clone());
                    println!(
                        "{name}: {} local {:?} / remote {:?} (since {})",
                        conflict.uid,
                        conflict.local.summary,
                        remote,
                        conflict.detected_at.format("%Y-%m-%d %H:%M")
                    );
                }
            }
            Ok(())
        }
        SyncCommand::Queue { command } => match command {
            QueueCommand::Clear => {
                for name in dispatcher.config().remote_backends() {
                    let engine = dispatcher.engine(&name).await?;
                    let removed = engine.queue().clear().await?;
                    println!("{name}: discarded {removed} queued operations");
                }
                Ok(())
            }
        },
        SyncCommand::Daemon { command } => cmd_daemon(dispatcher, command).await,
    }
}

async fn cmd_daemon(dispatcher: &Dispatcher, command: DaemonCommand) -> TodoResult<()> {
    match command {
        DaemonCommand::Start { interval } => {
            let client = DaemonClient::new(&paths::socket_path()?);
            if client.is_running().await {
                println!("daemon already running");
                return Ok(());
            }
            let pid = daemon::spawn_detached(interval)?;
            println!("daemon started (pid {pid})");
            Ok(())
        }
        DaemonCommand::Run { interval } => {
            let engines = dispatcher.engines().await?;
            let supervisor =
                Supervisor::start(dispatcher.config().clone(), engines, interval)?;
            supervisor.run().await
        }
        DaemonCommand::Stop => {
            let client = DaemonClient::new(&paths::socket_path()?);
            client.stop().await?;
            println!("stop requested");
            Ok(())
        }
        DaemonCommand::Status => {
            let client = DaemonClient::new(&paths::socket_path()?);
            match client.status().await {
                Ok(status) => {
                    println!("{}", serde_json::to_string_pretty(&status)?);
                }
                Err(_) => println!("daemon: not running"),
            }
            Ok(())
        }
        DaemonCommand::Kill => {
            if daemon::kill_daemon().await? {
                info!("daemon killed");
                println!("daemon killed");
            } else {
                println!("daemon was not running");
            }
            Ok(())
        }
    }
}
