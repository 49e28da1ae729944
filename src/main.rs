//! Colony - filesystem-mediated coordination for cooperating agent instances
//!
//! Command-line access to a project's shared memories, tasks, instances and
//! messages. Results are printed to stdout as JSON; logs go to stderr.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use colony::inbox::{MessageType, OutgoingMessage};
use colony::memory::{MemoryQuery, MemoryType, NewMemory};
use colony::registry::InstanceStatus;
use colony::tasks::{Bucket, DelegateRequest, Priority};
use colony::{Coordinator, CoordinatorOptions};
use serde::Serialize;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "colony")]
#[command(version)]
#[command(about = "Shared memory, task delegation and messaging for agent instances")]
struct Cli {
    /// Project directory holding `.colony/`
    #[arg(short, long, env = "COLONY_PROJECT", default_value = ".")]
    project: PathBuf,

    /// Instance id to act as (generated when absent)
    #[arg(short, long, env = "COLONY_INSTANCE")]
    instance: Option<String>,

    /// Capabilities this instance declares
    #[arg(long = "capability", env = "COLONY_CAPABILITIES", value_delimiter = ',')]
    capabilities: Vec<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, env = "COLONY_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the directory layout and register this instance
    Init,

    /// Store a memory
    Remember {
        #[arg(short = 't', long = "type")]
        memory_type: MemoryType,
        #[arg(long)]
        title: String,
        #[arg(long)]
        summary: String,
        #[arg(long)]
        details: Option<String>,
        #[arg(long = "tag")]
        tags: Vec<String>,
        #[arg(long)]
        importance: Option<f64>,
        #[arg(long)]
        confidence: Option<f64>,
        /// Related file paths
        #[arg(long = "file")]
        files: Vec<String>,
        /// Ids of memories this one replaces
        #[arg(long)]
        supersedes: Vec<String>,
    },

    /// Query memories
    Recall {
        /// Case-insensitive text to search for
        text: Option<String>,
        #[arg(short = 't', long = "type")]
        memory_type: Option<MemoryType>,
        #[arg(long)]
        tag: Option<String>,
        #[arg(long)]
        file: Option<String>,
        #[arg(long)]
        include_superseded: bool,
        #[arg(long)]
        since: Option<DateTime<Utc>>,
        /// Maximum results (0 = unlimited)
        #[arg(long, default_value = "0")]
        limit: usize,
    },

    /// Most recent memories
    Recent {
        #[arg(long, default_value = "10")]
        limit: usize,
    },

    /// Memories at or above an importance threshold
    Important {
        #[arg(long)]
        threshold: Option<f64>,
    },

    /// Memory timeline, newest first
    Timeline {
        #[arg(long)]
        since: Option<DateTime<Utc>>,
        #[arg(long, default_value = "20")]
        limit: usize,
    },

    /// A memory with its temporal neighbours and supersede chain
    Context {
        id: String,
        #[arg(long, default_value = "3")]
        window: usize,
    },

    /// Archive a memory
    Archive { id: String },

    /// Delegate a task
    Delegate {
        #[arg(long)]
        title: String,
        #[arg(long)]
        description: String,
        #[arg(long, default_value = "normal")]
        priority: Priority,
        #[arg(long)]
        instructions: Option<String>,
        /// Capabilities the claimant must declare
        #[arg(long = "require")]
        required: Vec<String>,
        /// Address the task to one instance
        #[arg(long)]
        to: Option<String>,
        #[arg(long)]
        timeout_minutes: Option<i64>,
    },

    /// Tasks this instance may claim, or every task in one bucket
    Tasks {
        #[arg(long, value_parser = parse_bucket)]
        bucket: Option<Bucket>,
    },

    /// Show one task
    Task { id: String },

    /// Claim a pending task
    Claim { id: String },

    /// Start a claimed task
    Start { id: String },

    /// Report progress on a task
    Progress {
        id: String,
        message: String,
        #[arg(long)]
        percent: Option<u8>,
    },

    /// Complete a task
    Complete {
        id: String,
        #[arg(long)]
        summary: Option<String>,
        /// JSON output payload
        #[arg(long)]
        output: Option<String>,
    },

    /// Fail a task
    Fail { id: String, error: String },

    /// Cancel a task
    Cancel {
        id: String,
        #[arg(long)]
        reason: Option<String>,
    },

    /// Finished delegated tasks awaiting acknowledgement
    Waits,

    /// Acknowledge a finished task
    Ack { id: String },

    /// Non-terminal tasks past their timeout
    Overdue,

    /// Set this instance's status
    Status {
        status: InstanceStatus,
        #[arg(long)]
        working_on: Option<String>,
    },

    /// Live instances, optionally filtered by capability
    Instances {
        #[arg(long = "require")]
        required: Vec<String>,
    },

    /// Record a file as touched by this instance
    Touch { path: String },

    /// Send a message
    Send {
        to: String,
        message: String,
        #[arg(long = "type", default_value = "info")]
        message_type: MessageType,
        #[arg(long)]
        subject: Option<String>,
        #[arg(long)]
        task: Option<String>,
    },

    /// Messages for this instance
    Inbox {
        /// Include read messages
        #[arg(long)]
        all: bool,
    },

    /// Mark a message read
    Read { id: String },

    /// Shared activity log, newest first
    Activity {
        #[arg(long, default_value = "20")]
        limit: usize,
    },

    /// Take over a previous instance's identity and waits
    Recover { previous: String },

    /// Mark this instance offline
    Offline,

    /// Rebuild the memory index and repair task buckets
    Reconcile,

    /// Delete old read messages
    Cleanup,

    /// Show the effective configuration
    Config,
}

fn parse_bucket(s: &str) -> std::result::Result<Bucket, String> {
    match s {
        "pending" => Ok(Bucket::Pending),
        "active" => Ok(Bucket::Active),
        "completed" => Ok(Bucket::Completed),
        "failed" => Ok(Bucket::Failed),
        other => Err(format!("unknown bucket '{}'", other)),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs on stderr keep stdout parseable
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("colony={}", log_level).into()),
        )
        .with(
            cli.log_json
                .then(|| tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr)),
        )
        .with(
            (!cli.log_json).then(|| tracing_subscriber::fmt::layer().with_writer(std::io::stderr)),
        )
        .init();

    let coordinator = Coordinator::open(
        &cli.project,
        CoordinatorOptions {
            instance_id: cli.instance,
            capabilities: cli.capabilities,
            tool: Some("colony-cli".to_string()),
            ..Default::default()
        },
    )
    .await
    .context("Failed to open project")?;

    run(&coordinator, cli.command).await
}

async fn run(colony: &Coordinator, command: Commands) -> Result<()> {
    match command {
        Commands::Init => print_json(&colony.init().await?),
        Commands::Remember {
            memory_type,
            title,
            summary,
            details,
            tags,
            importance,
            confidence,
            files,
            supersedes,
        } => {
            let mut input = NewMemory::new(memory_type, title, summary).tags(tags);
            if let Some(details) = details {
                input = input.details(details);
            }
            if let Some(importance) = importance {
                input = input.importance(importance);
            }
            if let Some(confidence) = confidence {
                input = input.confidence(confidence);
            }
            for file in files {
                input = input.related_file(file);
            }
            for id in supersedes {
                input = input.supersedes(id);
            }
            print_json(&colony.remember(input).await?)
        }
        Commands::Recall {
            text,
            memory_type,
            tag,
            file,
            include_superseded,
            since,
            limit,
        } => {
            let mut query = match text {
                Some(text) => MemoryQuery::text(text),
                None => MemoryQuery::all(),
            };
            if let Some(memory_type) = memory_type {
                query = query.with_type(memory_type);
            }
            if let Some(tag) = tag {
                query = query.with_tag(tag);
            }
            if let Some(file) = file {
                query = query.with_file(file);
            }
            if include_superseded {
                query = query.include_superseded();
            }
            if let Some(since) = since {
                query = query.since(since);
            }
            print_json(&colony.recall(&query.limit(limit)).await?)
        }
        Commands::Recent { limit } => print_json(&colony.get_recent(limit).await?),
        Commands::Important { threshold } => print_json(&colony.get_important(threshold).await?),
        Commands::Timeline { since, limit } => print_json(&colony.get_timeline(since, limit).await),
        Commands::Context { id, window } => print_json(&colony.get_context(&id, window).await?),
        Commands::Archive { id } => print_json(&colony.archive(&id).await?),
        Commands::Delegate {
            title,
            description,
            priority,
            instructions,
            required,
            to,
            timeout_minutes,
        } => {
            let mut request = DelegateRequest::new(title, description).priority(priority);
            if let Some(instructions) = instructions {
                request = request.instructions(instructions);
            }
            for capability in required {
                request = request.capability(capability);
            }
            if let Some(to) = to {
                request = request.for_instance(to);
            }
            if let Some(minutes) = timeout_minutes {
                let timeout = chrono::Duration::try_minutes(minutes)
                    .with_context(|| format!("timeout of {} minutes is out of range", minutes))?;
                request = request.timeout(timeout);
            }
            print_json(&colony.delegate(request).await?)
        }
        Commands::Tasks { bucket } => match bucket {
            Some(bucket) => print_json(&colony.tasks().list(bucket).await?),
            None => print_json(&colony.get_available_tasks().await?),
        },
        Commands::Task { id } => print_json(&colony.get_task(&id).await?),
        Commands::Claim { id } => print_json(&colony.claim_task(&id).await?),
        Commands::Start { id } => print_json(&colony.start_task(&id).await?),
        Commands::Progress {
            id,
            message,
            percent,
        } => print_json(&colony.update_task_progress(&id, &message, percent).await?),
        Commands::Complete {
            id,
            summary,
            output,
        } => {
            let output = output
                .map(|raw| serde_json::from_str(&raw))
                .transpose()
                .context("--output must be valid JSON")?;
            print_json(&colony.complete_task(&id, summary, output).await?)
        }
        Commands::Fail { id, error } => print_json(&colony.fail_task(&id, &error).await?),
        Commands::Cancel { id, reason } => print_json(&colony.cancel_task(&id, reason).await?),
        Commands::Waits => print_json(&colony.check_delegated_tasks().await?),
        Commands::Ack { id } => print_json(&colony.acknowledge_task(&id).await?),
        Commands::Overdue => print_json(&colony.timed_out_tasks().await?),
        Commands::Status { status, working_on } => {
            print_json(&colony.set_status(status, working_on).await?)
        }
        Commands::Instances { required } => {
            print_json(&colony.find_instances(&required).await?)
        }
        Commands::Touch { path } => print_json(&colony.touch_file(&path).await?),
        Commands::Send {
            to,
            message,
            message_type,
            subject,
            task,
        } => {
            let mut outgoing = OutgoingMessage::new(to, message_type, message);
            if let Some(subject) = subject {
                outgoing = outgoing.subject(subject);
            }
            if let Some(task) = task {
                outgoing = outgoing.related_task(task);
            }
            print_json(&colony.send_message(outgoing).await?)
        }
        Commands::Inbox { all } => print_json(&colony.get_messages(!all).await?),
        Commands::Read { id } => print_json(&colony.mark_read(&id).await?),
        Commands::Activity { limit } => print_json(&colony.get_activity(limit).await?),
        Commands::Recover { previous } => print_json(&colony.recover_session(&previous).await?),
        Commands::Offline => {
            colony.shutdown().await?;
            print_json(&colony.get_instance(&colony.instance_id().await).await?)
        }
        Commands::Reconcile => print_json(&colony.reconcile().await?),
        Commands::Cleanup => print_json(&colony.cleanup_inbox().await?),
        Commands::Config => {
            println!("{}", colony.config().to_toml_string()?);
            Ok(())
        }
    }
}
