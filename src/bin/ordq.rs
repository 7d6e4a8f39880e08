//! ordq CLI: operator interface to a Postgres-backed queue.

use std::time::Duration;

use clap::{Parser, Subcommand};
use ordq::config::{Config, QueueConfig};
use ordq::kv::PgKv;
use ordq::model::{NackOptions, NewTask, Task, TaskId};
use ordq::queue::TaskQueue;
use ordq::telemetry::{TelemetryConfig, init_telemetry};
use ordq::worker::Reaper;
use secrecy::ExposeSecret;

#[derive(Parser)]
#[command(name = "ordq", about = "Ordered-key priority task queue")]
struct Cli {
    /// Queue to operate on (overrides the name in ORDQ_QUEUE_CONFIG)
    #[arg(long, global = true)]
    queue: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Add a task
    Enqueue {
        /// Priority (lower = more urgent, may be negative)
        #[arg(allow_negative_numbers = true)]
        priority: i64,
        /// Payload, stored as UTF-8 bytes
        payload: String,
        /// JSON metadata
        #[arg(long)]
        metadata: Option<String>,
        /// Keep the task invisible for this long
        #[arg(long, default_value_t = 0)]
        delay_ms: u64,
        /// Use this id instead of a fresh UUID
        #[arg(long)]
        id: Option<String>,
    },
    /// Claim the next ready task
    Dequeue {
        #[arg(long, default_value = "ordq-cli")]
        worker: String,
    },
    /// Complete a claimed task
    Ack { id: String },
    /// Release a claimed task
    Nack {
        id: String,
        /// New priority for the requeued task
        #[arg(long, allow_negative_numbers = true)]
        priority: Option<i64>,
        /// Delay before the requeued task is claimable
        #[arg(long)]
        delay_ms: Option<u64>,
    },
    /// Extend a claim's lease
    Extend { id: String, additional_ms: u64 },
    /// Show a task
    Show { id: String },
    /// Show queue counters
    Stats,
    /// Delete completed and dead-lettered records
    Purge,
    /// Release expired claims once
    Sweep,
    /// Run the lease reaper until interrupted
    Serve {
        /// Sweep interval
        #[arg(long, default_value_t = 1000)]
        interval_ms: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    let queue_config = queue_config(&config, cli.queue.as_deref())?;
    let store = PgKv::connect(config.database_url.expose_secret()).await?;
    store.migrate().await?;
    let queue = TaskQueue::new(store, queue_config)?;

    match cli.command {
        Command::Enqueue {
            priority,
            payload,
            metadata,
            delay_ms,
            id,
        } => {
            let mut new = NewTask::new(priority, payload).delay_ms(delay_ms);
            if let Some(json) = metadata {
                new = new.metadata(serde_json::from_str(&json)?);
            }
            if let Some(id) = id {
                new = new.id(id);
            }
            let task = queue.submit(new).await?;
            println!("Enqueued: {} (sequence {})", task.id, task.sequence);
        }
        Command::Dequeue { worker } => match queue.dequeue(&worker).await? {
            Some(task) => print_task(&task)?,
            None => println!("Queue is empty."),
        },
        Command::Ack { id } => {
            queue.ack(&TaskId::from(id.as_str())).await?;
            println!("Acked: {id}");
        }
        Command::Nack {
            id,
            priority,
            delay_ms,
        } => {
            let opts = NackOptions { priority, delay_ms };
            let release = queue.nack_with(&TaskId::from(id.as_str()), opts).await?;
            println!("Nacked: {id} ({release:?})");
        }
        Command::Extend { id, additional_ms } => {
            let expires_at = queue
                .extend_visibility(&TaskId::from(id.as_str()), additional_ms)
                .await?;
            println!("Lease for {id} now expires at {}", format_ms(expires_at));
        }
        Command::Show { id } => match queue.get(&TaskId::from(id.as_str())).await? {
            Some(task) => print_task(&task)?,
            None => anyhow::bail!("no task {id} in queue {}", queue.name()),
        },
        Command::Stats => {
            let stats = queue.stats().await?;
            println!("Queue:          {}", queue.name());
            println!("Pending:        {}", stats.pending);
            println!("Claimed:        {}", stats.claimed);
            println!("Completed:      {}", stats.completed);
            println!("Dead-lettered:  {}", stats.dead_lettered);
            println!("Total enqueued: {}", stats.total_enqueued);
            println!("Total dequeued: {}", stats.total_dequeued);
        }
        Command::Purge => {
            let purged = queue.purge().await?;
            println!("Purged {purged} record(s).");
        }
        Command::Sweep => {
            let report = queue.sweep_expired().await?;
            println!(
                "Requeued {}, dead-lettered {}, skipped {}.",
                report.requeued, report.dead_lettered, report.skipped
            );
        }
        Command::Serve { interval_ms } => {
            let _guard =
                init_telemetry(TelemetryConfig::from_config(&config).with_queue(queue.name()))?;
            let reaper = Reaper::new(queue, Duration::from_millis(interval_ms));

            let stopper = reaper.clone();
            tokio::spawn(async move {
                tokio::signal::ctrl_c().await.ok();
                stopper.shutdown();
            });

            reaper.run().await?;
        }
    }
    Ok(())
}

fn queue_config(config: &Config, name: Option<&str>) -> anyhow::Result<QueueConfig> {
    let mut queue_config = config.queue_config(name.unwrap_or("default"))?;
    if let Some(name) = name {
        queue_config.name = name.to_string();
        queue_config.validate()?;
    }
    Ok(queue_config)
}

fn format_ms(ms: u64) -> String {
    i64::try_from(ms)
        .ok()
        .and_then(chrono::DateTime::from_timestamp_millis)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S%.3f").to_string())
        .unwrap_or_else(|| ms.to_string())
}

fn print_task(task: &Task) -> anyhow::Result<()> {
    println!("ID:         {}", task.id);
    println!("Queue:      {}", task.queue);
    println!("State:      {}", task.state);
    println!("Priority:   {}", task.priority);
    println!("Sequence:   {}", task.sequence);
    println!("Retries:    {}", task.retries);
    println!("Ready:      {}", format_ms(task.ready_at));
    println!("Enqueued:   {}", format_ms(task.enqueued_at));
    if let Some(by) = &task.claimed_by {
        println!("Claimed By: {by}");
    }
    if let Some(expires) = task.lease_expires_at {
        println!("Lease Ends: {}", format_ms(expires));
    }
    if let Some(done) = task.completed_at {
        println!("Completed:  {}", format_ms(done));
    }
    if let Some(dead) = task.dead_lettered_at {
        println!("Dead:       {}", format_ms(dead));
    }
    println!("Payload:    {}", String::from_utf8_lossy(&task.payload));
    if let Some(metadata) = &task.metadata {
        println!("Metadata:   {}", serde_json::to_string_pretty(metadata)?);
    }
    Ok(())
}
