use clap::{Parser, Subcommand};
use comfy_table::{Table, presets::UTF8_FULL};
use forkbatch_core::{Job, Queue};
use forkbatch_spool::SpoolQueue;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "fb-admin")]
#[command(about = "Forkbatch spool admin CLI", long_about = None)]
struct Args {
    /// Spool directory
    #[arg(short, long, default_value = "./spool", env = "FB_SPOOL")]
    spool: PathBuf,

    /// Output format (json, table, yaml)
    #[arg(short, long, default_value = "table")]
    format: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Enqueue a new job
    Enqueue {
        /// Queue name
        #[arg(short, long, default_value = "default")]
        queue: String,

        /// Job class
        #[arg(short, long)]
        class: String,

        /// Job arguments as JSON
        #[arg(short, long, default_value = "null")]
        args: String,
    },

    /// List pending jobs of a queue
    List {
        /// Queue name
        #[arg(short, long, default_value = "default")]
        queue: String,

        /// Limit number of results
        #[arg(short, long, default_value = "100")]
        limit: usize,
    },

    /// Show spool statistics
    Stats,

    /// List failed jobs
    Failed {
        /// Limit number of results
        #[arg(short, long, default_value = "100")]
        limit: usize,
    },

    /// Show what each worker is processing
    Working,

    /// Show pending jobs per queue
    QueueDepth,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let spool = SpoolQueue::open(&args.spool)?;

    match args.command {
        Commands::Enqueue { queue, class, args: job_args } => {
            let job_args: serde_json::Value = serde_json::from_str(&job_args)?;
            let job = Job::new(queue, class, job_args)?;
            let job_id = job.id;
            spool.push(job)?;

            match args.format.as_str() {
                "json" => println!("{}", serde_json::json!({ "job_id": job_id })),
                "yaml" => println!("job_id: {}", job_id),
                _ => println!("Job enqueued: {}", job_id),
            }
        }

        Commands::List { queue, limit } => {
            let jobs: Vec<Job> = spool.pending(&queue)?.into_iter().take(limit).collect();

            match args.format.as_str() {
                "json" => println!("{}", serde_json::to_string_pretty(&jobs)?),
                "yaml" => println!("{}", serde_yaml::to_string(&jobs)?),
                _ => {
                    let mut table = Table::new();
                    table.load_preset(UTF8_FULL);
                    table.set_header(vec!["ID", "Class", "Args", "Enqueued"]);
                    for job in &jobs {
                        table.add_row(vec![
                            job.id.to_string(),
                            job.class().to_string(),
                            job.args().to_string(),
                            job.enqueued_at.to_rfc3339(),
                        ]);
                    }
                    println!("{table}");
                }
            }
        }

        Commands::Stats => {
            let stats = spool.stats()?;

            match args.format.as_str() {
                "json" => println!("{}", serde_json::to_string_pretty(&stats)?),
                "yaml" => println!("{}", serde_yaml::to_string(&stats)?),
                _ => {
                    let mut table = Table::new();
                    table.load_preset(UTF8_FULL);
                    table.set_header(vec!["Metric", "Value"]);
                    table.add_row(vec!["Pending", &stats.pending.to_string()]);
                    table.add_row(vec!["Reserved", &stats.reserved.to_string()]);
                    table.add_row(vec!["Processed", &stats.processed.to_string()]);
                    table.add_row(vec!["Failed", &stats.failed.to_string()]);
                    table.add_row(vec!["Working", &stats.working.to_string()]);
                    println!("{table}");
                }
            }
        }

        Commands::Failed { limit } => {
            let failed: Vec<_> = spool.failed_jobs()?.into_iter().take(limit).collect();

            match args.format.as_str() {
                "json" => println!("{}", serde_json::to_string_pretty(&failed)?),
                "yaml" => println!("{}", serde_yaml::to_string(&failed)?),
                _ => {
                    let mut table = Table::new();
                    table.load_preset(UTF8_FULL);
                    table.set_header(vec!["ID", "Queue", "Class", "Worker", "Failed At", "Error"]);
                    for record in &failed {
                        table.add_row(vec![
                            record.job.id.to_string(),
                            record.job.queue.clone(),
                            record.job.class().to_string(),
                            record.worker_id.clone(),
                            record.failed_at.to_rfc3339(),
                            record.error.clone(),
                        ]);
                    }
                    println!("{table}");
                }
            }
        }

        Commands::Working => {
            let working = spool.working_all()?;

            match args.format.as_str() {
                "json" | "yaml" => {
                    let entries: Vec<serde_json::Value> = working
                        .iter()
                        .map(|(worker, job)| serde_json::json!({ "worker": worker, "job": job }))
                        .collect();
                    if args.format == "json" {
                        println!("{}", serde_json::to_string_pretty(&entries)?);
                    } else {
                        println!("{}", serde_yaml::to_string(&entries)?);
                    }
                }
                _ => {
                    let mut table = Table::new();
                    table.load_preset(UTF8_FULL);
                    table.set_header(vec!["Worker", "Queue", "Class", "Job ID", "Waiting"]);
                    let now = chrono::Utc::now();
                    for (worker, job) in &working {
                        let waited = now.signed_duration_since(job.enqueued_at);
                        table.add_row(vec![
                            worker.clone(),
                            job.queue.clone(),
                            job.class().to_string(),
                            job.id.to_string(),
                            format!("{}s", waited.num_seconds()),
                        ]);
                    }
                    println!("{table}");
                }
            }
        }

        Commands::QueueDepth => {
            println!("Queue Depth:");
            for queue in spool.queues()? {
                let depth = spool.size(&queue)?;
                println!("  {:<16} {:>6} {}", queue, depth, "█".repeat(depth.min(50)));
            }
        }
    }

    Ok(())
}
