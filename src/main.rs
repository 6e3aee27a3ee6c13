use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;

use autotagger::app;
use autotagger::config;
use autotagger::db::{self, SqliteStore};
use autotagger::model::Queue;
use autotagger::store::{ItemStore, ScheduleStore, SitemapStore};

#[derive(Debug, Parser)]
#[command(author, version, about = "Sitemap-driven auto-tagging pipeline")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the scheduler until Ctrl-C (default)
    Run,
    /// Print this month's volume and the stored schedules
    Status,
    /// List the items of one queue
    List {
        #[arg(long, value_parser = parse_queue_arg)]
        queue: Queue,
        #[arg(long)]
        publication: String,
        /// Substring the url must contain
        #[arg(long)]
        filter: Option<String>,
    },
    /// List the sitemap segments of a publication
    Segments {
        #[arg(long)]
        publication: String,
        #[arg(long)]
        filter: Option<String>,
    },
    /// Print an example configuration file
    ExampleConfig,
}

fn parse_queue_arg(s: &str) -> Result<Queue, String> {
    Queue::parse_queue(s).ok_or_else(|| format!("unknown queue '{s}' (pending, executed, failed)"))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let command = args.command.unwrap_or(Command::Run);
    if let Command::ExampleConfig = command {
        print!("{}", config::example());
        return Ok(());
    }

    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let database_url = cfg.app.resolved_database_url();
    let pool = db::init_pool(&database_url).await?;
    db::run_migrations(&pool).await?;

    match command {
        Command::Run => {
            info!(publications = cfg.publications.len(), "starting autotagger");
            let service = app::build(&cfg, pool).await?;
            service.run().await?;
        }
        Command::Status => {
            let store = SqliteStore::new(pool);
            for queue in Queue::ALL {
                let count = store.count_current_month(queue).await?;
                println!("{:<9} {count}", queue.as_str());
            }
            println!("monthly cap {}", cfg.app.monthly_cap);
            for s in store.schedules().await? {
                println!(
                    "{}/{} every {}s {}",
                    s.publication,
                    s.stage,
                    s.interval_seconds,
                    if s.enabled { "enabled" } else { "disabled" }
                );
            }
        }
        Command::List {
            queue,
            publication,
            filter,
        } => {
            let store = SqliteStore::new(pool);
            for item in store.list(queue, &publication, filter.as_deref()).await? {
                match item.asset_id {
                    Some(asset_id) => println!("{}\t{}\t{}", item.recorded_at, asset_id, item.url),
                    None => println!("{}\t{}", item.recorded_at, item.url),
                }
            }
        }
        Command::Segments {
            publication,
            filter,
        } => {
            if cfg.publication(&publication).is_none() {
                return Err(anyhow!("publication '{publication}' is not configured"));
            }
            let store = SqliteStore::new(pool);
            for seg in store.list_segments(&publication, filter.as_deref()).await? {
                let flag = if seg.executed { "executed" } else { "pending" };
                println!("{}\t{}\t{}\t{}", flag, seg.last_modified, seg.loaded_at, seg.url);
            }
        }
        Command::ExampleConfig => {}
    }

    Ok(())
}
