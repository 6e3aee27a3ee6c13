use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::{info, warn};

use autotagger::config;
use autotagger::db::{self, SqliteStore};
use autotagger::failsafe::{FailSafeLog, ALL_KINDS};

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Replay every fail-safe journal into the database and exit"
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Only replay this publication
    #[arg(long)]
    publication: Option<String>,

    /// Print the backlog without replaying it
    #[arg(long)]
    dry_run: bool,
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
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let pool = db::init_pool(&cfg.app.resolved_database_url()).await?;
    db::run_migrations(&pool).await?;
    let store = SqliteStore::new(pool);
    let journal = FailSafeLog::new(cfg.app.resolved_journal_dir());

    let publications: Vec<&str> = cfg
        .publications
        .iter()
        .map(|p| p.name.as_str())
        .filter(|name| args.publication.as_deref().map_or(true, |only| only == *name))
        .collect();
    if publications.is_empty() {
        warn!(publication = ?args.publication, "no matching publication configured");
        return Ok(());
    }

    let mut remaining = 0;
    for publication in publications {
        if args.dry_run {
            for (queue, op) in ALL_KINDS {
                let records = journal.backlog(publication, queue, op).await?;
                if !records.is_empty() {
                    info!(publication, %queue, op = op.as_str(), count = records.len(), "journal backlog");
                    for record in records {
                        println!("{publication}\t{queue}-{}\t{}", op.as_str(), record.to_line());
                    }
                }
            }
            continue;
        }

        let replayed = journal.drain(&store, publication, &ALL_KINDS).await;
        info!(publication, replayed, "journals drained");
        for (queue, op) in ALL_KINDS {
            if journal.path(publication, queue, op).exists() {
                warn!(publication, %queue, op = op.as_str(), "journal kept after failed replay");
                remaining += 1;
            }
        }
    }

    if remaining > 0 {
        warn!(remaining, "some journals could not be replayed");
    } else {
        info!("fail-safe replay completed");
    }
    Ok(())
}
