use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use vdispatch::config::{AppConfig, LogFormat, LoggingConfig};
use vdispatch::storage::{self, ResultStore, SqliteStore};
use vdispatch::task::TaskResult;

#[derive(Parser)]
#[command(
    name = "vdispatch",
    about = "Single-worker dispatcher for validation test runs",
    version,
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (API server + executor)
    Serve {
        /// Config file (defaults to $VDISPATCH_CONFIG, then /etc/vdispatch/vdispatch.toml)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Override the bind address from the config
        #[arg(long)]
        bind: Option<String>,
    },

    /// Show the recorded results of a task
    Status {
        task_id: String,

        /// Database path (defaults to the configured one)
        #[arg(long)]
        db: Option<String>,
    },

    /// List tasks that are currently running
    Running {
        #[arg(long)]
        db: Option<String>,
    },

    /// Show one page of the run history
    History {
        /// Zero-based page number
        #[arg(long, default_value = "0")]
        page: u64,

        #[arg(long)]
        db: Option<String>,
    },

    /// Extract failed sub-tests from a saved script log
    ParseLog {
        file: PathBuf,
    },
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));

    // stdout is reserved for command output
    match logging.format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init(),
        LogFormat::Pretty => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init(),
    }
}

fn load_config(path: Option<&Path>) -> Result<AppConfig> {
    match path {
        Some(p) => AppConfig::load(p),
        None => Ok(AppConfig::load_or_default()),
    }
}

fn open_store(db: Option<String>, config: &AppConfig) -> Result<SqliteStore> {
    let path = db.unwrap_or_else(|| config.storage.db_path.clone());
    let pool = storage::open_pool(&path)
        .with_context(|| format!("failed to open database at {}", path))?;
    Ok(SqliteStore::new(pool))
}

fn print_results(results: &[TaskResult]) {
    println!("{:<8} | {:<9} | {:<25} | Params", "Task", "Status", "Timestamp");
    println!("{:-<8}-|-{:-<9}-|-{:-<25}-|-{:-<30}", "", "", "", "");
    for r in results {
        let params: Vec<String> = r.params.iter().map(ToString::to_string).collect();
        println!(
            "{:<8} | {:<9} | {:<25} | {}",
            r.task_id,
            r.status,
            r.timestamp.to_rfc3339(),
            params.join(", ")
        );
        for name in &r.failed_tests {
            println!("{:<8} | {:<9} | {:<25} |   -> failed: {}", "", "", "", name);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = match &cli.command {
        Commands::Serve { config, .. } => config.clone(),
        _ => None,
    };
    let mut config = load_config(config_path.as_deref())?;
    init_tracing(&config.logging);

    match cli.command {
        Commands::Serve { bind, .. } => {
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            tracing::info!(bind = %config.server.bind, "Starting vdispatch daemon");
            let shutdown = vdispatch::shutdown::install_shutdown_handler();
            vdispatch::serve(config, shutdown).await?;
        }
        Commands::Status { task_id, db } => {
            let store = open_store(db, &config)?;
            let results = match store.get_result(&task_id)? {
                Some(current) if !current.status.is_terminal() => vec![current],
                Some(_) => store.get_results(&task_id)?,
                None => Vec::new(),
            };
            if results.is_empty() {
                println!("No results recorded for task {}.", task_id);
            } else {
                print_results(&results);
            }
        }
        Commands::Running { db } => {
            let store = open_store(db, &config)?;
            let running = store.get_running_tasks()?;
            if running.is_empty() {
                println!("No tasks running.");
            } else {
                print_results(&running);
            }
        }
        Commands::History { page, db } => {
            let store = open_store(db, &config)?;
            let history = store.get_history(page)?;
            if page > history.total_pages {
                anyhow::bail!(
                    "page {} out of range ({} pages)",
                    page,
                    history.total_pages
                );
            }
            println!(
                "History page {} of {} ({} records)",
                history.page, history.total_pages, history.total_records
            );
            println!("{:<25} | {:<8} | {:<15} | Params", "Time", "Result", "Task");
            println!("{:-<25}-|-{:-<8}-|-{:-<15}-|-{:-<30}", "", "", "", "");
            for rec in &history.records {
                let params: Vec<String> = rec.params.iter().map(ToString::to_string).collect();
                println!(
                    "{:<25} | {:<8} | {:<15} | {}",
                    rec.time.to_rfc3339(),
                    rec.result,
                    rec.task_name,
                    params.join(", ")
                );
            }
        }
        Commands::ParseLog { file } => {
            let log = std::fs::read_to_string(&file)
                .with_context(|| format!("failed to read log file: {}", file.display()))?;
            let failed = vdispatch::executor::parse_failed_tests(&log);
            if failed.is_empty() {
                println!("No failed sub-tests found.");
            } else {
                println!("{} failed sub-test(s):", failed.len());
                for name in failed.keys() {
                    println!(" - {}", name);
                }
            }
        }
    }

    Ok(())
}
