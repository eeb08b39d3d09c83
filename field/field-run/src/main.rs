use std::path::PathBuf;

use clap::{Parser, Subcommand};
use eyre::{Result, WrapErr};
use tracing::info;

use field_config_data::FieldConfig;
use field_types::RecordId;

/// distance-triggered inspection capture
#[derive(Debug, Parser)]
#[command(author, version)]
struct Cli {
    /// Configuration file (TOML). Defaults apply if not given.
    #[arg(short, long, global = true, env = "FIELD_CONFIG")]
    config: Option<PathBuf>,

    /// Also write the log to this file.
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run a capture session, replaying a recorded CSV track as position
    /// source. Stop with Ctrl-C.
    Run {
        /// CSV file with the columns timestamp,lat,lon,speed,accuracy
        track: PathBuf,
        /// Identifier of the inspection task
        #[arg(short, long, default_value = "default")]
        task_id: String,
        /// Replay speed relative to the recorded timestamps
        #[arg(long, default_value_t = 1.0)]
        speedup: f64,
        /// Continue from the baseline mark of a previous session
        #[arg(long)]
        resume_from: Option<f64>,
        /// Do not synchronize in the background
        #[arg(long)]
        no_sync: bool,
    },
    /// Delete a record locally and, once confirmed, remotely.
    SoftDelete { record_id: RecordId },
    /// Upload pending records and wait until done.
    Sync,
    /// Show records and queued sync tasks.
    Status,
    /// Print the default configuration.
    DefaultConfig,
}

fn load_config(path: Option<&PathBuf>) -> Result<FieldConfig> {
    match path {
        Some(path) => field_config_data::parse_config_file(path)
            .wrap_err_with(|| format!("While parsing configuration file {}", path.display())),
        None => Ok(field_config_data::parse_config_str("", std::path::Path::new("."))?),
    }
}

async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("cannot listen for Ctrl-C: {e}");
        std::future::pending::<()>().await;
    }
}

fn main() -> Result<()> {
    if std::env::var_os("RUST_LOG").is_none() {
        // SAFETY: single threaded, the runtime is not started yet.
        unsafe { std::env::set_var("RUST_LOG", "info") };
    }
    let cli = Cli::parse();
    let _guard = env_tracing_logger::init_with(env_tracing_logger::Options {
        file: cli.log_file.clone(),
        ..Default::default()
    })
    .map_err(|e| eyre::eyre!("initializing logging: {e}"))?;

    let runtime = tokio::runtime::Runtime::new().wrap_err("starting runtime")?;
    runtime.block_on(run(cli))
}

async fn run(cli: Cli) -> Result<()> {
    let cfg = || load_config(cli.config.as_ref());

    match cli.command {
        Command::Run {
            track,
            task_id,
            speedup,
            resume_from,
            no_sync,
        } => {
            if !(speedup.is_finite() && speedup > 0.0) {
                eyre::bail!("--speedup must be positive");
            }
            let opts = field_run::RunOptions {
                track,
                task_id,
                speedup,
                resume_from,
                background_sync: !no_sync,
            };
            let summary = field_run::run_session(&cfg()?, opts, ctrl_c()).await?;
            info!(
                "{} captures saved, {} failed",
                summary.captures_saved, summary.captures_failed
            );
            if let Some(mark) = summary.final_mark {
                println!("final mark: {mark:.1} m (use --resume-from to continue)");
            }
        }
        Command::SoftDelete { record_id } => {
            match field_run::soft_delete(&cfg()?, &record_id).await? {
                None => println!("record {record_id} is already deleted"),
                Some(sync_queue::TaskOutcome::Success) => {
                    println!("record {record_id} deleted")
                }
                Some(outcome) => println!(
                    "record {record_id} marked for deletion, remote deletion pending ({outcome:?})"
                ),
            }
        }
        Command::Sync => {
            let status = field_run::sync_now(&cfg()?, ctrl_c()).await?;
            let left = status.count(sync_queue::TaskClass::Upload)
                + status.count(sync_queue::TaskClass::Delete);
            if left == 0 {
                println!("all records synchronized");
            } else {
                println!("{left} sync task(s) waiting for retry");
            }
        }
        Command::Status => {
            print!("{}", field_run::status(&cfg()?)?);
        }
        Command::DefaultConfig => {
            print!("{}", FieldConfig::default().to_toml_string()?);
        }
    }
    Ok(())
}
