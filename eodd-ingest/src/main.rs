//! eodd - Earth Observation ingestion and download orchestration
//!
//! Runs the sync → download → validate → process pipeline for the sensors in
//! the configuration file, once or on an interval, and provides the
//! administrative commands for inspecting and repairing the scene catalog.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use eodd_common::config::{locate_config_file, resolve_root_folder, ConfigSignature, ROOT_FOLDER_ENV};
use eodd_common::time::parse_date;
use eodd_ingest::build_info;
use eodd_ingest::config::IngestConfig;
use eodd_ingest::db::{summarize, RecordStore, ResetScope};
use eodd_ingest::models::{BoundingBox, SceneQuery, SceneState};
use eodd_ingest::sensors::{build_sensor, Sensor};
use eodd_ingest::services::{
    remove_artifacts, reset_in_state, CommandProcessor, Orchestrator, OrchestratorSettings, RunReport, Stage, SyncFrom,
};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Command-line arguments for eodd
#[derive(Parser, Debug)]
#[command(name = "eodd")]
#[command(about = "Earth Observation ingestion and download orchestration")]
#[command(version)]
struct Args {
    /// Configuration file (default: EODD_CONFIG, then the user and system config dirs)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Root folder holding the database (overrides EODD_ROOT_FOLDER and the config)
    #[arg(short, long, global = true)]
    root_folder: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(ClapArgs, Debug, Clone)]
struct SensorFilter {
    /// Only act on this sensor
    #[arg(long)]
    sensor: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run every stage for every sensor
    Run {
        #[command(flatten)]
        filter: SensorFilter,
        /// Repeat the run every SECS seconds until interrupted
        #[arg(long, value_name = "SECS")]
        interval: Option<u64>,
        /// Refuse to run if the config changed since `sign-config`
        #[arg(long)]
        verify_signature: bool,
        /// First run re-lists each catalog from its start date
        #[arg(long)]
        from_start: bool,
    },
    /// Query catalogs and record new scenes
    Sync {
        #[command(flatten)]
        filter: SensorFilter,
        /// Re-list from the start date instead of the cursor; known scenes are kept as they are
        #[arg(long)]
        from_start: bool,
    },
    /// Download discovered and retryable scenes
    Download {
        #[command(flatten)]
        filter: SensorFilter,
    },
    /// Verify downloaded artifacts
    Validate {
        #[command(flatten)]
        filter: SensorFilter,
    },
    /// Hand archived scenes to the external processor
    Process {
        #[command(flatten)]
        filter: SensorFilter,
    },
    /// Scene counts per sensor and state, plus sync cursors
    Status {
        #[command(flatten)]
        filter: SensorFilter,
    },
    /// Scenes in a terminal failure state
    Failures {
        #[command(flatten)]
        filter: SensorFilter,
    },
    /// Scenes matching the given filters, by acquisition time
    List {
        #[command(flatten)]
        filter: SensorFilter,
        #[arg(long)]
        state: Option<SceneState>,
        /// Acquired on or after this date (YYYY-MM-DD)
        #[arg(long, value_name = "DATE")]
        since: Option<String>,
        /// Acquired before this date (YYYY-MM-DD)
        #[arg(long, value_name = "DATE")]
        until: Option<String>,
        /// Footprint intersects NORTH,SOUTH,EAST,WEST
        #[arg(long, allow_hyphen_values = true)]
        bbox: Option<BoundingBox>,
        /// Print full records as JSON
        #[arg(long)]
        json: bool,
    },
    /// Put one scene, or every scene in a state, back into the pipeline
    Reset {
        #[arg(long)]
        sensor: String,
        #[arg(long, required_unless_present = "state", conflicts_with = "state")]
        remote_id: Option<String>,
        /// Reset every scene of the sensor in this state
        #[arg(long)]
        state: Option<SceneState>,
        /// Restart from download instead of re-processing
        #[arg(long)]
        download: bool,
        /// Delete the downloaded artifacts of the reset scenes
        #[arg(long, requires = "download")]
        delete_files: bool,
    },
    /// Rewrite local paths after moving a download directory
    Relocate {
        #[arg(long)]
        sensor: String,
        #[arg(long)]
        from: String,
        #[arg(long)]
        to: String,
    },
    /// Write scene records to a JSON file
    Export {
        #[command(flatten)]
        filter: SensorFilter,
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Add scene records from a JSON export
    Import {
        file: PathBuf,
        /// Rewrite a local path prefix while importing
        #[arg(long, value_name = "OLD=NEW")]
        replace_prefix: Option<String>,
    },
    /// Record the current config contents in `<config>.sig`
    SignConfig,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();

    let config_path = locate_config_file(args.config.as_deref())?;
    let config = IngestConfig::load(&config_path)?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level)),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!(
        version = build_info::VERSION,
        git = build_info::GIT_HASH,
        built = build_info::BUILD_TIMESTAMP,
        profile = build_info::BUILD_PROFILE,
        config = %config_path.display(),
        "Starting eodd"
    );

    if let Command::SignConfig = args.command {
        let digest = ConfigSignature::new(&config_path).sign()?;
        println!("{}  {}", digest, config_path.display());
        return Ok(ExitCode::SUCCESS);
    }

    let root_folder = resolve_root_folder(
        args.root_folder.as_deref(),
        ROOT_FOLDER_ENV,
        config.root_folder.as_deref(),
    );
    std::fs::create_dir_all(&root_folder)
        .with_context(|| format!("Failed to create root folder {}", root_folder.display()))?;
    let db_path = config.database_path(&root_folder);
    info!("Database: {}", db_path.display());

    let store = RecordStore::open(&db_path, config.store_policy()).await?;
    let result = dispatch(args.command, &config, &config_path, &store).await;
    store.close().await;
    result
}

async fn dispatch(
    command: Command,
    config: &IngestConfig,
    config_path: &Path,
    store: &RecordStore,
) -> Result<ExitCode> {
    match command {
        Command::Run {
            filter,
            interval,
            verify_signature,
            from_start,
        } => {
            if verify_signature {
                ConfigSignature::new(config_path)
                    .verify()
                    .context("Config signature check failed; re-run sign-config after reviewing changes")?;
            }
            let pipeline = Pipeline {
                stages: &Stage::ALL,
                interval: interval.map(Duration::from_secs),
                from: sync_from(from_start),
            };
            run_pipeline(config, store, &filter, pipeline).await
        }
        Command::Sync { filter, from_start } => {
            let pipeline = Pipeline {
                from: sync_from(from_start),
                ..Pipeline::once(&[Stage::Sync])
            };
            run_pipeline(config, store, &filter, pipeline).await
        }
        Command::Download { filter } => run_pipeline(config, store, &filter, Pipeline::once(&[Stage::Download])).await,
        Command::Validate { filter } => run_pipeline(config, store, &filter, Pipeline::once(&[Stage::Validate])).await,
        Command::Process { filter } => run_pipeline(config, store, &filter, Pipeline::once(&[Stage::Process])).await,
        Command::Status { filter } => {
            print_status(config, store, filter.sensor.as_deref()).await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Failures { filter } => {
            for scene in store.list_failures(filter.sensor.as_deref()).await? {
                println!(
                    "{}\t{}\t{}\tretries={}\t{}",
                    scene.sensor_id,
                    scene.remote_id,
                    scene.state,
                    scene.retry_count,
                    scene.last_error.as_deref().unwrap_or("-")
                );
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::List {
            filter,
            state,
            since,
            until,
            bbox,
            json,
        } => {
            let query = SceneQuery {
                sensor_id: filter.sensor,
                state,
                acquired_from: since.as_deref().map(parse_date).transpose()?,
                acquired_until: until.as_deref().map(parse_date).transpose()?,
                bbox,
            };
            let scenes = store.list_scenes(&query).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&scenes)?);
            } else {
                for scene in &scenes {
                    println!(
                        "{}\t{}\t{}\t{}\t{}",
                        scene.sensor_id,
                        scene.remote_id,
                        scene.acquisition_time.to_rfc3339(),
                        scene.state,
                        scene
                            .local_path
                            .as_deref()
                            .map(|p| p.display().to_string())
                            .unwrap_or_else(|| "-".to_string())
                    );
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Reset {
            sensor,
            remote_id,
            state,
            download,
            delete_files,
        } => {
            let scope = if download {
                ResetScope::Download
            } else {
                ResetScope::Processing
            };

            if let Some(state) = state {
                let report = reset_in_state(store, &sensor, state, scope, delete_files).await?;
                for scene in &report.reset {
                    println!("{}\t{}\t{}", scene.sensor_id, scene.remote_id, scene.state);
                }
                println!("Reset {} scenes, removed {} files", report.reset.len(), report.files_removed);
                return Ok(ExitCode::SUCCESS);
            }

            let remote_id = remote_id.context("--remote-id or --state is required")?;
            let Some(scene) = store.find_scene(&sensor, &remote_id).await? else {
                bail!("No scene {} for sensor {}", remote_id, sensor);
            };
            let released = scene.local_path.clone();
            let scene = store.reset_scene(scene.id, scope).await?;
            println!("{}\t{}\t{}", scene.sensor_id, scene.remote_id, scene.state);
            if delete_files {
                let removed = remove_artifacts(&released.into_iter().collect::<Vec<_>>()).await;
                println!("Removed {} files", removed);
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Relocate { sensor, from, to } => {
            let moved = store.relocate_downloads(&sensor, &from, &to).await?;
            println!("Relocated {} scenes", moved);
            Ok(ExitCode::SUCCESS)
        }
        Command::Export { filter, output } => {
            let count = store.export_to_path(filter.sensor.as_deref(), &output).await?;
            println!("Exported {} scenes to {}", count, output.display());
            Ok(ExitCode::SUCCESS)
        }
        Command::Import { file, replace_prefix } => {
            let remap = match replace_prefix.as_deref() {
                Some(mapping) => Some(
                    mapping.split_once('=')
                        .context("--replace-prefix expects OLD=NEW")?,
                ),
                None => None,
            };
            let summary = store.import_from_path(&file, remap).await?;
            println!("Imported {} scenes ({} already known)", summary.inserted, summary.skipped);
            Ok(ExitCode::SUCCESS)
        }
        Command::SignConfig => Ok(ExitCode::SUCCESS),
    }
}

/// What `run_pipeline` executes
struct Pipeline<'a> {
    stages: &'a [Stage],
    /// Repeat until interrupted
    interval: Option<Duration>,
    /// Sync start for the first run; later runs follow the cursor
    from: SyncFrom,
}

impl<'a> Pipeline<'a> {
    fn once(stages: &'a [Stage]) -> Self {
        Self {
            stages,
            interval: None,
            from: SyncFrom::Cursor,
        }
    }
}

fn sync_from(from_start: bool) -> SyncFrom {
    if from_start {
        SyncFrom::Start
    } else {
        SyncFrom::Cursor
    }
}

async fn run_pipeline(
    config: &IngestConfig,
    store: &RecordStore,
    filter: &SensorFilter,
    pipeline: Pipeline<'_>,
) -> Result<ExitCode> {
    let Pipeline {
        stages,
        interval,
        mut from,
    } = pipeline;
    let sensors = config
        .selected_sensors(filter.sensor.as_deref())?
        .into_iter()
        .map(build_sensor)
        .collect::<eodd_common::Result<Vec<Sensor>>>()?;

    let mut orchestrator = Orchestrator::new(store.clone(), sensors, OrchestratorSettings::from_config(config));
    if let Some(processing) = &config.processing {
        orchestrator = orchestrator.with_processor(CommandProcessor::new(processing));
    } else if stages.contains(&Stage::Process) {
        warn!("No [processing] section configured; archived scenes will not be processed");
    }

    let cancel = orchestrator.cancellation_token();
    tokio::spawn(cancel_on_signal(cancel.clone()));

    orchestrator.reconcile().await?;

    loop {
        let report = orchestrator.run_from(stages, from).await?;
        from = SyncFrom::Cursor;
        print_report(&report);

        let Some(every) = interval else {
            return Ok(exit_code(&report));
        };
        if cancel.is_cancelled() {
            return Ok(exit_code(&report));
        }
        info!("Next run in {}s", every.as_secs());
        tokio::select! {
            _ = tokio::time::sleep(every) => {}
            _ = cancel.cancelled() => return Ok(exit_code(&report)),
        }
    }
}

fn exit_code(report: &RunReport) -> ExitCode {
    if report.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

/// Cancel the run on Ctrl+C or SIGTERM; in-flight transfers still finish
async fn cancel_on_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, finishing in-flight downloads"),
        _ = terminate => info!("Received terminate signal, finishing in-flight downloads"),
    }
    cancel.cancel();
}

fn print_report(report: &RunReport) {
    for sensor in &report.sensors {
        let mut line = format!("{}:", sensor.sensor_id);
        if let Some(sync) = &sensor.sync {
            line.push_str(&format!(" seen={} new={}", sync.seen, sync.inserted));
        }
        if let Some(download) = &sensor.download {
            line.push_str(&format!(
                " downloaded={} failed={}",
                download.downloaded,
                download.failed()
            ));
        }
        if let Some(validation) = &sensor.validation {
            line.push_str(&format!(" archived={} corrupt={}", validation.archived, validation.corrupt));
        }
        if let Some(processing) = &sensor.processing {
            line.push_str(&format!(" processed={} processing_failed={}", processing.processed, processing.failed));
        }
        if sensor.cancelled {
            line.push_str(" (cancelled)");
        }
        if let Some(error) = &sensor.error {
            line.push_str(&format!(" ERROR {}", error));
        }
        println!("{}", line);
    }
}

async fn print_status(config: &IngestConfig, store: &RecordStore, sensor: Option<&str>) -> Result<()> {
    let counts = store.state_counts(sensor).await?;
    for count in &counts {
        println!("{}\t{}\t{}", count.sensor_id, count.state, count.count);
    }
    for summary in summarize(&counts) {
        println!(
            "{}\tsettled={}\tin_progress={}",
            summary.sensor_id, summary.settled, summary.in_progress
        );
    }
    for sensor_config in config.selected_sensors(sensor)? {
        let cursor = store.load_cursor(&sensor_config.id).await?;
        println!(
            "{}\tcursor={}\tlast_synced={}\tdownload_passes={}",
            cursor.sensor_id,
            cursor
                .last_acquisition_time
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "-".to_string()),
            cursor
                .last_synced_at
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "-".to_string()),
            cursor.download_pass
        );
    }
    Ok(())
}
