#![warn(
    // Generally we don't want this sneaking into `main`
    clippy::todo,
    // This should be used very sparingly compared between logging and clap
    clippy::print_stdout, clippy::print_stderr,
)]

mod catalog;
mod dest;
mod encryption;
mod metrics;
mod notify;
mod opts;
mod panic_hook;
mod scheduler;
mod secure_store;
mod source;
mod sync;
#[cfg(test)]
mod test_utils;
mod utils;
mod verify;

use std::{path::PathBuf, sync::Arc};

use anyhow::Context;
use chrono::Utc;
use clap::Parser;
use rand::SeedableRng;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::util::SubscriberInitExt;
use uuid::Uuid;

use catalog::{Catalog, DestinationKind, DestinationRecord, HealthStatus, Schedule, ScheduledBackupJob};
use dest::{Destination, DestinationBackend, MountConfig, S3Config};
use encryption::Encryptor;
use metrics::HistTag;
use notify::Notifier;
use opts::{
    BackupArgs, Cli, Commands, ConfigCmd, DestinationCmd, EncryptionCmd, GapsArgs, MountKindArg,
    ScheduleCmd, VerifyArgs,
};
use scheduler::{HostMonitor, Scheduler};
use secure_store::FileSecureStore;
use source::{DateRangeFilter, FolderSource};
use sync::{SyncEngine, SyncError};
use verify::VerificationEngine;

struct App {
    catalog: Arc<Catalog>,
    encryptor: Encryptor,
    notifier: Notifier,
    engine: Arc<SyncEngine>,
    opts: opts::Opts,
    scratch_dir: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    setup_panic!();

    let env_filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive("snapvault=info".parse()?)
        .with_env_var("SNAPVAULT_LOG")
        .from_env()?;
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().compact())
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(config_path) => opts::Config::load_from_file(config_path)?,
        None => opts::Config::load_from_system().unwrap_or_else(|err| {
            warn!("Failed reading config file. Falling back to defaults. Error: {err}");
            opts::Config::default()
        }),
    };
    let opts = opts::Opts::parse_and_load_from(config);

    let recorder = metrics::LogRecorder::default();
    metrics::set_global_recorder(recorder).expect("Failed setting metrics recorder");
    #[cfg(snapvault_tcp_metrics)]
    metrics_exporter_tcp::TcpBuilder::new()
        .install()
        .expect("Failed to install TCP metrics server");
    for tag in HistTag::iter() {
        tag.set_global_description();
    }

    if let Commands::Config(ConfigCmd::Open) = &cli.command {
        return config_open();
    }

    let data_dir =
        utils::snapvault_data_dir().context("Failed to locate the data directory")?;
    let catalog_path = match &cli.catalog {
        Some(path) => path.clone(),
        None => Catalog::default_path()?,
    };
    // A catalog we can't open is fatal; a stale job from a crashed session is
    // routine
    let catalog = Arc::new(Catalog::open_or_create(&catalog_path)?);
    let stale = catalog.cleanup_stale_jobs()?;
    if stale > 0 {
        warn!("Recovered {stale} stale job(s) from a previous session");
    }

    let store = Arc::new(FileSecureStore::new(data_dir.join("secure")));
    let encryptor = Encryptor::new(store);

    let (notifier, mut notifications) = Notifier::new();
    tokio::spawn(async move {
        while let Some(event) = notifications.recv().await {
            info!("notification: {event:?}");
        }
    });

    let engine = Arc::new(SyncEngine::new(
        Arc::clone(&catalog),
        encryptor.clone(),
        notifier.clone(),
    ));

    let app = App {
        catalog,
        encryptor,
        notifier,
        engine,
        opts,
        scratch_dir: data_dir.join("exports"),
    };

    match cli.command {
        Commands::Backup(args) => backup(app, args).await,
        Commands::Verify(args) => verify_cmd(app, args).await,
        Commands::Gaps(args) => gaps(app, args).await,
        Commands::Run { library } => run_scheduler(app, library).await,
        Commands::Status { jobs } => status(app, jobs),
        Commands::Purge { days } => purge(app, days),
        Commands::Destination(cmd) => destination_cmd(app, cmd).await,
        Commands::Schedule(cmd) => schedule_cmd(app, cmd),
        Commands::Encryption(cmd) => encryption_cmd(app, cmd),
        Commands::Config(ConfigCmd::Open) => unreachable!("handled before catalog setup"),
    }
}

fn config_open() -> anyhow::Result<()> {
    let config_path = utils::snapvault_config_dir()
        .context("Failed to find the configuration directory")?
        .join("snapvault.toml");

    if !config_path.is_file() {
        warn!(
            "No config found. Creating a new config at: {}",
            config_path.display()
        );
        opts::Config::create_default_config(&config_path)?;
    }

    #[allow(clippy::print_stdout)]
    {
        println!("{}", config_path.display());
    }
    Ok(())
}

fn resolve_destination(app: &App, name: &str) -> anyhow::Result<DestinationRecord> {
    app.catalog
        .find_destination(name)?
        .with_context(|| format!("No destination named `{name}`. See `snapvault destination list`"))
}

async fn backup(mut app: App, args: BackupArgs) -> anyhow::Result<()> {
    let record = resolve_destination(&app, &args.destination)?;
    app.opts.apply_backup_args(&args);

    if app.opts.sync.encrypt && !app.encryptor.is_configured()? {
        anyhow::bail!("Encryption is enabled but no key is set up. Run `snapvault encryption setup` first");
    }

    let source = FolderSource::new(args.library, app.scratch_dir.clone());
    let mut backend = Destination::from_record(&record, app.opts.tuning)?;

    // Narrate progress while the run is in flight
    let mut progress_rx = app.engine.subscribe();
    let narrator = tokio::spawn(async move {
        while progress_rx.changed().await.is_ok() {
            let snapshot = progress_rx.borrow_and_update().clone();
            if snapshot.state == sync::EngineState::Syncing && snapshot.total_photos > 0 {
                info!(
                    "{}/{} photos, {:.1} MiB moved{}",
                    snapshot.completed_photos + snapshot.failed_photos,
                    snapshot.total_photos,
                    utils::u64_in_mib(snapshot.bytes_transferred),
                    snapshot
                        .average_speed_mib_s
                        .map(|speed| format!(" ({})", utils::format_speed(speed)))
                        .unwrap_or_default(),
                );
            }
        }
    });

    // Ctrl-c asks the engine to stop at the next photo boundary instead of
    // tearing the run down mid-upload
    let cancel_engine = Arc::clone(&app.engine);
    let canceller = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Stopping after the photos in flight finish");
            let _ = cancel_engine.cancel();
        }
    });

    let outcome = app
        .engine
        .run_backup(&source, &mut backend, record.id, app.opts.sync.clone())
        .await;
    narrator.abort();
    canceller.abort();

    match outcome {
        Ok(job) => {
            let skipped = app.engine.progress().skipped_photos;
            info!(
                "Backup finished: {} scanned, {} synced, {} skipped, {} failed, {:.1} MiB moved",
                job.photos_scanned,
                job.photos_synced,
                skipped,
                job.photos_failed,
                utils::u64_in_mib(job.bytes_transferred),
            );
            Ok(())
        }
        Err(SyncError::NoPhotosToSync) => {
            info!("Nothing to back up: the library has no photos matching the filter");
            Ok(())
        }
        Err(err) => Err(err.into()),
    }
}

async fn verify_cmd(app: App, args: VerifyArgs) -> anyhow::Result<()> {
    let record = resolve_destination(&app, &args.destination)?;
    let mut backend = Destination::from_record(&record, app.opts.tuning)?;
    backend.connect().await?;

    let verifier = Arc::new(VerificationEngine::with_concurrency(
        Arc::clone(&app.catalog),
        app.notifier.clone(),
        app.opts.verify_concurrency,
    ));

    let canceller = tokio::spawn({
        let verifier = Arc::clone(&verifier);
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Stopping after the photos in flight finish");
                verifier.cancel();
            }
        }
    });

    let report = if args.quick {
        let mut rng = rand::rngs::StdRng::from_entropy();
        verifier
            .quick_verification(&backend, record.id, args.sample, &mut rng)
            .await?
    } else {
        verifier
            .verify_backup(&backend, record.id, !args.no_update)
            .await?
    };

    info!(
        "Verified {} of {}: {} mismatched, {} missing, {} errored",
        report.job.verified_count,
        report.job.total_photos,
        report.job.mismatch_count,
        report.job.missing_count,
        report.job.error_count,
    );

    let stale = verifier.unverified_photos(record.id, verify::DEFAULT_REVERIFY_DAYS)?;
    if !stale.is_empty() {
        info!(
            "{} photo(s) have not been verified in the last {} days",
            stale.len(),
            verify::DEFAULT_REVERIFY_DAYS,
        );
    }

    if args.repair {
        let failed = report.failed_results();
        if failed.is_empty() {
            info!("Nothing to repair");
        } else {
            let cleared = verifier.reupload_failed_photos(&failed, &backend).await?;
            info!("Cleared {cleared} bad row(s); run `snapvault backup` to re-upload them");
        }
    }

    canceller.abort();
    backend.disconnect().await?;
    Ok(())
}

async fn gaps(app: App, args: GapsArgs) -> anyhow::Result<()> {
    let record = resolve_destination(&app, &args.destination)?;
    let source = FolderSource::new(args.library, app.scratch_dir.clone());
    let verifier = VerificationEngine::new(Arc::clone(&app.catalog), app.notifier.clone());

    let filter = args
        .filter
        .map(DateRangeFilter::from)
        .unwrap_or(DateRangeFilter::FullLibrary);
    let report = verifier.detect_gaps(&source, record.id, filter).await?;

    info!(
        "Library has {} photos; {} recorded for `{}`; {} never synced, {} modified since their sync",
        report.library_total,
        report.synced_total,
        record.name,
        report.unsynced.len(),
        report.modified.len(),
    );
    Ok(())
}

async fn run_scheduler(app: App, library: PathBuf) -> anyhow::Result<()> {
    let source = FolderSource::new(library, app.scratch_dir.clone());
    let scheduler = Scheduler::new(
        Arc::clone(&app.catalog),
        Arc::clone(&app.engine),
        app.notifier.clone(),
        Arc::new(HostMonitor),
        app.opts.tuning,
        app.opts.sync.clone(),
        app.opts.periodic,
    );

    info!("Scheduler running; press ctrl-c to stop");
    tokio::select! {
        _ = scheduler.run_loop(&source) => {}
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }
    Ok(())
}

#[allow(clippy::print_stdout)]
fn status(app: App, jobs: u32) -> anyhow::Result<()> {
    println!("Destinations:");
    for record in app.catalog.list_destinations()? {
        let stats = app.catalog.stats(record.id)?;
        println!(
            "  {:<20} {:<5} {:>8} photos {:>10.1} MiB  health: {}",
            record.name,
            record.kind.as_str(),
            stats.photo_count,
            utils::u64_in_mib(stats.total_bytes),
            record.health_status.as_str(),
        );
    }

    println!("Recent jobs:");
    for job in app.catalog.recent_jobs(jobs)? {
        println!(
            "  {} {:<10} scanned {:>5} synced {:>5} failed {:>3} {:>10.1} MiB  {}",
            job.start_time.format("%Y-%m-%d %H:%M"),
            job.status.as_str(),
            job.photos_scanned,
            job.photos_synced,
            job.photos_failed,
            utils::u64_in_mib(job.bytes_transferred),
            job.average_speed.map(utils::format_speed).unwrap_or_default(),
        );
        for error in app.catalog.errors_for_job(job.id)? {
            println!(
                "      !! {} [{}] {}",
                error.photo_id, error.error_category, error.error_message,
            );
        }
    }

    println!("Recent activity:");
    for entry in app.catalog.recent_logs(catalog::LogStream::Sync, 5)? {
        println!(
            "  {} {:<7} [{}] {}",
            entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
            entry.level.as_str(),
            entry.category,
            entry.message,
        );
    }
    Ok(())
}

fn purge(app: App, days: Option<u32>) -> anyhow::Result<()> {
    let days = days.unwrap_or(app.opts.log_retention_days);
    let purged = app.catalog.purge_older_than(days)?;
    info!("Purged {purged} row(s) older than {days} day(s)");
    Ok(())
}

async fn destination_cmd(app: App, cmd: DestinationCmd) -> anyhow::Result<()> {
    match cmd {
        DestinationCmd::AddS3 {
            name,
            bucket,
            region,
            endpoint,
            access_key,
            secret_key,
            prefix,
        } => {
            let config = S3Config {
                bucket,
                region,
                endpoint,
                access_key,
                secret_key,
                path_prefix: prefix,
            };
            add_destination(&app, name, DestinationKind::S3, dest::encode_config(&config)?)
        }
        DestinationCmd::AddMount {
            name,
            kind,
            mount_point,
            share_url,
            username,
            prefix,
        } => {
            let config = MountConfig {
                share_url,
                mount_point,
                username,
                path_prefix: prefix,
            };
            let kind = match kind {
                MountKindArg::Smb => DestinationKind::Smb,
                MountKindArg::Sftp => DestinationKind::Sftp,
                MountKindArg::Ftp => DestinationKind::Ftp,
            };
            add_destination(&app, name, kind, dest::encode_config(&config)?)
        }
        DestinationCmd::List => {
            #[allow(clippy::print_stdout)]
            for record in app.catalog.list_destinations()? {
                println!(
                    "{:<20} {:<5} added {}  health: {}",
                    record.name,
                    record.kind.as_str(),
                    record.created_at.format("%Y-%m-%d"),
                    record.health_status.as_str(),
                );
            }
            Ok(())
        }
        DestinationCmd::Remove { name } => {
            let record = resolve_destination(&app, &name)?;
            app.catalog.delete_destination(record.id)?;
            info!("Removed `{name}` and everything recorded against it");
            Ok(())
        }
        DestinationCmd::Test { name } => {
            let record = resolve_destination(&app, &name)?;
            let mut backend = Destination::from_record(&record, app.opts.tuning)?;
            let status = match backend.test_connection().await {
                Ok(()) => {
                    info!("`{name}` is reachable");
                    HealthStatus::Healthy
                }
                Err(err) => {
                    warn!("`{name}` is not reachable: {err:#}");
                    HealthStatus::Unreachable
                }
            };
            app.catalog.record_health_check(record.id, status, Utc::now())?;
            let _ = backend.disconnect().await;
            Ok(())
        }
    }
}

fn add_destination(
    app: &App,
    name: String,
    kind: DestinationKind,
    config_blob: Vec<u8>,
) -> anyhow::Result<()> {
    if app.catalog.find_destination(&name)?.is_some() {
        anyhow::bail!("A destination named `{name}` already exists");
    }
    let record = DestinationRecord {
        id: Uuid::new_v4(),
        name: name.clone(),
        kind,
        config_blob,
        created_at: Utc::now(),
        last_health_check: None,
        health_status: HealthStatus::Unknown,
    };
    app.catalog.upsert_destination(&record)?;
    info!("Added {} destination `{name}`", kind.as_str());
    Ok(())
}

fn schedule_cmd(app: App, cmd: ScheduleCmd) -> anyhow::Result<()> {
    match cmd {
        ScheduleCmd::Add {
            name,
            destination,
            filter,
            at,
            interval_secs,
            daily,
            weekly,
            monthly,
        } => {
            let record = resolve_destination(&app, &destination)?;
            let schedule = if let Some(at) = at {
                let at = chrono::DateTime::parse_from_rfc3339(&at)
                    .context("Invalid --at timestamp: expected RFC 3339")?
                    .with_timezone(&Utc);
                Schedule::OneTime { at }
            } else if let Some(seconds) = interval_secs {
                Schedule::Interval { seconds }
            } else if let Some(time) = daily {
                Schedule::Daily {
                    hour: time.hour,
                    minute: time.minute,
                }
            } else if let Some(spec) = weekly {
                Schedule::Weekly {
                    weekday: spec.weekday,
                    hour: spec.time.hour,
                    minute: spec.time.minute,
                }
            } else if let Some(spec) = monthly {
                Schedule::Monthly {
                    day_of_month: spec.day_of_month,
                    hour: spec.time.hour,
                    minute: spec.time.minute,
                }
            } else {
                anyhow::bail!(
                    "Specify one of --at, --interval-secs, --daily, --weekly, or --monthly"
                );
            };

            let now = Utc::now();
            let job = ScheduledBackupJob {
                id: Uuid::new_v4(),
                destination_id: record.id,
                name: name.clone(),
                is_enabled: true,
                schedule,
                filter: filter
                    .map(DateRangeFilter::from)
                    .unwrap_or(DateRangeFilter::FullLibrary),
                created_at: now,
                last_run_time: None,
                next_run_time: scheduler::next_run_after(&schedule, now, None),
                last_run_status: None,
            };
            app.catalog.upsert_schedule(&job)?;
            info!(
                "Scheduled `{name}`; first run at {}",
                job.next_run_time
                    .map(|at| at.to_rfc3339())
                    .unwrap_or_else(|| "never".to_owned()),
            );
            Ok(())
        }
        ScheduleCmd::List => {
            #[allow(clippy::print_stdout)]
            for job in app.catalog.list_schedules()? {
                println!(
                    "{:<20} {} next: {}  last: {}",
                    job.name,
                    if job.is_enabled { "on " } else { "off" },
                    job.next_run_time
                        .map(|at| at.format("%Y-%m-%d %H:%M").to_string())
                        .unwrap_or_else(|| "never".to_owned()),
                    job.last_run_status.unwrap_or_else(|| "never ran".to_owned()),
                );
            }
            Ok(())
        }
        ScheduleCmd::Remove { name } => {
            let job = find_schedule(&app, &name)?;
            app.catalog.delete_schedule(job.id)?;
            info!("Removed schedule `{name}`");
            Ok(())
        }
        ScheduleCmd::Enable { name } => {
            let job = find_schedule(&app, &name)?;
            app.catalog.set_schedule_enabled(job.id, true)?;
            // A re-enabled job needs a fresh occurrence to come due at
            let next = scheduler::next_run_after(&job.schedule, Utc::now(), job.last_run_time);
            if let Some(last_run) = job.last_run_time {
                app.catalog.record_run_result(
                    job.id,
                    last_run,
                    next,
                    job.last_run_status.as_deref().unwrap_or("completed"),
                )?;
            }
            let refreshed = app.catalog.get_schedule(job.id)?;
            info!(
                "Enabled schedule `{name}`; next run at {}",
                refreshed
                    .and_then(|job| job.next_run_time)
                    .map(|at| at.to_rfc3339())
                    .unwrap_or_else(|| "never".to_owned()),
            );
            Ok(())
        }
        ScheduleCmd::Disable { name } => {
            let job = find_schedule(&app, &name)?;
            app.catalog.set_schedule_enabled(job.id, false)?;
            info!("Disabled schedule `{name}`");
            Ok(())
        }
    }
}

fn find_schedule(app: &App, name: &str) -> anyhow::Result<ScheduledBackupJob> {
    app.catalog
        .list_schedules()?
        .into_iter()
        .find(|job| job.name == name)
        .with_context(|| format!("No schedule named `{name}`. See `snapvault schedule list`"))
}

fn encryption_cmd(app: App, cmd: EncryptionCmd) -> anyhow::Result<()> {
    match cmd {
        EncryptionCmd::Setup { passphrase } => {
            app.encryptor.setup(&passphrase)?;
            info!("Encryption key derived and stored");
            Ok(())
        }
        EncryptionCmd::Verify { passphrase } => {
            if app.encryptor.verify(&passphrase)? {
                info!("Passphrase matches the stored key");
                Ok(())
            } else {
                anyhow::bail!("Passphrase does not match the stored key");
            }
        }
        EncryptionCmd::Remove => {
            app.encryptor.remove()?;
            info!("Encryption key removed");
            Ok(())
        }
    }
}
