//! Scheduled backups: the due-job ticker and the process-wide periodic runs
//!
//! Two independent mechanisms share one engine. The ticker fires every
//! minute (and once at startup) and runs whatever `list_due_at` returns,
//! recomputing each job's next occurrence afterwards. The optional periodic
//! scheduler runs a full-library backup of every destination on a preset
//! interval, restricted to a preferred hour window. Both re-check the
//! at-most-one-active-job invariant and the resource gates before touching
//! the engine.


use std::{sync::Arc, time::Duration as StdDuration};

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Timelike, Utc};
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::{
    catalog::{Catalog, CatalogError, Schedule, ScheduledBackupJob},
    dest::{DestError, Destination, TransferTuning},
    notify::{NotificationEvent, Notifier},
    source::PhotoSource,
    sync::{SyncEngine, SyncError, SyncOptions},
};

const TICK_INTERVAL: StdDuration = StdDuration::from_secs(60);
/// Runs are skipped when free disk falls under this
const MIN_FREE_DISK: u64 = 1_024 * 1_024 * 1_024;

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("failed registering launch at login")]
    LaunchAtLoginFail,
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error(transparent)]
    Destination(#[from] DestError),
}

/// Hardware predicates the host supplies; the scheduler only consumes bools
pub trait SystemMonitor: Send + Sync {
    /// Thermal state is `nominal` or `fair`
    fn thermal_ok(&self) -> bool;
    fn free_disk_bytes(&self) -> Option<u64>;
    fn on_ac_power(&self) -> bool;
}

/// Default host monitor: real disk numbers, optimistic about the rest
///
/// Thermal and power sensing are platform services we deliberately keep
/// outside the core; hosts that have them wire up their own monitor.
pub struct HostMonitor;

impl SystemMonitor for HostMonitor {
    fn thermal_ok(&self) -> bool {
        true
    }

    fn free_disk_bytes(&self) -> Option<u64> {
        let disks = sysinfo::Disks::new_with_refreshed_list();
        disks.iter().map(|disk| disk.available_space()).max()
    }

    fn on_ac_power(&self) -> bool {
        true
    }
}

/// Interval presets the config file accepts
pub fn parse_preset(preset: &str) -> Option<Duration> {
    let interval = match preset {
        "6h" => Duration::hours(6),
        "12h" => Duration::hours(12),
        "daily" => Duration::days(1),
        "every-2-days" => Duration::days(2),
        "weekly" => Duration::weeks(1),
        _ => return None,
    };
    Some(interval)
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PeriodicConfig {
    pub interval: Duration,
    /// Preferred hour-of-day window `[start, end)`, wrapping midnight when
    /// `start > end`
    pub window: Option<(u32, u32)>,
    pub requires_charging: bool,
}

pub fn window_allows(window: Option<(u32, u32)>, hour: u32) -> bool {
    match window {
        None => true,
        Some((start, end)) if start == end => true,
        Some((start, end)) if start < end => (start..end).contains(&hour),
        // Wrapping window, e.g. 22..6
        Some((start, end)) => hour >= start || hour < end,
    }
}

/// Computes when `schedule` should fire next, strictly after `after`
///
/// `None` means the schedule is exhausted (one-shots after their run).
pub fn next_run_after(
    schedule: &Schedule,
    after: DateTime<Utc>,
    last_run: Option<DateTime<Utc>>,
) -> Option<DateTime<Utc>> {
    match *schedule {
        Schedule::OneTime { at } => match last_run {
            // Never ran: fire at the requested moment (or now, if that moment
            // already slipped by)
            None => Some(at.max(after)),
            Some(_) => None,
        },
        Schedule::Interval { seconds } => {
            let base = last_run.unwrap_or(after);
            Some(base + Duration::seconds(seconds as i64))
        }
        Schedule::Daily { hour, minute } => {
            let mut date = after.date_naive();
            loop {
                if let Some(candidate) = at_time(date, hour, minute) {
                    if candidate > after {
                        return Some(candidate);
                    }
                }
                date = date.succ_opt()?;
            }
        }
        Schedule::Weekly {
            weekday,
            hour,
            minute,
        } => {
            let mut date = after.date_naive();
            for _ in 0..8 {
                if date.weekday().num_days_from_monday() == weekday {
                    if let Some(candidate) = at_time(date, hour, minute) {
                        if candidate > after {
                            return Some(candidate);
                        }
                    }
                }
                date = date.succ_opt()?;
            }
            None
        }
        Schedule::Monthly {
            day_of_month,
            hour,
            minute,
        } => {
            let mut year = after.year();
            let mut month = after.month();
            for _ in 0..14 {
                let date = clamped_day(year, month, day_of_month)?;
                if let Some(candidate) = at_time(date, hour, minute) {
                    if candidate > after {
                        return Some(candidate);
                    }
                }
                month += 1;
                if month > 12 {
                    month = 1;
                    year += 1;
                }
            }
            None
        }
    }
}

fn at_time(date: NaiveDate, hour: u32, minute: u32) -> Option<DateTime<Utc>> {
    let naive = date.and_hms_opt(hour, minute, 0)?;
    Some(Utc.from_utc_datetime(&naive))
}

/// `day_of_month` past the month's length clamps to the last day (monthly(31)
/// in February runs on the 28th or 29th)
fn clamped_day(year: i32, month: u32, day_of_month: u32) -> Option<NaiveDate> {
    let days_in_month = {
        let (next_year, next_month) = if month == 12 {
            (year + 1, 1)
        } else {
            (year, month + 1)
        };
        NaiveDate::from_ymd_opt(next_year, next_month, 1)?
            .pred_opt()?
            .day()
    };
    NaiveDate::from_ymd_opt(year, month, day_of_month.min(days_in_month).max(1))
}

pub struct Scheduler {
    catalog: Arc<Catalog>,
    engine: Arc<SyncEngine>,
    notifier: Notifier,
    monitor: Arc<dyn SystemMonitor>,
    tuning: TransferTuning,
    /// Template for engine options; each job swaps in its own filter
    options: SyncOptions,
    periodic: Option<PeriodicConfig>,
    last_periodic_run: Mutex<Option<DateTime<Utc>>>,
}

impl Scheduler {
    pub fn new(
        catalog: Arc<Catalog>,
        engine: Arc<SyncEngine>,
        notifier: Notifier,
        monitor: Arc<dyn SystemMonitor>,
        tuning: TransferTuning,
        options: SyncOptions,
        periodic: Option<PeriodicConfig>,
    ) -> Self {
        Self {
            catalog,
            engine,
            notifier,
            monitor,
            tuning,
            options,
            periodic,
            last_periodic_run: Mutex::new(None),
        }
    }

    /// Launch-at-login is a host capability; we only relay its verdict
    pub fn register_launch_at_login(
        &self,
        register: &dyn Fn(bool) -> bool,
        enabled: bool,
    ) -> Result<(), SchedulerError> {
        if register(enabled) {
            Ok(())
        } else {
            Err(SchedulerError::LaunchAtLoginFail)
        }
    }

    /// One pass over everything due at `now`; returns how many jobs ran
    pub async fn tick(
        &self,
        source: &dyn PhotoSource,
        now: DateTime<Utc>,
    ) -> Result<u32, SchedulerError> {
        let mut ran = 0;

        for job in self.catalog.list_due_at(now)? {
            if !job.is_enabled {
                continue;
            }
            if let Err(reason) = self.gates_pass(self.periodic.is_some_and(|p| p.requires_charging))
            {
                info!("Skipping schedule `{}`: {reason}", job.name);
                continue;
            }
            if self.engine.is_active() {
                info!("Skipping schedule `{}`: a sync job is already running", job.name);
                continue;
            }

            self.run_scheduled(source, &job, now).await?;
            ran += 1;
        }

        if self.periodic_due(now) {
            ran += self.run_periodic(source, now).await?;
        }

        Ok(ran)
    }

    /// The 60 s ticker; also fires immediately at startup
    pub async fn run_loop(&self, source: &dyn PhotoSource) {
        let mut ticker = tokio::time::interval(TICK_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(err) = self.tick(source, Utc::now()).await {
                warn!("Scheduler tick failed: {err:#}");
            }
        }
    }

    async fn run_scheduled(
        &self,
        source: &dyn PhotoSource,
        job: &ScheduledBackupJob,
        now: DateTime<Utc>,
    ) -> Result<(), SchedulerError> {
        info!("Running scheduled backup `{}`", job.name);
        self.notifier.send(NotificationEvent::ScheduledBackupStarted {
            schedule_name: job.name.clone(),
        });

        let status = match self.backup_destination(source, job).await {
            Ok(()) => "completed",
            Err(err) => {
                warn!("Scheduled backup `{}` failed: {err:#}", job.name);
                "failed"
            }
        };

        let next_run = next_run_after(&job.schedule, now, Some(now));
        self.catalog
            .record_run_result(job.id, now, next_run, status)?;

        self.notifier
            .send(NotificationEvent::ScheduledBackupCompleted {
                schedule_name: job.name.clone(),
            });
        Ok(())
    }

    async fn backup_destination(
        &self,
        source: &dyn PhotoSource,
        job: &ScheduledBackupJob,
    ) -> Result<(), SyncError> {
        let record = self
            .catalog
            .get_destination(job.destination_id)?
            .ok_or(SyncError::Destination(DestError::InvalidConfig(format!(
                "schedule `{}` points at a deleted destination",
                job.name
            ))))?;
        let mut backend = Destination::from_record(&record, self.tuning)
            .map_err(SyncError::Destination)?;

        let options = SyncOptions {
            filter: job.filter,
            ..self.options.clone()
        };
        self.engine
            .run_backup(source, &mut backend, job.destination_id, options)
            .await
            .map(|_| ())
    }

    fn periodic_due(&self, now: DateTime<Utc>) -> bool {
        let Some(periodic) = &self.periodic else {
            return false;
        };
        if !window_allows(periodic.window, now.hour()) {
            return false;
        }
        if self.gates_pass(periodic.requires_charging).is_err() {
            return false;
        }
        match *self.last_periodic_run.lock() {
            None => true,
            Some(last) => now - last >= periodic.interval,
        }
    }

    async fn run_periodic(
        &self,
        source: &dyn PhotoSource,
        now: DateTime<Utc>,
    ) -> Result<u32, SchedulerError> {
        *self.last_periodic_run.lock() = Some(now);
        let mut ran = 0;

        for record in self.catalog.list_destinations()? {
            if self.engine.is_active() {
                info!("Periodic backup pausing at `{}`: engine is busy", record.name);
                break;
            }
            let mut backend = Destination::from_record(&record, self.tuning)?;
            let options = SyncOptions {
                filter: crate::source::DateRangeFilter::FullLibrary,
                ..self.options.clone()
            };
            match self
                .engine
                .run_backup(source, &mut backend, record.id, options)
                .await
            {
                Ok(_) | Err(SyncError::NoPhotosToSync) => ran += 1,
                Err(err) => warn!("Periodic backup of `{}` failed: {err:#}", record.name),
            }
        }

        Ok(ran)
    }

    fn gates_pass(&self, requires_charging: bool) -> Result<(), &'static str> {
        if !self.monitor.thermal_ok() {
            return Err("thermal state is elevated");
        }
        if let Some(free) = self.monitor.free_disk_bytes() {
            if free <= MIN_FREE_DISK {
                return Err("free disk space is under 1 GiB");
            }
        }
        if requires_charging && !self.monitor.on_ac_power() {
            return Err("not on AC power");
        }
        Ok(())
    }
}
