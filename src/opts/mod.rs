mod cli;
mod config;

use crate::{
    dest::TransferTuning,
    scheduler::{parse_preset, PeriodicConfig},
    source::DateRangeFilter,
    sync::SyncOptions,
};

pub use self::cli::{
    BackupArgs, Cli, Commands, ConfigCmd, DestinationCmd, EncryptionCmd, FilterArg, GapsArgs,
    MonthlySpec, MountKindArg, ScheduleCmd, TimeOfDay, VerifyArgs, WeeklySpec, Window,
};
pub use self::config::Config;

impl From<FilterArg> for DateRangeFilter {
    fn from(filter: FilterArg) -> Self {
        match filter {
            FilterArg::Last24h => Self::Last24h,
            FilterArg::Last7d => Self::Last7d,
            FilterArg::Last30d => Self::Last30d,
            FilterArg::Last90d => Self::Last90d,
            FilterArg::FullLibrary => Self::FullLibrary,
        }
    }
}

/// Engine-facing settings after merging the config file with CLI overrides
#[derive(Debug, PartialEq)]
pub struct Opts {
    pub sync: SyncOptions,
    pub verify_concurrency: usize,
    pub log_retention_days: u32,
    pub tuning: TransferTuning,
    pub periodic: Option<PeriodicConfig>,
}

impl Opts {
    pub fn parse_and_load_from(config: Config) -> Self {
        let Config {
            concurrency: config_concurrency,
            verify_concurrency: config_verify_concurrency,
            log_retention_days: config_log_retention_days,
            encrypt: config_encrypt,
            obfuscate_filenames: config_obfuscate_filenames,
            multipart_threshold_mib: config_multipart_threshold_mib,
            part_size_mib: config_part_size_mib,
            max_part_retries: config_max_part_retries,
            periodic: config_periodic,
        } = config;

        let periodic = config_periodic.and_then(|section| {
            let preset = section.preset.as_deref()?;
            let Some(interval) = parse_preset(preset) else {
                tracing::warn!("Unknown periodic preset `{preset}`, periodic backups stay off");
                return None;
            };
            Some(PeriodicConfig {
                interval,
                window: section.window.map(|window| (window.start, window.end)),
                requires_charging: section.requires_charging,
            })
        });

        Self {
            sync: SyncOptions {
                filter: DateRangeFilter::FullLibrary,
                concurrency: config_concurrency.0,
                encrypt: config_encrypt,
                obfuscate_filenames: config_obfuscate_filenames,
            },
            verify_concurrency: config_verify_concurrency.0,
            log_retention_days: config_log_retention_days.0,
            tuning: TransferTuning {
                multipart_threshold: config_multipart_threshold_mib.0 * 1_024 * 1_024,
                part_size: config_part_size_mib.0 * 1_024 * 1_024,
                max_part_retries: config_max_part_retries.0,
            },
            periodic,
        }
    }

    /// Applies the per-run flags from `snapvault backup`
    pub fn apply_backup_args(&mut self, args: &BackupArgs) {
        if let Some(filter) = args.filter {
            self.sync.filter = filter.into();
        }
        if let Some(concurrency) = args.concurrency {
            self.sync.concurrency = concurrency;
        }
        self.sync.encrypt |= args.encrypt;
        self.sync.obfuscate_filenames |= args.obfuscate_filenames;
    }
}
