// NOTE: this file gets `include!`d by the `xtask` completion generator, so it
// has to stay self-contained (clap + serde + std only)

use std::{array, path::PathBuf, str::FromStr};

use clap::{
    builder::PossibleValue, value_parser, Args as ClapArgs, CommandFactory, Parser, Subcommand,
    ValueEnum,
};
use serde::Deserialize;

#[derive(Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum FilterArg {
    Last24h,
    Last7d,
    Last30d,
    Last90d,
    #[default]
    FullLibrary,
}

impl FilterArg {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Last24h => "last-24h",
            Self::Last7d => "last-7d",
            Self::Last30d => "last-30d",
            Self::Last90d => "last-90d",
            Self::FullLibrary => "full-library",
        }
    }
}

impl ValueEnum for FilterArg {
    fn value_variants<'a>() -> &'a [Self] {
        &[
            Self::Last24h,
            Self::Last7d,
            Self::Last30d,
            Self::Last90d,
            Self::FullLibrary,
        ]
    }

    fn to_possible_value(&self) -> Option<PossibleValue> {
        Some(PossibleValue::new(self.as_str()))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MountKindArg {
    Smb,
    Sftp,
    Ftp,
}

impl MountKindArg {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Smb => "smb",
            Self::Sftp => "sftp",
            Self::Ftp => "ftp",
        }
    }
}

impl ValueEnum for MountKindArg {
    fn value_variants<'a>() -> &'a [Self] {
        &[Self::Smb, Self::Sftp, Self::Ftp]
    }

    fn to_possible_value(&self) -> Option<PossibleValue> {
        Some(PossibleValue::new(self.as_str()))
    }
}

/// `HH:MM`, e.g. `02:30`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimeOfDay {
    pub hour: u32,
    pub minute: u32,
}

impl FromStr for TimeOfDay {
    type Err = &'static str;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let mut parts = input.split(':');
        let [Some(hour), Some(minute), None] = array::from_fn(|_| parts.next()) else {
            return Err("Invalid time: expected format <HH>:<MM>");
        };
        let hour: u32 = hour.parse().map_err(|_| "Invalid hour: not a number")?;
        let minute: u32 = minute.parse().map_err(|_| "Invalid minute: not a number")?;
        if hour > 23 || minute > 59 {
            return Err("Invalid time: hour must be 0-23 and minute 0-59");
        }
        Ok(TimeOfDay { hour, minute })
    }
}

/// `<weekday>@HH:MM`, e.g. `mon@02:30`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WeeklySpec {
    /// 0 = Monday .. 6 = Sunday
    pub weekday: u32,
    pub time: TimeOfDay,
}

impl FromStr for WeeklySpec {
    type Err = &'static str;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let (day, time) = input
            .split_once('@')
            .ok_or("Invalid weekly spec: expected format <weekday>@<HH>:<MM>")?;
        let weekday = match day.to_ascii_lowercase().as_str() {
            "mon" | "monday" => 0,
            "tue" | "tuesday" => 1,
            "wed" | "wednesday" => 2,
            "thu" | "thursday" => 3,
            "fri" | "friday" => 4,
            "sat" | "saturday" => 5,
            "sun" | "sunday" => 6,
            _ => return Err("Invalid weekday: use mon..sun"),
        };
        Ok(WeeklySpec {
            weekday,
            time: time.parse()?,
        })
    }
}

/// `<day>@HH:MM`, e.g. `31@02:30` (clamped to the month's length)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MonthlySpec {
    pub day_of_month: u32,
    pub time: TimeOfDay,
}

impl FromStr for MonthlySpec {
    type Err = &'static str;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let (day, time) = input
            .split_once('@')
            .ok_or("Invalid monthly spec: expected format <day>@<HH>:<MM>")?;
        let day_of_month: u32 = day.parse().map_err(|_| "Invalid day of month: not a number")?;
        if !(1..=31).contains(&day_of_month) {
            return Err("Invalid day of month: must be 1-31");
        }
        Ok(MonthlySpec {
            day_of_month,
            time: time.parse()?,
        })
    }
}

/// Preferred hour window `<start>-<end>` (end exclusive, wraps midnight),
/// e.g. `22-6`
#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(try_from = "String")]
pub struct Window {
    pub start: u32,
    pub end: u32,
}

impl FromStr for Window {
    type Err = &'static str;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let mut parts = input.split('-');
        let [Some(start), Some(end), None] = array::from_fn(|_| parts.next()) else {
            return Err("Invalid window: expected format <start>-<end>");
        };
        let start: u32 = start.parse().map_err(|_| "Invalid window start: not a number")?;
        let end: u32 = end.parse().map_err(|_| "Invalid window end: not a number")?;
        if start > 23 || end > 23 {
            return Err("Invalid window: hours must be 0-23");
        }
        Ok(Window { start, end })
    }
}

impl TryFrom<String> for Window {
    type Error = &'static str;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

#[derive(Debug, PartialEq, Clone, Parser)]
#[command(version, about, arg_required_else_help(true))]
pub struct Cli {
    /// Configuration file to use
    #[arg(short = 'c', long = "config", global = true)]
    pub config: Option<PathBuf>,

    /// Catalog database file to use
    #[arg(long = "catalog", global = true)]
    pub catalog: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, PartialEq, Clone)]
pub enum Commands {
    /// Back up the library to a destination
    Backup(BackupArgs),
    /// Verify that a destination still holds what the catalog recorded
    Verify(VerifyArgs),
    /// Find library photos a destination is missing
    Gaps(GapsArgs),
    /// Run the schedule ticker in the foreground
    Run {
        /// Directory to treat as the photo library
        #[arg(long = "library", value_name = "DIR")]
        library: PathBuf,
    },
    /// Show recent jobs and destination stats
    Status {
        /// How many recent jobs to show
        #[arg(long = "jobs", default_value_t = 10)]
        jobs: u32,
    },
    /// Drop logs and finished jobs older than the retention period
    Purge {
        /// Retention in days (defaults to the configured value)
        #[arg(long = "days")]
        days: Option<u32>,
    },
    #[command(subcommand)]
    Destination(DestinationCmd),
    #[command(subcommand)]
    Schedule(ScheduleCmd),
    #[command(subcommand)]
    Encryption(EncryptionCmd),
    #[command(subcommand)]
    Config(ConfigCmd),
}

#[derive(ClapArgs, PartialEq, Debug, Clone)]
pub struct BackupArgs {
    /// Name of the destination to back up to
    pub destination: String,

    /// Directory to treat as the photo library
    #[arg(long = "library", value_name = "DIR")]
    pub library: PathBuf,

    /// Which slice of the library to back up
    #[arg(short = 'f', long = "filter", value_parser = value_parser!(FilterArg))]
    pub filter: Option<FilterArg>,

    /// Transfer workers to run in parallel (1-10)
    #[arg(long = "concurrency")]
    pub concurrency: Option<usize>,

    /// Encrypt files before uploading
    #[arg(long = "encrypt")]
    pub encrypt: bool,

    /// Replace filenames with random identifiers on the destination
    #[arg(long = "obfuscate-filenames")]
    pub obfuscate_filenames: bool,
}

#[derive(ClapArgs, PartialEq, Debug, Clone)]
pub struct VerifyArgs {
    /// Name of the destination to verify
    pub destination: String,

    /// Sample a few photos instead of scanning everything
    #[arg(long = "quick")]
    pub quick: bool,

    /// Sample size for --quick
    #[arg(long = "sample", default_value_t = 10)]
    pub sample: usize,

    /// Delete bad remote objects and their rows so the next backup re-uploads
    #[arg(long = "repair")]
    pub repair: bool,

    /// Skip recording verification dates on healthy rows
    #[arg(long = "no-update")]
    pub no_update: bool,
}

#[derive(ClapArgs, PartialEq, Debug, Clone)]
pub struct GapsArgs {
    /// Name of the destination to check
    pub destination: String,

    /// Directory to treat as the photo library
    #[arg(long = "library", value_name = "DIR")]
    pub library: PathBuf,

    #[arg(short = 'f', long = "filter", value_parser = value_parser!(FilterArg))]
    pub filter: Option<FilterArg>,
}

#[derive(Subcommand, PartialEq, Clone, Debug)]
pub enum DestinationCmd {
    /// Register an S3-family destination
    AddS3 {
        name: String,
        #[arg(long)]
        bucket: String,
        #[arg(long)]
        region: String,
        /// Custom endpoint for S3-compatible stores
        #[arg(long)]
        endpoint: Option<String>,
        #[arg(long = "access-key")]
        access_key: String,
        #[arg(long = "secret-key")]
        secret_key: String,
        #[arg(long)]
        prefix: Option<String>,
    },
    /// Register an SMB/SFTP/FTP destination reached through a mount
    AddMount {
        name: String,
        #[arg(long, value_parser = value_parser!(MountKindArg))]
        kind: MountKindArg,
        #[arg(long = "mount-point")]
        mount_point: PathBuf,
        /// Share locator, e.g. smb://nas/backups
        #[arg(long = "share-url")]
        share_url: Option<String>,
        #[arg(long)]
        username: Option<String>,
        #[arg(long)]
        prefix: Option<String>,
    },
    /// List registered destinations
    List,
    /// Remove a destination and everything recorded against it
    Remove { name: String },
    /// Check that a destination is reachable
    Test { name: String },
}

#[derive(Subcommand, PartialEq, Clone, Debug)]
pub enum ScheduleCmd {
    /// Add a recurring (or one-shot) backup
    Add {
        name: String,
        #[arg(long)]
        destination: String,
        #[arg(short = 'f', long = "filter", value_parser = value_parser!(FilterArg))]
        filter: Option<FilterArg>,
        /// Run once at this moment (RFC 3339)
        #[arg(long = "at", group = "when")]
        at: Option<String>,
        /// Run every N seconds
        #[arg(long = "interval-secs", group = "when")]
        interval_secs: Option<u64>,
        /// Run daily at HH:MM
        #[arg(long, group = "when", value_parser = value_parser!(TimeOfDay))]
        daily: Option<TimeOfDay>,
        /// Run weekly at <weekday>@HH:MM
        #[arg(long, group = "when", value_parser = value_parser!(WeeklySpec))]
        weekly: Option<WeeklySpec>,
        /// Run monthly at <day>@HH:MM
        #[arg(long, group = "when", value_parser = value_parser!(MonthlySpec))]
        monthly: Option<MonthlySpec>,
    },
    /// List configured schedules
    List,
    Remove { name: String },
    Enable { name: String },
    Disable { name: String },
}

#[derive(Subcommand, PartialEq, Clone, Debug)]
pub enum EncryptionCmd {
    /// Derive and store a key from a passphrase
    Setup {
        #[arg(long, env = "SNAPVAULT_PASSPHRASE")]
        passphrase: String,
    },
    /// Check a passphrase against the stored key
    Verify {
        #[arg(long, env = "SNAPVAULT_PASSPHRASE")]
        passphrase: String,
    },
    /// Forget the stored key
    Remove,
}

/// Configuration related things
#[derive(Subcommand, PartialEq, Clone, Debug)]
pub enum ConfigCmd {
    /// Print the configuration file path, creating a default file if missing
    Open,
}

pub fn command() -> clap::Command {
    Cli::command()
}
