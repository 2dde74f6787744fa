use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::source::DateRangeFilter;

/// Catalog row recording that one asset was synced to one destination
///
/// `(local_id, destination_id)` is effectively unique: re-syncing the same
/// pair replaces the row. `id` stays stable so verification can batch-update
/// rows by key.
#[derive(Clone, Debug, PartialEq)]
pub struct SyncedPhoto {
    pub id: Uuid,
    pub local_id: String,
    pub destination_id: Uuid,
    pub remote_path: String,
    /// Hex encoded SHA-256 of the uploaded bytes
    pub checksum: String,
    pub sync_date: DateTime<Utc>,
    pub file_size: u64,
    pub last_verified_date: Option<DateTime<Utc>>,
    /// Opaque JSON blob of source metadata, kept for forensics only
    pub file_metadata: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobStatus {
    Running,
    Paused,
    Completed,
    Cancelled,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        let status = match s {
            "running" => Self::Running,
            "paused" => Self::Paused,
            "completed" => Self::Completed,
            "cancelled" => Self::Cancelled,
            "failed" => Self::Failed,
            _ => return None,
        };
        Some(status)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct SyncJob {
    pub id: Uuid,
    pub destination_id: Uuid,
    pub status: JobStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub photos_scanned: u64,
    pub photos_synced: u64,
    pub photos_failed: u64,
    pub bytes_transferred: u64,
    /// MiB/s over the whole job, filled in as it runs
    pub average_speed: Option<f64>,
}

impl SyncJob {
    pub fn started(destination_id: Uuid, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            destination_id,
            status: JobStatus::Running,
            start_time: now,
            end_time: None,
            photos_scanned: 0,
            photos_synced: 0,
            photos_failed: 0,
            bytes_transferred: 0,
            average_speed: None,
        }
    }
}

/// Per-photo failure recorded while a job keeps going
#[derive(Clone, Debug, PartialEq)]
pub struct SyncErrorRecord {
    pub id: Uuid,
    pub job_id: Uuid,
    pub photo_id: String,
    pub error_message: String,
    pub error_category: String,
    pub timestamp: DateTime<Utc>,
    pub retry_count: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Success,
    Warning,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Success => "success",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        let level = match s {
            "debug" => Self::Debug,
            "info" => Self::Info,
            "success" => Self::Success,
            "warning" => Self::Warning,
            "error" => Self::Error,
            _ => return None,
        };
        Some(level)
    }
}

/// Which append-only log table an entry belongs to
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogStream {
    Sync,
    Verification,
}

impl LogStream {
    pub(crate) fn table(&self) -> &'static str {
        match self {
            Self::Sync => "sync_logs",
            Self::Verification => "verification_logs",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct LogEntry {
    pub id: Uuid,
    pub job_id: Option<Uuid>,
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub category: String,
    pub message: String,
    /// Either a source local id or a remote path, whichever the site had
    pub photo_ref: Option<String>,
    pub details: Option<serde_json::Value>,
}

impl LogEntry {
    pub fn new(job_id: Option<Uuid>, level: LogLevel, category: &str, message: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_id,
            timestamp: Utc::now(),
            level,
            category: category.to_owned(),
            message,
            photo_ref: None,
            details: None,
        }
    }

    pub fn with_photo(mut self, photo_ref: String) -> Self {
        self.photo_ref = Some(photo_ref);
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DestinationKind {
    S3,
    Smb,
    Sftp,
    Ftp,
}

impl DestinationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::S3 => "s3",
            Self::Smb => "smb",
            Self::Sftp => "sftp",
            Self::Ftp => "ftp",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        let kind = match s {
            "s3" => Self::S3,
            "smb" => Self::Smb,
            "sftp" => Self::Sftp,
            "ftp" => Self::Ftp,
            _ => return None,
        };
        Some(kind)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum HealthStatus {
    #[default]
    Unknown,
    Healthy,
    Degraded,
    Unreachable,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unreachable => "unreachable",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        let status = match s {
            "unknown" => Self::Unknown,
            "healthy" => Self::Healthy,
            "degraded" => Self::Degraded,
            "unreachable" => Self::Unreachable,
            _ => return None,
        };
        Some(status)
    }
}

/// A configured backup destination
///
/// `config_blob` is owned by the concrete backend; the catalog only stores the
/// bytes.
#[derive(Clone, Debug, PartialEq)]
pub struct DestinationRecord {
    pub id: Uuid,
    pub name: String,
    pub kind: DestinationKind,
    pub config_blob: Vec<u8>,
    pub created_at: DateTime<Utc>,
    pub last_health_check: Option<DateTime<Utc>>,
    pub health_status: HealthStatus,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VerificationKind {
    Full,
    Quick,
    Incremental,
}

impl VerificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Quick => "quick",
            Self::Incremental => "incremental",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        let kind = match s {
            "full" => Self::Full,
            "quick" => Self::Quick,
            "incremental" => Self::Incremental,
            _ => return None,
        };
        Some(kind)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct VerificationJob {
    pub id: Uuid,
    pub destination_id: Uuid,
    pub kind: VerificationKind,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub total_photos: u64,
    pub verified_count: u64,
    pub mismatch_count: u64,
    pub missing_count: u64,
    pub error_count: u64,
}

/// When a scheduled backup recurs
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "kind")]
pub enum Schedule {
    OneTime {
        at: DateTime<Utc>,
    },
    Interval {
        seconds: u64,
    },
    Daily {
        hour: u32,
        minute: u32,
    },
    Weekly {
        /// 0 = Monday .. 6 = Sunday, matching `chrono::Weekday::num_days_from_monday`
        weekday: u32,
        hour: u32,
        minute: u32,
    },
    Monthly {
        day_of_month: u32,
        hour: u32,
        minute: u32,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub struct ScheduledBackupJob {
    pub id: Uuid,
    pub destination_id: Uuid,
    pub name: String,
    pub is_enabled: bool,
    pub schedule: Schedule,
    pub filter: DateRangeFilter,
    pub created_at: DateTime<Utc>,
    pub last_run_time: Option<DateTime<Utc>>,
    pub next_run_time: Option<DateTime<Utc>>,
    pub last_run_status: Option<String>,
}

/// Aggregate numbers for one destination, used by the status command
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DestinationStats {
    pub photo_count: u64,
    pub total_bytes: u64,
}
