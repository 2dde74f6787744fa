//! Fire-and-forget events for whatever host surface is listening
//!
//! The engine never waits on a notification being shown. Events go into an
//! unbounded channel and the host drains it (or doesn't; a dropped receiver
//! is fine).

use tokio::sync::mpsc;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq)]
pub enum NotificationEvent {
    BackupStarted {
        destination_id: Uuid,
    },
    BackupCompleted {
        destination_id: Uuid,
        synced: u64,
        failed: u64,
        bytes: u64,
    },
    BackupFailed {
        destination_id: Uuid,
        reason: String,
    },
    BackupPaused,
    BackupCancelled,
    VerificationStarted {
        destination_id: Uuid,
    },
    VerificationCompleted {
        destination_id: Uuid,
        verified: u64,
        mismatched: u64,
        missing: u64,
    },
    VerificationFailed {
        destination_id: Uuid,
        reason: String,
    },
    ScheduledBackupStarted {
        schedule_name: String,
    },
    ScheduledBackupCompleted {
        schedule_name: String,
    },
    GapDetectionCompleted {
        unsynced: u64,
        modified: u64,
    },
}

/// The default notifier swallows every event; hosts that care attach a
/// receiver with `new`
#[derive(Clone, Default)]
pub struct Notifier {
    tx: Option<mpsc::UnboundedSender<NotificationEvent>>,
}

impl Notifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<NotificationEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    pub fn send(&self, event: NotificationEvent) {
        if let Some(tx) = &self.tx {
            // The host hanging up is not our problem
            let _ = tx.send(event);
        }
    }
}
