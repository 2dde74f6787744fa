//! Shared progress state, polled by the host and pushed over a watch channel

use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum EngineState {
    #[default]
    Idle,
    Preparing,
    Syncing,
    Paused,
    Completed,
    Cancelled,
    Failed,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ProgressSnapshot {
    pub state: EngineState,
    /// Photos queued for transfer after dedup
    pub total_photos: u64,
    pub completed_photos: u64,
    pub failed_photos: u64,
    /// Photos dedup decided were already safe
    pub skipped_photos: u64,
    pub bytes_transferred: u64,
    /// Filename currently in flight (any one of them, with concurrent workers)
    pub current_photo: Option<String>,
    pub average_speed_mib_s: Option<f64>,
    pub estimated_remaining: Option<Duration>,
}

/// Snapshot + change-notification pair
///
/// Hosts either poll `snapshot()` or park on the watch receiver; the engine
/// doesn't care which.
pub struct ProgressTracker {
    snapshot: Mutex<ProgressSnapshot>,
    tx: watch::Sender<ProgressSnapshot>,
}

impl Default for ProgressTracker {
    fn default() -> Self {
        let (tx, _) = watch::channel(ProgressSnapshot::default());
        Self {
            snapshot: Mutex::new(ProgressSnapshot::default()),
            tx,
        }
    }
}

impl ProgressTracker {
    pub fn snapshot(&self) -> ProgressSnapshot {
        self.snapshot.lock().clone()
    }

    pub fn state(&self) -> EngineState {
        self.snapshot.lock().state
    }

    pub fn subscribe(&self) -> watch::Receiver<ProgressSnapshot> {
        self.tx.subscribe()
    }

    pub fn update(&self, mutate: impl FnOnce(&mut ProgressSnapshot)) {
        let updated = {
            let mut snapshot = self.snapshot.lock();
            mutate(&mut snapshot);
            snapshot.clone()
        };
        // Nobody listening is fine
        let _ = self.tx.send(updated);
    }
}
