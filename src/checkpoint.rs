//! Resumable job state.
//!
//! A checkpoint records the settings of a job plus the set of images that
//! have been converted so far. Workers mark images complete in memory, and a
//! timer writes the checkpoint out at most once per
//! [`CHECKPOINT_FLUSH_INTERVAL`] while there are unsaved changes. The pipeline
//! always flushes once more at the end of a run.
//!
//! Checkpoint I/O is best effort. If we can't read or write the file, we log a
//! warning and carry on, because losing a checkpoint only costs us some repeat
//! work on the next run.

use std::{
    collections::BTreeSet,
    sync::{Arc, Mutex},
    time::Duration,
};

use schemars::JsonSchema;
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::{async_utils::io::write_file_atomic, config::JobSettings, prelude::*};

/// Default checkpoint file, relative to the current directory.
pub const DEFAULT_CHECKPOINT_FILE: &str = "book-ocr-session.json";

/// How often we write a dirty checkpoint.
pub const CHECKPOINT_FLUSH_INTERVAL: Duration = Duration::from_secs(5);

/// Persisted job state.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct Checkpoint {
    /// The job this checkpoint belongs to.
    #[serde(flatten)]
    pub settings: JobSettings,

    /// Number of matching images when the job last ran.
    pub total_files: usize,

    /// Base names of the images that have been converted.
    #[serde(default)]
    pub processed_files: BTreeSet<String>,
}

impl Checkpoint {
    /// A checkpoint with nothing done yet.
    pub fn new(settings: JobSettings) -> Self {
        Self {
            settings,
            total_files: 0,
            processed_files: BTreeSet::new(),
        }
    }

    /// Does this checkpoint belong to a job reading `source_dir`?
    pub fn is_for_source(&self, source_dir: &Path) -> bool {
        self.settings.source_dir == source_dir
    }
}

/// Where checkpoints live on disk.
#[derive(Clone, Debug)]
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    /// Use the checkpoint file at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The checkpoint file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load whatever checkpoint exists, for any source directory. Missing
    /// and unreadable checkpoints both return `None`.
    #[instrument(level = "debug", skip_all, fields(path = %self.path.display()))]
    pub async fn load_any(&self) -> Option<Checkpoint> {
        let data = match tokio::fs::read(&self.path).await {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return None,
            Err(err) => {
                warn!("Failed to read checkpoint {:?}: {}", self.path, err);
                return None;
            }
        };
        match serde_json::from_slice::<Checkpoint>(&data) {
            Ok(checkpoint) => Some(checkpoint),
            Err(err) => {
                warn!("Ignoring corrupt checkpoint {:?}: {}", self.path, err);
                None
            }
        }
    }

    /// Load the checkpoint for `source_dir`. A checkpoint for some other
    /// directory is ignored.
    pub async fn load(&self, source_dir: &Path) -> Option<Checkpoint> {
        let checkpoint = self.load_any().await?;
        if checkpoint.is_for_source(source_dir) {
            Some(checkpoint)
        } else {
            debug!(
                "Ignoring checkpoint for {:?}, since we're processing {:?}",
                checkpoint.settings.source_dir, source_dir
            );
            None
        }
    }

    /// Write `checkpoint`, replacing any existing file atomically.
    pub async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        let data = serde_json::to_vec_pretty(checkpoint)
            .context("Failed to serialize checkpoint")?;
        write_file_atomic(self.path.clone(), data)
            .await
            .with_context(|| format!("Failed to save checkpoint to {:?}", self.path))
    }

    /// Delete the checkpoint. Deleting a missing checkpoint is not an error.
    pub async fn clear(&self) -> Result<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err)
                .with_context(|| format!("Failed to delete checkpoint {:?}", self.path)),
        }
    }
}

/// In-memory checkpoint state.
#[derive(Debug)]
struct TrackerState {
    checkpoint: Checkpoint,
    dirty: bool,
}

/// Shared, thread-safe checkpoint for a running job.
#[derive(Debug)]
pub struct CheckpointTracker {
    store: CheckpointStore,
    state: Mutex<TrackerState>,
    /// Serializes writes, so an older snapshot never lands after a newer one.
    write_lock: tokio::sync::Mutex<()>,
}

impl CheckpointTracker {
    /// Start tracking `checkpoint`, which will be written to `store`.
    pub fn new(store: CheckpointStore, checkpoint: Checkpoint) -> Arc<Self> {
        Arc::new(Self {
            store,
            state: Mutex::new(TrackerState {
                checkpoint,
                dirty: true,
            }),
            write_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Record that `file_name` has been converted. Returns `false` if it was
    /// already recorded.
    pub fn mark_complete(&self, file_name: &str) -> bool {
        let mut state = self.state.lock().expect("lock poisoned");
        let inserted = state.checkpoint.processed_files.insert(file_name.to_owned());
        if inserted {
            state.dirty = true;
        }
        inserted
    }

    /// Are there changes that haven't been written?
    #[cfg(test)]
    pub fn is_dirty(&self) -> bool {
        self.state.lock().expect("lock poisoned").dirty
    }

    /// Take a snapshot if there is anything to write, clearing the dirty flag.
    fn take_dirty_snapshot(&self) -> Option<Checkpoint> {
        let mut state = self.state.lock().expect("lock poisoned");
        if !state.dirty {
            return None;
        }
        state.dirty = false;
        Some(state.checkpoint.clone())
    }

    /// Write the checkpoint if it has changed. Failures are logged, and leave
    /// the checkpoint dirty so that we try again later.
    pub async fn flush_if_dirty(&self) -> bool {
        let _guard = self.write_lock.lock().await;
        let Some(snapshot) = self.take_dirty_snapshot() else {
            return false;
        };
        match self.store.save(&snapshot).await {
            Ok(()) => {
                trace!(
                    processed = snapshot.processed_files.len(),
                    "Saved checkpoint"
                );
                true
            }
            Err(err) => {
                warn!("{:#}", err);
                self.state.lock().expect("lock poisoned").dirty = true;
                false
            }
        }
    }

    /// Write the checkpoint unconditionally.
    pub async fn flush(&self) {
        self.state.lock().expect("lock poisoned").dirty = true;
        self.flush_if_dirty().await;
    }

    /// Flush the checkpoint every `interval` until the returned timer is
    /// stopped.
    pub fn spawn_flusher(self: &Arc<Self>, interval: Duration) -> FlushTimer {
        let stop = CancellationToken::new();
        let tracker = self.clone();
        let stop_rx = stop.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    biased;

                    _ = stop_rx.cancelled() => break,

                    _ = ticker.tick() => {
                        tracker.flush_if_dirty().await;
                    }
                }
            }
        });
        FlushTimer { stop, handle }
    }
}

/// A running periodic flush.
pub struct FlushTimer {
    stop: CancellationToken,
    handle: JoinHandle<()>,
}

impl FlushTimer {
    /// Stop the timer and wait for any in-progress flush to finish.
    pub async fn stop(self) {
        self.stop.cancel();
        if let Err(err) = self.handle.await {
            if err.is_panic() {
                std::panic::resume_unwind(err.into_panic());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::ScanMode, output::OutputFormat};

    fn settings(source_dir: &str) -> JobSettings {
        JobSettings {
            source_dir: PathBuf::from(source_dir),
            output_dir: PathBuf::from("/out"),
            credentials: Some(PathBuf::from("/keys/vision.key")),
            languages: vec!["ja".to_owned(), "en".to_owned()],
            concurrency: 4,
            merge: true,
            merge_name: "Book.pdf".to_owned(),
            scan_mode: ScanMode::Single,
            output_format: OutputFormat::Pdf,
            font: None,
        }
    }

    #[tokio::test]
    async fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().join("session.json"));
        let mut checkpoint = Checkpoint::new(settings("/scans/book"));
        checkpoint.total_files = 3;
        checkpoint.processed_files.insert("Page-002.jpg".to_owned());
        checkpoint.processed_files.insert("Page-001.jpg".to_owned());

        store.save(&checkpoint).await.unwrap();
        let loaded = store.load(Path::new("/scans/book")).await.unwrap();
        assert_eq!(loaded, checkpoint);

        let json: serde_json::Value =
            serde_json::from_slice(&std::fs::read(store.path()).unwrap()).unwrap();
        assert_eq!(json["source_dir"], "/scans/book");
        assert_eq!(json["scan_mode"], "single");
        assert_eq!(
            json["processed_files"],
            serde_json::json!(["Page-001.jpg", "Page-002.jpg"])
        );
    }

    #[tokio::test]
    async fn test_foreign_missing_and_corrupt_checkpoints_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().join("session.json"));
        assert!(store.load(Path::new("/scans/book")).await.is_none());

        store
            .save(&Checkpoint::new(settings("/scans/other")))
            .await
            .unwrap();
        assert!(store.load(Path::new("/scans/book")).await.is_none());
        assert!(store.load_any().await.is_some());

        std::fs::write(store.path(), "{ not json").unwrap();
        assert!(store.load_any().await.is_none());
    }

    #[tokio::test]
    async fn test_missing_output_format_defaults_to_pdf() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        std::fs::write(
            &path,
            r#"{
                "source_dir": "/scans/book",
                "output_dir": "/out",
                "credentials": null,
                "languages": ["en"],
                "concurrency": 5,
                "merge": true,
                "merge_name": "Merge.pdf",
                "scan_mode": "dual",
                "total_files": 2,
                "processed_files": ["Page-001-002.jpg"]
            }"#,
        )
        .unwrap();
        let checkpoint = CheckpointStore::new(path).load_any().await.unwrap();
        assert_eq!(checkpoint.settings.output_format, OutputFormat::Pdf);
        assert_eq!(checkpoint.processed_files.len(), 1);
    }

    #[tokio::test]
    async fn test_mark_complete_is_idempotent_and_flush_clears_dirty() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().join("session.json"));
        let tracker = CheckpointTracker::new(
            store.clone(),
            Checkpoint::new(settings("/scans/book")),
        );

        assert!(tracker.flush_if_dirty().await);
        assert!(!tracker.is_dirty());
        assert!(!tracker.flush_if_dirty().await);

        assert!(tracker.mark_complete("Page-001.jpg"));
        assert!(tracker.is_dirty());
        assert!(tracker.flush_if_dirty().await);
        assert!(!tracker.mark_complete("Page-001.jpg"));
        assert!(!tracker.is_dirty());

        let loaded = store.load_any().await.unwrap();
        assert_eq!(loaded.processed_files.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_flush_stays_dirty() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().join("missing").join("session.json"));
        let tracker = CheckpointTracker::new(store, Checkpoint::new(settings("/scans/book")));
        assert!(!tracker.flush_if_dirty().await);
        assert!(tracker.is_dirty());
    }

    #[tokio::test]
    async fn test_clear() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().join("session.json"));
        let tracker = CheckpointTracker::new(
            store.clone(),
            Checkpoint::new(settings("/scans/book")),
        );
        tracker.flush().await;
        assert!(store.path().exists());
        store.clear().await.unwrap();
        assert!(!store.path().exists());
        // Clearing twice is fine.
        store.clear().await.unwrap();
    }

    #[tokio::test]
    async fn test_flusher_writes_dirty_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().join("session.json"));
        let tracker = CheckpointTracker::new(
            store.clone(),
            Checkpoint::new(settings("/scans/book")),
        );
        let timer = tracker.spawn_flusher(Duration::from_millis(10));
        tracker.mark_complete("Page-007.jpg");

        let mut saved = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if let Some(checkpoint) = store.load_any().await {
                if checkpoint.processed_files.contains("Page-007.jpg") {
                    saved = true;
                    break;
                }
            }
        }
        timer.stop().await;
        assert!(saved);
        assert!(!tracker.is_dirty());
    }
}
