//! The OCR job pipeline.
//!
//! A job scans the source directory for page images, skips the ones that are
//! already done, and runs the rest through a [`WorkQueue`]. Each image is sent
//! to the recognition engine, split into output pages, and written out by the
//! emitter. Progress is recorded in a checkpoint so that an interrupted job can
//! pick up where it left off.

pub mod discover;
pub mod engines;
pub mod partition;

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use tokio_util::sync::CancellationToken;

use crate::{
    checkpoint::{CHECKPOINT_FLUSH_INTERVAL, Checkpoint, CheckpointStore, CheckpointTracker},
    config::JobSettings,
    events::EventSender,
    filename::expected_shape,
    output::{PageEmitter, emit_pages, emitter_for, merge_and_report},
    prelude::*,
};

use self::{
    discover::{WorkItem, discover, output_path_for},
    engines::{RecognitionInput, TextRecognizer},
    partition::PagePartition,
};

use super::work::{Admission, WorkQueue};

/// How a job ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobOutcome {
    /// Every remaining image was attempted.
    Completed,
    /// The job was cancelled before every image was attempted.
    Cancelled,
    /// Nothing in the source directory matched the filename grammar.
    NoMatchingFiles,
}

/// Counts for a finished job.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobSummary {
    pub outcome: JobOutcome,
    /// Matching images in the source directory.
    pub total: usize,
    /// Images that were done before this run started.
    pub already_done: usize,
    /// Images converted by this run.
    pub succeeded: usize,
    /// Images that failed during this run.
    pub failed: usize,
    /// Images that were never attempted because of cancellation.
    pub skipped: usize,
}

impl JobSummary {
    fn empty(outcome: JobOutcome, total: usize, already_done: usize) -> Self {
        Self {
            outcome,
            total,
            already_done,
            succeeded: 0,
            failed: 0,
            skipped: 0,
        }
    }
}

/// A single run of the pipeline. Create a fresh one for every run.
pub struct OcrJob {
    pub settings: JobSettings,
    pub recognizer: Arc<dyn TextRecognizer>,
    pub store: CheckpointStore,
    pub events: EventSender,
    pub cancel: CancellationToken,
    pub flush_interval: Duration,
}

impl OcrJob {
    /// Create a job with a fresh cancellation token.
    pub fn new(
        settings: JobSettings,
        recognizer: Arc<dyn TextRecognizer>,
        store: CheckpointStore,
        events: EventSender,
    ) -> Self {
        Self {
            settings,
            recognizer,
            store,
            events,
            cancel: CancellationToken::new(),
            flush_interval: CHECKPOINT_FLUSH_INTERVAL,
        }
    }

    /// A token which stops this job when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run the job.
    ///
    /// Only problems that stop the whole job are returned as errors. Failures
    /// on individual images are reported as events and counted in the
    /// summary.
    #[instrument(level = "debug", skip_all, fields(source_dir = %self.settings.source_dir.display()))]
    pub async fn run(&self) -> Result<JobSummary> {
        let settings = &self.settings;
        if let Err(err) = tokio::fs::create_dir_all(&settings.output_dir).await {
            self.events
                .error(format!("Cannot create output directory: {}", err));
            return Err(err).with_context(|| {
                format!("Cannot create output directory {:?}", settings.output_dir)
            });
        }

        self.events
            .info(format!("Scan mode: {}", settings.scan_mode));

        let prior = self.store.load(&settings.source_dir).await;
        let discovery = match discover(settings, prior.as_ref()).await {
            Ok(discovery) => discovery,
            Err(err) => {
                self.events.error(format!("Scan failed: {:#}", err));
                return Err(err);
            }
        };

        let total = discovery.all_matched.len();
        if total == 0 {
            self.events.error(format!(
                "No matching files found ({})",
                expected_shape(settings.scan_mode)
            ));
            return Ok(JobSummary::empty(JobOutcome::NoMatchingFiles, 0, 0));
        }

        let already_done = discovery.already_done();
        self.events.log(
            "",
            0,
            total,
            format!(
                "Found {} matching files, {} already processed, {} remaining",
                total,
                already_done,
                discovery.remaining.len()
            ),
            false,
        );
        self.events.progress(already_done, total);

        if discovery.remaining.is_empty() {
            self.events.log("", 0, total, "All files already processed", false);
            self.finish_successfully().await;
            return Ok(JobSummary::empty(JobOutcome::Completed, total, already_done));
        }

        let emitter = match emitter_for(settings, &self.events).await {
            Ok(emitter) => emitter,
            Err(err) => {
                self.events.error(format!("Cannot prepare output: {:#}", err));
                return Err(err);
            }
        };

        let mut checkpoint = Checkpoint::new(settings.clone());
        checkpoint.total_files = total;
        checkpoint.processed_files = discovery.completed;
        let tracker = CheckpointTracker::new(self.store.clone(), checkpoint);
        tracker.flush().await;

        let remaining = discovery.remaining;
        let summary = self
            .schedule(remaining, emitter, already_done, total, &tracker)
            .await?;

        if summary.outcome == JobOutcome::Completed {
            self.events.log(
                "",
                total,
                total,
                format!(
                    "OCR complete! Processed {} files",
                    summary.succeeded + summary.failed
                ),
                false,
            );
            if summary.failed == 0 {
                self.finish_successfully().await;
            } else {
                self.events.error(format!(
                    "{} files failed; run `resume` to retry them",
                    summary.failed
                ));
            }
        }
        Ok(summary)
    }

    /// Run every item in `remaining` through a bounded pool of workers.
    async fn schedule(
        &self,
        remaining: Vec<WorkItem>,
        emitter: Arc<dyn PageEmitter>,
        already_done: usize,
        total: usize,
        tracker: &Arc<CheckpointTracker>,
    ) -> Result<JobSummary> {
        let submitted_count = remaining.len();
        let worker = Arc::new(Worker {
            settings: self.settings.clone(),
            recognizer: self.recognizer.clone(),
            emitter,
            events: self.events.clone(),
            tracker: tracker.clone(),
            total,
            processed: Mutex::new(already_done),
            succeeded: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
        });

        let timer = tracker.spawn_flusher(self.flush_interval);
        let mut queue = WorkQueue::new(self.settings.effective_concurrency(), self.cancel.clone());
        let mut admitted = 0;
        for item in remaining {
            let worker = worker.clone();
            match queue.submit(async move { worker.process(item).await }).await? {
                Admission::Admitted => admitted += 1,
                Admission::Cancelled => break,
            }
        }
        let stats = queue.drain().await;
        timer.stop().await;
        tracker.flush().await;

        let skipped = submitted_count - admitted + stats.skipped;
        let outcome = if skipped > 0 {
            self.events.log("", 0, total, "OCR stopped by user", false);
            JobOutcome::Cancelled
        } else {
            JobOutcome::Completed
        };
        Ok(JobSummary {
            outcome,
            total,
            already_done,
            succeeded: worker.succeeded.load(Ordering::SeqCst),
            failed: worker.failed.load(Ordering::SeqCst),
            skipped,
        })
    }

    /// Merge if asked to, then forget the checkpoint.
    async fn finish_successfully(&self) {
        if self.settings.merge {
            merge_and_report(
                self.settings.output_format.emitter(),
                &self.settings.output_dir,
                self.settings.output_format,
                &self.settings.merged_path(),
                &self.events,
            )
            .await;
        }
        if let Err(err) = self.store.clear().await {
            warn!("{:#}", err);
        }
    }
}

/// State shared by all the tasks of one job.
struct Worker {
    settings: JobSettings,
    recognizer: Arc<dyn TextRecognizer>,
    emitter: Arc<dyn PageEmitter>,
    events: EventSender,
    tracker: Arc<CheckpointTracker>,
    total: usize,
    /// Images finished so far, including the ones done before this run.
    /// Held while publishing, so progress events go out in order.
    processed: Mutex<usize>,
    succeeded: AtomicUsize,
    failed: AtomicUsize,
}

impl Worker {
    /// Process one image and report how it went.
    async fn process(&self, item: WorkItem) {
        let result = process_one_image(
            &self.settings,
            self.recognizer.as_ref(),
            self.emitter.clone(),
            &item,
        )
        .await;

        match result {
            Ok(()) => {
                self.tracker.mark_complete(&item.file_name);
                self.succeeded.fetch_add(1, Ordering::SeqCst);
                self.publish(&item.file_name, "OK".to_owned(), false);
            }
            Err(err) => {
                debug!(file = %item.file_name, "Failed: {:?}", err);
                self.failed.fetch_add(1, Ordering::SeqCst);
                self.publish(&item.file_name, format!("Error: {:#}", err), true);
            }
        }
    }

    /// Count one more finished image and publish its log line and progress.
    fn publish(&self, file_name: &str, message: String, is_error: bool) {
        // Sending never waits, so holding the lock here is cheap.
        let mut processed = self
            .processed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *processed += 1;
        self.events
            .log(file_name, *processed, self.total, message, is_error);
        self.events.progress(*processed, self.total);
    }
}

/// Recognize one image and write its output document.
#[instrument(level = "debug", skip_all, fields(file = %item.file_name))]
async fn process_one_image(
    settings: &JobSettings,
    recognizer: &dyn TextRecognizer,
    emitter: Arc<dyn PageEmitter>,
    item: &WorkItem,
) -> Result<()> {
    let image = tokio::fs::read(&item.path)
        .await
        .with_context(|| format!("Failed to read image {:?}", item.path))?;

    let result = recognizer
        .recognize(RecognitionInput {
            file_name: item.file_name.clone(),
            image,
            language_hints: settings.languages.clone(),
        })
        .await?;

    let pages = PagePartition::from_result(&result, settings.scan_mode).into_pages(&item.page);
    let output_path = output_path_for(settings, &item.file_name);
    emit_pages(emitter, output_path.clone(), pages)
        .await
        .with_context(|| format!("Failed to write {:?}", output_path))
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeSet, sync::Mutex};

    use tokio::sync::mpsc;

    use super::{engines::response::RecognitionResult, *};
    use crate::{
        config::ScanMode,
        events::{JobEvent, LogEntry},
        output::OutputFormat,
    };

    /// A recognizer that answers with one block per image, containing the
    /// image's stem on the left-hand page.
    #[derive(Default)]
    struct MockRecognizer {
        calls: Mutex<Vec<String>>,
        fail: BTreeSet<String>,
        /// Cancel this token when we've been called this many times.
        cancel_after: Option<(usize, CancellationToken)>,
    }

    impl MockRecognizer {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl TextRecognizer for MockRecognizer {
        async fn recognize(&self, input: RecognitionInput) -> Result<RecognitionResult> {
            let call_count = {
                let mut calls = self.calls.lock().unwrap();
                calls.push(input.file_name.clone());
                calls.len()
            };
            if let Some((n, token)) = &self.cancel_after {
                if call_count == *n {
                    token.cancel();
                }
            }
            if self.fail.contains(&input.file_name) {
                bail!("simulated outage");
            }
            let stem = input.file_name.trim_end_matches(".jpg");
            let json = serde_json::json!({
                "fullTextAnnotation": {"pages": [{
                    "width": 1000,
                    "blocks": [{
                        "boundingBox": {"vertices": [{"x": 100}, {"x": 200}]},
                        "paragraphs": [{"words": [{"symbols": [{"text": stem}]}]}]
                    }]
                }]}
            });
            Ok(serde_json::from_value(json)?)
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        settings: JobSettings,
        store: CheckpointStore,
    }

    fn fixture(images: &[&str]) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let source_dir = dir.path().join("scans");
        std::fs::create_dir(&source_dir).unwrap();
        for image in images {
            std::fs::write(source_dir.join(image), b"jpeg").unwrap();
        }
        let settings = JobSettings {
            source_dir,
            output_dir: dir.path().join("out"),
            credentials: None,
            languages: vec!["en".to_owned()],
            concurrency: 3,
            merge: false,
            merge_name: String::new(),
            scan_mode: ScanMode::Dual,
            output_format: OutputFormat::Text,
            font: None,
        };
        let store = CheckpointStore::new(dir.path().join("session.json"));
        Fixture {
            _dir: dir,
            settings,
            store,
        }
    }

    fn job(
        fixture: &Fixture,
        recognizer: Arc<MockRecognizer>,
    ) -> (OcrJob, mpsc::Receiver<JobEvent>) {
        let (events, rx) = EventSender::channel(256);
        let job = OcrJob::new(
            fixture.settings.clone(),
            recognizer,
            fixture.store.clone(),
            events,
        );
        (job, rx)
    }

    fn logs(rx: &mut mpsc::Receiver<JobEvent>) -> Vec<LogEntry> {
        let mut logs = vec![];
        while let Ok(event) = rx.try_recv() {
            if let JobEvent::Log(entry) = event {
                logs.push(entry);
            }
        }
        logs
    }

    #[tokio::test]
    async fn test_scenario_two_matching_files() {
        let mut fixture = fixture(&["Page-001-002.jpg", "Page-003-004.jpg", "Page-invalid.jpg"]);
        fixture.settings.merge = true;
        let recognizer = Arc::new(MockRecognizer::default());
        let (job, mut rx) = job(&fixture, recognizer.clone());

        let summary = job.run().await.unwrap();
        assert_eq!(summary.outcome, JobOutcome::Completed);
        assert_eq!((summary.total, summary.succeeded, summary.failed), (2, 2, 0));

        let mut calls = recognizer.calls();
        calls.sort();
        assert_eq!(calls, vec!["Page-001-002.jpg", "Page-003-004.jpg"]);

        let out = &fixture.settings.output_dir;
        let text = std::fs::read_to_string(out.join("Page-003-004.txt")).unwrap();
        assert!(text.starts_with("Page 3\n\nPage-003-004\n"));
        assert!(text.contains("Page 4"));
        assert!(out.join("Merge.txt").exists());

        // A clean run forgets its checkpoint.
        assert!(fixture.store.load_any().await.is_none());

        let messages = logs(&mut rx)
            .into_iter()
            .map(|l| l.message)
            .collect::<Vec<_>>();
        assert!(messages.contains(&"Found 2 matching files, 0 already processed, 2 remaining".to_owned()));
        assert!(messages.contains(&"OCR complete! Processed 2 files".to_owned()));
    }

    #[tokio::test]
    async fn test_second_run_makes_no_recognition_calls() {
        let fixture = fixture(&["Page-001-002.jpg", "Page-003-004.jpg"]);
        let (first, _rx) = job(&fixture, Arc::new(MockRecognizer::default()));
        first.run().await.unwrap();

        let recognizer = Arc::new(MockRecognizer::default());
        let (second, _rx) = job(&fixture, recognizer.clone());
        let summary = second.run().await.unwrap();
        assert_eq!(summary.outcome, JobOutcome::Completed);
        assert_eq!(summary.already_done, 2);
        assert!(recognizer.calls().is_empty());
    }

    #[tokio::test]
    async fn test_cancellation_leaves_resumable_checkpoint() {
        let mut fixture = fixture(&[
            "Page-001-002.jpg",
            "Page-003-004.jpg",
            "Page-005-006.jpg",
            "Page-007-008.jpg",
            "Page-009-010.jpg",
        ]);
        fixture.settings.concurrency = 1;
        let (events, _rx) = EventSender::channel(256);
        let cancel = CancellationToken::new();
        let recognizer = Arc::new(MockRecognizer {
            cancel_after: Some((2, cancel.clone())),
            ..Default::default()
        });
        let mut cancelled_job = OcrJob::new(
            fixture.settings.clone(),
            recognizer.clone(),
            fixture.store.clone(),
            events,
        );
        cancelled_job.cancel = cancel;

        let summary = cancelled_job.run().await.unwrap();
        assert_eq!(summary.outcome, JobOutcome::Cancelled);
        assert_eq!(summary.succeeded, 2);
        assert_eq!(summary.skipped, 3);
        assert_eq!(
            recognizer.calls(),
            vec!["Page-001-002.jpg", "Page-003-004.jpg"]
        );

        let checkpoint = fixture.store.load_any().await.unwrap();
        assert_eq!(checkpoint.total_files, 5);
        assert_eq!(
            checkpoint.processed_files.into_iter().collect::<Vec<_>>(),
            vec!["Page-001-002.jpg", "Page-003-004.jpg"]
        );

        // Resuming picks up the rest.
        let recognizer = Arc::new(MockRecognizer::default());
        let (resumed, _rx) = job(&fixture, recognizer.clone());
        let summary = resumed.run().await.unwrap();
        assert_eq!(summary.already_done, 2);
        assert_eq!(summary.succeeded, 3);
        assert_eq!(
            recognizer.calls(),
            vec!["Page-005-006.jpg", "Page-007-008.jpg", "Page-009-010.jpg"]
        );
        assert!(fixture.store.load_any().await.is_none());
    }

    #[tokio::test]
    async fn test_failures_are_reported_and_keep_the_checkpoint() {
        let fixture = fixture(&["Page-001-002.jpg", "Page-003-004.jpg", "Page-005-006.jpg"]);
        let recognizer = Arc::new(MockRecognizer {
            fail: ["Page-003-004.jpg".to_owned()].into_iter().collect(),
            ..Default::default()
        });
        let (job, mut rx) = job(&fixture, recognizer);

        let summary = job.run().await.unwrap();
        assert_eq!(summary.outcome, JobOutcome::Completed);
        assert_eq!((summary.succeeded, summary.failed), (2, 1));

        let failure = logs(&mut rx)
            .into_iter()
            .find(|l| l.is_error && l.filename == "Page-003-004.jpg")
            .unwrap();
        assert_eq!(failure.message, "Error: simulated outage");
        assert_eq!(failure.total, 3);

        let checkpoint = fixture.store.load_any().await.unwrap();
        assert!(!checkpoint.processed_files.contains("Page-003-004.jpg"));
        assert_eq!(checkpoint.processed_files.len(), 2);
        assert!(!fixture.settings.output_dir.join("Page-003-004.txt").exists());
    }

    #[tokio::test]
    async fn test_no_matching_files() {
        let fixture = fixture(&["Page-001.jpg", "cover.jpg"]);
        let recognizer = Arc::new(MockRecognizer::default());
        let (job, mut rx) = job(&fixture, recognizer.clone());

        let summary = job.run().await.unwrap();
        assert_eq!(summary.outcome, JobOutcome::NoMatchingFiles);
        assert!(recognizer.calls().is_empty());
        let error = logs(&mut rx).into_iter().find(|l| l.is_error).unwrap();
        assert_eq!(
            error.message,
            "No matching files found (dual-page: Page-NNN-NNN or Page-r-xxx-xxx format)"
        );
        assert!(fixture.store.load_any().await.is_none());
    }

    #[tokio::test]
    async fn test_progress_is_monotonic() {
        let fixture = fixture(&[
            "Page-001-002.jpg",
            "Page-003-004.jpg",
            "Page-005-006.jpg",
            "Page-007-008.jpg",
        ]);
        let (job, mut rx) = job(&fixture, Arc::new(MockRecognizer::default()));
        job.run().await.unwrap();

        let mut indices = vec![];
        while let Ok(event) = rx.try_recv() {
            if let JobEvent::Log(entry) = event {
                if !entry.filename.is_empty() {
                    indices.push(entry.index);
                }
            }
        }
        indices.sort();
        assert_eq!(indices, vec![1, 2, 3, 4]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_progress_events_arrive_in_order() {
        let names = (1..=40)
            .map(|n| format!("Page-{:03}-{:03}.jpg", 2 * n - 1, 2 * n))
            .collect::<Vec<_>>();
        let mut fixture = fixture(&names.iter().map(String::as_str).collect::<Vec<_>>());
        fixture.settings.concurrency = 8;
        let (job, mut rx) = job(&fixture, Arc::new(MockRecognizer::default()));
        job.run().await.unwrap();

        let mut seen = vec![];
        while let Ok(event) = rx.try_recv() {
            if let JobEvent::Progress(update) = event {
                seen.push(update.current);
            }
        }
        assert_eq!(seen, (1..=40).collect::<Vec<_>>());
    }
}
