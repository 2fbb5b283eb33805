//! The `ocr` and `resume` subcommands.

use clap::Args;
use indicatif::ProgressBar;
use tokio::sync::mpsc;

use crate::{
    checkpoint::CheckpointStore,
    config::{Config, JobSettings, ScanMode},
    events::{EVENT_CHANNEL_CAPACITY, EventSender, JobEvent, LogEntry, ProgressUpdate},
    output::OutputFormat,
    prelude::*,
    queues::ocr::{
        JobOutcome, JobSummary, OcrJob,
        engines::{EngineOpts, recognizer_for},
    },
    ui::{ProgressConfig, Ui},
};

use super::SessionOpts;

/// OCR command line arguments.
#[derive(Debug, Args)]
pub struct OcrOpts {
    /// Directory containing the scanned `Page-*.jpg` images.
    pub source_dir: PathBuf,

    /// Config file with defaults for the options below. Defaults to
    /// `book-ocr.toml` in the current directory, if present.
    #[clap(long)]
    pub config: Option<PathBuf>,

    /// Output directory. Defaults to `output/<source dir name>`.
    #[clap(short = 'o', long)]
    pub output_dir: Option<PathBuf>,

    /// Vision API credentials: a service account JSON key, or a file
    /// containing an API key.
    #[clap(long)]
    pub credentials: Option<PathBuf>,

    /// Language hint, in priority order. May be repeated.
    #[clap(short = 'l', long = "language", value_name = "LANG")]
    pub languages: Vec<String>,

    /// Number of images to recognize at a time (1-10).
    #[clap(short = 'j', long)]
    pub concurrency: Option<usize>,

    /// How the pages were scanned.
    #[clap(long, value_enum)]
    pub scan_mode: Option<ScanMode>,

    /// Output document format.
    #[clap(long = "format", value_enum)]
    pub output_format: Option<OutputFormat>,

    /// Merge all outputs into one document when finished.
    #[clap(long, overrides_with = "no_merge")]
    pub merge: bool,

    /// Don't merge outputs when finished.
    #[clap(long)]
    pub no_merge: bool,

    /// Name of the merged document, inside the output directory.
    #[clap(long)]
    pub merge_name: Option<String>,

    /// TrueType font for PDF output. Defaults to the first font found in
    /// `fonts/` next to the executable or in the current directory.
    #[clap(long)]
    pub font: Option<PathBuf>,

    #[clap(flatten)]
    pub session: SessionOpts,

    #[clap(flatten)]
    pub engine: EngineOpts,
}

impl OcrOpts {
    /// Combine the config file with our command-line overrides.
    async fn job_settings(&self) -> Result<JobSettings> {
        let source_dir = tokio::fs::canonicalize(&self.source_dir)
            .await
            .with_context(|| format!("Cannot open source directory {:?}", self.source_dir))?;
        let metadata = tokio::fs::metadata(&source_dir)
            .await
            .with_context(|| format!("Cannot open source directory {:?}", source_dir))?;
        if !metadata.is_dir() {
            bail!("Source {:?} is not a directory", source_dir);
        }

        let mut config = Config::load(self.config.as_deref()).await?;
        if let Some(output_dir) = &self.output_dir {
            config.output_dir = Some(output_dir.clone());
        }
        if let Some(credentials) = &self.credentials {
            config.credentials = Some(credentials.clone());
        }
        if !self.languages.is_empty() {
            config.languages = self.languages.clone();
        }
        if let Some(concurrency) = self.concurrency {
            config.concurrency = concurrency;
        }
        if let Some(scan_mode) = self.scan_mode {
            config.scan_mode = scan_mode;
        }
        if let Some(output_format) = self.output_format {
            config.output_format = output_format;
        }
        if self.no_merge {
            config.merge = false;
        } else if self.merge {
            config.merge = true;
        }
        if let Some(merge_name) = &self.merge_name {
            config.merge_name = Some(merge_name.clone());
        }
        if let Some(font) = &self.font {
            config.font = Some(font.clone());
        }
        Ok(config.into_job_settings(source_dir))
    }
}

/// The `ocr` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_ocr(ui: Ui, opts: &OcrOpts) -> Result<()> {
    let settings = opts.job_settings().await?;
    debug!("Job settings: {:?}", settings);
    run_job(&ui, settings, &opts.engine, opts.session.store()).await
}

/// Resume command line arguments.
#[derive(Debug, Args)]
pub struct ResumeOpts {
    #[clap(flatten)]
    pub session: SessionOpts,

    #[clap(flatten)]
    pub engine: EngineOpts,
}

/// The `resume` subcommand. Reruns the saved job with its original settings.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_resume(ui: Ui, opts: &ResumeOpts) -> Result<()> {
    let store = opts.session.store();
    let checkpoint = store
        .load_any()
        .await
        .ok_or_else(|| anyhow!("No session to resume in {:?}", store.path()))?;
    ui.display_message(
        "▶️",
        &format!(
            "Resuming {}: {} of {} files already processed",
            checkpoint.settings.source_dir.display(),
            checkpoint.processed_files.len(),
            checkpoint.total_files,
        ),
    );
    run_job(&ui, checkpoint.settings, &opts.engine, store).await
}

/// Run a job, showing its events on the terminal and stopping it on Ctrl-C.
async fn run_job(
    ui: &Ui,
    settings: JobSettings,
    engine_opts: &EngineOpts,
    store: CheckpointStore,
) -> Result<()> {
    let recognizer = recognizer_for(engine_opts, &settings).await?;
    let (events, rx) = EventSender::channel(EVENT_CHANNEL_CAPACITY);
    let job = OcrJob::new(settings, recognizer, store, events);

    let consumer = tokio::spawn(show_events(ui.clone(), rx));

    let cancel = job.cancellation_token();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, finishing images in progress");
            cancel.cancel();
        }
    });

    let result = job.run().await;
    ctrl_c.abort();

    // Dropping the job closes the event channel, which ends the consumer.
    drop(job);
    consumer.await.context("event consumer panicked")?;

    report(ui, &result?)
}

/// Show job events as log lines and a progress bar.
async fn show_events(ui: Ui, mut rx: mpsc::Receiver<JobEvent>) {
    let mut pb: Option<ProgressBar> = None;
    while let Some(event) = rx.recv().await {
        match event {
            JobEvent::Log(entry) => log_entry(&entry),
            JobEvent::Progress(update) => {
                let pb = pb.get_or_insert_with(|| {
                    ui.new_progress_bar(
                        &ProgressConfig {
                            emoji: "📖",
                            msg: "OCRing images",
                            done_msg: "OCRed images",
                        },
                        update.total as u64,
                    )
                });
                show_progress(pb, &update);
            }
        }
    }
}

/// Move `pb` forward to `update`. Never moves backward.
fn show_progress(pb: &ProgressBar, update: &ProgressUpdate) {
    pb.set_length(update.total as u64);
    pb.set_position(pb.position().max(update.current as u64));
}

/// Send a [`LogEntry`] to our tracing output.
fn log_entry(entry: &LogEntry) {
    match (entry.filename.is_empty(), entry.is_error) {
        (true, false) => info!("{}", entry.message),
        (true, true) => error!("{}", entry.message),
        (false, false) => info!(
            filename = %entry.filename,
            index = entry.index,
            total = entry.total,
            "{}",
            entry.message
        ),
        (false, true) => error!(
            filename = %entry.filename,
            index = entry.index,
            total = entry.total,
            "{}",
            entry.message
        ),
    }
}

/// Summarize a finished job, and decide our exit status.
fn report(ui: &Ui, summary: &JobSummary) -> Result<()> {
    match summary.outcome {
        JobOutcome::NoMatchingFiles => bail!("No matching files found"),
        JobOutcome::Cancelled => {
            ui.display_message(
                "⏸️",
                &format!(
                    "Stopped with {} files left. Run `book-ocr resume` to continue.",
                    summary.skipped + summary.failed
                ),
            );
            Ok(())
        }
        JobOutcome::Completed => {
            ui.display_message(
                "📚",
                &format!(
                    "{} converted, {} failed, {} already done ({} total)",
                    summary.succeeded, summary.failed, summary.already_done, summary.total
                ),
            );
            if summary.failed > 0 {
                bail!(
                    "{} of {} files failed. Run `book-ocr resume` to retry them.",
                    summary.failed,
                    summary.total
                );
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[derive(Debug, Parser)]
    struct TestOpts {
        #[clap(flatten)]
        ocr: OcrOpts,
    }

    #[tokio::test]
    async fn test_cli_overrides_config() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("book-ocr.toml");
        std::fs::write(
            &config_path,
            "languages = [\"ja\"]\nconcurrency = 4\nmerge = true\nscan_mode = \"single\"\n",
        )
        .unwrap();
        let source = dir.path().join("book");
        std::fs::create_dir(&source).unwrap();

        let opts = TestOpts::parse_from([
            "test",
            source.to_str().unwrap(),
            "--config",
            config_path.to_str().unwrap(),
            "-j",
            "20",
            "--no-merge",
            "--format",
            "text",
            "--font",
            "fonts/NotoSansJP-Regular.ttf",
        ]);
        let settings = opts.ocr.job_settings().await.unwrap();
        assert_eq!(settings.languages, vec!["ja"]);
        assert_eq!(settings.concurrency, 10);
        assert!(!settings.merge);
        assert_eq!(settings.scan_mode, ScanMode::Single);
        assert_eq!(settings.output_format, OutputFormat::Text);
        assert_eq!(settings.merge_name, "Merge.txt");
        assert!(settings.source_dir.is_absolute());
        assert_eq!(settings.output_dir, PathBuf::from("output/book"));
        assert_eq!(
            settings.font,
            Some(PathBuf::from("fonts/NotoSansJP-Regular.ttf"))
        );
    }

    #[tokio::test]
    async fn test_missing_source_dir() {
        let opts = TestOpts::parse_from(["test", "/no/such/book"]);
        assert!(opts.ocr.job_settings().await.is_err());
    }

    #[test]
    fn test_report_exit_status() {
        let ui = Ui::init_for_tests();
        let mut summary = JobSummary {
            outcome: JobOutcome::Completed,
            total: 4,
            already_done: 1,
            succeeded: 3,
            failed: 0,
            skipped: 0,
        };
        assert!(report(&ui, &summary).is_ok());

        summary.failed = 1;
        assert!(report(&ui, &summary).is_err());

        summary.outcome = JobOutcome::Cancelled;
        assert!(report(&ui, &summary).is_ok());

        summary.outcome = JobOutcome::NoMatchingFiles;
        assert!(report(&ui, &summary).is_err());
    }

    #[test]
    fn test_progress_never_moves_backward() {
        let ui = Ui::init_for_tests();
        let pb = ui.new_progress_bar(
            &ProgressConfig {
                emoji: "📖",
                msg: "OCRing images",
                done_msg: "OCRed images",
            },
            10,
        );
        for current in [2, 5, 4, 6, 3] {
            show_progress(&pb, &ProgressUpdate::new(current, 10));
        }
        assert_eq!(pb.position(), 6);
        assert_eq!(pb.length(), Some(10));
    }
}
