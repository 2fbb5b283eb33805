//! Output documents: one per scanned image, plus an optional merged document.

use std::sync::Arc;

use clap::ValueEnum;
use schemars::JsonSchema;

use crate::{
    async_utils::spawn_blocking_propagating_panics, config::JobSettings, events::EventSender,
    prelude::*, queues::ocr::partition::PageText,
};

pub mod font;
pub mod pdf;
pub mod text;

/// Prefix shared by every per-image output file.
pub const OUTPUT_PREFIX: &str = "Page-";

/// What kind of document we write.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Deserialize,
    Eq,
    JsonSchema,
    PartialEq,
    Serialize,
    ValueEnum,
)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    /// A4 PDF pages with a page-number heading. Latin text only, unless a
    /// TrueType font is available.
    #[default]
    Pdf,
    /// Plain UTF-8 text, pages separated by form feeds.
    Text,
}

impl OutputFormat {
    /// File extension, without the dot.
    pub fn extension(self) -> &'static str {
        match self {
            OutputFormat::Pdf => "pdf",
            OutputFormat::Text => "txt",
        }
    }

    /// Name of the merged document when none is configured.
    pub fn default_merge_name(self) -> String {
        format!("Merge.{}", self.extension())
    }

    /// Create an emitter for this format, using Helvetica for PDF. Fine for
    /// merging, which copies pages without touching their fonts.
    pub fn emitter(self) -> Arc<dyn PageEmitter> {
        match self {
            OutputFormat::Pdf => Arc::new(pdf::PdfEmitter::default()),
            OutputFormat::Text => Arc::new(text::TextEmitter),
        }
    }
}

/// Create the emitter for a job. For PDF output, this loads the job's font,
/// or the first one found in a `fonts` directory, and announces it.
pub async fn emitter_for(
    settings: &JobSettings,
    events: &EventSender,
) -> Result<Arc<dyn PageEmitter>> {
    match settings.output_format {
        OutputFormat::Text => Ok(Arc::new(text::TextEmitter)),
        OutputFormat::Pdf => {
            let font =
                font::resolve_font(settings.font.as_deref(), &font::default_font_dirs()).await?;
            if let Some(font) = &font {
                events.info(format!("Using font: {}", font.path().display()));
            }
            Ok(Arc::new(pdf::PdfEmitter::with_font(font)))
        }
    }
}

/// Turns page text into an output document, and merges documents.
///
/// Both operations are blocking and may be CPU-heavy, so call them through
/// [`emit_pages`] and [`merge_outputs`], which move the work off the async
/// executor. Implementations must write atomically, so that an output file
/// either exists in full or not at all.
pub trait PageEmitter: Send + Sync + 'static {
    /// Write `pages` to `output_path`, replacing any existing file.
    fn emit(&self, output_path: &Path, pages: &[PageText]) -> Result<()>;

    /// Concatenate `inputs`, in order, into `merged_path`.
    fn merge(&self, inputs: &[PathBuf], merged_path: &Path) -> Result<()>;
}

/// Run [`PageEmitter::emit`] on a blocking worker thread.
pub async fn emit_pages(
    emitter: Arc<dyn PageEmitter>,
    output_path: PathBuf,
    pages: Vec<PageText>,
) -> Result<()> {
    spawn_blocking_propagating_panics(move || emitter.emit(&output_path, &pages)).await
}

/// Every per-image output in `output_dir` for `format`, sorted by name.
pub async fn list_outputs(
    output_dir: &Path,
    format: OutputFormat,
    exclude: &Path,
) -> Result<Vec<PathBuf>> {
    let mut entries = tokio::fs::read_dir(output_dir)
        .await
        .with_context(|| format!("Failed to read output directory {:?}", output_dir))?;
    let suffix = format!(".{}", format.extension());
    let mut outputs = vec![];
    while let Some(entry) = entries
        .next_entry()
        .await
        .with_context(|| format!("Failed to read output directory {:?}", output_dir))?
    {
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if name.starts_with(OUTPUT_PREFIX) && name.ends_with(&suffix) && path != exclude {
            outputs.push(path);
        }
    }
    outputs.sort();
    Ok(outputs)
}

/// Merge every per-image output into `merged_path`. Any existing file at
/// `merged_path` is removed first. Returns how many documents were merged,
/// which is 0 if there was nothing to merge.
#[instrument(level = "debug", skip(emitter))]
pub async fn merge_outputs(
    emitter: Arc<dyn PageEmitter>,
    output_dir: &Path,
    format: OutputFormat,
    merged_path: &Path,
) -> Result<usize> {
    let inputs = list_outputs(output_dir, format, merged_path).await?;
    if inputs.is_empty() {
        return Ok(0);
    }

    match tokio::fs::remove_file(merged_path).await {
        Ok(()) => debug!(path = %merged_path.display(), "Removed old merged file"),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => {
            return Err(err)
                .with_context(|| format!("Failed to remove {:?}", merged_path));
        }
    }

    let count = inputs.len();
    let merged = merged_path.to_owned();
    spawn_blocking_propagating_panics(move || emitter.merge(&inputs, &merged)).await?;
    Ok(count)
}

/// Run [`merge_outputs`], reporting the outcome as events. Merge problems
/// never fail a job, so this only returns whether the merge worked.
pub async fn merge_and_report(
    emitter: Arc<dyn PageEmitter>,
    output_dir: &Path,
    format: OutputFormat,
    merged_path: &Path,
    events: &EventSender,
) -> bool {
    let ext = format.extension();
    events.info(format!("Merging all {} files...", ext));
    match merge_outputs(emitter, output_dir, format, merged_path).await {
        Ok(0) => {
            events.error(format!("No {} files to merge", ext));
            false
        }
        Ok(count) => {
            events.info(format!(
                "Merge complete! {} {} files merged into: {}",
                count,
                ext,
                merged_path.display()
            ));
            true
        }
        Err(err) => {
            events.error(format!("Merge failed: {:#}", err));
            false
        }
    }
}
