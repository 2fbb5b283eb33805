//! Finding the images that still need work.

use std::collections::BTreeSet;

use crate::{checkpoint::Checkpoint, config::JobSettings, filename::PageName, prelude::*};

/// An image to convert.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkItem {
    /// Full path to the image.
    pub path: PathBuf,
    /// Base name of the image.
    pub file_name: String,
    /// The classified name.
    pub page: PageName,
}

/// The result of scanning the source directory.
#[derive(Debug, Default)]
pub struct Discovery {
    /// Every matching image, sorted by file name.
    pub all_matched: Vec<WorkItem>,
    /// The images that still need work, in the same order.
    pub remaining: Vec<WorkItem>,
    /// Names recorded as done, from the checkpoint or because their output
    /// exists. Checkpoint names that no longer match anything are kept.
    pub completed: BTreeSet<String>,
}

impl Discovery {
    /// How many matching images don't need any work.
    pub fn already_done(&self) -> usize {
        self.all_matched.len() - self.remaining.len()
    }
}

/// Where the output for `file_name` goes.
pub fn output_path_for(settings: &JobSettings, file_name: &str) -> PathBuf {
    let stem = Path::new(file_name)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(file_name);
    settings
        .output_dir
        .join(format!("{}.{}", stem, settings.output_format.extension()))
}

/// List matching images in `settings.source_dir`, and work out which ones
/// still need to be converted.
///
/// Images are sorted by file name as strings, not by page number. This is the
/// order we process them in.
#[instrument(level = "debug", skip_all, fields(source_dir = %settings.source_dir.display()))]
pub async fn discover(
    settings: &JobSettings,
    checkpoint: Option<&Checkpoint>,
) -> Result<Discovery> {
    let source_dir = &settings.source_dir;
    let mut entries = tokio::fs::read_dir(source_dir)
        .await
        .with_context(|| format!("Failed to read source directory {:?}", source_dir))?;

    let mut all_matched = vec![];
    while let Some(entry) = entries
        .next_entry()
        .await
        .with_context(|| format!("Failed to read source directory {:?}", source_dir))?
    {
        let file_type = entry
            .file_type()
            .await
            .with_context(|| format!("Failed to stat {:?}", entry.path()))?;
        if file_type.is_dir() {
            continue;
        }
        let Ok(file_name) = entry.file_name().into_string() else {
            trace!("Skipping non-UTF-8 file name {:?}", entry.file_name());
            continue;
        };
        if let Some(page) = PageName::classify(&file_name, settings.scan_mode) {
            trace!(file = %file_name, kind = ?page.kind(), "Matched scan");
            all_matched.push(WorkItem {
                path: entry.path(),
                file_name,
                page,
            });
        }
    }
    all_matched.sort_by(|a, b| a.file_name.cmp(&b.file_name));

    let mut completed = checkpoint
        .map(|c| c.processed_files.clone())
        .unwrap_or_default();

    let mut remaining = vec![];
    for item in &all_matched {
        if completed.contains(&item.file_name) {
            continue;
        }
        let output_path = output_path_for(settings, &item.file_name);
        if tokio::fs::try_exists(&output_path).await.unwrap_or(false) {
            debug!(file = %item.file_name, "Output already exists, skipping");
            completed.insert(item.file_name.clone());
            continue;
        }
        remaining.push(item.clone());
    }

    Ok(Discovery {
        all_matched,
        remaining,
        completed,
    })
}
