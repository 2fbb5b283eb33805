//! Plain text output, for scripts that the PDF fonts can't show.

use crate::{
    async_utils::io::write_file_atomic_blocking, prelude::*,
    queues::ocr::partition::PageText,
};

use super::PageEmitter;

/// Separates pages, both within one file and in a merged file.
const PAGE_SEPARATOR: &str = "\n\u{c}\n";

/// Writes one UTF-8 text file per image.
#[derive(Debug, Default)]
pub struct TextEmitter;

/// Render `pages` as text.
fn render(pages: &[PageText]) -> String {
    pages
        .iter()
        .map(|page| {
            if page.heading.is_empty() {
                format!("{}\n", page.text)
            } else {
                format!("{}\n\n{}\n", page.heading, page.text)
            }
        })
        .collect::<Vec<_>>()
        .join(PAGE_SEPARATOR)
}

impl PageEmitter for TextEmitter {
    fn emit(&self, output_path: &Path, pages: &[PageText]) -> Result<()> {
        write_file_atomic_blocking(output_path, render(pages).as_bytes())
    }

    fn merge(&self, inputs: &[PathBuf], merged_path: &Path) -> Result<()> {
        let mut parts = Vec::with_capacity(inputs.len());
        for input in inputs {
            let text = std::fs::read_to_string(input)
                .with_context(|| format!("Failed to read {:?}", input))?;
            parts.push(text);
        }
        write_file_atomic_blocking(merged_path, parts.join(PAGE_SEPARATOR).as_bytes())
    }
}
