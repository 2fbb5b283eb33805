//! Splitting recognized text between output pages.
//!
//! In dual-page mode, each image is a two-page spread. We assign every text
//! block to the left or right page depending on which side of the image its
//! centre falls on.

use crate::{config::ScanMode, filename::PageName};

use super::engines::response::{Block, BreakType, RecognitionResult};

/// Separator between blocks on the same output page.
const BLOCK_SEPARATOR: &str = "\n\n";

/// Text assigned to the output pages of one image.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PagePartition {
    Single { text: String },
    Dual { left: String, right: String },
}

/// One output page, ready to hand to an emitter.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PageText {
    /// `Page 12`, or empty if the page has no label.
    pub heading: String,
    /// The body text. May be empty.
    pub text: String,
}

impl PagePartition {
    /// Split `result` according to `mode`.
    pub fn from_result(result: &RecognitionResult, mode: ScanMode) -> Self {
        match mode {
            ScanMode::Single => PagePartition::Single {
                text: single_page_text(result),
            },
            ScanMode::Dual => {
                let (left, right) = split_dual_page(result);
                PagePartition::Dual { left, right }
            }
        }
    }

    /// Pair each partition text with the heading from `name`.
    pub fn into_pages(self, name: &PageName) -> Vec<PageText> {
        let texts = match self {
            PagePartition::Single { text } => vec![text],
            PagePartition::Dual { left, right } => vec![left, right],
        };
        let labels = name.labels();
        texts
            .into_iter()
            .enumerate()
            .map(|(idx, text)| PageText {
                heading: labels.get(idx).map(|l| l.heading()).unwrap_or_default(),
                text,
            })
            .collect()
    }
}

/// Every non-empty block on every page, in document order.
fn single_page_text(result: &RecognitionResult) -> String {
    let Some(annotation) = &result.full_text_annotation else {
        return String::new();
    };
    annotation
        .pages
        .iter()
        .flat_map(|page| &page.blocks)
        .map(block_text)
        .filter(|text| !text.is_empty())
        .collect::<Vec<_>>()
        .join(BLOCK_SEPARATOR)
}

/// Split blocks into `(left, right)` by their horizontal centre.
fn split_dual_page(result: &RecognitionResult) -> (String, String) {
    let Some(annotation) = &result.full_text_annotation else {
        return (String::new(), String::new());
    };

    let midpoint = image_width(result) / 2.0;
    let mut left = vec![];
    let mut right = vec![];
    for block in annotation.pages.iter().flat_map(|page| &page.blocks) {
        let text = block_text(block);
        if text.is_empty() {
            continue;
        }
        // A block exactly on the midpoint goes right.
        if block_center_x(block) < midpoint {
            left.push(text);
        } else {
            right.push(text);
        }
    }
    (left.join(BLOCK_SEPARATOR), right.join(BLOCK_SEPARATOR))
}

/// The image width in pixels: the first page width the service reported, or
/// failing that, the rightmost vertex of any flat text annotation.
fn image_width(result: &RecognitionResult) -> f32 {
    let reported = result
        .full_text_annotation
        .iter()
        .flat_map(|a| &a.pages)
        .map(|page| page.width)
        .find(|&width| width > 0);
    if let Some(width) = reported {
        return width as f32;
    }
    result
        .text_annotations
        .iter()
        .filter_map(|ann| ann.bounding_poly.as_ref())
        .flat_map(|poly| &poly.vertices)
        .map(|v| v.x as f32)
        .fold(0.0, f32::max)
}

/// The mean X coordinate of a block's bounding polygon, or 0 without one.
fn block_center_x(block: &Block) -> f32 {
    match &block.bounding_box {
        Some(poly) if !poly.vertices.is_empty() => {
            let sum: f32 = poly.vertices.iter().map(|v| v.x as f32).sum();
            sum / poly.vertices.len() as f32
        }
        _ => 0.0,
    }
}

/// Rebuild a block's text from its symbols and their detected breaks.
pub fn block_text(block: &Block) -> String {
    let paragraphs = block
        .paragraphs
        .iter()
        .map(|para| {
            let mut out = String::new();
            for symbol in para.words.iter().flat_map(|w| &w.symbols) {
                out.push_str(&symbol.text);
                match symbol.detected_break() {
                    BreakType::Space | BreakType::SureSpace => out.push(' '),
                    BreakType::EolSureSpace | BreakType::Hyphen | BreakType::LineBreak => {
                        out.push('\n')
                    }
                    BreakType::Unknown => {}
                }
            }
            out
        })
        .collect::<Vec<_>>();
    paragraphs.join("\n").trim().to_owned()
}
