//! The recognition result model.
//!
//! This mirrors the JSON of a Google Cloud Vision `AnnotateImageResponse`
//! closely enough that we can deserialize real responses directly. Vision
//! omits fields with default values (a vertex at `x = 0` has no `x`), so
//! nearly everything here is `#[serde(default)]`.

use schemars::JsonSchema;

use crate::prelude::*;

/// The recognized text for one image.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RecognitionResult {
    /// Structured text: pages, blocks, paragraphs, words and symbols. Absent
    /// when no text was found.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_text_annotation: Option<TextAnnotation>,

    /// Flat text annotations. We only use their bounding boxes, to estimate
    /// the image width when the page width is missing.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub text_annotations: Vec<EntityAnnotation>,

    /// Set if the service failed to process this image.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ServiceStatus>,
}

impl RecognitionResult {
    /// Convert a per-image service error into an `Err`.
    pub fn into_result(self) -> Result<Self> {
        match &self.error {
            Some(status) => Err(anyhow!(
                "API error {}: {}",
                status.code,
                status.message
            )),
            None => Ok(self),
        }
    }
}

/// An error reported by the recognition service for a single image.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(default)]
pub struct ServiceStatus {
    pub code: i32,
    pub message: String,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TextAnnotation {
    pub pages: Vec<Page>,
}

/// A recognized page. Vision reports one page per image.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Page {
    /// Width in pixels, or 0 if unknown.
    pub width: u32,
    /// Height in pixels, or 0 if unknown.
    pub height: u32,
    pub blocks: Vec<Block>,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Block {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bounding_box: Option<BoundingPoly>,
    pub paragraphs: Vec<Paragraph>,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Paragraph {
    pub words: Vec<Word>,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Word {
    pub symbols: Vec<Symbol>,
}

/// A single recognized character, plus whatever whitespace follows it.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Symbol {
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub property: Option<TextProperty>,
}

impl Symbol {
    /// The detected break after this symbol, if any.
    pub fn detected_break(&self) -> BreakType {
        self.property
            .as_ref()
            .and_then(|p| p.detected_break.as_ref())
            .map(|b| b.r#type)
            .unwrap_or_default()
    }
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TextProperty {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detected_break: Option<DetectedBreak>,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DetectedBreak {
    pub r#type: BreakType,
}

/// The kind of whitespace detected after a symbol.
#[derive(Clone, Copy, Debug, Default, Deserialize, JsonSchema, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakType {
    Space,
    SureSpace,
    EolSureSpace,
    Hyphen,
    LineBreak,
    /// No break, or a break type we don't know about.
    #[default]
    #[serde(other)]
    Unknown,
}

/// A flat text annotation.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EntityAnnotation {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bounding_poly: Option<BoundingPoly>,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BoundingPoly {
    pub vertices: Vec<Vertex>,
}

/// A vertex in pixel coordinates.
#[derive(Clone, Copy, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(default)]
pub struct Vertex {
    pub x: i32,
    pub y: i32,
}
