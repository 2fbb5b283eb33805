//! Recorded recognition results.
//!
//! Each image `Page-001-002.jpg` is answered with the contents of
//! `Page-001-002.json` in the responses directory, which has the same shape as
//! a single Vision `AnnotateImageResponse`.

use crate::prelude::*;

use super::{RecognitionInput, TextRecognizer, response::RecognitionResult};

/// Engine which replays saved responses.
pub struct ReplayRecognizer {
    responses_dir: PathBuf,
}

impl ReplayRecognizer {
    /// Create a new `replay` engine.
    pub fn new(responses_dir: &Path) -> Result<Self> {
        if !responses_dir.is_dir() {
            bail!("Responses directory {:?} does not exist", responses_dir);
        }
        Ok(Self {
            responses_dir: responses_dir.to_owned(),
        })
    }

    fn response_path(&self, file_name: &str) -> PathBuf {
        let stem = Path::new(file_name)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(file_name);
        self.responses_dir.join(format!("{stem}.json"))
    }
}

#[async_trait]
impl TextRecognizer for ReplayRecognizer {
    #[instrument(level = "debug", skip_all, fields(file = %input.file_name))]
    async fn recognize(&self, input: RecognitionInput) -> Result<RecognitionResult> {
        let path = self.response_path(&input.file_name);
        let data = tokio::fs::read(&path)
            .await
            .with_context(|| format!("No recorded response at {:?}", path))?;
        let result = serde_json::from_slice::<RecognitionResult>(&data)
            .with_context(|| format!("Failed to parse recorded response {:?}", path))?;
        result.into_result()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(file_name: &str) -> RecognitionInput {
        RecognitionInput {
            file_name: file_name.to_owned(),
            image: vec![],
            language_hints: vec![],
        }
    }

    #[tokio::test]
    async fn test_replays_by_stem() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("Page-001.json"),
            r#"{"fullTextAnnotation": {"pages": [{"width": 10}]}}"#,
        )
        .unwrap();
        std::fs::write(
            dir.path().join("Page-002.json"),
            r#"{"error": {"code": 7, "message": "denied"}}"#,
        )
        .unwrap();

        let engine = ReplayRecognizer::new(dir.path()).unwrap();
        let result = engine.recognize(input("Page-001.jpg")).await.unwrap();
        assert_eq!(result.full_text_annotation.unwrap().pages[0].width, 10);

        let err = engine.recognize(input("Page-002.JPEG")).await.unwrap_err();
        assert_eq!(err.to_string(), "API error 7: denied");

        assert!(engine.recognize(input("Page-003.jpg")).await.is_err());
    }

    #[test]
    fn test_missing_responses_dir() {
        assert!(ReplayRecognizer::new(Path::new("/no/such/responses")).is_err());
    }
}
