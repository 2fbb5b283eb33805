//! OCR using the Google Cloud Vision API.

use std::{env, time::Duration};

use base64::{Engine as _, prelude::BASE64_STANDARD};
use leaky_bucket::RateLimiter;

use crate::{config::JobSettings, prelude::*};

use super::{
    EngineOpts, RecognitionInput, TextRecognizer, credentials::Credentials,
    response::RecognitionResult,
};

/// The Vision API, unless `VISION_API_BASE` says otherwise.
const DEFAULT_API_BASE: &str = "https://vision.googleapis.com";

/// `images:annotate` request body.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AnnotateRequest<'a> {
    requests: Vec<AnnotateImageRequest<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AnnotateImageRequest<'a> {
    image: ImageContent,
    features: Vec<Feature>,
    #[serde(skip_serializing_if = "Option::is_none")]
    image_context: Option<ImageContext<'a>>,
}

#[derive(Debug, Serialize)]
struct ImageContent {
    content: String,
}

#[derive(Debug, Serialize)]
struct Feature {
    r#type: &'static str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ImageContext<'a> {
    language_hints: &'a [String],
}

/// `images:annotate` response body.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnnotateResponse {
    #[serde(default)]
    responses: Vec<RecognitionResult>,
}

/// Error body returned with a non-2xx status.
#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    #[serde(default)]
    message: String,
}

/// Build the request body for one image.
fn build_request<'a>(image: &[u8], language_hints: &'a [String]) -> AnnotateRequest<'a> {
    AnnotateRequest {
        requests: vec![AnnotateImageRequest {
            image: ImageContent {
                content: BASE64_STANDARD.encode(image),
            },
            features: vec![Feature {
                r#type: "DOCUMENT_TEXT_DETECTION",
            }],
            image_context: (!language_hints.is_empty())
                .then_some(ImageContext { language_hints }),
        }],
    }
}

/// OCR engine wrapping the Vision `images:annotate` endpoint.
pub struct VisionRecognizer {
    client: reqwest::Client,
    url: String,
    credentials: Credentials,
    /// Optional limit on request rate.
    rate_limiter: Option<RateLimiter>,
}

impl VisionRecognizer {
    /// Create a new `vision` engine.
    pub async fn new(opts: &EngineOpts, settings: &JobSettings) -> Result<Self> {
        let credentials = Credentials::load(settings.credentials.as_deref()).await?;
        let base = env::var("VISION_API_BASE").unwrap_or_else(|_| DEFAULT_API_BASE.to_owned());
        let url = format!("{}/v1/images:annotate", base.trim_end_matches('/'));
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(opts.timeout))
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            client,
            url,
            credentials,
            rate_limiter: opts
                .rate_limit
                .as_ref()
                .map(|r| r.to_rate_limiter(settings.effective_concurrency())),
        })
    }
}

#[async_trait]
impl TextRecognizer for VisionRecognizer {
    #[instrument(level = "debug", skip_all, fields(file = %input.file_name))]
    async fn recognize(&self, input: RecognitionInput) -> Result<RecognitionResult> {
        if let Some(rate_limiter) = &self.rate_limiter {
            rate_limiter.acquire_one().await;
        }

        let body = build_request(&input.image, &input.language_hints);
        let request = self.client.post(&self.url).json(&body);
        let response = self
            .credentials
            .authorize(&self.client, request)
            .await?
            .send()
            .await
            .context("Vision API request failed")?;

        let status = response.status();
        if !status.is_success() {
            return match response.json::<ErrorResponse>().await {
                Ok(body) => Err(anyhow!(
                    "Vision API error (status {}): {}",
                    status,
                    body.error.message
                )),
                Err(_) => Err(anyhow!("Vision API error (status {})", status)),
            };
        }

        let response = response
            .json::<AnnotateResponse>()
            .await
            .context("Failed to parse Vision API response")?;
        trace!("Vision response: {:?}", response);
        response
            .responses
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("Vision API returned no responses"))?
            .into_result()
    }
}

#[cfg(test)]
mod tests {
    use crate::config::Config;

    use super::*;

    #[test]
    fn test_request_body() {
        let hints = vec!["ja".to_owned(), "en".to_owned()];
        let body = serde_json::to_value(build_request(b"abc", &hints)).unwrap();
        assert_eq!(
            body,
            serde_json::json!({
                "requests": [{
                    "image": {"content": "YWJj"},
                    "features": [{"type": "DOCUMENT_TEXT_DETECTION"}],
                    "imageContext": {"languageHints": ["ja", "en"]}
                }]
            })
        );

        let body = serde_json::to_value(build_request(b"", &[])).unwrap();
        assert!(body["requests"][0].get("imageContext").is_none());
    }

    #[tokio::test]
    async fn test_new_reads_credentials_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vision.key");
        std::fs::write(&path, "  AIza-test\n").unwrap();
        let settings = Config {
            credentials: Some(path),
            ..Config::default()
        }
        .into_job_settings(dir.path().to_owned());
        let recognizer = VisionRecognizer::new(&EngineOpts::default(), &settings)
            .await
            .unwrap();
        assert!(matches!(
            &recognizer.credentials,
            Credentials::ApiKey(key) if key == "AIza-test"
        ));

        let settings = Config {
            credentials: Some(dir.path().join("missing")),
            ..Config::default()
        }
        .into_job_settings(dir.path().to_owned());
        assert!(VisionRecognizer::new(&EngineOpts::default(), &settings).await.is_err());
    }

    #[test]
    fn test_parse_batch_response() {
        let response: AnnotateResponse = serde_json::from_str(
            r#"{"responses": [{"fullTextAnnotation": {"pages": [{"width": 640}]}}]}"#,
        )
        .unwrap();
        assert_eq!(response.responses.len(), 1);

        let empty: AnnotateResponse = serde_json::from_str("{}").unwrap();
        assert!(empty.responses.is_empty());
    }
}
