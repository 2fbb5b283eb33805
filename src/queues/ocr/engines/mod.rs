//! Text recognition engine interface.

use std::sync::Arc;

use clap::{Args, ValueEnum};

use crate::{config::JobSettings, prelude::*, rate_limit::RateLimit};

use self::response::RecognitionResult;

pub mod credentials;
pub mod replay;
pub mod response;
pub mod vision;

/// The image to recognize.
pub struct RecognitionInput {
    /// Base name of the image.
    pub file_name: String,

    /// Raw image data.
    pub image: Vec<u8>,

    /// Language hints, in priority order.
    pub language_hints: Vec<String>,
}

/// Interface to a text recognition service.
#[async_trait]
pub trait TextRecognizer: Send + Sync + 'static {
    /// Recognize the text in a single image. Service errors are returned as
    /// `Err`, and are never retried.
    async fn recognize(&self, input: RecognitionInput) -> Result<RecognitionResult>;
}

/// Which recognition engine to use.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum EngineKind {
    /// Google Cloud Vision `DOCUMENT_TEXT_DETECTION`.
    #[default]
    Vision,
    /// Recorded responses read from `--responses-dir`. For offline runs.
    Replay,
}

/// Options for choosing and configuring a recognition engine.
#[derive(Args, Clone, Debug, Default)]
pub struct EngineOpts {
    /// The recognition engine to use.
    #[clap(long, value_enum, default_value_t = EngineKind::default())]
    pub engine: EngineKind,

    /// Directory of recorded responses, named `<image stem>.json`. Required
    /// by `--engine replay`.
    #[clap(long, value_name = "DIR")]
    pub responses_dir: Option<PathBuf>,

    /// A rate limit for recognition requests, of the form "10/s" or "600/m".
    /// This is applied separately from `--concurrency`.
    #[clap(long)]
    pub rate_limit: Option<RateLimit>,

    /// A timeout, in seconds, for each recognition request.
    #[clap(long, default_value = "120")]
    pub timeout: u64,
}

/// Create the recognition engine described by `opts`.
pub async fn recognizer_for(
    opts: &EngineOpts,
    settings: &JobSettings,
) -> Result<Arc<dyn TextRecognizer>> {
    match opts.engine {
        EngineKind::Vision => Ok(Arc::new(
            vision::VisionRecognizer::new(opts, settings).await?,
        )),
        EngineKind::Replay => {
            let dir = opts
                .responses_dir
                .as_deref()
                .ok_or_else(|| anyhow!("--engine replay requires --responses-dir"))?;
            Ok(Arc::new(replay::ReplayRecognizer::new(dir)?))
        }
    }
}
