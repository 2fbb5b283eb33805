//! Job settings and the optional config file that supplies their defaults.

use std::fmt;

use clap::ValueEnum;
use schemars::JsonSchema;

use crate::{async_utils::io::read_json_or_toml, output::OutputFormat, prelude::*};

/// Upper bound on concurrent recognition requests, whatever the user asks for.
pub const MAX_CONCURRENCY: usize = 10;

/// Concurrency used when nothing else is configured.
pub const DEFAULT_CONCURRENCY: usize = 5;

/// Config file we pick up from the current directory if `--config` is absent.
pub const DEFAULT_CONFIG_FILE: &str = "book-ocr.toml";

/// Clamp a requested concurrency into `1..=MAX_CONCURRENCY`.
pub fn clamp_concurrency(requested: usize) -> usize {
    requested.clamp(1, MAX_CONCURRENCY)
}

/// How the pages were scanned.
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
pub enum ScanMode {
    /// Each image holds two facing pages, `Page-NNN-NNN.jpg`.
    #[default]
    Dual,
    /// Each image holds one page, `Page-NNN.jpg`.
    Single,
}

impl fmt::Display for ScanMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanMode::Dual => write!(f, "dual-page"),
            ScanMode::Single => write!(f, "single-page"),
        }
    }
}

/// Everything needed to run one OCR job. Fixed for the lifetime of a run.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct JobSettings {
    /// Directory containing the scanned `Page-*.jpg` images.
    pub source_dir: PathBuf,

    /// Directory where one output document per image is written.
    pub output_dir: PathBuf,

    /// Recognition service credentials: an API key file, or a service
    /// account JSON key.
    #[serde(default)]
    pub credentials: Option<PathBuf>,

    /// Language hints passed to the recognition service, in priority order.
    #[serde(default)]
    pub languages: Vec<String>,

    /// Requested number of concurrent recognition requests.
    pub concurrency: usize,

    /// Merge all outputs into a single document when the run finishes.
    pub merge: bool,

    /// File name of the merged document, relative to `output_dir`.
    pub merge_name: String,

    /// Dual-page or single-page scans.
    pub scan_mode: ScanMode,

    /// Output document format.
    #[serde(default)]
    pub output_format: OutputFormat,

    /// TrueType font to embed in PDF output. If unset, we look in `fonts`
    /// directories, then fall back to Helvetica.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub font: Option<PathBuf>,
}

impl JobSettings {
    /// The concurrency we will actually use.
    pub fn effective_concurrency(&self) -> usize {
        clamp_concurrency(self.concurrency)
    }

    /// Full path of the merged output document.
    pub fn merged_path(&self) -> PathBuf {
        let name = if self.merge_name.trim().is_empty() {
            self.output_format.default_merge_name()
        } else {
            self.merge_name.clone()
        };
        self.output_dir.join(name)
    }
}

/// Defaults read from a TOML or JSON config file. Every field is optional.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(default, rename_all = "snake_case", deny_unknown_fields)]
pub struct Config {
    /// API key file or service account JSON key.
    pub credentials: Option<PathBuf>,

    /// Language hints, in priority order.
    pub languages: Vec<String>,

    /// Number of concurrent recognition requests (clamped to 1-10).
    pub concurrency: usize,

    /// Output directory. Defaults to `output/<source dir name>`.
    pub output_dir: Option<PathBuf>,

    /// Merge outputs when finished.
    pub merge: bool,

    /// Name of the merged document. Defaults to `Merge.pdf`, or `Merge.txt`
    /// for text output.
    pub merge_name: Option<String>,

    /// Dual-page or single-page scans.
    pub scan_mode: ScanMode,

    /// Output document format.
    pub output_format: OutputFormat,

    /// TrueType font to embed in PDF output.
    pub font: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            credentials: None,
            languages: vec!["en".to_owned()],
            concurrency: DEFAULT_CONCURRENCY,
            output_dir: None,
            merge: true,
            merge_name: None,
            scan_mode: ScanMode::Dual,
            output_format: OutputFormat::Pdf,
            font: None,
        }
    }
}

impl Config {
    /// Load our config from `path`, or from [`DEFAULT_CONFIG_FILE`] if it
    /// exists, or fall back to built-in defaults.
    pub async fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => read_json_or_toml(path).await,
            None => {
                let default_path = Path::new(DEFAULT_CONFIG_FILE);
                if tokio::fs::metadata(default_path).await.is_ok() {
                    debug!(path = %default_path.display(), "Using config file");
                    read_json_or_toml(default_path).await
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    /// Settings for a job reading `source_dir`, which should already be
    /// canonicalized.
    pub fn into_job_settings(self, source_dir: PathBuf) -> JobSettings {
        let output_dir = self
            .output_dir
            .unwrap_or_else(|| Self::default_output_dir(&source_dir));
        let merge_name = self
            .merge_name
            .unwrap_or_else(|| self.output_format.default_merge_name());
        JobSettings {
            source_dir,
            output_dir,
            credentials: self.credentials,
            languages: self.languages,
            concurrency: clamp_concurrency(self.concurrency),
            merge: self.merge,
            merge_name,
            scan_mode: self.scan_mode,
            output_format: self.output_format,
            font: self.font,
        }
    }

    /// Default output directory for `source_dir`.
    pub fn default_output_dir(source_dir: &Path) -> PathBuf {
        let name = source_dir
            .file_name()
            .map(|n| n.to_owned())
            .unwrap_or_else(|| "pages".into());
        PathBuf::from("output").join(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamp_concurrency() {
        assert_eq!(clamp_concurrency(0), 1);
        assert_eq!(clamp_concurrency(1), 1);
        assert_eq!(clamp_concurrency(7), 7);
        assert_eq!(clamp_concurrency(10), 10);
        assert_eq!(clamp_concurrency(250), 10);
    }

    #[test]
    fn test_partial_toml_config_keeps_defaults() {
        let config: Config = toml::from_str(
            r#"
            languages = ["ja", "en"]
            scan_mode = "single"
            "#,
        )
        .unwrap();
        assert_eq!(config.languages, vec!["ja", "en"]);
        assert_eq!(config.scan_mode, ScanMode::Single);
        assert_eq!(config.concurrency, DEFAULT_CONCURRENCY);
        assert!(config.merge);
        assert_eq!(config.merge_name, None);
    }

    #[test]
    fn test_into_job_settings_fills_defaults() {
        let settings = Config::default().into_job_settings(PathBuf::from("/scans/book"));
        assert_eq!(settings.output_dir, PathBuf::from("output/book"));
        assert_eq!(settings.merge_name, "Merge.pdf");
        assert_eq!(settings.languages, vec!["en"]);
        assert_eq!(settings.concurrency, DEFAULT_CONCURRENCY);
        assert_eq!(settings.scan_mode, ScanMode::Dual);

        let config = Config {
            concurrency: 64,
            output_format: OutputFormat::Text,
            output_dir: Some(PathBuf::from("/elsewhere")),
            ..Config::default()
        };
        let settings = config.into_job_settings(PathBuf::from("/scans/book"));
        assert_eq!(settings.concurrency, MAX_CONCURRENCY);
        assert_eq!(settings.merge_name, "Merge.txt");
        assert_eq!(settings.output_dir, PathBuf::from("/elsewhere"));
    }

    #[test]
    fn test_unknown_config_keys_are_rejected() {
        assert!(toml::from_str::<Config>("colour = \"dark\"").is_err());
    }

    #[test]
    fn test_merged_path_defaults_by_format() {
        let mut settings = JobSettings {
            source_dir: PathBuf::from("/scans/book"),
            output_dir: PathBuf::from("/out"),
            credentials: None,
            languages: vec![],
            concurrency: 3,
            merge: true,
            merge_name: " ".to_owned(),
            scan_mode: ScanMode::Dual,
            output_format: OutputFormat::Text,
            font: None,
        };
        assert_eq!(settings.merged_path(), PathBuf::from("/out/Merge.txt"));
        settings.merge_name = "Book.pdf".to_owned();
        assert_eq!(settings.merged_path(), PathBuf::from("/out/Book.pdf"));
    }

    #[test]
    fn test_default_output_dir() {
        assert_eq!(
            Config::default_output_dir(Path::new("/scans/my-book")),
            PathBuf::from("output/my-book")
        );
    }
}
