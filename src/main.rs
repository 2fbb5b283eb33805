use std::str::FromStr;

use clap::{Parser, Subcommand};
use tracing_subscriber::{
    EnvFilter, Layer as _, filter::Directive, fmt::format::FmtSpan, layer::SubscriberExt,
    util::SubscriberInitExt as _,
};

use self::{prelude::*, ui::Ui};

mod async_utils;
mod checkpoint;
mod cmd;
mod config;
mod events;
mod filename;
mod output;
mod prelude;
mod queues;
mod rate_limit;
mod roman;
mod ui;

/// OCR scanned books into searchable documents, one image at a time, with
/// resumable sessions.
#[derive(Debug, Parser)]
#[clap(
    version,
    author,
    after_help = r#"
Environment Variables:
  - GOOGLE_VISION_API_KEY: The Vision API key, if no `--credentials` file
    is given.
  - GOOGLE_APPLICATION_CREDENTIALS: A service account JSON key, used if
    neither `--credentials` nor GOOGLE_VISION_API_KEY is given.
  - VISION_API_BASE (optional): Override the Vision API server URL.

  These variables may be set in a standard `.env` file.

Fonts:
  PDF output uses Helvetica, which only covers Latin-1. For other scripts,
  pass `--font`, or put a TrueType font in a `fonts/` directory next to the
  executable or in the current directory.
"#
)]
struct Opts {
    #[clap(subcommand)]
    subcmd: Cmd,
}

/// The subcommands we support.
#[derive(Debug, Subcommand)]
enum Cmd {
    /// OCR a directory of `Page-*.jpg` scans.
    Ocr(cmd::ocr::OcrOpts),
    /// Continue the job saved in the session file.
    Resume(cmd::ocr::ResumeOpts),
    /// Inspect or clear the saved session.
    Session(cmd::session::SessionCmdOpts),
    /// Merge existing per-image outputs into one document.
    Merge(cmd::merge::MergeOpts),
    /// Print schemas for config, session and event formats.
    Schema(cmd::schema::SchemaOpts),
}

impl Cmd {
    /// Are we using stdout for output?
    fn using_stdout_for_output(&self) -> bool {
        match self {
            Cmd::Ocr(_) | Cmd::Resume(_) | Cmd::Merge(_) => false,
            Cmd::Session(opts) => {
                matches!(opts.action, cmd::session::SessionAction::Show)
            }
            Cmd::Schema(opts) => opts.output_path.is_none(),
        }
    }
}

/// Our entry point, which can return an error. [`anyhow::Result`] will
/// automatically print a nice error message with optional backtrace.
#[tokio::main]
async fn main() -> Result<()> {
    let ui = Ui::init();

    // Initialize tracing.
    let directive =
        Directive::from_str("info").expect("built-in directive should be valid");
    let env_filter = EnvFilter::builder()
        .with_default_directive(directive)
        .from_env_lossy();

    let subscriber = tracing_subscriber::fmt::layer()
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
        .with_writer(ui.get_stderr_writer())
        .with_filter(env_filter);

    // We can stack multiple layers here if we need to.
    tracing_subscriber::registry().with(subscriber).init();

    // Call our real `main` function now that logging is set up.
    real_main(ui).await
}

/// Our real entry point.
#[instrument(level = "debug", name = "main", skip_all)]
async fn real_main(ui: Ui) -> Result<()> {
    // Load environment variables from a `.env` file, if it exists.
    dotenvy::dotenv().ok();

    // Parse command-line arguments.
    let opts = Opts::parse();
    debug!("Parsed options: {:?}", opts);

    // Hide the progress bar if we're using stdout for output.
    if opts.subcmd.using_stdout_for_output() {
        ui.hide_progress_bars();
    }

    // Run the appropriate subcommand.
    match &opts.subcmd {
        Cmd::Ocr(opts) => {
            cmd::ocr::cmd_ocr(ui, opts).await?;
        }
        Cmd::Resume(opts) => {
            cmd::ocr::cmd_resume(ui, opts).await?;
        }
        Cmd::Session(opts) => {
            cmd::session::cmd_session(ui, opts).await?;
        }
        Cmd::Merge(opts) => {
            cmd::merge::cmd_merge(ui, opts).await?;
        }
        Cmd::Schema(schema_opts) => {
            cmd::schema::cmd_schema(schema_opts).await?;
        }
    }
    Ok(())
}
