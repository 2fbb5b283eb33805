//! The `schema` subcommand.

use clap::{Args, ValueEnum};
use schemars::schema_for;
use tokio::io::AsyncWriteExt as _;

use crate::{
    async_utils::io::create_writer,
    checkpoint::Checkpoint,
    config::Config,
    events::{LogEntry, ProgressUpdate},
    prelude::*,
    queues::ocr::engines::response::RecognitionResult,
};

/// The different schema types we support.
///
/// We parse these as PascalCase, because they represent type names.
#[derive(Debug, Clone, Copy, ValueEnum)]
#[clap(rename_all = "PascalCase")]
pub enum SchemaType {
    /// Session checkpoint file.
    Checkpoint,
    /// Config file.
    Config,
    /// Log event sent by a running job.
    LogEntry,
    /// Progress event sent by a running job.
    ProgressUpdate,
    /// A single recognition response, as read by `--engine replay`.
    RecognitionResult,
}

/// Schema command line arguments.
#[derive(Debug, Args)]
pub struct SchemaOpts {
    /// The schema type to generate.
    #[clap(value_enum, value_name = "TYPE")]
    pub schema_type: SchemaType,

    /// The output path to write the schema to.
    #[clap(short = 'o', long = "out")]
    pub output_path: Option<PathBuf>,
}

/// The `schema` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_schema(schema_opts: &SchemaOpts) -> Result<()> {
    // Get our schema.
    let schema = match schema_opts.schema_type {
        SchemaType::Checkpoint => schema_for!(Checkpoint),
        SchemaType::Config => schema_for!(Config),
        SchemaType::LogEntry => schema_for!(LogEntry),
        SchemaType::ProgressUpdate => schema_for!(ProgressUpdate),
        SchemaType::RecognitionResult => schema_for!(RecognitionResult),
    };

    // Write out our schema.
    let mut wtr = create_writer(schema_opts.output_path.as_deref()).await?;
    let schema_str =
        serde_json::to_string_pretty(&schema).context("failed to serialize schema")?;
    wtr.write_all(schema_str.as_bytes())
        .await
        .context("failed to write schema")?;
    wtr.flush().await.context("failed to flush schema")?;
    Ok(())
}
