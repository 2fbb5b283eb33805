//! The `merge` subcommand.

use clap::Args;

use crate::{
    output::{OutputFormat, merge_outputs},
    prelude::*,
    ui::Ui,
};

/// Merge command line arguments.
#[derive(Debug, Args)]
pub struct MergeOpts {
    /// Output directory containing the per-image documents.
    pub output_dir: PathBuf,

    /// Format of the documents to merge.
    #[clap(long = "format", value_enum, default_value_t = OutputFormat::default())]
    pub output_format: OutputFormat,

    /// Name of the merged document, inside the output directory.
    #[clap(long)]
    pub merge_name: Option<String>,
}

/// The `merge` subcommand. Rebuilds the merged document from whatever
/// per-image outputs already exist.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_merge(ui: Ui, opts: &MergeOpts) -> Result<()> {
    let format = opts.output_format;
    let name = opts
        .merge_name
        .clone()
        .unwrap_or_else(|| format.default_merge_name());
    let merged_path = opts.output_dir.join(name);

    let count = merge_outputs(format.emitter(), &opts.output_dir, format, &merged_path)
        .await
        .context("Merge failed")?;
    if count == 0 {
        bail!(
            "No {} files to merge in {:?}",
            format.extension(),
            opts.output_dir
        );
    }
    ui.display_message(
        "📚",
        &format!(
            "{} {} files merged into: {}",
            count,
            format.extension(),
            merged_path.display()
        ),
    );
    Ok(())
}
