//! The `session` subcommand.

use clap::{Args, Subcommand};

use crate::{async_utils::io::write_output, prelude::*, ui::Ui};

use super::SessionOpts;

/// Session command line arguments.
#[derive(Debug, Args)]
pub struct SessionCmdOpts {
    #[clap(subcommand)]
    pub action: SessionAction,

    #[clap(flatten)]
    pub session: SessionOpts,
}

/// What to do with the saved session.
#[derive(Debug, Clone, Copy, Subcommand)]
pub enum SessionAction {
    /// Print the saved session as JSON.
    Show,
    /// Delete the saved session, so the next run starts fresh.
    Clear,
}

/// The `session` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_session(ui: Ui, opts: &SessionCmdOpts) -> Result<()> {
    let store = opts.session.store();
    match opts.action {
        SessionAction::Show => {
            let Some(checkpoint) = store.load_any().await else {
                ui.display_message("💤", &format!("No session in {:?}", store.path()));
                return Ok(());
            };
            ui.display_message(
                "📋",
                &format!(
                    "{}: {} of {} files processed",
                    checkpoint.settings.source_dir.display(),
                    checkpoint.processed_files.len(),
                    checkpoint.total_files
                ),
            );
            let json = serde_json::to_string_pretty(&checkpoint)
                .context("failed to serialize session")?;
            write_output(None, &json).await?;
        }
        SessionAction::Clear => {
            store.clear().await?;
            ui.display_message("🧹", &format!("Cleared session {:?}", store.path()));
        }
    }
    Ok(())
}
