//! Command-line entry points.

use clap::Args;

use crate::{
    checkpoint::{CheckpointStore, DEFAULT_CHECKPOINT_FILE},
    prelude::*,
};

pub mod merge;
pub mod ocr;
pub mod schema;
pub mod session;

/// Where the session checkpoint lives.
#[derive(Debug, Clone, Args)]
pub struct SessionOpts {
    /// Session checkpoint file used to resume an interrupted job.
    #[clap(long, default_value = DEFAULT_CHECKPOINT_FILE)]
    pub session_file: PathBuf,
}

impl SessionOpts {
    /// Open the checkpoint store.
    pub fn store(&self) -> CheckpointStore {
        CheckpointStore::new(self.session_file.clone())
    }
}
