//! Command line interface.

pub mod source;
pub mod sync;

pub use source::*;
pub use sync::*;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Apiary: social blockchain indexer.
#[derive(Clone, Debug, clap::Parser, Deserialize, Serialize)]
pub struct RunCmd {
    /// The human-readable name for this node. It only shows up in logs.
    #[arg(env = "APIARY_NAME", long, value_name = "NAME")]
    pub name: Option<String>,

    /// Load the configuration from a file instead of the command line.
    /// Supports toml, json and yaml, picked by extension. When set, all
    /// other command line arguments are ignored.
    #[clap(env = "APIARY_CONFIG_FILE", long, value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    /// Parameters for the block provider.
    #[clap(flatten)]
    pub source_params: SourceParams,

    /// Parameters for the sync process.
    #[clap(flatten)]
    pub sync_params: SyncParams,
}

impl RunCmd {
    /// Node name for log lines.
    pub fn node_name(&self) -> &str {
        self.name.as_deref().unwrap_or("apiary")
    }
}
