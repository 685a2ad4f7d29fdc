use ac_chain_client::{ChainClientError, MockBlocks, NodeClientConfig};
use ap_utils::parsers::{parse_duration, parse_url};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

/// Where blocks come from.
#[derive(Clone, Debug, clap::Args, Deserialize, Serialize)]
pub struct SourceParams {
    /// JSON-RPC endpoint of the chain node to sync from.
    #[clap(env = "APIARY_NODE_URL", long, value_parser = parse_url, value_name = "URL")]
    pub node_url: Option<Url>,

    /// Request timeout for node RPC calls.
    #[clap(env = "APIARY_NODE_TIMEOUT", long, default_value = "20s", value_parser = parse_duration, value_name = "DURATION")]
    pub node_timeout: Duration,

    /// Transport-level retries per RPC call.
    #[clap(env = "APIARY_NODE_RETRIES", long, default_value_t = 5)]
    pub node_retries: usize,

    /// Path to a mock block data file (json or yaml). Together with
    /// --node-url its transactions are merged onto the fetched blocks;
    /// without --node-url it replaces the node entirely.
    #[clap(env = "APIARY_MOCK_FILE", long, value_name = "PATH")]
    pub mock_file: Option<PathBuf>,

    /// Head height of a standalone mock chain. Blocks past the last one in
    /// the data file are synthesized empty.
    #[clap(env = "APIARY_MOCK_HEAD", long, value_name = "BLOCK NUMBER")]
    pub mock_head: Option<u64>,
}

impl SourceParams {
    /// Parsed mock data file, if one was given.
    pub fn mock_blocks(&self) -> Result<Option<MockBlocks>, ChainClientError> {
        self.mock_file.as_deref().map(MockBlocks::load).transpose()
    }

    /// RPC client settings.
    pub fn client_config(&self) -> NodeClientConfig {
        NodeClientConfig {
            request_timeout: self.node_timeout,
            max_retries: self.node_retries,
            ..Default::default()
        }
    }
}
