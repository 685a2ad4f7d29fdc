//! JSON-RPC client for a live chain node.

use crate::{ChainClientError, ChainSource, ChainStatus};
use ap_block::{BlockRange, BlockSource, NodeBlock, VirtualOperation};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use url::Url;

#[derive(Clone, Debug)]
pub struct NodeClientConfig {
    pub request_timeout: Duration,
    /// Transport-level failures are retried with doubling backoff. RPC-level
    /// errors are not retried, the node already understood the request.
    pub max_retries: usize,
    pub retry_base_delay: Duration,
}

impl Default for NodeClientConfig {
    fn default() -> Self {
        Self { request_timeout: Duration::from_secs(20), max_retries: 5, retry_base_delay: Duration::from_millis(250) }
    }
}

#[derive(Clone)]
pub struct NodeClient {
    client: reqwest::Client,
    url: Url,
    config: NodeClientConfig,
}

impl std::fmt::Debug for NodeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeClient").field("url", &self.url).finish()
    }
}

#[derive(Serialize)]
struct RpcRequest<'a, P: Serialize> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: P,
}

#[derive(Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcError>,
}

#[derive(Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

#[derive(Serialize)]
struct BlockRangeParams {
    starting_block_num: u64,
    count: u64,
}

#[derive(Deserialize)]
struct BlockRangeResult {
    #[serde(default)]
    blocks: Vec<NodeBlock>,
}

#[derive(Serialize)]
struct VirtualOpsParams {
    block_range_begin: u64,
    block_range_end: u64,
}

#[derive(Deserialize)]
struct VirtualOpsResult {
    #[serde(default)]
    ops: Vec<AttributedVop>,
}

#[derive(Deserialize)]
struct AttributedVop {
    block: u64,
    op: VirtualOperation,
}

#[derive(Deserialize)]
struct GlobalProperties {
    head_block_number: u64,
    last_irreversible_block_num: u64,
}

impl NodeClient {
    pub fn new(url: Url, config: NodeClientConfig) -> Result<Self, ChainClientError> {
        let client = reqwest::Client::builder().timeout(config.request_timeout).build()?;
        Ok(Self { client, url, config })
    }

    async fn call<P: Serialize + Sync, T: DeserializeOwned>(
        &self,
        method: &str,
        params: &P,
    ) -> Result<T, ChainClientError> {
        let request = RpcRequest { jsonrpc: "2.0", id: 1, method, params };
        let mut delay = self.config.retry_base_delay;
        for attempt in 0..=self.config.max_retries {
            match self.try_call(&request).await {
                Ok(result) => return Ok(result),
                Err(err @ ChainClientError::Rpc { .. }) => return Err(err),
                Err(err) if attempt < self.config.max_retries => {
                    tracing::warn!("Retrying `{method}` after error (attempt {}): {err:#}", attempt + 1);
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                Err(err) => {
                    tracing::error!("Giving up on `{method}`: {err:#}");
                    return Err(err);
                }
            }
        }
        Err(ChainClientError::RetriesExhausted(self.config.max_retries))
    }

    async fn try_call<P: Serialize, T: DeserializeOwned>(
        &self,
        request: &RpcRequest<'_, P>,
    ) -> Result<T, ChainClientError> {
        let response: RpcResponse<T> = self
            .client
            .post(self.url.clone())
            .json(request)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        if let Some(RpcError { code, message }) = response.error {
            return Err(ChainClientError::Rpc { code, message });
        }
        response.result.ok_or(ChainClientError::Rpc { code: 0, message: "response carried no result".into() })
    }
}

#[async_trait::async_trait]
impl ChainSource for NodeClient {
    async fn block_batch(&self, range: BlockRange) -> Result<Vec<BlockSource>, ChainClientError> {
        let params = BlockRangeParams { starting_block_num: range.first, count: range.len() };
        let result: BlockRangeResult = self.call("block_api.get_block_range", &params).await?;

        let mut by_num: HashMap<u64, NodeBlock> = result.blocks.into_iter().map(|b| (b.block_num, b)).collect();
        range
            .iter()
            .map(|n| by_num.remove(&n).map(BlockSource::Node).ok_or(ChainClientError::MissingBlock(n)))
            .collect()
    }

    async fn virtual_ops(
        &self,
        range: BlockRange,
    ) -> Result<HashMap<u64, Vec<VirtualOperation>>, ChainClientError> {
        // End bound is exclusive on this endpoint.
        let params = VirtualOpsParams { block_range_begin: range.first, block_range_end: range.last + 1 };
        let result: VirtualOpsResult = self.call("account_history_api.enum_virtual_ops", &params).await?;

        let mut map: HashMap<u64, Vec<VirtualOperation>> = HashMap::new();
        for vop in result.ops {
            if range.contains(vop.block) {
                map.entry(vop.block).or_default().push(vop.op);
            }
        }
        Ok(map)
    }

    async fn status(&self) -> Result<ChainStatus, ChainClientError> {
        let props: GlobalProperties =
            self.call("database_api.get_dynamic_global_properties", &serde_json::json!({})).await?;
        Ok(ChainStatus { head_block: props.head_block_number, last_irreversible: props.last_irreversible_block_num })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::MockServer;
    use serde_json::json;

    fn client(server: &MockServer) -> NodeClient {
        let config = NodeClientConfig {
            max_retries: 1,
            retry_base_delay: Duration::from_millis(1),
            ..Default::default()
        };
        NodeClient::new(Url::parse(&server.base_url()).unwrap(), config).unwrap()
    }

    #[tokio::test]
    async fn fetches_a_block_range() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(httpmock::Method::POST).json_body_partial(
                    json!({"method": "block_api.get_block_range", "params": {"starting_block_num": 10, "count": 2}})
                        .to_string(),
                );
                then.status(200).json_body(json!({
                    "jsonrpc": "2.0",
                    "id": 1,
                    "result": { "blocks": [
                        {"block_num": 10, "block_id": "aa", "previous": "a9", "timestamp": "2016-01-01T00:00:00"},
                        {"block_num": 11, "block_id": "ab", "previous": "aa", "timestamp": "2016-01-01T00:00:03"},
                    ]}
                }));
            })
            .await;

        let blocks = client(&server).block_batch(BlockRange::new(10, 11)).await.unwrap();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].number(), 10);
        assert_eq!(blocks[1].previous_hash(), "aa");
    }

    #[tokio::test]
    async fn missing_block_in_response_is_an_error() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(httpmock::Method::POST);
                then.status(200).json_body(json!({
                    "jsonrpc": "2.0", "id": 1,
                    "result": { "blocks": [
                        {"block_num": 10, "block_id": "aa", "previous": "a9", "timestamp": "2016-01-01T00:00:00"},
                    ]}
                }));
            })
            .await;

        let err = client(&server).block_batch(BlockRange::new(10, 11)).await.unwrap_err();
        assert_matches::assert_matches!(err, ChainClientError::MissingBlock(11));
    }

    #[tokio::test]
    async fn rpc_errors_are_not_retried() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(httpmock::Method::POST);
                then.status(200)
                    .json_body(json!({"jsonrpc": "2.0", "id": 1, "error": {"code": -32000, "message": "nope"}}));
            })
            .await;

        let err = client(&server).status().await.unwrap_err();
        assert_matches::assert_matches!(err, ChainClientError::Rpc { code: -32000, .. });
        mock.assert_hits_async(1).await;
    }

    #[tokio::test]
    async fn groups_virtual_ops_by_block() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(httpmock::Method::POST).json_body_partial(
                    json!({"method": "account_history_api.enum_virtual_ops"}).to_string(),
                );
                then.status(200).json_body(json!({
                    "jsonrpc": "2.0", "id": 1,
                    "result": { "ops": [
                        {"block": 5, "op": {"type": "author_reward_operation", "value": {}}},
                        {"block": 5, "op": {"type": "curation_reward_operation", "value": {}}},
                        {"block": 6, "op": {"type": "comment_payout_update_operation", "value": {}}},
                    ]}
                }));
            })
            .await;

        let map = client(&server).virtual_ops(BlockRange::new(5, 6)).await.unwrap();
        assert_eq!(map[&5].len(), 2);
        assert_eq!(map[&6].len(), 1);
    }
}
