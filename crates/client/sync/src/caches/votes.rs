//! Vote rows, keyed by (voter, author, permlink). A re-vote replaces the
//! previous row. The user-submitted `vote` operation carries the weight; the
//! chain's `effective_comment_vote` follows with the rshares that actually
//! counted.

use super::{apply_batches, CacheCore, CacheError, EntityCache};
use ac_db::{StoreConnection, Value, WriteBatch};
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Default)]
struct VoteState {
    weight: Option<i64>,
    rshares: Option<i64>,
    block_n: u64,
}

pub struct VotesCache {
    core: CacheCore,
    state: Mutex<HashMap<(String, String, String), VoteState>>,
}

impl VotesCache {
    pub fn new() -> Self {
        Self { core: CacheCore::new("votes"), state: Mutex::new(HashMap::new()) }
    }

    pub fn register_vote(
        &self,
        voter: &str,
        author: &str,
        permlink: &str,
        weight: i32,
        block_n: u64,
    ) -> Result<(), CacheError> {
        self.core.check_register()?;
        let mut state = self.state.lock().expect("votes cache lock");
        let entry = state.entry((voter.to_string(), author.to_string(), permlink.to_string())).or_default();
        entry.weight = Some(weight.into());
        entry.block_n = block_n;
        Ok(())
    }

    pub fn register_effective(
        &self,
        voter: &str,
        author: &str,
        permlink: &str,
        rshares: i64,
        block_n: u64,
    ) -> Result<(), CacheError> {
        self.core.check_register()?;
        let mut state = self.state.lock().expect("votes cache lock");
        let entry = state.entry((voter.to_string(), author.to_string(), permlink.to_string())).or_default();
        entry.rshares = Some(rshares);
        entry.block_n = entry.block_n.max(block_n);
        Ok(())
    }

    /// Weight and rshares arrive in separate operations, possibly in
    /// different flush windows. Each side gets its own batch so flushing one
    /// cannot zero out the other on a stored row.
    fn build_batches(&self) -> Vec<WriteBatch> {
        let key_cols = &["voter", "author", "permlink"];
        let mut full =
            WriteBatch::upsert("votes", key_cols, &["voter", "author", "permlink", "weight", "rshares", "block_num"]);
        let mut weight_only =
            WriteBatch::upsert("votes", key_cols, &["voter", "author", "permlink", "weight", "block_num"]);
        let mut rshares_only =
            WriteBatch::upsert("votes", key_cols, &["voter", "author", "permlink", "rshares", "block_num"]);
        for ((voter, author, permlink), vote) in self.state.lock().expect("votes cache lock").iter() {
            let key = vec![Value::Text(voter.clone()), Value::Text(author.clone()), Value::Text(permlink.clone())];
            match (vote.weight, vote.rshares) {
                (Some(weight), Some(rshares)) => full.push_row(
                    [key, vec![Value::Int(weight), Value::Int(rshares), Value::UInt(vote.block_n)]].concat(),
                ),
                (Some(weight), None) => {
                    weight_only.push_row([key, vec![Value::Int(weight), Value::UInt(vote.block_n)]].concat())
                }
                (None, Some(rshares)) => {
                    rshares_only.push_row([key, vec![Value::Int(rshares), Value::UInt(vote.block_n)]].concat())
                }
                (None, None) => {}
            }
        }
        vec![full, weight_only, rshares_only]
    }
}

impl Default for VotesCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl EntityCache for VotesCache {
    fn name(&self) -> &'static str {
        self.core.name()
    }

    fn pending(&self) -> usize {
        self.state.lock().expect("votes cache lock").len()
    }

    async fn flush(&self, conn: &mut (dyn StoreConnection + '_)) -> Result<u64, CacheError> {
        let _window = self.core.begin_flush()?;
        apply_batches(conn, &self.build_batches()).await
    }

    fn mark_flushed(&self) {
        self.state.lock().expect("votes cache lock").clear();
    }

    fn discard_from(&self, block_n: u64) {
        self.state.lock().expect("votes cache lock").retain(|_, v| v.block_n < block_n);
    }

    fn clear(&self) {
        self.mark_flushed();
    }
}
