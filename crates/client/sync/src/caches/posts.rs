//! Posts and their bodies, keyed by (author, permlink).
//!
//! Reward virtual operations do not each produce a row: they accumulate into
//! the post's payout total and flush as one update. Bodies live in their own
//! table, they dominate storage volume and most readers never touch them.

use super::{apply_batches, parse_amount, CacheCore, CacheError, EntityCache};
use ac_db::{StoreConnection, Value, WriteBatch};
use ap_block::CommentOp;
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Default)]
struct PostState {
    parent_author: Option<String>,
    parent_permlink: Option<String>,
    title: Option<String>,
    created_block: Option<u64>,
    deleted: Option<bool>,
    paid: Option<bool>,
    payout_millis: i64,
    last_block: u64,
}

pub struct PostsCache {
    core: CacheCore,
    state: Mutex<HashMap<(String, String), PostState>>,
}

impl PostsCache {
    pub fn new() -> Self {
        Self { core: CacheCore::new("posts"), state: Mutex::new(HashMap::new()) }
    }

    fn entry_mut<'a>(
        state: &'a mut HashMap<(String, String), PostState>,
        author: &str,
        permlink: &str,
        block_n: u64,
    ) -> &'a mut PostState {
        let entry = state.entry((author.to_string(), permlink.to_string())).or_default();
        entry.last_block = entry.last_block.max(block_n);
        entry
    }

    pub fn register_comment(&self, op: &CommentOp, block_n: u64) -> Result<(), CacheError> {
        self.core.check_register()?;
        let mut state = self.state.lock().expect("posts cache lock");
        let entry = Self::entry_mut(&mut state, &op.author, &op.permlink, block_n);
        entry.parent_author = Some(op.parent_author.clone());
        entry.parent_permlink = Some(op.parent_permlink.clone());
        entry.title = Some(op.title.clone());
        // Comment edits reuse the operation. Only the first one creates.
        entry.created_block.get_or_insert(block_n);
        entry.deleted = Some(false);
        Ok(())
    }

    pub fn register_deleted(&self, author: &str, permlink: &str, block_n: u64) -> Result<(), CacheError> {
        self.core.check_register()?;
        let mut state = self.state.lock().expect("posts cache lock");
        Self::entry_mut(&mut state, author, permlink, block_n).deleted = Some(true);
        Ok(())
    }

    /// The chain refused a delete because the post has pending payouts.
    pub fn register_undeleted(&self, author: &str, permlink: &str, block_n: u64) -> Result<(), CacheError> {
        self.core.check_register()?;
        let mut state = self.state.lock().expect("posts cache lock");
        Self::entry_mut(&mut state, author, permlink, block_n).deleted = Some(false);
        Ok(())
    }

    pub fn register_payout(&self, author: &str, permlink: &str, amount: &str, block_n: u64) -> Result<(), CacheError> {
        self.core.check_register()?;
        let (millis, _) = parse_amount(amount);
        let mut state = self.state.lock().expect("posts cache lock");
        Self::entry_mut(&mut state, author, permlink, block_n).payout_millis += millis;
        Ok(())
    }

    pub fn register_paid(&self, author: &str, permlink: &str, block_n: u64) -> Result<(), CacheError> {
        self.core.check_register()?;
        let mut state = self.state.lock().expect("posts cache lock");
        Self::entry_mut(&mut state, author, permlink, block_n).paid = Some(true);
        Ok(())
    }

    /// Payouts are deltas against whatever the store already holds, so rows
    /// with a payout read back the current total before writing. The stored
    /// `payout_block` watermark marks how far payouts have been applied, so
    /// a replayed window converges instead of double-counting.
    ///
    /// `block_num` stays the creation block across every update. Later
    /// touches (rewards, edits, flags) must not move a post's provenance, or
    /// a fork rewind would delete posts that predate the fork point.
    async fn build_batches(&self, conn: &mut (dyn StoreConnection + '_)) -> Result<Vec<WriteBatch>, CacheError> {
        struct Snapshot {
            author: String,
            permlink: String,
            post: PostState,
        }
        let snapshot: Vec<Snapshot> = {
            let state = self.state.lock().expect("posts cache lock");
            state
                .iter()
                .map(|((author, permlink), p)| Snapshot {
                    author: author.clone(),
                    permlink: permlink.clone(),
                    post: PostState {
                        parent_author: p.parent_author.clone(),
                        parent_permlink: p.parent_permlink.clone(),
                        title: p.title.clone(),
                        created_block: p.created_block,
                        deleted: p.deleted,
                        paid: p.paid,
                        payout_millis: p.payout_millis,
                        last_block: p.last_block,
                    },
                })
                .collect()
        };

        let mut full = WriteBatch::upsert("posts", &["author", "permlink"], &[
            "author",
            "permlink",
            "parent_author",
            "parent_permlink",
            "title",
            "created_block",
            "deleted",
            "paid",
            "payout",
            "payout_block",
            "block_num",
        ]);
        // Partial updates must not null out the rest of the post row.
        let mut payout = WriteBatch::upsert("posts", &["author", "permlink"], &[
            "author", "permlink", "payout", "payout_block",
        ]);
        let mut flags = WriteBatch::upsert("posts", &["author", "permlink"], &[
            "author", "permlink", "deleted", "paid",
        ]);

        for Snapshot { author, permlink, post } in snapshot {
            let key = [Value::Text(author), Value::Text(permlink)];
            // Full rows rewrite the payout column too, so they need the
            // current total even with no payout delta of their own.
            let stored = if post.payout_millis != 0 || post.parent_author.is_some() {
                conn.get_row("posts", &key).await?
            } else {
                None
            };
            let stored_payout =
                stored.as_ref().and_then(|row| row.get("payout").and_then(Value::as_i64)).unwrap_or(0);
            let applied_until =
                stored.as_ref().and_then(|row| row.get("payout_block").and_then(Value::as_u64)).unwrap_or(0);
            let stored_created = stored.as_ref().and_then(|row| row.get("block_num").and_then(Value::as_u64));

            let payout_total = if applied_until >= post.last_block {
                stored_payout
            } else {
                stored_payout + post.payout_millis
            };
            let payout_block = applied_until.max(post.last_block);

            if post.parent_author.is_some() {
                full.push_row(vec![
                    key[0].clone(),
                    key[1].clone(),
                    post.parent_author.into(),
                    post.parent_permlink.into(),
                    post.title.into(),
                    post.created_block.into(),
                    Value::Bool(post.deleted.unwrap_or(false)),
                    Value::Bool(post.paid.unwrap_or(false)),
                    Value::Int(payout_total),
                    Value::UInt(payout_block),
                    stored_created.or(post.created_block).into(),
                ]);
            } else if post.payout_millis != 0 && post.deleted.is_none() && post.paid.is_none() {
                payout.push_row(vec![
                    key[0].clone(),
                    key[1].clone(),
                    Value::Int(payout_total),
                    Value::UInt(payout_block),
                ]);
            } else {
                flags.push_row(vec![
                    key[0].clone(),
                    key[1].clone(),
                    Value::Bool(post.deleted.unwrap_or(false)),
                    Value::Bool(post.paid.unwrap_or(false)),
                ]);
            }
        }
        Ok(vec![full, payout, flags])
    }
}

impl Default for PostsCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl EntityCache for PostsCache {
    fn name(&self) -> &'static str {
        self.core.name()
    }

    fn pending(&self) -> usize {
        self.state.lock().expect("posts cache lock").len()
    }

    async fn flush(&self, conn: &mut (dyn StoreConnection + '_)) -> Result<u64, CacheError> {
        let _window = self.core.begin_flush()?;
        let batches = self.build_batches(conn).await?;
        apply_batches(conn, &batches).await
    }

    fn mark_flushed(&self) {
        self.state.lock().expect("posts cache lock").clear();
    }

    fn discard_from(&self, block_n: u64) {
        self.state.lock().expect("posts cache lock").retain(|_, p| p.last_block < block_n);
    }

    fn clear(&self) {
        self.mark_flushed();
    }
}

/// Post bodies and json metadata.
pub struct PostDataCache {
    core: CacheCore,
    state: Mutex<HashMap<(String, String), (String, String, u64)>>,
}

impl PostDataCache {
    pub fn new() -> Self {
        Self { core: CacheCore::new("post_data"), state: Mutex::new(HashMap::new()) }
    }

    pub fn register(&self, op: &CommentOp, block_n: u64) -> Result<(), CacheError> {
        self.core.check_register()?;
        self.state
            .lock()
            .expect("post_data cache lock")
            .insert((op.author.clone(), op.permlink.clone()), (op.body.clone(), op.json_metadata.clone(), block_n));
        Ok(())
    }

    fn build_batch(&self) -> WriteBatch {
        let mut batch = WriteBatch::upsert("post_data", &["author", "permlink"], &[
            "author",
            "permlink",
            "body",
            "json_metadata",
            "block_num",
        ]);
        for ((author, permlink), (body, meta, block_n)) in self.state.lock().expect("post_data cache lock").iter() {
            batch.push_row(vec![
                Value::Text(author.clone()),
                Value::Text(permlink.clone()),
                Value::Text(body.clone()),
                Value::Text(meta.clone()),
                Value::UInt(*block_n),
            ]);
        }
        batch
    }
}

impl Default for PostDataCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl EntityCache for PostDataCache {
    fn name(&self) -> &'static str {
        self.core.name()
    }

    fn pending(&self) -> usize {
        self.state.lock().expect("post_data cache lock").len()
    }

    async fn flush(&self, conn: &mut (dyn StoreConnection + '_)) -> Result<u64, CacheError> {
        let _window = self.core.begin_flush()?;
        apply_batches(conn, &[self.build_batch()]).await
    }

    fn mark_flushed(&self) {
        self.state.lock().expect("post_data cache lock").clear();
    }

    fn discard_from(&self, block_n: u64) {
        self.state.lock().expect("post_data cache lock").retain(|_, (_, _, b)| *b < block_n);
    }

    fn clear(&self) {
        self.mark_flushed();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ac_db::{MemStore, Store};

    fn comment(author: &str, permlink: &str) -> CommentOp {
        CommentOp {
            parent_author: "".into(),
            parent_permlink: "general".into(),
            author: author.into(),
            permlink: permlink.into(),
            title: "t".into(),
            body: "b".into(),
            json_metadata: "".into(),
        }
    }

    #[tokio::test]
    async fn popping_a_reward_block_keeps_the_post() {
        let store = MemStore::default();
        let cache = PostsCache::new();
        let mut conn = store.connection().await.unwrap();

        cache.register_comment(&comment("alice", "hello"), 2).unwrap();
        cache.flush(&mut *conn).await.unwrap();
        cache.mark_flushed();

        cache.register_payout("alice", "hello", "0.100 TBD", 10).unwrap();
        cache.flush(&mut *conn).await.unwrap();
        cache.mark_flushed();

        conn.pop_blocks_above(8).await.unwrap();
        let row = conn.get_row("posts", &["alice".into(), "hello".into()]).await.unwrap().unwrap();
        assert_eq!(row.get("block_num").and_then(Value::as_u64), Some(2));
    }

    #[tokio::test]
    async fn an_edit_does_not_move_the_creation_block() {
        let store = MemStore::default();
        let cache = PostsCache::new();
        let mut conn = store.connection().await.unwrap();

        cache.register_comment(&comment("alice", "hello"), 2).unwrap();
        cache.flush(&mut *conn).await.unwrap();
        cache.mark_flushed();

        // An edit in a later window reuses the comment operation.
        cache.register_comment(&comment("alice", "hello"), 10).unwrap();
        cache.flush(&mut *conn).await.unwrap();
        cache.mark_flushed();

        conn.pop_blocks_above(8).await.unwrap();
        assert!(conn.get_row("posts", &["alice".into(), "hello".into()]).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn replayed_payout_window_does_not_double_count() {
        let store = MemStore::default();
        let mut conn = store.connection().await.unwrap();

        let cache = PostsCache::new();
        cache.register_payout("alice", "hello", "0.100 TBD", 10).unwrap();
        cache.flush(&mut *conn).await.unwrap();
        cache.mark_flushed();

        // Restart replays the same window with a fresh cache.
        let cache = PostsCache::new();
        cache.register_payout("alice", "hello", "0.100 TBD", 10).unwrap();
        cache.flush(&mut *conn).await.unwrap();
        cache.mark_flushed();

        let row = conn.get_row("posts", &["alice".into(), "hello".into()]).await.unwrap().unwrap();
        assert_eq!(row.get("payout").and_then(Value::as_i64), Some(100));
    }
}
