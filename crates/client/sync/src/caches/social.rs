//! Follow and reblog rows, fed by `custom_json` payloads.

use super::{apply_batches, CacheCore, CacheError, EntityCache};
use ac_db::{StoreConnection, Value, WriteBatch};
use std::collections::HashMap;
use std::sync::Mutex;

/// What a follow edge currently means. `Reset` removes the edge.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FollowState {
    Blog,
    Mute,
    Reset,
}

impl FollowState {
    /// The `what` list of a follow payload. An empty list resets the edge.
    pub fn from_what(what: &[String]) -> Option<Self> {
        match what.first().map(String::as_str) {
            None | Some("") => Some(FollowState::Reset),
            Some("blog") | Some("follow") => Some(FollowState::Blog),
            Some("ignore") => Some(FollowState::Mute),
            _ => None,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            FollowState::Blog => "blog",
            FollowState::Mute => "ignore",
            FollowState::Reset => "",
        }
    }
}

pub struct FollowsCache {
    core: CacheCore,
    state: Mutex<HashMap<(String, String), (FollowState, u64)>>,
}

impl FollowsCache {
    pub fn new() -> Self {
        Self { core: CacheCore::new("follows"), state: Mutex::new(HashMap::new()) }
    }

    pub fn register(
        &self,
        follower: &str,
        following: &str,
        what: FollowState,
        block_n: u64,
    ) -> Result<(), CacheError> {
        self.core.check_register()?;
        self.state
            .lock()
            .expect("follows cache lock")
            .insert((follower.to_string(), following.to_string()), (what, block_n));
        Ok(())
    }

    fn build_batches(&self) -> Vec<WriteBatch> {
        let mut upserts = WriteBatch::upsert("follows", &["follower", "following"], &[
            "follower",
            "following",
            "state",
            "block_num",
        ]);
        let mut deletes = WriteBatch::delete("follows", &["follower", "following"]);
        for ((follower, following), (what, block_n)) in self.state.lock().expect("follows cache lock").iter() {
            let key = vec![Value::Text(follower.clone()), Value::Text(following.clone())];
            match what {
                FollowState::Reset => deletes.push_row(key),
                state => upserts.push_row(
                    key.into_iter()
                        .chain([Value::Text(state.as_str().to_string()), Value::UInt(*block_n)])
                        .collect(),
                ),
            }
        }
        vec![upserts, deletes]
    }
}

impl Default for FollowsCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl EntityCache for FollowsCache {
    fn name(&self) -> &'static str {
        self.core.name()
    }

    fn pending(&self) -> usize {
        self.state.lock().expect("follows cache lock").len()
    }

    async fn flush(&self, conn: &mut (dyn StoreConnection + '_)) -> Result<u64, CacheError> {
        let _window = self.core.begin_flush()?;
        apply_batches(conn, &self.build_batches()).await
    }

    fn mark_flushed(&self) {
        self.state.lock().expect("follows cache lock").clear();
    }

    fn discard_from(&self, block_n: u64) {
        self.state.lock().expect("follows cache lock").retain(|_, (_, b)| *b < block_n);
    }

    fn clear(&self) {
        self.mark_flushed();
    }
}

pub struct ReblogsCache {
    core: CacheCore,
    /// `true` adds the reblog, `false` undoes it.
    state: Mutex<HashMap<(String, String, String), (bool, u64)>>,
}

impl ReblogsCache {
    pub fn new() -> Self {
        Self { core: CacheCore::new("reblogs"), state: Mutex::new(HashMap::new()) }
    }

    pub fn register(
        &self,
        account: &str,
        author: &str,
        permlink: &str,
        active: bool,
        block_n: u64,
    ) -> Result<(), CacheError> {
        self.core.check_register()?;
        self.state
            .lock()
            .expect("reblogs cache lock")
            .insert((account.to_string(), author.to_string(), permlink.to_string()), (active, block_n));
        Ok(())
    }

    fn build_batches(&self) -> Vec<WriteBatch> {
        let mut upserts = WriteBatch::upsert("reblogs", &["account", "author", "permlink"], &[
            "account",
            "author",
            "permlink",
            "block_num",
        ]);
        let mut deletes = WriteBatch::delete("reblogs", &["account", "author", "permlink"]);
        for ((account, author, permlink), (active, block_n)) in
            self.state.lock().expect("reblogs cache lock").iter()
        {
            let key = vec![Value::Text(account.clone()), Value::Text(author.clone()), Value::Text(permlink.clone())];
            if *active {
                upserts.push_row(key.into_iter().chain([Value::UInt(*block_n)]).collect());
            } else {
                deletes.push_row(key);
            }
        }
        vec![upserts, deletes]
    }
}

impl Default for ReblogsCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl EntityCache for ReblogsCache {
    fn name(&self) -> &'static str {
        self.core.name()
    }

    fn pending(&self) -> usize {
        self.state.lock().expect("reblogs cache lock").len()
    }

    async fn flush(&self, conn: &mut (dyn StoreConnection + '_)) -> Result<u64, CacheError> {
        let _window = self.core.begin_flush()?;
        apply_batches(conn, &self.build_batches()).await
    }

    fn mark_flushed(&self) {
        self.state.lock().expect("reblogs cache lock").clear();
    }

    fn discard_from(&self, block_n: u64) {
        self.state.lock().expect("reblogs cache lock").retain(|_, (_, b)| *b < block_n);
    }

    fn clear(&self) {
        self.mark_flushed();
    }
}

/// Community membership edges, fed by `community` custom_json payloads.
pub struct SubscriptionsCache {
    core: CacheCore,
    /// `true` subscribes, `false` removes the edge.
    state: Mutex<HashMap<(String, String), (bool, u64)>>,
}

impl SubscriptionsCache {
    pub fn new() -> Self {
        Self { core: CacheCore::new("subscriptions"), state: Mutex::new(HashMap::new()) }
    }

    pub fn register(&self, account: &str, community: &str, active: bool, block_n: u64) -> Result<(), CacheError> {
        self.core.check_register()?;
        self.state
            .lock()
            .expect("subscriptions cache lock")
            .insert((account.to_string(), community.to_string()), (active, block_n));
        Ok(())
    }

    fn build_batches(&self) -> Vec<WriteBatch> {
        let mut upserts = WriteBatch::upsert("subscriptions", &["account", "community"], &[
            "account",
            "community",
            "block_num",
        ]);
        let mut deletes = WriteBatch::delete("subscriptions", &["account", "community"]);
        for ((account, community), (active, block_n)) in self.state.lock().expect("subscriptions cache lock").iter()
        {
            let key = vec![Value::Text(account.clone()), Value::Text(community.clone())];
            if *active {
                upserts.push_row(key.into_iter().chain([Value::UInt(*block_n)]).collect());
            } else {
                deletes.push_row(key);
            }
        }
        vec![upserts, deletes]
    }
}

impl Default for SubscriptionsCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl EntityCache for SubscriptionsCache {
    fn name(&self) -> &'static str {
        self.core.name()
    }

    fn pending(&self) -> usize {
        self.state.lock().expect("subscriptions cache lock").len()
    }

    async fn flush(&self, conn: &mut (dyn StoreConnection + '_)) -> Result<u64, CacheError> {
        let _window = self.core.begin_flush()?;
        apply_batches(conn, &self.build_batches()).await
    }

    fn mark_flushed(&self) {
        self.state.lock().expect("subscriptions cache lock").clear();
    }

    fn discard_from(&self, block_n: u64) {
        self.state.lock().expect("subscriptions cache lock").retain(|_, (_, b)| *b < block_n);
    }

    fn clear(&self) {
        self.mark_flushed();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ac_db::{MemStore, Store};

    #[tokio::test]
    async fn reset_deletes_a_previously_flushed_edge() {
        let store = MemStore::default();
        let cache = FollowsCache::new();

        cache.register("alice", "bob", FollowState::Blog, 10).unwrap();
        let mut conn = store.connection().await.unwrap();
        cache.flush(&mut *conn).await.unwrap();
        cache.mark_flushed();
        assert!(conn.get_row("follows", &["alice".into(), "bob".into()]).await.unwrap().is_some());

        cache.register("alice", "bob", FollowState::Reset, 11).unwrap();
        cache.flush(&mut *conn).await.unwrap();
        cache.mark_flushed();
        assert!(conn.get_row("follows", &["alice".into(), "bob".into()]).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unsubscribe_deletes_a_previously_flushed_membership() {
        let store = MemStore::default();
        let cache = SubscriptionsCache::new();

        cache.register("alice", "group-music", true, 10).unwrap();
        let mut conn = store.connection().await.unwrap();
        cache.flush(&mut *conn).await.unwrap();
        cache.mark_flushed();
        assert!(conn.get_row("subscriptions", &["alice".into(), "group-music".into()]).await.unwrap().is_some());

        cache.register("alice", "group-music", false, 11).unwrap();
        cache.flush(&mut *conn).await.unwrap();
        cache.mark_flushed();
        assert!(conn.get_row("subscriptions", &["alice".into(), "group-music".into()]).await.unwrap().is_none());
    }

    #[test]
    fn follow_what_parsing() {
        assert_eq!(FollowState::from_what(&[]), Some(FollowState::Reset));
        assert_eq!(FollowState::from_what(&["blog".into()]), Some(FollowState::Blog));
        assert_eq!(FollowState::from_what(&["ignore".into()]), Some(FollowState::Mute));
        assert_eq!(FollowState::from_what(&["posts".into()]), None);
    }
}
