//! Dependent caches: notifications and reputations. Both reference rows
//! written by the first flush wave, so they flush in the second.

use super::{apply_batches, CacheCore, CacheError, EntityCache, FlushPhase};
use ac_db::{LookupCache, StoreConnection, Value, WriteBatch};
use std::collections::HashMap;
use std::sync::Mutex;

/// Accounts whose stored reputation total is kept in memory between flushes.
const REPUTATION_LOOKUP_CAPACITY: usize = 16_384;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NotificationKind {
    Vote,
    Reply,
    Follow,
    Transfer,
    Reblog,
}

impl NotificationKind {
    fn as_str(self) -> &'static str {
        match self {
            NotificationKind::Vote => "vote",
            NotificationKind::Reply => "reply",
            NotificationKind::Follow => "follow",
            NotificationKind::Transfer => "transfer",
            NotificationKind::Reblog => "reblog",
        }
    }
}

struct NotificationRow {
    idx: u64,
    dst: String,
    src: String,
    kind: NotificationKind,
    permlink: String,
}

pub struct NotificationsCache {
    core: CacheCore,
    state: Mutex<HashMap<u64, Vec<NotificationRow>>>,
    /// Rows older than this many blocks are pruned at maintenance boundaries.
    retention_blocks: Option<u64>,
}

impl NotificationsCache {
    pub fn new(retention_blocks: Option<u64>) -> Self {
        Self { core: CacheCore::new("notifications"), state: Mutex::new(HashMap::new()), retention_blocks }
    }

    pub fn register(
        &self,
        dst: &str,
        src: &str,
        kind: NotificationKind,
        permlink: &str,
        block_n: u64,
    ) -> Result<(), CacheError> {
        if dst.is_empty() || dst == src {
            return Ok(());
        }
        self.core.check_register()?;
        let mut state = self.state.lock().expect("notifications cache lock");
        let rows = state.entry(block_n).or_default();
        rows.push(NotificationRow {
            idx: rows.len() as u64,
            dst: dst.to_string(),
            src: src.to_string(),
            kind,
            permlink: permlink.to_string(),
        });
        Ok(())
    }

    pub fn retention_blocks(&self) -> Option<u64> {
        self.retention_blocks
    }

    fn build_batch(&self) -> WriteBatch {
        let mut batch = WriteBatch::upsert("notifications", &["block_num", "idx"], &[
            "block_num",
            "idx",
            "dst_account",
            "src_account",
            "kind",
            "permlink",
        ]);
        for (block_n, rows) in self.state.lock().expect("notifications cache lock").iter() {
            for row in rows {
                batch.push_row(vec![
                    Value::UInt(*block_n),
                    Value::UInt(row.idx),
                    Value::Text(row.dst.clone()),
                    Value::Text(row.src.clone()),
                    Value::Text(row.kind.as_str().to_string()),
                    Value::Text(row.permlink.clone()),
                ]);
            }
        }
        batch
    }
}

#[async_trait::async_trait]
impl EntityCache for NotificationsCache {
    fn name(&self) -> &'static str {
        self.core.name()
    }

    fn phase(&self) -> FlushPhase {
        FlushPhase::Dependent
    }

    fn pending(&self) -> usize {
        self.state.lock().expect("notifications cache lock").values().map(Vec::len).sum()
    }

    async fn flush(&self, conn: &mut (dyn StoreConnection + '_)) -> Result<u64, CacheError> {
        let _window = self.core.begin_flush()?;
        apply_batches(conn, &[self.build_batch()]).await
    }

    fn mark_flushed(&self) {
        self.state.lock().expect("notifications cache lock").clear();
    }

    fn discard_from(&self, block_n: u64) {
        self.state.lock().expect("notifications cache lock").retain(|b, _| *b < block_n);
    }

    fn clear(&self) {
        self.mark_flushed();
    }
}

/// Account reputations. Effective votes carry rshares deltas; the flush adds
/// them onto the stored total.
///
/// The stored `last_block` is a per-account watermark: a delta whose window
/// is already covered by it has been applied and is skipped, so replaying a
/// window after a crash converges instead of double-counting.
pub struct ReputationsCache {
    core: CacheCore,
    deltas: Mutex<HashMap<String, (i64, u64)>>,
    /// Stored (total, last_block) pairs read back during earlier flushes.
    /// Never authoritative, a miss falls back to the store. Updated only
    /// after the enclosing transaction commits.
    totals: Mutex<LookupCache<(i64, u64)>>,
    staged_totals: Mutex<Vec<(String, (i64, u64))>>,
}

impl ReputationsCache {
    pub fn new() -> Self {
        Self {
            core: CacheCore::new("reputations"),
            deltas: Mutex::new(HashMap::new()),
            totals: Mutex::new(LookupCache::new(REPUTATION_LOOKUP_CAPACITY)),
            staged_totals: Mutex::new(Vec::new()),
        }
    }

    /// A downvote from a lower-reputation voter does not damage reputation.
    /// That policy lives in the processor, this just accumulates.
    pub fn register_delta(&self, account: &str, rshares: i64, block_n: u64) -> Result<(), CacheError> {
        self.core.check_register()?;
        let mut deltas = self.deltas.lock().expect("reputations cache lock");
        let entry = deltas.entry(account.to_string()).or_insert((0, 0));
        entry.0 += rshares;
        entry.1 = entry.1.max(block_n);
        Ok(())
    }
}

impl Default for ReputationsCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl EntityCache for ReputationsCache {
    fn name(&self) -> &'static str {
        self.core.name()
    }

    fn phase(&self) -> FlushPhase {
        FlushPhase::Dependent
    }

    fn pending(&self) -> usize {
        self.deltas.lock().expect("reputations cache lock").len()
    }

    async fn flush(&self, conn: &mut (dyn StoreConnection + '_)) -> Result<u64, CacheError> {
        let _window = self.core.begin_flush()?;
        let snapshot: Vec<(String, i64, u64)> = self
            .deltas
            .lock()
            .expect("reputations cache lock")
            .iter()
            .map(|(name, (delta, seen))| (name.clone(), *delta, *seen))
            .collect();

        let mut batch = WriteBatch::upsert("reputations", &["account"], &["account", "rshares", "last_block"]);
        let mut staged = Vec::with_capacity(snapshot.len());
        for (account, delta, seen) in snapshot {
            // The guard must drop before the store read-back below.
            let cached = self.totals.lock().expect("reputations cache lock").get(&account);
            let (existing, applied_until) = match cached {
                Some(pair) => pair,
                None => conn
                    .get_row("reputations", &[Value::Text(account.clone())])
                    .await?
                    .map(|row| {
                        (
                            row.get("rshares").and_then(Value::as_i64).unwrap_or(0),
                            row.get("last_block").and_then(Value::as_u64).unwrap_or(0),
                        )
                    })
                    .unwrap_or((0, 0)),
            };
            // A watermark at or past this window means the delta is already
            // in the stored total: this flush is a replay.
            let total = if applied_until >= seen { existing } else { existing + delta };
            let last = applied_until.max(seen);
            staged.push((account.clone(), (total, last)));
            batch.push_row(vec![Value::Text(account), Value::Int(total), Value::UInt(last)]);
        }
        *self.staged_totals.lock().expect("reputations cache lock") = staged;
        apply_batches(conn, &[batch]).await
    }

    fn mark_flushed(&self) {
        self.deltas.lock().expect("reputations cache lock").clear();
        let staged = std::mem::take(&mut *self.staged_totals.lock().expect("reputations cache lock"));
        let mut totals = self.totals.lock().expect("reputations cache lock");
        for (account, pair) in staged {
            totals.insert(account, pair);
        }
    }

    fn discard_from(&self, block_n: u64) {
        // Deltas are not attributable to single blocks once merged. A rewind
        // inside the window drops any account first touched in it.
        self.deltas.lock().expect("reputations cache lock").retain(|_, (_, b)| *b < block_n);
        self.staged_totals.lock().expect("reputations cache lock").clear();
    }

    fn clear(&self) {
        self.deltas.lock().expect("reputations cache lock").clear();
        // Uncommitted totals from an abandoned flush must not enter the
        // lookup cache.
        self.staged_totals.lock().expect("reputations cache lock").clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ac_db::{MemStore, Store};

    #[tokio::test]
    async fn reputation_deltas_accumulate_across_flushes() {
        let store = MemStore::default();
        let cache = ReputationsCache::new();
        let mut conn = store.connection().await.unwrap();

        cache.register_delta("alice", 100, 1).unwrap();
        cache.flush(&mut *conn).await.unwrap();
        cache.mark_flushed();

        cache.register_delta("alice", -30, 2).unwrap();
        cache.flush(&mut *conn).await.unwrap();
        cache.mark_flushed();

        let row = conn.get_row("reputations", &["alice".into()]).await.unwrap().unwrap();
        assert_eq!(row.get("rshares"), Some(&Value::Int(70)));
    }

    #[tokio::test]
    async fn replayed_window_does_not_double_apply_deltas() {
        let store = MemStore::default();
        let mut conn = store.connection().await.unwrap();

        let cache = ReputationsCache::new();
        cache.register_delta("alice", 100, 5).unwrap();
        cache.flush(&mut *conn).await.unwrap();
        cache.mark_flushed();

        // The reputation rows committed but the block anchor did not, so a
        // restart reprocesses the same window with a fresh cache.
        let cache = ReputationsCache::new();
        cache.register_delta("alice", 100, 5).unwrap();
        cache.flush(&mut *conn).await.unwrap();
        cache.mark_flushed();

        let row = conn.get_row("reputations", &["alice".into()]).await.unwrap().unwrap();
        assert_eq!(row.get("rshares"), Some(&Value::Int(100)));
        assert_eq!(row.get("last_block"), Some(&Value::UInt(5)));
    }

    #[tokio::test]
    async fn failed_flush_keeps_pending_rows_for_retry() {
        let store = MemStore::default();
        let cache = NotificationsCache::new(None);
        let mut conn = store.connection().await.unwrap();

        cache.register("bob", "alice", NotificationKind::Vote, "post", 5).unwrap();
        conn.begin().await.unwrap();
        cache.flush(&mut *conn).await.unwrap();
        conn.rollback().await.unwrap();

        // Not marked flushed: the rows are still pending and a retry lands them.
        assert_eq!(cache.pending(), 1);
        cache.flush(&mut *conn).await.unwrap();
        cache.mark_flushed();
        assert_eq!(cache.pending(), 0);
        assert!(conn
            .get_row("notifications", &[Value::UInt(5), Value::UInt(0)])
            .await
            .unwrap()
            .is_some());
    }
}
