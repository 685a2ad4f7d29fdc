//! Entity caches.
//!
//! The processor never writes to the store directly. It registers rows into
//! per-entity caches, and the flush coordinator drains them at range
//! boundaries. A cache keeps its pending rows until [`EntityCache::mark_flushed`],
//! so a failed flush can be retried: rows are keyed, re-applying them
//! converges to the same state.
//!
//! Registering into a cache while its flush is writing is a hard error, it
//! means block processing overlapped a flush window.

use ac_db::{StorageError, StoreConnection, WriteBatch};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

mod accounts;
mod blocks;
mod notifications;
mod payments;
mod posts;
mod social;
mod votes;

pub use accounts::AccountsCache;
pub use blocks::BlocksCache;
pub use notifications::{NotificationKind, NotificationsCache, ReputationsCache};
pub use payments::{PaymentKind, PaymentsCache};
pub use posts::{PostDataCache, PostsCache};
pub use social::{FollowState, FollowsCache, ReblogsCache, SubscriptionsCache};
pub use votes::VotesCache;

#[derive(thiserror::Error, Debug)]
pub enum CacheError {
    #[error("Cache `{0}` received a registration during its flush window")]
    RegisterDuringFlush(&'static str),
    #[error("Cache `{0}` flush was re-entered")]
    FlushReentered(&'static str),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Bulk flushes run in two waves: caches whose rows reference nothing else,
/// then caches that reference rows written by the first wave.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlushPhase {
    Independent,
    Dependent,
}

#[async_trait::async_trait]
pub trait EntityCache: Send + Sync {
    fn name(&self) -> &'static str;

    fn phase(&self) -> FlushPhase {
        FlushPhase::Independent
    }

    /// Pending rows awaiting flush.
    fn pending(&self) -> usize;

    /// Write the pending rows through `conn`. Pending state is retained until
    /// [`Self::mark_flushed`], the coordinator calls it once the enclosing
    /// transaction has committed.
    async fn flush(&self, conn: &mut (dyn StoreConnection + '_)) -> Result<u64, CacheError>;

    /// Forget the pending rows that were written by the last `flush`.
    fn mark_flushed(&self);

    /// Drop pending rows registered at or above `block_n` (micro fork rewind).
    fn discard_from(&self, block_n: u64);

    /// Drop all pending rows.
    fn clear(&self);
}

/// Flush/registration exclusion shared by every cache.
pub(crate) struct CacheCore {
    name: &'static str,
    inside_flush: AtomicBool,
}

impl CacheCore {
    pub(crate) fn new(name: &'static str) -> Self {
        Self { name, inside_flush: AtomicBool::new(false) }
    }

    pub(crate) fn name(&self) -> &'static str {
        self.name
    }

    pub(crate) fn check_register(&self) -> Result<(), CacheError> {
        if self.inside_flush.load(Ordering::Acquire) {
            return Err(CacheError::RegisterDuringFlush(self.name));
        }
        Ok(())
    }

    pub(crate) fn begin_flush(&self) -> Result<FlushWindow<'_>, CacheError> {
        if self.inside_flush.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_err() {
            return Err(CacheError::FlushReentered(self.name));
        }
        Ok(FlushWindow(&self.inside_flush))
    }
}

#[derive(Debug)]
pub(crate) struct FlushWindow<'a>(&'a AtomicBool);

impl Drop for FlushWindow<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub(crate) async fn apply_batches(
    conn: &mut (dyn StoreConnection + '_),
    batches: &[WriteBatch],
) -> Result<u64, CacheError> {
    let mut rows = 0;
    for batch in batches {
        if !batch.is_empty() {
            rows += conn.apply(batch).await?;
        }
    }
    Ok(rows)
}

/// Every entity cache of the pipeline, shared between the processor and the
/// flush coordinator.
#[derive(Clone)]
pub struct CacheRegistry {
    pub blocks: Arc<BlocksCache>,
    pub accounts: Arc<AccountsCache>,
    pub posts: Arc<PostsCache>,
    pub post_data: Arc<PostDataCache>,
    pub votes: Arc<VotesCache>,
    pub follows: Arc<FollowsCache>,
    pub reblogs: Arc<ReblogsCache>,
    pub subscriptions: Arc<SubscriptionsCache>,
    pub payments: Arc<PaymentsCache>,
    pub notifications: Arc<NotificationsCache>,
    pub reputations: Arc<ReputationsCache>,
}

impl Default for CacheRegistry {
    fn default() -> Self {
        Self::new(None)
    }
}

impl CacheRegistry {
    pub fn new(notification_retention: Option<u64>) -> Self {
        Self {
            blocks: Arc::new(BlocksCache::new()),
            accounts: Arc::new(AccountsCache::new()),
            posts: Arc::new(PostsCache::new()),
            post_data: Arc::new(PostDataCache::new()),
            votes: Arc::new(VotesCache::new()),
            follows: Arc::new(FollowsCache::new()),
            reblogs: Arc::new(ReblogsCache::new()),
            subscriptions: Arc::new(SubscriptionsCache::new()),
            payments: Arc::new(PaymentsCache::new()),
            notifications: Arc::new(NotificationsCache::new(notification_retention)),
            reputations: Arc::new(ReputationsCache::new()),
        }
    }

    /// Every cache except blocks, which anchors the flush and goes last.
    pub fn entity_caches(&self) -> Vec<Arc<dyn EntityCache>> {
        vec![
            self.accounts.clone(),
            self.posts.clone(),
            self.post_data.clone(),
            self.votes.clone(),
            self.follows.clone(),
            self.reblogs.clone(),
            self.subscriptions.clone(),
            self.payments.clone(),
            self.notifications.clone(),
            self.reputations.clone(),
        ]
    }

    pub fn all_caches(&self) -> Vec<Arc<dyn EntityCache>> {
        let mut caches = self.entity_caches();
        caches.push(self.blocks.clone());
        caches
    }

    pub fn pending_total(&self) -> usize {
        self.all_caches().iter().map(|c| c.pending()).sum()
    }

    pub fn discard_from(&self, block_n: u64) {
        for cache in self.all_caches() {
            cache.discard_from(block_n);
        }
    }

    pub fn clear(&self) {
        for cache in self.all_caches() {
            cache.clear();
        }
    }
}

/// Fixed-point token amount in thousandths, from strings like `"1.234 COIN"`.
/// Malformed amounts count as zero rather than aborting the block.
pub(crate) fn parse_amount(s: &str) -> (i64, String) {
    let mut parts = s.split_whitespace();
    let number = parts.next().unwrap_or("0");
    let token = parts.next().unwrap_or("").to_string();

    let (int_part, frac_part) = match number.split_once('.') {
        Some((i, f)) => (i, f),
        None => (number, ""),
    };
    let negative = int_part.starts_with('-');
    let int: i64 = int_part.parse().unwrap_or(0);
    let mut frac: i64 = frac_part.chars().take(3).collect::<String>().parse().unwrap_or(0);
    for _ in frac_part.len().min(3)..3 {
        frac *= 10;
    }
    let millis = int * 1000 + if negative { -frac } else { frac };
    (millis, token)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn registration_is_rejected_inside_a_flush_window() {
        let core = CacheCore::new("votes");
        assert!(core.check_register().is_ok());

        let window = core.begin_flush().unwrap();
        assert_matches!(core.check_register(), Err(CacheError::RegisterDuringFlush("votes")));
        assert_matches!(core.begin_flush(), Err(CacheError::FlushReentered("votes")));

        drop(window);
        assert!(core.check_register().is_ok());
        assert!(core.begin_flush().is_ok());
    }

    #[test]
    fn amount_parsing() {
        assert_eq!(parse_amount("1.234 COIN"), (1234, "COIN".to_string()));
        assert_eq!(parse_amount("0.001 TBD"), (1, "TBD".to_string()));
        assert_eq!(parse_amount("12 VESTS"), (12000, "VESTS".to_string()));
        assert_eq!(parse_amount("-0.5 TBD"), (-500, "TBD".to_string()));
        assert_eq!(parse_amount("garbage"), (0, String::new()));
    }
}
