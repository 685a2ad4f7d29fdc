//! Operation dispatch.
//!
//! One block in, cache registrations out. Dispatch is total: every operation
//! type either lands in a cache or increments the unknown counter. A payload
//! that fails to decode for a known type aborts the block, the schema
//! drifted and indexing further would corrupt derived data. The exception is
//! `custom_json`: its inner payload is user-controlled free text, malformed
//! ones are skipped.

use crate::caches::{CacheError, CacheRegistry, FollowState, NotificationKind, PaymentKind};
use ap_block::{
    BlockSource, CustomJsonOp, OperationError, OperationKind, VirtualOpKind,
};
use serde::Deserialize;

#[derive(thiserror::Error, Debug)]
pub enum ProcessorError {
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error("Block {block_n}: {source}")]
    Operation {
        block_n: u64,
        #[source]
        source: OperationError,
    },
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BlockStats {
    pub transactions: usize,
    pub operations: usize,
    pub unknown_operations: usize,
}

pub struct BlockProcessor {
    caches: CacheRegistry,
}

/// Inner payloads of `custom_json`. The json field holds a
/// `["<action>", {...}]` pair.
#[derive(Deserialize)]
struct FollowPayload {
    follower: String,
    following: String,
    #[serde(default)]
    what: Vec<String>,
}

#[derive(Deserialize)]
struct ReblogPayload {
    account: String,
    author: String,
    permlink: String,
    #[serde(default)]
    delete: Option<String>,
}

#[derive(Deserialize)]
struct SubscribePayload {
    community: String,
}

#[derive(Deserialize)]
struct LastReadPayload {
    date: String,
}

impl BlockProcessor {
    pub fn new(caches: CacheRegistry) -> Self {
        Self { caches }
    }

    pub fn process(&self, block: &BlockSource) -> Result<BlockStats, ProcessorError> {
        let block_n = block.number();
        let mut stats = BlockStats::default();

        self.caches.blocks.register(block)?;

        for tx in block.transactions() {
            stats.transactions += 1;
            for op in &tx.operations {
                stats.operations += 1;
                let kind =
                    op.classify().map_err(|source| ProcessorError::Operation { block_n, source })?;
                if !self.dispatch(kind, block_n)? {
                    stats.unknown_operations += 1;
                }
            }
        }

        for vop in block.virtual_operations() {
            let kind = vop.classify().map_err(|source| ProcessorError::Operation { block_n, source })?;
            self.dispatch_virtual(kind, block_n)?;
        }

        Ok(stats)
    }

    /// Returns false for operations with no indexing relevance.
    fn dispatch(&self, kind: OperationKind, block_n: u64) -> Result<bool, ProcessorError> {
        let caches = &self.caches;
        match kind {
            OperationKind::Vote(op) => {
                caches.votes.register_vote(&op.voter, &op.author, &op.permlink, op.weight, block_n)?;
                caches.accounts.touch(&op.voter, block_n)?;
                caches.notifications.register(&op.author, &op.voter, NotificationKind::Vote, &op.permlink, block_n)?;
            }
            OperationKind::Comment(op) => {
                caches.posts.register_comment(&op, block_n)?;
                caches.post_data.register(&op, block_n)?;
                caches.accounts.touch(&op.author, block_n)?;
                if !op.is_root_post() {
                    caches.notifications.register(
                        &op.parent_author,
                        &op.author,
                        NotificationKind::Reply,
                        &op.permlink,
                        block_n,
                    )?;
                }
            }
            OperationKind::DeleteComment(op) => {
                caches.posts.register_deleted(&op.author, &op.permlink, block_n)?;
            }
            OperationKind::Transfer(op) => {
                caches.payments.register(PaymentKind::Transfer, &op.from, &op.to, &op.amount, &op.memo, block_n)?;
                caches.accounts.touch(&op.from, block_n)?;
                caches.accounts.touch(&op.to, block_n)?;
                caches.notifications.register(&op.to, &op.from, NotificationKind::Transfer, "", block_n)?;
            }
            OperationKind::CustomJson(op) => self.dispatch_custom_json(&op, block_n)?,
            OperationKind::AccountCreate(op) => {
                caches.accounts.register_created(&op.new_account_name, &op.creator, block_n)?;
            }
            OperationKind::AccountUpdate(op) => {
                caches.accounts.register_metadata(&op.account, &op.json_metadata, block_n)?;
            }
            OperationKind::Unknown => return Ok(false),
        }
        Ok(true)
    }

    fn dispatch_custom_json(&self, op: &CustomJsonOp, block_n: u64) -> Result<(), ProcessorError> {
        let Some(actor) = op.actor() else {
            tracing::debug!("Block {block_n}: custom_json `{}` with no auths, skipping", op.id);
            return Ok(());
        };
        let actor = actor.to_string();
        self.caches.accounts.touch(&actor, block_n)?;

        if !matches!(op.id.as_str(), "follow" | "reblog" | "community" | "notify") {
            // Other ids (app-specific payloads) are not indexed.
            return Ok(());
        }

        let parsed: Result<(String, serde_json::Value), _> = serde_json::from_str(&op.json);
        let Ok((action, payload)) = parsed else {
            tracing::debug!("Block {block_n}: malformed custom_json from `{actor}`, skipping");
            return Ok(());
        };

        match (op.id.as_str(), action.as_str()) {
            ("follow", "follow") => {
                let Ok(follow) = serde_json::from_value::<FollowPayload>(payload) else {
                    tracing::debug!("Block {block_n}: malformed follow payload from `{actor}`, skipping");
                    return Ok(());
                };
                // Only the posting authority holder may change their own edges.
                if follow.follower != actor {
                    tracing::debug!("Block {block_n}: `{actor}` tried to follow as `{}`", follow.follower);
                    return Ok(());
                }
                let Some(state) = FollowState::from_what(&follow.what) else {
                    return Ok(());
                };
                self.caches.follows.register(&follow.follower, &follow.following, state, block_n)?;
                if state == FollowState::Blog {
                    self.caches.notifications.register(
                        &follow.following,
                        &follow.follower,
                        NotificationKind::Follow,
                        "",
                        block_n,
                    )?;
                }
            }
            ("reblog", "reblog") => {
                let Ok(reblog) = serde_json::from_value::<ReblogPayload>(payload) else {
                    tracing::debug!("Block {block_n}: malformed reblog payload from `{actor}`, skipping");
                    return Ok(());
                };
                if reblog.account != actor {
                    return Ok(());
                }
                let active = reblog.delete.as_deref() != Some("delete");
                self.caches.reblogs.register(&reblog.account, &reblog.author, &reblog.permlink, active, block_n)?;
                if active {
                    self.caches.notifications.register(
                        &reblog.author,
                        &reblog.account,
                        NotificationKind::Reblog,
                        &reblog.permlink,
                        block_n,
                    )?;
                }
            }
            ("community", "subscribe") | ("community", "unsubscribe") => {
                let Ok(sub) = serde_json::from_value::<SubscribePayload>(payload) else {
                    tracing::debug!("Block {block_n}: malformed community payload from `{actor}`, skipping");
                    return Ok(());
                };
                self.caches.subscriptions.register(&actor, &sub.community, action == "subscribe", block_n)?;
            }
            ("notify", "setLastRead") => {
                let Ok(read) = serde_json::from_value::<LastReadPayload>(payload) else {
                    tracing::debug!("Block {block_n}: malformed notify payload from `{actor}`, skipping");
                    return Ok(());
                };
                self.caches.accounts.register_notifications_read(&actor, &read.date, block_n)?;
            }
            _ => {}
        }
        Ok(())
    }

    fn dispatch_virtual(&self, kind: VirtualOpKind, block_n: u64) -> Result<(), ProcessorError> {
        let caches = &self.caches;
        match kind {
            VirtualOpKind::AuthorReward(vop) => {
                caches.posts.register_payout(&vop.author, &vop.permlink, &vop.stable_payout, block_n)?;
                caches.payments.register(
                    PaymentKind::AuthorReward,
                    "",
                    &vop.author,
                    &vop.stable_payout,
                    "",
                    block_n,
                )?;
            }
            VirtualOpKind::CurationReward(vop) => {
                caches.payments.register(PaymentKind::CurationReward, "", &vop.curator, &vop.reward, "", block_n)?;
            }
            VirtualOpKind::CommentReward(vop) => {
                caches.posts.register_payout(&vop.author, &vop.permlink, &vop.payout, block_n)?;
            }
            VirtualOpKind::CommentPayoutUpdate(vop) => {
                caches.posts.register_paid(&vop.author, &vop.permlink, block_n)?;
            }
            VirtualOpKind::EffectiveCommentVote(vop) => {
                caches.votes.register_effective(&vop.voter, &vop.author, &vop.permlink, vop.rshares, block_n)?;
                caches.reputations.register_delta(&vop.author, vop.rshares, block_n)?;
            }
            VirtualOpKind::IneffectiveDeleteComment(vop) => {
                caches.posts.register_undeleted(&vop.author, &vop.permlink, block_n)?;
            }
            VirtualOpKind::Ignored => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caches::EntityCache;
    use ap_block::{MockBlock, Operation, Transaction};
    use serde_json::json;

    fn block_with_ops(block_n: u64, ops: Vec<Operation>) -> BlockSource {
        BlockSource::Mock(MockBlock {
            block_num: block_n,
            transactions: vec![Transaction { operations: ops }],
            ..Default::default()
        })
    }

    fn op(ty: &str, value: serde_json::Value) -> Operation {
        Operation { ty: ty.into(), value }
    }

    #[test]
    fn unknown_operations_are_counted_not_fatal() {
        let caches = CacheRegistry::default();
        let processor = BlockProcessor::new(caches.clone());

        let block = block_with_ops(7, vec![
            op("witness_update", json!({"owner": "w"})),
            op("vote", json!({"voter": "a", "author": "b", "permlink": "p", "weight": 100})),
        ]);
        let stats = processor.process(&block).unwrap();
        assert_eq!(stats.operations, 2);
        assert_eq!(stats.unknown_operations, 1);
        assert_eq!(caches.votes.pending(), 1);
    }

    #[test]
    fn malformed_known_operation_is_fatal() {
        let processor = BlockProcessor::new(CacheRegistry::default());
        let block = block_with_ops(9, vec![op("vote", json!({"voter": 12}))]);
        assert_matches::assert_matches!(
            processor.process(&block),
            Err(ProcessorError::Operation { block_n: 9, .. })
        );
    }

    #[test]
    fn malformed_custom_json_is_skipped() {
        let caches = CacheRegistry::default();
        let processor = BlockProcessor::new(caches.clone());
        let block = block_with_ops(3, vec![op("custom_json", json!({
            "required_auths": [],
            "required_posting_auths": ["alice"],
            "id": "follow",
            "json": "{not json at all",
        }))]);
        let stats = processor.process(&block).unwrap();
        assert_eq!(stats.unknown_operations, 0);
        assert_eq!(caches.follows.pending(), 0);
    }

    #[test]
    fn follow_custom_json_reaches_the_follows_cache() {
        let caches = CacheRegistry::default();
        let processor = BlockProcessor::new(caches.clone());
        let json = serde_json::to_string(&json!(["follow", {
            "follower": "alice", "following": "bob", "what": ["blog"],
        }]))
        .unwrap();
        let block = block_with_ops(4, vec![op("custom_json", json!({
            "required_auths": [],
            "required_posting_auths": ["alice"],
            "id": "follow",
            "json": json,
        }))]);
        processor.process(&block).unwrap();
        assert_eq!(caches.follows.pending(), 1);
        assert_eq!(caches.notifications.pending(), 1);
    }

    #[test]
    fn spoofed_follower_is_rejected() {
        let caches = CacheRegistry::default();
        let processor = BlockProcessor::new(caches.clone());
        let json = serde_json::to_string(&json!(["follow", {
            "follower": "bob", "following": "carol", "what": ["blog"],
        }]))
        .unwrap();
        let block = block_with_ops(4, vec![op("custom_json", json!({
            "required_auths": [],
            "required_posting_auths": ["alice"],
            "id": "follow",
            "json": json,
        }))]);
        processor.process(&block).unwrap();
        assert_eq!(caches.follows.pending(), 0);
    }

    #[test]
    fn community_subscribe_reaches_the_subscriptions_cache() {
        let caches = CacheRegistry::default();
        let processor = BlockProcessor::new(caches.clone());
        let json = serde_json::to_string(&json!(["subscribe", {"community": "group-music"}])).unwrap();
        let block = block_with_ops(5, vec![op("custom_json", json!({
            "required_auths": [],
            "required_posting_auths": ["alice"],
            "id": "community",
            "json": json,
        }))]);
        processor.process(&block).unwrap();
        assert_eq!(caches.subscriptions.pending(), 1);
    }

    #[test]
    fn notify_set_last_read_marks_the_account() {
        let caches = CacheRegistry::default();
        let processor = BlockProcessor::new(caches.clone());
        let json = serde_json::to_string(&json!(["setLastRead", {"date": "2024-01-05T12:00:00"}])).unwrap();
        let block = block_with_ops(6, vec![op("custom_json", json!({
            "required_auths": [],
            "required_posting_auths": ["alice"],
            "id": "notify",
            "json": json,
        }))]);
        processor.process(&block).unwrap();
        assert_eq!(caches.accounts.pending(), 1);
    }

    #[test]
    fn effective_vote_updates_rshares_and_reputation() {
        let caches = CacheRegistry::default();
        let processor = BlockProcessor::new(caches.clone());
        let block = BlockSource::Mock(MockBlock {
            block_num: 12,
            virtual_ops: vec![ap_block::VirtualOperation {
                ty: "effective_comment_vote_operation".into(),
                value: json!({"voter": "a", "author": "b", "permlink": "p", "rshares": 500}),
            }],
            ..Default::default()
        });
        processor.process(&block).unwrap();
        assert_eq!(caches.votes.pending(), 1);
        assert_eq!(caches.reputations.pending(), 1);
    }
}
