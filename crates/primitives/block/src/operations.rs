//! Wire-level operations and their classification.
//!
//! Upstream delivers operations as a `{ "type": ..., "value": ... }` pair. The
//! pipeline keeps that shape until dispatch time, where [`Operation::classify`]
//! turns it into a closed [`OperationKind`]. Classification is total: every
//! type the upstream can emit maps to a known variant or to
//! [`OperationKind::Unknown`], never to a silent fallthrough.

use serde::{Deserialize, Serialize};

#[derive(thiserror::Error, Debug)]
pub enum OperationError {
    #[error("malformed `{ty}` payload: {source}")]
    Payload {
        ty: String,
        #[source]
        source: serde_json::Error,
    },
}

/// A user-submitted operation, as received from upstream.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    #[serde(rename = "type")]
    pub ty: String,
    pub value: serde_json::Value,
}

/// A chain-emitted side effect (reward payout, effective vote, ...) attributed
/// to a block but not submitted by any user.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VirtualOperation {
    #[serde(rename = "type")]
    pub ty: String,
    pub value: serde_json::Value,
}

/// An ordered group of operations sharing one signature envelope.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub operations: Vec<Operation>,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct VoteOp {
    pub voter: String,
    pub author: String,
    pub permlink: String,
    pub weight: i32,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct CommentOp {
    pub parent_author: String,
    pub parent_permlink: String,
    pub author: String,
    pub permlink: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub json_metadata: String,
}

impl CommentOp {
    /// Top-level posts have an empty parent author; everything else is a reply.
    pub fn is_root_post(&self) -> bool {
        self.parent_author.is_empty()
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct DeleteCommentOp {
    pub author: String,
    pub permlink: String,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct TransferOp {
    pub from: String,
    pub to: String,
    pub amount: String,
    #[serde(default)]
    pub memo: String,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct CustomJsonOp {
    #[serde(default)]
    pub required_auths: Vec<String>,
    #[serde(default)]
    pub required_posting_auths: Vec<String>,
    pub id: String,
    pub json: String,
}

impl CustomJsonOp {
    /// The account the payload acts on behalf of: the first posting auth, or
    /// the first active auth when no posting auth is present.
    pub fn actor(&self) -> Option<&str> {
        self.required_posting_auths
            .first()
            .or_else(|| self.required_auths.first())
            .map(String::as_str)
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct AccountCreateOp {
    pub new_account_name: String,
    pub creator: String,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct AccountUpdateOp {
    pub account: String,
    #[serde(default)]
    pub json_metadata: String,
}

/// Closed classification of user-submitted operation types.
#[derive(Clone, Debug, PartialEq)]
pub enum OperationKind {
    Vote(VoteOp),
    Comment(CommentOp),
    DeleteComment(DeleteCommentOp),
    Transfer(TransferOp),
    CustomJson(CustomJsonOp),
    AccountCreate(AccountCreateOp),
    AccountUpdate(AccountUpdateOp),
    /// A type with no indexing relevance. Counted by the processor, never fatal.
    Unknown,
}

impl Operation {
    pub fn classify(&self) -> Result<OperationKind, OperationError> {
        fn parse<T: serde::de::DeserializeOwned>(op: &Operation) -> Result<T, OperationError> {
            serde_json::from_value(op.value.clone())
                .map_err(|source| OperationError::Payload { ty: op.ty.clone(), source })
        }

        // Both the bare type name and the `_operation`-suffixed form appear on
        // the wire depending on the upstream API version.
        let kind = match self.ty.trim_end_matches("_operation") {
            "vote" => OperationKind::Vote(parse(self)?),
            "comment" => OperationKind::Comment(parse(self)?),
            "delete_comment" => OperationKind::DeleteComment(parse(self)?),
            "transfer" => OperationKind::Transfer(parse(self)?),
            "custom_json" => OperationKind::CustomJson(parse(self)?),
            "account_create" | "create_claimed_account" => OperationKind::AccountCreate(parse(self)?),
            "account_update" | "account_update2" => OperationKind::AccountUpdate(parse(self)?),
            _ => OperationKind::Unknown,
        };
        Ok(kind)
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct AuthorRewardVop {
    pub author: String,
    pub permlink: String,
    #[serde(default)]
    pub stable_payout: String,
    #[serde(default)]
    pub token_payout: String,
    #[serde(default)]
    pub vesting_payout: String,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct CurationRewardVop {
    pub curator: String,
    #[serde(rename = "comment_author", alias = "author")]
    pub author: String,
    #[serde(rename = "comment_permlink", alias = "permlink")]
    pub permlink: String,
    #[serde(default)]
    pub reward: String,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct CommentRewardVop {
    pub author: String,
    pub permlink: String,
    #[serde(default)]
    pub payout: String,
    #[serde(default)]
    pub total_payout_value: String,
    #[serde(default)]
    pub curator_payout_value: String,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct CommentPayoutUpdateVop {
    pub author: String,
    pub permlink: String,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct EffectiveCommentVoteVop {
    pub voter: String,
    pub author: String,
    pub permlink: String,
    #[serde(default)]
    pub weight: u64,
    #[serde(default)]
    pub rshares: i64,
    #[serde(default)]
    pub pending_payout: String,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct IneffectiveDeleteCommentVop {
    pub author: String,
    pub permlink: String,
}

/// Closed classification of chain-emitted virtual operation types.
#[derive(Clone, Debug, PartialEq)]
pub enum VirtualOpKind {
    AuthorReward(AuthorRewardVop),
    CurationReward(CurationRewardVop),
    CommentReward(CommentRewardVop),
    CommentPayoutUpdate(CommentPayoutUpdateVop),
    EffectiveCommentVote(EffectiveCommentVoteVop),
    IneffectiveDeleteComment(IneffectiveDeleteCommentVop),
    /// Chain bookkeeping with no derived-data impact (interest, fills, ...).
    Ignored,
}

impl VirtualOperation {
    pub fn classify(&self) -> Result<VirtualOpKind, OperationError> {
        fn parse<T: serde::de::DeserializeOwned>(vop: &VirtualOperation) -> Result<T, OperationError> {
            serde_json::from_value(vop.value.clone())
                .map_err(|source| OperationError::Payload { ty: vop.ty.clone(), source })
        }

        let kind = match self.ty.trim_end_matches("_operation") {
            "author_reward" => VirtualOpKind::AuthorReward(parse(self)?),
            "curation_reward" => VirtualOpKind::CurationReward(parse(self)?),
            "comment_reward" => VirtualOpKind::CommentReward(parse(self)?),
            "comment_payout_update" => VirtualOpKind::CommentPayoutUpdate(parse(self)?),
            "effective_comment_vote" => VirtualOpKind::EffectiveCommentVote(parse(self)?),
            "ineffective_delete_comment" => VirtualOpKind::IneffectiveDeleteComment(parse(self)?),
            _ => VirtualOpKind::Ignored,
        };
        Ok(kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    fn op(ty: &str, value: serde_json::Value) -> Operation {
        Operation { ty: ty.into(), value }
    }

    #[test]
    fn classify_vote() {
        let op = op("vote", json!({"voter": "alice", "author": "bob", "permlink": "hello", "weight": 10000}));
        assert_matches!(op.classify(), Ok(OperationKind::Vote(v)) => {
            assert_eq!(v.voter, "alice");
            assert_eq!(v.weight, 10000);
        });
    }

    #[test]
    fn classify_accepts_suffixed_type_names() {
        let op = op("vote_operation", json!({"voter": "a", "author": "b", "permlink": "p", "weight": 1}));
        assert_matches!(op.classify(), Ok(OperationKind::Vote(_)));
    }

    #[test]
    fn classify_unknown_is_not_an_error() {
        let op = op("witness_update", json!({"owner": "w"}));
        assert_matches!(op.classify(), Ok(OperationKind::Unknown));
    }

    #[test]
    fn classify_malformed_payload_is_an_error() {
        let op = op("vote", json!({"voter": 42}));
        assert_matches!(op.classify(), Err(OperationError::Payload { ty, .. }) => assert_eq!(ty, "vote"));
    }

    #[test]
    fn classify_effective_vote() {
        let vop = VirtualOperation {
            ty: "effective_comment_vote_operation".into(),
            value: json!({"voter": "alice", "author": "bob", "permlink": "p", "rshares": -123, "weight": 7}),
        };
        assert_matches!(vop.classify(), Ok(VirtualOpKind::EffectiveCommentVote(v)) => {
            assert_eq!(v.rshares, -123);
        });
    }

    #[test]
    fn comment_root_post_detection() {
        let root = CommentOp {
            parent_author: "".into(),
            parent_permlink: "general".into(),
            author: "a".into(),
            permlink: "p".into(),
            title: String::new(),
            body: String::new(),
            json_metadata: String::new(),
        };
        assert!(root.is_root_post());
    }

    #[test]
    fn custom_json_actor_prefers_posting_auth() {
        let op = CustomJsonOp {
            required_auths: vec!["active".into()],
            required_posting_auths: vec!["posting".into()],
            id: "follow".into(),
            json: "[]".into(),
        };
        assert_eq!(op.actor(), Some("posting"));
    }
}
