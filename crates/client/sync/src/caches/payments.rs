//! Payment rows: user transfers and chain reward payouts. Rows are keyed by
//! (block, index-within-block), reprocessing a block yields the same keys.

use super::{apply_batches, parse_amount, CacheCore, CacheError, EntityCache};
use ac_db::{StoreConnection, Value, WriteBatch};
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PaymentKind {
    Transfer,
    AuthorReward,
    CurationReward,
}

impl PaymentKind {
    fn as_str(self) -> &'static str {
        match self {
            PaymentKind::Transfer => "transfer",
            PaymentKind::AuthorReward => "author_reward",
            PaymentKind::CurationReward => "curation_reward",
        }
    }
}

struct PaymentRow {
    idx: u64,
    kind: PaymentKind,
    from_account: String,
    to_account: String,
    amount_millis: i64,
    token: String,
    memo: String,
}

pub struct PaymentsCache {
    core: CacheCore,
    state: Mutex<HashMap<u64, Vec<PaymentRow>>>,
}

impl PaymentsCache {
    pub fn new() -> Self {
        Self { core: CacheCore::new("payments"), state: Mutex::new(HashMap::new()) }
    }

    pub fn register(
        &self,
        kind: PaymentKind,
        from_account: &str,
        to_account: &str,
        amount: &str,
        memo: &str,
        block_n: u64,
    ) -> Result<(), CacheError> {
        self.core.check_register()?;
        let (amount_millis, token) = parse_amount(amount);
        if amount_millis == 0 {
            return Ok(());
        }
        let mut state = self.state.lock().expect("payments cache lock");
        let rows = state.entry(block_n).or_default();
        rows.push(PaymentRow {
            idx: rows.len() as u64,
            kind,
            from_account: from_account.to_string(),
            to_account: to_account.to_string(),
            amount_millis,
            token,
            memo: memo.to_string(),
        });
        Ok(())
    }

    fn build_batch(&self) -> WriteBatch {
        let mut batch = WriteBatch::upsert("payments", &["block_num", "idx"], &[
            "block_num",
            "idx",
            "kind",
            "from_account",
            "to_account",
            "amount",
            "token",
            "memo",
        ]);
        for (block_n, rows) in self.state.lock().expect("payments cache lock").iter() {
            for row in rows {
                batch.push_row(vec![
                    Value::UInt(*block_n),
                    Value::UInt(row.idx),
                    Value::Text(row.kind.as_str().to_string()),
                    Value::Text(row.from_account.clone()),
                    Value::Text(row.to_account.clone()),
                    Value::Int(row.amount_millis),
                    Value::Text(row.token.clone()),
                    Value::Text(row.memo.clone()),
                ]);
            }
        }
        batch
    }
}

impl Default for PaymentsCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl EntityCache for PaymentsCache {
    fn name(&self) -> &'static str {
        self.core.name()
    }

    fn pending(&self) -> usize {
        self.state.lock().expect("payments cache lock").values().map(Vec::len).sum()
    }

    async fn flush(&self, conn: &mut (dyn StoreConnection + '_)) -> Result<u64, CacheError> {
        let _window = self.core.begin_flush()?;
        apply_batches(conn, &[self.build_batch()]).await
    }

    fn mark_flushed(&self) {
        self.state.lock().expect("payments cache lock").clear();
    }

    fn discard_from(&self, block_n: u64) {
        self.state.lock().expect("payments cache lock").retain(|b, _| *b < block_n);
    }

    fn clear(&self) {
        self.mark_flushed();
    }
}
