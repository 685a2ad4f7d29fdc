//! Account rows, keyed by name. Accounts are a dimension table: they carry no
//! block provenance column and survive fork rollbacks.

use super::{apply_batches, CacheCore, CacheError, EntityCache};
use ac_db::{StoreConnection, Value, WriteBatch};
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Default)]
struct AccountState {
    created_block: Option<u64>,
    creator: Option<String>,
    json_metadata: Option<String>,
    lastread_at: Option<String>,
    last_seen_block: u64,
}

pub struct AccountsCache {
    core: CacheCore,
    state: Mutex<HashMap<String, AccountState>>,
}

impl AccountsCache {
    pub fn new() -> Self {
        Self { core: CacheCore::new("accounts"), state: Mutex::new(HashMap::new()) }
    }

    pub fn register_created(&self, name: &str, creator: &str, block_n: u64) -> Result<(), CacheError> {
        self.core.check_register()?;
        let mut state = self.state.lock().expect("accounts cache lock");
        let entry = state.entry(name.to_string()).or_default();
        entry.created_block = Some(block_n);
        entry.creator = Some(creator.to_string());
        entry.last_seen_block = entry.last_seen_block.max(block_n);
        Ok(())
    }

    pub fn register_metadata(&self, name: &str, json_metadata: &str, block_n: u64) -> Result<(), CacheError> {
        self.core.check_register()?;
        let mut state = self.state.lock().expect("accounts cache lock");
        let entry = state.entry(name.to_string()).or_default();
        entry.json_metadata = Some(json_metadata.to_string());
        entry.last_seen_block = entry.last_seen_block.max(block_n);
        Ok(())
    }

    /// High-water mark up to which the account has read its notifications,
    /// from `notify` setLastRead payloads.
    pub fn register_notifications_read(&self, name: &str, date: &str, block_n: u64) -> Result<(), CacheError> {
        self.core.check_register()?;
        let mut state = self.state.lock().expect("accounts cache lock");
        let entry = state.entry(name.to_string()).or_default();
        entry.lastread_at = Some(date.to_string());
        entry.last_seen_block = entry.last_seen_block.max(block_n);
        Ok(())
    }

    /// Any activity attributed to an account marks it seen, so the row exists
    /// even when the account predates the sync start.
    pub fn touch(&self, name: &str, block_n: u64) -> Result<(), CacheError> {
        if name.is_empty() {
            return Ok(());
        }
        self.core.check_register()?;
        let mut state = self.state.lock().expect("accounts cache lock");
        let entry = state.entry(name.to_string()).or_default();
        entry.last_seen_block = entry.last_seen_block.max(block_n);
        Ok(())
    }

    /// Touch-only rows get their own narrower batch so they cannot null out
    /// columns written by an earlier flush.
    fn build_batches(&self) -> Vec<WriteBatch> {
        let mut full = WriteBatch::upsert("accounts", &["name"], &[
            "name",
            "created_block",
            "creator",
            "json_metadata",
            "last_seen_block",
        ]);
        let mut touch = WriteBatch::upsert("accounts", &["name"], &["name", "last_seen_block"]);
        let mut lastread = WriteBatch::upsert("accounts", &["name"], &["name", "lastread_at"]);
        for (name, acc) in self.state.lock().expect("accounts cache lock").iter() {
            if let Some(date) = &acc.lastread_at {
                lastread.push_row(vec![Value::Text(name.clone()), Value::Text(date.clone())]);
            }
            if acc.created_block.is_some() || acc.json_metadata.is_some() {
                full.push_row(vec![
                    Value::Text(name.clone()),
                    acc.created_block.into(),
                    acc.creator.clone().into(),
                    acc.json_metadata.clone().into(),
                    Value::UInt(acc.last_seen_block),
                ]);
            } else {
                touch.push_row(vec![Value::Text(name.clone()), Value::UInt(acc.last_seen_block)]);
            }
        }
        vec![full, touch, lastread]
    }
}

impl Default for AccountsCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl EntityCache for AccountsCache {
    fn name(&self) -> &'static str {
        self.core.name()
    }

    fn pending(&self) -> usize {
        self.state.lock().expect("accounts cache lock").len()
    }

    async fn flush(&self, conn: &mut (dyn StoreConnection + '_)) -> Result<u64, CacheError> {
        let _window = self.core.begin_flush()?;
        apply_batches(conn, &self.build_batches()).await
    }

    fn mark_flushed(&self) {
        self.state.lock().expect("accounts cache lock").clear();
    }

    fn discard_from(&self, block_n: u64) {
        // Creations are the only account effect tied to a single block.
        let mut state = self.state.lock().expect("accounts cache lock");
        state.retain(|_, acc| !matches!(acc.created_block, Some(b) if b >= block_n));
    }

    fn clear(&self) {
        self.mark_flushed();
    }
}
