//! Relational store abstraction for the indexer.
//!
//! Writers never talk SQL directly: entity caches accumulate [`WriteBatch`]es
//! of keyed rows, and the flush coordinator applies them through a
//! [`StoreConnection`]. A batch row is identified by its key columns, so
//! applying the same batch twice converges to the same state. This is what
//! makes flush retries safe after a partial failure.
//!
//! [`MemStore`] is the in-process backend used by the test suite and by the
//! mocked sync pipelines. A SQL backend plugs in behind the same traits, with
//! [`sql`] providing the statement rendering.

use ap_block::BlockRef;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;

mod error;
pub mod lookup;
pub mod mem;
pub mod sql;

pub use error::StorageError;
pub use lookup::LookupCache;
pub use mem::MemStore;

type Result<T, E = StorageError> = std::result::Result<T, E>;

/// A scalar cell value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Text(String),
}

impl Value {
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::UInt(v) => Some(*v),
            Value::Int(v) => u64::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            Value::UInt(v) => i64::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(v) => Some(v),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Bool(v) => write!(f, "{v}"),
            Value::Int(v) => write!(f, "{v}"),
            Value::UInt(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Text(v) => write!(f, "{v}"),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}
impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v.into())
    }
}
impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}
impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::UInt(v)
    }
}
impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}
impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}
impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}
impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

/// A row as read back from the store, keyed by column name.
pub type Row = BTreeMap<String, Value>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BatchAction {
    /// Insert, or update the batch columns of an existing row with the same
    /// key. Columns outside the batch keep their value.
    Upsert,
    /// Delete by key. Non-key columns are ignored.
    Delete,
}

/// A set of same-shaped writes to one table.
#[derive(Clone, Debug, PartialEq)]
pub struct WriteBatch {
    pub table: Cow<'static, str>,
    pub key_cols: Vec<&'static str>,
    pub cols: Vec<&'static str>,
    pub rows: Vec<Vec<Value>>,
    pub action: BatchAction,
}

impl WriteBatch {
    pub fn upsert(table: &'static str, key_cols: &[&'static str], cols: &[&'static str]) -> Self {
        Self {
            table: Cow::Borrowed(table),
            key_cols: key_cols.to_vec(),
            cols: cols.to_vec(),
            rows: vec![],
            action: BatchAction::Upsert,
        }
    }

    pub fn delete(table: &'static str, key_cols: &[&'static str]) -> Self {
        Self {
            table: Cow::Borrowed(table),
            key_cols: key_cols.to_vec(),
            cols: key_cols.to_vec(),
            rows: vec![],
            action: BatchAction::Delete,
        }
    }

    pub fn push_row(&mut self, row: Vec<Value>) {
        debug_assert_eq!(row.len(), self.cols.len());
        self.rows.push(row);
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Positions of the key columns within `cols`.
    pub fn key_indices(&self) -> Result<Vec<usize>> {
        self.key_cols
            .iter()
            .map(|key| {
                self.cols.iter().position(|c| c == key).ok_or(StorageError::MissingKeyColumn {
                    table: self.table.to_string(),
                    col: key,
                })
            })
            .collect()
    }
}

/// Head state of the indexed chain as recorded in the store.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ChainHead {
    /// Latest block marked completed. Rows above this may exist but are not
    /// durable and get truncated at startup.
    pub latest_completed: Option<BlockRef>,
    /// Latest block row present at all, completed or not.
    pub latest_present: Option<u64>,
}

/// Handle to a store backend. Cheap to clone.
#[async_trait::async_trait]
pub trait Store: Send + Sync {
    /// Open a connection. Each connection holds at most one transaction.
    async fn connection(&self) -> Result<Box<dyn StoreConnection>>;

    /// Number of connections the backend can serve concurrently. The bulk
    /// flush coordinator clamps its fan-out to this.
    fn pool_size(&self) -> usize;
}

/// A single store connection with explicit transaction control.
///
/// Outside a transaction every write auto-commits. Inside one, writes stay
/// invisible to other connections until `commit`.
#[async_trait::async_trait]
pub trait StoreConnection: Send {
    async fn begin(&mut self) -> Result<()>;
    async fn commit(&mut self) -> Result<()>;
    async fn rollback(&mut self) -> Result<()>;

    /// Apply a batch. Returns the number of rows written or deleted.
    async fn apply(&mut self, batch: &WriteBatch) -> Result<u64>;

    async fn get_row(&mut self, table: &str, key: &[Value]) -> Result<Option<Row>>;

    /// Latest block marked completed, if any.
    async fn latest_block(&mut self) -> Result<Option<BlockRef>>;

    async fn chain_head(&mut self) -> Result<ChainHead>;

    async fn block_hash(&mut self, number: u64) -> Result<Option<String>>;

    /// Remove every block row above `number` together with all derived rows
    /// attributed to those blocks. Returns how many block rows were removed.
    async fn pop_blocks_above(&mut self, number: u64) -> Result<u64>;

    /// Delete rows of `table` whose `col` value is below `threshold`.
    /// Maintenance pruning of append-heavy tables.
    async fn prune_below(&mut self, table: &str, col: &str, threshold: u64) -> Result<u64>;

    /// Startup recovery: drop everything above the latest completed block.
    /// A crash mid-flush leaves rows without a completed marker behind.
    async fn truncate_incomplete(&mut self) -> Result<u64>;
}
