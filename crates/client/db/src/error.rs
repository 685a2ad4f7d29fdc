#[derive(thiserror::Error, Debug)]
pub enum StorageError {
    #[error("No transaction is open on this connection")]
    NoTransaction,
    #[error("A transaction is already open on this connection")]
    NestedTransaction,
    #[error("Row width mismatch in batch for table `{table}`: expected {expected} columns, got {got}")]
    RowWidth { table: String, expected: usize, got: usize },
    #[error("Key column `{col}` is not part of the batch columns for table `{table}`")]
    MissingKeyColumn { table: String, col: &'static str },
    #[error("Batch is empty")]
    EmptyBatch,
    #[error("Inconsistent storage: {0}")]
    InconsistentStorage(std::borrow::Cow<'static, str>),
    #[error("Connection pool exhausted")]
    PoolExhausted,
    #[error("Backend error: {0:#}")]
    Backend(#[from] anyhow::Error),
}
