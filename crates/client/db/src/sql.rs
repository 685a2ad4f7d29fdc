//! Statement rendering for SQL backends.
//!
//! Pure text. A backend binds the batch row values positionally against the
//! rendered placeholders.

use crate::WriteBatch;

/// `INSERT ... ON CONFLICT (key) DO UPDATE` for one row of the batch shape.
pub fn render_upsert(batch: &WriteBatch) -> String {
    let cols = batch.cols.join(", ");
    let placeholders = (1..=batch.cols.len()).map(|i| format!("${i}")).collect::<Vec<_>>().join(", ");
    let keys = batch.key_cols.join(", ");
    let updates = batch
        .cols
        .iter()
        .filter(|c| !batch.key_cols.contains(c))
        .map(|c| format!("{c} = EXCLUDED.{c}"))
        .collect::<Vec<_>>()
        .join(", ");
    if updates.is_empty() {
        format!("INSERT INTO {} ({cols}) VALUES ({placeholders}) ON CONFLICT ({keys}) DO NOTHING", batch.table)
    } else {
        format!(
            "INSERT INTO {} ({cols}) VALUES ({placeholders}) ON CONFLICT ({keys}) DO UPDATE SET {updates}",
            batch.table
        )
    }
}

/// `DELETE` by key columns for one row of the batch shape.
pub fn render_delete(batch: &WriteBatch) -> String {
    let conditions = batch
        .key_cols
        .iter()
        .enumerate()
        .map(|(i, c)| format!("{c} = ${}", i + 1))
        .collect::<Vec<_>>()
        .join(" AND ");
    format!("DELETE FROM {} WHERE {conditions}", batch.table)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upsert_updates_non_key_columns() {
        let batch = WriteBatch::upsert("accounts", &["name"], &["name", "post_count", "reputation"]);
        assert_eq!(
            render_upsert(&batch),
            "INSERT INTO accounts (name, post_count, reputation) VALUES ($1, $2, $3) \
             ON CONFLICT (name) DO UPDATE SET post_count = EXCLUDED.post_count, reputation = EXCLUDED.reputation"
        );
    }

    #[test]
    fn upsert_with_only_key_columns_is_do_nothing() {
        let batch = WriteBatch::upsert("follows", &["follower", "following"], &["follower", "following"]);
        assert_eq!(
            render_upsert(&batch),
            "INSERT INTO follows (follower, following) VALUES ($1, $2) \
             ON CONFLICT (follower, following) DO NOTHING"
        );
    }

    #[test]
    fn delete_filters_on_every_key_column() {
        let batch = WriteBatch::delete("votes", &["voter", "author", "permlink"]);
        assert_eq!(render_delete(&batch), "DELETE FROM votes WHERE voter = $1 AND author = $2 AND permlink = $3");
    }
}
