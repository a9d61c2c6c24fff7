use anyhow::Result;
use async_trait::async_trait;

/// Metadata store behind the provisioning core.
///
/// Revisions are store-global and monotonic; `compare_and_swap` and
/// `insert_unique` are the only write paths that may race, and both
/// fail cleanly instead of clobbering. `insert_unique` backs the two
/// uniqueness invariants of the system: one owner per port and one
/// active deployment per tenant.
#[async_trait]
pub trait MetaStore: Send + Sync {
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<u64>;

    async fn get(&self, key: &str) -> Result<Option<(Vec<u8>, u64)>>;

    /// Returns the revision of the delete. Deleting a missing key is a
    /// no-op, not an error.
    async fn delete(&self, key: &str) -> Result<u64>;

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>, u64)>>;

    /// Create `key` only if it does not exist. `Ok(Some(rev))` on
    /// success, `Ok(None)` if another writer got there first.
    async fn insert_unique(&self, key: &str, value: Vec<u8>) -> Result<Option<u64>>;

    /// Replace `key` only if its current revision matches. Returns
    /// `(succeeded, current_revision)`.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected_revision: u64,
        value: Vec<u8>,
    ) -> Result<(bool, u64)>;
}
