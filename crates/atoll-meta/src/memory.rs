use std::{collections::BTreeMap, sync::Arc};

use anyhow::Result;
use tokio::sync::RwLock;

use crate::types::MetaStore;

/// In-memory store used by tests and single-node dev mode.
///
/// A single revision counter covers all keys, matching the etcd
/// semantics the production store exposes.
#[derive(Debug, Clone, Default)]
pub struct MemoryMetaStore {
    inner: Arc<RwLock<Inner>>,
}

#[derive(Debug, Default)]
struct Inner {
    revision: u64,
    kv: BTreeMap<String, (Vec<u8>, u64)>,
}

impl MemoryMetaStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Inner {
    fn bump(&mut self) -> u64 {
        self.revision = self.revision.saturating_add(1);
        self.revision
    }
}

#[async_trait::async_trait]
impl MetaStore for MemoryMetaStore {
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<u64> {
        let mut inner = self.inner.write().await;
        let rev = inner.bump();
        inner.kv.insert(key.to_string(), (value, rev));
        Ok(rev)
    }

    async fn get(&self, key: &str) -> Result<Option<(Vec<u8>, u64)>> {
        let inner = self.inner.read().await;
        Ok(inner.kv.get(key).map(|(v, rev)| (v.clone(), *rev)))
    }

    async fn delete(&self, key: &str) -> Result<u64> {
        let mut inner = self.inner.write().await;
        inner.kv.remove(key);
        Ok(inner.bump())
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>, u64)>> {
        let inner = self.inner.read().await;
        let mut out = Vec::new();
        for (k, (v, rev)) in inner
            .kv
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
        {
            out.push((k.clone(), v.clone(), *rev));
        }
        Ok(out)
    }

    async fn insert_unique(&self, key: &str, value: Vec<u8>) -> Result<Option<u64>> {
        let mut inner = self.inner.write().await;
        if inner.kv.contains_key(key) {
            return Ok(None);
        }
        let rev = inner.bump();
        inner.kv.insert(key.to_string(), (value, rev));
        Ok(Some(rev))
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected_revision: u64,
        value: Vec<u8>,
    ) -> Result<(bool, u64)> {
        let mut inner = self.inner.write().await;
        let current = inner.kv.get(key).map(|(_, rev)| *rev).unwrap_or(0);
        if current != expected_revision {
            return Ok((false, current));
        }
        let rev = inner.bump();
        inner.kv.insert(key.to_string(), (value, rev));
        Ok((true, rev))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn insert_unique_rejects_second_writer() {
        let store = MemoryMetaStore::new();
        assert!(store.insert_unique("/k", b"a".to_vec()).await.unwrap().is_some());
        assert!(store.insert_unique("/k", b"b".to_vec()).await.unwrap().is_none());
        let (v, _) = store.get("/k").await.unwrap().unwrap();
        assert_eq!(v, b"a");
    }

    #[tokio::test]
    async fn cas_requires_matching_revision() {
        let store = MemoryMetaStore::new();
        let rev = store.put("/k", b"a".to_vec()).await.unwrap();
        let (ok, _) = store.compare_and_swap("/k", rev + 1, b"b".to_vec()).await.unwrap();
        assert!(!ok);
        let (ok, _) = store.compare_and_swap("/k", rev, b"b".to_vec()).await.unwrap();
        assert!(ok);
    }

    #[tokio::test]
    async fn list_prefix_is_ordered() {
        let store = MemoryMetaStore::new();
        store.put("/events/d/00000002", vec![2]).await.unwrap();
        store.put("/events/d/00000001", vec![1]).await.unwrap();
        store.put("/events/e/00000001", vec![9]).await.unwrap();
        let out = store.list_prefix("/events/d/").await.unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].1, vec![1]);
        assert_eq!(out[1].1, vec![2]);
    }

    #[tokio::test]
    async fn delete_missing_is_noop() {
        let store = MemoryMetaStore::new();
        store.delete("/missing").await.unwrap();
    }
}
