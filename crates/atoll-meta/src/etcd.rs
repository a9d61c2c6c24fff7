use std::sync::Arc;

use anyhow::Result;
use etcd_client::{Client, Compare, CompareOp, GetOptions, Txn, TxnOp};
use tokio::sync::Mutex;

use crate::types::MetaStore;

/// etcd-backed production store. Uniqueness and CAS map onto etcd
/// transactions, so the invariants hold across server processes.
#[derive(Clone)]
pub struct EtcdMetaStore {
    client: Arc<Mutex<Client>>,
}

impl EtcdMetaStore {
    pub async fn connect(endpoints: &[String]) -> Result<Self> {
        let client = Client::connect(endpoints, None).await?;
        Ok(Self {
            client: Arc::new(Mutex::new(client)),
        })
    }
}

#[async_trait::async_trait]
impl MetaStore for EtcdMetaStore {
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<u64> {
        let mut cli = self.client.lock().await;
        let resp = cli.put(key, value, None).await?;
        Ok(resp.header().map(|h| h.revision()).unwrap_or_default() as u64)
    }

    async fn get(&self, key: &str) -> Result<Option<(Vec<u8>, u64)>> {
        let mut cli = self.client.lock().await;
        let resp = cli.get(key, None).await?;
        Ok(resp
            .kvs()
            .first()
            .map(|kv| (kv.value().to_vec(), kv.mod_revision() as u64)))
    }

    async fn delete(&self, key: &str) -> Result<u64> {
        let mut cli = self.client.lock().await;
        let resp = cli.delete(key, None).await?;
        Ok(resp.header().map(|h| h.revision()).unwrap_or_default() as u64)
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>, u64)>> {
        let mut cli = self.client.lock().await;
        let resp = cli.get(prefix, Some(GetOptions::new().with_prefix())).await?;
        let mut out = Vec::new();
        for kv in resp.kvs() {
            out.push((
                String::from_utf8_lossy(kv.key()).to_string(),
                kv.value().to_vec(),
                kv.mod_revision() as u64,
            ));
        }
        Ok(out)
    }

    async fn insert_unique(&self, key: &str, value: Vec<u8>) -> Result<Option<u64>> {
        let mut cli = self.client.lock().await;

        // create_revision == 0 means the key does not exist yet.
        let cmp = Compare::create_revision(key, CompareOp::Equal, 0);
        let put = TxnOp::put(key, value, None);
        let txn = Txn::new().when([cmp]).and_then([put]).or_else([]);
        let resp = cli.txn(txn).await?;

        if resp.succeeded() {
            let rev = resp.header().map(|h| h.revision()).unwrap_or_default();
            Ok(Some(rev as u64))
        } else {
            Ok(None)
        }
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected_revision: u64,
        value: Vec<u8>,
    ) -> Result<(bool, u64)> {
        let mut cli = self.client.lock().await;

        let cmp = Compare::mod_revision(key, CompareOp::Equal, expected_revision as i64);
        let put = TxnOp::put(key, value, None);
        let txn = Txn::new().when([cmp]).and_then([put]).or_else([]);
        let resp = cli.txn(txn).await?;

        if resp.succeeded() {
            let rev = resp.header().map(|h| h.revision()).unwrap_or_default();
            return Ok((true, rev as u64));
        }

        let current = cli.get(key, None).await?;
        let current_rev = current
            .kvs()
            .first()
            .map(|kv| kv.mod_revision() as u64)
            .unwrap_or(0);
        Ok((false, current_rev))
    }
}
