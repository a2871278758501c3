//! Key-value persistence backends for the engine.
//!
//! The engine persists its operation log, device metadata and conflicts under
//! stable key prefixes through [`KeyValueStore`]. Backends must be durable
//! across process restart (except [`MemoryStore`], which is for tests and
//! ephemeral runs).

mod libsql_store;
mod memory;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;

pub use libsql_store::LibSqlStore;
pub use memory::MemoryStore;

/// A single mutation inside a [`WriteBatch`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    Put { key: String, value: Vec<u8> },
    Delete { key: String },
}

/// Puts and deletes applied together, or not at all
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub const fn new() -> Self {
        Self { ops: Vec::new() }
    }

    pub fn put(&mut self, key: impl Into<String>, value: Vec<u8>) -> &mut Self {
        self.ops.push(WriteOp::Put {
            key: key.into(),
            value,
        });
        self
    }

    /// Serialize `value` as JSON and queue a put
    pub fn put_json<T: Serialize>(
        &mut self,
        key: impl Into<String>,
        value: &T,
    ) -> Result<&mut Self> {
        let encoded = serde_json::to_vec(value)?;
        Ok(self.put(key, encoded))
    }

    pub fn delete(&mut self, key: impl Into<String>) -> &mut Self {
        self.ops.push(WriteOp::Delete { key: key.into() });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    pub fn into_ops(self) -> Vec<WriteOp> {
        self.ops
    }
}

/// Storage collaborator injected into the engine (async)
#[allow(async_fn_in_trait)]
pub trait KeyValueStore {
    /// Read a value, `None` when the key is absent
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Insert or overwrite a value
    async fn set(&self, key: &str, value: &[u8]) -> Result<()>;

    /// Remove a key; removing an absent key is not an error
    async fn delete(&self, key: &str) -> Result<()>;

    /// All keys starting with `prefix`, in ascending order
    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>>;

    /// Apply every op in `batch` atomically
    async fn write_batch(&self, batch: WriteBatch) -> Result<()>;
}

/// Read and decode a JSON value
pub async fn get_json<S, T>(store: &S, key: &str) -> Result<Option<T>>
where
    S: KeyValueStore,
    T: DeserializeOwned,
{
    match store.get(key).await? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

/// Encode and write a JSON value
pub async fn set_json<S, T>(store: &S, key: &str, value: &T) -> Result<()>
where
    S: KeyValueStore,
    T: Serialize,
{
    let encoded = serde_json::to_vec(value)?;
    store.set(key, &encoded).await
}
