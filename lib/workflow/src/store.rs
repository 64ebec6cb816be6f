//! Execution persistence.
//!
//! Every write after `insert` is a compare-and-swap against the revision the
//! writer loaded. Two writers racing on one instance cannot both succeed:
//! the loser gets `StoreError::RevisionConflict` and must reload.

use crate::execution::{ExecutionInstance, ExecutionStatus};
use async_trait::async_trait;
use flowgate_core::ExecutionId;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Monotonic per-instance write counter.
pub type Revision = u64;

/// A stored value together with the revision it was read at.
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<T> {
    /// The stored value.
    pub value: T,
    /// Revision of the stored value.
    pub revision: Revision,
}

/// Errors from execution store operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// No instance with the id exists.
    NotFound { id: ExecutionId },
    /// An instance with the id already exists.
    AlreadyExists { id: ExecutionId },
    /// The stored revision moved since the caller loaded it.
    RevisionConflict { id: ExecutionId, expected: Revision },
    /// The stored bytes could not be encoded or decoded.
    Serialization { message: String },
    /// The backing store failed.
    Backend { message: String },
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound { id } => write!(f, "execution not found: {id}"),
            Self::AlreadyExists { id } => write!(f, "execution already exists: {id}"),
            Self::RevisionConflict { id, expected } => {
                write!(f, "execution {id} changed since revision {expected}")
            }
            Self::Serialization { message } => write!(f, "serialization failed: {message}"),
            Self::Backend { message } => write!(f, "store backend failed: {message}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Durable storage for execution instances.
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Stores a new instance and returns its first revision.
    async fn insert(&self, instance: &ExecutionInstance) -> Result<Revision, StoreError>;

    /// Loads an instance with its current revision.
    async fn load(&self, id: ExecutionId)
    -> Result<Option<Versioned<ExecutionInstance>>, StoreError>;

    /// Replaces an instance if its stored revision is still `expected`.
    ///
    /// Returns the new revision.
    async fn compare_and_swap(
        &self,
        instance: &ExecutionInstance,
        expected: Revision,
    ) -> Result<Revision, StoreError>;

    /// Lists instances, optionally filtered by status, oldest first.
    async fn list(
        &self,
        status: Option<ExecutionStatus>,
    ) -> Result<Vec<ExecutionInstance>, StoreError>;
}

#[async_trait]
impl<S: ExecutionStore + ?Sized> ExecutionStore for Arc<S> {
    async fn insert(&self, instance: &ExecutionInstance) -> Result<Revision, StoreError> {
        (**self).insert(instance).await
    }

    async fn load(
        &self,
        id: ExecutionId,
    ) -> Result<Option<Versioned<ExecutionInstance>>, StoreError> {
        (**self).load(id).await
    }

    async fn compare_and_swap(
        &self,
        instance: &ExecutionInstance,
        expected: Revision,
    ) -> Result<Revision, StoreError> {
        (**self).compare_and_swap(instance, expected).await
    }

    async fn list(
        &self,
        status: Option<ExecutionStatus>,
    ) -> Result<Vec<ExecutionInstance>, StoreError> {
        (**self).list(status).await
    }
}

/// Orders instances oldest first, breaking ties by id.
pub(crate) fn sort_oldest_first(instances: &mut [ExecutionInstance]) {
    instances.sort_by(|a, b| a.started_at.cmp(&b.started_at).then(a.id.cmp(&b.id)));
}

/// Process-local store, used in tests and single-node setups.
#[derive(Debug, Clone, Default)]
pub struct InMemoryExecutionStore {
    entries: Arc<RwLock<HashMap<ExecutionId, Versioned<ExecutionInstance>>>>,
}

impl InMemoryExecutionStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored instances.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Returns true if nothing is stored.
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl ExecutionStore for InMemoryExecutionStore {
    async fn insert(&self, instance: &ExecutionInstance) -> Result<Revision, StoreError> {
        let mut entries = self.entries.write().await;
        if entries.contains_key(&instance.id) {
            return Err(StoreError::AlreadyExists { id: instance.id });
        }
        entries.insert(
            instance.id,
            Versioned {
                value: instance.clone(),
                revision: 1,
            },
        );
        Ok(1)
    }

    async fn load(
        &self,
        id: ExecutionId,
    ) -> Result<Option<Versioned<ExecutionInstance>>, StoreError> {
        Ok(self.entries.read().await.get(&id).cloned())
    }

    async fn compare_and_swap(
        &self,
        instance: &ExecutionInstance,
        expected: Revision,
    ) -> Result<Revision, StoreError> {
        let mut entries = self.entries.write().await;
        let entry = entries
            .get_mut(&instance.id)
            .ok_or(StoreError::NotFound { id: instance.id })?;
        if entry.revision != expected {
            return Err(StoreError::RevisionConflict {
                id: instance.id,
                expected,
            });
        }
        entry.value = instance.clone();
        entry.revision += 1;
        Ok(entry.revision)
    }

    async fn list(
        &self,
        status: Option<ExecutionStatus>,
    ) -> Result<Vec<ExecutionInstance>, StoreError> {
        let mut instances: Vec<ExecutionInstance> = self
            .entries
            .read()
            .await
            .values()
            .filter(|v| status.is_none_or(|s| v.value.status == s))
            .map(|v| v.value.clone())
            .collect();
        sort_oldest_first(&mut instances);
        Ok(instances)
    }
}
