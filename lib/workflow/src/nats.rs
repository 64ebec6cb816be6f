//! NATS JetStream key-value store for execution instances.
//!
//! Each instance is one key in a KV bucket (`workflow-executions` by
//! default), keyed by execution id, with the value wrapped in an
//! `Envelope`. The KV entry revision is the store revision, so
//! compare-and-swap maps directly onto `update(key, value, revision)`.

use crate::envelope::{self, Envelope};
use crate::execution::{ExecutionInstance, ExecutionStatus};
use crate::store::{self, ExecutionStore, Revision, StoreError, Versioned};
use async_nats::jetstream::{self, kv};
use async_trait::async_trait;
use flowgate_core::ExecutionId;
use futures::TryStreamExt;
use tracing::{debug, info};

/// Default bucket name for execution instances.
const EXECUTIONS_BUCKET_NAME: &str = "workflow-executions";

/// Revisions kept per key.
const DEFAULT_HISTORY: i64 = 5;

/// Configuration for the NATS execution store.
#[derive(Debug, Clone)]
pub struct NatsConfig {
    /// NATS server URL.
    pub url: String,
    /// KV bucket name (defaults to workflow-executions).
    pub bucket_name: Option<String>,
    /// Revisions kept per key (defaults to 5).
    pub history: Option<i64>,
}

impl NatsConfig {
    /// Creates a config for the given NATS URL.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            bucket_name: None,
            history: None,
        }
    }

    /// Sets the bucket name.
    #[must_use]
    pub fn with_bucket(mut self, bucket: impl Into<String>) -> Self {
        self.bucket_name = Some(bucket.into());
        self
    }

    fn bucket(&self) -> &str {
        self.bucket_name
            .as_deref()
            .unwrap_or(EXECUTIONS_BUCKET_NAME)
    }

    fn history(&self) -> i64 {
        self.history.unwrap_or(DEFAULT_HISTORY)
    }
}

/// JetStream KV-backed execution store.
pub struct NatsExecutionStore {
    kv: kv::Store,
}

impl NatsExecutionStore {
    /// Connects and opens (or creates) the bucket.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection or bucket setup fails.
    pub async fn connect(config: &NatsConfig) -> Result<Self, StoreError> {
        let client = async_nats::connect(&config.url)
            .await
            .map_err(|e| StoreError::Backend {
                message: format!("failed to connect: {e}"),
            })?;
        let jetstream = jetstream::new(client);

        let kv = match jetstream.get_key_value(config.bucket()).await {
            Ok(kv) => kv,
            Err(_) => {
                info!(bucket = config.bucket(), "creating execution bucket");
                jetstream
                    .create_key_value(kv::Config {
                        bucket: config.bucket().to_string(),
                        history: config.history(),
                        ..Default::default()
                    })
                    .await
                    .map_err(|e| StoreError::Backend {
                        message: format!("failed to create bucket: {e}"),
                    })?
            }
        };

        Ok(Self { kv })
    }

    fn key(id: ExecutionId) -> String {
        id.to_string()
    }

    fn encode(instance: &ExecutionInstance) -> Result<Vec<u8>, StoreError> {
        Envelope::new(instance)
            .to_json_bytes()
            .map_err(|e| StoreError::Serialization {
                message: e.to_string(),
            })
    }

    fn decode(bytes: &[u8]) -> Result<ExecutionInstance, StoreError> {
        envelope::open_bytes(bytes).map_err(|e| StoreError::Serialization {
            message: e.to_string(),
        })
    }

    async fn current_revision(&self, id: ExecutionId) -> Result<Option<Revision>, StoreError> {
        let entry = self
            .kv
            .entry(Self::key(id))
            .await
            .map_err(|e| StoreError::Backend {
                message: e.to_string(),
            })?;
        Ok(entry
            .filter(|e| matches!(e.operation, kv::Operation::Put))
            .map(|e| e.revision))
    }
}

#[async_trait]
impl ExecutionStore for NatsExecutionStore {
    async fn insert(&self, instance: &ExecutionInstance) -> Result<Revision, StoreError> {
        let bytes = Self::encode(instance)?;
        self.kv
            .create(Self::key(instance.id), bytes.into())
            .await
            .map_err(|e| match e.kind() {
                kv::CreateErrorKind::AlreadyExists => {
                    StoreError::AlreadyExists { id: instance.id }
                }
                _ => StoreError::Backend {
                    message: e.to_string(),
                },
            })
    }

    async fn load(
        &self,
        id: ExecutionId,
    ) -> Result<Option<Versioned<ExecutionInstance>>, StoreError> {
        let entry = self
            .kv
            .entry(Self::key(id))
            .await
            .map_err(|e| StoreError::Backend {
                message: e.to_string(),
            })?;

        match entry {
            Some(entry) if matches!(entry.operation, kv::Operation::Put) => Ok(Some(Versioned {
                value: Self::decode(&entry.value)?,
                revision: entry.revision,
            })),
            _ => Ok(None),
        }
    }

    async fn compare_and_swap(
        &self,
        instance: &ExecutionInstance,
        expected: Revision,
    ) -> Result<Revision, StoreError> {
        let bytes = Self::encode(instance)?;
        match self
            .kv
            .update(Self::key(instance.id), bytes.into(), expected)
            .await
        {
            Ok(revision) => Ok(revision),
            Err(e) => {
                // The server reports a stale revision as a generic publish
                // failure; re-read the key to tell conflicts apart.
                match self.current_revision(instance.id).await? {
                    None => Err(StoreError::NotFound { id: instance.id }),
                    Some(current) if current != expected => {
                        debug!(
                            execution_id = %instance.id,
                            expected,
                            current,
                            "revision conflict"
                        );
                        Err(StoreError::RevisionConflict {
                            id: instance.id,
                            expected,
                        })
                    }
                    Some(_) => Err(StoreError::Backend {
                        message: e.to_string(),
                    }),
                }
            }
        }
    }

    async fn list(
        &self,
        status: Option<ExecutionStatus>,
    ) -> Result<Vec<ExecutionInstance>, StoreError> {
        let keys: Vec<String> = self
            .kv
            .keys()
            .await
            .map_err(|e| StoreError::Backend {
                message: e.to_string(),
            })?
            .try_collect()
            .await
            .map_err(|e| StoreError::Backend {
                message: e.to_string(),
            })?;

        let mut instances = Vec::with_capacity(keys.len());
        for key in keys {
            let Some(bytes) = self.kv.get(&key).await.map_err(|e| StoreError::Backend {
                message: e.to_string(),
            })?
            else {
                continue;
            };
            let instance = Self::decode(&bytes)?;
            if status.is_none_or(|s| instance.status == s) {
                instances.push(instance);
            }
        }
        store::sort_oldest_first(&mut instances);
        Ok(instances)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{ActionSpec, TriggerType, WorkflowDefinition};
    use crate::trigger::DomainEvent;
    use chrono::Utc;
    use serde_json::json;

    #[test]
    fn nats_config_defaults() {
        let config = NatsConfig::new("nats://localhost:4222");
        assert_eq!(config.bucket(), EXECUTIONS_BUCKET_NAME);
        assert_eq!(config.history(), DEFAULT_HISTORY);
    }

    #[test]
    fn nats_config_custom_bucket() {
        let config = NatsConfig::new("nats://localhost:4222").with_bucket("staging-executions");
        assert_eq!(config.bucket(), "staging-executions");
    }

    #[test]
    fn key_is_prefixed_execution_id() {
        let id = ExecutionId::new();
        let key = NatsExecutionStore::key(id);
        assert!(key.starts_with("exec_"));
        assert_eq!(key.parse::<ExecutionId>().unwrap(), id);
    }

    #[test]
    fn stored_bytes_decode_back() {
        let definition = WorkflowDefinition::new("kv", TriggerType::Manual)
            .with_action(ActionSpec::new("log", 1));
        let instance = ExecutionInstance::new(
            &definition,
            DomainEvent::new(TriggerType::Manual, json!({"k": "v"})),
            Utc::now(),
        );

        let bytes = NatsExecutionStore::encode(&instance).unwrap();
        assert_eq!(NatsExecutionStore::decode(&bytes).unwrap(), instance);
        assert!(matches!(
            NatsExecutionStore::decode(b"{}"),
            Err(StoreError::Serialization { .. })
        ));
    }
}
