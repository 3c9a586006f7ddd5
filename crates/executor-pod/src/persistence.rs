//! Small key/value map kept in a ConfigMap so it survives agent restarts.

use crate::api::ConfigMapApi;
use executor_core::ExecutorError;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info};

type Values = BTreeMap<String, String>;

/// Durable string values shared by every agent in the namespace.
///
/// Reads come from a cache filled on first use. Writes re-read the
/// ConfigMap, merge the one key, and write back guarded by the
/// resourceVersion; a conflicting writer costs a retry. Writes from this
/// instance are serialized.
pub struct MetricsPersistence {
    api: Arc<dyn ConfigMapApi>,
    name: String,
    max_attempts: u32,
    cache: OnceCell<RwLock<Values>>,
    writer: Mutex<()>,
}

impl MetricsPersistence {
    pub fn new(api: Arc<dyn ConfigMapApi>, name: impl Into<String>, max_attempts: u32) -> Self {
        Self {
            api,
            name: name.into(),
            max_attempts: max_attempts.max(1),
            cache: OnceCell::new(),
            writer: Mutex::new(()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>, ExecutorError> {
        let cache = self.cache().await?;
        Ok(cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned())
    }

    /// Every cached value.
    pub async fn values(&self) -> Result<BTreeMap<String, String>, ExecutorError> {
        let cache = self.cache().await?;
        Ok(cache.read().unwrap_or_else(PoisonError::into_inner).clone())
    }

    pub async fn set(&self, key: &str, value: impl Into<String>) -> Result<(), ExecutorError> {
        let value = value.into();
        self.update(key, |_| value.clone()).await.map(|_| ())
    }

    /// Replace `key` with `compute(current remote value)` and return what
    /// was written. `compute` may run once per attempt.
    pub async fn update<F>(&self, key: &str, compute: F) -> Result<String, ExecutorError>
    where
        F: Fn(Option<&str>) -> String + Send + Sync,
    {
        let _writer = self.writer.lock().await;

        for attempt in 1..=self.max_attempts {
            let written = match self.api.get_config_map(&self.name).await? {
                None => {
                    let value = compute(None);
                    let mut data = Values::new();
                    data.insert(key.to_string(), value.clone());
                    let config_map = ConfigMap {
                        metadata: ObjectMeta {
                            name: Some(self.name.clone()),
                            ..ObjectMeta::default()
                        },
                        data: Some(data),
                        ..ConfigMap::default()
                    };
                    self.api
                        .create_config_map(&config_map)
                        .await
                        .map(|stored| (stored, value))
                }
                Some(live) => {
                    let resource_version = live.metadata.resource_version.unwrap_or_default();
                    let mut data = live.data.unwrap_or_default();
                    let value = compute(data.get(key).map(String::as_str));
                    data.insert(key.to_string(), value.clone());
                    self.api
                        .patch_config_map(&self.name, &resource_version, &data)
                        .await
                        .map(|stored| (stored, value))
                }
            };

            match written {
                Ok((stored, value)) => {
                    self.refresh(stored.data.unwrap_or_default()).await;
                    debug!(config_map = %self.name, key, attempt, "Persisted value");
                    return Ok(value);
                }
                Err(ExecutorError::Conflict(reason)) => {
                    info!(config_map = %self.name, key, attempt, reason = %reason, "Concurrent write; retrying");
                }
                Err(e) => return Err(e),
            }
        }

        Err(ExecutorError::Persistence(format!(
            "gave up writing {} to {} after {} conflicting attempts",
            key, self.name, self.max_attempts
        )))
    }

    async fn cache(&self) -> Result<&RwLock<Values>, ExecutorError> {
        self.cache
            .get_or_try_init(|| async {
                // A missing ConfigMap reads as empty; the first write creates it.
                let values = self
                    .api
                    .get_config_map(&self.name)
                    .await?
                    .and_then(|config_map| config_map.data)
                    .unwrap_or_default();
                debug!(config_map = %self.name, keys = values.len(), "Loaded persisted values");
                Ok(RwLock::new(values))
            })
            .await
    }

    async fn refresh(&self, values: Values) {
        let cache = self
            .cache
            .get_or_init(|| async { RwLock::new(Values::new()) })
            .await;
        *cache.write().unwrap_or_else(PoisonError::into_inner) = values;
    }
}
