//! The slice of the Kubernetes API the pod backend depends on.
//!
//! Kept behind traits so the backend, the reconciler and the metrics store
//! can run against an in-memory cluster in tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use executor_core::ExecutorError;
use futures::stream::BoxStream;
use k8s_openapi::api::core::v1::{ConfigMap, Event, Pod};
use std::collections::BTreeMap;

pub type EventStream = BoxStream<'static, Result<Event, ExecutorError>>;

#[async_trait]
pub trait PodApi: Send + Sync {
    async fn create_pod(&self, pod: &Pod) -> Result<Pod, ExecutorError>;

    /// `None` when the pod does not exist.
    async fn get_pod(&self, name: &str) -> Result<Option<Pod>, ExecutorError>;

    /// Deleting a pod that is already gone succeeds.
    async fn delete_pod(&self, name: &str) -> Result<(), ExecutorError>;

    async fn list_pods(&self, label_selector: &str) -> Result<Vec<Pod>, ExecutorError>;

    /// Log text of the script container, every line prefixed with its
    /// RFC 3339 timestamp. `since` is honoured at whole-second granularity,
    /// so callers must expect lines from before it.
    async fn pod_logs(
        &self,
        name: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<String, ExecutorError>;

    /// Events whose involved object has the given uid.
    async fn watch_events(&self, pod_uid: &str) -> Result<EventStream, ExecutorError>;
}

#[async_trait]
pub trait ConfigMapApi: Send + Sync {
    async fn get_config_map(&self, name: &str) -> Result<Option<ConfigMap>, ExecutorError>;

    /// Fails with [`ExecutorError::Conflict`] if it already exists.
    async fn create_config_map(&self, config_map: &ConfigMap) -> Result<ConfigMap, ExecutorError>;

    /// Merge `data` into the object, provided it is still at
    /// `resource_version`; otherwise fails with [`ExecutorError::Conflict`].
    async fn patch_config_map(
        &self,
        name: &str,
        resource_version: &str,
        data: &BTreeMap<String, String>,
    ) -> Result<ConfigMap, ExecutorError>;
}
