//! [`PodApi`] and [`ConfigMapApi`] backed by a live cluster.

use crate::api::{ConfigMapApi, EventStream, PodApi};
use crate::naming::SCRIPT_CONTAINER;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use executor_core::ExecutorError;
use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::{ConfigMap, Event, Pod};
use kube::api::{Api, DeleteParams, ListParams, LogParams, Patch, PatchParams, PostParams};
use kube::runtime::{watcher, WatchStreamExt};
use kube::Client;
use std::collections::BTreeMap;

/// Connect using the in-cluster service account or the local kubeconfig.
pub async fn connect() -> Result<Client, ExecutorError> {
    Client::try_default()
        .await
        .map_err(|e| ExecutorError::Kubernetes(format!("failed to build client: {}", e)))
}

fn map_error(error: kube::Error) -> ExecutorError {
    match error {
        kube::Error::Api(response) if response.code == 404 => {
            ExecutorError::NotFound(response.message)
        }
        kube::Error::Api(response) if response.code == 409 => {
            ExecutorError::Conflict(response.message)
        }
        other => ExecutorError::Kubernetes(other.to_string()),
    }
}

#[derive(Clone)]
pub struct KubePodApi {
    pods: Api<Pod>,
    events: Api<Event>,
}

impl KubePodApi {
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            pods: Api::namespaced(client.clone(), namespace),
            events: Api::namespaced(client, namespace),
        }
    }
}

#[async_trait]
impl PodApi for KubePodApi {
    async fn create_pod(&self, pod: &Pod) -> Result<Pod, ExecutorError> {
        self.pods
            .create(&PostParams::default(), pod)
            .await
            .map_err(map_error)
    }

    async fn get_pod(&self, name: &str) -> Result<Option<Pod>, ExecutorError> {
        self.pods.get_opt(name).await.map_err(map_error)
    }

    async fn delete_pod(&self, name: &str) -> Result<(), ExecutorError> {
        match self.pods.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(response)) if response.code == 404 => Ok(()),
            Err(e) => Err(map_error(e)),
        }
    }

    async fn list_pods(&self, label_selector: &str) -> Result<Vec<Pod>, ExecutorError> {
        let params = ListParams::default().labels(label_selector);
        let list = self.pods.list(&params).await.map_err(map_error)?;
        Ok(list.items)
    }

    async fn pod_logs(
        &self,
        name: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<String, ExecutorError> {
        let params = LogParams {
            container: Some(SCRIPT_CONTAINER.to_string()),
            timestamps: true,
            since_time: since,
            ..LogParams::default()
        };
        self.pods.logs(name, &params).await.map_err(map_error)
    }

    async fn watch_events(&self, pod_uid: &str) -> Result<EventStream, ExecutorError> {
        let config = watcher::Config::default().fields(&format!("involvedObject.uid={}", pod_uid));
        let stream = watcher(self.events.clone(), config)
            .applied_objects()
            .map_err(|e| ExecutorError::Kubernetes(e.to_string()))
            .boxed();
        Ok(stream)
    }
}

#[derive(Clone)]
pub struct KubeConfigMapApi {
    config_maps: Api<ConfigMap>,
}

impl KubeConfigMapApi {
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            config_maps: Api::namespaced(client, namespace),
        }
    }
}

#[async_trait]
impl ConfigMapApi for KubeConfigMapApi {
    async fn get_config_map(&self, name: &str) -> Result<Option<ConfigMap>, ExecutorError> {
        self.config_maps.get_opt(name).await.map_err(map_error)
    }

    async fn create_config_map(&self, config_map: &ConfigMap) -> Result<ConfigMap, ExecutorError> {
        self.config_maps
            .create(&PostParams::default(), config_map)
            .await
            .map_err(map_error)
    }

    async fn patch_config_map(
        &self,
        name: &str,
        resource_version: &str,
        data: &BTreeMap<String, String>,
    ) -> Result<ConfigMap, ExecutorError> {
        // The resourceVersion turns the merge patch into a compare-and-swap.
        let patch = serde_json::json!({
            "metadata": { "resourceVersion": resource_version },
            "data": data,
        });
        self.config_maps
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(map_error)
    }
}
