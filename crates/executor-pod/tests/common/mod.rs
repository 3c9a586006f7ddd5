#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, DurationRound, TimeZone, Utc};
use executor_core::config::PodConfig;
use executor_core::ExecutorError;
use executor_pod::{ConfigMapApi, EventStream, PodApi};
use futures::channel::mpsc as stream_channel;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{
    ConfigMap, ContainerState, ContainerStateTerminated, ContainerStatus, Event, Pod, PodStatus,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

/// In-memory stand-in for the slice of a cluster the pod backend uses.
#[derive(Default)]
pub struct FakeCluster {
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    pods: BTreeMap<String, Pod>,
    logs: HashMap<String, Vec<(DateTime<Utc>, String)>>,
    events: HashMap<String, Vec<Event>>,
    subscribers: HashMap<String, Vec<stream_channel::UnboundedSender<Result<Event, ExecutorError>>>>,
    events_unavailable: bool,
    failing_gets: u32,
    failing_log_reads: u32,
    hanging_log_reads: bool,
    failing_deletes: bool,
    deleted: Vec<String>,
    config_maps: BTreeMap<String, ConfigMap>,
    next_version: u64,
    injected_conflicts: u32,
    config_map_reads: u32,
}

pub fn at(millis: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + ChronoDuration::milliseconds(millis)
}

pub fn fast_config() -> PodConfig {
    PodConfig {
        poll_interval_ms: 20,
        log_interval_ms: 20,
        max_observation_failures: 3,
        deletion_timeout_secs: 2,
        ..PodConfig::default()
    }
}

impl FakeCluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn insert_pod(&self, pod: Pod) {
        let name = pod.metadata.name.clone().unwrap();
        self.state().pods.insert(name, pod);
    }

    pub fn pod(&self, name: &str) -> Option<Pod> {
        self.state().pods.get(name).cloned()
    }

    pub fn pod_names(&self) -> Vec<String> {
        self.state().pods.keys().cloned().collect()
    }

    pub fn deleted(&self) -> Vec<String> {
        self.state().deleted.clone()
    }

    pub fn remove_pod(&self, name: &str) {
        self.state().pods.remove(name);
    }

    pub fn set_phase(&self, name: &str, phase: &str) {
        if let Some(pod) = self.state().pods.get_mut(name) {
            pod.status.get_or_insert_with(PodStatus::default).phase = Some(phase.to_string());
        }
    }

    pub fn finish(&self, name: &str, phase: &str, exit_code: i32, reason: &str) {
        if let Some(pod) = self.state().pods.get_mut(name) {
            let status = pod.status.get_or_insert_with(PodStatus::default);
            status.phase = Some(phase.to_string());
            status.container_statuses = Some(vec![ContainerStatus {
                name: "script".into(),
                state: Some(ContainerState {
                    terminated: Some(ContainerStateTerminated {
                        exit_code,
                        reason: Some(reason.to_string()),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            }]);
        }
    }

    pub fn append_log(&self, name: &str, timestamp: DateTime<Utc>, text: &str) {
        self.state()
            .logs
            .entry(name.to_string())
            .or_default()
            .push((timestamp, text.to_string()));
    }

    pub fn push_event(&self, pod_uid: &str, type_: &str, reason: &str, message: &str) {
        let mut state = self.state();
        let index = state.events.get(pod_uid).map_or(0, Vec::len);
        let event = Event {
            metadata: ObjectMeta {
                name: Some(format!("{}.{}", pod_uid, index)),
                uid: Some(format!("event-{}-{}", pod_uid, index)),
                ..Default::default()
            },
            type_: Some(type_.into()),
            reason: Some(reason.into()),
            message: Some(message.into()),
            ..Default::default()
        };
        state
            .events
            .entry(pod_uid.to_string())
            .or_default()
            .push(event.clone());
        if let Some(subscribers) = state.subscribers.get_mut(pod_uid) {
            subscribers.retain(|tx| tx.unbounded_send(Ok(event.clone())).is_ok());
        }
    }

    pub fn set_events_unavailable(&self, unavailable: bool) {
        self.state().events_unavailable = unavailable;
    }

    pub fn fail_gets(&self, count: u32) {
        self.state().failing_gets = count;
    }

    pub fn fail_log_reads(&self, count: u32) {
        self.state().failing_log_reads = count;
    }

    pub fn hang_log_reads(&self, hanging: bool) {
        self.state().hanging_log_reads = hanging;
    }

    pub fn fail_deletes(&self, failing: bool) {
        self.state().failing_deletes = failing;
    }

    pub fn inject_conflicts(&self, count: u32) {
        self.state().injected_conflicts = count;
    }

    pub fn config_map_reads(&self) -> u32 {
        self.state().config_map_reads
    }

    pub fn config_map_data(&self, name: &str) -> BTreeMap<String, String> {
        self.state()
            .config_maps
            .get(name)
            .and_then(|cm| cm.data.clone())
            .unwrap_or_default()
    }

    /// Change a value behind every agent's back.
    pub fn write_config_map_value(&self, name: &str, key: &str, value: &str) {
        let mut state = self.state();
        state.next_version += 1;
        let version = state.next_version.to_string();
        let cm = state.config_maps.entry(name.to_string()).or_insert_with(|| ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            ..Default::default()
        });
        cm.data
            .get_or_insert_with(BTreeMap::new)
            .insert(key.to_string(), value.to_string());
        cm.metadata.resource_version = Some(version);
    }
}

fn matches_selector(pod: &Pod, selector: &str) -> bool {
    let labels = pod.metadata.labels.clone().unwrap_or_default();
    selector.split(',').all(|term| match term.split_once('=') {
        Some((key, value)) => labels.get(key).map(String::as_str) == Some(value),
        None => labels.contains_key(term),
    })
}

#[async_trait]
impl PodApi for FakeCluster {
    async fn create_pod(&self, pod: &Pod) -> Result<Pod, ExecutorError> {
        let mut state = self.state();
        let name = pod.metadata.name.clone().unwrap_or_default();
        if state.pods.contains_key(&name) {
            return Err(ExecutorError::Conflict(format!("pods \"{}\" already exists", name)));
        }
        let mut created = pod.clone();
        created.metadata.uid = Some(format!("uid-{}", name));
        created.metadata.creation_timestamp = Some(Time(Utc::now()));
        created.status = Some(PodStatus {
            phase: Some("Pending".into()),
            ..Default::default()
        });
        state.pods.insert(name, created.clone());
        Ok(created)
    }

    async fn get_pod(&self, name: &str) -> Result<Option<Pod>, ExecutorError> {
        let mut state = self.state();
        if state.failing_gets > 0 {
            state.failing_gets -= 1;
            return Err(ExecutorError::Kubernetes("connection reset by peer".into()));
        }
        Ok(state.pods.get(name).cloned())
    }

    async fn delete_pod(&self, name: &str) -> Result<(), ExecutorError> {
        let mut state = self.state();
        if state.failing_deletes {
            return Err(ExecutorError::Kubernetes("delete rejected".into()));
        }
        if state.pods.remove(name).is_some() {
            state.deleted.push(name.to_string());
        }
        Ok(())
    }

    async fn list_pods(&self, label_selector: &str) -> Result<Vec<Pod>, ExecutorError> {
        Ok(self
            .state()
            .pods
            .values()
            .filter(|pod| matches_selector(pod, label_selector))
            .cloned()
            .collect())
    }

    async fn pod_logs(
        &self,
        name: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<String, ExecutorError> {
        let hanging = self.state().hanging_log_reads;
        if hanging {
            std::future::pending::<()>().await;
        }
        let mut state = self.state();
        if state.failing_log_reads > 0 {
            state.failing_log_reads -= 1;
            return Err(ExecutorError::Kubernetes("log stream interrupted".into()));
        }
        // The real API only honours whole seconds.
        let since = since.map(|t| t.duration_trunc(ChronoDuration::seconds(1)).unwrap());
        let mut text = String::new();
        for (timestamp, line) in state.logs.get(name).into_iter().flatten() {
            if since.map_or(true, |since| *timestamp >= since) {
                text.push_str(&format!(
                    "{} {}\n",
                    timestamp.to_rfc3339_opts(chrono::SecondsFormat::Nanos, true),
                    line
                ));
            }
        }
        Ok(text)
    }

    async fn watch_events(&self, pod_uid: &str) -> Result<EventStream, ExecutorError> {
        let mut state = self.state();
        if state.events_unavailable {
            return Err(ExecutorError::Kubernetes("events are forbidden".into()));
        }
        let (tx, rx) = stream_channel::unbounded();
        for event in state.events.get(pod_uid).into_iter().flatten() {
            let _ = tx.unbounded_send(Ok(event.clone()));
        }
        state
            .subscribers
            .entry(pod_uid.to_string())
            .or_default()
            .push(tx);
        Ok(rx.boxed())
    }
}

#[async_trait]
impl ConfigMapApi for FakeCluster {
    async fn get_config_map(&self, name: &str) -> Result<Option<ConfigMap>, ExecutorError> {
        let mut state = self.state();
        state.config_map_reads += 1;
        Ok(state.config_maps.get(name).cloned())
    }

    async fn create_config_map(&self, config_map: &ConfigMap) -> Result<ConfigMap, ExecutorError> {
        let mut state = self.state();
        let name = config_map.metadata.name.clone().unwrap_or_default();
        if state.config_maps.contains_key(&name) {
            return Err(ExecutorError::Conflict(format!("configmaps \"{}\" already exists", name)));
        }
        state.next_version += 1;
        let mut stored = config_map.clone();
        stored.metadata.resource_version = Some(state.next_version.to_string());
        state.config_maps.insert(name, stored.clone());
        Ok(stored)
    }

    async fn patch_config_map(
        &self,
        name: &str,
        resource_version: &str,
        data: &BTreeMap<String, String>,
    ) -> Result<ConfigMap, ExecutorError> {
        let mut state = self.state();
        if state.injected_conflicts > 0 {
            state.injected_conflicts -= 1;
            // Someone else got there first.
            state.next_version += 1;
            let version = state.next_version.to_string();
            if let Some(cm) = state.config_maps.get_mut(name) {
                cm.metadata.resource_version = Some(version);
            }
            return Err(ExecutorError::Conflict("the object has been modified".into()));
        }
        state.next_version += 1;
        let version = state.next_version.to_string();
        let Some(cm) = state.config_maps.get_mut(name) else {
            return Err(ExecutorError::NotFound(format!("configmaps \"{}\" not found", name)));
        };
        if cm.metadata.resource_version.as_deref() != Some(resource_version) {
            return Err(ExecutorError::Conflict("the object has been modified".into()));
        }
        let merged = cm.data.get_or_insert_with(BTreeMap::new);
        for (key, value) in data {
            merged.insert(key.clone(), value.clone());
        }
        cm.metadata.resource_version = Some(version);
        Ok(cm.clone())
    }
}
