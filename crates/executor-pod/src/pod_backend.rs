use crate::api::PodApi;
use crate::events::PodEventWatcher;
use crate::logs::{PodLogStreamer, SinceMarkerStore};
use crate::metrics::AgentMetrics;
use crate::naming::{
    execution_id_of, execution_label_value, pod_name, EXECUTION_ID_ANNOTATION,
    EXECUTION_ID_LABEL, MANAGED_BY_LABEL, SCRIPT_CONTAINER,
};
use crate::phase::{Observation, PhaseTracker, PodPhase};
use crate::poller::PodStatusPoller;
use crate::retry::backoff_delay;
use chrono::{DateTime, Utc};
use executor_core::backend::{ExecutionBackend, LaunchedUnit};
use executor_core::config::PodConfig;
use executor_core::output::{output_channel, OutputSender};
use executor_core::{
    exit_codes, BackendKind, ExecutionId, ExecutionRequest, ExecutionResult, ExecutorError,
    OutputLine,
};
use k8s_openapi::api::core::v1::{Container, EnvVar, Pod, PodSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const FINAL_DRAIN_ATTEMPTS: u32 = 3;
/// A single log read may take this many log intervals.
const LOG_READ_TIMEOUT_INTERVALS: u32 = 5;

/// Pod backend: runs the command as the single container of a transient pod.
#[derive(Clone)]
pub struct PodBackend {
    name: String,
    api: Arc<dyn PodApi>,
    config: PodConfig,
    markers: SinceMarkerStore,
    metrics: Option<Arc<AgentMetrics>>,
}

/// A pod created for one execution.
#[derive(Debug, Clone)]
pub struct PodRef {
    pub name: String,
    pub namespace: String,
    pub uid: Option<String>,
    pub execution_id: ExecutionId,
    pub created_at: DateTime<Utc>,
}

/// What observing a pod yields, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PodObservation {
    /// The merged phase advanced.
    Phase {
        phase: PodPhase,
        exit_code: Option<i32>,
        reason: Option<String>,
    },
    Log(OutputLine),
    /// Observation gave up before a terminal phase was seen.
    Lost(String),
}

impl PodBackend {
    pub fn new(api: Arc<dyn PodApi>, config: PodConfig) -> Self {
        Self {
            name: "pod".to_string(),
            api,
            config,
            markers: SinceMarkerStore::new(),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<AgentMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn since_markers(&self) -> &SinceMarkerStore {
        &self.markers
    }

    /// The pod that would run `request`.
    pub fn pod_spec(&self, request: &ExecutionRequest) -> Pod {
        let name = pod_name(&request.id);

        let mut labels = BTreeMap::new();
        labels.insert(MANAGED_BY_LABEL.to_string(), self.config.agent_label.clone());
        labels.insert(
            EXECUTION_ID_LABEL.to_string(),
            execution_label_value(&request.id),
        );
        let mut annotations = BTreeMap::new();
        annotations.insert(
            EXECUTION_ID_ANNOTATION.to_string(),
            request.id.as_str().to_string(),
        );

        let mut env: Vec<EnvVar> = request
            .env
            .iter()
            .map(|(name, value)| EnvVar {
                name: name.clone(),
                value: Some(value.clone()),
                ..EnvVar::default()
            })
            .collect();
        env.sort_by(|a, b| a.name.cmp(&b.name));

        let container = Container {
            name: SCRIPT_CONTAINER.to_string(),
            image: Some(self.config.image.clone()),
            command: Some(vec![request.command.clone()]),
            args: (!request.args.is_empty()).then(|| request.args.clone()),
            working_dir: request
                .working_dir
                .as_ref()
                .map(|dir| dir.display().to_string()),
            env: (!env.is_empty()).then_some(env),
            ..Container::default()
        };

        Pod {
            metadata: ObjectMeta {
                name: Some(name),
                namespace: Some(self.config.namespace.clone()),
                labels: Some(labels),
                annotations: Some(annotations),
                ..ObjectMeta::default()
            },
            spec: Some(PodSpec {
                containers: vec![container],
                restart_policy: Some("Never".to_string()),
                service_account_name: self.config.service_account.clone(),
                ..PodSpec::default()
            }),
            ..Pod::default()
        }
    }

    /// Create the pod for `request`. Fails without side effects the caller
    /// has to clean up.
    ///
    /// A pod this agent already created for the same execution id, for
    /// instance before a restart, is adopted instead of recreated.
    pub async fn create(&self, request: &ExecutionRequest) -> Result<PodRef, ExecutorError> {
        if request.credential.is_some() {
            return Err(ExecutorError::Launch(
                "the pod backend cannot run as another user".into(),
            ));
        }

        let pod = self.pod_spec(request);
        let name = pod.metadata.name.clone().unwrap_or_default();
        let created = match self.api.create_pod(&pod).await {
            Ok(created) => created,
            Err(ExecutorError::Conflict(_)) => return self.adopt(request, &name).await,
            Err(e) => {
                return Err(ExecutorError::Launch(format!(
                    "failed to create pod {}: {}",
                    name, e
                )))
            }
        };

        // A marker left by an earlier pod of the same name would hide output.
        self.markers.remove(&name);
        if let Some(metrics) = &self.metrics {
            metrics.record_pod_created();
        }

        let pod = self.pod_ref(&created, name, &request.id);
        info!(execution_id = %pod.execution_id, pod = %pod.name, namespace = %pod.namespace, "Pod created");
        Ok(pod)
    }

    async fn adopt(&self, request: &ExecutionRequest, name: &str) -> Result<PodRef, ExecutorError> {
        let refuse = |why: &str| {
            ExecutorError::Launch(format!("failed to create pod {}: {}", name, why))
        };
        let existing = self
            .api
            .get_pod(name)
            .await
            .map_err(|e| refuse(&e.to_string()))?
            .ok_or_else(|| refuse("it was deleted while being created"))?;

        let owner = existing
            .metadata
            .labels
            .as_ref()
            .and_then(|labels| labels.get(MANAGED_BY_LABEL));
        if owner != Some(&self.config.agent_label)
            || execution_id_of(&existing).as_ref() != Some(&request.id)
        {
            return Err(refuse("a pod of that name belongs to another execution"));
        }
        if existing.metadata.deletion_timestamp.is_some() {
            return Err(refuse("the existing pod is being deleted"));
        }

        let pod = self.pod_ref(&existing, name.to_string(), &request.id);
        info!(execution_id = %pod.execution_id, pod = %pod.name, namespace = %pod.namespace, "Adopted existing pod");
        Ok(pod)
    }

    fn pod_ref(&self, pod: &Pod, name: String, execution_id: &ExecutionId) -> PodRef {
        PodRef {
            name,
            namespace: pod
                .metadata
                .namespace
                .clone()
                .unwrap_or_else(|| self.config.namespace.clone()),
            uid: pod.metadata.uid.clone(),
            execution_id: execution_id.clone(),
            created_at: pod
                .metadata
                .creation_timestamp
                .as_ref()
                .map(|t| t.0)
                .unwrap_or_else(Utc::now),
        }
    }

    /// Follow `pod` until it reaches a terminal phase.
    ///
    /// Yields phase transitions and log lines; the stream ends after the
    /// terminal phase and the final log read, after a [`PodObservation::Lost`],
    /// or when `cancel` fires.
    pub fn observe(
        &self,
        pod: &PodRef,
        cancel: CancellationToken,
    ) -> UnboundedReceiver<PodObservation> {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(self.clone().track(pod.clone(), tx, cancel));
        rx
    }

    /// Delete `pod`, giving up after the configured deletion timeout.
    pub async fn delete(&self, pod: &PodRef) -> Result<(), ExecutorError> {
        let deleted =
            tokio::time::timeout(self.config.deletion_timeout(), self.api.delete_pod(&pod.name))
                .await
                .map_err(|_| {
                    ExecutorError::Kubernetes(format!("deleting pod {} timed out", pod.name))
                })?;
        deleted?;
        self.markers.remove(&pod.name);
        if let Some(metrics) = &self.metrics {
            metrics.record_pod_deleted();
        }
        info!(execution_id = %pod.execution_id, pod = %pod.name, "Pod deleted");
        Ok(())
    }

    async fn track(
        self,
        pod: PodRef,
        tx: UnboundedSender<PodObservation>,
        cancel: CancellationToken,
    ) {
        let observers = cancel.child_token();
        let _stop_observers = observers.clone().drop_guard();
        let max_failures = self.config.max_observation_failures;

        let (reports_tx, mut reports) = mpsc::unbounded_channel();
        let poller = PodStatusPoller::new(
            self.api.clone(),
            &pod.name,
            self.config.poll_interval(),
            max_failures,
        );
        tokio::spawn(poller.run(reports_tx.clone(), observers.clone()));
        if let Some(uid) = &pod.uid {
            let watcher = PodEventWatcher::new(
                self.api.clone(),
                &pod.name,
                uid,
                self.config.poll_interval(),
                max_failures,
            );
            tokio::spawn(watcher.run(reports_tx.clone(), observers.clone()));
        }
        drop(reports_tx);

        let streamer = PodLogStreamer::new(self.api.clone(), &pod.name, self.markers.clone())
            .with_read_timeout(self.config.log_interval() * LOG_READ_TIMEOUT_INTERVALS);
        let mut tracker = PhaseTracker::default();
        let mut log_tick = tokio::time::interval(self.config.log_interval());
        log_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut log_failures = 0u32;
        let mut next_log_read = Instant::now();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                observation = reports.recv() => match observation {
                    Some(Observation::Phase(report)) => {
                        if tracker.observe(&report) {
                            debug!(pod = %pod.name, phase = %tracker.phase(), source = ?report.source, "Pod phase advanced");
                            let _ = tx.send(PodObservation::Phase {
                                phase: tracker.phase(),
                                exit_code: tracker.exit_code(),
                                reason: tracker.reason().map(str::to_string),
                            });
                            if tracker.phase().is_terminal() {
                                break;
                            }
                        }
                    }
                    Some(Observation::Diagnostic(text)) => {
                        let _ = tx.send(PodObservation::Log(OutputLine::debug(text)));
                    }
                    Some(Observation::Lost(reason)) => {
                        let _ = tx.send(PodObservation::Lost(reason));
                        return;
                    }
                    None => {
                        let _ = tx.send(PodObservation::Lost(
                            "pod observers stopped before a terminal phase".into(),
                        ));
                        return;
                    }
                },
                _ = log_tick.tick(), if tracker.phase().has_started() => {
                    if Instant::now() < next_log_read {
                        continue;
                    }
                    match streamer.read_new_lines().await {
                        Ok(lines) => {
                            log_failures = 0;
                            for line in lines {
                                let _ = tx.send(PodObservation::Log(OutputLine::stdout(line)));
                            }
                        }
                        Err(e) => {
                            log_failures += 1;
                            warn!(pod = %pod.name, failures = log_failures, error = %e, "Pod log read failed");
                            if log_failures >= max_failures {
                                let _ = tx.send(PodObservation::Lost(format!(
                                    "log streaming failed {} times in a row: {}",
                                    log_failures, e
                                )));
                                return;
                            }
                            next_log_read = Instant::now()
                                + backoff_delay(self.config.log_interval(), log_failures);
                        }
                    }
                }
            }
        }

        observers.cancel();
        let remaining = streamer
            .drain(FINAL_DRAIN_ATTEMPTS, self.config.log_interval())
            .await;
        for line in remaining {
            let _ = tx.send(PodObservation::Log(OutputLine::stdout(line)));
        }
    }

    async fn supervise(
        self,
        pod: PodRef,
        tx: OutputSender,
        cancel: CancellationToken,
    ) -> ExecutionResult {
        let observing = CancellationToken::new();
        let mut observations = self.observe(&pod, observing.clone());
        let mut terminal: Option<ExecutionResult> = None;

        let result = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!(execution_id = %pod.execution_id, pod = %pod.name, "Cancelling pod");
                    break ExecutionResult::canceled();
                }
                observation = observations.recv() => match observation {
                    Some(PodObservation::Log(line)) => {
                        let _ = tx.send(line);
                    }
                    Some(PodObservation::Phase { phase, exit_code, reason }) => {
                        let _ = tx.send(OutputLine::debug(format!("Pod {} is {}", pod.name, phase)));
                        if phase.is_terminal() {
                            terminal = Some(terminal_result(phase, exit_code, reason));
                        }
                    }
                    Some(PodObservation::Lost(reason)) => {
                        warn!(execution_id = %pod.execution_id, pod = %pod.name, reason = %reason, "Lost track of pod");
                        break ExecutionResult::failed(
                            exit_codes::OBSERVATION_LOST,
                            format!("observation lost: {}", reason),
                        );
                    }
                    None => {
                        break terminal.take().unwrap_or_else(|| {
                            ExecutionResult::failed(
                                exit_codes::OBSERVATION_LOST,
                                "observation lost: tracking stopped without a terminal phase",
                            )
                        });
                    }
                }
            }
        };
        observing.cancel();
        drop(tx);

        self.markers.remove(&pod.name);
        if let Err(e) = self.delete(&pod).await {
            warn!(pod = %pod.name, error = %e, "Pod deletion failed; leaving it to the orphan reconciler");
        }
        info!(
            execution_id = %pod.execution_id,
            pod = %pod.name,
            state = %result.state,
            exit_code = result.exit_code,
            "Pod execution finished"
        );
        result
    }
}

fn terminal_result(phase: PodPhase, exit_code: Option<i32>, reason: Option<String>) -> ExecutionResult {
    match phase {
        PodPhase::Succeeded => ExecutionResult::from_exit_code(exit_code.unwrap_or(0)),
        _ => {
            let code = exit_code.filter(|code| *code != 0).unwrap_or(exit_codes::FATAL);
            ExecutionResult::failed(code, reason.unwrap_or_else(|| "pod failed".to_string()))
        }
    }
}

#[async_trait::async_trait]
impl ExecutionBackend for PodBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Pod
    }

    async fn launch(
        &self,
        request: &ExecutionRequest,
        cancel: CancellationToken,
    ) -> Result<LaunchedUnit, ExecutorError> {
        let pod = self.create(request).await?;
        let (tx, output) = output_channel();
        let _ = tx.send(OutputLine::debug(format!(
            "Created pod {} in namespace {} running {} on {}",
            pod.name, pod.namespace, request.command, self.config.image
        )));
        let completion = tokio::spawn(self.clone().supervise(pod, tx, cancel));
        Ok(LaunchedUnit { output, completion })
    }
}
