//! Routes each request to a backend, serializes work per execution id, and
//! relays the backend's output to the caller in production order.

use crate::backend::{ExecutionBackend, LaunchedUnit};
use crate::config::AgentConfig;
use crate::error::ExecutorError;
use crate::handle::ExecutionHandle;
use crate::lifecycle::{exit_codes, ExecutionResult};
use crate::live::{LiveExecutions, LiveRegistration};
use crate::output::OutputLine;
use crate::request::{BackendKind, ExecutionId, ExecutionRequest};
use crate::semaphore::KeyedSemaphore;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub struct ExecutionOrchestrator {
    backends: HashMap<BackendKind, Arc<dyn ExecutionBackend>>,
    default_backend: BackendKind,
    locks: KeyedSemaphore<ExecutionId>,
    live: LiveExecutions,
    cancel_grace: Duration,
}

impl ExecutionOrchestrator {
    pub fn new(default_backend: BackendKind, cancel_grace: Duration) -> Self {
        Self {
            backends: HashMap::new(),
            default_backend,
            locks: KeyedSemaphore::new(),
            live: LiveExecutions::new(),
            cancel_grace,
        }
    }

    pub fn from_config(config: &AgentConfig) -> Self {
        Self::new(config.default_backend, config.orchestrator.cancel_grace())
    }

    /// Register a backend under its kind, replacing any previous one.
    pub fn register(&mut self, backend: Arc<dyn ExecutionBackend>) {
        info!(backend = backend.name(), kind = %backend.kind(), "Registered backend");
        self.backends.insert(backend.kind(), backend);
    }

    pub fn with_backend(mut self, backend: Arc<dyn ExecutionBackend>) -> Self {
        self.register(backend);
        self
    }

    /// Shared view of the ids currently being executed.
    pub fn live_executions(&self) -> LiveExecutions {
        self.live.clone()
    }

    pub fn locks(&self) -> &KeyedSemaphore<ExecutionId> {
        &self.locks
    }

    /// Run one request to a terminal state.
    ///
    /// Every output line is sent to `sink` in the order the backend produced
    /// it; the caller must keep receiving until it cancels. Launch failures and invalid
    /// requests are `Err`; everything after launch is an `ExecutionResult`.
    pub async fn execute(
        &self,
        request: ExecutionRequest,
        sink: mpsc::Sender<OutputLine>,
        cancel: CancellationToken,
    ) -> Result<ExecutionResult, ExecutorError> {
        request.validate()?;

        let kind = request.backend.unwrap_or(self.default_backend);
        let backend = self
            .backends
            .get(&kind)
            .cloned()
            .ok_or_else(|| ExecutorError::BackendNotFound(kind.to_string()))?;

        let id = request.id.clone();
        debug!(execution_id = %id, "Waiting for execution lock");
        let _lock = tokio::select! {
            guard = self.locks.acquire(id.clone()) => guard,
            _ = cancel.cancelled() => {
                info!(execution_id = %id, "Canceled while waiting for execution lock");
                return Ok(ExecutionResult::canceled()
                    .with_diagnostic("canceled before the execution started"));
            }
        };
        let _live = LiveRegistration::register(&self.live, id.clone());

        let mut handle = ExecutionHandle::new(id.clone(), kind, CancellationToken::new());
        info!(
            execution_id = %id,
            backend = backend.name(),
            command = %request.command,
            "Starting execution"
        );

        let unit = match backend.launch(&request, handle.cancel.clone()).await {
            Ok(unit) => unit,
            Err(e) => {
                error!(execution_id = %id, error = %e, "Launch failed");
                handle.mark_finished(&ExecutionResult::failed(exit_codes::FATAL, e.to_string()));
                return Err(e);
            }
        };
        handle.mark_running();

        let (result, reclaimed) = self.drive(&handle, unit, &sink, &cancel).await;
        handle.mark_finished(&result);
        if reclaimed {
            handle.mark_reclaimed();
        }

        info!(
            execution_id = %id,
            state = %result.state,
            exit_code = result.exit_code,
            elapsed_ms = handle.elapsed().num_milliseconds(),
            "Execution finished"
        );
        Ok(result)
    }

    /// Relay output until the unit completes, or until a cancelled unit
    /// overruns the grace period. The bool reports whether the backend
    /// finished releasing its resources.
    ///
    /// Once cancellation is requested, a caller that stops reading the sink
    /// cannot hold `execute` past the grace deadline.
    async fn drive(
        &self,
        handle: &ExecutionHandle,
        unit: LaunchedUnit,
        sink: &mpsc::Sender<OutputLine>,
        cancel: &CancellationToken,
    ) -> (ExecutionResult, bool) {
        let LaunchedUnit {
            mut output,
            mut completion,
        } = unit;
        let id = &handle.execution_id;
        let mut relay = Relay::new(sink, id);
        let mut output_open = true;
        let mut grace_deadline: Option<Instant> = None;
        let mut pending: Option<OutputLine> = None;

        loop {
            if let Some(line) = pending.take() {
                match relay.forward(line, cancel, grace_deadline).await {
                    Forward::Sent => {}
                    Forward::Interrupted(line) => {
                        grace_deadline = Some(self.request_cancel(handle));
                        pending = Some(line);
                    }
                    Forward::Expired => return Self::abandon(id),
                }
                continue;
            }

            tokio::select! {
                biased;

                line = output.recv(), if output_open => match line {
                    Some(line) => pending = Some(line),
                    None => output_open = false,
                },

                joined = &mut completion => {
                    let result = match joined {
                        Ok(result) => result,
                        Err(e) => {
                            error!(execution_id = %id, error = %e, "Backend supervisor died");
                            ExecutionResult::failed(
                                exit_codes::FATAL,
                                format!("backend supervisor failed: {}", e),
                            )
                        }
                    };
                    // Senders are gone once the supervisor returns.
                    let mut next = output.recv().await;
                    while let Some(line) = next {
                        match relay.forward(line, cancel, grace_deadline).await {
                            Forward::Sent => next = output.recv().await,
                            Forward::Interrupted(line) => {
                                grace_deadline = Some(Instant::now() + self.cancel_grace);
                                next = Some(line);
                            }
                            Forward::Expired => {
                                warn!(execution_id = %id, "Grace period ran out while delivering output; discarding the rest");
                                break;
                            }
                        }
                    }
                    return (result, true);
                }

                _ = cancel.cancelled(), if grace_deadline.is_none() => {
                    grace_deadline = Some(self.request_cancel(handle));
                }

                _ = tokio::time::sleep_until(grace_deadline.unwrap_or_else(Instant::now)),
                    if grace_deadline.is_some() =>
                {
                    return Self::abandon(id);
                }
            }
        }
    }

    fn request_cancel(&self, handle: &ExecutionHandle) -> Instant {
        info!(execution_id = %handle.execution_id, grace = ?self.cancel_grace, "Cancellation requested");
        handle.cancel.cancel();
        Instant::now() + self.cancel_grace
    }

    fn abandon(id: &ExecutionId) -> (ExecutionResult, bool) {
        warn!(
            execution_id = %id,
            "Backend did not stop within the grace period; abandoning, teardown continues in the background"
        );
        (
            ExecutionResult::canceled()
                .with_diagnostic("teardown did not finish within the cancellation grace period"),
            false,
        )
    }
}

enum Forward {
    Sent,
    /// Cancellation arrived while the sink was full; the line is handed back.
    Interrupted(OutputLine),
    Expired,
}

struct Relay<'a> {
    sink: &'a mpsc::Sender<OutputLine>,
    id: &'a ExecutionId,
    open: bool,
}

impl<'a> Relay<'a> {
    fn new(sink: &'a mpsc::Sender<OutputLine>, id: &'a ExecutionId) -> Self {
        Self {
            sink,
            id,
            open: true,
        }
    }

    /// Wait for sink capacity. Before cancellation the wait is unbounded;
    /// after it the wait ends at `deadline`.
    async fn forward(
        &mut self,
        line: OutputLine,
        cancel: &CancellationToken,
        deadline: Option<Instant>,
    ) -> Forward {
        if !self.open {
            return Forward::Sent;
        }
        tokio::select! {
            biased;

            permit = self.sink.reserve() => {
                match permit {
                    Ok(permit) => permit.send(line),
                    Err(_) => {
                        warn!(execution_id = %self.id, "Output sink closed; discarding further output");
                        self.open = false;
                    }
                }
                Forward::Sent
            }

            _ = cancel.cancelled(), if deadline.is_none() => Forward::Interrupted(line),

            _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)),
                if deadline.is_some() => Forward::Expired,
        }
    }
}
