use crate::error::ExecutorError;
use crate::lifecycle::ExecutionResult;
use crate::output::OutputReceiver;
use crate::request::{BackendKind, ExecutionRequest};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A started execution unit: its ordered output and the task supervising it.
///
/// `completion` resolves once the unit reached a terminal state and its
/// backend resources were released. Dropping the handle detaches the
/// supervisor, which keeps tearing the unit down in the background.
pub struct LaunchedUnit {
    pub output: OutputReceiver,
    pub completion: JoinHandle<ExecutionResult>,
}

/// Core backend trait. Every execution-unit strategy implements this.
#[async_trait::async_trait]
pub trait ExecutionBackend: Send + Sync {
    /// Name of this backend instance (for logs).
    fn name(&self) -> &str;

    fn kind(&self) -> BackendKind;

    /// Create the execution unit and start supervising it.
    ///
    /// Returns `Err` only for launch failures, before any output was produced.
    /// Cancelling `cancel` asks the supervisor to tear the unit down; the
    /// result then reports `Canceled`.
    async fn launch(
        &self,
        request: &ExecutionRequest,
        cancel: CancellationToken,
    ) -> Result<LaunchedUnit, ExecutorError>;
}
