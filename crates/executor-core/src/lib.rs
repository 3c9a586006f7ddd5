pub mod backend;
pub mod background;
pub mod config;
pub mod error;
pub mod handle;
pub mod lifecycle;
pub mod live;
pub mod orchestrator;
pub mod output;
pub mod request;
pub mod semaphore;

pub use backend::{ExecutionBackend, LaunchedUnit};
pub use background::{spawn_background, BackgroundTask};
pub use config::AgentConfig;
pub use error::ExecutorError;
pub use handle::ExecutionHandle;
pub use lifecycle::{exit_codes, ExecutionResult, LifecycleState};
pub use live::{LiveExecutionSource, LiveExecutions};
pub use orchestrator::ExecutionOrchestrator;
pub use output::{OutputChannel, OutputLine};
pub use request::{BackendKind, Credential, ExecutionId, ExecutionRequest};
pub use semaphore::{KeyedGuard, KeyedSemaphore};
