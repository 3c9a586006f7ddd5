use crate::identity::{platform_impersonation, rewrite_special_variables, Identity, Impersonation};
use crate::process_tree::terminate_tree;
use command_group::{AsyncCommandGroup, AsyncGroupChild};
use executor_core::backend::{ExecutionBackend, LaunchedUnit};
use executor_core::config::ProcessConfig;
use executor_core::output::{output_channel, OutputReceiver, OutputSender};
use executor_core::{
    exit_codes, BackendKind, ExecutionId, ExecutionRequest, ExecutionResult, ExecutorError,
    OutputChannel, OutputLine,
};
use std::collections::HashMap;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How long stream readers may keep draining after the process exited,
/// e.g. while a detached grandchild still holds the pipe.
const READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Process backend: runs the command directly on this host, optionally as
/// another local user.
pub struct ProcessBackend {
    name: String,
    termination_grace: Duration,
    impersonation: Arc<dyn Impersonation>,
}

/// How a supervised process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    pub code: i32,
    /// True when the process was stopped by cancellation; `code` is then
    /// the cancellation sentinel rather than the child's own.
    pub canceled: bool,
}

/// A launched process. Owned by whoever called [`ProcessBackend::start`].
pub struct ProcessHandle {
    execution_id: ExecutionId,
    pid: Option<u32>,
    identity: Identity,
    output: Option<OutputReceiver>,
    cancel: CancellationToken,
    supervisor: JoinHandle<ProcessExit>,
}

impl ProcessBackend {
    pub fn new(config: &ProcessConfig) -> Self {
        Self {
            name: "process".to_string(),
            termination_grace: config.termination_grace(),
            impersonation: platform_impersonation(),
        }
    }

    pub fn with_impersonation(mut self, impersonation: Arc<dyn Impersonation>) -> Self {
        self.impersonation = impersonation;
        self
    }

    pub fn with_termination_grace(mut self, grace: Duration) -> Self {
        self.termination_grace = grace;
        self
    }

    /// Launch the request's command with its own cancellation token.
    pub fn start(&self, request: &ExecutionRequest) -> Result<ProcessHandle, ExecutorError> {
        self.start_with_cancel(request, CancellationToken::new())
    }

    /// Launch the request's command; cancelling `cancel` terminates it.
    ///
    /// Fails before any output is produced if the working directory is
    /// invalid, the identity cannot be assumed, or the executable cannot be
    /// spawned.
    pub fn start_with_cancel(
        &self,
        request: &ExecutionRequest,
        cancel: CancellationToken,
    ) -> Result<ProcessHandle, ExecutorError> {
        let working_dir = match &request.working_dir {
            Some(dir) if !dir.is_dir() => {
                return Err(ExecutorError::Launch(format!(
                    "working directory {} does not exist",
                    dir.display()
                )));
            }
            Some(dir) => dir.clone(),
            None => std::env::current_dir()?,
        };

        let mut command = Command::new(&request.command);
        command
            .args(&request.args)
            .current_dir(&working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut env: HashMap<String, String> = std::env::vars_os()
            .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
            .collect();
        let identity = match &request.credential {
            Some(credential) => {
                let identity = self.impersonation.impersonate(credential, &mut command)?;
                rewrite_special_variables(&mut env, &identity);
                identity
            }
            None => self.impersonation.current(),
        };
        // Caller variables win.
        env.extend(request.env.iter().map(|(k, v)| (k.clone(), v.clone())));
        command.env_clear().envs(&env);

        let mut child = command.group_spawn().map_err(|e| {
            ExecutorError::Launch(format!("failed to start {}: {}", request.command, e))
        })?;
        let pid = child.id();

        let (tx, output) = output_channel();
        let _ = tx.send(OutputLine::debug(describe_launch(request, &working_dir, &identity)));

        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.inner().stdout.take() {
            readers.push(spawn_reader(stdout, OutputChannel::Stdout, tx.clone()));
        }
        if let Some(stderr) = child.inner().stderr.take() {
            readers.push(spawn_reader(stderr, OutputChannel::Stderr, tx.clone()));
        }
        drop(tx);

        info!(execution_id = %request.id, ?pid, identity = %identity, "Process started");

        let supervisor = tokio::spawn(supervise(
            child,
            readers,
            cancel.clone(),
            self.termination_grace,
            request.id.clone(),
        ));

        Ok(ProcessHandle {
            execution_id: request.id.clone(),
            pid,
            identity,
            output: Some(output),
            cancel,
            supervisor,
        })
    }
}

impl ProcessHandle {
    pub fn execution_id(&self) -> &ExecutionId {
        &self.execution_id
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// The tagged output stream. Starts with one debug line describing the
    /// launch. Can be taken once.
    pub fn take_output(&mut self) -> Option<OutputReceiver> {
        self.output.take()
    }

    /// Request termination of the whole process tree.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// The child's raw exit code, or [`exit_codes::CANCELED`] if it was
    /// stopped by cancellation.
    pub async fn wait(self) -> i32 {
        self.wait_exit().await.code
    }

    pub async fn wait_exit(self) -> ProcessExit {
        match self.supervisor.await {
            Ok(exit) => exit,
            Err(e) => {
                warn!(execution_id = %self.execution_id, error = %e, "Process supervisor failed");
                ProcessExit {
                    code: exit_codes::FATAL,
                    canceled: false,
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl ExecutionBackend for ProcessBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Process
    }

    async fn launch(
        &self,
        request: &ExecutionRequest,
        cancel: CancellationToken,
    ) -> Result<LaunchedUnit, ExecutorError> {
        let mut handle = self.start_with_cancel(request, cancel)?;
        let output = handle
            .take_output()
            .ok_or_else(|| ExecutorError::Launch("process output already taken".into()))?;
        let completion = tokio::spawn(async move {
            let exit = handle.wait_exit().await;
            if exit.canceled {
                ExecutionResult::canceled()
            } else {
                ExecutionResult::from_exit_code(exit.code)
            }
        });
        Ok(LaunchedUnit { output, completion })
    }
}

fn describe_launch(
    request: &ExecutionRequest,
    working_dir: &std::path::Path,
    identity: &Identity,
) -> String {
    let mut line = format!("Starting {}", request.command);
    for arg in &request.args {
        line.push(' ');
        line.push_str(arg);
    }
    line.push_str(&format!(" in {} as {}", working_dir.display(), identity));
    line
}

fn spawn_reader<R>(stream: R, channel: OutputChannel, tx: OutputSender) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(stream);
        let mut buf = Vec::with_capacity(256);
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    while matches!(buf.last(), Some(b'\n' | b'\r')) {
                        buf.pop();
                    }
                    let text = String::from_utf8_lossy(&buf).into_owned();
                    // Keep draining even with nobody listening so the child never blocks.
                    let _ = tx.send(OutputLine::new(channel, text));
                }
                Err(e) => {
                    debug!(%channel, error = %e, "Stream read failed");
                    break;
                }
            }
        }
    })
}

async fn supervise(
    mut child: AsyncGroupChild,
    readers: Vec<JoinHandle<()>>,
    cancel: CancellationToken,
    grace: Duration,
    execution_id: ExecutionId,
) -> ProcessExit {
    let pgid = child.id();
    let exit = tokio::select! {
        status = child.wait() => ProcessExit {
            code: match status {
                Ok(status) => exit_code_of(status),
                Err(e) => {
                    warn!(execution_id = %execution_id, error = %e, "Waiting for process failed");
                    exit_codes::FATAL
                }
            },
            canceled: false,
        },
        _ = cancel.cancelled() => {
            info!(execution_id = %execution_id, ?pgid, "Terminating process tree");
            let graceful = terminate_tree(&mut child, grace).await;
            debug!(execution_id = %execution_id, graceful, "Process tree stopped");
            ProcessExit {
                code: exit_codes::CANCELED,
                canceled: true,
            }
        }
    };

    for mut reader in readers {
        if tokio::time::timeout(READER_DRAIN_TIMEOUT, &mut reader).await.is_err() {
            debug!(execution_id = %execution_id, "Output still open after exit; detaching reader");
            reader.abort();
        }
    }

    info!(execution_id = %execution_id, code = exit.code, canceled = exit.canceled, "Process exited");
    exit
}

fn exit_code_of(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return -signal;
        }
    }
    exit_codes::FATAL
}
