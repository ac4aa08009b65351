//! Lifecycle of one worker process.
//!
//! A run moves through pre-start hooks, spawn, warm-up, post-start hooks,
//! async hooks and the control connection, then waits for the process to
//! exit and finishes with post-stop hooks. The terminal result is decided
//! once at the end of the run.

use std::ffi::OsString;
use std::fs::File;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use presetd_core::config::{Hooks, Preset};
use presetd_core::protocol::{ClientMessage, ServerMessage};
use tokio::process::{Child, Command};
use tokio::sync::{Semaphore, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::hooks::{self, HookError, HookPhase};
use crate::control::{ControlClient, ControlError};

/// Tunables for an instance. Tests shorten the delays.
#[derive(Debug, Clone)]
pub struct InstanceOptions {
    /// Program looked up on `PATH` when a preset sets no executable.
    pub default_executable: String,
    /// Time given to the worker to open its control port.
    pub startup_delay: Duration,
    /// Shared deadline for each blocking hook phase.
    pub hook_timeout: Duration,
    pub connect_timeout: Duration,
    pub send_timeout: Duration,
    /// Pause before retrying a failed control connection.
    pub reconnect_delay: Duration,
    /// Buffered control messages per run.
    pub event_capacity: usize,
}

impl Default for InstanceOptions {
    fn default() -> Self {
        Self {
            default_executable: "kanata".to_string(),
            startup_delay: Duration::from_millis(2500),
            hook_timeout: hooks::BLOCKING_HOOK_TIMEOUT,
            connect_timeout: Duration::from_secs(3),
            send_timeout: Duration::from_millis(200),
            reconnect_delay: Duration::from_secs(1),
            event_capacity: 64,
        }
    }
}

/// What to run: the launch-relevant part of a preset.
#[derive(Debug, Clone, Default)]
pub struct RunSpec {
    pub executable: Option<PathBuf>,
    pub config: Option<PathBuf>,
    pub tcp_port: u16,
    pub hooks: Hooks,
    pub extra_args: Vec<String>,
}

impl From<&Preset> for RunSpec {
    fn from(preset: &Preset) -> Self {
        Self {
            executable: preset.executable.clone(),
            config: preset.config.clone(),
            tcp_port: preset.tcp_port,
            hooks: preset.hooks.clone(),
            extra_args: preset.extra_args.clone(),
        }
    }
}

impl RunSpec {
    /// Worker argv after the program: `[-c <config>] --port <port> <extra args...>`.
    pub fn build_args(&self) -> Vec<OsString> {
        let mut args = Vec::with_capacity(self.extra_args.len() + 4);
        if let Some(config) = &self.config {
            args.push("-c".into());
            args.push(config.clone().into_os_string());
        }
        args.push("--port".into());
        args.push(self.tcp_port.to_string().into());
        args.extend(self.extra_args.iter().map(OsString::from));
        args
    }
}

/// Errors terminating an instance run.
#[derive(Debug, thiserror::Error)]
pub enum InstanceError {
    #[error("failed to find '{name}' on PATH: {source}")]
    ExecutableNotFound {
        name: String,
        #[source]
        source: which::Error,
    },

    #[error("failed to attach log file: {0}")]
    LogSink(#[source] std::io::Error),

    #[error("hook failed: {0}")]
    Hook(#[from] HookError),

    #[error("async hook failed, preset stopped: {0}")]
    AsyncHook(#[source] HookError),

    #[error("failed to start process {program:?}: {source}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to wait for worker process: {source}")]
    Wait {
        #[source]
        source: std::io::Error,
    },

    #[error("worker exited with {status}")]
    Exited { status: ExitStatus },

    #[error("instance task ended without reporting a result")]
    Aborted,
}

/// Streams of one run.
#[derive(Debug)]
pub struct InstanceRun {
    /// Terminal result, delivered exactly once.
    pub result: oneshot::Receiver<Result<(), InstanceError>>,
    /// Control-channel messages received during the run.
    pub events: mpsc::Receiver<ServerMessage>,
}

/// A reusable supervision slot for one worker process at a time.
#[derive(Debug)]
pub struct Instance {
    /// Held for the whole of a run; a new run waits for the previous one to retire.
    process_slot: Arc<Semaphore>,
    control: Arc<ControlClient>,
    options: InstanceOptions,
}

impl Instance {
    pub fn new(options: InstanceOptions) -> Self {
        Self {
            process_slot: Arc::new(Semaphore::new(1)),
            control: Arc::new(ControlClient::new(
                options.connect_timeout,
                options.send_timeout,
            )),
            options,
        }
    }

    /// Start a run in the background and return its streams.
    ///
    /// Cancelling `cancel` stops the run; a run stopped that way reports
    /// success unless an async hook failed first. Worker stdout and stderr
    /// go to `log`.
    pub fn run_nonblocking(
        &self,
        cancel: CancellationToken,
        spec: RunSpec,
        log: File,
    ) -> Result<InstanceRun, InstanceError> {
        let program = match &spec.executable {
            Some(path) => path.clone(),
            None => which::which(&self.options.default_executable).map_err(|source| {
                InstanceError::ExecutableNotFound {
                    name: self.options.default_executable.clone(),
                    source,
                }
            })?,
        };
        let args = spec.build_args();
        let stdout = log.try_clone().map_err(InstanceError::LogSink)?;
        let launch = Launch {
            program,
            args,
            stdout,
            stderr: log,
        };

        let (result_tx, result_rx) = oneshot::channel();
        let (event_tx, event_rx) = mpsc::channel(self.options.event_capacity);
        let process_slot = Arc::clone(&self.process_slot);
        let lifecycle = Lifecycle {
            control: Arc::clone(&self.control),
            options: self.options.clone(),
            spec,
            events: event_tx,
        };

        tokio::spawn(async move {
            let Ok(_permit) = process_slot.acquire_owned().await else {
                return;
            };
            if cancel.is_cancelled() {
                debug!("Run cancelled before it started");
                let _ = result_tx.send(Ok(()));
                return;
            }
            let internal = cancel.child_token();
            let result = lifecycle.drive(&cancel, &internal, launch).await;
            internal.cancel();
            let _ = result_tx.send(result);
        });

        Ok(InstanceRun {
            result: result_rx,
            events: event_rx,
        })
    }

    /// Send a message over this instance's current control connection.
    pub async fn send_client_message(&self, msg: ClientMessage) -> Result<(), ControlError> {
        self.control.send(msg).await
    }
}

struct Launch {
    program: PathBuf,
    args: Vec<OsString>,
    stdout: File,
    stderr: File,
}

struct Lifecycle {
    control: Arc<ControlClient>,
    options: InstanceOptions,
    spec: RunSpec,
    events: mpsc::Sender<ServerMessage>,
}

impl Lifecycle {
    async fn drive(
        self,
        cancel: &CancellationToken,
        internal: &CancellationToken,
        launch: Launch,
    ) -> Result<(), InstanceError> {
        let Self {
            control,
            options,
            spec,
            events,
        } = self;
        let hook_set = &spec.hooks;

        hooks::run_blocking(&hook_set.pre_start, HookPhase::PreStart, options.hook_timeout).await?;

        info!(program = ?launch.program, args = ?launch.args, "Running command");
        let mut child = Command::new(&launch.program)
            .args(&launch.args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(launch.stdout))
            .stderr(Stdio::from(launch.stderr))
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| InstanceError::Spawn {
                program: launch.program.clone(),
                source,
            })?;
        info!(pid = child.id(), "Started worker");

        tokio::select! {
            () = internal.cancelled() => {}
            () = tokio::time::sleep(options.startup_delay) => {}
        }

        if let Err(e) =
            hooks::run_blocking(&hook_set.post_start, HookPhase::PostStart, options.hook_timeout).await
        {
            abandon(child, cancel.clone());
            return Err(e.into());
        }

        let (mut async_errors, async_hooks) =
            match hooks::run_async(internal, &hook_set.post_start_async, HookPhase::PostStartAsync) {
                Ok(started) => started,
                Err(e) => {
                    abandon(child, cancel.clone());
                    return Err(e.into());
                }
            };

        let watch_stop = CancellationToken::new();
        let watcher = tokio::spawn({
            let internal = internal.clone();
            let watch_stop = watch_stop.clone();
            async move {
                tokio::select! {
                    biased;
                    () = watch_stop.cancelled() => None,
                    () = internal.cancelled() => None,
                    failure = async_errors.recv() => {
                        let failure = failure?;
                        error!("An async hook errored, stopping preset");
                        internal.cancel();
                        Some(failure)
                    }
                }
            }
        });

        let control_task = tokio::spawn({
            let control = Arc::clone(&control);
            let internal = internal.clone();
            let port = spec.tcp_port;
            let retry = options.reconnect_delay;
            async move { control.run(internal, port, events, retry).await }
        });

        // Older workers do not answer this; not fatal.
        if let Err(e) = control.send(ClientMessage::RequestLayerNames {}).await {
            warn!(error = %e, "Failed to request layer names");
        }

        let exit = tokio::select! {
            status = child.wait() => status,
            () = internal.cancelled() => {
                if let Err(e) = child.start_kill() {
                    warn!(error = %e, "Failed to kill worker");
                }
                child.wait().await
            }
        };
        match &exit {
            Ok(status) => info!(%status, "Worker exited"),
            Err(e) => error!(error = %e, "Failed to wait for worker"),
        }

        watch_stop.cancel();
        let async_failure = watcher.await.ok().flatten();
        internal.cancel();

        info!("Waiting for all post-start-async hooks to exit");
        async_hooks.kill();
        async_hooks.wait().await;
        info!("All post-start-async hooks exited");
        let _ = control_task.await;

        hooks::run_blocking(&hook_set.post_stop, HookPhase::PostStop, options.hook_timeout).await?;

        if let Some(failure) = async_failure {
            return Err(InstanceError::AsyncHook(failure));
        }
        if cancel.is_cancelled() {
            return Ok(());
        }
        match exit {
            Ok(status) if status.success() => Ok(()),
            Ok(status) => Err(InstanceError::Exited { status }),
            Err(source) => Err(InstanceError::Wait { source }),
        }
    }
}

/// Leave a worker running after a failed startup phase.
///
/// The process is killed once the run's outer token is cancelled.
fn abandon(mut child: Child, cancel: CancellationToken) {
    let pid = child.id();
    warn!(pid, "Startup failed, worker left running until the preset is stopped");
    tokio::spawn(async move {
        tokio::select! {
            status = child.wait() => {
                debug!(pid, ?status, "Abandoned worker exited");
            }
            () = cancel.cancelled() => {
                if let Err(e) = child.kill().await {
                    warn!(pid, error = %e, "Failed to kill abandoned worker");
                }
            }
        }
    });
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn args_with_config() {
        let spec = RunSpec {
            config: Some(PathBuf::from("/etc/kanata.kbd")),
            tcp_port: 6000,
            extra_args: vec!["--debug".into(), "-n".into()],
            ..RunSpec::default()
        };
        let args: Vec<OsString> = ["-c", "/etc/kanata.kbd", "--port", "6000", "--debug", "-n"]
            .into_iter()
            .map(OsString::from)
            .collect();
        assert_eq!(spec.build_args(), args);
    }

    #[test]
    fn args_without_config() {
        let spec = RunSpec {
            tcp_port: 5829,
            ..RunSpec::default()
        };
        let args: Vec<OsString> = ["--port", "5829"].into_iter().map(OsString::from).collect();
        assert_eq!(spec.build_args(), args);
    }

    #[test]
    fn spec_from_preset() {
        let preset = Preset {
            name: "p".into(),
            executable: Some(PathBuf::from("/usr/bin/kanata")),
            config: None,
            tcp_port: 1234,
            autorun: true,
            autorestart_on_crash: false,
            extra_args: vec!["-d".into()],
            hooks: Hooks::default(),
        };
        let spec = RunSpec::from(&preset);
        assert_eq!(spec.executable, preset.executable);
        assert_eq!(spec.tcp_port, 1234);
        assert_eq!(spec.extra_args, vec!["-d".to_string()]);
    }

    #[tokio::test]
    async fn missing_default_executable_fails_synchronously() {
        let instance = Instance::new(InstanceOptions {
            default_executable: "presetd-no-such-worker-binary".into(),
            ..InstanceOptions::default()
        });
        let log = tempfile::tempfile().unwrap();
        let err = instance
            .run_nonblocking(CancellationToken::new(), RunSpec::default(), log)
            .unwrap_err();
        assert!(matches!(err, InstanceError::ExecutableNotFound { .. }));
    }
}
