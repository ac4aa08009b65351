//! Lifecycle hook execution.
//!
//! Hooks of one phase always run concurrently. Blocking phases share a
//! single deadline and are never tied to the caller's cancellation, so a
//! phase that was started always completes (or is killed by its own
//! timeout). Async hooks run alongside the worker and are drained before
//! the instance considers itself stopped.

use std::fmt;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Maximum runtime shared by all hooks of one blocking phase.
pub const BLOCKING_HOOK_TIMEOUT: Duration = Duration::from_secs(5);

/// Process-wide hook counter so log lines of concurrent hooks can be told apart.
static HOOK_SEQ: AtomicU32 = AtomicU32::new(0);

fn next_hook_number() -> u32 {
    HOOK_SEQ.fetch_add(1, Ordering::Relaxed) + 1
}

/// Lifecycle phase a hook group belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookPhase {
    PreStart,
    PostStart,
    PostStartAsync,
    PostStop,
}

impl HookPhase {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PreStart => "pre-start",
            Self::PostStart => "post-start",
            Self::PostStartAsync => "post-start-async",
            Self::PostStop => "post-stop",
        }
    }
}

impl fmt::Display for HookPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors from running hook commands.
#[derive(Debug, thiserror::Error)]
pub enum HookError {
    #[error("{phase} hook [{hook}] has an empty command")]
    EmptyCommand { phase: HookPhase, hook: u32 },

    #[error("failed to run {phase} hook [{hook}] {command:?}: {source}")]
    Spawn {
        phase: HookPhase,
        hook: u32,
        command: Vec<String>,
        source: std::io::Error,
    },

    #[error("{phase} hook [{hook}] {command:?} failed with {status}")]
    Failed {
        phase: HookPhase,
        hook: u32,
        command: Vec<String>,
        status: ExitStatus,
    },

    #[error(
        "{phase} hook [{hook}] {command:?} was killed because it exceeded maximum allowed runtime for non-async hooks ({timeout:?})"
    )]
    TimedOut {
        phase: HookPhase,
        hook: u32,
        command: Vec<String>,
        timeout: Duration,
    },

    #[error("{phase} hook [{hook}] {command:?} was killed because of cancel signal")]
    Cancelled {
        phase: HookPhase,
        hook: u32,
        command: Vec<String>,
    },

    #[error("failed to wait for {phase} hook [{hook}]: {source}")]
    Wait {
        phase: HookPhase,
        hook: u32,
        source: std::io::Error,
    },
}

/// Spawn one hook command with its output forwarded to the debug log.
fn spawn_hook(phase: HookPhase, hook: u32, argv: &[String]) -> Result<Child, HookError> {
    let (program, args) = argv
        .split_first()
        .ok_or(HookError::EmptyCommand { phase, hook })?;

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| HookError::Spawn {
            phase,
            hook,
            command: argv.to_vec(),
            source,
        })?;

    forward_output(hook, "stdout", child.stdout.take());
    forward_output(hook, "stderr", child.stderr.take());
    Ok(child)
}

fn forward_output<R>(hook: u32, stream: &'static str, pipe: Option<R>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let Some(pipe) = pipe else {
        return;
    };
    tokio::spawn(async move {
        let mut lines = BufReader::new(pipe).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let line = line.trim_end();
            if !line.is_empty() {
                debug!(hook, stream, "{}", line);
            }
        }
    });
}

/// Run every hook in `hooks` concurrently and wait for all of them.
///
/// All hooks share one deadline of `timeout`; a hook still running at the
/// deadline is killed. Every hook is waited on before returning, and the
/// error of the first failing hook (in list order) is returned.
pub async fn run_blocking(
    hooks: &[Vec<String>],
    phase: HookPhase,
    timeout: Duration,
) -> Result<(), HookError> {
    let deadline = Instant::now() + timeout;
    let mut set = JoinSet::new();

    for (index, argv) in hooks.iter().enumerate() {
        let hook = next_hook_number();
        info!(%phase, hook, command = ?argv, "Running hook");
        let argv = argv.clone();
        set.spawn(async move {
            let result = run_one_blocking(phase, hook, &argv, deadline, timeout).await;
            (index, result)
        });
    }

    let mut first: Option<(usize, HookError)> = None;
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((index, Err(e))) => {
                if first.as_ref().is_none_or(|(i, _)| index < *i) {
                    first = Some((index, e));
                }
            }
            Ok((_, Ok(()))) => {}
            Err(e) => error!(%phase, error = %e, "Hook task panicked"),
        }
    }

    first.map_or(Ok(()), |(_, e)| Err(e))
}

async fn run_one_blocking(
    phase: HookPhase,
    hook: u32,
    argv: &[String],
    deadline: Instant,
    timeout: Duration,
) -> Result<(), HookError> {
    let mut child = spawn_hook(phase, hook, argv)?;
    match tokio::time::timeout_at(deadline, child.wait()).await {
        Ok(Ok(status)) if status.success() => {
            info!(%phase, hook, "Hook exited OK");
            Ok(())
        }
        Ok(Ok(status)) => Err(HookError::Failed {
            phase,
            hook,
            command: argv.to_vec(),
            status,
        }),
        Ok(Err(source)) => Err(HookError::Wait {
            phase,
            hook,
            source,
        }),
        Err(_) => {
            if let Err(e) = child.kill().await {
                warn!(%phase, hook, error = %e, "Failed to kill timed out hook");
            }
            Err(HookError::TimedOut {
                phase,
                hook,
                command: argv.to_vec(),
                timeout,
            })
        }
    }
}

/// Handle to a group of running async hooks.
#[derive(Debug)]
pub struct AsyncHooks {
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl AsyncHooks {
    /// Kill every hook of the group that is still running.
    pub fn kill(&self) {
        self.cancel.cancel();
    }

    /// Resolves once every hook of the group has exited.
    pub async fn wait(&self) {
        self.tracker.wait().await;
    }

    /// Number of hooks that have not exited yet.
    pub fn running(&self) -> usize {
        self.tracker.len()
    }
}

/// Start every hook in `hooks` without waiting for them.
///
/// Hooks run until they exit on their own or `cancel` fires. The first hook
/// that fails is delivered once on the returned receiver; later failures are
/// only logged. The receiver yields `None` after all hooks have exited
/// without a reported failure.
///
/// If a hook cannot be started, the hooks already started are killed and
/// the spawn error is returned.
pub fn run_async(
    cancel: &CancellationToken,
    hooks: &[Vec<String>],
    phase: HookPhase,
) -> Result<(mpsc::Receiver<HookError>, AsyncHooks), HookError> {
    let group = cancel.child_token();
    let tracker = TaskTracker::new();
    let (error_tx, error_rx) = mpsc::channel(1);
    let reported = Arc::new(AtomicBool::new(false));

    for argv in hooks {
        let hook = next_hook_number();
        info!(%phase, hook, command = ?argv, "Running hook");
        let mut child = match spawn_hook(phase, hook, argv) {
            Ok(child) => child,
            Err(e) => {
                error!(%phase, hook, error = %e, "Failed to run hook");
                group.cancel();
                tracker.close();
                return Err(e);
            }
        };

        let group = group.clone();
        let error_tx = error_tx.clone();
        let reported = Arc::clone(&reported);
        let argv = argv.clone();
        tracker.spawn(async move {
            let outcome = tokio::select! {
                status = child.wait() => match status {
                    Ok(status) if status.success() => Ok(()),
                    Ok(status) => Err(HookError::Failed { phase, hook, command: argv, status }),
                    Err(source) => Err(HookError::Wait { phase, hook, source }),
                },
                () = group.cancelled() => {
                    if let Err(e) = child.kill().await {
                        warn!(%phase, hook, error = %e, "Failed to kill hook");
                    }
                    Err(HookError::Cancelled { phase, hook, command: argv })
                }
            };

            let Err(err) = outcome else {
                info!(%phase, hook, "Hook exited OK");
                return;
            };
            if matches!(err, HookError::Cancelled { .. }) {
                warn!(%phase, hook, "{err}");
            } else {
                error!(%phase, hook, "{err}");
            }
            if !reported.swap(true, Ordering::SeqCst) {
                let _ = error_tx.try_send(err);
            }
        });
    }
    tracker.close();

    Ok((
        error_rx,
        AsyncHooks {
            tracker,
            cancel: group,
        },
    ))
}
