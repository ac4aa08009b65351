//! Supervisor event loop.
//!
//! The [`Supervisor`] owns every configured preset and is the only consumer
//! of the runner's result and message streams. Requests arrive through a
//! cloneable [`SupervisorHandle`]; status snapshots are published on a
//! watch channel after every change.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use presetd_core::config::{Config, Preset};
use presetd_core::protocol::ServerMessage;
use tempfile::NamedTempFile;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::pool::{PresetEvent, RunResult, Runner, RunnerEvents};
use super::restart::{AUTORESTART_LIMIT, RestartLimiter};
use crate::subprocess::RunSpec;

/// Upper bound on waiting for running presets to stop during shutdown.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

const REQUEST_CAPACITY: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresetStatus {
    Idle,
    /// Waiting for the previously running preset to exit.
    Starting,
    Running,
    Crashed,
}

impl fmt::Display for PresetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "Idle",
            Self::Starting => "Starting",
            Self::Running => "Running",
            Self::Crashed => "Crashed",
        })
    }
}

/// Point-in-time view of one preset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresetSnapshot {
    pub name: String,
    pub status: PresetStatus,
    /// Last layer reported by the worker.
    pub layer: Option<String>,
    pub layer_names: Vec<String>,
    /// Log file of the current or last run.
    pub log_file: Option<PathBuf>,
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("preset '{0}' not found")]
    UnknownPreset(String),

    #[error("supervisor is not running")]
    Closed,
}

#[derive(Debug)]
enum Request {
    Start(String),
    Stop(String),
    Toggle(String),
    StopAll,
    StartDefaults,
    ToggleDefaults,
    Shutdown,
}

#[derive(Debug)]
struct Envelope {
    request: Request,
    reply: oneshot::Sender<Result<String, SupervisorError>>,
}

/// Cloneable entry point into a running [`Supervisor`].
///
/// Every call returns a short human-readable outcome such as `"stopped"`.
#[derive(Debug, Clone)]
pub struct SupervisorHandle {
    requests: mpsc::Sender<Envelope>,
    statuses: watch::Receiver<Vec<PresetSnapshot>>,
}

impl SupervisorHandle {
    async fn request(&self, request: Request) -> Result<String, SupervisorError> {
        let (reply, rx) = oneshot::channel();
        self.requests
            .send(Envelope { request, reply })
            .await
            .map_err(|_| SupervisorError::Closed)?;
        rx.await.map_err(|_| SupervisorError::Closed)?
    }

    pub async fn start(&self, preset: &str) -> Result<String, SupervisorError> {
        self.request(Request::Start(preset.to_string())).await
    }

    pub async fn stop(&self, preset: &str) -> Result<String, SupervisorError> {
        self.request(Request::Stop(preset.to_string())).await
    }

    /// Stop the preset if it is running or starting, start it otherwise.
    pub async fn toggle(&self, preset: &str) -> Result<String, SupervisorError> {
        self.request(Request::Toggle(preset.to_string())).await
    }

    pub async fn stop_all(&self) -> Result<String, SupervisorError> {
        self.request(Request::StopAll).await
    }

    /// Start the autorun presets, as done at startup.
    pub async fn start_defaults(&self) -> Result<String, SupervisorError> {
        self.request(Request::StartDefaults).await
    }

    /// Stop the running autorun presets, or start them if none is running.
    pub async fn toggle_defaults(&self) -> Result<String, SupervisorError> {
        self.request(Request::ToggleDefaults).await
    }

    /// Stop every preset and end the supervisor loop.
    pub async fn shutdown(&self) -> Result<String, SupervisorError> {
        self.request(Request::Shutdown).await
    }

    /// Latest snapshot of all presets, in config order.
    pub fn statuses(&self) -> Vec<PresetSnapshot> {
        self.statuses.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<PresetSnapshot>> {
        self.statuses.clone()
    }
}

#[derive(Debug)]
struct PresetState {
    preset: Preset,
    status: PresetStatus,
    layer: Option<String>,
    layer_names: Vec<String>,
    /// Token of the live run; `None` once the run was stopped or ended.
    cancel: Option<CancellationToken>,
    /// Id of the latest dispatched run whose result is still outstanding.
    run_id: Option<u64>,
    limiter: RestartLimiter,
    log_file: Option<NamedTempFile>,
}

impl PresetState {
    fn new(preset: Preset) -> Self {
        Self {
            preset,
            status: PresetStatus::Idle,
            layer: None,
            layer_names: Vec::new(),
            cancel: None,
            run_id: None,
            limiter: RestartLimiter::new(),
            log_file: None,
        }
    }

    const fn is_active(&self) -> bool {
        matches!(self.status, PresetStatus::Running | PresetStatus::Starting)
    }

    fn snapshot(&self) -> PresetSnapshot {
        PresetSnapshot {
            name: self.preset.name.clone(),
            status: self.status,
            layer: self.layer.clone(),
            layer_names: self.layer_names.clone(),
            log_file: self.log_file.as_ref().map(|f| f.path().to_path_buf()),
        }
    }
}

/// Owns preset state and drives the runner.
#[derive(Debug)]
pub struct Supervisor {
    presets: Vec<PresetState>,
    allow_concurrent: bool,
    /// Preset to start once every in-flight run has reported its result.
    pending: Option<usize>,
    /// Dispatched runs whose result has not arrived yet.
    in_flight: HashMap<u64, usize>,
    runner: Runner,
    events: RunnerEvents,
    requests: mpsc::Receiver<Envelope>,
    statuses: watch::Sender<Vec<PresetSnapshot>>,
}

impl Supervisor {
    pub fn new(config: Config, runner: Runner, events: RunnerEvents) -> (Self, SupervisorHandle) {
        let presets: Vec<PresetState> = config.presets.into_iter().map(PresetState::new).collect();
        let (requests_tx, requests_rx) = mpsc::channel(REQUEST_CAPACITY);
        let (statuses_tx, statuses_rx) =
            watch::channel(presets.iter().map(PresetState::snapshot).collect());

        let supervisor = Self {
            presets,
            allow_concurrent: config.general.allow_concurrent_presets,
            pending: None,
            in_flight: HashMap::new(),
            runner,
            events,
            requests: requests_rx,
            statuses: statuses_tx,
        };
        let handle = SupervisorHandle {
            requests: requests_tx,
            statuses: statuses_rx,
        };
        (supervisor, handle)
    }

    /// Run autorun presets, then process events until `shutdown` fires or a
    /// shutdown request arrives. Running presets are stopped before returning.
    pub async fn run(mut self, shutdown: CancellationToken) {
        self.autorun().await;
        self.publish();

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                Some(event) = self.events.results.recv() => {
                    self.on_result(event).await;
                }
                Some(event) = self.events.server_messages.recv() => {
                    self.on_server_message(event);
                }
                Some(Envelope { request, reply }) = self.requests.recv() => {
                    if matches!(request, Request::Shutdown) {
                        let _ = reply.send(Ok("shutting down".to_string()));
                        break;
                    }
                    let outcome = self.handle(request).await;
                    self.publish();
                    let _ = reply.send(outcome);
                }
            }
            self.publish();
        }

        self.shutdown().await;
    }

    fn publish(&self) {
        let snapshot: Vec<_> = self.presets.iter().map(PresetState::snapshot).collect();
        self.statuses.send_if_modified(|current| {
            if *current == snapshot {
                false
            } else {
                *current = snapshot;
                true
            }
        });
    }

    fn index_of(&self, name: &str) -> Result<usize, SupervisorError> {
        self.presets
            .iter()
            .position(|p| p.preset.name == name)
            .ok_or_else(|| SupervisorError::UnknownPreset(name.to_string()))
    }

    async fn handle(&mut self, request: Request) -> Result<String, SupervisorError> {
        match request {
            Request::Start(name) => {
                let index = self.index_of(&name)?;
                Ok(self.start(index).await)
            }
            Request::Stop(name) => {
                let index = self.index_of(&name)?;
                Ok(self.stop(index))
            }
            Request::Toggle(name) => {
                let index = self.index_of(&name)?;
                if self.presets[index].is_active() {
                    Ok(self.stop(index))
                } else {
                    Ok(self.start(index).await)
                }
            }
            Request::StopAll => {
                let stopped = self.stop_all();
                Ok(format!("stopped {stopped} presets"))
            }
            Request::StartDefaults => {
                self.autorun().await;
                Ok("started all default presets".to_string())
            }
            Request::ToggleDefaults => {
                let running: Vec<usize> = self
                    .presets
                    .iter()
                    .enumerate()
                    .filter(|(_, p)| p.preset.autorun && p.is_active())
                    .map(|(i, _)| i)
                    .collect();
                if running.is_empty() {
                    self.autorun().await;
                    return Ok("started all default presets".to_string());
                }
                for &index in &running {
                    self.stop(index);
                }
                Ok(format!("stopped {} presets", running.len()))
            }
            Request::Shutdown => Ok("shutting down".to_string()),
        }
    }

    async fn autorun(&mut self) {
        let autorun: Vec<usize> = self
            .presets
            .iter()
            .enumerate()
            .filter(|(_, p)| p.preset.autorun)
            .map(|(i, _)| i)
            .collect();

        for (n, index) in autorun.into_iter().enumerate() {
            if n > 0 && !self.allow_concurrent {
                warn!(
                    "More than one preset has autorun enabled, but only the first one runs \
                     because allow_concurrent_presets is disabled"
                );
                break;
            }
            self.start(index).await;
        }
    }

    /// Start the preset at `index` (manual start: a crashed preset gets a
    /// fresh restart budget).
    async fn start(&mut self, index: usize) -> String {
        let state = &mut self.presets[index];
        if state.is_active() {
            return "already running".to_string();
        }
        if state.status == PresetStatus::Crashed {
            state.limiter.clear();
        }
        self.run_preset(index).await
    }

    async fn run_preset(&mut self, index: usize) -> String {
        let name = self.presets[index].preset.name.clone();

        if !self.allow_concurrent && !self.in_flight.is_empty() {
            info!(preset = %name, "Switching preset");
            let previous = self.pending.take();
            self.stop_all();
            if let Some(previous) = previous.filter(|&p| p != index) {
                warn!(
                    preset = %self.presets[previous].preset.name,
                    "The previously scheduled preset was not run"
                );
                self.presets[previous].status = PresetStatus::Idle;
            }
            self.pending = Some(index);
            self.presets[index].status = PresetStatus::Starting;
            return "scheduled".to_string();
        }

        info!(preset = %name, "Running preset");
        let state = &mut self.presets[index];
        let log_file = match tempfile::Builder::new()
            .prefix("presetd_lastrun_")
            .suffix(".log")
            .tempfile()
        {
            Ok(file) => file,
            Err(e) => {
                error!(preset = %name, error = %e, "Failed to create log file");
                state.status = PresetStatus::Crashed;
                return format!("failed: {e}");
            }
        };
        let sink = match log_file.reopen() {
            Ok(sink) => sink,
            Err(e) => {
                error!(preset = %name, error = %e, "Failed to open log file");
                state.status = PresetStatus::Crashed;
                return format!("failed: {e}");
            }
        };
        debug!(preset = %name, path = %log_file.path().display(), "Worker log file");
        state.log_file = Some(log_file);
        state.layer = None;

        let cancel = CancellationToken::new();
        let spec = RunSpec::from(&state.preset);
        match self.runner.run(cancel.clone(), &name, spec, sink).await {
            Ok(run_id) => {
                let state = &mut self.presets[index];
                state.status = PresetStatus::Running;
                state.cancel = Some(cancel);
                state.run_id = Some(run_id);
                self.in_flight.insert(run_id, index);
                "started".to_string()
            }
            Err(e) => {
                error!(preset = %name, error = %e, "Failed to run preset");
                self.presets[index].status = PresetStatus::Crashed;
                cancel.cancel();
                format!("failed: {e}")
            }
        }
    }

    fn stop(&mut self, index: usize) -> String {
        if self.pending == Some(index) {
            self.pending = None;
            self.presets[index].status = PresetStatus::Idle;
            return "unscheduled".to_string();
        }
        let state = &mut self.presets[index];
        let Some(cancel) = state.cancel.take() else {
            return "not running".to_string();
        };
        info!(preset = %state.preset.name, "Stopping preset");
        cancel.cancel();
        state.status = PresetStatus::Idle;
        "stopped".to_string()
    }

    fn stop_all(&mut self) -> usize {
        let mut stopped = 0;
        for index in 0..self.presets.len() {
            if self.presets[index].cancel.is_some() {
                self.stop(index);
                stopped += 1;
            }
        }
        if let Some(pending) = self.pending.take() {
            self.presets[pending].status = PresetStatus::Idle;
        }
        stopped
    }

    async fn on_result(&mut self, event: PresetEvent<RunResult>) {
        let PresetEvent {
            preset,
            run_id,
            item: result,
        } = event;
        self.in_flight.remove(&run_id);

        if let Ok(index) = self.index_of(&preset) {
            self.finish_run(index, run_id, result).await;
        } else {
            error!(preset = %preset, "Result for unknown preset");
        }

        if self.in_flight.is_empty() {
            if let Some(index) = self.pending.take() {
                self.run_preset(index).await;
            }
        }
    }

    async fn finish_run(&mut self, index: usize, run_id: u64, result: RunResult) {
        let state = &mut self.presets[index];
        if state.run_id != Some(run_id) {
            debug!(preset = %state.preset.name, run_id, "Ignoring result of a superseded run");
            return;
        }
        state.run_id = None;
        let stopped_by_user = state.cancel.is_none();
        if let Some(cancel) = state.cancel.take() {
            cancel.cancel();
        }

        let err = match result {
            Ok(()) => {
                info!(preset = %state.preset.name, "Previous worker process terminated successfully");
                state.status = PresetStatus::Idle;
                return;
            }
            Err(err) => err,
        };

        error!(preset = %state.preset.name, error = %err, "Worker run terminated with an error");
        state.status = PresetStatus::Crashed;
        if !state.preset.autorestart_on_crash || stopped_by_user {
            return;
        }

        match state.limiter.begin_attempt() {
            Some(attempt) => {
                info!(
                    preset = %state.preset.name,
                    "[autorestart-on-crash] Restarting [{attempt}/{AUTORESTART_LIMIT}]"
                );
                self.run_preset(index).await;
            }
            None => {
                warn!(
                    preset = %state.preset.name,
                    "[autorestart-on-crash] Restarts have been triggering too rapidly. Stopping further attempts."
                );
                state.limiter.clear();
            }
        }
    }

    fn on_server_message(&mut self, event: PresetEvent<ServerMessage>) {
        let Some(state) = self
            .presets
            .iter_mut()
            .find(|p| p.preset.name == event.preset)
        else {
            return;
        };
        if state.run_id != Some(event.run_id) {
            return;
        }

        match event.item {
            ServerMessage::LayerChange(change) => {
                debug!(preset = %event.preset, layer = %change.new, "Layer changed");
                state.layer = Some(change.new);
            }
            ServerMessage::LayerNames(names) => {
                debug!(preset = %event.preset, count = names.names.len(), "Received layer names");
                state.layer_names = names.names;
            }
            ServerMessage::ConfigFileReload(reload) => {
                info!(preset = %event.preset, config = %reload.new, "Worker reloaded its config");
            }
            ServerMessage::Unknown { msg_type, .. } => {
                debug!(preset = %event.preset, msg_type = %msg_type, "Ignoring unknown server message");
            }
        }
    }

    async fn shutdown(&mut self) {
        info!("Stopping all presets");
        self.stop_all();
        self.publish();

        let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;
        while !self.in_flight.is_empty() {
            let event = tokio::select! {
                () = tokio::time::sleep_until(deadline) => None,
                event = self.events.results.recv() => event,
                Some(message) = self.events.server_messages.recv() => {
                    debug!(preset = %message.preset, "Discarding server message during shutdown");
                    continue;
                }
            };
            let Some(PresetEvent { preset, run_id, item }) = event else {
                break;
            };
            self.in_flight.remove(&run_id);
            let Ok(index) = self.index_of(&preset) else {
                continue;
            };
            let state = &mut self.presets[index];
            if state.run_id == Some(run_id) {
                state.run_id = None;
                state.status = if item.is_ok() {
                    PresetStatus::Idle
                } else {
                    PresetStatus::Crashed
                };
            }
        }

        if !self.in_flight.is_empty() {
            warn!(
                remaining = self.in_flight.len(),
                "Timed out waiting for presets to stop"
            );
        }
        self.publish();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::orchestration::pool::RunnerOptions;

    fn config(names: &[(&str, bool)], concurrent: bool) -> Config {
        let mut text = format!("[general]\nallow_concurrent_presets = {concurrent}\n");
        for (name, autorun) in names {
            text.push_str(&format!(
                "[[presets]]\nname = \"{name}\"\nexecutable = \"/definitely/not/a/worker\"\nautorun = {autorun}\n"
            ));
        }
        Config::from_toml_str(&text).unwrap()
    }

    fn supervisor(config: Config) -> (Supervisor, SupervisorHandle) {
        let (runner, events) = Runner::new(RunnerOptions::default());
        Supervisor::new(config, runner, events)
    }

    #[test]
    fn initial_snapshot_lists_presets_in_order() {
        let (_supervisor, handle) = supervisor(config(&[("a", false), ("b", false)], false));
        let names: Vec<_> = handle.statuses().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert!(
            handle
                .statuses()
                .iter()
                .all(|s| s.status == PresetStatus::Idle)
        );
    }

    #[tokio::test]
    async fn unknown_preset_is_rejected() {
        let (supervisor, handle) = supervisor(config(&[("a", false)], false));
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(supervisor.run(shutdown.clone()));

        let err = handle.start("missing").await.unwrap_err();
        assert!(matches!(err, SupervisorError::UnknownPreset(name) if name == "missing"));

        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn stop_of_idle_preset_is_a_no_op() {
        let (supervisor, handle) = supervisor(config(&[("a", false)], false));
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(supervisor.run(shutdown.clone()));

        assert_eq!(handle.stop("a").await.unwrap(), "not running");
        assert_eq!(handle.stop_all().await.unwrap(), "stopped 0 presets");

        handle.shutdown().await.unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn requests_fail_after_shutdown() {
        let (supervisor, handle) = supervisor(config(&[("a", false)], false));
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        supervisor.run(shutdown).await;
        let err = handle.start("a").await.unwrap_err();
        assert!(matches!(err, SupervisorError::Closed));
    }

    #[test]
    fn status_labels() {
        assert_eq!(PresetStatus::Crashed.to_string(), "Crashed");
        assert_eq!(PresetStatus::Starting.to_string(), "Starting");
    }
}
