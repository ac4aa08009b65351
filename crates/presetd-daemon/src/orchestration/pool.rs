//! Instance pool and the preset runner built on it.
//!
//! The [`Runner`] owns a growable array of [`Instance`] slots and a map from
//! running preset names to slots. Slots are never removed; a slot is free
//! when no preset maps to it. Results and control messages of every run are
//! tagged with the preset name and fanned into two shared channels.

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::sync::Arc;

use presetd_core::protocol::{ClientMessage, ServerMessage};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::control::ControlError;
use crate::subprocess::{Instance, InstanceError, InstanceOptions, InstanceRun, RunSpec};

/// Default ceiling on the number of instance slots.
pub const MAX_INSTANCES: usize = 10;

/// An item produced by a run, tagged with the preset that produced it.
#[derive(Debug)]
pub struct PresetEvent<T> {
    pub preset: String,
    /// Id of the run, as returned by [`Runner::run`].
    pub run_id: u64,
    pub item: T,
}

/// Terminal result of one run.
pub type RunResult = Result<(), InstanceError>;

/// Receiving ends of the runner's multiplexed streams.
#[derive(Debug)]
pub struct RunnerEvents {
    pub results: mpsc::Receiver<PresetEvent<RunResult>>,
    pub server_messages: mpsc::Receiver<PresetEvent<ServerMessage>>,
}

#[derive(Debug, Clone)]
pub struct RunnerOptions {
    pub max_instances: usize,
    pub instance: InstanceOptions,
    pub channel_capacity: usize,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            max_instances: MAX_INSTANCES,
            instance: InstanceOptions::default(),
            channel_capacity: 64,
        }
    }
}

/// Errors from the runner.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("all {max} instance slots are in use")]
    PoolExhausted { max: usize },

    #[error("preset '{0}' is not running")]
    PresetNotRunning(String),

    #[error(transparent)]
    Instance(#[from] InstanceError),

    #[error(transparent)]
    Control(#[from] ControlError),
}

#[derive(Debug, Clone)]
struct ActiveRun {
    slot: usize,
    run_id: u64,
    cancel: CancellationToken,
}

#[derive(Debug)]
struct Pool {
    instances: Vec<Arc<Instance>>,
    active: HashMap<String, ActiveRun>,
    next_run_id: u64,
    max_instances: usize,
    instance_options: InstanceOptions,
}

impl Pool {
    fn new(max_instances: usize, instance_options: InstanceOptions) -> Self {
        Self {
            instances: Vec::new(),
            active: HashMap::new(),
            next_run_id: 0,
            max_instances,
            instance_options,
        }
    }

    /// Choose the slot for `preset`: its current slot, else the lowest free
    /// slot, else a new one. Fails without side effects at the ceiling.
    fn pick_slot(&mut self, preset: &str) -> Result<usize, RunnerError> {
        if let Some(run) = self.active.get(preset) {
            return Ok(run.slot);
        }

        let busy: HashSet<usize> = self.active.values().map(|run| run.slot).collect();
        if let Some(free) = (0..self.instances.len()).find(|slot| !busy.contains(slot)) {
            return Ok(free);
        }

        if self.instances.len() < self.max_instances {
            self.instances
                .push(Arc::new(Instance::new(self.instance_options.clone())));
            return Ok(self.instances.len() - 1);
        }

        Err(RunnerError::PoolExhausted {
            max: self.max_instances,
        })
    }

    /// Remove the mapping for `preset` if it still belongs to `run_id`.
    fn unmap(&mut self, preset: &str, run_id: u64) -> bool {
        if self.active.get(preset).is_some_and(|run| run.run_id == run_id) {
            self.active.remove(preset);
            true
        } else {
            false
        }
    }
}

/// Runs presets on pooled instances.
#[derive(Debug, Clone)]
pub struct Runner {
    pool: Arc<Mutex<Pool>>,
    results: mpsc::Sender<PresetEvent<RunResult>>,
    server_messages: mpsc::Sender<PresetEvent<ServerMessage>>,
}

impl Runner {
    pub fn new(options: RunnerOptions) -> (Self, RunnerEvents) {
        let (results_tx, results_rx) = mpsc::channel(options.channel_capacity);
        let (messages_tx, messages_rx) = mpsc::channel(options.channel_capacity);
        info!(max_instances = options.max_instances, "Runner created");
        let runner = Self {
            pool: Arc::new(Mutex::new(Pool::new(
                options.max_instances,
                options.instance,
            ))),
            results: results_tx,
            server_messages: messages_tx,
        };
        (
            runner,
            RunnerEvents {
                results: results_rx,
                server_messages: messages_rx,
            },
        )
    }

    /// Start `preset` on a pool slot.
    ///
    /// A preset that is already running is restarted in place: its previous
    /// run is cancelled and the new run starts on the same slot once the old
    /// one has retired. Cancelling `cancel` stops the run and frees the slot.
    ///
    /// Returns the id that tags every event of this run.
    pub async fn run(
        &self,
        cancel: CancellationToken,
        preset: &str,
        spec: RunSpec,
        log: File,
    ) -> Result<u64, RunnerError> {
        let mut pool = self.pool.lock().await;
        let slot = pool.pick_slot(preset)?;
        let instance = Arc::clone(&pool.instances[slot]);
        let run = instance.run_nonblocking(cancel.clone(), spec, log)?;

        pool.next_run_id += 1;
        let run_id = pool.next_run_id;
        let previous = pool.active.insert(
            preset.to_string(),
            ActiveRun {
                slot,
                run_id,
                cancel: cancel.clone(),
            },
        );
        drop(pool);

        if let Some(previous) = previous {
            info!(preset, slot, "Restarting preset in place");
            previous.cancel.cancel();
        } else {
            info!(preset, slot, "Dispatched preset");
        }

        tokio::spawn(forward(
            Arc::clone(&self.pool),
            preset.to_string(),
            run_id,
            cancel,
            run,
            self.results.clone(),
            self.server_messages.clone(),
        ));
        Ok(run_id)
    }

    /// Send `msg` to the worker currently running `preset`.
    pub async fn send_client_message(
        &self,
        preset: &str,
        msg: ClientMessage,
    ) -> Result<(), RunnerError> {
        let instance = {
            let pool = self.pool.lock().await;
            let slot = pool
                .active
                .get(preset)
                .map(|run| run.slot)
                .ok_or_else(|| RunnerError::PresetNotRunning(preset.to_string()))?;
            Arc::clone(&pool.instances[slot])
        };
        instance.send_client_message(msg).await?;
        Ok(())
    }

    /// Running presets and their slots, ordered by slot.
    pub async fn active_presets(&self) -> Vec<(String, usize)> {
        let pool = self.pool.lock().await;
        let mut active: Vec<_> = pool
            .active
            .iter()
            .map(|(name, run)| (name.clone(), run.slot))
            .collect();
        drop(pool);
        active.sort_by_key(|(_, slot)| *slot);
        active
    }

    /// Number of slots created so far.
    pub async fn slot_count(&self) -> usize {
        self.pool.lock().await.instances.len()
    }
}

/// Relay one run's streams onto the shared channels and release its mapping.
async fn forward(
    pool: Arc<Mutex<Pool>>,
    preset: String,
    run_id: u64,
    cancel: CancellationToken,
    mut run: InstanceRun,
    results: mpsc::Sender<PresetEvent<RunResult>>,
    server_messages: mpsc::Sender<PresetEvent<ServerMessage>>,
) {
    let mut unmapped = false;
    let result = loop {
        tokio::select! {
            result = &mut run.result => {
                break result.unwrap_or_else(|_| Err(InstanceError::Aborted));
            }
            Some(msg) = run.events.recv() => {
                let event = PresetEvent { preset: preset.clone(), run_id, item: msg };
                if server_messages.send(event).await.is_err() {
                    debug!(preset = %preset, "Server message receiver dropped");
                }
            }
            () = cancel.cancelled(), if !unmapped => {
                unmapped = true;
                if pool.lock().await.unmap(&preset, run_id) {
                    debug!(preset = %preset, "Preset stopped, slot released");
                }
            }
        }
    };

    while let Some(msg) = run.events.recv().await {
        let event = PresetEvent {
            preset: preset.clone(),
            run_id,
            item: msg,
        };
        if server_messages.send(event).await.is_err() {
            break;
        }
    }

    pool.lock().await.unmap(&preset, run_id);
    if let Err(e) = &result {
        warn!(preset = %preset, error = %e, "Preset run ended with error");
    }
    if results
        .send(PresetEvent {
            preset,
            run_id,
            item: result,
        })
        .await
        .is_err()
    {
        debug!("Result receiver dropped");
    }
}
