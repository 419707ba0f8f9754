//! Worker lifecycle for all sources.
//!
//! The supervisor keeps at most one live worker per source id. Each worker is
//! an OS thread running a `RateLimitedSampler` with its own cancellation
//! token. A worker that terminates on its own (capture open failure, read
//! failure cap) clears its liveness flag and removes its own entry, guarded by
//! a generation number so that it never removes a newer worker for the same
//! source.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::error::SupervisorError;
use crate::registry::{SourceId, SourceRegistry};
use crate::sampler::{CancellationToken, RateLimitedSampler, WorkerContext};

pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(5);
const JOIN_POLL: Duration = Duration::from_millis(20);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    AlreadyRunning,
}

#[derive(Clone, Debug)]
pub struct SupervisorConfig {
    /// How long `stop` waits for a worker before detaching it.
    pub stop_timeout: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            stop_timeout: DEFAULT_STOP_TIMEOUT,
        }
    }
}

struct WorkerHandle {
    generation: u64,
    token: CancellationToken,
    alive: Arc<AtomicBool>,
    join: JoinHandle<()>,
}

type WorkerMap = Mutex<HashMap<SourceId, WorkerHandle>>;

pub struct WorkerSupervisor {
    registry: Arc<SourceRegistry>,
    ctx: WorkerContext,
    config: SupervisorConfig,
    workers: Arc<WorkerMap>,
    next_generation: AtomicU64,
}

impl WorkerSupervisor {
    pub fn new(registry: Arc<SourceRegistry>, ctx: WorkerContext, config: SupervisorConfig) -> Self {
        Self {
            registry,
            ctx,
            config,
            workers: Arc::new(Mutex::new(HashMap::new())),
            next_generation: AtomicU64::new(1),
        }
    }

    pub fn registry(&self) -> &Arc<SourceRegistry> {
        &self.registry
    }

    /// Start the worker for `id`. Returns once the thread is spawned; the
    /// capture handle is opened by the worker.
    pub fn start(&self, id: SourceId) -> Result<StartOutcome, SupervisorError> {
        let source = self.registry.get(id).ok_or(SupervisorError::NotFound(id))?;

        let mut workers = lock(&self.workers);
        if let Some(existing) = workers.get(&id) {
            if existing.alive.load(Ordering::SeqCst) {
                log::warn!("supervisor: source {} is already running", id);
                return Ok(StartOutcome::AlreadyRunning);
            }
            workers.remove(&id);
        }

        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let token = CancellationToken::new();
        let alive = Arc::new(AtomicBool::new(true));
        let sampler = RateLimitedSampler::new(source.clone(), self.ctx.clone());

        let worker_token = token.clone();
        let worker_alive = alive.clone();
        let worker_map: Weak<WorkerMap> = Arc::downgrade(&self.workers);
        let join = thread::Builder::new()
            .name(format!("sampler-{}", id))
            .spawn(move || {
                let report = sampler.run(&worker_token);
                log::debug!("supervisor: worker for source {} exited: {:?}", id, report);
                worker_alive.store(false, Ordering::SeqCst);
                if let Some(map) = worker_map.upgrade() {
                    let mut workers = lock(&map);
                    if workers.get(&id).map(|w| w.generation) == Some(generation) {
                        workers.remove(&id);
                    }
                }
            })
            .map_err(|e| SupervisorError::Spawn {
                id,
                reason: e.to_string(),
            })?;

        workers.insert(
            id,
            WorkerHandle {
                generation,
                token,
                alive,
                join,
            },
        );
        log::info!("supervisor: started source {} - {}", id, source.name);
        Ok(StartOutcome::Started)
    }

    /// Signal the worker for `id` and wait up to the stop timeout. A worker
    /// that does not exit in time is detached; its slot is already free.
    pub fn stop(&self, id: SourceId) -> Result<(), SupervisorError> {
        let handle = lock(&self.workers)
            .remove(&id)
            .ok_or(SupervisorError::NotRunning(id))?;
        handle.token.cancel();

        let deadline = Instant::now() + self.config.stop_timeout;
        while !handle.join.is_finished() && Instant::now() < deadline {
            thread::sleep(JOIN_POLL);
        }
        if handle.join.is_finished() {
            if handle.join.join().is_err() {
                log::error!("supervisor: worker for source {} panicked", id);
            }
        } else {
            log::warn!(
                "supervisor: source {} did not stop within {:?}, detaching",
                id,
                self.config.stop_timeout
            );
        }
        log::info!("supervisor: stopped source {}", id);
        Ok(())
    }

    /// Start every enabled source. Returns the failures; the batch continues.
    pub fn start_all(&self) -> Vec<(SourceId, SupervisorError)> {
        let mut failures = Vec::new();
        for source in self.registry.sources() {
            if !source.enabled {
                log::info!("supervisor: source {} is disabled, not starting", source.id);
                continue;
            }
            if let Err(err) = self.start(source.id) {
                log::error!("supervisor: {}", err);
                failures.push((source.id, err));
            }
        }
        failures
    }

    /// Stop every running source. Returns the failures; the batch continues.
    pub fn stop_all(&self) -> Vec<(SourceId, SupervisorError)> {
        let mut failures = Vec::new();
        for id in self.running_ids() {
            if let Err(err) = self.stop(id) {
                log::warn!("supervisor: {}", err);
                failures.push((id, err));
            }
        }
        failures
    }

    pub fn is_running(&self, id: SourceId) -> bool {
        lock(&self.workers)
            .get(&id)
            .is_some_and(|w| w.alive.load(Ordering::SeqCst))
    }

    /// Ids with a live worker, ascending.
    pub fn running_ids(&self) -> Vec<SourceId> {
        let workers = lock(&self.workers);
        let mut ids: Vec<SourceId> = workers
            .iter()
            .filter(|(_, w)| w.alive.load(Ordering::SeqCst))
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }
}

fn lock(map: &WorkerMap) -> MutexGuard<'_, HashMap<SourceId, WorkerHandle>> {
    map.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
