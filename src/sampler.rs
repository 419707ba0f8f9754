//! Per-source sampling worker.
//!
//! A sampler opens a capture handle, reads frames in capture order, and
//! forwards at most one frame per interval to the dispatcher. The interval is
//! measured on a monotonic clock against the last forwarded frame, so feeds
//! with irregular frame rates still produce at most one sample per interval.
//!
//! States: `Opening -> Running -> Stopping -> Stopped`, or `Opening -> Failed`
//! when the capture handle cannot be opened.
//!
//! Cancellation is cooperative: the loop checks its token between reads, and
//! every wait inside the loop is a token wait that returns early on cancel.

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::capture::{CaptureDevice, CaptureOpener};
use crate::dispatch::{DetectionObserver, FrameDispatcher};
use crate::error::DispatchError;
use crate::frame::SampledFrame;
use crate::registry::Source;

pub const DEFAULT_FRAME_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_TICK: Duration = Duration::from_millis(10);
pub const DEFAULT_READ_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Cancellation signal handed to a worker at spawn time.
#[derive(Clone, Default)]
pub struct CancellationToken {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        let (flag, cvar) = &*self.inner;
        let mut cancelled = flag.lock().unwrap_or_else(|p| p.into_inner());
        *cancelled = true;
        cvar.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        *self.inner.0.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Wait up to `timeout`. Returns true if the token was cancelled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (flag, cvar) = &*self.inner;
        let guard = flag.lock().unwrap_or_else(|p| p.into_inner());
        let (guard, _) = cvar
            .wait_timeout_while(guard, timeout, |cancelled| !*cancelled)
            .unwrap_or_else(|p| p.into_inner());
        *guard
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SamplerState {
    Opening,
    Running,
    Stopping,
    Stopped,
    Failed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadFailureAction {
    Retry(Duration),
    GiveUp,
}

/// Retry strategy for a sampler.
///
/// Frames are perishable, so the default strategy never retries an open or
/// a submission. Read failures are retried after a fixed delay.
pub trait FailurePolicy: Send {
    /// Delay before reopening after a failed open, or `None` to give up.
    fn on_open_failure(&mut self, _attempt: u32, _error: &anyhow::Error) -> Option<Duration> {
        None
    }

    /// `consecutive` counts failed reads since the last successful one.
    fn on_read_failure(&mut self, consecutive: u32) -> ReadFailureAction;

    /// Delay before resubmitting the same frame, or `None` to skip it.
    fn on_submit_failure(&mut self, _attempt: u32, _error: &DispatchError) -> Option<Duration> {
        None
    }
}

/// Fixed read-retry delay, optional cap on consecutive read failures.
#[derive(Clone, Debug)]
pub struct NoRetryPolicy {
    pub read_retry_delay: Duration,
    pub max_read_failures: Option<u32>,
}

impl Default for NoRetryPolicy {
    fn default() -> Self {
        Self {
            read_retry_delay: DEFAULT_READ_RETRY_DELAY,
            max_read_failures: None,
        }
    }
}

impl FailurePolicy for NoRetryPolicy {
    fn on_read_failure(&mut self, consecutive: u32) -> ReadFailureAction {
        match self.max_read_failures {
            Some(max) if consecutive >= max => ReadFailureAction::GiveUp,
            _ => ReadFailureAction::Retry(self.read_retry_delay),
        }
    }
}

pub type PolicyFactory = Arc<dyn Fn(&Source) -> Box<dyn FailurePolicy> + Send + Sync>;

#[derive(Clone, Debug)]
pub struct SamplerConfig {
    /// Minimum spacing between forwarded frames.
    pub interval: Duration,
    /// Sleep after every loop iteration.
    pub tick: Duration,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_FRAME_INTERVAL,
            tick: DEFAULT_TICK,
        }
    }
}

/// Everything a sampler needs besides its source. Shared by all workers.
#[derive(Clone)]
pub struct WorkerContext {
    pub opener: Arc<dyn CaptureOpener>,
    pub dispatcher: Arc<dyn FrameDispatcher>,
    pub observers: Vec<Arc<dyn DetectionObserver>>,
    pub config: SamplerConfig,
    pub policy: PolicyFactory,
}

impl WorkerContext {
    pub fn new(opener: Arc<dyn CaptureOpener>, dispatcher: Arc<dyn FrameDispatcher>) -> Self {
        Self {
            opener,
            dispatcher,
            observers: Vec::new(),
            config: SamplerConfig::default(),
            policy: Arc::new(|_: &Source| -> Box<dyn FailurePolicy> {
                Box::new(NoRetryPolicy::default())
            }),
        }
    }

    pub fn with_config(mut self, config: SamplerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_policy(mut self, policy: PolicyFactory) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn DetectionObserver>) -> Self {
        self.observers.push(observer);
        self
    }
}

/// Counters returned when a sampler terminates.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SamplerReport {
    pub final_state: SamplerState,
    pub frames_read: u64,
    /// Frames handed to the dispatcher.
    pub frames_sampled: u64,
    pub read_failures: u64,
    pub submit_failures: u64,
}

pub struct RateLimitedSampler {
    source: Arc<Source>,
    ctx: WorkerContext,
    policy: Box<dyn FailurePolicy>,
    state: SamplerState,
    frames_read: u64,
    frames_sampled: u64,
    read_failures: u64,
    submit_failures: u64,
}

impl RateLimitedSampler {
    pub fn new(source: Arc<Source>, ctx: WorkerContext) -> Self {
        let policy = (ctx.policy)(source.as_ref());
        Self {
            source,
            ctx,
            policy,
            state: SamplerState::Opening,
            frames_read: 0,
            frames_sampled: 0,
            read_failures: 0,
            submit_failures: 0,
        }
    }

    pub fn state(&self) -> SamplerState {
        self.state
    }

    /// Run until the token is cancelled or the source fails terminally.
    pub fn run(mut self, token: &CancellationToken) -> SamplerReport {
        let Some(mut device) = self.open(token) else {
            self.transition(SamplerState::Failed);
            return self.report();
        };
        self.transition(SamplerState::Running);
        log::info!(
            "sampler: processing source {} ({})",
            self.source.id,
            self.source.name
        );

        let failed = self.sample_loop(&mut *device, token);

        self.transition(SamplerState::Stopping);
        device.release();
        self.transition(if failed {
            SamplerState::Failed
        } else {
            SamplerState::Stopped
        });
        log::info!("sampler: source {} processing stopped", self.source.id);
        self.report()
    }

    fn open(&mut self, token: &CancellationToken) -> Option<Box<dyn CaptureDevice>> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.ctx.opener.open(&self.source) {
                Ok(device) => return Some(device),
                Err(err) => {
                    log::error!(
                        "sampler: failed to open source {} ({}): {:#}",
                        self.source.id,
                        self.source.name,
                        err
                    );
                    match self.policy.on_open_failure(attempt, &err) {
                        Some(delay) if !token.wait_timeout(delay) => continue,
                        _ => return None,
                    }
                }
            }
        }
    }

    /// Returns true when the loop ended because the policy gave up.
    fn sample_loop(&mut self, device: &mut dyn CaptureDevice, token: &CancellationToken) -> bool {
        let mut last_forwarded: Option<Instant> = None;
        let mut consecutive_failures = 0u32;

        while !token.is_cancelled() {
            match device.read_frame() {
                Ok(raw) => {
                    consecutive_failures = 0;
                    self.frames_read += 1;
                    let now = Instant::now();
                    let due = last_forwarded
                        .map_or(true, |last| now.duration_since(last) >= self.ctx.config.interval);
                    if due {
                        last_forwarded = Some(now);
                        self.forward(SampledFrame::new(self.source.id, raw), token);
                    }
                }
                Err(err) => {
                    consecutive_failures = consecutive_failures.saturating_add(1);
                    self.read_failures += 1;
                    log::warn!(
                        "sampler: failed to read frame from source {}: {:#}",
                        self.source.id,
                        err
                    );
                    match self.policy.on_read_failure(consecutive_failures) {
                        ReadFailureAction::Retry(delay) => {
                            token.wait_timeout(delay);
                            continue;
                        }
                        ReadFailureAction::GiveUp => {
                            log::error!(
                                "sampler: giving up on source {} after {} consecutive read failures",
                                self.source.id,
                                consecutive_failures
                            );
                            return true;
                        }
                    }
                }
            }
            token.wait_timeout(self.ctx.config.tick);
        }
        false
    }

    fn forward(&mut self, frame: SampledFrame, token: &CancellationToken) {
        self.frames_sampled += 1;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.ctx.dispatcher.submit(&frame) {
                Ok(result) => {
                    if !result.is_empty() {
                        log::info!(
                            "sampler: source {}: {} detections",
                            self.source.id,
                            result.detections.len()
                        );
                        for observer in &self.ctx.observers {
                            observer.on_detections(&self.source, &result);
                        }
                    }
                    return;
                }
                Err(err) => {
                    self.submit_failures += 1;
                    log::warn!(
                        "sampler: frame from source {} not processed: {}",
                        self.source.id,
                        err
                    );
                    match self.policy.on_submit_failure(attempt, &err) {
                        Some(delay) if !token.wait_timeout(delay) => continue,
                        _ => return,
                    }
                }
            }
        }
    }

    fn transition(&mut self, next: SamplerState) {
        log::debug!(
            "sampler: source {} {:?} -> {:?}",
            self.source.id,
            self.state,
            next
        );
        self.state = next;
    }

    fn report(&self) -> SamplerReport {
        SamplerReport {
            final_state: self.state,
            frames_read: self.frames_read,
            frames_sampled: self.frames_sampled,
            read_failures: self.read_failures,
            submit_failures: self.submit_failures,
        }
    }
}
