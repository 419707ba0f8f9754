use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};

use feedwatch::{
    CaptureDevice, CaptureOpener, DetectionResult, DispatchError, FrameDispatcher, RawFrame,
    SampledFrame, SamplerConfig, Source, SourceRegistry, StartOutcome, SupervisorConfig,
    SupervisorError, WorkerContext, WorkerSupervisor,
};

struct QuickDevice;

impl CaptureDevice for QuickDevice {
    fn read_frame(&mut self) -> Result<RawFrame> {
        thread::sleep(Duration::from_millis(2));
        Ok(RawFrame::from_rgb(vec![0; 12], 2, 2)?)
    }
}

/// Ignores cancellation for the length of one read.
struct StuckDevice;

impl CaptureDevice for StuckDevice {
    fn read_frame(&mut self) -> Result<RawFrame> {
        thread::sleep(Duration::from_secs(2));
        Ok(RawFrame::from_rgb(vec![0; 12], 2, 2)?)
    }
}

struct SchemeOpener;

impl CaptureOpener for SchemeOpener {
    fn open(&self, source: &Source) -> Result<Box<dyn CaptureDevice>> {
        if source.url.starts_with("fail://") {
            bail!("cannot open {}", source.url);
        }
        if source.url.starts_with("stuck://") {
            return Ok(Box::new(StuckDevice));
        }
        Ok(Box::new(QuickDevice))
    }
}

#[derive(Default)]
struct CountingDispatcher {
    submitted: AtomicUsize,
}

impl FrameDispatcher for CountingDispatcher {
    fn submit(&self, frame: &SampledFrame) -> Result<DetectionResult, DispatchError> {
        self.submitted.fetch_add(1, Ordering::SeqCst);
        Ok(DetectionResult {
            source_id: frame.source_id,
            captured_at: frame.captured_at,
            detections: Vec::new(),
        })
    }
}

fn supervisor(sources: Vec<Source>) -> (WorkerSupervisor, Arc<CountingDispatcher>) {
    let dispatcher = Arc::new(CountingDispatcher::default());
    let ctx = WorkerContext::new(Arc::new(SchemeOpener), dispatcher.clone()).with_config(
        SamplerConfig {
            interval: Duration::from_millis(50),
            tick: Duration::from_millis(5),
        },
    );
    let config = SupervisorConfig {
        stop_timeout: Duration::from_millis(300),
    };
    let registry = Arc::new(SourceRegistry::from_sources(sources));
    (WorkerSupervisor::new(registry, ctx, config), dispatcher)
}

fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    done()
}

#[test]
fn second_start_is_a_no_op() {
    let (sup, dispatcher) = supervisor(vec![Source::new(1, "Front", "ok://front")]);

    assert_eq!(sup.start(1).unwrap(), StartOutcome::Started);
    assert_eq!(sup.start(1).unwrap(), StartOutcome::AlreadyRunning);
    assert_eq!(sup.running_ids(), vec![1]);

    assert!(wait_until(Duration::from_secs(2), || {
        dispatcher.submitted.load(Ordering::SeqCst) > 0
    }));
    sup.stop(1).unwrap();
    assert!(!sup.is_running(1));
}

#[test]
fn unknown_source_is_not_found() {
    let (sup, _) = supervisor(vec![]);
    assert!(matches!(sup.start(42), Err(SupervisorError::NotFound(42))));
}

#[test]
fn stopping_idle_source_is_not_running() {
    let (sup, _) = supervisor(vec![Source::new(1, "Front", "ok://front")]);
    assert!(matches!(sup.stop(1), Err(SupervisorError::NotRunning(1))));
}

#[test]
fn open_failure_frees_the_slot() {
    let (sup, dispatcher) = supervisor(vec![Source::new(7, "Broken", "fail://broken")]);

    assert_eq!(sup.start(7).unwrap(), StartOutcome::Started);
    assert!(wait_until(Duration::from_secs(2), || !sup.is_running(7)));
    assert!(sup.running_ids().is_empty());
    assert!(matches!(sup.stop(7), Err(SupervisorError::NotRunning(7))));
    assert_eq!(dispatcher.submitted.load(Ordering::SeqCst), 0);

    // A fresh start is accepted and fails the same way.
    assert_eq!(sup.start(7).unwrap(), StartOutcome::Started);
    assert!(wait_until(Duration::from_secs(2), || !sup.is_running(7)));
}

#[test]
fn stop_detaches_a_stuck_worker_and_restart_succeeds() {
    let (sup, _) = supervisor(vec![Source::new(3, "Gate", "stuck://gate")]);

    assert_eq!(sup.start(3).unwrap(), StartOutcome::Started);
    // Let the worker enter its first read.
    thread::sleep(Duration::from_millis(100));

    let started = Instant::now();
    sup.stop(3).unwrap();
    let elapsed = started.elapsed();
    assert!(elapsed < Duration::from_millis(1500), "stop took {elapsed:?}");
    assert!(!sup.is_running(3));

    assert_eq!(sup.start(3).unwrap(), StartOutcome::Started);
    assert!(sup.is_running(3));
    sup.stop(3).unwrap();
}

#[test]
fn start_all_skips_disabled_sources() {
    let mut disabled = Source::new(2, "Side", "ok://side");
    disabled.enabled = false;
    let (sup, _) = supervisor(vec![
        Source::new(1, "Front", "ok://front"),
        disabled,
        Source::new(3, "Back", "ok://back"),
    ]);

    assert!(sup.start_all().is_empty());
    assert_eq!(sup.running_ids(), vec![1, 3]);

    assert!(sup.stop_all().is_empty());
    assert!(sup.running_ids().is_empty());
}
