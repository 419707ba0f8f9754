//! feedwatch
//!
//! Multi-source video feed monitoring. Frames are sampled per source at a
//! bounded rate, submitted to a remote detection API, and the resulting
//! detections fan out to a notification queue and a WebSocket pub/sub
//! channel.
//!
//! # Module Structure
//!
//! - `registry`: known feed sources, loaded from the backend catalog
//! - `capture`: capture handles per URI scheme
//! - `sampler`: per-source rate-limited worker loop
//! - `supervisor`: worker lifecycle, at most one worker per source
//! - `dispatch`: frame submission and detection observers
//! - `notify`: ordered notification queue with gated senders
//! - `router`: WebSocket message routing by envelope type
//! - `backend`, `config`, `error`, `frame`: shared plumbing

pub mod backend;
pub mod capture;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod frame;
pub mod notify;
pub mod registry;
pub mod router;
pub mod sampler;
pub mod supervisor;

pub use backend::{BackendClient, SettingsProvider};
pub use capture::{CaptureConfig, CaptureDevice, CaptureKind, CaptureOpener, DefaultOpener};
pub use config::ServiceConfig;
pub use dispatch::{
    Detection, DetectionObserver, DetectionResult, FrameDispatcher, HttpFrameDispatcher,
};
pub use error::{BackendError, DispatchError, FrameError, RouterError, SupervisorError};
pub use frame::{RawFrame, SampledFrame};
pub use notify::{
    EmailSender, Notification, NotificationQueue, QueueConfig, Settings, SystemSender,
    VisitorAlerts, VisitorData,
};
pub use registry::{Source, SourceCatalog, SourceId, SourceRegistry};
pub use router::{Envelope, MessageRouter, RouterPublisher, RouterState, SubscriptionId, Topic};
pub use sampler::{
    CancellationToken, FailurePolicy, NoRetryPolicy, RateLimitedSampler, SamplerConfig,
    SamplerState, WorkerContext,
};
pub use supervisor::{StartOutcome, SupervisorConfig, WorkerSupervisor};
