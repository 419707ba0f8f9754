use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::capture::{CaptureConfig, DEFAULT_LOCAL_DEVICE};
use crate::frame::DEFAULT_JPEG_QUALITY;
use crate::notify::QueueConfig;
use crate::sampler::{NoRetryPolicy, SamplerConfig};
use crate::supervisor::SupervisorConfig;

const DEFAULT_BACKEND_URL: &str = "http://localhost:8000";
const DEFAULT_WS_URL: &str = "ws://localhost:8000/ws";
const DEFAULT_HTTP_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_INTERVAL_MS: u64 = 1_000;
const DEFAULT_TICK_MS: u64 = 10;
const DEFAULT_READ_RETRY_MS: u64 = 1_000;
const DEFAULT_CAPTURE_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_CAPTURE_WIDTH: u32 = 640;
const DEFAULT_CAPTURE_HEIGHT: u32 = 480;
const DEFAULT_STOP_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_POLL_MS: u64 = 100;
const DEFAULT_ROUTER_READ_TIMEOUT_MS: u64 = 100;
const DEFAULT_RECONNECT_MS: u64 = 5_000;

#[derive(Debug, Deserialize, Default)]
struct ServiceConfigFile {
    backend: Option<BackendConfigFile>,
    sampling: Option<SamplingConfigFile>,
    supervisor: Option<SupervisorConfigFile>,
    notifications: Option<NotificationsConfigFile>,
    router: Option<RouterConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct BackendConfigFile {
    url: Option<String>,
    token: Option<String>,
    timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct SamplingConfigFile {
    interval_ms: Option<u64>,
    tick_ms: Option<u64>,
    read_retry_delay_ms: Option<u64>,
    max_read_failures: Option<u32>,
    jpeg_quality: Option<u8>,
    local_device: Option<String>,
    capture_timeout_ms: Option<u64>,
    width: Option<u32>,
    height: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct SupervisorConfigFile {
    stop_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct NotificationsConfigFile {
    poll_interval_ms: Option<u64>,
    stop_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct RouterConfigFile {
    url: Option<String>,
    read_timeout_ms: Option<u64>,
    reconnect_delay_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub backend: BackendSettings,
    pub sampling: SamplingSettings,
    pub supervisor_stop_timeout: Duration,
    pub notifications: QueueSettings,
    pub router: RouterSettings,
}

#[derive(Debug, Clone)]
pub struct BackendSettings {
    pub url: String,
    pub token: Option<String>,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct SamplingSettings {
    pub interval: Duration,
    pub tick: Duration,
    pub read_retry_delay: Duration,
    /// `None` retries failed reads for as long as the worker runs.
    pub max_read_failures: Option<u32>,
    pub jpeg_quality: u8,
    pub local_device: String,
    pub capture_timeout: Duration,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub poll_interval: Duration,
    pub stop_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct RouterSettings {
    pub url: String,
    pub read_timeout: Duration,
    pub reconnect_delay: Duration,
}

impl ServiceConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("FEEDWATCH_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) => Some(read_config_file(Path::new(path))?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: ServiceConfigFile) -> Self {
        let backend = file.backend.unwrap_or_default();
        let sampling = file.sampling.unwrap_or_default();
        let supervisor = file.supervisor.unwrap_or_default();
        let notifications = file.notifications.unwrap_or_default();
        let router = file.router.unwrap_or_default();

        Self {
            backend: BackendSettings {
                url: backend
                    .url
                    .unwrap_or_else(|| DEFAULT_BACKEND_URL.to_string()),
                token: backend.token.filter(|token| !token.trim().is_empty()),
                timeout: millis(backend.timeout_ms, DEFAULT_HTTP_TIMEOUT_MS),
            },
            sampling: SamplingSettings {
                interval: millis(sampling.interval_ms, DEFAULT_INTERVAL_MS),
                tick: millis(sampling.tick_ms, DEFAULT_TICK_MS),
                read_retry_delay: millis(sampling.read_retry_delay_ms, DEFAULT_READ_RETRY_MS),
                max_read_failures: sampling.max_read_failures.filter(|max| *max > 0),
                jpeg_quality: sampling.jpeg_quality.unwrap_or(DEFAULT_JPEG_QUALITY),
                local_device: sampling
                    .local_device
                    .unwrap_or_else(|| DEFAULT_LOCAL_DEVICE.to_string()),
                capture_timeout: millis(sampling.capture_timeout_ms, DEFAULT_CAPTURE_TIMEOUT_MS),
                width: sampling.width.unwrap_or(DEFAULT_CAPTURE_WIDTH),
                height: sampling.height.unwrap_or(DEFAULT_CAPTURE_HEIGHT),
            },
            supervisor_stop_timeout: millis(supervisor.stop_timeout_ms, DEFAULT_STOP_TIMEOUT_MS),
            notifications: QueueSettings {
                poll_interval: millis(notifications.poll_interval_ms, DEFAULT_POLL_MS),
                stop_timeout: millis(notifications.stop_timeout_ms, DEFAULT_STOP_TIMEOUT_MS),
            },
            router: RouterSettings {
                url: router.url.unwrap_or_else(|| DEFAULT_WS_URL.to_string()),
                read_timeout: millis(router.read_timeout_ms, DEFAULT_ROUTER_READ_TIMEOUT_MS),
                reconnect_delay: millis(router.reconnect_delay_ms, DEFAULT_RECONNECT_MS),
            },
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(url) = std::env::var("BACKEND_URL") {
            if !url.trim().is_empty() {
                self.backend.url = url;
            }
        }
        if let Ok(token) = std::env::var("FEEDWATCH_API_TOKEN") {
            if !token.trim().is_empty() {
                self.backend.token = Some(token);
            }
        }
        if let Ok(url) = std::env::var("FEEDWATCH_WS_URL") {
            if !url.trim().is_empty() {
                self.router.url = url;
            }
        }
        if let Ok(device) = std::env::var("FEEDWATCH_LOCAL_DEVICE") {
            if !device.trim().is_empty() {
                self.sampling.local_device = device;
            }
        }
        if let Ok(interval) = std::env::var("FEEDWATCH_FRAME_INTERVAL_MS") {
            let ms: u64 = interval.trim().parse().map_err(|_| {
                anyhow!("FEEDWATCH_FRAME_INTERVAL_MS must be an integer number of milliseconds")
            })?;
            self.sampling.interval = Duration::from_millis(ms);
        }
        if let Ok(max) = std::env::var("FEEDWATCH_MAX_READ_FAILURES") {
            let max: u32 = max.trim().parse().map_err(|_| {
                anyhow!("FEEDWATCH_MAX_READ_FAILURES must be a non-negative integer")
            })?;
            self.sampling.max_read_failures = (max > 0).then_some(max);
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        self.backend.url = self.backend.url.trim_end_matches('/').to_string();
        check_url(&self.backend.url, &["http", "https"], "backend url")?;
        // The WebSocket client is built without TLS.
        check_url(&self.router.url, &["ws"], "router url")?;

        if self.sampling.interval.is_zero() {
            return Err(anyhow!("frame interval must be greater than zero"));
        }
        if self.sampling.tick.is_zero() {
            return Err(anyhow!("sampling tick must be greater than zero"));
        }
        if !(1..=100).contains(&self.sampling.jpeg_quality) {
            return Err(anyhow!("jpeg quality must be between 1 and 100"));
        }
        if self.sampling.width == 0 || self.sampling.height == 0 {
            return Err(anyhow!("capture width and height must be greater than zero"));
        }
        if self.notifications.poll_interval.is_zero() {
            return Err(anyhow!("notification poll interval must be greater than zero"));
        }
        if self.router.read_timeout.is_zero() {
            return Err(anyhow!("router read timeout must be greater than zero"));
        }
        Ok(())
    }

    pub fn capture_config(&self) -> CaptureConfig {
        CaptureConfig {
            local_device: self.sampling.local_device.clone(),
            read_timeout: self.sampling.capture_timeout,
            width: self.sampling.width,
            height: self.sampling.height,
        }
    }

    pub fn sampler_config(&self) -> SamplerConfig {
        SamplerConfig {
            interval: self.sampling.interval,
            tick: self.sampling.tick,
        }
    }

    pub fn read_policy(&self) -> NoRetryPolicy {
        NoRetryPolicy {
            read_retry_delay: self.sampling.read_retry_delay,
            max_read_failures: self.sampling.max_read_failures,
        }
    }

    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            stop_timeout: self.supervisor_stop_timeout,
        }
    }

    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            poll_interval: self.notifications.poll_interval,
            stop_timeout: self.notifications.stop_timeout,
        }
    }
}

fn millis(value: Option<u64>, default: u64) -> Duration {
    Duration::from_millis(value.unwrap_or(default))
}

fn check_url(value: &str, schemes: &[&str], what: &str) -> Result<()> {
    let parsed =
        url::Url::parse(value).map_err(|e| anyhow!("invalid {} {:?}: {}", what, value, e))?;
    if !schemes.contains(&parsed.scheme()) {
        return Err(anyhow!(
            "{} {:?} must use one of: {}",
            what,
            value,
            schemes.join(", ")
        ));
    }
    Ok(())
}

fn read_config_file(path: &Path) -> Result<ServiceConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}
