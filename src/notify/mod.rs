//! Ordered notification pipeline.
//!
//! Producers push typed notifications into an unbounded channel; a single
//! consumer thread drains it in insertion order and hands each notification
//! to the matching sender, gated by the current `Settings`.

mod alerts;
mod senders;
mod settings;

pub use alerts::VisitorAlerts;
pub use senders::{EmailSender, LogEmailSender, LogSystemSender, SystemSender};
pub use settings::Settings;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::Local;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::backend::SettingsProvider;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(5);

const UNKNOWN_LOCATION: &str = "Unknown location";

#[derive(Clone, Debug, PartialEq)]
pub enum Notification {
    Email { subject: String, body: String },
    System { message: String, payload: Value },
}

impl Notification {
    pub fn kind(&self) -> &'static str {
        match self {
            Notification::Email { .. } => "email",
            Notification::System { .. } => "system",
        }
    }
}

/// What is known about an unknown visitor when the alert is raised.
///
/// Absent fields are filled in when the notification is built: the location
/// with a placeholder, time and date from the local clock.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct VisitorData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl VisitorData {
    pub fn at(location: &str) -> Self {
        Self {
            location: Some(location.to_string()),
            ..Self::default()
        }
    }
}

#[derive(Clone, Debug)]
pub struct QueueConfig {
    /// Upper bound on how long the idle consumer takes to notice `stop`.
    pub poll_interval: Duration,
    pub stop_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
        }
    }
}

/// The consumer side: settings plus senders.
struct Delivery {
    settings: Arc<RwLock<Settings>>,
    email: Arc<dyn EmailSender>,
    system: Arc<dyn SystemSender>,
}

impl Delivery {
    fn process(&self, notification: Notification) {
        match notification {
            Notification::Email { subject, body } => {
                let recipient = {
                    let settings = read_settings(&self.settings);
                    if !settings.email_notifications {
                        log::debug!("notifications: email notifications are disabled");
                        return;
                    }
                    match settings.email_recipient() {
                        Some(recipient) => recipient.to_string(),
                        None => {
                            log::debug!("notifications: no email recipient configured");
                            return;
                        }
                    }
                };
                if let Err(err) = self.email.send_email(&recipient, &subject, &body) {
                    log::error!("notifications: failed to send email to {}: {:#}", recipient, err);
                }
            }
            Notification::System { message, payload } => {
                if let Err(err) = self.system.send_system(&message, &payload) {
                    log::error!("notifications: failed to send system notification: {:#}", err);
                }
            }
        }
    }
}

pub struct NotificationQueue {
    tx: Mutex<Sender<Notification>>,
    rx: Arc<Mutex<Receiver<Notification>>>,
    pending: Arc<AtomicUsize>,
    delivery: Arc<Delivery>,
    config: QueueConfig,
    consumer: Mutex<Option<Consumer>>,
}

struct Consumer {
    running: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl NotificationQueue {
    pub fn new(
        settings: Settings,
        email: Arc<dyn EmailSender>,
        system: Arc<dyn SystemSender>,
        config: QueueConfig,
    ) -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            tx: Mutex::new(tx),
            rx: Arc::new(Mutex::new(rx)),
            pending: Arc::new(AtomicUsize::new(0)),
            delivery: Arc::new(Delivery {
                settings: Arc::new(RwLock::new(settings)),
                email,
                system,
            }),
            config,
            consumer: Mutex::new(None),
        }
    }

    /// A queue that only logs what it would deliver.
    pub fn with_log_senders(settings: Settings) -> Self {
        Self::new(
            settings,
            Arc::new(LogEmailSender),
            Arc::new(LogSystemSender),
            QueueConfig::default(),
        )
    }

    pub fn enqueue(&self, notification: Notification) {
        let tx = lock(&self.tx);
        self.push(&tx, notification);
    }

    /// Enqueue several notifications with no other producer in between.
    pub fn enqueue_all(&self, notifications: impl IntoIterator<Item = Notification>) {
        let tx = lock(&self.tx);
        for notification in notifications {
            self.push(&tx, notification);
        }
    }

    fn push(&self, tx: &Sender<Notification>, notification: Notification) {
        self.pending.fetch_add(1, Ordering::SeqCst);
        if tx.send(notification).is_err() {
            // The queue owns the receiver, so this is unreachable in practice.
            self.pending.fetch_sub(1, Ordering::SeqCst);
            log::error!("notifications: channel closed, notification dropped");
        }
    }

    /// Notifications enqueued but not yet handed to a sender.
    pub fn len(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn start(&self) {
        let mut consumer = lock(&self.consumer);
        if consumer.as_ref().is_some_and(|c| !c.handle.is_finished()) {
            log::warn!("notifications: queue is already running");
            return;
        }

        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();
        let rx = self.rx.clone();
        let pending = self.pending.clone();
        let delivery = self.delivery.clone();
        let poll = self.config.poll_interval;

        let spawned = thread::Builder::new()
            .name("notifications".into())
            .spawn(move || consume(&flag, &rx, &pending, &delivery, poll));
        match spawned {
            Ok(handle) => {
                *consumer = Some(Consumer { running, handle });
                log::info!("notifications: queue started");
            }
            Err(err) => {
                log::error!("notifications: failed to spawn consumer: {}", err);
            }
        }
    }

    /// Stop the consumer. Pending notifications stay queued for a later start.
    pub fn stop(&self) {
        let Some(Consumer { running, handle }) = lock(&self.consumer).take() else {
            return;
        };
        running.store(false, Ordering::SeqCst);
        let deadline = Instant::now() + self.config.stop_timeout;
        while !handle.is_finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        if handle.is_finished() {
            if handle.join().is_err() {
                log::error!("notifications: consumer panicked");
            }
        } else {
            log::warn!(
                "notifications: consumer did not stop within {:?}",
                self.config.stop_timeout
            );
        }
        log::info!("notifications: queue stopped");
    }

    pub fn is_running(&self) -> bool {
        lock(&self.consumer)
            .as_ref()
            .is_some_and(|c| !c.handle.is_finished())
    }

    pub fn settings(&self) -> Settings {
        read_settings(&self.delivery.settings).clone()
    }

    pub fn replace_settings(&self, settings: Settings) {
        let mut current = self
            .delivery
            .settings
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *current = settings;
    }

    /// Re-fetch settings. On failure the current settings are kept.
    pub fn reload_settings(&self, provider: &dyn SettingsProvider) -> bool {
        match provider.fetch_settings() {
            Ok(settings) => {
                self.replace_settings(settings);
                log::info!("notifications: settings reloaded");
                true
            }
            Err(err) => {
                log::warn!("notifications: settings reload failed, keeping current: {}", err);
                false
            }
        }
    }

    /// Raise an email and a system notification for an unknown visitor.
    /// Does nothing unless `unknown_alerts` is on.
    pub fn notify_unknown_visitor(&self, visitor: &VisitorData) {
        if !self.settings().unknown_alerts {
            return;
        }
        let now = Local::now();
        let location = visitor.location.as_deref().unwrap_or(UNKNOWN_LOCATION);
        let time = visitor
            .time
            .clone()
            .unwrap_or_else(|| now.format("%H:%M:%S").to_string());
        let date = visitor
            .date
            .clone()
            .unwrap_or_else(|| now.format("%Y-%m-%d").to_string());

        let email = Notification::Email {
            subject: format!("Unknown Visitor Detected - {}", location),
            body: format!(
                "Unknown visitor detected at {location}\n\
                 Time: {time}\n\
                 Date: {date}\n\n\
                 Please check the entry detection system for more details.\n"
            ),
        };
        let system = Notification::System {
            message: format!("Unknown visitor detected at {} ({})", location, time),
            payload: json!({ "data": visitor }),
        };
        self.enqueue_all([email, system]);
    }

    /// Raise an email and a system notification for an operational issue.
    /// Does nothing unless `system_alerts` is on.
    pub fn notify_system_issue(&self, kind: &str, details: &str) {
        if !self.settings().system_alerts {
            return;
        }
        let now = Local::now();
        let email = Notification::Email {
            subject: format!("System Alert - {}", kind),
            body: format!(
                "System issue detected: {kind}\n\n\
                 Details: {details}\n\n\
                 Time: {}\n\
                 Date: {}\n\n\
                 Please check the entry detection system for more details.\n",
                now.format("%H:%M:%S"),
                now.format("%Y-%m-%d"),
            ),
        };
        let system = Notification::System {
            message: format!("System issue: {}", kind),
            payload: json!({ "details": details }),
        };
        self.enqueue_all([email, system]);
    }
}

impl Drop for NotificationQueue {
    fn drop(&mut self) {
        if let Some(consumer) = lock(&self.consumer).as_ref() {
            consumer.running.store(false, Ordering::SeqCst);
        }
    }
}

fn consume(
    running: &AtomicBool,
    rx: &Mutex<Receiver<Notification>>,
    pending: &AtomicUsize,
    delivery: &Delivery,
    poll: Duration,
) {
    while running.load(Ordering::SeqCst) {
        let received = lock(rx).recv_timeout(poll);
        match received {
            Ok(notification) => {
                pending.fetch_sub(1, Ordering::SeqCst);
                log::debug!("notifications: processing {} notification", notification.kind());
                delivery.process(notification);
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn read_settings(settings: &RwLock<Settings>) -> RwLockReadGuard<'_, Settings> {
    settings.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}
