use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use serde_json::{json, Value};

use feedwatch::error::BackendError;
use feedwatch::{
    EmailSender, Notification, NotificationQueue, QueueConfig, Settings, SettingsProvider,
    SystemSender, VisitorData,
};

#[derive(Clone, Debug, PartialEq)]
enum Delivered {
    Email { to: String, subject: String },
    System { message: String },
}

#[derive(Default)]
struct Recorder {
    delivered: Mutex<Vec<Delivered>>,
}

impl Recorder {
    fn take(&self) -> Vec<Delivered> {
        std::mem::take(&mut *self.delivered.lock().unwrap())
    }

    fn count(&self) -> usize {
        self.delivered.lock().unwrap().len()
    }
}

impl EmailSender for Recorder {
    fn send_email(&self, recipient: &str, subject: &str, _body: &str) -> Result<()> {
        if subject == "explode" {
            bail!("smtp down");
        }
        self.delivered.lock().unwrap().push(Delivered::Email {
            to: recipient.to_string(),
            subject: subject.to_string(),
        });
        Ok(())
    }
}

impl SystemSender for Recorder {
    fn send_system(&self, message: &str, _payload: &Value) -> Result<()> {
        self.delivered.lock().unwrap().push(Delivered::System {
            message: message.to_string(),
        });
        Ok(())
    }
}

struct FixedSettings(Settings);

impl SettingsProvider for FixedSettings {
    fn fetch_settings(&self) -> Result<Settings, BackendError> {
        Ok(self.0.clone())
    }
}

struct DownSettings;

impl SettingsProvider for DownSettings {
    fn fetch_settings(&self) -> Result<Settings, BackendError> {
        Err(BackendError::Status {
            status: 503,
            body: "maintenance".into(),
        })
    }
}

fn everything_on() -> Settings {
    Settings {
        email_notifications: true,
        email_address: Some("ops@example.com".into()),
        unknown_alerts: true,
        system_alerts: true,
        ..Settings::default()
    }
}

fn queue(settings: Settings) -> (NotificationQueue, Arc<Recorder>) {
    let recorder = Arc::new(Recorder::default());
    let config = QueueConfig {
        poll_interval: Duration::from_millis(20),
        stop_timeout: Duration::from_secs(1),
    };
    let queue = NotificationQueue::new(settings, recorder.clone(), recorder.clone(), config);
    (queue, recorder)
}

fn wait_for(recorder: &Recorder, expected: usize) {
    let deadline = Instant::now() + Duration::from_secs(3);
    while recorder.count() < expected && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn delivers_in_insertion_order() {
    let (queue, recorder) = queue(everything_on());
    for seq in 0..50 {
        queue.enqueue(Notification::System {
            message: format!("event {seq}"),
            payload: json!({ "seq": seq }),
        });
    }
    assert_eq!(queue.len(), 50);

    queue.start();
    wait_for(&recorder, 50);
    queue.stop();

    let expected: Vec<Delivered> = (0..50)
        .map(|seq| Delivered::System {
            message: format!("event {seq}"),
        })
        .collect();
    assert_eq!(recorder.take(), expected);
    assert!(queue.is_empty());
}

#[test]
fn concurrent_producers_keep_per_producer_order() {
    let (queue, recorder) = queue(everything_on());
    let queue = Arc::new(queue);
    queue.start();

    let producers: Vec<_> = (0..4)
        .map(|producer| {
            let queue = queue.clone();
            thread::spawn(move || {
                for seq in 0..25 {
                    queue.enqueue(Notification::System {
                        message: format!("{producer}:{seq}"),
                        payload: Value::Null,
                    });
                }
            })
        })
        .collect();
    for handle in producers {
        handle.join().unwrap();
    }
    wait_for(&recorder, 100);
    queue.stop();

    let delivered = recorder.take();
    assert_eq!(delivered.len(), 100);
    for producer in 0..4 {
        let seqs: Vec<u32> = delivered
            .iter()
            .filter_map(|d| match d {
                Delivered::System { message } => message
                    .strip_prefix(&format!("{producer}:"))
                    .and_then(|s| s.parse().ok()),
                _ => None,
            })
            .collect();
        assert_eq!(seqs, (0..25).collect::<Vec<_>>());
    }
}

#[test]
fn unknown_visitor_gated_by_setting() {
    let (queue, recorder) = queue(Settings {
        unknown_alerts: false,
        ..everything_on()
    });
    queue.notify_unknown_visitor(&VisitorData::at("Main Entrance"));
    assert_eq!(queue.len(), 0);

    queue.replace_settings(everything_on());
    queue.notify_unknown_visitor(&VisitorData {
        location: Some("Main Entrance".into()),
        time: Some("14:30:00".into()),
        date: Some("2025-04-16".into()),
        ..VisitorData::default()
    });
    assert_eq!(queue.len(), 2);

    queue.start();
    wait_for(&recorder, 2);
    queue.stop();
    assert_eq!(
        recorder.take(),
        vec![
            Delivered::Email {
                to: "ops@example.com".into(),
                subject: "Unknown Visitor Detected - Main Entrance".into(),
            },
            Delivered::System {
                message: "Unknown visitor detected at Main Entrance (14:30:00)".into(),
            },
        ]
    );
}

#[test]
fn system_issue_gated_by_setting() {
    let (queue, recorder) = queue(Settings {
        system_alerts: false,
        ..everything_on()
    });
    queue.notify_system_issue("Camera Offline", "Side Entrance is offline");
    assert!(queue.is_empty());

    queue.replace_settings(everything_on());
    queue.notify_system_issue("Camera Offline", "Side Entrance is offline");
    queue.start();
    wait_for(&recorder, 2);
    queue.stop();
    assert_eq!(
        recorder.take(),
        vec![
            Delivered::Email {
                to: "ops@example.com".into(),
                subject: "System Alert - Camera Offline".into(),
            },
            Delivered::System {
                message: "System issue: Camera Offline".into(),
            },
        ]
    );
}

#[test]
fn email_needs_flag_and_recipient() {
    let email = |subject: &str| Notification::Email {
        subject: subject.into(),
        body: String::new(),
    };
    let marker = Notification::System {
        message: "marker".into(),
        payload: Value::Null,
    };

    let (queue, recorder) = queue(Settings {
        email_notifications: false,
        ..everything_on()
    });
    queue.enqueue(email("disabled"));
    queue.enqueue(marker.clone());
    queue.start();
    wait_for(&recorder, 1);
    queue.stop();
    assert_eq!(
        recorder.take(),
        vec![Delivered::System {
            message: "marker".into()
        }]
    );

    queue.replace_settings(Settings {
        email_address: None,
        ..everything_on()
    });
    queue.enqueue(email("no recipient"));
    queue.enqueue(marker);
    queue.start();
    wait_for(&recorder, 1);
    queue.stop();
    assert_eq!(
        recorder.take(),
        vec![Delivered::System {
            message: "marker".into()
        }]
    );
}

#[test]
fn sender_failure_does_not_stop_the_consumer() {
    let (queue, recorder) = queue(everything_on());
    queue.enqueue(Notification::Email {
        subject: "explode".into(),
        body: String::new(),
    });
    queue.enqueue(Notification::Email {
        subject: "after".into(),
        body: String::new(),
    });
    queue.start();
    wait_for(&recorder, 1);
    queue.stop();
    assert_eq!(
        recorder.take(),
        vec![Delivered::Email {
            to: "ops@example.com".into(),
            subject: "after".into(),
        }]
    );
}

#[test]
fn paired_notifications_stay_adjacent_under_contention() {
    let (queue, recorder) = queue(everything_on());
    let queue = Arc::new(queue);

    let noise = {
        let queue = queue.clone();
        thread::spawn(move || {
            for seq in 0..200 {
                queue.enqueue(Notification::System {
                    message: format!("noise {seq}"),
                    payload: Value::Null,
                });
            }
        })
    };
    for _ in 0..20 {
        queue.notify_system_issue("Disk", "almost full");
    }
    noise.join().unwrap();

    queue.start();
    wait_for(&recorder, 240);
    queue.stop();

    let delivered = recorder.take();
    assert_eq!(delivered.len(), 240);
    for (i, item) in delivered.iter().enumerate() {
        if matches!(item, Delivered::Email { .. }) {
            assert_eq!(
                delivered.get(i + 1),
                Some(&Delivered::System {
                    message: "System issue: Disk".into()
                }),
                "email at {i} not followed by its system notification"
            );
        }
    }
}

#[test]
fn reload_keeps_settings_on_failure() {
    let (queue, _) = queue(Settings::default());
    assert!(queue.reload_settings(&FixedSettings(everything_on())));
    assert_eq!(queue.settings(), everything_on());

    assert!(!queue.reload_settings(&DownSettings));
    assert_eq!(queue.settings(), everything_on());
}
