use std::sync::Arc;

use chrono::Local;
use serde_json::Value;

use super::{NotificationQueue, VisitorData};
use crate::dispatch::{Detection, DetectionObserver, DetectionResult};
use crate::registry::Source;

/// Raises an unknown-visitor alert for every detection result that contains
/// at least one unrecognised person. The source name is the location.
pub struct VisitorAlerts {
    queue: Arc<NotificationQueue>,
}

impl VisitorAlerts {
    pub fn new(queue: Arc<NotificationQueue>) -> Self {
        Self { queue }
    }
}

impl DetectionObserver for VisitorAlerts {
    fn on_detections(&self, source: &Source, result: &DetectionResult) {
        let unknown = result.detections.iter().filter(|d| is_unknown_visitor(d)).count();
        if unknown == 0 {
            return;
        }
        log::info!(
            "notifications: {} unknown visitor(s) on source {} - {}",
            unknown,
            source.id,
            source.name
        );
        let captured = result.captured_at.with_timezone(&Local);
        let mut visitor = VisitorData::at(&source.name);
        visitor.time = Some(captured.format("%H:%M:%S").to_string());
        visitor.date = Some(captured.format("%Y-%m-%d").to_string());
        visitor.extra.insert("camera_id".into(), Value::from(source.id));
        visitor.extra.insert("unknown_count".into(), Value::from(unknown));
        self.queue.notify_unknown_visitor(&visitor);
    }
}

pub(crate) fn is_unknown_visitor(detection: &Detection) -> bool {
    let named_unknown = detection
        .get("name")
        .and_then(Value::as_str)
        .is_some_and(|name| name.eq_ignore_ascii_case("unknown"));
    let status_unknown = detection
        .get("status")
        .and_then(Value::as_str)
        .is_some_and(|status| status.eq_ignore_ascii_case("unknown"));
    let not_known = detection.get("known").and_then(Value::as_bool) == Some(false);
    named_unknown || status_unknown || not_known
}
