//! Notification settings served by the backend.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::backend::SettingsProvider;

/// Feature flags gating the notification producers.
///
/// Missing keys default to off. Keys this crate does not know about are kept
/// in `extra` so a re-fetch never loses backend-side configuration.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default, deserialize_with = "null_as_false")]
    pub email_notifications: bool,
    #[serde(default)]
    pub email_address: Option<String>,
    #[serde(default, deserialize_with = "null_as_false")]
    pub unknown_alerts: bool,
    #[serde(default, deserialize_with = "null_as_false")]
    pub system_alerts: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Settings {
    /// Fetch settings, falling back to all-off defaults when the provider fails.
    pub fn load(provider: &dyn SettingsProvider) -> Self {
        match provider.fetch_settings() {
            Ok(settings) => {
                log::info!("notifications: loaded settings from backend");
                settings
            }
            Err(err) => {
                log::error!("notifications: failed to load settings: {}", err);
                Self::default()
            }
        }
    }

    /// The configured recipient, if email delivery is possible at all.
    pub fn email_recipient(&self) -> Option<&str> {
        self.email_address
            .as_deref()
            .map(str::trim)
            .filter(|address| !address.is_empty())
    }
}

fn null_as_false<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<bool>::deserialize(deserializer)?.unwrap_or(false))
}
