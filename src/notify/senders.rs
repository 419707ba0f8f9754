//! Delivery channels behind the notification queue.
//!
//! The log senders are the stock implementations; an SMTP or push channel
//! plugs in through the same traits.

use anyhow::Result;
use serde_json::Value;

pub trait EmailSender: Send + Sync {
    fn send_email(&self, recipient: &str, subject: &str, body: &str) -> Result<()>;
}

pub trait SystemSender: Send + Sync {
    fn send_system(&self, message: &str, payload: &Value) -> Result<()>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct LogEmailSender;

impl EmailSender for LogEmailSender {
    fn send_email(&self, recipient: &str, subject: &str, body: &str) -> Result<()> {
        log::info!("notifications: would send email to {}: {}", recipient, subject);
        log::info!("notifications: email body: {}", body.trim());
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct LogSystemSender;

impl SystemSender for LogSystemSender {
    fn send_system(&self, message: &str, payload: &Value) -> Result<()> {
        log::info!("notifications: system notification: {}", message);
        log::debug!("notifications: system payload: {}", payload);
        Ok(())
    }
}
