use std::sync::Mutex;

use tracing::info;

use crate::notify::{Notification, Notifier, Recipient};
use crate::CoreError;

/// Logs every notification as a structured event. Stands in for a real
/// delivery channel.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, n: &Notification) -> Result<(), CoreError> {
        let recipient = match &n.recipient {
            Recipient::AllUsers => "*",
            Recipient::User(id) => id.as_str(),
        };
        info!(kind = n.kind.as_str(), recipient, details = ?n.kind, "notification");
        Ok(())
    }
}

/// Keeps sent notifications in memory; can be told to fail every delivery.
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
    fail: bool,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().map(|v| v.clone()).unwrap_or_default()
    }

    pub fn clear(&self) {
        if let Ok(mut v) = self.sent.lock() {
            v.clear();
        }
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, n: &Notification) -> Result<(), CoreError> {
        if self.fail {
            return Err(CoreError::UpstreamUnavailable("notifier offline".into()));
        }
        self.sent
            .lock()
            .map_err(|_| CoreError::Repository("mutex poisoned".into()))?
            .push(n.clone());
        Ok(())
    }
}
