//! User-visible failure notifications
//!
//! Failures are reported here rather than into the transcript. Each
//! notification carries a key; posting the same key again within the
//! cooldown window is suppressed.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use uuid::Uuid;

use crate::inference::{EngineError, EngineKind};

/// Default window during which a key is not re-notified
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(30);

#[derive(Clone, Debug, PartialEq)]
pub struct Notification {
    pub id: Uuid,
    pub key: String,
    pub title: String,
    pub message: String,
    pub remediation: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Tracks active notifications and publishes them on a watch channel
pub struct NotificationCenter {
    cooldown: Duration,
    active: Mutex<Vec<Notification>>,
    last_posted: Mutex<HashMap<String, Instant>>,
    sender: watch::Sender<Vec<Notification>>,
}

impl Default for NotificationCenter {
    fn default() -> Self {
        Self::new(DEFAULT_COOLDOWN)
    }
}

impl NotificationCenter {
    pub fn new(cooldown: Duration) -> Self {
        let (sender, _) = watch::channel(Vec::new());
        Self {
            cooldown,
            active: Mutex::new(Vec::new()),
            last_posted: Mutex::new(HashMap::new()),
            sender,
        }
    }

    /// Post a notification unless `key` was posted within the cooldown
    pub fn post(
        &self,
        key: &str,
        title: &str,
        message: &str,
        remediation: Option<&str>,
    ) -> Option<Uuid> {
        {
            let mut last = self.last_posted.lock().expect("last_posted mutex poisoned");
            let now = Instant::now();
            if let Some(at) = last.get(key) {
                if now.duration_since(*at) < self.cooldown {
                    tracing::debug!("Suppressing repeated notification {}", key);
                    return None;
                }
            }
            last.insert(key.to_string(), now);
        }

        let notification = Notification {
            id: Uuid::new_v4(),
            key: key.to_string(),
            title: title.to_string(),
            message: message.to_string(),
            remediation: remediation.filter(|r| !r.is_empty()).map(str::to_string),
            timestamp: Utc::now(),
        };
        let id = notification.id;
        tracing::error!("{}: {}", notification.title, notification.message);

        self.active
            .lock()
            .expect("notifications mutex poisoned")
            .push(notification);
        self.sync();
        Some(id)
    }

    /// Post an engine failure under `engine.<kind>`; cancellations are dropped
    pub fn post_engine_error(&self, engine: EngineKind, error: &EngineError) -> Option<Uuid> {
        if error.is_cancelled() {
            return None;
        }
        let kind = error.kind();
        let key = format!("engine.{}", kind.as_str());
        let message = format!("{} engine: {}", engine, error);
        self.post(&key, kind.title(), &message, Some(kind.remediation()))
    }

    pub fn dismiss(&self, id: Uuid) -> bool {
        let removed = {
            let mut active = self.active.lock().expect("notifications mutex poisoned");
            let before = active.len();
            active.retain(|n| n.id != id);
            before != active.len()
        };
        if removed {
            self.sync();
        }
        removed
    }

    pub fn active(&self) -> Vec<Notification> {
        self.active
            .lock()
            .expect("notifications mutex poisoned")
            .clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<Notification>> {
        self.sender.subscribe()
    }

    fn sync(&self) {
        let active = self.active();
        self.sender.send_replace(active);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_cooldown_suppresses_same_key() {
        let center = NotificationCenter::new(Duration::from_secs(60));
        assert!(center.post("engine.timeout", "Timed out", "slow", None).is_some());
        assert!(center.post("engine.timeout", "Timed out", "slow again", None).is_none());
        assert!(center.post("engine.not_found", "Missing", "gone", Some("install")).is_some());
        assert_eq!(center.active().len(), 2);
    }

    #[test]
    fn test_cooldown_expires() {
        let center = NotificationCenter::new(Duration::from_millis(10));
        assert!(center.post("k", "t", "m", None).is_some());
        std::thread::sleep(Duration::from_millis(20));
        assert!(center.post("k", "t", "m", None).is_some());
    }

    #[test]
    fn test_dismiss_publishes() {
        let center = NotificationCenter::default();
        let rx = center.subscribe();
        let id = center.post("k", "t", "m", Some("")).unwrap();
        assert_eq!(rx.borrow().len(), 1);
        assert!(rx.borrow()[0].remediation.is_none());

        assert!(center.dismiss(id));
        assert!(rx.borrow().is_empty());
        assert!(!center.dismiss(id));
    }

    #[test]
    fn test_engine_errors() {
        let center = NotificationCenter::default();
        assert!(center
            .post_engine_error(EngineKind::Cli, &EngineError::Cancelled)
            .is_none());

        let err = EngineError::ModelNotFound(PathBuf::from("/m/x.gguf"));
        center.post_engine_error(EngineKind::Cli, &err).unwrap();
        let posted = &center.active()[0];
        assert_eq!(posted.key, "engine.not_found");
        assert!(posted.message.starts_with("cli engine: Model not found"));
        assert!(posted.remediation.is_some());
    }
}
