//! Notifications with per-key throttling.
//!
//! The stop machines use this for pre-close warnings and the gateway for
//! its notifier-trader forwarding. The default sink is the log; the trait
//! is the seam for anything richer.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use tracing::info;

/// A notification sink.
pub trait Notifier: Send + Sync {
    /// Send a notification. `key` groups related messages for throttling;
    /// urgent messages bypass the throttle.
    fn notify(&self, key: &str, title: &str, body: &str, urgent: bool);
}

/// Log-backed notifier with per-key throttling.
pub struct LogNotifier {
    throttle: Duration,
    last_sent: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl LogNotifier {
    pub fn new(throttle_secs: u64) -> Self {
        Self {
            throttle: Duration::seconds(throttle_secs as i64),
            last_sent: Mutex::new(HashMap::new()),
        }
    }

    fn should_send(&self, key: &str, now: DateTime<Utc>) -> bool {
        let mut last_sent = self.last_sent.lock();
        match last_sent.get(key) {
            Some(last) if now - *last < self.throttle => false,
            _ => {
                last_sent.insert(key.to_string(), now);
                true
            }
        }
    }
}

impl Notifier for LogNotifier {
    fn notify(&self, key: &str, title: &str, body: &str, urgent: bool) {
        if !urgent && !self.should_send(key, Utc::now()) {
            return;
        }
        info!(key = %key, title = %title, urgent, "{}", body);
    }
}
