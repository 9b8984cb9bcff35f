//! User-facing notifications.

use std::sync::Arc;

use crate::domain::models::{Notification, NotificationKind, Topic};
use crate::domain::ports::NotificationBus;

/// Publishes notifications on the user topic.
///
/// Publishing is best effort: a bus failure is logged and never aborts the
/// state change the notification describes.
#[derive(Clone)]
pub struct Notifier {
    bus: Arc<dyn NotificationBus>,
}

impl Notifier {
    /// Notifier publishing on `bus`.
    pub fn new(bus: Arc<dyn NotificationBus>) -> Self {
        Self { bus }
    }

    /// Publish a notification, logging instead of failing.
    pub fn send(&self, notification: &Notification) {
        let payload = match serde_json::to_value(notification) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "failed to encode notification");
                return;
            }
        };
        if let Err(e) = self.bus.publish(&Topic::UserNotifications, payload) {
            tracing::warn!(error = %e, kind = ?notification.kind, "failed to publish notification");
        }
    }

    /// Broadcast to every user.
    pub fn broadcast(&self, kind: NotificationKind, message: impl Into<String>) {
        self.send(&Notification::new(kind, message));
    }

    /// Address one user, or everyone when `user_id` is `None`.
    pub fn to_user(&self, user_id: Option<i64>, kind: NotificationKind, message: impl Into<String>) {
        self.send(&Notification::new(kind, message).for_user(user_id));
    }
}
