//! User notification boundary.
//!
//! Services that surface peer activity (notifications, telephony, ping) do
//! so through a [`NotificationPresenter`] supplied by the embedding
//! application. The engine never talks to a desktop notification daemon
//! directly.

use std::collections::HashMap;

/// A notification ready for delivery to the platform surface.
///
/// `id` is the engine's composite identifier; delivering a second
/// notification with the same id replaces the first.
#[derive(Debug, Clone, PartialEq)]
pub struct SystemNotification {
    pub id: String,
    pub title: String,
    pub body: String,
    pub sound: bool,
    /// Routing context for action callbacks (device id, peer notification
    /// id, dismissability and the like).
    pub user_info: HashMap<String, String>,
}

impl SystemNotification {
    pub fn new(id: impl Into<String>, title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            body: body.into(),
            sound: false,
            user_info: HashMap::new(),
        }
    }

    pub fn with_sound(mut self) -> Self {
        self.sound = true;
        self
    }

    pub fn with_info(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.user_info.insert(key.into(), value.into());
        self
    }
}

/// Presentation surface. Implementations must not block: deliver by
/// enqueueing onto the platform's own channel and return immediately.
pub trait NotificationPresenter: Send + Sync {
    /// Show or (for an already-shown id) replace a notification.
    fn show(&self, notification: &SystemNotification);

    /// Remove a notification if it is still visible. Unknown ids are a
    /// no-op.
    fn hide(&self, id: &str);
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Records every show/hide call for assertions.
    #[derive(Default)]
    pub struct RecordingPresenter {
        pub shown: Mutex<Vec<SystemNotification>>,
        pub hidden: Mutex<Vec<String>>,
    }

    impl NotificationPresenter for RecordingPresenter {
        fn show(&self, notification: &SystemNotification) {
            self.shown.lock().unwrap().push(notification.clone());
        }

        fn hide(&self, id: &str) {
            self.hidden.lock().unwrap().push(id.to_string());
        }
    }
}
