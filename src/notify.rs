//! User-facing notices and their best-effort delivery
use super::document::TimeStamp;
use super::error::StoreError;
use super::utils::{key_scope, scoped_key};
use chrono::Utc;
use sled::{Db, Tree};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationType {
    #[n(0)]
    ApprovalRequest,
    #[n(1)]
    ApprovalRejected,
    #[n(2)]
    ApprovalApproved,
    #[n(3)]
    ApprovalCompleted,
}

impl NotificationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationType::ApprovalRequest => "approval_request",
            NotificationType::ApprovalRejected => "approval_rejected",
            NotificationType::ApprovalApproved => "approval_approved",
            NotificationType::ApprovalCompleted => "approval_completed",
        }
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    #[n(0)]
    pub id: u64,
    #[n(1)]
    pub recipient_id: String,
    #[n(2)]
    pub kind: NotificationType,
    #[n(3)]
    pub content: String,
    #[n(4)]
    pub link: String,
    #[n(5)]
    pub read: bool,
    #[n(6)]
    pub created_at: TimeStamp<Utc>,
}

/// Where notices end up.
pub trait NotificationSink: Send + Sync {
    fn deliver(
        &self,
        recipient_id: &str,
        kind: NotificationType,
        content: &str,
        link: &str,
    ) -> Result<(), StoreError>;

    /// Oldest first.
    fn for_recipient(&self, recipient_id: &str) -> Result<Vec<Notification>, StoreError>;

    /// Returns false when the recipient has no such notification.
    fn mark_read(&self, recipient_id: &str, notification_id: u64) -> Result<bool, StoreError>;
}

pub struct SledNotifier {
    instance: Arc<Db>,
    notifications: Tree,
}

fn notification_key(recipient_id: &str, id: u64) -> Result<Vec<u8>, StoreError> {
    scoped_key(recipient_id, &id.to_be_bytes())
}

impl SledNotifier {
    pub fn new(instance: Arc<Db>) -> Result<Self, StoreError> {
        let notifications = instance.open_tree("notifications")?;
        Ok(Self {
            instance,
            notifications,
        })
    }
}

impl NotificationSink for SledNotifier {
    fn deliver(
        &self,
        recipient_id: &str,
        kind: NotificationType,
        content: &str,
        link: &str,
    ) -> Result<(), StoreError> {
        let id = self.instance.generate_id()?;
        let key = notification_key(recipient_id, id)?;
        let notification = Notification {
            id,
            recipient_id: recipient_id.to_string(),
            kind,
            content: content.to_string(),
            link: link.to_string(),
            read: false,
            created_at: TimeStamp::new(),
        };
        self.notifications
            .insert(key, minicbor::to_vec(&notification)?)?;
        Ok(())
    }

    fn for_recipient(&self, recipient_id: &str) -> Result<Vec<Notification>, StoreError> {
        self.notifications
            .scan_prefix(key_scope(recipient_id)?)
            .map(|item| -> Result<Notification, StoreError> {
                let (_, bytes) = item?;
                Ok(minicbor::decode(&bytes)?)
            })
            .collect()
    }

    fn mark_read(&self, recipient_id: &str, notification_id: u64) -> Result<bool, StoreError> {
        let key = notification_key(recipient_id, notification_id)?;
        let Some(bytes) = self.notifications.get(&key)? else {
            return Ok(false);
        };
        let mut notification: Notification = minicbor::decode(&bytes)?;
        if !notification.read {
            notification.read = true;
            self.notifications
                .insert(key, minicbor::to_vec(&notification)?)?;
        }
        Ok(true)
    }
}

/// Wraps a sink so delivery failures are retried, logged and never surfaced.
pub struct NotificationDispatcher<N> {
    sink: N,
    attempts: u32,
}

impl<N: NotificationSink> NotificationDispatcher<N> {
    pub fn new(sink: N, attempts: u32) -> Self {
        Self {
            sink,
            attempts: attempts.max(1),
        }
    }

    pub fn sink(&self) -> &N {
        &self.sink
    }

    /// Returns whether the notice was delivered.
    pub fn notify(
        &self,
        recipient_id: &str,
        kind: NotificationType,
        content: &str,
        link: &str,
    ) -> bool {
        for attempt in 1..=self.attempts {
            match self.sink.deliver(recipient_id, kind, content, link) {
                Ok(()) => {
                    debug!(recipient = %recipient_id, kind = kind.as_str(), "notification delivered");
                    return true;
                }
                Err(e) => {
                    warn!(
                        error = %e,
                        recipient = %recipient_id,
                        kind = kind.as_str(),
                        attempt,
                        "notification delivery failed"
                    );
                }
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::tempdir;

    struct Flaky {
        failures_left: AtomicU32,
        delivered: AtomicU32,
    }

    impl NotificationSink for Flaky {
        fn deliver(&self, _: &str, _: NotificationType, _: &str, _: &str) -> Result<(), StoreError> {
            if self.failures_left.load(Ordering::SeqCst) > 0 {
                self.failures_left.fetch_sub(1, Ordering::SeqCst);
                return Err(StoreError::Unavailable("sink offline".into()));
            }
            self.delivered.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn for_recipient(&self, _: &str) -> Result<Vec<Notification>, StoreError> {
            Ok(vec![])
        }
        fn mark_read(&self, _: &str, _: u64) -> Result<bool, StoreError> {
            Ok(false)
        }
    }

    fn flaky(failures: u32) -> Flaky {
        Flaky {
            failures_left: AtomicU32::new(failures),
            delivered: AtomicU32::new(0),
        }
    }

    #[test]
    fn retries_until_delivered() {
        let dispatcher = NotificationDispatcher::new(flaky(1), 2);

        assert!(dispatcher.notify("user_a", NotificationType::ApprovalRequest, "hi", "/x"));
        assert_eq!(dispatcher.sink().delivered.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn gives_up_without_error() {
        let dispatcher = NotificationDispatcher::new(flaky(5), 2);

        assert!(!dispatcher.notify("user_a", NotificationType::ApprovalRequest, "hi", "/x"));
        assert_eq!(dispatcher.sink().delivered.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn sled_notifier_marks_read() {
        let temp_dir = tempdir().unwrap();
        let db = Arc::new(sled::open(temp_dir.path().join("notify.db")).unwrap());
        let notifier = SledNotifier::new(db).unwrap();

        notifier
            .deliver("user_a", NotificationType::ApprovalApproved, "done", "/approvals/doc_1")
            .unwrap();
        notifier
            .deliver("user_ab", NotificationType::ApprovalRequest, "other", "/approvals/doc_2")
            .unwrap();

        let inbox = notifier.for_recipient("user_a").unwrap();
        assert_eq!(inbox.len(), 1);
        assert!(!inbox[0].read);

        assert!(notifier.mark_read("user_a", inbox[0].id).unwrap());
        assert!(notifier.for_recipient("user_a").unwrap()[0].read);
        assert!(!notifier.mark_read("user_ab", inbox[0].id).unwrap());
    }

    #[test]
    fn recipients_sharing_a_prefix_stay_apart() {
        let temp_dir = tempdir().unwrap();
        let db = Arc::new(sled::open(temp_dir.path().join("notify.db")).unwrap());
        let notifier = SledNotifier::new(db).unwrap();

        for recipient in ["team/lead", "teammate", "team"] {
            notifier
                .deliver(recipient, NotificationType::ApprovalRequest, recipient, "/approvals/doc_1")
                .unwrap();
        }

        let inbox = notifier.for_recipient("team").unwrap();
        assert_eq!(inbox.len(), 1);
        assert_eq!(inbox[0].recipient_id, "team");
        assert_eq!(notifier.for_recipient("team/lead").unwrap().len(), 1);

        let lead = &notifier.for_recipient("team/lead").unwrap()[0];
        assert!(!notifier.mark_read("team", lead.id).unwrap());
    }

    #[test]
    fn nul_recipient_is_refused() {
        let temp_dir = tempdir().unwrap();
        let db = Arc::new(sled::open(temp_dir.path().join("notify.db")).unwrap());
        let notifier = SledNotifier::new(db).unwrap();

        let err = notifier
            .deliver("team\0lead", NotificationType::ApprovalRequest, "hi", "/x")
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidKey(_)));
        assert!(notifier.for_recipient("team").unwrap().is_empty());
    }
}
