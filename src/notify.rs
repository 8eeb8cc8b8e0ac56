//! Asynchronous push fan-out. Producers enqueue after their mutation commits
//! and never wait for delivery; a single consumer task drains the bounded
//! queue one message at a time. Delivery is best effort: per-device errors
//! are logged and never retried or surfaced to the mutation caller.

use crate::db::{EventType, PollId, UserId};
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error as ThisError;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Single-slot queue by default: a second producer blocks until the
/// dispatcher has taken the previous message, trading request latency for
/// delivery ordering under load.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1;

/// What a producer does when the queue is full.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnqueuePolicy {
    /// Wait for a slot (backpressure).
    Block,
    /// Drop the message with a warning.
    Drop,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DevicePlatform {
    Ios,
    Android,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Device {
    pub platform: DevicePlatform,
    pub token: String,
}

/// The serialized push body. The device list travels alongside it in
/// [`NotificationMessage`] but is never serialized.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PushPayload {
    #[serde(rename = "type")]
    pub event: i32,
    pub user: String,
    pub user_id: UserId,
    pub title: String,
    pub poll_id: PollId,
}

#[derive(Clone, Debug)]
pub struct NotificationMessage {
    pub event: EventType,
    pub user: String,
    pub user_id: UserId,
    pub title: String,
    pub poll_id: PollId,
    /// Recipient devices, resolved by the producer before enqueueing.
    pub devices: Vec<Device>,
}

impl NotificationMessage {
    pub fn payload(&self) -> PushPayload {
        PushPayload {
            event: self.event.code(),
            user: self.user.clone(),
            user_id: self.user_id,
            title: self.title.clone(),
            poll_id: self.poll_id,
        }
    }
}

#[derive(Debug, ThisError)]
#[error("{0}")]
pub struct PushError(pub String);

/// Platform-specific push back end (APNs, FCM). The wire protocol behind it
/// is out of scope here.
#[async_trait]
pub trait PushSender: Send + Sync {
    async fn send(&self, token: &str, payload: &PushPayload) -> Result<(), PushError>;
}

#[derive(Debug, ThisError)]
#[error("{0}")]
pub struct DirectoryError(pub String);

/// Lookup into the user subsystem: display names and registered devices for
/// a set of users.
#[async_trait]
pub trait DeviceDirectory: Send + Sync {
    async fn display_name(&self, user: UserId) -> Result<String, DirectoryError>;
    async fn devices(&self, users: &[UserId]) -> Result<Vec<Device>, DirectoryError>;
}

/// Producer handle to the dispatcher queue.
#[derive(Clone)]
pub struct Notifier {
    tx: mpsc::Sender<NotificationMessage>,
    policy: EnqueuePolicy,
}

impl Notifier {
    pub async fn enqueue(&self, message: NotificationMessage) -> Result<()> {
        match self.policy {
            EnqueuePolicy::Block => self
                .tx
                .send(message)
                .await
                .map_err(|_| Error::Notify("notification queue closed".to_owned())),
            EnqueuePolicy::Drop => match self.tx.try_send(message) {
                Ok(()) => Ok(()),
                Err(mpsc::error::TrySendError::Full(message)) => {
                    warn!(poll_id = ?message.poll_id, "notification queue full, dropping message");
                    Ok(())
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    Err(Error::Notify("notification queue closed".to_owned()))
                }
            },
        }
    }
}

/// Starts the single consumer task and returns the producer handle. The task
/// exits when every `Notifier` clone has been dropped.
pub fn spawn(
    capacity: usize,
    policy: EnqueuePolicy,
    ios: Arc<dyn PushSender>,
    android: Arc<dyn PushSender>,
) -> (Notifier, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel(capacity);
    let handle = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            deliver(ios.as_ref(), android.as_ref(), &message).await;
        }
        debug!("notification queue closed, dispatcher exiting");
    });
    (Notifier { tx, policy }, handle)
}

async fn deliver(ios: &dyn PushSender, android: &dyn PushSender, message: &NotificationMessage) {
    let payload = message.payload();
    for device in &message.devices {
        if device.token.is_empty() {
            continue;
        }
        let sender = match device.platform {
            DevicePlatform::Ios => ios,
            DevicePlatform::Android => android,
        };
        if let Err(err) = sender.send(&device.token, &payload).await {
            warn!(
                error = %err,
                platform = ?device.platform,
                poll_id = ?message.poll_id,
                "push delivery failed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingSender {
        sent: Mutex<Vec<(String, PushPayload)>>,
        fail: bool,
    }

    #[async_trait]
    impl PushSender for RecordingSender {
        async fn send(&self, token: &str, payload: &PushPayload) -> Result<(), PushError> {
            self.sent
                .lock()
                .unwrap()
                .push((token.to_owned(), payload.clone()));
            if self.fail {
                Err(PushError("gateway unavailable".to_owned()))
            } else {
                Ok(())
            }
        }
    }

    fn message(devices: Vec<Device>) -> NotificationMessage {
        NotificationMessage {
            event: EventType::Vote,
            user: "alice".to_owned(),
            user_id: UserId(7),
            title: "pizza".to_owned(),
            poll_id: PollId(3),
            devices,
        }
    }

    #[tokio::test]
    async fn dispatches_by_platform_and_skips_empty_tokens() {
        let ios = Arc::new(RecordingSender::default());
        let android = Arc::new(RecordingSender::default());
        let (notifier, handle) = spawn(4, EnqueuePolicy::Block, ios.clone(), android.clone());

        notifier
            .enqueue(message(vec![
                Device {
                    platform: DevicePlatform::Ios,
                    token: "ios-1".to_owned(),
                },
                Device {
                    platform: DevicePlatform::Android,
                    token: String::new(),
                },
                Device {
                    platform: DevicePlatform::Android,
                    token: "android-1".to_owned(),
                },
            ]))
            .await
            .unwrap();
        drop(notifier);
        handle.await.unwrap();

        let ios_sent = ios.sent.lock().unwrap();
        let android_sent = android.sent.lock().unwrap();
        assert_eq!(ios_sent.len(), 1);
        assert_eq!(ios_sent[0].0, "ios-1");
        assert_eq!(ios_sent[0].1.event, EventType::Vote.code());
        assert_eq!(ios_sent[0].1.user_id, UserId(7));
        assert_eq!(android_sent.len(), 1);
        assert_eq!(android_sent[0].0, "android-1");
    }

    #[tokio::test]
    async fn delivery_errors_are_swallowed() {
        let ios = Arc::new(RecordingSender {
            fail: true,
            ..Default::default()
        });
        let android = Arc::new(RecordingSender::default());
        let (notifier, handle) = spawn(4, EnqueuePolicy::Block, ios.clone(), android.clone());

        notifier
            .enqueue(message(vec![
                Device {
                    platform: DevicePlatform::Ios,
                    token: "broken".to_owned(),
                },
                Device {
                    platform: DevicePlatform::Android,
                    token: "fine".to_owned(),
                },
            ]))
            .await
            .unwrap();
        drop(notifier);
        handle.await.unwrap();

        // the failing iOS delivery did not stop the android one
        assert_eq!(android.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn drop_policy_sheds_when_full() {
        // no consumer: build the channel by hand so the queue stays full
        let (tx, mut rx) = mpsc::channel(1);
        let notifier = Notifier {
            tx,
            policy: EnqueuePolicy::Drop,
        };
        notifier.enqueue(message(vec![])).await.unwrap();
        // queue is full now; Drop policy returns without blocking
        notifier.enqueue(message(vec![])).await.unwrap();
        assert!(rx.recv().await.is_some());
        assert!(
            tokio::time::timeout(Duration::from_millis(20), rx.recv())
                .await
                .is_err(),
            "second message should have been dropped"
        );
    }

    #[tokio::test]
    async fn push_payload_wire_shape() {
        let payload = message(vec![]).payload();
        assert_eq!(
            serde_json::to_value(&payload).unwrap(),
            serde_json::json!({
                "type": 1,
                "user": "alice",
                "user_id": 7,
                "title": "pizza",
                "poll_id": 3,
            })
        );
    }
}
