//! Transaction coordinator: runs a unit of work inside a serializable
//! transaction and re-runs the *entire* unit from scratch on a serialization
//! conflict, so every retry re-reads its inputs (the previously observed
//! sequence number may be stale by then). Any other error rolls back and
//! propagates immediately.

use crate::error::{Error, Result};
use crate::store::{PollStore, StoreTx};
use futures::future::BoxFuture;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// Conflict-retry policy. The default is bounded with a small backoff, since
/// retrying forever would livelock under sustained contention. Exhaustion
/// surfaces the final `Conflict` to the caller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: Option<u32>,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: Some(32),
            backoff: Duration::from_millis(5),
        }
    }
}

impl RetryPolicy {
    /// Retry until the unit commits, with no attempt cap.
    pub fn unbounded() -> Self {
        Self {
            max_attempts: None,
            ..Self::default()
        }
    }
}

/// Runs `unit` inside a serializable transaction, committing on success.
/// `op` names the logical operation for the retry log; a fresh attempt id
/// correlates all retries of one logical call.
pub async fn run_serializable<T, F>(
    store: &dyn PollStore,
    policy: &RetryPolicy,
    op: &str,
    unit: F,
) -> Result<T>
where
    T: Send,
    F: for<'a> Fn(&'a mut dyn StoreTx) -> BoxFuture<'a, Result<T>> + Send,
{
    let attempt_id = Uuid::new_v4();
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        let mut tx = store.begin_serializable().await?;
        let outcome = unit(&mut *tx).await;
        match outcome {
            Ok(value) => match tx.commit().await {
                Ok(()) => {
                    if attempt > 1 {
                        debug!(%attempt_id, attempt, op, "unit committed after retries");
                    }
                    return Ok(value);
                }
                Err(Error::Conflict) => {}
                Err(err) => return Err(err),
            },
            Err(Error::Conflict) => {
                if let Err(err) = tx.rollback().await {
                    debug!(%attempt_id, op, error = %err, "rollback after conflict failed");
                }
            }
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    debug!(%attempt_id, op, error = %rollback_err, "rollback failed");
                }
                return Err(err);
            }
        }

        warn!(%attempt_id, attempt, op, "serialization conflict, retrying unit from scratch");
        if let Some(max) = policy.max_attempts {
            if attempt >= max {
                return Err(Error::Conflict);
            }
        }
        if !policy.backoff.is_zero() {
            tokio::time::sleep(policy.backoff).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{EventType, LastEvent, UserId};
    use crate::error::ValidationError;
    use crate::store::{MemoryStore, NewPoll};
    use chrono::{Duration as ChronoDuration, Utc};
    use futures::FutureExt;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: Some(8),
            backoff: Duration::ZERO,
        }
    }

    fn new_poll(creator: i64) -> NewPoll {
        let now = Utc::now();
        NewPoll {
            creator_id: UserId(creator),
            created_at: now,
            closing_date: now + ChronoDuration::hours(1),
            event: LastEvent {
                event: EventType::Created,
                user: "creator".to_owned(),
                user_id: UserId(creator),
                title: "lunch".to_owned(),
            },
        }
    }

    #[tokio::test]
    async fn commits_once_without_contention() {
        let store = MemoryStore::new();
        let calls = AtomicU32::new(0);
        let poll_id = run_serializable(&store, &fast_policy(), "create_poll", |tx: &mut dyn StoreTx| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move { tx.insert_poll(new_poll(1)).await }.boxed()
        })
        .await
        .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(store.poll(poll_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn reruns_whole_unit_on_injected_conflict() {
        let store = MemoryStore::new();
        store.inject_conflicts(2);
        let calls = AtomicU32::new(0);
        run_serializable(&store, &fast_policy(), "create_poll", |tx: &mut dyn StoreTx| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move { tx.insert_poll(new_poll(1)).await }.boxed()
        })
        .await
        .unwrap();
        // two conflicted attempts plus the committing one
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(store.participants(crate::db::PollId(1)).await.unwrap(), []);
    }

    #[tokio::test]
    async fn validation_errors_are_not_retried() {
        let store = MemoryStore::new();
        let calls = AtomicU32::new(0);
        let err = run_serializable::<(), _>(&store, &fast_policy(), "vote", |_tx: &mut dyn StoreTx| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move { Err(ValidationError::EmptyOptionText.into()) }.boxed()
        })
        .await
        .unwrap_err();
        assert!(matches!(
            err,
            Error::Validation(ValidationError::EmptyOptionText)
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn bounded_policy_surfaces_conflict_after_exhaustion() {
        let store = MemoryStore::new();
        store.inject_conflicts(100);
        let policy = RetryPolicy {
            max_attempts: Some(3),
            backoff: Duration::ZERO,
        };
        let err = run_serializable(&store, &policy, "create_poll", |tx: &mut dyn StoreTx| {
            async move { tx.insert_poll(new_poll(1)).await }.boxed()
        })
        .await
        .unwrap_err();
        assert!(err.is_conflict());
    }
}
