//! Poll mutation engine. Every operation follows the same skeleton:
//! pre-transaction validation (poll exists, is open, actor has access), one
//! coordinator call whose unit bumps the sequence number and applies the
//! operation-specific change, then best-effort notification fan-out after the
//! commit. Closing a poll is the exception: it mutates nothing and only
//! notifies.

use crate::coordinator::{run_serializable, RetryPolicy};
use crate::db::{
    EventType, InternalOption, InternalPoll, InternalVote, LastEvent, OptionId, PollId,
    PollSnapshot, QuestionId, QuestionKind, UserId, VoteId,
};
use crate::error::{Result, ValidationError};
use crate::notify::{DeviceDirectory, NotificationMessage, Notifier};
use crate::scheduler::{Job, JobId, Scheduler};
use crate::store::{NewPoll, PollStore, StoreTx};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

// Wire types consumed by the HTTP layer.

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum VoteKind {
    New,
    Upvote,
}

/// `id` is a question id for NEW and an option id for UPVOTE; `value` is the
/// write-in text and is ignored for UPVOTE.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VoteRequest {
    #[serde(rename = "type")]
    pub kind: VoteKind,
    pub id: i64,
    #[serde(default)]
    pub value: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AddParticipantRequest {
    pub poll_id: PollId,
    pub user: UserRef,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UserRef {
    pub id: UserId,
}

#[derive(Clone, Debug, Serialize)]
pub struct VoteResponse {
    pub vote: InternalVote,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub option: Option<InternalOption>,
    pub poll: PollSnapshot,
}

#[derive(Clone, Debug)]
pub enum VoteSpec {
    Upvote { option_id: OptionId },
    New { question_id: QuestionId, text: String },
}

impl From<VoteRequest> for VoteSpec {
    fn from(request: VoteRequest) -> Self {
        match request.kind {
            VoteKind::Upvote => VoteSpec::Upvote {
                option_id: OptionId(request.id),
            },
            VoteKind::New => VoteSpec::New {
                question_id: QuestionId(request.id),
                text: request.value,
            },
        }
    }
}

#[derive(Clone, Debug)]
pub struct QuestionSpec {
    pub text: String,
    pub kind: QuestionKind,
    pub options: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct CreatePollRequest {
    pub creator_id: UserId,
    pub title: String,
    pub closing_date: DateTime<Utc>,
    pub questions: Vec<QuestionSpec>,
}

#[derive(Clone, Debug)]
pub struct CreatedPoll {
    pub poll: PollSnapshot,
    pub close_job: JobId,
}

enum Recipients {
    All,
    Except(Vec<UserId>),
    Only(UserId),
}

pub struct PollEngine {
    store: Arc<dyn PollStore>,
    directory: Arc<dyn DeviceDirectory>,
    notifier: Notifier,
    scheduler: Arc<dyn Scheduler>,
    retry: RetryPolicy,
    close_retries: u32,
}

impl PollEngine {
    pub fn new(
        store: Arc<dyn PollStore>,
        directory: Arc<dyn DeviceDirectory>,
        notifier: Notifier,
        scheduler: Arc<dyn Scheduler>,
    ) -> Self {
        Self {
            store,
            directory,
            notifier,
            scheduler,
            retry: RetryPolicy::default(),
            close_retries: 3,
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_close_retries(mut self, close_retries: u32) -> Self {
        self.close_retries = close_retries;
        self
    }

    /// Creates the poll, its questions and initial options (tagged with
    /// sequence 0), and the creator participant row in one transaction, then
    /// registers the one-shot closing job. A poll without a close trigger is
    /// invalid: scheduler failure is a hard error for the creation request
    /// even though the rows are already committed.
    pub async fn create_poll(&self, request: CreatePollRequest) -> Result<CreatedPoll> {
        let now = Utc::now();
        if request.closing_date <= now {
            return Err(ValidationError::ClosingDateInPast.into());
        }
        let creator_name = self.display_name(request.creator_id).await;
        let event = LastEvent {
            event: EventType::Created,
            user: creator_name,
            user_id: request.creator_id,
            title: request.title.clone(),
        };

        let snapshot = run_serializable(self.store.as_ref(), &self.retry, "create_poll", {
            let request = request.clone();
            move |tx: &mut dyn StoreTx| {
                let request = request.clone();
                let event = event.clone();
                async move {
                    let poll_id = tx
                        .insert_poll(NewPoll {
                            creator_id: request.creator_id,
                            created_at: now,
                            closing_date: request.closing_date,
                            event,
                        })
                        .await?;
                    for question in &request.questions {
                        let question_id = tx
                            .insert_question(poll_id, &question.text, question.kind)
                            .await?;
                        for title in &question.options {
                            tx.insert_option(poll_id, question_id, title, 0).await?;
                        }
                    }
                    tx.insert_participant(poll_id, request.creator_id).await?;
                    tx.snapshot(poll_id).await
                }
                .boxed()
            }
        })
        .await?;

        let close_job = self.scheduler.schedule(
            request.closing_date,
            self.close_retries,
            self.close_job(snapshot.id, request.title.clone()),
        )?;
        debug!(poll_id = ?snapshot.id, job = ?close_job, "poll created, closing job registered");
        Ok(CreatedPoll {
            poll: snapshot,
            close_job,
        })
    }

    /// Casts or replaces the user's vote. UPVOTE re-tags the target option
    /// with the poll's new sequence number; NEW creates a write-in option
    /// tagged with it. The superseded vote row is deleted and the new one
    /// inserted in the same transaction.
    pub async fn vote(&self, poll_id: PollId, user_id: UserId, spec: VoteSpec) -> Result<VoteResponse> {
        let now = Utc::now();
        self.require_open_poll(poll_id, now).await?;
        if !self.store.is_participant(poll_id, user_id).await? {
            return Err(ValidationError::NotParticipant {
                poll: poll_id,
                user: user_id,
            }
            .into());
        }

        let (spec, event_title) = match spec {
            VoteSpec::New { question_id, text } => {
                let text = text.trim().to_owned();
                if text.is_empty() {
                    return Err(ValidationError::EmptyOptionText.into());
                }
                let question = self
                    .store
                    .question(question_id)
                    .await?
                    .filter(|question| question.poll_id == poll_id)
                    .ok_or(ValidationError::QuestionNotFound(question_id))?;
                if question.kind != QuestionKind::Open {
                    return Err(ValidationError::NotWriteIn(question_id).into());
                }
                let title = text.clone();
                (VoteSpec::New { question_id, text }, title)
            }
            VoteSpec::Upvote { option_id } => {
                let option = self
                    .store
                    .option(option_id)
                    .await?
                    .filter(|option| option.poll_id == poll_id)
                    .ok_or(ValidationError::OptionNotFound(option_id))?;
                (VoteSpec::Upvote { option_id }, option.title)
            }
        };

        let actor = self.display_name(user_id).await;
        let event = LastEvent {
            event: EventType::Vote,
            user: actor.clone(),
            user_id,
            title: event_title.clone(),
        };

        let (snapshot, vote, option) =
            run_serializable(self.store.as_ref(), &self.retry, "vote", move |tx: &mut dyn StoreTx| {
                let spec = spec.clone();
                let event = event.clone();
                async move {
                    let sequence = tx.bump_poll(poll_id, &event, now).await?;
                    let (option_id, created) = match spec {
                        VoteSpec::New { question_id, text } => {
                            let id = tx.insert_option(poll_id, question_id, &text, sequence).await?;
                            let option = InternalOption {
                                id,
                                poll_id,
                                question_id,
                                title: text,
                                sequence_number: sequence,
                            };
                            (id, Some(option))
                        }
                        VoteSpec::Upvote { option_id } => {
                            if tx.touch_option(option_id, sequence).await? == 0 {
                                return Err(ValidationError::OptionNotFound(option_id).into());
                            }
                            (option_id, None)
                        }
                    };
                    // snapshot before deleting the superseded vote; its
                    // sequence number is the one tagged onto the option
                    let snapshot = tx.snapshot(poll_id).await?;
                    tx.delete_vote_for_user(poll_id, user_id).await?;
                    let vote_id = tx.insert_vote(poll_id, option_id, user_id).await?;
                    let vote = InternalVote {
                        id: vote_id,
                        poll_id,
                        option_id,
                        user_id,
                    };
                    Ok((snapshot, vote, created))
                }
                .boxed()
            })
            .await?;

        self.fan_out(
            poll_id,
            EventType::Vote,
            user_id,
            &actor,
            &event_title,
            Recipients::Except(vec![user_id]),
        )
        .await;

        Ok(VoteResponse {
            vote,
            option,
            poll: snapshot,
        })
    }

    /// Deletes the vote matched by both id and owner, so a user cannot undo
    /// someone else's vote.
    pub async fn undo_vote(&self, vote_id: VoteId, user_id: UserId) -> Result<PollSnapshot> {
        let now = Utc::now();
        let vote = self
            .store
            .vote(vote_id)
            .await?
            .filter(|vote| vote.user_id == user_id)
            .ok_or(ValidationError::VoteNotFound(vote_id))?;
        let poll_id = vote.poll_id;
        self.require_open_poll(poll_id, now).await?;

        let option_title = self
            .store
            .option(vote.option_id)
            .await?
            .map(|option| option.title)
            .unwrap_or_default();
        let actor = self.display_name(user_id).await;
        let event = LastEvent {
            event: EventType::VoteUndone,
            user: actor.clone(),
            user_id,
            title: option_title.clone(),
        };

        let snapshot =
            run_serializable(self.store.as_ref(), &self.retry, "undo_vote", move |tx: &mut dyn StoreTx| {
                let event = event.clone();
                async move {
                    tx.bump_poll(poll_id, &event, now).await?;
                    if tx.delete_vote(vote_id, user_id).await? == 0 {
                        return Err(ValidationError::VoteNotFound(vote_id).into());
                    }
                    tx.snapshot(poll_id).await
                }
                .boxed()
            })
            .await?;

        self.fan_out(
            poll_id,
            EventType::VoteUndone,
            user_id,
            &actor,
            &option_title,
            Recipients::Except(vec![user_id]),
        )
        .await;
        Ok(snapshot)
    }

    pub async fn leave_poll(&self, poll_id: PollId, user_id: UserId) -> Result<PollSnapshot> {
        let now = Utc::now();
        self.require_open_poll(poll_id, now).await?;
        if !self.store.is_participant(poll_id, user_id).await? {
            return Err(ValidationError::NotParticipant {
                poll: poll_id,
                user: user_id,
            }
            .into());
        }

        let actor = self.display_name(user_id).await;
        let event = LastEvent {
            event: EventType::ParticipantLeft,
            user: actor.clone(),
            user_id,
            title: actor.clone(),
        };

        let snapshot =
            run_serializable(self.store.as_ref(), &self.retry, "leave_poll", move |tx: &mut dyn StoreTx| {
                let event = event.clone();
                async move {
                    tx.bump_poll(poll_id, &event, now).await?;
                    if tx.delete_participant(poll_id, user_id).await? == 0 {
                        return Err(ValidationError::NotParticipant {
                            poll: poll_id,
                            user: user_id,
                        }
                        .into());
                    }
                    tx.snapshot(poll_id).await
                }
                .boxed()
            })
            .await?;

        // the actor's row is already gone, so this reaches everyone remaining
        self.fan_out(
            poll_id,
            EventType::ParticipantLeft,
            user_id,
            &actor,
            &actor,
            Recipients::All,
        )
        .await;
        Ok(snapshot)
    }

    /// Creator-only. The duplicate check runs once before the transaction for
    /// a cheap rejection and again inside it, because a concurrent add for
    /// the same user may have committed in between.
    pub async fn add_participant(
        &self,
        poll_id: PollId,
        new_user_id: UserId,
        acting_user_id: UserId,
    ) -> Result<PollSnapshot> {
        let now = Utc::now();
        let poll = self.require_open_poll(poll_id, now).await?;
        if poll.creator_id != acting_user_id {
            return Err(ValidationError::NotCreator {
                poll: poll_id,
                user: acting_user_id,
            }
            .into());
        }
        if self.store.is_participant(poll_id, new_user_id).await? {
            return Err(ValidationError::DuplicateParticipant {
                poll: poll_id,
                user: new_user_id,
            }
            .into());
        }

        let actor = self.display_name(acting_user_id).await;
        let new_user_name = self.display_name(new_user_id).await;
        let event = LastEvent {
            event: EventType::ParticipantAdded,
            user: actor.clone(),
            user_id: acting_user_id,
            title: new_user_name.clone(),
        };

        let snapshot = run_serializable(
            self.store.as_ref(),
            &self.retry,
            "add_participant",
            move |tx: &mut dyn StoreTx| {
                let event = event.clone();
                async move {
                    if tx.is_participant(poll_id, new_user_id).await? {
                        return Err(ValidationError::DuplicateParticipant {
                            poll: poll_id,
                            user: new_user_id,
                        }
                        .into());
                    }
                    tx.bump_poll(poll_id, &event, now).await?;
                    tx.insert_participant(poll_id, new_user_id).await?;
                    tx.snapshot(poll_id).await
                }
                .boxed()
            },
        )
        .await?;

        // two-message split: one to the existing participants, one tailored
        // to the user who was just added
        self.fan_out(
            poll_id,
            EventType::ParticipantAdded,
            acting_user_id,
            &actor,
            &new_user_name,
            Recipients::Except(vec![acting_user_id, new_user_id]),
        )
        .await;
        self.fan_out(
            poll_id,
            EventType::ParticipantAdded,
            acting_user_id,
            &actor,
            &actor,
            Recipients::Only(new_user_id),
        )
        .await;
        Ok(snapshot)
    }

    /// Scheduler-invoked. Deliberately not a sequence bump: closing changes
    /// no queryable field, the poll is closed by its timestamp alone. Errors
    /// propagate so the scheduler can apply its bounded retry.
    pub async fn close_poll(&self, poll_id: PollId, title: &str) -> Result<()> {
        close_poll_impl(
            self.store.as_ref(),
            self.directory.as_ref(),
            &self.notifier,
            poll_id,
            title,
        )
        .await
    }

    fn close_job(&self, poll_id: PollId, title: String) -> Job {
        let store = Arc::clone(&self.store);
        let directory = Arc::clone(&self.directory);
        let notifier = self.notifier.clone();
        Box::new(move || {
            let store = Arc::clone(&store);
            let directory = Arc::clone(&directory);
            let notifier = notifier.clone();
            let title = title.clone();
            async move {
                close_poll_impl(
                    store.as_ref(),
                    directory.as_ref(),
                    &notifier,
                    poll_id,
                    &title,
                )
                .await
            }
            .boxed()
        })
    }

    async fn require_open_poll(&self, poll_id: PollId, now: DateTime<Utc>) -> Result<InternalPoll> {
        let poll = self
            .store
            .poll(poll_id)
            .await?
            .ok_or(ValidationError::PollNotFound(poll_id))?;
        if !poll.is_open(now) {
            return Err(ValidationError::PollClosed(poll_id).into());
        }
        Ok(poll)
    }

    async fn display_name(&self, user: UserId) -> String {
        match self.directory.display_name(user).await {
            Ok(name) => name,
            Err(err) => {
                warn!(user = ?user, error = %err, "display name lookup failed");
                String::new()
            }
        }
    }

    /// Post-commit fan-out. Failures here never fail the mutation: the rows
    /// are durable, delivery is best effort.
    async fn fan_out(
        &self,
        poll_id: PollId,
        event: EventType,
        actor_id: UserId,
        actor_name: &str,
        title: &str,
        recipients: Recipients,
    ) {
        let targets = match recipients {
            Recipients::Only(user) => vec![user],
            Recipients::All | Recipients::Except(_) => {
                match self.store.participants(poll_id).await {
                    Ok(users) => match &recipients {
                        Recipients::Except(excluded) => users
                            .into_iter()
                            .filter(|user| !excluded.contains(user))
                            .collect(),
                        _ => users,
                    },
                    Err(err) => {
                        warn!(poll_id = ?poll_id, error = %err, "participant lookup for fan-out failed");
                        return;
                    }
                }
            }
        };
        if targets.is_empty() {
            return;
        }
        let devices = match self.directory.devices(&targets).await {
            Ok(devices) => devices,
            Err(err) => {
                warn!(poll_id = ?poll_id, error = %err, "device resolution failed");
                return;
            }
        };
        let message = NotificationMessage {
            event,
            user: actor_name.to_owned(),
            user_id: actor_id,
            title: title.to_owned(),
            poll_id,
            devices,
        };
        if let Err(err) = self.notifier.enqueue(message).await {
            warn!(poll_id = ?poll_id, error = %err, "notification enqueue failed");
        }
    }
}

async fn close_poll_impl(
    store: &dyn PollStore,
    directory: &dyn DeviceDirectory,
    notifier: &Notifier,
    poll_id: PollId,
    title: &str,
) -> Result<()> {
    let Some(poll) = store.poll(poll_id).await? else {
        // administratively removed; re-firing the job would never succeed
        warn!(poll_id = ?poll_id, "closing job fired for missing poll");
        return Ok(());
    };
    let participants = store.participants(poll_id).await?;
    let devices = directory
        .devices(&participants)
        .await
        .map_err(|err| crate::Error::Notify(err.to_string()))?;
    notifier
        .enqueue(NotificationMessage {
            event: EventType::Closed,
            user: String::new(),
            user_id: poll.creator_id,
            title: title.to_owned(),
            poll_id,
            devices,
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vote_request_maps_to_spec() {
        let request: VoteRequest =
            serde_json::from_str(r#"{"type": "NEW", "id": 12, "value": "thai"}"#).unwrap();
        match VoteSpec::from(request) {
            VoteSpec::New { question_id, text } => {
                assert_eq!(question_id, QuestionId(12));
                assert_eq!(text, "thai");
            }
            _ => panic!("expected a write-in spec"),
        }

        let request: VoteRequest =
            serde_json::from_str(r#"{"type": "UPVOTE", "id": 4}"#).unwrap();
        match VoteSpec::from(request) {
            VoteSpec::Upvote { option_id } => assert_eq!(option_id, OptionId(4)),
            _ => panic!("expected an upvote spec"),
        }
    }

    #[test]
    fn add_participant_request_wire_shape() {
        let request: AddParticipantRequest =
            serde_json::from_str(r#"{"poll_id": 9, "user": {"id": 3}}"#).unwrap();
        assert_eq!(request.poll_id, PollId(9));
        assert_eq!(request.user.id, UserId(3));
    }

    #[test]
    fn snapshot_serializes_epoch_milliseconds() {
        use chrono::TimeZone;
        let snapshot = PollSnapshot {
            id: PollId(5),
            closing_date: Utc.timestamp_millis_opt(1_600_000_000_123).unwrap(),
            last_updated: Utc.timestamp_millis_opt(1_600_000_000_456).unwrap(),
            sequence_number: 8,
        };
        assert_eq!(
            serde_json::to_value(&snapshot).unwrap(),
            serde_json::json!({
                "id": 5,
                "closing_date": 1_600_000_000_123_i64,
                "last_updated": 1_600_000_000_456_i64,
                "sequence_number": 8,
            })
        );
    }
}
