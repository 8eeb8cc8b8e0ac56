//! In-memory gateway with first-committer-wins semantics: a transaction works
//! on a copy of the state taken at begin and commits only if no other writing
//! transaction committed in between. Concurrent mutations therefore surface
//! the same `Conflict` condition Postgres reports under serializable
//! isolation, which makes this store both a test double and a reference model
//! for the retry loop.

use super::{NewPoll, PollStore, StoreTx};
use crate::db::{
    InternalOption, InternalPoll, InternalQuestion, InternalVote, LastEvent, OptionId, PollId,
    PollSnapshot, QuestionId, QuestionKind, UserId, VoteId,
};
use crate::error::{Error, Result, ValidationError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

#[derive(Default, Clone)]
struct State {
    version: u64,
    next_id: i64,
    polls: HashMap<i64, InternalPoll>,
    questions: HashMap<i64, InternalQuestion>,
    options: HashMap<i64, InternalOption>,
    votes: HashMap<i64, InternalVote>,
    participants: BTreeSet<(i64, i64)>,
}

impl State {
    fn alloc(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

#[derive(Default)]
struct Inner {
    state: Mutex<State>,
    // number of upcoming writing commits to fail with a conflict
    injected_conflicts: Mutex<u32>,
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `n` writing commits fail with a serialization conflict,
    /// regardless of actual contention.
    pub fn inject_conflicts(&self, n: u32) {
        *self.inner.injected_conflicts.lock().unwrap() += n;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.inner.state.lock().unwrap()
    }
}

#[async_trait]
impl PollStore for MemoryStore {
    async fn begin_serializable(&self) -> Result<Box<dyn StoreTx>> {
        let state = self.lock().clone();
        Ok(Box::new(MemTx {
            inner: Arc::clone(&self.inner),
            base_version: state.version,
            work: state,
            wrote: false,
        }))
    }

    async fn poll(&self, id: PollId) -> Result<Option<InternalPoll>> {
        Ok(self.lock().polls.get(&id.0).cloned())
    }

    async fn question(&self, id: QuestionId) -> Result<Option<InternalQuestion>> {
        Ok(self.lock().questions.get(&id.0).cloned())
    }

    async fn option(&self, id: OptionId) -> Result<Option<InternalOption>> {
        Ok(self.lock().options.get(&id.0).cloned())
    }

    async fn vote(&self, id: VoteId) -> Result<Option<InternalVote>> {
        Ok(self.lock().votes.get(&id.0).cloned())
    }

    async fn votes_for_poll(&self, poll: PollId) -> Result<Vec<InternalVote>> {
        let state = self.lock();
        let mut votes: Vec<_> = state
            .votes
            .values()
            .filter(|vote| vote.poll_id == poll)
            .cloned()
            .collect();
        votes.sort_by_key(|vote| vote.id.0);
        Ok(votes)
    }

    async fn questions_for_poll(&self, poll: PollId) -> Result<Vec<InternalQuestion>> {
        let state = self.lock();
        let mut questions: Vec<_> = state
            .questions
            .values()
            .filter(|question| question.poll_id == poll)
            .cloned()
            .collect();
        questions.sort_by_key(|question| question.id.0);
        Ok(questions)
    }

    async fn options_for_question(&self, question: QuestionId) -> Result<Vec<InternalOption>> {
        let state = self.lock();
        let mut options: Vec<_> = state
            .options
            .values()
            .filter(|option| option.question_id == question)
            .cloned()
            .collect();
        options.sort_by_key(|option| option.id.0);
        Ok(options)
    }

    async fn participants(&self, poll: PollId) -> Result<Vec<UserId>> {
        Ok(self
            .lock()
            .participants
            .iter()
            .filter(|(poll_id, _)| *poll_id == poll.0)
            .map(|(_, user_id)| UserId(*user_id))
            .collect())
    }

    async fn is_participant(&self, poll: PollId, user: UserId) -> Result<bool> {
        Ok(self.lock().participants.contains(&(poll.0, user.0)))
    }
}

struct MemTx {
    inner: Arc<Inner>,
    base_version: u64,
    work: State,
    wrote: bool,
}

#[async_trait]
impl StoreTx for MemTx {
    async fn insert_poll(&mut self, poll: NewPoll) -> Result<PollId> {
        self.wrote = true;
        let id = self.work.alloc();
        self.work.polls.insert(
            id,
            InternalPoll {
                id: PollId(id),
                creator_id: poll.creator_id,
                created_at: poll.created_at,
                closing_date: poll.closing_date,
                last_updated: poll.created_at,
                sequence_number: 0,
                last_event_type: poll.event.event,
                last_event_user: poll.event.user,
                last_event_user_id: poll.event.user_id,
                last_event_title: poll.event.title,
            },
        );
        Ok(PollId(id))
    }

    async fn insert_question(
        &mut self,
        poll: PollId,
        text: &str,
        kind: QuestionKind,
    ) -> Result<QuestionId> {
        self.wrote = true;
        let id = self.work.alloc();
        self.work.questions.insert(
            id,
            InternalQuestion {
                id: QuestionId(id),
                poll_id: poll,
                text: text.to_owned(),
                kind,
            },
        );
        Ok(QuestionId(id))
    }

    async fn insert_option(
        &mut self,
        poll: PollId,
        question: QuestionId,
        title: &str,
        sequence: i64,
    ) -> Result<OptionId> {
        self.wrote = true;
        let id = self.work.alloc();
        self.work.options.insert(
            id,
            InternalOption {
                id: OptionId(id),
                poll_id: poll,
                question_id: question,
                title: title.to_owned(),
                sequence_number: sequence,
            },
        );
        Ok(OptionId(id))
    }

    async fn insert_participant(&mut self, poll: PollId, user: UserId) -> Result<()> {
        self.wrote = true;
        self.work.participants.insert((poll.0, user.0));
        Ok(())
    }

    async fn insert_vote(
        &mut self,
        poll: PollId,
        option: OptionId,
        user: UserId,
    ) -> Result<VoteId> {
        self.wrote = true;
        let id = self.work.alloc();
        self.work.votes.insert(
            id,
            InternalVote {
                id: VoteId(id),
                poll_id: poll,
                option_id: option,
                user_id: user,
            },
        );
        Ok(VoteId(id))
    }

    async fn bump_poll(
        &mut self,
        poll: PollId,
        event: &LastEvent,
        now: DateTime<Utc>,
    ) -> Result<i64> {
        self.wrote = true;
        let row = self
            .work
            .polls
            .get_mut(&poll.0)
            .ok_or(ValidationError::PollNotFound(poll))?;
        row.sequence_number += 1;
        row.last_updated = now;
        row.last_event_type = event.event;
        row.last_event_user = event.user.clone();
        row.last_event_user_id = event.user_id;
        row.last_event_title = event.title.clone();
        Ok(row.sequence_number)
    }

    async fn touch_option(&mut self, option: OptionId, sequence: i64) -> Result<u64> {
        self.wrote = true;
        match self.work.options.get_mut(&option.0) {
            Some(row) => {
                row.sequence_number = sequence;
                Ok(1)
            }
            None => Ok(0),
        }
    }

    async fn delete_vote(&mut self, vote: VoteId, user: UserId) -> Result<u64> {
        self.wrote = true;
        let matches = self
            .work
            .votes
            .get(&vote.0)
            .map(|row| row.user_id == user)
            .unwrap_or(false);
        if matches {
            self.work.votes.remove(&vote.0);
            Ok(1)
        } else {
            Ok(0)
        }
    }

    async fn delete_vote_for_user(&mut self, poll: PollId, user: UserId) -> Result<u64> {
        self.wrote = true;
        let before = self.work.votes.len();
        self.work
            .votes
            .retain(|_, row| !(row.poll_id == poll && row.user_id == user));
        Ok((before - self.work.votes.len()) as u64)
    }

    async fn delete_participant(&mut self, poll: PollId, user: UserId) -> Result<u64> {
        self.wrote = true;
        if self.work.participants.remove(&(poll.0, user.0)) {
            Ok(1)
        } else {
            Ok(0)
        }
    }

    async fn is_participant(&mut self, poll: PollId, user: UserId) -> Result<bool> {
        Ok(self.work.participants.contains(&(poll.0, user.0)))
    }

    async fn snapshot(&mut self, poll: PollId) -> Result<PollSnapshot> {
        self.work
            .polls
            .get(&poll.0)
            .map(|row| row.snapshot())
            .ok_or_else(|| ValidationError::PollNotFound(poll).into())
    }

    async fn commit(mut self: Box<Self>) -> Result<()> {
        let mut state = self.inner.state.lock().unwrap();
        if self.wrote {
            let mut injected = self.inner.injected_conflicts.lock().unwrap();
            if *injected > 0 {
                *injected -= 1;
                return Err(Error::Conflict);
            }
            drop(injected);
            if state.version != self.base_version {
                return Err(Error::Conflict);
            }
            self.work.version = self.base_version + 1;
            *state = std::mem::take(&mut self.work);
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}
