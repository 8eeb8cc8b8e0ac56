//! Storage gateway: parameterized statements and serializable transactions
//! against the relational store. Implementations classify the store's
//! serialization-failure condition as [`Error::Conflict`] so the transaction
//! coordinator can retry the whole unit of work.

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgPollStore;

use crate::db::{
    InternalOption, InternalPoll, InternalQuestion, InternalVote, LastEvent, OptionId, PollId,
    PollSnapshot, QuestionId, QuestionKind, UserId, VoteId,
};
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Row values for a new poll; sequence number starts at 0.
#[derive(Clone, Debug)]
pub struct NewPoll {
    pub creator_id: UserId,
    pub created_at: DateTime<Utc>,
    pub closing_date: DateTime<Utc>,
    pub event: LastEvent,
}

/// Standalone reads plus transaction entry. The read methods execute outside
/// any transaction and back the pre-transaction validation pass; everything
/// that mutates lives on [`StoreTx`].
#[async_trait]
pub trait PollStore: Send + Sync {
    async fn begin_serializable(&self) -> Result<Box<dyn StoreTx>>;

    async fn poll(&self, id: PollId) -> Result<Option<InternalPoll>>;
    async fn question(&self, id: QuestionId) -> Result<Option<InternalQuestion>>;
    async fn option(&self, id: OptionId) -> Result<Option<InternalOption>>;
    async fn vote(&self, id: VoteId) -> Result<Option<InternalVote>>;
    async fn votes_for_poll(&self, poll: PollId) -> Result<Vec<InternalVote>>;
    async fn questions_for_poll(&self, poll: PollId) -> Result<Vec<InternalQuestion>>;
    async fn options_for_question(&self, question: QuestionId) -> Result<Vec<InternalOption>>;
    async fn participants(&self, poll: PollId) -> Result<Vec<UserId>>;
    async fn is_participant(&self, poll: PollId, user: UserId) -> Result<bool>;
}

/// One open serializable transaction. Deletes report the affected row count
/// so callers can distinguish "gone since validation" from success.
#[async_trait]
pub trait StoreTx: Send {
    async fn insert_poll(&mut self, poll: NewPoll) -> Result<PollId>;
    async fn insert_question(
        &mut self,
        poll: PollId,
        text: &str,
        kind: QuestionKind,
    ) -> Result<QuestionId>;
    async fn insert_option(
        &mut self,
        poll: PollId,
        question: QuestionId,
        title: &str,
        sequence: i64,
    ) -> Result<OptionId>;
    async fn insert_participant(&mut self, poll: PollId, user: UserId) -> Result<()>;
    async fn insert_vote(&mut self, poll: PollId, option: OptionId, user: UserId)
        -> Result<VoteId>;

    /// Increments the poll's sequence number by exactly 1, overwrites the
    /// last-event fields and `last_updated`, and returns the new sequence.
    async fn bump_poll(
        &mut self,
        poll: PollId,
        event: &LastEvent,
        now: DateTime<Utc>,
    ) -> Result<i64>;

    /// Re-tags an option with the poll's current sequence number.
    async fn touch_option(&mut self, option: OptionId, sequence: i64) -> Result<u64>;

    /// Deletes a vote matched by both id and owner.
    async fn delete_vote(&mut self, vote: VoteId, user: UserId) -> Result<u64>;
    async fn delete_vote_for_user(&mut self, poll: PollId, user: UserId) -> Result<u64>;
    async fn delete_participant(&mut self, poll: PollId, user: UserId) -> Result<u64>;

    async fn is_participant(&mut self, poll: PollId, user: UserId) -> Result<bool>;

    /// Snapshot read from inside this transaction, immediately after the
    /// mutating statements, so the sequence number is exactly the one just
    /// written.
    async fn snapshot(&mut self, poll: PollId) -> Result<PollSnapshot>;

    async fn commit(self: Box<Self>) -> Result<()>;
    async fn rollback(self: Box<Self>) -> Result<()>;
}
