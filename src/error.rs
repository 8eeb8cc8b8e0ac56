use crate::db::{OptionId, PollId, QuestionId, UserId, VoteId};
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Crate-wide error taxonomy. `Conflict` is the one variant the transaction
/// coordinator recovers from; everything else propagates to the caller.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The store detected a serialization failure, either mid-transaction or
    /// at commit. Recovered by re-running the whole unit of work.
    #[error("serialization conflict")]
    Conflict,

    #[error("store error: {0}")]
    Store(#[source] sqlx::Error),

    #[error("failed to register closing job: {0}")]
    Scheduler(String),

    #[error("notification fan-out failed: {0}")]
    Notify(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict)
    }
}

/// Rejections detected before any transaction begins. Never retried.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("poll {0:?} not found")]
    PollNotFound(PollId),

    #[error("poll {0:?} is already closed")]
    PollClosed(PollId),

    #[error("question {0:?} not found")]
    QuestionNotFound(QuestionId),

    #[error("question {0:?} does not accept write-in options")]
    NotWriteIn(QuestionId),

    #[error("option {0:?} not found")]
    OptionNotFound(OptionId),

    #[error("vote {0:?} not found")]
    VoteNotFound(VoteId),

    #[error("option text must not be empty")]
    EmptyOptionText,

    #[error("user {user:?} is already a participant of poll {poll:?}")]
    DuplicateParticipant { poll: PollId, user: UserId },

    #[error("user {user:?} is not a participant of poll {poll:?}")]
    NotParticipant { poll: PollId, user: UserId },

    #[error("user {user:?} is not the creator of poll {poll:?}")]
    NotCreator { poll: PollId, user: UserId },

    #[error("closing date of a new poll must be in the future")]
    ClosingDateInPast,
}
