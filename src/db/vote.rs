use super::{option::OptionId, poll::PollId, user::UserId};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Hash, PartialEq, Eq, Debug, Deserialize, Serialize, sqlx::Type)]
#[sqlx(transparent)]
pub struct VoteId(pub i64);

/// At most one row exists per (poll, user) at any time; a replacement vote
/// deletes the old row in the same transaction that inserts the new one.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct InternalVote {
    pub id: VoteId,
    pub poll_id: PollId,
    pub option_id: OptionId,
    pub user_id: UserId,
}
