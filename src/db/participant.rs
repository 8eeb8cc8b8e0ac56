use super::{poll::PollId, user::UserId};

/// Unique per (poll, user). The creator is always inserted with the poll;
/// removing the last participant does not delete the poll.
#[derive(Clone, Debug, PartialEq, Eq, sqlx::FromRow)]
pub struct InternalParticipant {
    pub poll_id: PollId,
    pub user_id: UserId,
}
