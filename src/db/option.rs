use super::{poll::PollId, question::QuestionId};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Hash, PartialEq, Eq, Debug, Deserialize, Serialize, sqlx::Type)]
#[sqlx(transparent)]
pub struct OptionId(pub i64);

/// `sequence_number` is the poll's sequence value at the moment the option
/// was introduced or last upvoted, so clients can diff against their last
/// synced snapshot without a change log.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct InternalOption {
    pub id: OptionId,
    pub poll_id: PollId,
    pub question_id: QuestionId,
    pub title: String,
    pub sequence_number: i64,
}
