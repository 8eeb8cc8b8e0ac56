use super::poll::PollId;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Hash, PartialEq, Eq, Debug, Deserialize, Serialize, sqlx::Type)]
#[sqlx(transparent)]
pub struct QuestionId(pub i64);

/// Fixed at poll creation; only `Open` questions accept write-in options.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Deserialize, Serialize, sqlx::Type)]
#[repr(i32)]
#[serde(rename_all = "snake_case")]
pub enum QuestionKind {
    Closed = 0,
    Open = 1,
}

#[derive(Clone, Debug, sqlx::FromRow)]
pub struct InternalQuestion {
    pub id: QuestionId,
    pub poll_id: PollId,
    pub text: String,
    pub kind: QuestionKind,
}
