use super::user::UserId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Hash, PartialEq, Eq, Debug, Deserialize, Serialize, sqlx::Type)]
#[sqlx(transparent)]
pub struct PollId(pub i64);

/// Integer event codes carried in `last_event_type` and in push payloads.
#[derive(Clone, Copy, PartialEq, Eq, Debug, sqlx::Type)]
#[repr(i32)]
pub enum EventType {
    Created = 0,
    Vote = 1,
    VoteUndone = 2,
    ParticipantLeft = 3,
    ParticipantAdded = 4,
    Closed = 5,
}

impl EventType {
    pub fn code(self) -> i32 {
        self as i32
    }
}

#[derive(Clone, Debug, sqlx::FromRow)]
pub struct InternalPoll {
    pub id: PollId,
    pub creator_id: UserId,
    pub created_at: DateTime<Utc>,
    pub closing_date: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub sequence_number: i64,
    pub last_event_type: EventType,
    pub last_event_user: String,
    pub last_event_user_id: UserId,
    pub last_event_title: String,
}

impl InternalPoll {
    pub fn is_open(&self, now: DateTime<Utc>) -> bool {
        now <= self.closing_date
    }

    pub fn snapshot(&self) -> PollSnapshot {
        PollSnapshot {
            id: self.id,
            closing_date: self.closing_date,
            last_updated: self.last_updated,
            sequence_number: self.sequence_number,
        }
    }
}

/// Denormalized description of the most recent accepted mutation, overwritten
/// on every sequence bump.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LastEvent {
    pub event: EventType,
    pub user: String,
    pub user_id: UserId,
    pub title: String,
}

/// Minimal consistent view of a poll, derived per request and pushed in
/// notifications so clients can detect staleness. Time fields serialize as
/// epoch milliseconds.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollSnapshot {
    pub id: PollId,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub closing_date: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub last_updated: DateTime<Utc>,
    pub sequence_number: i64,
}
