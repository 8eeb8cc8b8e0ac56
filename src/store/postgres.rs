//! Postgres-backed gateway. All statements are runtime-bound; SQLSTATE 40001
//! (serialization_failure) and 40P01 (deadlock_detected) map to
//! [`Error::Conflict`].

use super::{NewPoll, PollStore, StoreTx};
use crate::db::{
    InternalOption, InternalPoll, InternalQuestion, InternalVote, LastEvent, OptionId, PollId,
    PollSnapshot, QuestionId, QuestionKind, UserId, VoteId,
};
use crate::error::{Error, Result, ValidationError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};

const POLL_COLUMNS: &str = "id, creator_id, created_at, closing_date, last_updated, \
     sequence_number, last_event_type, last_event_user, last_event_user_id, last_event_title";

#[derive(Debug, Clone)]
pub struct PgPollStore {
    pool: PgPool,
}

impl PgPollStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn map_err(err: sqlx::Error) -> Error {
    if let sqlx::Error::Database(db_err) = &err {
        if matches!(db_err.code().as_deref(), Some("40001") | Some("40P01")) {
            return Error::Conflict;
        }
    }
    Error::Store(err)
}

#[async_trait]
impl PollStore for PgPollStore {
    async fn begin_serializable(&self) -> Result<Box<dyn StoreTx>> {
        let mut tx = self.pool.begin().await.map_err(map_err)?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *tx)
            .await
            .map_err(map_err)?;
        Ok(Box::new(PgTx { tx }))
    }

    async fn poll(&self, id: PollId) -> Result<Option<InternalPoll>> {
        sqlx::query_as::<_, InternalPoll>(&format!(
            "SELECT {POLL_COLUMNS} FROM polls WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_err)
    }

    async fn question(&self, id: QuestionId) -> Result<Option<InternalQuestion>> {
        sqlx::query_as::<_, InternalQuestion>(
            "SELECT id, poll_id, text, kind FROM questions WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_err)
    }

    async fn option(&self, id: OptionId) -> Result<Option<InternalOption>> {
        sqlx::query_as::<_, InternalOption>(
            "SELECT id, poll_id, question_id, title, sequence_number FROM options WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_err)
    }

    async fn vote(&self, id: VoteId) -> Result<Option<InternalVote>> {
        sqlx::query_as::<_, InternalVote>(
            "SELECT id, poll_id, option_id, user_id FROM votes WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_err)
    }

    async fn votes_for_poll(&self, poll: PollId) -> Result<Vec<InternalVote>> {
        sqlx::query_as::<_, InternalVote>(
            "SELECT id, poll_id, option_id, user_id FROM votes WHERE poll_id = $1 ORDER BY id",
        )
        .bind(poll)
        .fetch_all(&self.pool)
        .await
        .map_err(map_err)
    }

    async fn questions_for_poll(&self, poll: PollId) -> Result<Vec<InternalQuestion>> {
        sqlx::query_as::<_, InternalQuestion>(
            "SELECT id, poll_id, text, kind FROM questions WHERE poll_id = $1 ORDER BY id",
        )
        .bind(poll)
        .fetch_all(&self.pool)
        .await
        .map_err(map_err)
    }

    async fn options_for_question(&self, question: QuestionId) -> Result<Vec<InternalOption>> {
        sqlx::query_as::<_, InternalOption>(
            "SELECT id, poll_id, question_id, title, sequence_number \
             FROM options WHERE question_id = $1 ORDER BY id",
        )
        .bind(question)
        .fetch_all(&self.pool)
        .await
        .map_err(map_err)
    }

    async fn participants(&self, poll: PollId) -> Result<Vec<UserId>> {
        let ids: Vec<i64> =
            sqlx::query_scalar("SELECT user_id FROM participants WHERE poll_id = $1 ORDER BY id")
                .bind(poll)
                .fetch_all(&self.pool)
                .await
                .map_err(map_err)?;
        Ok(ids.into_iter().map(UserId).collect())
    }

    async fn is_participant(&self, poll: PollId, user: UserId) -> Result<bool> {
        sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM participants WHERE poll_id = $1 AND user_id = $2)",
        )
        .bind(poll)
        .bind(user)
        .fetch_one(&self.pool)
        .await
        .map_err(map_err)
    }
}

struct PgTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl StoreTx for PgTx {
    async fn insert_poll(&mut self, poll: NewPoll) -> Result<PollId> {
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO polls (creator_id, created_at, closing_date, last_updated, \
             sequence_number, last_event_type, last_event_user, last_event_user_id, last_event_title) \
             VALUES ($1, $2, $3, $2, 0, $4, $5, $6, $7) RETURNING id",
        )
        .bind(poll.creator_id)
        .bind(poll.created_at)
        .bind(poll.closing_date)
        .bind(poll.event.event.code())
        .bind(&poll.event.user)
        .bind(poll.event.user_id)
        .bind(&poll.event.title)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(map_err)?;
        Ok(PollId(id))
    }

    async fn insert_question(
        &mut self,
        poll: PollId,
        text: &str,
        kind: QuestionKind,
    ) -> Result<QuestionId> {
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO questions (poll_id, text, kind) VALUES ($1, $2, $3) RETURNING id",
        )
        .bind(poll)
        .bind(text)
        .bind(kind)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(map_err)?;
        Ok(QuestionId(id))
    }

    async fn insert_option(
        &mut self,
        poll: PollId,
        question: QuestionId,
        title: &str,
        sequence: i64,
    ) -> Result<OptionId> {
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO options (poll_id, question_id, title, sequence_number) \
             VALUES ($1, $2, $3, $4) RETURNING id",
        )
        .bind(poll)
        .bind(question)
        .bind(title)
        .bind(sequence)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(map_err)?;
        Ok(OptionId(id))
    }

    async fn insert_participant(&mut self, poll: PollId, user: UserId) -> Result<()> {
        sqlx::query("INSERT INTO participants (poll_id, user_id) VALUES ($1, $2)")
            .bind(poll)
            .bind(user)
            .execute(&mut *self.tx)
            .await
            .map_err(map_err)?;
        Ok(())
    }

    async fn insert_vote(
        &mut self,
        poll: PollId,
        option: OptionId,
        user: UserId,
    ) -> Result<VoteId> {
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO votes (poll_id, option_id, user_id) VALUES ($1, $2, $3) RETURNING id",
        )
        .bind(poll)
        .bind(option)
        .bind(user)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(map_err)?;
        Ok(VoteId(id))
    }

    async fn bump_poll(
        &mut self,
        poll: PollId,
        event: &LastEvent,
        now: DateTime<Utc>,
    ) -> Result<i64> {
        let sequence: Option<i64> = sqlx::query_scalar(
            "UPDATE polls SET sequence_number = sequence_number + 1, last_updated = $2, \
             last_event_type = $3, last_event_user = $4, last_event_user_id = $5, \
             last_event_title = $6 WHERE id = $1 RETURNING sequence_number",
        )
        .bind(poll)
        .bind(now)
        .bind(event.event.code())
        .bind(&event.user)
        .bind(event.user_id)
        .bind(&event.title)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(map_err)?;
        sequence.ok_or_else(|| ValidationError::PollNotFound(poll).into())
    }

    async fn touch_option(&mut self, option: OptionId, sequence: i64) -> Result<u64> {
        let result = sqlx::query("UPDATE options SET sequence_number = $2 WHERE id = $1")
            .bind(option)
            .bind(sequence)
            .execute(&mut *self.tx)
            .await
            .map_err(map_err)?;
        Ok(result.rows_affected())
    }

    async fn delete_vote(&mut self, vote: VoteId, user: UserId) -> Result<u64> {
        let result = sqlx::query("DELETE FROM votes WHERE id = $1 AND user_id = $2")
            .bind(vote)
            .bind(user)
            .execute(&mut *self.tx)
            .await
            .map_err(map_err)?;
        Ok(result.rows_affected())
    }

    async fn delete_vote_for_user(&mut self, poll: PollId, user: UserId) -> Result<u64> {
        let result = sqlx::query("DELETE FROM votes WHERE poll_id = $1 AND user_id = $2")
            .bind(poll)
            .bind(user)
            .execute(&mut *self.tx)
            .await
            .map_err(map_err)?;
        Ok(result.rows_affected())
    }

    async fn delete_participant(&mut self, poll: PollId, user: UserId) -> Result<u64> {
        let result = sqlx::query("DELETE FROM participants WHERE poll_id = $1 AND user_id = $2")
            .bind(poll)
            .bind(user)
            .execute(&mut *self.tx)
            .await
            .map_err(map_err)?;
        Ok(result.rows_affected())
    }

    async fn is_participant(&mut self, poll: PollId, user: UserId) -> Result<bool> {
        sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM participants WHERE poll_id = $1 AND user_id = $2)",
        )
        .bind(poll)
        .bind(user)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(map_err)
    }

    async fn snapshot(&mut self, poll: PollId) -> Result<PollSnapshot> {
        let row = sqlx::query_as::<_, InternalPoll>(&format!(
            "SELECT {POLL_COLUMNS} FROM polls WHERE id = $1"
        ))
        .bind(poll)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(map_err)?;
        row.map(|poll| poll.snapshot())
            .ok_or_else(|| ValidationError::PollNotFound(poll).into())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await.map_err(map_err)
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.tx.rollback().await.map_err(map_err)
    }
}
