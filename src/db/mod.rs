pub mod option;
pub mod participant;
pub mod poll;
pub mod question;
pub mod user;
pub mod vote;

pub use option::{InternalOption, OptionId};
pub use participant::InternalParticipant;
pub use poll::{EventType, InternalPoll, LastEvent, PollId, PollSnapshot};
pub use question::{InternalQuestion, QuestionId, QuestionKind};
pub use user::UserId;
pub use vote::{InternalVote, VoteId};

use sqlx::{
    migrate::Migrator,
    postgres::{PgConnectOptions, PgPoolOptions},
    PgPool,
};

pub static MIGRATOR: Migrator = sqlx::migrate!();

pub async fn new_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    new_pool_with(database_url.parse()?, 5).await
}

pub async fn new_pool_with(
    connect_options: PgConnectOptions,
    max_connections: u32,
) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect_with(connect_options)
        .await
}
