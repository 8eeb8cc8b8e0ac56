//! Round-trip of the Postgres gateway against a real database. These tests
//! need a running Postgres and DATABASE_URL, so they are ignored by default:
//!
//!     cargo test -- --ignored

use chrono::{Duration as ChronoDuration, Utc};
use pollbox::db::{self, EventType, LastEvent, QuestionKind, UserId};
use pollbox::store::{NewPoll, PgPollStore, PollStore, StoreTx};
use sqlx::postgres::PgConnectOptions;
use uuid::Uuid;

async fn test_store() -> PgPollStore {
    dotenvy::dotenv().ok();
    let template_options: PgConnectOptions = std::env::var("DATABASE_URL")
        .expect("DATABASE_URL must be set")
        .parse()
        .unwrap();

    // fresh database per test run, migrated from scratch
    let db_name = format!("pollbox_test_{}", Uuid::new_v4().simple());
    let template_pool = db::new_pool_with(template_options.clone(), 1).await.unwrap();
    sqlx::query(&format!("CREATE DATABASE {db_name}"))
        .execute(&template_pool)
        .await
        .unwrap();

    let pool = db::new_pool_with(template_options.database(&db_name), 5)
        .await
        .unwrap();
    db::MIGRATOR.run(&pool).await.unwrap();
    PgPollStore::new(pool)
}

#[tokio::test]
#[ignore = "requires a running Postgres and DATABASE_URL"]
async fn poll_round_trip_with_sequence_bumps() {
    let store = test_store().await;
    let now = Utc::now();

    let mut tx = store.begin_serializable().await.unwrap();
    let poll_id = tx
        .insert_poll(NewPoll {
            creator_id: UserId(1),
            created_at: now,
            closing_date: now + ChronoDuration::hours(1),
            event: LastEvent {
                event: EventType::Created,
                user: "alice".to_owned(),
                user_id: UserId(1),
                title: "lunch".to_owned(),
            },
        })
        .await
        .unwrap();
    let question_id = tx
        .insert_question(poll_id, "where to?", QuestionKind::Open)
        .await
        .unwrap();
    let option_id = tx.insert_option(poll_id, question_id, "pizza", 0).await.unwrap();
    tx.insert_participant(poll_id, UserId(1)).await.unwrap();
    tx.commit().await.unwrap();

    let poll = store.poll(poll_id).await.unwrap().unwrap();
    assert_eq!(poll.sequence_number, 0);
    assert_eq!(poll.creator_id, UserId(1));
    assert_eq!(poll.last_event_type, EventType::Created);
    assert!(store.is_participant(poll_id, UserId(1)).await.unwrap());

    // one mutation transaction: bump, touch, replace vote, snapshot
    let mut tx = store.begin_serializable().await.unwrap();
    let sequence = tx
        .bump_poll(
            poll_id,
            &LastEvent {
                event: EventType::Vote,
                user: "alice".to_owned(),
                user_id: UserId(1),
                title: "pizza".to_owned(),
            },
            Utc::now(),
        )
        .await
        .unwrap();
    assert_eq!(sequence, 1);
    assert_eq!(tx.touch_option(option_id, sequence).await.unwrap(), 1);
    let snapshot = tx.snapshot(poll_id).await.unwrap();
    assert_eq!(snapshot.sequence_number, 1);
    assert_eq!(tx.delete_vote_for_user(poll_id, UserId(1)).await.unwrap(), 0);
    let vote_id = tx.insert_vote(poll_id, option_id, UserId(1)).await.unwrap();
    tx.commit().await.unwrap();

    let votes = store.votes_for_poll(poll_id).await.unwrap();
    assert_eq!(votes.len(), 1);
    assert_eq!(votes[0].id, vote_id);
    assert_eq!(
        store.option(option_id).await.unwrap().unwrap().sequence_number,
        1
    );

    // delete by (id, owner) must not match someone else's vote
    let mut tx = store.begin_serializable().await.unwrap();
    assert_eq!(tx.delete_vote(vote_id, UserId(2)).await.unwrap(), 0);
    assert_eq!(tx.delete_vote(vote_id, UserId(1)).await.unwrap(), 1);
    tx.rollback().await.unwrap();
    assert_eq!(store.votes_for_poll(poll_id).await.unwrap().len(), 1);
}
