//! Backend core for shared, time-boxed polls. A mutation (vote, undo,
//! add/remove participant) runs inside a serializable transaction that bumps
//! the poll's sequence number by exactly one, retried as a whole on
//! serialization conflicts; committed mutations fan out push notifications
//! through a bounded queue without ever blocking on delivery, and each poll
//! registers a one-shot job that closes it at its closing date.

pub mod config;
pub mod coordinator;
pub mod db;
pub mod engine;
pub mod error;
pub mod log;
pub mod notify;
pub mod scheduler;
pub mod store;

pub use error::{Error, Result};
