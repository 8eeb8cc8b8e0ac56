use crate::coordinator::RetryPolicy;
use crate::error::{Error, Result};
use crate::notify::{EnqueuePolicy, DEFAULT_QUEUE_CAPACITY};
use std::env;
use std::time::Duration;

/// Process configuration, read from the environment (with `.env` support as
/// in the rest of the deployment).
#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub max_connections: u32,
    pub queue_capacity: usize,
    pub enqueue_policy: EnqueuePolicy,
    pub retry: RetryPolicy,
    pub close_retries: u32,
    pub close_backoff: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        let database_url = env::var("DATABASE_URL")
            .map_err(|_| Error::Config("DATABASE_URL must be set".to_owned()))?;
        let retry = RetryPolicy {
            // 0 disables the attempt cap
            max_attempts: match parse_env("POLLBOX_TX_MAX_ATTEMPTS", 32)? {
                0 => None,
                n => Some(n),
            },
            backoff: Duration::from_millis(parse_env("POLLBOX_TX_BACKOFF_MS", 5)?),
        };
        Ok(Self {
            database_url,
            max_connections: parse_env("POLLBOX_MAX_CONNECTIONS", 5)?,
            queue_capacity: parse_env("POLLBOX_QUEUE_CAPACITY", DEFAULT_QUEUE_CAPACITY as u64)?
                as usize,
            enqueue_policy: match env::var("POLLBOX_ENQUEUE_POLICY").as_deref() {
                Ok("drop") => EnqueuePolicy::Drop,
                Ok("block") | Err(_) => EnqueuePolicy::Block,
                Ok(other) => {
                    return Err(Error::Config(format!(
                        "unknown enqueue policy {other:?}, expected \"block\" or \"drop\""
                    )))
                }
            },
            retry,
            close_retries: parse_env("POLLBOX_CLOSE_RETRIES", 3)?,
            close_backoff: Duration::from_millis(parse_env("POLLBOX_CLOSE_BACKOFF_MS", 1_000)?),
        })
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, default: T) -> Result<T> {
    match env::var(name) {
        Ok(value) => value
            .parse()
            .map_err(|_| Error::Config(format!("{name} has an invalid value {value:?}"))),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_env_prefers_set_values() {
        env::set_var("POLLBOX_TEST_PARSE", "17");
        assert_eq!(parse_env("POLLBOX_TEST_PARSE", 5u32).unwrap(), 17);
        env::remove_var("POLLBOX_TEST_PARSE");
        assert_eq!(parse_env("POLLBOX_TEST_PARSE", 5u32).unwrap(), 5);
    }

    #[test]
    fn parse_env_rejects_garbage() {
        env::set_var("POLLBOX_TEST_GARBAGE", "not-a-number");
        assert!(parse_env("POLLBOX_TEST_GARBAGE", 5u32).is_err());
        env::remove_var("POLLBOX_TEST_GARBAGE");
    }
}
