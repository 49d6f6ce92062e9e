//! Redis Manager - Queue intake and result publishing over Redis
//!
//! This module handles:
//! - Job intake (BLPOP on the queue list)
//! - Result storage with expiry and pub/sub notification
//!
//! Each job on the queue carries a caller chosen `request_id`; results
//! (including rejections) are stored under that id.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::SubmitError;
use crate::reporter::ExecutionResult;
use crate::scheduler::{Scheduler, SubmitRequest};

/// Redis key constants
pub mod keys {
    /// Job queue key
    pub const JOB_QUEUE: &str = "codebox:queue";

    /// Result key prefix (for polling)
    pub const RESULT_PREFIX: &str = "codebox:result:";

    /// Result channel (for pub/sub)
    pub const RESULT_CHANNEL: &str = "codebox:results";

    pub fn result_key(request_id: &str) -> String {
        format!("{}{}", RESULT_PREFIX, request_id)
    }
}

const RESULT_EXPIRY_SECS: u64 = 3600; // 1 hour

/// A job as it arrives on the queue
#[derive(Debug, Clone, Deserialize)]
pub struct QueuedJob {
    pub request_id: String,
    #[serde(flatten)]
    pub request: SubmitRequest,
}

/// Result of a job that ran, keyed by the caller's request id
#[derive(Debug, Serialize)]
pub struct FinishedRecord<'a> {
    pub request_id: &'a str,
    #[serde(flatten)]
    pub result: &'a ExecutionResult,
}

/// A job the scheduler refused to accept
#[derive(Debug, Serialize)]
pub struct RejectedRecord<'a> {
    pub request_id: &'a str,
    pub outcome: &'static str,
    pub error: &'static str,
    pub message: String,
}

/// What gets stored and published for a queued job
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum StoredResult<'a> {
    Finished(FinishedRecord<'a>),
    Rejected(RejectedRecord<'a>),
}

impl<'a> StoredResult<'a> {
    pub fn finished(request_id: &'a str, result: &'a ExecutionResult) -> Self {
        StoredResult::Finished(FinishedRecord { request_id, result })
    }

    pub fn rejected(request_id: &'a str, err: &SubmitError) -> Self {
        StoredResult::Rejected(RejectedRecord {
            request_id,
            outcome: "rejected",
            error: err.code(),
            message: err.to_string(),
        })
    }

    pub fn request_id(&self) -> &str {
        match self {
            StoredResult::Finished(record) => record.request_id,
            StoredResult::Rejected(record) => record.request_id,
        }
    }
}

/// Redis connection with reconnect-on-failure
#[derive(Clone)]
pub struct RedisManager {
    client: redis::Client,
    conn: MultiplexedConnection,
}

impl RedisManager {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url).context("Failed to create Redis client")?;
        let conn = get_connection_with_retry(&client).await?;
        info!("Connected to Redis at {}", redis_url);
        Ok(Self { client, conn })
    }

    /// Block and wait for the next job from the queue.
    ///
    /// Malformed entries are logged and skipped. Automatically reconnects
    /// on connection failure.
    pub async fn pop_job(&mut self) -> Result<QueuedJob> {
        loop {
            let result: Option<(String, String)> = match self.conn.blpop(keys::JOB_QUEUE, 0.0).await {
                Ok(res) => res,
                Err(e) => {
                    warn!("Redis BLPOP failed: {}. Reconnecting...", e);
                    self.reconnect().await?;
                    continue;
                }
            };

            if let Some((_, job_data)) = result {
                match serde_json::from_str::<QueuedJob>(&job_data) {
                    Ok(job) => return Ok(job),
                    Err(e) => {
                        warn!("Failed to parse job data: {}. Data: {}", e, job_data);
                        continue;
                    }
                }
            }
        }
    }

    /// Store a result with a 1-hour expiration and publish it to the
    /// results channel for real-time subscribers.
    pub async fn store_result(&mut self, stored: &StoredResult<'_>) -> Result<()> {
        let key = keys::result_key(stored.request_id());
        let json = serde_json::to_string(stored)?;

        if let Err(e) = self
            .conn
            .set_ex::<_, _, ()>(&key, &json, RESULT_EXPIRY_SECS)
            .await
        {
            warn!("Failed to store result: {}. Reconnecting...", e);
            self.reconnect().await?;
            self.conn
                .set_ex::<_, _, ()>(&key, &json, RESULT_EXPIRY_SECS)
                .await?;
        }

        // Publish to channel (ignore errors as there may be no subscribers)
        let _ = self.conn.publish::<_, _, ()>(keys::RESULT_CHANNEL, &json).await;

        Ok(())
    }

    async fn reconnect(&mut self) -> Result<()> {
        self.conn = get_connection_with_retry(&self.client).await?;
        Ok(())
    }
}

/// Get a Redis connection with retry logic
async fn get_connection_with_retry(client: &redis::Client) -> Result<MultiplexedConnection> {
    loop {
        match client.get_multiplexed_async_connection().await {
            Ok(conn) => return Ok(conn),
            Err(e) => {
                warn!("Failed to connect to Redis: {}. Retrying in 3 seconds...", e);
                tokio::time::sleep(Duration::from_secs(3)).await;
            }
        }
    }
}

/// Pull jobs off the Redis queue into the scheduler until `shutdown` fires.
///
/// BLPOP holds its connection, so results go out over a second one.
pub async fn run_intake(redis_url: &str, scheduler: Arc<Scheduler>, shutdown: CancellationToken) -> Result<()> {
    // Connecting retries forever while Redis is down
    let connected = tokio::select! {
        connected = async {
            let intake = RedisManager::connect(redis_url).await?;
            let publisher = RedisManager::connect(redis_url).await?;
            anyhow::Ok((intake, publisher))
        } => connected?,
        _ = shutdown.cancelled() => {
            info!("Redis intake stopped before connecting");
            return Ok(());
        }
    };
    let (mut intake, mut publisher) = connected;
    info!("Listening for jobs on {}", keys::JOB_QUEUE);

    loop {
        let job = tokio::select! {
            job = intake.pop_job() => job?,
            _ = shutdown.cancelled() => break,
        };
        let QueuedJob { request_id, request } = job;

        match scheduler.submit(request) {
            Ok(job_id) => {
                debug!("Queued Redis job {} as {}", request_id, job_id);
                let scheduler = scheduler.clone();
                let mut publisher = publisher.clone();
                tokio::spawn(async move {
                    let Some(result) = scheduler.wait(job_id).await else {
                        warn!("Result of job {} vanished before it was published", job_id);
                        return;
                    };
                    let stored = StoredResult::finished(&request_id, &result);
                    if let Err(e) = publisher.store_result(&stored).await {
                        warn!("Failed to publish result of {}: {:#}", request_id, e);
                    }
                });
            }
            Err(e) => {
                info!("Rejected Redis job {}: {}", request_id, e);
                let stored = StoredResult::rejected(&request_id, &e);
                if let Err(err) = publisher.store_result(&stored).await {
                    warn!("Failed to publish rejection of {}: {:#}", request_id, err);
                }
            }
        }
    }

    info!("Redis intake stopped");
    Ok(())
}
