//! Chat moderation against an external text filter.
//!
//! The actor prepares a [`ChatJob`] synchronously, the network layer runs
//! [`moderate`] on a spawned task, and the [`ChatOutcome`] is fed back to the
//! actor, which re-checks that the session is still live before acting on it.

use serde::Deserialize;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

use crate::client_manager::SessionHandle;

pub const DEFAULT_FILTER_URL: &str = "http://www.purgomalum.com/service/json";

#[derive(Debug, Error)]
pub enum ModerationError {
    #[error("moderation request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("moderation service answered {0}")]
    Status(reqwest::StatusCode),
    #[error("moderation response had no result")]
    MissingResult,
}

/// External text filter returning a cleaned copy of its input.
pub trait TextFilter: Send + Sync + 'static {
    fn filter(&self, text: &str) -> impl Future<Output = Result<String, ModerationError>> + Send;
}

/// PurgoMalum style service: `GET {url}?text=...` answering `{"result": "..."}`.
pub struct PurgoMalum {
    client: reqwest::Client,
    url: String,
}

#[derive(Debug, Deserialize)]
struct FilterResponse {
    result: Option<String>,
}

impl PurgoMalum {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, ModerationError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

impl TextFilter for PurgoMalum {
    async fn filter(&self, text: &str) -> Result<String, ModerationError> {
        let response = self
            .client
            .get(&self.url)
            .query(&[("text", text)])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ModerationError::Status(response.status()));
        }

        let body: FilterResponse = response.json().await?;
        body.result.ok_or(ModerationError::MissingResult)
    }
}

/// A sanitized chat message waiting for the external filter.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatJob {
    pub handle: SessionHandle,
    pub message: String,
    /// Display name at the time the message was accepted
    pub player_name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FilteredChat {
    pub message: String,
    pub player_name: String,
}

/// Result of a moderation round trip.
#[derive(Debug)]
pub struct ChatOutcome {
    pub job: ChatJob,
    pub result: Result<FilteredChat, ModerationError>,
}

/// Runs both the message and the sender's name through `filter`. No retries.
pub async fn moderate<F: TextFilter>(filter: &F, job: ChatJob) -> ChatOutcome {
    let result = async {
        let message = filter.filter(&job.message).await?;
        let player_name = filter.filter(&job.player_name).await?;
        Ok::<_, ModerationError>(FilteredChat {
            message,
            player_name,
        })
    }
    .await;

    ChatOutcome { job, result }
}
