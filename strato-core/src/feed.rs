use crate::error::Result;
use crate::types::Timestamp;
use async_trait::async_trait;
use serde::Deserialize;

/// One row of the container change-feed the external crawler produces.
/// `created_at` is the object's timestamp at enumeration time; the engine
/// re-checks it against a live HEAD before acting.
#[derive(Debug, Clone, Deserialize)]
pub struct FeedRow {
    pub row_id: u64,
    pub name: String,
    #[serde(default)]
    pub deleted: bool,
    pub created_at: Timestamp,
}

/// Where sync rows come from. The crawler itself is outside this system;
/// it exposes an ordered feed per container.
#[async_trait]
pub trait FeedSource: Send + Sync {
    /// Rows with `row_id > since`, in commit order, at most `limit`.
    async fn next_rows(
        &self,
        account: &str,
        container: &str,
        since: u64,
        limit: usize,
    ) -> Result<Vec<FeedRow>>;
}

/// Feed served over HTTP by the crawler sidecar.
pub struct HttpFeedSource {
    client: reqwest::Client,
    base_url: String,
}

impl HttpFeedSource {
    pub fn new(endpoint: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: format!("{}/feed", endpoint.trim_end_matches('/')),
        }
    }
}

#[async_trait]
impl FeedSource for HttpFeedSource {
    async fn next_rows(
        &self,
        account: &str,
        container: &str,
        since: u64,
        limit: usize,
    ) -> Result<Vec<FeedRow>> {
        let response = self
            .client
            .get(format!("{}/{}/{}", self.base_url, account, container))
            .query(&[("since", since.to_string()), ("limit", limit.to_string())])
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(crate::error::StratoError::from_status(
                response.status().as_u16(),
                format!("feed {}/{}", account, container),
            ));
        }
        Ok(response.json().await?)
    }
}
