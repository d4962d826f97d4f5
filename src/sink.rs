//! Uploads record batches to the sink via Doris Stream Load.

use async_trait::async_trait;
use reqwest::Client as HttpClient;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::DorisConnectionDetails;

/// Errors surfaced by sink uploads.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("failed to build http client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("failed to send stream load request: {0}")]
    Request(#[source] reqwest::Error),

    #[error("stream load failed for label {label} with status {status}: {body}")]
    Status {
        label: String,
        status: String,
        body: String,
    },

    #[error("operation cancelled")]
    Cancelled,
}

impl SinkError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, SinkError::Cancelled)
    }
}

/// Upload operation the pipeline needs from a sink.
#[async_trait]
pub trait SinkWriter: Send + Sync + 'static {
    /// Upload a JSON array payload under a caller-provided unique label.
    ///
    /// The sink treats duplicate labels as idempotent no-ops; that is the
    /// only retry-safety guarantee at this boundary.
    async fn upload(
        &self,
        table: &str,
        payload: String,
        label: &str,
        cancel: &CancellationToken,
    ) -> Result<(), SinkError>;
}

/// [`SinkWriter`] posting to the Doris Stream Load HTTP ingress.
#[derive(Debug, Clone)]
pub struct DorisSinkWriter {
    client: HttpClient,
    base_url: String,
    database: String,
    username: String,
    password: String,
}

impl DorisSinkWriter {
    pub fn new(details: &DorisConnectionDetails) -> Result<Self, SinkError> {
        let client = HttpClient::builder()
            .connect_timeout(std::time::Duration::from_secs(10))
            .build()
            .map_err(SinkError::Client)?;

        Ok(Self {
            client,
            base_url: format!("http://{}:{}", details.be_nodes, details.be_port),
            database: details.database.clone(),
            username: details.username.clone(),
            password: details.password.clone(),
        })
    }
}

#[async_trait]
impl SinkWriter for DorisSinkWriter {
    async fn upload(
        &self,
        table: &str,
        payload: String,
        label: &str,
        cancel: &CancellationToken,
    ) -> Result<(), SinkError> {
        let url = format!(
            "{}/api/{}/{}/_stream_load",
            self.base_url, self.database, table
        );

        let request = self
            .client
            .put(&url)
            .header("Expect", "100-continue")
            .header("Content-Type", "application/json")
            .header("format", "json")
            .header("strip_outer_array", "true")
            .header("label", label)
            .basic_auth(&self.username, Some(&self.password))
            .body(payload);

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(SinkError::Cancelled),
            res = request.send() => res.map_err(SinkError::Request)?,
        };

        let status = response.status();
        let body = response.text().await.unwrap_or_default();

        if !status.is_success() {
            return Err(SinkError::Status {
                label: label.to_string(),
                status: status.to_string(),
                body,
            });
        }

        debug!(table, label, response = %body, "stream_load_ok");
        Ok(())
    }
}
