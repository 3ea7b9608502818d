//! Placement driver HTTP API.

use std::time::Duration;

use reqwest::Client;
use thiserror::Error;
use tracing::{debug, warn};

const CLUSTER_VERSION_PATH: &str = "pd/api/v1/config/cluster-version";

#[derive(Debug, Error)]
pub enum PdError {
    #[error("no PD endpoints configured")]
    NoEndpoints,

    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("[{status}] {body} (from {url})")]
    Status {
        url: String,
        status: u16,
        body: String,
    },
}

/// Read-only client for the PD HTTP API.
pub struct PdHttpClient {
    client: Client,
    endpoints: Vec<String>,
}

impl PdHttpClient {
    /// Creates a client for `endpoints`, tried in order.
    pub fn new(endpoints: Vec<String>, timeout: Duration) -> Result<Self, PdError> {
        if endpoints.is_empty() {
            return Err(PdError::NoEndpoints);
        }

        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(PdError::Client)?;

        Ok(Self { client, endpoints })
    }

    #[must_use]
    pub fn endpoints(&self) -> &[String] {
        &self.endpoints
    }

    /// Fetches the cluster version from the first PD that answers.
    ///
    /// Returns the last endpoint's error when none of them do.
    pub async fn cluster_version(&self) -> Result<String, PdError> {
        let mut last_error = PdError::NoEndpoints;

        for endpoint in &self.endpoints {
            let url = cluster_version_url(endpoint);
            match self.get_text(&url).await {
                Ok(body) => {
                    let version = parse_version(&body);
                    debug!(url = %url, version = %version, "Fetched cluster version");
                    return Ok(version);
                }
                Err(e) => {
                    warn!(url = %url, error = %e, "PD endpoint failed, trying next");
                    last_error = e;
                }
            }
        }

        Err(last_error)
    }

    async fn get_text(&self, url: &str) -> Result<String, PdError> {
        let request_error = |source: reqwest::Error| PdError::Request {
            url: url.to_string(),
            source,
        };

        let response = self.client.get(url).send().await.map_err(request_error)?;
        let status = response.status();
        let body = response.text().await.map_err(request_error)?;

        if !status.is_success() {
            return Err(PdError::Status {
                url: url.to_string(),
                status: status.as_u16(),
                body,
            });
        }

        Ok(body)
    }
}

/// Full URL of the cluster-version endpoint, defaulting to plain HTTP.
pub fn cluster_version_url(endpoint: &str) -> String {
    let endpoint = endpoint.trim().trim_end_matches('/');
    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        format!("{endpoint}/{CLUSTER_VERSION_PATH}")
    } else {
        format!("http://{endpoint}/{CLUSTER_VERSION_PATH}")
    }
}

/// PD answers with a JSON string; older versions send the bare text.
fn parse_version(body: &str) -> String {
    let body = body.trim();
    serde_json::from_str::<String>(body).unwrap_or_else(|_| body.to_string())
}
