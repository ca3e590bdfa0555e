//! HTTP client for the action-execution server.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use stagehand_protocol::{ExecutionError, ExecutionResult, Observation};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::executor::{
    ActionExecutor, ErrorResponse, ExecuteRequest, ExecuteResponse, ExecutorConnector, ServerInfo,
    kind_for_status,
};

/// Extra time granted on top of the action timeout, so the server-side
/// watchdog reports a timeout before the client gives up.
const CLIENT_SLACK: Duration = Duration::from_secs(5);
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct HttpActionClient {
    base_url: String,
    client: reqwest::Client,
    slack: Duration,
}

impl HttpActionClient {
    pub fn new(base_url: impl Into<String>) -> ExecutionResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| ExecutionError::sandbox_with("failed to build HTTP client", e))?;
        Ok(Self::with_client(base_url, client))
    }

    pub fn with_client(base_url: impl Into<String>, client: reqwest::Client) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
            slack: CLIENT_SLACK,
        }
    }

    pub fn with_slack(mut self, slack: Duration) -> Self {
        self.slack = slack;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    pub async fn server_info(&self) -> ExecutionResult<ServerInfo> {
        let response = self
            .client
            .get(self.url("server_info"))
            .timeout(PROBE_TIMEOUT)
            .send()
            .await
            .map_err(map_transport_error)?;
        if !response.status().is_success() {
            return Err(error_from_reply(response).await);
        }
        response
            .json::<ServerInfo>()
            .await
            .map_err(|e| ExecutionError::sandbox_with("malformed server_info reply", e))
    }

    async fn send_execute(&self, request: &ExecuteRequest) -> ExecutionResult<Observation> {
        let response = self
            .client
            .post(self.url("execute_action"))
            .json(request)
            .send()
            .await
            .map_err(map_transport_error)?;
        if !response.status().is_success() {
            return Err(error_from_reply(response).await);
        }
        let body = response
            .json::<ExecuteResponse>()
            .await
            .map_err(|e| ExecutionError::sandbox_with("malformed execute_action reply", e))?;
        Ok(body.observation)
    }
}

#[async_trait]
impl ActionExecutor for HttpActionClient {
    #[instrument(
        skip(self, request, cancel),
        fields(endpoint = %self.base_url, action = request.action.kind.name(), timeout_secs = request.timeout_secs)
    )]
    async fn execute(
        &self,
        request: ExecuteRequest,
        cancel: CancellationToken,
    ) -> ExecutionResult<Observation> {
        let budget = Duration::from_secs(request.timeout_secs) + self.slack;
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("execution cancelled by caller");
                Err(ExecutionError::sandbox("execution cancelled"))
            }
            outcome = tokio::time::timeout(budget, self.send_execute(&request)) => match outcome {
                Ok(result) => result,
                Err(_) => {
                    // The server may still be running the action.
                    warn!("execute_action reply did not arrive in time");
                    Err(ExecutionError::Timeout { after_secs: request.timeout_secs })
                }
            },
        }
    }

    async fn alive(&self) -> ExecutionResult<()> {
        let response = self
            .client
            .get(self.url("alive"))
            .timeout(PROBE_TIMEOUT)
            .send()
            .await
            .map_err(map_transport_error)?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(ExecutionError::Disconnected(format!(
                "liveness probe answered {}",
                response.status()
            )))
        }
    }
}

fn map_transport_error(error: reqwest::Error) -> ExecutionError {
    if error.is_timeout() {
        ExecutionError::Timeout {
            after_secs: PROBE_TIMEOUT.as_secs(),
        }
    } else if error.is_connect() || error.is_request() {
        ExecutionError::Disconnected(error.to_string())
    } else {
        ExecutionError::sandbox_with("transport failure", error)
    }
}

async fn error_from_reply(response: reqwest::Response) -> ExecutionError {
    let status = response.status().as_u16();
    let text = response.text().await.unwrap_or_default();
    match serde_json::from_str::<ErrorResponse>(&text) {
        Ok(reply) => ExecutionError::from_body(reply.error),
        Err(_) => ExecutionError::from_body(stagehand_protocol::ErrorBody {
            kind: kind_for_status(status),
            message: if text.is_empty() {
                format!("server answered {status}")
            } else {
                text
            },
        }),
    }
}

/// Connects over HTTP with a shared connection pool.
#[derive(Debug, Clone, Default)]
pub struct HttpConnector {
    client: Option<reqwest::Client>,
}

impl HttpConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self {
            client: Some(client),
        }
    }
}

impl ExecutorConnector for HttpConnector {
    fn connect(&self, base_url: &str) -> ExecutionResult<Arc<dyn ActionExecutor>> {
        let client = match &self.client {
            Some(client) => HttpActionClient::with_client(base_url, client.clone()),
            None => HttpActionClient::new(base_url)?,
        };
        Ok(Arc::new(client))
    }
}
