//! [`ClusterApi`] over the Kubernetes REST API.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde_json::Value;
use stagehand_protocol::{ExecutionError, ExecutionResult};
use tracing::{debug, instrument};

use super::api::{ClusterApi, ClusterResource, PodPhase, ResourceKind, SESSION_LABEL};

pub const SERVICE_ACCOUNT_TOKEN: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";
pub const SERVICE_ACCOUNT_CA: &str = "/var/run/secrets/kubernetes.io/serviceaccount/ca.crt";

#[derive(Debug, Clone)]
pub struct KubernetesApi {
    base_url: String,
    namespace: String,
    token: Option<String>,
    client: reqwest::Client,
}

impl KubernetesApi {
    pub fn new(
        base_url: impl Into<String>,
        namespace: impl Into<String>,
        token: Option<String>,
    ) -> ExecutionResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| ExecutionError::sandbox_with("failed to build cluster client", e))?;
        Ok(Self::with_client(base_url, namespace, token, client))
    }

    pub fn with_client(
        base_url: impl Into<String>,
        namespace: impl Into<String>,
        token: Option<String>,
        client: reqwest::Client,
    ) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            namespace: namespace.into(),
            token,
            client,
        }
    }

    /// Credentials from a mounted service account: bearer token plus the
    /// cluster CA, when present.
    pub fn from_service_account(
        base_url: impl Into<String>,
        namespace: impl Into<String>,
        token_path: &Path,
        ca_path: &Path,
    ) -> ExecutionResult<Self> {
        let token = std::fs::read_to_string(token_path)
            .map_err(|e| {
                ExecutionError::sandbox_with(
                    format!("failed to read service account token {}", token_path.display()),
                    e,
                )
            })?
            .trim()
            .to_owned();
        let mut builder = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(30));
        if let Ok(pem) = std::fs::read(ca_path) {
            let certificate = reqwest::Certificate::from_pem(&pem)
                .map_err(|e| ExecutionError::sandbox_with("invalid cluster CA certificate", e))?;
            builder = builder.add_root_certificate(certificate);
        }
        let client = builder
            .build()
            .map_err(|e| ExecutionError::sandbox_with("failed to build cluster client", e))?;
        Ok(Self::with_client(base_url, namespace, Some(token), client))
    }

    fn collection_url(&self, kind: ResourceKind) -> String {
        let ns = &self.namespace;
        match kind {
            ResourceKind::Pod => format!("{}/api/v1/namespaces/{ns}/pods", self.base_url),
            ResourceKind::PersistentVolumeClaim => {
                format!("{}/api/v1/namespaces/{ns}/persistentvolumeclaims", self.base_url)
            }
            ResourceKind::Service => format!("{}/api/v1/namespaces/{ns}/services", self.base_url),
            ResourceKind::Ingress => format!(
                "{}/apis/networking.k8s.io/v1/namespaces/{ns}/ingresses",
                self.base_url
            ),
        }
    }

    fn request(&self, method: Method, url: String) -> RequestBuilder {
        let builder = self.client.request(method, url);
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send(&self, builder: RequestBuilder, what: &str) -> ExecutionResult<Response> {
        builder.send().await.map_err(|e| {
            if e.is_timeout() {
                ExecutionError::Timeout { after_secs: 30 }
            } else if e.is_connect() || e.is_request() {
                ExecutionError::Disconnected(format!("cluster API unreachable ({what}): {e}"))
            } else {
                ExecutionError::sandbox_with(format!("cluster API call failed ({what})"), e)
            }
        })
    }
}

async fn rejection(response: Response, what: &str) -> ExecutionError {
    let status = response.status();
    let message = response
        .json::<Value>()
        .await
        .ok()
        .and_then(|body| body.get("message").and_then(Value::as_str).map(str::to_owned))
        .unwrap_or_else(|| status.to_string());
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            ExecutionError::PermissionDenied(format!("{what}: {message}"))
        }
        StatusCode::NOT_FOUND => ExecutionError::NotFound(format!("{what}: {message}")),
        s if s.is_server_error() => {
            ExecutionError::Disconnected(format!("{what}: cluster API returned {s}: {message}"))
        }
        _ => ExecutionError::sandbox(format!("{what}: {message}")),
    }
}

#[async_trait]
impl ClusterApi for KubernetesApi {
    async fn get(&self, kind: ResourceKind, name: &str) -> ExecutionResult<Option<ClusterResource>> {
        let what = format!("get {kind} {name}");
        let url = format!("{}/{name}", self.collection_url(kind));
        let response = self.send(self.request(Method::GET, url), &what).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(rejection(response, &what).await);
        }
        let manifest: Value = response
            .json()
            .await
            .map_err(|e| ExecutionError::sandbox_with(format!("{what}: malformed reply"), e))?;
        Ok(Some(ClusterResource {
            kind,
            name: name.to_owned(),
            manifest,
        }))
    }

    #[instrument(skip_all, fields(kind = %resource.kind, name = %resource.name))]
    async fn create(&self, resource: &ClusterResource) -> ExecutionResult<()> {
        let what = format!("create {} {}", resource.kind, resource.name);
        let builder = self
            .request(Method::POST, self.collection_url(resource.kind))
            .json(&resource.manifest);
        let response = self.send(builder, &what).await?;
        if response.status() == StatusCode::CONFLICT {
            debug!("resource already exists");
            return Ok(());
        }
        if !response.status().is_success() {
            return Err(rejection(response, &what).await);
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete(&self, kind: ResourceKind, name: &str) -> ExecutionResult<()> {
        let what = format!("delete {kind} {name}");
        let url = format!("{}/{name}", self.collection_url(kind));
        let response = self.send(self.request(Method::DELETE, url), &what).await?;
        if response.status() == StatusCode::NOT_FOUND || response.status().is_success() {
            return Ok(());
        }
        Err(rejection(response, &what).await)
    }

    async fn list(&self, kind: ResourceKind, session_slug: &str) -> ExecutionResult<Vec<String>> {
        let what = format!("list {kind}");
        let builder = self
            .request(Method::GET, self.collection_url(kind))
            .query(&[("labelSelector", format!("{SESSION_LABEL}={session_slug}"))]);
        let response = self.send(builder, &what).await?;
        if !response.status().is_success() {
            return Err(rejection(response, &what).await);
        }
        let body: Value = response
            .json()
            .await
            .map_err(|e| ExecutionError::sandbox_with(format!("{what}: malformed reply"), e))?;
        let names = body
            .get("items")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| item.pointer("/metadata/name").and_then(Value::as_str))
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default();
        Ok(names)
    }

    async fn pod_phase(&self, name: &str) -> ExecutionResult<Option<PodPhase>> {
        let pod = self.get(ResourceKind::Pod, name).await?;
        Ok(pod.map(|pod| {
            pod.manifest
                .pointer("/status/phase")
                .and_then(Value::as_str)
                .map(PodPhase::parse)
                .unwrap_or(PodPhase::Pending)
        }))
    }
}
