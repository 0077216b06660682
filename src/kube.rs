//! Kubernetes API adapter for the [`ControlPlane`] capability.
//!
//! Only two endpoints are used: reading a Deployment and patching its
//! `scale` subresource.

use crate::config::ControlPlaneConfig;
use crate::control_plane::{ControlPlane, ControlPlaneError, WorkloadStatus};
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";
const MERGE_PATCH: &str = "application/merge-patch+json";

/// Namespace used when a route does not name one: `WATCH_NAMESPACE`, then
/// the service account's namespace, then `default`
pub fn detect_namespace() -> String {
    if let Ok(ns) = std::env::var("WATCH_NAMESPACE") {
        if !ns.trim().is_empty() {
            return ns.trim().to_string();
        }
    }
    std::fs::read_to_string(Path::new(SERVICE_ACCOUNT_DIR).join("namespace"))
        .ok()
        .map(|ns| ns.trim().to_string())
        .filter(|ns| !ns.is_empty())
        .unwrap_or_else(|| "default".to_string())
}

#[derive(Debug, Default, Deserialize)]
struct Deployment {
    #[serde(default)]
    spec: DeploymentSpec,
    #[serde(default)]
    status: DeploymentStatus,
}

#[derive(Debug, Default, Deserialize)]
struct DeploymentSpec {
    replicas: Option<i32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeploymentStatus {
    ready_replicas: Option<i32>,
}

impl Deployment {
    fn workload_status(&self) -> WorkloadStatus {
        // The API server defaults an unset replica count to 1
        WorkloadStatus::new(
            self.spec.replicas.unwrap_or(1),
            self.status.ready_replicas.unwrap_or(0),
        )
    }
}

/// Where the bearer token comes from
#[derive(Debug, Clone)]
enum TokenSource {
    None,
    Static(String),
    /// Re-read on every call; projected service account tokens rotate
    File(PathBuf),
}

/// Client for the Deployment endpoints of a Kubernetes API server
#[derive(Debug, Clone)]
pub struct KubeClient {
    http: reqwest::Client,
    api_url: String,
    token: TokenSource,
    namespace: String,
}

impl KubeClient {
    /// Build a client from configuration, falling back to the in-cluster
    /// service account environment for anything left unset
    pub fn from_config(config: &ControlPlaneConfig) -> Result<Self, ControlPlaneError> {
        let api_url = match &config.api_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => in_cluster_api_url()?,
        };

        let sa_dir = Path::new(SERVICE_ACCOUNT_DIR);
        let token = if let Some(token) = &config.token {
            TokenSource::Static(token.clone())
        } else if let Some(path) = &config.token_file {
            TokenSource::File(PathBuf::from(path))
        } else if sa_dir.join("token").exists() {
            TokenSource::File(sa_dir.join("token"))
        } else {
            TokenSource::None
        };

        let mut builder = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .danger_accept_invalid_certs(config.insecure_skip_tls_verify);

        let ca_file = config
            .ca_file
            .as_ref()
            .map(PathBuf::from)
            .or_else(|| Some(sa_dir.join("ca.crt")).filter(|p| p.exists()));
        if let Some(ca_file) = ca_file {
            let pem = std::fs::read(&ca_file).map_err(|e| {
                ControlPlaneError::Config(format!(
                    "failed to read CA bundle {}: {}",
                    ca_file.display(),
                    e
                ))
            })?;
            let cert = reqwest::Certificate::from_pem(&pem).map_err(|e| {
                ControlPlaneError::Config(format!("invalid CA bundle {}: {}", ca_file.display(), e))
            })?;
            builder = builder.add_root_certificate(cert);
        }

        let http = builder
            .build()
            .map_err(|e| ControlPlaneError::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            api_url,
            token,
            namespace: detect_namespace(),
        })
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    fn deployment_url(&self, namespace: &str, name: &str) -> String {
        let namespace = if namespace.is_empty() {
            self.namespace.as_str()
        } else {
            namespace
        };
        format!(
            "{}/apis/apps/v1/namespaces/{}/deployments/{}",
            self.api_url,
            urlencoding::encode(namespace),
            urlencoding::encode(name)
        )
    }

    async fn bearer_token(&self) -> Result<Option<String>, ControlPlaneError> {
        match &self.token {
            TokenSource::None => Ok(None),
            TokenSource::Static(token) => Ok(Some(token.clone())),
            TokenSource::File(path) => tokio::fs::read_to_string(path)
                .await
                .map(|t| Some(t.trim().to_string()))
                .map_err(|e| {
                    ControlPlaneError::Config(format!(
                        "failed to read token {}: {}",
                        path.display(),
                        e
                    ))
                }),
        }
    }

    async fn send(
        &self,
        request: reqwest::RequestBuilder,
        namespace: &str,
        name: &str,
    ) -> Result<reqwest::Response, ControlPlaneError> {
        let request = match self.bearer_token().await? {
            Some(token) => request.bearer_auth(token),
            None => request,
        };

        let response = request
            .send()
            .await
            .map_err(|e| ControlPlaneError::Transport(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(ControlPlaneError::NotFound {
                namespace: namespace.to_string(),
                name: name.to_string(),
            });
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ControlPlaneError::Api {
                status: status.as_u16(),
                message,
            });
        }
        Ok(response)
    }
}

fn in_cluster_api_url() -> Result<String, ControlPlaneError> {
    let host = std::env::var("KUBERNETES_SERVICE_HOST").map_err(|_| {
        ControlPlaneError::Config(
            "no api_url configured and KUBERNETES_SERVICE_HOST is not set".to_string(),
        )
    })?;
    let port = std::env::var("KUBERNETES_SERVICE_PORT").unwrap_or_else(|_| "443".to_string());

    if host.contains(':') {
        Ok(format!("https://[{}]:{}", host, port))
    } else {
        Ok(format!("https://{}:{}", host, port))
    }
}

#[async_trait]
impl ControlPlane for KubeClient {
    async fn get_status(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<WorkloadStatus, ControlPlaneError> {
        let url = self.deployment_url(namespace, name);
        let response = self.send(self.http.get(&url), namespace, name).await?;
        let deployment: Deployment = response
            .json()
            .await
            .map_err(|e| ControlPlaneError::InvalidResponse(e.to_string()))?;

        let status = deployment.workload_status();
        debug!(
            namespace,
            workload = name,
            desired = status.desired_replicas,
            ready = status.ready_replicas,
            "Fetched deployment status"
        );
        Ok(status)
    }

    async fn scale(
        &self,
        namespace: &str,
        name: &str,
        replicas: i32,
    ) -> Result<(), ControlPlaneError> {
        let url = format!("{}/scale", self.deployment_url(namespace, name));
        let body = serde_json::json!({ "spec": { "replicas": replicas } });
        let request = self
            .http
            .patch(&url)
            .header(CONTENT_TYPE, MERGE_PATCH)
            .body(body.to_string());

        self.send(request, namespace, name).await?;
        debug!(namespace, workload = name, replicas, "Patched deployment scale");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(api_url: &str) -> ControlPlaneConfig {
        ControlPlaneConfig {
            api_url: Some(api_url.to_string()),
            token: Some("secret".to_string()),
            ..ControlPlaneConfig::default()
        }
    }

    #[test]
    fn test_parse_deployment_status() {
        let json = r#"{
            "metadata": {"name": "web"},
            "spec": {"replicas": 3},
            "status": {"replicas": 3, "readyReplicas": 2}
        }"#;
        let deployment: Deployment = serde_json::from_str(json).unwrap();
        assert_eq!(deployment.workload_status(), WorkloadStatus::new(3, 2));
    }

    #[test]
    fn test_parse_deployment_defaults() {
        // Scaled-to-zero deployments omit readyReplicas entirely
        let json = r#"{"spec": {"replicas": 0}, "status": {}}"#;
        let deployment: Deployment = serde_json::from_str(json).unwrap();
        assert_eq!(deployment.workload_status(), WorkloadStatus::new(0, 0));

        let json = r#"{"metadata": {}}"#;
        let deployment: Deployment = serde_json::from_str(json).unwrap();
        assert_eq!(deployment.workload_status(), WorkloadStatus::new(1, 0));
    }

    #[test]
    fn test_deployment_url() {
        let client = KubeClient::from_config(&test_config("https://api.example.com:6443/")).unwrap();
        assert_eq!(client.api_url(), "https://api.example.com:6443");
        assert_eq!(
            client.deployment_url("shop", "web"),
            "https://api.example.com:6443/apis/apps/v1/namespaces/shop/deployments/web"
        );
    }

    #[test]
    fn test_empty_namespace_uses_detected() {
        let client = KubeClient::from_config(&test_config("http://127.0.0.1:1")).unwrap();
        let url = client.deployment_url("", "web");
        assert!(url.ends_with(&format!("/namespaces/{}/deployments/web", client.namespace)));
    }

    #[tokio::test]
    async fn test_static_token() {
        let client = KubeClient::from_config(&test_config("http://127.0.0.1:1")).unwrap();
        assert_eq!(client.bearer_token().await.unwrap(), Some("secret".to_string()));
    }

    #[tokio::test]
    async fn test_token_file_is_trimmed() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("token");
        std::fs::write(&path, "file-token\n").unwrap();

        let config = ControlPlaneConfig {
            api_url: Some("http://127.0.0.1:1".to_string()),
            token_file: Some(path.to_string_lossy().into_owned()),
            ..ControlPlaneConfig::default()
        };
        let client = KubeClient::from_config(&config).unwrap();
        assert_eq!(client.bearer_token().await.unwrap(), Some("file-token".to_string()));
    }

    #[test]
    fn test_missing_ca_file_is_config_error() {
        let config = ControlPlaneConfig {
            api_url: Some("https://127.0.0.1:1".to_string()),
            ca_file: Some("/nonexistent/ca.crt".to_string()),
            ..ControlPlaneConfig::default()
        };
        let err = KubeClient::from_config(&config).unwrap_err();
        assert!(matches!(err, ControlPlaneError::Config(_)));
    }
}
