use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

use super::{AutoscaleStatus, ClusterMetadata, NodeSummary, WorkloadClient, WorkloadClientFactory};
use crate::util::errors::{Error, Result, StdError};

/// Envelope of the dashboard's JSON api.
#[derive(Deserialize, Debug)]
struct Envelope<T> {
    #[serde(default)]
    result: bool,
    #[serde(default)]
    msg: String,
    data: Option<T>,
}

#[derive(Deserialize, Debug)]
struct NodesData {
    #[serde(default)]
    summary: Vec<NodeSummary>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct ClusterStatusData {
    #[serde(default)]
    cluster_status: ClusterStatusReport,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
struct ClusterStatusReport {
    #[serde(default)]
    autoscaler_report: AutoscaleStatus,
}

/// [`WorkloadClient`] over the engine dashboard HTTP api.
pub struct DashboardClient {
    base_url: String,
    client: reqwest::Client,
}

impl DashboardClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::StdError(StdError::HttpError(format!("failed to build http client: {e}"))))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    async fn send(&self, request: reqwest::RequestBuilder, path: &str) -> Result<reqwest::Response> {
        let response = request.send().await.map_err(|e| {
            error!("dashboard request {} failed: {}", path, e);
            Error::StdError(StdError::RemoteUnavailable(format!(
                "dashboard request {path} failed: {e}"
            )))
        })?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!("dashboard {} returned {}", path, status);
            return Err(Error::StdError(StdError::HttpError(format!(
                "dashboard {path} returned {status}: {body}"
            ))));
        }
        Ok(response)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        debug!("GET {}", url);
        let response = self.send(self.client.get(&url), path).await?;
        response.json::<T>().await.map_err(|e| {
            Error::StdError(StdError::HttpError(format!(
                "failed to decode dashboard {path}: {e}"
            )))
        })
    }

    async fn get_data<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let envelope: Envelope<T> = self.get_json(path).await?;
        unwrap_envelope(envelope, path)
    }
}

fn unwrap_envelope<T>(envelope: Envelope<T>, path: &str) -> Result<T> {
    if !envelope.result {
        return Err(Error::StdError(StdError::HttpError(format!(
            "dashboard {path} failed: {}",
            envelope.msg
        ))));
    }
    envelope.data.ok_or_else(|| {
        Error::StdError(StdError::HttpError(format!("dashboard {path} returned no data")))
    })
}

#[async_trait]
impl WorkloadClient for DashboardClient {
    async fn list_nodes(&self) -> Result<Vec<NodeSummary>> {
        let data: NodesData = self.get_data("/nodes?view=summary").await?;
        Ok(data.summary)
    }

    async fn get_cluster_autoscale_status(&self) -> Result<AutoscaleStatus> {
        let data: ClusterStatusData = self.get_data("/api/cluster_status").await?;
        Ok(data.cluster_status.autoscaler_report)
    }

    async fn get_cluster_metadata(&self) -> Result<ClusterMetadata> {
        self.get_data("/api/v0/cluster_metadata").await
    }

    async fn update_serve_applications(&self, config: &Value) -> Result<()> {
        let path = "/api/serve/applications/";
        let url = format!("{}{}", self.base_url, path);
        debug!("PUT {}", url);
        self.send(self.client.put(&url).json(config), path).await?;
        Ok(())
    }

    async fn get_serve_applications(&self) -> Result<Value> {
        self.get_json("/api/serve/applications/").await
    }
}

/// Builds [`DashboardClient`]s with a shared request timeout.
#[derive(Clone, Debug)]
pub struct DashboardClientFactory {
    pub timeout: Duration,
}

impl WorkloadClientFactory for DashboardClientFactory {
    fn client(&self, dashboard_url: &str) -> Arc<dyn WorkloadClient> {
        match DashboardClient::new(dashboard_url, self.timeout) {
            Ok(client) => Arc::new(client),
            Err(e) => Arc::new(UnavailableClient(e.to_string())),
        }
    }
}

/// Stand-in when no http client could be built; every call reports the build failure.
struct UnavailableClient(String);

impl UnavailableClient {
    fn error(&self) -> Error {
        Error::StdError(StdError::RemoteUnavailable(self.0.clone()))
    }
}

#[async_trait]
impl WorkloadClient for UnavailableClient {
    async fn list_nodes(&self) -> Result<Vec<NodeSummary>> {
        Err(self.error())
    }

    async fn get_cluster_autoscale_status(&self) -> Result<AutoscaleStatus> {
        Err(self.error())
    }

    async fn get_cluster_metadata(&self) -> Result<ClusterMetadata> {
        Err(self.error())
    }

    async fn update_serve_applications(&self, _config: &Value) -> Result<()> {
        Err(self.error())
    }

    async fn get_serve_applications(&self) -> Result<Value> {
        Err(self.error())
    }
}
