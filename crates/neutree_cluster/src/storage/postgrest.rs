use async_trait::async_trait;
use reqwest::{Method, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, error};

use super::{Filter, Storage};
use crate::api::v1::{Cluster, ImageRegistry};
use crate::util::errors::{Error, Result, StdError};

const CLUSTERS_TABLE: &str = "clusters";
const IMAGE_REGISTRIES_TABLE: &str = "image_registries";

/// [`Storage`] over a PostgREST endpoint.
#[derive(Clone)]
pub struct PostgrestStorage {
    base_url: String,
    token: String,
    client: reqwest::Client,
}

impl PostgrestStorage {
    pub fn new(base_url: &str, token: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            client: reqwest::Client::new(),
        }
    }

    fn request(&self, method: Method, table: &str, query: &[(String, String)]) -> RequestBuilder {
        let mut builder = self
            .client
            .request(method, format!("{}/{}", self.base_url, table))
            .query(query);
        if !self.token.is_empty() {
            builder = builder.bearer_auth(&self.token);
        }
        builder
    }

    async fn send(&self, builder: RequestBuilder, what: &str) -> Result<reqwest::Response> {
        let response = builder.send().await.map_err(|e| {
            error!("storage request {} failed: {}", what, e);
            Error::StdError(StdError::RemoteUnavailable(format!(
                "storage request {what} failed: {e}"
            )))
        })?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!("storage {} returned {}: {}", what, status, body);
            return Err(Error::StdError(StdError::HttpError(format!(
                "storage {what} returned {status}: {body}"
            ))));
        }
        Ok(response)
    }

    async fn list<T: DeserializeOwned>(&self, table: &str, filters: &[Filter]) -> Result<Vec<T>> {
        debug!("listing {} with {:?}", table, filters);
        let response = self
            .send(
                self.request(Method::GET, table, &filter_query(filters)),
                &format!("list {table}"),
            )
            .await?;
        response.json::<Vec<T>>().await.map_err(|e| {
            Error::StdError(StdError::HttpError(format!(
                "failed to decode {table}: {e}"
            )))
        })
    }

    async fn update<T: Serialize + Sync>(&self, table: &str, id: i64, update: &T) -> Result<()> {
        let builder = self
            .request(Method::PATCH, table, &id_query(id))
            .header("Prefer", "return=minimal")
            .json(update);
        self.send(builder, &format!("update {table}/{id}")).await?;
        Ok(())
    }
}

fn filter_query(filters: &[Filter]) -> Vec<(String, String)> {
    filters
        .iter()
        .map(|f| (f.column.clone(), format!("{}.{}", f.operator, f.value)))
        .collect()
}

fn id_query(id: i64) -> Vec<(String, String)> {
    vec![("id".to_string(), format!("eq.{id}"))]
}

#[async_trait]
impl Storage for PostgrestStorage {
    async fn list_clusters(&self, filters: &[Filter]) -> Result<Vec<Cluster>> {
        self.list(CLUSTERS_TABLE, filters).await
    }

    async fn update_cluster(&self, id: i64, update: &Cluster) -> Result<()> {
        self.update(CLUSTERS_TABLE, id, update).await
    }

    async fn delete_cluster(&self, id: i64) -> Result<()> {
        let builder = self.request(Method::DELETE, CLUSTERS_TABLE, &id_query(id));
        self.send(builder, &format!("delete {CLUSTERS_TABLE}/{id}")).await?;
        Ok(())
    }

    async fn list_image_registry(&self, filters: &[Filter]) -> Result<Vec<ImageRegistry>> {
        self.list(IMAGE_REGISTRIES_TABLE, filters).await
    }

    async fn update_image_registry(&self, id: i64, update: &ImageRegistry) -> Result<()> {
        self.update(IMAGE_REGISTRIES_TABLE, id, update).await
    }
}
