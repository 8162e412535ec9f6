//! The remote object tree the applier converges.

use async_trait::async_trait;
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams};
use kube::core::{ApiResource, GroupVersionKind};
use kube::Client;
use serde_json::Value;
use tracing::debug;

use super::object::{is_cluster_scoped, ObjectKey};
use crate::util::errors::{Error, Result, StdError};

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// The live object, `None` when absent.
    async fn get(&self, key: &ObjectKey) -> Result<Option<Value>>;

    /// All objects of a kind, in `namespace` or cluster wide when empty.
    async fn list(&self, api_version: &str, kind: &str, namespace: &str) -> Result<Vec<Value>>;

    async fn create(&self, key: &ObjectKey, object: &Value) -> Result<Value>;

    /// JSON merge patch of an existing object.
    async fn merge_patch(&self, key: &ObjectKey, patch: &Value) -> Result<Value>;

    /// Delete, treating an absent object as success.
    async fn delete(&self, key: &ObjectKey) -> Result<()>;
}

/// [`ObjectStore`] over a Kubernetes API server.
#[derive(Clone)]
pub struct KubeObjectStore {
    client: Client,
}

fn kube_error(e: kube::Error) -> Error {
    Error::StdError(StdError::KubeError(e))
}

fn json_error(e: serde_json::Error) -> Error {
    Error::StdError(StdError::JsonSerializationError(e))
}

impl KubeObjectStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, api_version: &str, kind: &str, namespace: &str) -> Api<DynamicObject> {
        let (group, version) = match api_version.split_once('/') {
            Some((group, version)) => (group, version),
            None => ("", api_version),
        };
        let resource = ApiResource::from_gvk(&GroupVersionKind::gvk(group, version, kind));
        if namespace.is_empty() || is_cluster_scoped(kind) {
            Api::all_with(self.client.clone(), &resource)
        } else {
            Api::namespaced_with(self.client.clone(), namespace, &resource)
        }
    }

    fn api_for(&self, key: &ObjectKey) -> Api<DynamicObject> {
        self.api(&key.api_version, &key.kind, &key.namespace)
    }
}

#[async_trait]
impl ObjectStore for KubeObjectStore {
    async fn get(&self, key: &ObjectKey) -> Result<Option<Value>> {
        let object = self.api_for(key).get_opt(&key.name).await.map_err(kube_error)?;
        object
            .map(|o| serde_json::to_value(o).map_err(json_error))
            .transpose()
    }

    async fn list(&self, api_version: &str, kind: &str, namespace: &str) -> Result<Vec<Value>> {
        let list = self
            .api(api_version, kind, namespace)
            .list(&ListParams::default())
            .await
            .map_err(kube_error)?;
        list.items
            .into_iter()
            .map(|mut o| {
                // list items come back without type information
                o.types.get_or_insert_with(|| kube::core::TypeMeta {
                    api_version: api_version.to_string(),
                    kind: kind.to_string(),
                });
                serde_json::to_value(o).map_err(json_error)
            })
            .collect()
    }

    async fn create(&self, key: &ObjectKey, object: &Value) -> Result<Value> {
        debug!("creating {}", key);
        let object: DynamicObject = serde_json::from_value(object.clone()).map_err(json_error)?;
        let created = self
            .api_for(key)
            .create(&PostParams::default(), &object)
            .await
            .map_err(kube_error)?;
        serde_json::to_value(created).map_err(json_error)
    }

    async fn merge_patch(&self, key: &ObjectKey, patch: &Value) -> Result<Value> {
        debug!("patching {}", key);
        let patched = self
            .api_for(key)
            .patch(&key.name, &PatchParams::default(), &Patch::Merge(patch))
            .await
            .map_err(kube_error)?;
        serde_json::to_value(patched).map_err(json_error)
    }

    async fn delete(&self, key: &ObjectKey) -> Result<()> {
        debug!("deleting {}", key);
        match self
            .api_for(key)
            .delete(&key.name, &DeleteParams::background())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(resp)) if resp.code == 404 => Ok(()),
            Err(e) => Err(kube_error(e)),
        }
    }
}
