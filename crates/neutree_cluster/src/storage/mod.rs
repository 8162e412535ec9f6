//! Contract with the storage gateway that persists clusters and registries.

use async_trait::async_trait;

use crate::api::v1::{Cluster, ImageRegistry};
use crate::util::errors::{Result, StdError};

pub mod postgrest;

pub use postgrest::PostgrestStorage;

pub const METADATA_NAME_COLUMN: &str = "metadata->name";
pub const METADATA_WORKSPACE_COLUMN: &str = "metadata->workspace";

/// One `column=operator.value` condition of a list query.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Filter {
    pub column: String,
    pub operator: String,
    pub value: String,
}

impl Filter {
    /// Equality against a JSON string field, the value sent as a quoted literal.
    pub fn eq(column: &str, value: &str) -> Self {
        Self {
            column: column.to_string(),
            operator: "eq".to_string(),
            value: format!("\"{value}\""),
        }
    }

    /// Whether `field` satisfies the filter, for in-memory stores.
    pub fn matches(&self, field: &str) -> bool {
        self.operator == "eq" && self.value.trim_matches('"') == field
    }
}

#[async_trait]
pub trait Storage: Send + Sync {
    async fn list_clusters(&self, filters: &[Filter]) -> Result<Vec<Cluster>>;

    /// Merge the non-empty top-level fields of `update` into cluster `id`.
    async fn update_cluster(&self, id: i64, update: &Cluster) -> Result<()>;

    async fn delete_cluster(&self, id: i64) -> Result<()>;

    async fn list_image_registry(&self, filters: &[Filter]) -> Result<Vec<ImageRegistry>>;

    async fn update_image_registry(&self, id: i64, update: &ImageRegistry) -> Result<()>;
}

/// The image registry `name` of `workspace`. `ResourceNotFound` when absent.
pub async fn get_image_registry(
    storage: &dyn Storage,
    name: &str,
    workspace: &str,
) -> Result<ImageRegistry> {
    let filters = [
        Filter::eq(METADATA_NAME_COLUMN, name),
        Filter::eq(METADATA_WORKSPACE_COLUMN, workspace),
    ];
    storage
        .list_image_registry(&filters)
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| {
            StdError::ResourceNotFound(format!("image registry {workspace}/{name} not found")).into()
        })
}
