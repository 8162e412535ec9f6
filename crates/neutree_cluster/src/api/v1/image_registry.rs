use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::api::v1::Metadata;
use crate::util::errors::{Result, StdError};

pub const IMAGE_REGISTRY_KIND: &str = "ImageRegistry";

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ImageRegistry {
    #[serde(default)]
    pub id: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub api_version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec: Option<ImageRegistrySpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ImageRegistryStatus>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ImageRegistrySpec {
    pub url: String,
    /// Path under the registry host, may be empty
    #[serde(default)]
    pub repository: String,
    #[serde(default)]
    pub authconfig: ImageRegistryAuthConfig,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ca: String,
}

/// Docker style credentials.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct ImageRegistryAuthConfig {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub username: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub password: String,
    /// base64 of `username:password`
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub auth: String,
    #[serde(rename = "identitytoken", default, skip_serializing_if = "String::is_empty")]
    pub identity_token: String,
    #[serde(rename = "registrytoken", default, skip_serializing_if = "String::is_empty")]
    pub registry_token: String,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum ImageRegistryPhase {
    Pending,
    Connected,
    Failed,
}

impl fmt::Display for ImageRegistryPhase {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ImageRegistryPhase::Pending => write!(f, "Pending"),
            ImageRegistryPhase::Connected => write!(f, "Connected"),
            ImageRegistryPhase::Failed => write!(f, "Failed"),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ImageRegistryStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<ImageRegistryPhase>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error_message: String,
}

impl ImageRegistry {
    pub fn name_any(&self) -> String {
        self.metadata
            .as_ref()
            .map(|m| m.name.clone())
            .unwrap_or_default()
    }

    pub fn spec(&self) -> Result<&ImageRegistrySpec> {
        self.spec.as_ref().ok_or_else(|| {
            StdError::ConfigError(format!("image registry {} has no spec", self.name_any())).into()
        })
    }

    pub fn is_connected(&self) -> bool {
        self.status
            .as_ref()
            .and_then(|s| s.phase)
            .is_some_and(|phase| phase == ImageRegistryPhase::Connected)
    }
}
