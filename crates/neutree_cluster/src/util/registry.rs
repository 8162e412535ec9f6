use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::Url;
use serde_json::json;

use crate::api::v1::{ImageRegistry, ImageRegistrySpec};
use crate::util::errors::{Error, Result, StdError};

fn config_error(message: String) -> Error {
    Error::StdError(StdError::ConfigError(message))
}

/// `host[:port]` of the registry URL. Fails when the URL does not carry a host.
pub fn registry_host(url: &str) -> Result<String> {
    let parsed = Url::parse(url)
        .map_err(|e| config_error(format!("invalid image registry url {url:?}: {e}")))?;
    let host = parsed
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| config_error(format!("image registry url {url:?} has no host")))?;
    Ok(match parsed.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    })
}

/// Prefix every workload image is pulled from, `host[/repository]`.
pub fn image_prefix(spec: &ImageRegistrySpec) -> Result<String> {
    let host = registry_host(&spec.url)?;
    let repository = spec.repository.trim_matches('/');
    if repository.is_empty() {
        Ok(host)
    } else {
        Ok(format!("{host}/{repository}"))
    }
}

/// Resolve the credentials of a registry into `(username, password)`.
///
/// The first non-empty password-like field wins, in the order password,
/// identity token, registry token. When no username/password pair is set the
/// base64 `auth` field is decoded instead. Anonymous registries yield empty strings.
pub fn image_registry_auth_info(registry: &ImageRegistry) -> Result<(String, String)> {
    let auth = &registry.spec()?.authconfig;

    let secret = [&auth.password, &auth.identity_token, &auth.registry_token]
        .into_iter()
        .find(|value| !value.is_empty())
        .cloned()
        .unwrap_or_default();

    if !auth.username.is_empty() && !secret.is_empty() {
        return Ok((auth.username.clone(), secret));
    }

    if !auth.auth.is_empty() {
        let decoded = STANDARD.decode(auth.auth.trim()).map_err(|e| {
            config_error(format!(
                "image registry {} has invalid auth: {e}",
                registry.name_any()
            ))
        })?;
        let decoded = String::from_utf8(decoded).map_err(|_| {
            config_error(format!(
                "image registry {} auth is not valid utf-8",
                registry.name_any()
            ))
        })?;
        let (username, password) = decoded.split_once(':').ok_or_else(|| {
            config_error(format!(
                "image registry {} auth must be base64 of username:password",
                registry.name_any()
            ))
        })?;
        return Ok((username.to_string(), password.to_string()));
    }

    Ok((auth.username.clone(), secret))
}

/// Content of a `kubernetes.io/dockerconfigjson` secret for this registry.
pub fn docker_config_json(registry: &ImageRegistry) -> Result<String> {
    let host = registry_host(&registry.spec()?.url)?;
    let (username, password) = image_registry_auth_info(registry)?;
    let entry = if username.is_empty() && password.is_empty() {
        json!({})
    } else {
        json!({
            "username": username,
            "password": password,
            "auth": STANDARD.encode(format!("{username}:{password}")),
        })
    };
    serde_json::to_string(&json!({ "auths": { host: entry } }))
        .map_err(|e| Error::StdError(StdError::JsonSerializationError(e)))
}

/// Credentials for logging a node's docker daemon into the registry.
#[derive(Clone, PartialEq, Eq)]
pub struct RegistryLogin {
    pub host: String,
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for RegistryLogin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryLogin")
            .field("host", &self.host)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

impl RegistryLogin {
    /// The login command. The password is read from stdin and never appears in the command line.
    pub fn command(&self) -> String {
        format!(
            "docker login {} -u {} --password-stdin",
            crate::connector::shell_quote(&self.host),
            crate::connector::shell_quote(&self.username)
        )
    }
}

/// Login for `registry`, if pulling from it needs credentials.
pub fn registry_login(registry: &ImageRegistry) -> Result<Option<RegistryLogin>> {
    let host = registry_host(&registry.spec()?.url)?;
    let (username, password) = image_registry_auth_info(registry)?;
    if password.is_empty() {
        return Ok(None);
    }
    Ok(Some(RegistryLogin {
        host,
        username,
        password,
    }))
}
