//! Per-pass working directory of an SSH cluster and the launcher bootstrap file.

use serde::Serialize;
use serde_json::json;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::util::errors::{Error, Result, StdError};

const KEY_FILE: &str = "ssh_private_key";
const BOOTSTRAP_FILE: &str = "bootstrap.yaml";

fn io_error(e: std::io::Error) -> Error {
    Error::StdError(StdError::IoError(e))
}

async fn write_file(path: &Path, contents: &[u8], mode: u32) -> Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(mode)
        .open(path)
        .await
        .map_err(io_error)?;
    file.write_all(contents).await.map_err(io_error)?;
    file.flush().await.map_err(io_error)
}

/// `${TMPDIR}/ray-cluster-<rand6>/<cluster>/`, removed with everything in it on drop.
pub struct ScratchDir {
    dir: PathBuf,
    cluster_name: String,
    // dropped last, removing the tree
    _root: TempDir,
}

impl ScratchDir {
    /// Create the directory holding the private key and a launcher state
    /// file that already knows the head node.
    pub async fn create(cluster_name: &str, private_key: &[u8], head_ip: &str) -> Result<Self> {
        let root = tempfile::Builder::new()
            .prefix("ray-cluster-")
            .rand_bytes(6)
            .tempdir()
            .map_err(io_error)?;
        let scratch = Self {
            dir: root.path().join(cluster_name),
            cluster_name: cluster_name.to_string(),
            _root: root,
        };
        fs::create_dir_all(scratch.dir.join("ray")).await.map_err(io_error)?;
        write_file(&scratch.key_path(), private_key, 0o600).await?;
        scratch.seed_state(head_ip).await?;
        debug!("created scratch directory {}", scratch.dir.display());
        Ok(scratch)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn key_path(&self) -> PathBuf {
        self.dir.join(KEY_FILE)
    }

    pub fn bootstrap_path(&self) -> PathBuf {
        self.dir.join(BOOTSTRAP_FILE)
    }

    /// Node state of the launcher's local provider, read from `$TMPDIR/ray/`.
    pub fn state_path(&self) -> PathBuf {
        self.dir.join("ray").join(format!("cluster-{}.state", self.cluster_name))
    }

    async fn seed_state(&self, head_ip: &str) -> Result<()> {
        let state = json!({
            head_ip: {
                "tags": {
                    "ray-node-kind": "head",
                    "ray-node-name": format!("ray-{}-head", self.cluster_name),
                    "ray-node-status": "up-to-date",
                    "ray-user-node-type": "local.cluster.node"
                },
                "state": "running",
                "external_ip": head_ip
            }
        });
        let raw = serde_json::to_vec(&state).map_err(|e| Error::StdError(StdError::JsonSerializationError(e)))?;
        write_file(&self.state_path(), &raw, 0o644).await
    }

    pub async fn write_bootstrap(&self, bootstrap: &BootstrapConfig) -> Result<PathBuf> {
        let raw = serde_yaml::to_string(bootstrap).map_err(|e| Error::StdError(StdError::YamlSerializationError(e)))?;
        let path = self.bootstrap_path();
        write_file(&path, raw.as_bytes(), 0o644).await?;
        Ok(path)
    }
}

/// Cluster launcher configuration for a static head on the local provider.
#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct BootstrapConfig {
    pub cluster_name: String,
    pub provider: BootstrapProvider,
    pub auth: BootstrapAuth,
    pub docker: BootstrapDocker,
    pub initialization_commands: Vec<String>,
    pub head_start_ray_commands: Vec<String>,
    pub worker_start_ray_commands: Vec<String>,
}

#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct BootstrapProvider {
    #[serde(rename = "type")]
    pub type_: String,
    pub head_ip: String,
    /// Workers are started by the reconciler, not the launcher
    pub worker_ips: Vec<String>,
}

#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct BootstrapAuth {
    pub ssh_user: String,
    pub ssh_private_key: String,
}

#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct BootstrapDocker {
    pub image: String,
    pub container_name: String,
    pub pull_before_run: bool,
    pub run_options: Vec<String>,
}
