use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info};

use crate::api::v1::{Cluster, ClusterPhase, ClusterStatus, Metadata, NodeProvisionRecord};
use crate::storage::Storage;
use crate::util::errors::Result;

/// Per-pass mirror of a cluster's status and annotations.
///
/// Reconcilers mutate the mirror and persist it once the remote action it
/// describes has returned. Storage replaces `status` and `metadata` as whole
/// documents, so every write carries the full mirror.
pub struct ClusterStatusManager {
    storage: Arc<dyn Storage>,
    id: i64,
    key: String,
    metadata: Metadata,
    status: ClusterStatus,
}

impl ClusterStatusManager {
    pub fn new(storage: Arc<dyn Storage>, cluster: &Cluster) -> Self {
        Self {
            storage,
            id: cluster.id,
            key: cluster.key(),
            metadata: cluster.metadata.clone().unwrap_or_default(),
            status: cluster.status_or_default(),
        }
    }

    pub fn status(&self) -> &ClusterStatus {
        &self.status
    }

    pub fn status_mut(&mut self) -> &mut ClusterStatus {
        &mut self.status
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.metadata.annotations.get(key).map(String::as_str)
    }

    /// Write the status mirror.
    pub async fn persist(&self) -> Result<()> {
        let update = Cluster {
            status: Some(self.status.clone()),
            ..Default::default()
        };
        self.storage.update_cluster(self.id, &update).await?;
        debug!("persisted status of {}", self.key);
        Ok(())
    }

    /// Set one metadata annotation and write the metadata document.
    pub async fn set_annotation(&mut self, key: &str, value: String) -> Result<()> {
        if self.annotation(key) == Some(value.as_str()) {
            return Ok(());
        }
        self.metadata.annotations.insert(key.to_string(), value);
        let update = Cluster {
            metadata: Some(self.metadata.clone()),
            ..Default::default()
        };
        self.storage.update_cluster(self.id, &update).await?;
        info!("updated annotation {} of {}", key, self.key);
        Ok(())
    }

    /// Updates the phase and error message, stamping the transition time on change.
    pub async fn update_phase(&mut self, phase: ClusterPhase, error_message: String) -> Result<()> {
        if self.status.phase != Some(phase) {
            info!("cluster {} phase {:?} -> {}", self.key, self.status.phase, phase);
            self.status.phase = Some(phase);
            self.status.last_transition_time = Some(Utc::now());
        }
        self.status.error_message = error_message;
        self.persist().await
    }

    /// Mark the phase Initializing when the cluster has never been looked at.
    pub async fn ensure_phase(&mut self) -> Result<()> {
        if self.status.phase.is_none() {
            self.update_phase(ClusterPhase::Initializing, String::new()).await?;
        }
        Ok(())
    }

    /// Record that the engine answered a metadata request. Written once per lifetime.
    pub async fn mark_initialized(&mut self) -> Result<()> {
        if self.status.initialized {
            return Ok(());
        }
        self.status.initialized = true;
        info!("cluster {} initialized", self.key);
        self.persist().await
    }

    pub async fn set_provision_record(&mut self, ip: &str, record: NodeProvisionRecord) -> Result<()> {
        self.status.node_provision_status.insert(ip.to_string(), record);
        self.persist().await
    }

    pub fn provision_record(&self, ip: &str) -> Option<&NodeProvisionRecord> {
        self.status.node_provision_status.get(ip)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{ssh_cluster, FakeStorage};

    #[tokio::test]
    async fn test_phase_transition_is_persisted_once() {
        let storage = Arc::new(FakeStorage::default());
        let cluster = ssh_cluster("c1", "10.0.0.9", &[]);
        storage.add_cluster(cluster.clone());
        let mut manager = ClusterStatusManager::new(storage.clone(), &cluster);

        manager.ensure_phase().await.unwrap();
        let stored = storage.cluster(cluster.id).unwrap().status.unwrap();
        assert_eq!(stored.phase, Some(ClusterPhase::Initializing));
        let first_transition = stored.last_transition_time;

        manager.ensure_phase().await.unwrap();
        manager
            .update_phase(ClusterPhase::Initializing, "waiting".into())
            .await
            .unwrap();
        let stored = storage.cluster(cluster.id).unwrap().status.unwrap();
        assert_eq!(stored.last_transition_time, first_transition);
        assert_eq!(stored.error_message, "waiting");
    }

    #[tokio::test]
    async fn test_annotations_keep_existing_metadata() {
        let storage = Arc::new(FakeStorage::default());
        let cluster = ssh_cluster("c1", "10.0.0.9", &[]);
        storage.add_cluster(cluster.clone());
        let mut manager = ClusterStatusManager::new(storage.clone(), &cluster);

        manager
            .set_annotation("metrics.last-applied-config", "[]".into())
            .await
            .unwrap();
        let stored = storage.cluster(cluster.id).unwrap();
        let metadata = stored.metadata.unwrap();
        assert_eq!(metadata.name, "c1");
        assert_eq!(metadata.annotations["metrics.last-applied-config"], "[]");
        assert_eq!(storage.update_count(), 1);

        // unchanged values are not written again
        manager
            .set_annotation("metrics.last-applied-config", "[]".into())
            .await
            .unwrap();
        assert_eq!(storage.update_count(), 1);
    }
}
