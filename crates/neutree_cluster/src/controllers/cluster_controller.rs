use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio::time::{Duration, Instant};
use tracing::*;

use super::{provider_reconciler, Context};
use crate::api::v1::{Cluster, ClusterPhase};
use crate::config::ControllerConfig;
use crate::storage::Storage;
use crate::util::cluster_status::ClusterStatusManager;
use crate::util::errors::{Error, Result, NOT_READY_REQUEUE};
use crate::util::metrics::Metrics;

/// Delay before a failed pass is retried.
pub const FAILURE_REQUEUE: Duration = Duration::from_secs(60);

/// What the driver does with a cluster after a pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    /// Look at the cluster again after the duration
    Requeue(Duration),
    /// The cluster is gone; forget it
    Done,
}

impl Action {
    pub fn requeue(duration: Duration) -> Self {
        Action::Requeue(duration)
    }
}

/// State shared between the controller and the web server
#[derive(Clone, Default)]
pub struct State {
    /// Diagnostics populated by the reconciler
    diagnostics: Arc<RwLock<Diagnostics>>,
    /// Metrics registry
    registry: prometheus::Registry,
}

/// State wrapper around the controller outputs for the web server
impl State {
    /// Metrics getter
    pub fn metrics(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    /// State getter
    pub async fn diagnostics(&self) -> Diagnostics {
        self.diagnostics.read().await.clone()
    }

    // Create a Controller Context that can update State
    pub fn to_context(
        &self,
        storage: Arc<dyn Storage>,
        config: ControllerConfig,
    ) -> Result<Context, prometheus::Error> {
        let metrics = Metrics::new()?.register(&self.registry)?;
        Ok(Context::new(storage, config, metrics, self.diagnostics.clone()))
    }
}

/// Diagnostics to be exposed by the web server
#[derive(Clone, Debug, Serialize)]
pub struct Diagnostics {
    pub last_event: DateTime<Utc>,
    /// Clusters seen by the last listing
    pub clusters: usize,
    /// Last error message per cluster key
    pub failures: BTreeMap<String, String>,
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self {
            last_event: Utc::now(),
            clusters: 0,
            failures: BTreeMap::new(),
        }
    }
}

fn provider(cluster: &Cluster) -> String {
    cluster.spec.as_ref().map(|s| s.type_.clone()).unwrap_or_default()
}

/// One converge or converge-delete pass over `cluster`.
#[instrument(skip(cluster, ctx), fields(cluster = %cluster.name_any(), workspace = %cluster.workspace(), provider = %provider(&cluster)))]
pub async fn reconcile(cluster: Arc<Cluster>, ctx: Arc<Context>) -> Result<Action> {
    let _timer = ctx.metrics.count_and_measure(&provider(&cluster));
    ctx.diagnostics.write().await.last_event = Utc::now();

    let mut status = ClusterStatusManager::new(ctx.storage.clone(), &cluster);
    if cluster.is_deleting() {
        info!("deleting cluster {}", cluster.key());
        return cleanup(&cluster, &mut status, &ctx).await;
    }

    info!("reconciling cluster {}", cluster.key());
    status.ensure_phase().await?;
    let result = match provider_reconciler(&cluster) {
        Ok(reconciler) => reconciler.reconcile(&cluster, &mut status, &ctx).await,
        Err(e) => Err(e),
    };
    match result {
        Ok(()) => {
            status.update_phase(ClusterPhase::Running, String::new()).await?;
            ctx.diagnostics.write().await.failures.remove(&cluster.key());
            Ok(Action::requeue(ctx.config.requeue_interval))
        }
        Err(e) => settle(&cluster, &mut status, &ctx, e).await,
    }
}

async fn cleanup(cluster: &Cluster, status: &mut ClusterStatusManager, ctx: &Context) -> Result<Action> {
    let result = match provider_reconciler(cluster) {
        Ok(reconciler) => reconciler.reconcile_delete(cluster, status, ctx).await,
        Err(e) => {
            // nothing can have been provisioned from a config that never parsed
            warn!("deleting {} without teardown: {}", cluster.key(), e);
            Ok(())
        }
    };
    match result {
        Ok(()) => {
            ctx.storage.delete_cluster(cluster.id).await?;
            ctx.diagnostics.write().await.failures.remove(&cluster.key());
            info!("cluster {} deleted", cluster.key());
            Ok(Action::Done)
        }
        Err(e) => settle(cluster, status, ctx, e).await,
    }
}

/// Retryable errors keep the phase and requeue; anything else marks the cluster Failed.
async fn settle(
    cluster: &Cluster,
    status: &mut ClusterStatusManager,
    ctx: &Context,
    error: Error,
) -> Result<Action> {
    if error.is_retryable() {
        let duration = match &error {
            Error::ErrorWithRequeue(e) => e.duration,
            Error::StdError(_) => NOT_READY_REQUEUE,
        };
        info!("cluster {} not converged yet: {}", cluster.key(), error.user_message());
        let phase = status.status().phase.unwrap_or(ClusterPhase::Initializing);
        status.update_phase(phase, error.user_message()).await?;
        return Ok(Action::requeue(duration));
    }

    if let Err(e) = status.update_phase(ClusterPhase::Failed, error.user_message()).await {
        warn!("failed to record failure of {}: {}", cluster.key(), e);
    }
    Err(error)
}

pub fn error_policy(cluster: &Cluster, error: &Error, ctx: &Context) -> Action {
    warn!("reconcile failed: {:?}", error);
    ctx.metrics.reconcile_failure(cluster, error);
    Action::requeue(FAILURE_REQUEUE)
}

/// Bookkeeping of the driver: clusters being reconciled and when each is due next.
#[derive(Default)]
struct Schedule {
    in_flight: BTreeSet<i64>,
    due: BTreeMap<i64, Instant>,
}

impl Schedule {
    /// Claim `id` when it is due and not already being reconciled.
    fn claim(&mut self, id: i64, now: Instant) -> bool {
        if self.in_flight.contains(&id) || self.due.get(&id).is_some_and(|due| *due > now) {
            return false;
        }
        self.in_flight.insert(id);
        true
    }

    fn release(&mut self, id: i64, action: Action, now: Instant) {
        self.in_flight.remove(&id);
        match action {
            Action::Requeue(duration) => {
                self.due.insert(id, now + duration);
            }
            Action::Done => {
                self.due.remove(&id);
            }
        }
    }

    fn retain(&mut self, listed: &BTreeSet<i64>) {
        self.due.retain(|id, _| listed.contains(id));
    }
}

async fn reconcile_one(cluster: Cluster, ctx: Arc<Context>) -> Action {
    let cluster = Arc::new(cluster);
    match reconcile(cluster.clone(), ctx.clone()).await {
        Ok(action) => action,
        Err(e) => {
            ctx.diagnostics
                .write()
                .await
                .failures
                .insert(cluster.key(), e.user_message());
            error_policy(&cluster, &e, &ctx)
        }
    }
}

/// Poll storage every `interval` and reconcile each cluster that is due,
/// never running two passes of the same cluster at once.
pub async fn run(ctx: Arc<Context>, interval: Duration) {
    let schedule = Arc::new(Mutex::new(Schedule::default()));
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        let clusters = match ctx.storage.list_clusters(&[]).await {
            Ok(clusters) => clusters,
            Err(e) => {
                warn!("failed to list clusters: {}", e);
                continue;
            }
        };
        ctx.diagnostics.write().await.clusters = clusters.len();

        let listed: BTreeSet<i64> = clusters.iter().map(|c| c.id).collect();
        schedule.lock().await.retain(&listed);

        for cluster in clusters {
            let id = cluster.id;
            if !schedule.lock().await.claim(id, Instant::now()) {
                continue;
            }
            let ctx = ctx.clone();
            let schedule = schedule.clone();
            tokio::spawn(async move {
                let action = reconcile_one(cluster, ctx).await;
                debug!("cluster {} next: {:?}", id, action);
                schedule.lock().await.release(id, action, Instant::now());
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::v1::ImageRegistryPhase;
    use crate::fixtures::{
        healthy_host, registry, ssh_cluster, FakeLauncher, FakeRunnerFactory, FakeStorage, FakeWorkloadClient,
        FakeWorkloadFactory,
    };
    use crate::util::errors::StdError;

    fn context(storage: Arc<FakeStorage>, workload: Arc<FakeWorkloadClient>) -> Arc<Context> {
        let config = ControllerConfig {
            head_health_retry_interval: Duration::from_millis(1),
            ..Default::default()
        };
        Arc::new(
            Context::new(storage, config, Metrics::new().unwrap(), Default::default())
                .with_runners(Arc::new(FakeRunnerFactory::new(healthy_host)))
                .with_launcher(Arc::new(FakeLauncher::bringing_up(workload.clone())))
                .with_workload(Arc::new(FakeWorkloadFactory::new(workload))),
        )
    }

    #[tokio::test]
    async fn test_missing_registry_fails_the_cluster() {
        let storage = Arc::new(FakeStorage::default());
        let cluster = ssh_cluster("c1", "10.0.0.9", &[]);
        storage.add_cluster(cluster.clone());
        let ctx = context(storage.clone(), Arc::new(FakeWorkloadClient::default()));

        let err = reconcile(Arc::new(cluster.clone()), ctx.clone()).await.unwrap_err();
        assert!(matches!(err.inner(), StdError::DependencyNotReady(_)));

        let status = storage.cluster(cluster.id).unwrap().status.unwrap();
        assert_eq!(status.phase, Some(ClusterPhase::Failed));
        assert!(status.error_message.contains("image registry default/reg not found"));

        assert_eq!(error_policy(&cluster, &err, &ctx), Action::Requeue(FAILURE_REQUEUE));
        assert_eq!(
            ctx.metrics
                .failures
                .with_label_values(&["default/c1", "dependencynotready"])
                .get(),
            1
        );
    }

    #[tokio::test]
    async fn test_converged_cluster_is_running() {
        let storage = Arc::new(FakeStorage::default());
        storage.add_registry(registry("reg", "default", true));
        let cluster = ssh_cluster("c1", "10.0.0.9", &[]);
        storage.add_cluster(cluster.clone());
        let ctx = context(storage.clone(), Arc::new(FakeWorkloadClient::default()));

        let action = reconcile(Arc::new(cluster.clone()), ctx.clone()).await.unwrap();
        assert_eq!(action, Action::Requeue(ctx.config.requeue_interval));
        let status = storage.cluster(cluster.id).unwrap().status.unwrap();
        assert_eq!(status.phase, Some(ClusterPhase::Running));
        assert!(status.error_message.is_empty());
        assert!(status.last_transition_time.is_some());
    }

    #[tokio::test]
    async fn test_not_ready_keeps_phase() {
        let storage = Arc::new(FakeStorage::default());
        let mut reg = registry("reg", "default", true);
        storage.add_registry(reg.clone());
        let cluster = ssh_cluster("c1", "10.0.0.9", &[]);
        storage.add_cluster(cluster.clone());
        let ctx = context(storage.clone(), Arc::new(FakeWorkloadClient::default()));
        reconcile(Arc::new(cluster.clone()), ctx.clone()).await.unwrap();

        // a head that was just brought up and does not answer yet
        let workload = Arc::new(FakeWorkloadClient::default());
        let ctx = context(storage.clone(), workload);
        let stored = storage.cluster(cluster.id).unwrap();
        let action = reconcile(Arc::new(stored), ctx).await.unwrap();
        assert_eq!(
            action,
            Action::Requeue(ControllerConfig::default().provisioning_wait_window)
        );
        let status = storage.cluster(cluster.id).unwrap().status.unwrap();
        assert_eq!(status.phase, Some(ClusterPhase::Running));
        assert!(status.error_message.starts_with("JustProvisioned: "));

        // registry problems are not retried silently
        if let Some(status) = reg.status.as_mut() {
            status.phase = Some(ImageRegistryPhase::Failed);
        }
        let storage = Arc::new(FakeStorage::default());
        storage.add_registry(reg);
        storage.add_cluster(cluster.clone());
        let ctx = context(storage.clone(), Arc::new(FakeWorkloadClient::default()));
        assert!(reconcile(Arc::new(cluster.clone()), ctx).await.is_err());
    }

    #[tokio::test]
    async fn test_deleted_cluster_is_removed_from_storage() {
        let storage = Arc::new(FakeStorage::default());
        storage.add_registry(registry("reg", "default", true));
        let mut cluster = ssh_cluster("c1", "10.0.0.9", &[]);
        if let Some(metadata) = cluster.metadata.as_mut() {
            metadata.deletion_timestamp = Some("2026-01-01T00:00:00Z".into());
        }
        storage.add_cluster(cluster.clone());
        let launcher = Arc::new(FakeLauncher::default());
        let ctx = Arc::new(
            Context::new(
                storage.clone(),
                ControllerConfig::default(),
                Metrics::new().unwrap(),
                Default::default(),
            )
            .with_runners(Arc::new(FakeRunnerFactory::new(healthy_host)))
            .with_launcher(launcher.clone())
            .with_workload(Arc::new(FakeWorkloadFactory::new(Arc::new(FakeWorkloadClient::default())))),
        );

        assert_eq!(reconcile(Arc::new(cluster.clone()), ctx).await.unwrap(), Action::Done);
        assert!(storage.cluster(cluster.id).is_none());
        assert_eq!(launcher.downs().len(), 1);
    }

    #[tokio::test]
    async fn test_unparseable_cluster_is_deleted_without_teardown() {
        let storage = Arc::new(FakeStorage::default());
        let mut cluster = ssh_cluster("c1", "10.0.0.9", &[]);
        if let Some(spec) = cluster.spec.as_mut() {
            spec.config = Some(serde_json::json!({"provider": 3}));
        }
        if let Some(metadata) = cluster.metadata.as_mut() {
            metadata.deletion_timestamp = Some("2026-01-01T00:00:00Z".into());
        }
        storage.add_cluster(cluster.clone());
        let ctx = context(storage.clone(), Arc::new(FakeWorkloadClient::default()));

        assert_eq!(reconcile(Arc::new(cluster.clone()), ctx).await.unwrap(), Action::Done);
        assert!(storage.cluster(cluster.id).is_none());
    }

    #[test]
    fn test_schedule_never_runs_a_cluster_twice() {
        let mut schedule = Schedule::default();
        let now = Instant::now();
        assert!(schedule.claim(1, now));
        assert!(!schedule.claim(1, now));

        schedule.release(1, Action::requeue(Duration::from_secs(30)), now);
        assert!(!schedule.claim(1, now + Duration::from_secs(10)));
        assert!(schedule.claim(1, now + Duration::from_secs(30)));

        schedule.release(1, Action::Done, now);
        assert!(schedule.claim(1, now));

        schedule.release(2, Action::requeue(Duration::from_secs(30)), now);
        schedule.retain(&BTreeSet::from([1]));
        assert!(schedule.claim(2, now));
    }

    #[tokio::test]
    async fn test_state_exposes_metrics_and_diagnostics() {
        let state = State::default();
        let ctx = state
            .to_context(Arc::new(FakeStorage::default()), ControllerConfig::default())
            .unwrap();
        ctx.diagnostics.write().await.clusters = 3;
        assert_eq!(state.diagnostics().await.clusters, 3);
        ctx.metrics.reconciliations.inc();
        assert!(state
            .metrics()
            .iter()
            .any(|family| family.get_name() == "reconciliations_total"));
    }
}
