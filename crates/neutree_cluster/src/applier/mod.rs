//! Declarative applier.
//!
//! Diffs a freshly rendered object list against the last-applied snapshot and
//! the live object tree, then creates, patches and deletes until the remote
//! side matches. Every pass is idempotent: a second run over unchanged input
//! reports zero changes.

use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::util::errors::Result;
use crate::util::metrics::Metrics;

pub mod object;
pub mod store;

pub use object::{
    decode_snapshot, encode_snapshot, is_cluster_scoped, DesiredObject, ObjectKey, MANAGED_BY_LABEL,
    MANAGED_BY_VALUE, SKIP_PATCH_ANNOTATION,
};
pub use store::{KubeObjectStore, ObjectStore};

/// Annotation key of the snapshot persisted for a sub-component.
pub fn last_applied_annotation(tag: &str) -> String {
    format!("{tag}.last-applied-config")
}

/// Maps the labels of a desired object to the labels written remotely.
pub type LabelMutator = Arc<dyn Fn(&BTreeMap<String, String>) -> BTreeMap<String, String> + Send + Sync>;

/// Stamps `managed-by=neutree` over whatever the caller provided.
pub fn managed_by_mutator() -> LabelMutator {
    Arc::new(|labels| {
        let mut labels = labels.clone();
        labels.insert(MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string());
        labels
    })
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    /// Absent from the snapshot
    Create,
    /// Spec hash differs from the snapshot
    Patch,
    /// Unchanged since the snapshot, checked against the live object for drift
    Verify,
}

#[derive(Clone, Debug)]
pub struct PlannedChange {
    pub action: Action,
    pub object: DesiredObject,
}

#[derive(Clone, Debug, Default)]
pub struct Plan {
    pub apply: Vec<PlannedChange>,
    pub delete: Vec<ObjectKey>,
}

impl Plan {
    pub fn count(&self, action: Action) -> usize {
        self.apply.iter().filter(|c| c.action == action).count()
    }
}

/// Outcome of [`Applier::apply`].
#[derive(Clone, Debug, Default)]
pub struct Applied {
    /// Objects created, patched or deleted
    pub changed: usize,
    /// Previously applied objects whose delete failed
    pub undeleted: Vec<DesiredObject>,
}

pub struct Applier {
    store: Arc<dyn ObjectStore>,
    namespace: String,
    objects: Vec<DesiredObject>,
    last_applied: Vec<DesiredObject>,
    label_mutator: LabelMutator,
    metrics: Option<Metrics>,
}

impl Applier {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        namespace: &str,
        objects: Vec<DesiredObject>,
        last_applied: Vec<DesiredObject>,
    ) -> Self {
        let fill = |object| fill_namespace(object, namespace);
        Self {
            store,
            namespace: namespace.to_string(),
            objects: object::dedupe(objects.into_iter().map(fill).collect()),
            last_applied: object::dedupe(last_applied.into_iter().map(fill).collect()),
            label_mutator: managed_by_mutator(),
            metrics: None,
        }
    }

    /// Replace the label mutator. `managed-by` is stamped regardless.
    pub fn with_label_mutator(mut self, mutator: LabelMutator) -> Self {
        self.label_mutator = mutator;
        self
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// The desired objects as they will be persisted in the next snapshot.
    pub fn objects(&self) -> &[DesiredObject] {
        &self.objects
    }

    /// Snapshot to persist after `applied`. Objects whose delete failed stay
    /// in it so that the next pass deletes them again.
    pub fn snapshot(&self, applied: &Applied) -> Result<String> {
        let mut objects = self.objects.clone();
        objects.extend(applied.undeleted.iter().cloned());
        encode_snapshot(&objects)
    }

    pub fn plan(&self) -> Plan {
        if self.last_applied.is_empty() {
            return Plan {
                apply: self
                    .objects
                    .iter()
                    .map(|o| PlannedChange {
                        action: Action::Create,
                        object: o.clone(),
                    })
                    .collect(),
                delete: Vec::new(),
            };
        }

        let previous: BTreeMap<String, &DesiredObject> = self
            .last_applied
            .iter()
            .map(|o| (o.identity_key(), o))
            .collect();

        let apply = self
            .objects
            .iter()
            .map(|o| {
                let action = match previous.get(&o.identity_key()) {
                    None => Action::Create,
                    Some(prev) if prev.spec_hash() != o.spec_hash() => Action::Patch,
                    Some(_) => Action::Verify,
                };
                PlannedChange {
                    action,
                    object: o.clone(),
                }
            })
            .collect();

        let desired: BTreeSet<String> = self.objects.iter().map(|o| o.identity_key()).collect();
        let delete = self
            .last_applied
            .iter()
            .filter(|o| !desired.contains(&o.identity_key()))
            .map(|o| o.key())
            .collect();

        Plan { apply, delete }
    }

    fn count_change(&self, action: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.object_changes.with_label_values(&[action]).inc();
        }
    }

    /// Converge the remote side. A failed delete is logged and reported, not returned as an error.
    pub async fn apply(&self) -> Result<Applied> {
        let plan = self.plan();
        debug!(
            "plan for {}: {} create, {} patch, {} verify, {} delete",
            self.namespace,
            plan.count(Action::Create),
            plan.count(Action::Patch),
            plan.count(Action::Verify),
            plan.delete.len()
        );

        let mut applied = Applied::default();
        for change in &plan.apply {
            let key = change.object.identity_key();
            let mutated = match change.action {
                Action::Create | Action::Patch => self.create_or_patch(&change.object).await,
                Action::Verify => self.ensure(&change.object).await,
            }
            .map_err(|e| e.with_key(key))?;
            if mutated {
                applied.changed += 1;
            }
        }

        for key in &plan.delete {
            match self.store.delete(key).await {
                Ok(()) => {
                    info!("deleted {}", key);
                    self.count_change("delete");
                    applied.changed += 1;
                }
                Err(e) => {
                    warn!("failed to delete {}: {}", key, e);
                    applied
                        .undeleted
                        .extend(self.last_applied.iter().filter(|o| &o.key() == key).cloned());
                }
            }
        }
        Ok(applied)
    }

    /// Delete everything in the last-applied snapshot. `true` once nothing is left.
    pub async fn delete(&self) -> Result<bool> {
        let mut all_gone = true;
        for object in &self.last_applied {
            let key = object.key();
            let live = self
                .store
                .get(&key)
                .await
                .map_err(|e| e.with_key(key.to_string()))?;
            let Some(live) = live else { continue };
            all_gone = false;
            if live.pointer("/metadata/deletionTimestamp").is_some_and(|t| !t.is_null()) {
                debug!("{} is already terminating", key);
                continue;
            }
            match self.store.delete(&key).await {
                Ok(()) => {
                    info!("deleting {}", key);
                    self.count_change("delete");
                }
                Err(e) => warn!("failed to delete {}: {}", key, e),
            }
        }
        Ok(all_gone)
    }

    fn labelled(&self, object: &DesiredObject) -> DesiredObject {
        let mut labelled = fill_namespace(object.clone(), &self.namespace);
        let mut labels = (self.label_mutator)(&object.labels());
        labels.insert(MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string());
        labelled.set_labels(&labels);
        labelled
    }

    /// Create the object when absent and patch it only when the live object
    /// no longer carries the desired content.
    ///
    /// Returns whether the remote side was written.
    pub async fn ensure(&self, object: &DesiredObject) -> Result<bool> {
        let desired = self.labelled(object);
        match self.store.get(&desired.key()).await? {
            None => {
                info!("{} is missing, recreating", desired.identity_key());
                self.create(&desired).await?;
                Ok(true)
            }
            Some(live) if desired.skip_patch() || object::live_matches(&desired, &live) => Ok(false),
            Some(live) => {
                info!("{} drifted, patching", desired.identity_key());
                self.patch(&desired, &live).await?;
                Ok(true)
            }
        }
    }

    /// Create the object, or merge-patch it when it already exists.
    ///
    /// Returns whether the remote side was written.
    pub async fn create_or_patch(&self, object: &DesiredObject) -> Result<bool> {
        let desired = self.labelled(object);
        match self.store.get(&desired.key()).await? {
            None => {
                self.create(&desired).await?;
                Ok(true)
            }
            Some(_) if desired.skip_patch() => {
                debug!("{} is marked {}, leaving it", desired.identity_key(), SKIP_PATCH_ANNOTATION);
                Ok(false)
            }
            Some(live) => {
                self.patch(&desired, &live).await?;
                Ok(true)
            }
        }
    }

    async fn create(&self, desired: &DesiredObject) -> Result<()> {
        self.store.create(&desired.key(), desired.value()).await?;
        info!("created {}", desired.identity_key());
        self.count_change("create");
        Ok(())
    }

    async fn patch(&self, desired: &DesiredObject, live: &Value) -> Result<()> {
        let patch = merge_patch_body(desired, live);
        self.store.merge_patch(&desired.key(), &patch).await?;
        info!("patched {}", desired.identity_key());
        self.count_change("patch");
        Ok(())
    }
}

fn fill_namespace(mut object: DesiredObject, namespace: &str) -> DesiredObject {
    if object.namespace().is_empty() && !is_cluster_scoped(object.kind()) {
        object.set_namespace(namespace);
    }
    object
}

/// Desired body with live labels and annotations kept, and the live uid and
/// resource version pinned.
fn merge_patch_body(desired: &DesiredObject, live: &Value) -> Value {
    let mut body = desired.value().clone();
    let live_meta = live.get("metadata").cloned().unwrap_or_else(|| json!({}));

    let union = |field: &str| -> Value {
        let mut merged: Map<String, Value> = live_meta
            .get(field)
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        if let Some(ours) = desired.value().pointer(&format!("/metadata/{field}")).and_then(Value::as_object) {
            merged.extend(ours.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        Value::Object(merged)
    };
    let labels = union("labels");
    let annotations = union("annotations");

    if let Some(Value::Object(meta)) = body.get_mut("metadata") {
        meta.insert("labels".into(), labels);
        meta.insert("annotations".into(), annotations);
        for field in ["uid", "resourceVersion"] {
            if let Some(value) = live_meta.get(field) {
                meta.insert(field.into(), value.clone());
            }
        }
    }
    body
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::FakeObjectStore;
    use assert_json_diff::assert_json_include;

    fn cm(name: &str, value: &str) -> DesiredObject {
        DesiredObject::new(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": name, "labels": {"app": "vmagent"}},
            "data": {"value": value},
        }))
        .unwrap()
    }

    fn applier(store: &Arc<FakeObjectStore>, objects: Vec<DesiredObject>, last: Vec<DesiredObject>) -> Applier {
        Applier::new(store.clone(), "ns", objects, last)
    }

    #[tokio::test]
    async fn test_first_apply_creates_everything() {
        let store = Arc::new(FakeObjectStore::default());
        let a = applier(&store, vec![cm("a", "1"), cm("b", "2")], vec![]);
        assert_eq!(a.plan().count(Action::Create), 2);
        assert_eq!(a.apply().await.unwrap().changed, 2);

        let live = store.object(&ObjectKey::new("v1", "ConfigMap", "ns", "a")).unwrap();
        assert_json_include!(
            actual: live,
            expected: json!({"metadata": {"namespace": "ns", "labels": {"app": "vmagent", "managed-by": "neutree"}}})
        );
    }

    #[tokio::test]
    async fn test_second_apply_is_a_noop() {
        let store = Arc::new(FakeObjectStore::default());
        let first = applier(&store, vec![cm("a", "1")], vec![]);
        let applied = first.apply().await.unwrap();
        let snapshot = decode_snapshot(&first.snapshot(&applied).unwrap()).unwrap();

        let second = applier(&store, vec![cm("a", "1")], snapshot);
        assert_eq!(second.plan().count(Action::Verify), 1);
        assert_eq!(second.apply().await.unwrap().changed, 0);
        assert_eq!(store.patch_count(), 0);
    }

    #[tokio::test]
    async fn test_changed_spec_is_patched_and_removed_object_deleted() {
        let store = Arc::new(FakeObjectStore::default());
        let first = applier(&store, vec![cm("a", "1"), cm("b", "2")], vec![]);
        first.apply().await.unwrap();
        let snapshot = first.objects().to_vec();

        let second = applier(&store, vec![cm("a", "changed")], snapshot);
        let plan = second.plan();
        assert_eq!(plan.count(Action::Patch), 1);
        assert_eq!(plan.delete, vec![ObjectKey::new("v1", "ConfigMap", "ns", "b")]);
        assert_eq!(second.apply().await.unwrap().changed, 2);
        assert!(store.object(&ObjectKey::new("v1", "ConfigMap", "ns", "b")).is_none());
        let a = store.object(&ObjectKey::new("v1", "ConfigMap", "ns", "a")).unwrap();
        assert_eq!(a["data"]["value"], "changed");
    }

    #[tokio::test]
    async fn test_failed_delete_stays_in_snapshot() {
        let store = Arc::new(FakeObjectStore::default());
        let first = applier(&store, vec![cm("a", "1"), cm("b", "2")], vec![]);
        first.apply().await.unwrap();
        let snapshot = first.objects().to_vec();

        store.fail_deletes(Some("api server down"));
        let second = applier(&store, vec![cm("a", "changed")], snapshot);
        let applied = second.apply().await.unwrap();
        assert_eq!(applied.changed, 1);
        assert_eq!(applied.undeleted.len(), 1);
        let b = ObjectKey::new("v1", "ConfigMap", "ns", "b");
        assert!(store.object(&b).is_some());

        let persisted = decode_snapshot(&second.snapshot(&applied).unwrap()).unwrap();
        let keys: Vec<ObjectKey> = persisted.iter().map(DesiredObject::key).collect();
        assert_eq!(keys, vec![ObjectKey::new("v1", "ConfigMap", "ns", "a"), b.clone()]);

        store.fail_deletes(None);
        let third = applier(&store, vec![cm("a", "changed")], persisted);
        assert_eq!(third.plan().delete, vec![b.clone()]);
        let applied = third.apply().await.unwrap();
        assert_eq!(applied.changed, 1);
        assert!(applied.undeleted.is_empty());
        assert!(store.object(&b).is_none());
    }

    #[tokio::test]
    async fn test_drift_is_repaired() {
        let store = Arc::new(FakeObjectStore::default());
        let first = applier(&store, vec![cm("a", "1"), cm("b", "2")], vec![]);
        first.apply().await.unwrap();
        let snapshot = first.objects().to_vec();

        store.remove(&ObjectKey::new("v1", "ConfigMap", "ns", "a"));
        store.mutate(&ObjectKey::new("v1", "ConfigMap", "ns", "b"), |o| {
            o["data"]["value"] = json!("tampered");
        });

        let second = applier(&store, vec![cm("a", "1"), cm("b", "2")], snapshot);
        assert_eq!(second.apply().await.unwrap().changed, 2);
        let b = store.object(&ObjectKey::new("v1", "ConfigMap", "ns", "b")).unwrap();
        assert_eq!(b["data"]["value"], "2");
    }

    #[tokio::test]
    async fn test_patch_keeps_live_metadata() {
        let store = Arc::new(FakeObjectStore::default());
        applier(&store, vec![cm("a", "1")], vec![]).apply().await.unwrap();
        store.mutate(&ObjectKey::new("v1", "ConfigMap", "ns", "a"), |o| {
            o["metadata"]["labels"]["team"] = json!("ml");
            o["metadata"]["annotations"] = json!({"note": "keep"});
        });

        let a = applier(&store, vec![cm("a", "2")], vec![]);
        assert!(a.create_or_patch(&cm("a", "2")).await.unwrap());
        let live = store.object(&ObjectKey::new("v1", "ConfigMap", "ns", "a")).unwrap();
        assert_json_include!(
            actual: live,
            expected: json!({
                "metadata": {
                    "labels": {"team": "ml", "app": "vmagent", "managed-by": "neutree"},
                    "annotations": {"note": "keep"}
                },
                "data": {"value": "2"}
            })
        );
    }

    #[tokio::test]
    async fn test_skip_patch_objects_are_only_created() {
        let store = Arc::new(FakeObjectStore::default());
        let scrape = DesiredObject::new(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": "scrape", "annotations": {"skip-patch": "true"}},
            "data": {}
        }))
        .unwrap();
        let a = applier(&store, vec![scrape.clone()], vec![]);
        assert_eq!(a.apply().await.unwrap().changed, 1);
        store.mutate(&ObjectKey::new("v1", "ConfigMap", "ns", "scrape"), |o| {
            o["data"] = json!({"targets.yml": "- targets: []"});
        });
        assert!(!a.create_or_patch(&scrape).await.unwrap());
        let again = applier(&store, vec![scrape], a.objects().to_vec());
        assert_eq!(again.apply().await.unwrap().changed, 0);
    }

    #[tokio::test]
    async fn test_label_mutator_cannot_drop_managed_by() {
        let store = Arc::new(FakeObjectStore::default());
        let a = applier(&store, vec![cm("a", "1")], vec![]).with_label_mutator(Arc::new(|_| BTreeMap::new()));
        a.apply().await.unwrap();
        let live = store.object(&ObjectKey::new("v1", "ConfigMap", "ns", "a")).unwrap();
        assert_eq!(live["metadata"]["labels"]["managed-by"], "neutree");
    }

    #[tokio::test]
    async fn test_create_error_carries_identity_key() {
        let store = Arc::new(FakeObjectStore::default());
        store.fail_writes("api server down");
        let err = applier(&store, vec![cm("a", "1")], vec![]).apply().await.unwrap_err();
        assert!(err.user_message().starts_with("v1/ConfigMap/ns/a: "));
    }

    #[tokio::test]
    async fn test_delete_reports_progress() {
        let store = Arc::new(FakeObjectStore::default());
        let first = applier(&store, vec![cm("a", "1"), cm("b", "2")], vec![]);
        first.apply().await.unwrap();
        let snapshot = first.objects().to_vec();

        store.terminate_on_delete(true);
        let deleter = applier(&store, vec![], snapshot.clone());
        assert!(!deleter.delete().await.unwrap());
        assert_eq!(store.delete_count(), 2);
        // terminating objects are not deleted twice
        assert!(!deleter.delete().await.unwrap());
        assert_eq!(store.delete_count(), 2);

        store.finish_terminating();
        assert!(deleter.delete().await.unwrap());
    }
}
