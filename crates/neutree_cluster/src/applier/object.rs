//! Schemaless desired objects, their identity and spec hash.

use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::fmt;

use crate::util::errors::{Error, Result, StdError};
use crate::util::hash::sha256_hex;

pub const MANAGED_BY_LABEL: &str = "managed-by";
pub const MANAGED_BY_VALUE: &str = "neutree";
pub const SKIP_PATCH_ANNOTATION: &str = "skip-patch";

/// Kinds that live outside any namespace.
const CLUSTER_SCOPED_KINDS: &[&str] = &[
    "Namespace",
    "Node",
    "PersistentVolume",
    "ClusterRole",
    "ClusterRoleBinding",
    "StorageClass",
    "PriorityClass",
    "CustomResourceDefinition",
    "MutatingWebhookConfiguration",
    "ValidatingWebhookConfiguration",
];

pub fn is_cluster_scoped(kind: &str) -> bool {
    CLUSTER_SCOPED_KINDS.contains(&kind)
}

/// Identity of a remote object, `apiVersion/kind/namespace/name`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectKey {
    pub api_version: String,
    pub kind: String,
    /// Empty for cluster scoped kinds
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(api_version: &str, kind: &str, namespace: &str, name: &str) -> Self {
        Self {
            api_version: api_version.to_string(),
            kind: kind.to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    /// `(group, version)` of the api version, the core group being empty.
    pub fn group_version(&self) -> (&str, &str) {
        match self.api_version.split_once('/') {
            Some((group, version)) => (group, version),
            None => ("", self.api_version.as_str()),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.api_version, self.kind, self.namespace, self.name
        )
    }
}

/// A rendered remote object. Only its identity fields are interpreted.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(transparent)]
pub struct DesiredObject(Value);

impl DesiredObject {
    /// Wrap a rendered record. It must be a JSON object with apiVersion, kind and a name.
    pub fn new(value: Value) -> Result<Self> {
        let object = DesiredObject(value);
        if !object.0.is_object() {
            return Err(StdError::Fatal("desired object is not a JSON object".into()).into());
        }
        if object.api_version().is_empty() || object.kind().is_empty() || object.name().is_empty() {
            return Err(StdError::Fatal(format!(
                "desired object {} lacks apiVersion, kind or name",
                object.0
            ))
            .into());
        }
        Ok(object)
    }

    /// Serialize a typed object, e.g. a `k8s_openapi` resource.
    pub fn from_typed<T: Serialize>(typed: &T) -> Result<Self> {
        let value = serde_json::to_value(typed)
            .map_err(|e| Error::StdError(StdError::JsonSerializationError(e)))?;
        Self::new(value)
    }

    fn str_at(&self, pointer: &str) -> &str {
        self.0.pointer(pointer).and_then(Value::as_str).unwrap_or_default()
    }

    pub fn api_version(&self) -> &str {
        self.str_at("/apiVersion")
    }

    pub fn kind(&self) -> &str {
        self.str_at("/kind")
    }

    pub fn name(&self) -> &str {
        self.str_at("/metadata/name")
    }

    pub fn namespace(&self) -> &str {
        self.str_at("/metadata/namespace")
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(self.api_version(), self.kind(), self.namespace(), self.name())
    }

    pub fn identity_key(&self) -> String {
        self.key().to_string()
    }

    fn string_map(&self, field: &str) -> BTreeMap<String, String> {
        self.0
            .pointer(&format!("/metadata/{field}"))
            .and_then(Value::as_object)
            .map(|m| {
                m.iter()
                    .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn labels(&self) -> BTreeMap<String, String> {
        self.string_map("labels")
    }

    pub fn annotations(&self) -> BTreeMap<String, String> {
        self.string_map("annotations")
    }

    pub fn skip_patch(&self) -> bool {
        self.annotations()
            .get(SKIP_PATCH_ANNOTATION)
            .is_some_and(|v| v == "true")
    }

    fn set_metadata_field(&mut self, field: &str, value: Value) {
        if let Value::Object(root) = &mut self.0 {
            let metadata = root
                .entry("metadata")
                .or_insert_with(|| Value::Object(Map::new()));
            match metadata {
                Value::Object(metadata) => {
                    metadata.insert(field.to_string(), value);
                }
                other => *other = json!({ field: value }),
            }
        }
    }

    pub fn set_namespace(&mut self, namespace: &str) {
        self.set_metadata_field("namespace", Value::String(namespace.into()));
    }

    pub fn set_labels(&mut self, labels: &BTreeMap<String, String>) {
        let labels: Map<String, Value> = labels
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect();
        self.set_metadata_field("labels", Value::Object(labels));
    }

    pub fn value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }

    /// Content the spec hash and drift check look at: `spec`, or the whole
    /// record minus identity and metadata for kinds without one.
    pub fn content(&self) -> Value {
        content_of(&self.0)
    }

    /// SHA-256 over the canonical JSON of [`DesiredObject::content`].
    pub fn spec_hash(&self) -> String {
        sha256_hex(canonical(&self.content()).to_string().as_bytes())
    }
}

/// Rebuild `value` with every object's keys in sorted order.
fn canonical(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<&String, Value> = map.iter().map(|(k, v)| (k, canonical(v))).collect();
            Value::Object(sorted.into_iter().map(|(k, v)| (k.clone(), v)).collect())
        }
        Value::Array(items) => Value::Array(items.iter().map(canonical).collect()),
        other => other.clone(),
    }
}

fn content_of(value: &Value) -> Value {
    if let Some(spec) = value.get("spec") {
        return spec.clone();
    }
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(k, _)| !matches!(k.as_str(), "metadata" | "status" | "apiVersion" | "kind"))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Whether every field set in `desired` is present with the same value in `live`.
///
/// Arrays must have equal length and match element-wise. Fields only present
/// in `live`, such as server defaults, are ignored.
pub fn is_subset(desired: &Value, live: &Value) -> bool {
    match (desired, live) {
        (Value::Object(d), Value::Object(l)) => d.iter().all(|(k, dv)| match l.get(k) {
            Some(lv) => is_subset(dv, lv),
            None => dv.is_null() || is_empty_collection(dv),
        }),
        (Value::Array(d), Value::Array(l)) => {
            d.len() == l.len() && d.iter().zip(l).all(|(dv, lv)| is_subset(dv, lv))
        }
        (Value::Number(d), Value::Number(l)) => d.as_f64() == l.as_f64(),
        (d, l) => d == l,
    }
}

fn is_empty_collection(value: &Value) -> bool {
    match value {
        Value::Object(m) => m.is_empty(),
        Value::Array(a) => a.is_empty(),
        _ => false,
    }
}

/// Whether the live object still carries what `desired` asks for.
pub fn live_matches(desired: &DesiredObject, live: &Value) -> bool {
    let labels_match = desired.labels().iter().all(|(k, v)| {
        live.pointer(&format!("/metadata/labels/{}", k.replace('~', "~0").replace('/', "~1")))
            .and_then(Value::as_str)
            == Some(v.as_str())
    });
    labels_match && is_subset(&desired.content(), &content_of(live))
}

/// Encode a snapshot as the bare JSON array persisted in annotations.
pub fn encode_snapshot(objects: &[DesiredObject]) -> Result<String> {
    serde_json::to_string(objects).map_err(|e| Error::StdError(StdError::JsonSerializationError(e)))
}

/// Decode a persisted snapshot. Accepts the legacy `{"items": [...]}` envelope.
pub fn decode_snapshot(raw: &str) -> Result<Vec<DesiredObject>> {
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }
    let value: Value =
        serde_json::from_str(raw).map_err(|e| Error::StdError(StdError::JsonSerializationError(e)))?;
    let items = match value {
        Value::Array(items) => items,
        Value::Object(mut envelope) => match envelope.remove("items") {
            Some(Value::Array(items)) => items,
            Some(Value::Null) | None => Vec::new(),
            Some(other) => {
                return Err(StdError::Fatal(format!("snapshot items is not an array: {other}")).into())
            }
        },
        Value::Null => Vec::new(),
        other => return Err(StdError::Fatal(format!("snapshot is not an array: {other}")).into()),
    };
    items.into_iter().map(DesiredObject::new).collect()
}

/// Collapse duplicate identity keys, the last occurrence winning at the
/// position of the first.
pub fn dedupe(objects: Vec<DesiredObject>) -> Vec<DesiredObject> {
    let mut order: Vec<String> = Vec::new();
    let mut by_key: BTreeMap<String, DesiredObject> = BTreeMap::new();
    for object in objects {
        let key = object.identity_key();
        if by_key.insert(key.clone(), object).is_none() {
            order.push(key);
        }
    }
    order
        .into_iter()
        .filter_map(|key| by_key.remove(&key))
        .collect()
}
