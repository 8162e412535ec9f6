//! Scrape-and-remote-write agent collecting inference metrics of the cluster.

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Affinity, ConfigMap, ConfigMapVolumeSource, Container, LocalObjectReference, PodAffinityTerm,
    PodAntiAffinity, PodSpec, PodTemplateSpec, ServiceAccount, Volume, VolumeMount,
    WeightedPodAffinityTerm,
};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, PolicyRule, Role, RoleBinding, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use serde_json::json;
use std::collections::BTreeMap;

use super::{resource_requirements, RenderVars, SubComponent};
use crate::applier::{DesiredObject, SKIP_PATCH_ANNOTATION};
use crate::util::errors::{Error, Result, StdError};

pub const METRICS_AGENT_TAG: &str = "metrics";
pub const METRICS_AGENT_APP: &str = "vmagent";
pub const CONFIG_MAP_NAME: &str = "vmagent-config";
pub const SCRAPE_CONFIG_MAP_NAME: &str = "vmagent-scrape-config";
pub const SERVICE_ACCOUNT_NAME: &str = "vmagent-service-account";
pub const ROLE_NAME: &str = "vmagent-pod-reader";
pub const DEPLOYMENT_NAME: &str = "vmagent";

const CONFIG_DIR: &str = "/etc/vmagent/config";
const TARGETS_DIR: &str = "/etc/vmagent/targets";
const CONFIG_FILE: &str = "prometheus.yml";
/// `app.kubernetes.io/name` of the host exporters scraped with node metrics
const NODE_EXPORTER_APP: &str = "node-exporter";
const DCGM_EXPORTER_APP: &str = "dcgm-exporter";

pub struct MetricsAgent;

impl SubComponent for MetricsAgent {
    fn tag(&self) -> &'static str {
        METRICS_AGENT_TAG
    }

    fn render(&self, vars: &RenderVars) -> Result<Vec<DesiredObject>> {
        let mut objects = vec![
            DesiredObject::from_typed(&config_map(vars)?)?,
            DesiredObject::from_typed(&scrape_config_map(vars))?,
            DesiredObject::from_typed(&service_account(vars))?,
            DesiredObject::from_typed(&role(vars))?,
            DesiredObject::from_typed(&role_binding(vars))?,
        ];
        if vars.metrics.node_metrics {
            objects.push(DesiredObject::from_typed(&cluster_role(vars))?);
            objects.push(DesiredObject::from_typed(&cluster_role_binding(vars))?);
        }
        objects.push(DesiredObject::from_typed(&deployment(vars)?)?);
        Ok(objects)
    }

    fn deployments(&self) -> Vec<&'static str> {
        vec![DEPLOYMENT_NAME]
    }
}

fn meta(vars: &RenderVars, name: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(vars.namespace.clone()),
        labels: Some(vars.labels(METRICS_AGENT_APP)),
        ..Default::default()
    }
}

fn cluster_meta(vars: &RenderVars, name: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        labels: Some(vars.labels(METRICS_AGENT_APP)),
        ..Default::default()
    }
}

/// Name of the cluster scoped role, unique per cluster.
pub fn cluster_role_name(vars: &RenderVars) -> String {
    format!("vmagent-node-reader-{}", vars.hash_suffix)
}

/// Job scraping the pods of a host exporter daemonset, wherever it runs.
fn exporter_job(app: &str) -> serde_json::Value {
    json!({
        "job_name": app,
        "kubernetes_sd_configs": [{"role": "pod"}],
        "relabel_configs": [
            {
                "source_labels": ["__meta_kubernetes_pod_label_app_kubernetes_io_name"],
                "action": "keep",
                "regex": app,
            },
            {"source_labels": ["__meta_kubernetes_pod_node_name"], "target_label": "node"},
        ],
    })
}

/// `prometheus.yml` selecting the inference pods of this cluster.
pub fn scrape_config(vars: &RenderVars) -> Result<String> {
    let selector = format!(
        "app=inference,cluster={},workspace={}",
        vars.cluster_name, vars.workspace
    );
    let mut jobs = vec![
        json!({
            "job_name": "inference",
            "kubernetes_sd_configs": [{
                "role": "pod",
                "namespaces": {"names": [vars.namespace]},
                "selectors": [{"role": "pod", "label": selector}],
            }],
            "relabel_configs": [
                {
                    "source_labels": ["__meta_kubernetes_pod_annotation_prometheus_io_scrape"],
                    "action": "keep",
                    "regex": "true",
                },
                {
                    "source_labels": ["__address__", "__meta_kubernetes_pod_annotation_prometheus_io_port"],
                    "action": "replace",
                    "regex": "([^:]+)(?::\\d+)?;(\\d+)",
                    "replacement": "$1:$2",
                    "target_label": "__address__",
                },
                {
                    "source_labels": ["__meta_kubernetes_pod_annotation_prometheus_io_path"],
                    "action": "replace",
                    "regex": "(.+)",
                    "target_label": "__metrics_path__",
                },
                {"source_labels": ["__meta_kubernetes_pod_name"], "target_label": "pod"},
                {"source_labels": ["__meta_kubernetes_pod_node_name"], "target_label": "node"},
            ],
        }),
        json!({
            "job_name": "scrape-targets",
            "file_sd_configs": [{"files": [format!("{TARGETS_DIR}/*.json")]}],
        }),
    ];
    if vars.metrics.node_metrics {
        jobs.push(json!({
            "job_name": "kubernetes-cadvisor",
            "scheme": "https",
            "tls_config": {"insecure_skip_verify": true},
            "bearer_token_file": "/var/run/secrets/kubernetes.io/serviceaccount/token",
            "kubernetes_sd_configs": [{"role": "node"}],
            "relabel_configs": [
                {"action": "labelmap", "regex": "__meta_kubernetes_node_label_(.+)"},
                {"target_label": "__metrics_path__", "replacement": "/metrics/cadvisor"},
            ],
        }));
        jobs.push(exporter_job(NODE_EXPORTER_APP));
        jobs.push(exporter_job(DCGM_EXPORTER_APP));
    }
    let config = json!({
        "global": {
            "scrape_interval": "30s",
            "external_labels": {"cluster": vars.cluster_name, "workspace": vars.workspace},
        },
        "scrape_configs": jobs,
    });
    serde_yaml::to_string(&config).map_err(|e| Error::StdError(StdError::YamlSerializationError(e)))
}

fn config_map(vars: &RenderVars) -> Result<ConfigMap> {
    Ok(ConfigMap {
        metadata: meta(vars, CONFIG_MAP_NAME),
        data: Some([(CONFIG_FILE.to_string(), scrape_config(vars)?)].into()),
        ..Default::default()
    })
}

fn scrape_config_map(vars: &RenderVars) -> ConfigMap {
    let mut metadata = meta(vars, SCRAPE_CONFIG_MAP_NAME);
    metadata.annotations = Some([(SKIP_PATCH_ANNOTATION.to_string(), "true".to_string())].into());
    ConfigMap {
        metadata,
        data: Some(BTreeMap::new()),
        ..Default::default()
    }
}

fn service_account(vars: &RenderVars) -> ServiceAccount {
    ServiceAccount {
        metadata: meta(vars, SERVICE_ACCOUNT_NAME),
        ..Default::default()
    }
}

fn reader_rule() -> PolicyRule {
    PolicyRule {
        api_groups: Some(vec![String::new()]),
        resources: Some(
            ["pods", "endpoints", "services", "nodes"]
                .iter()
                .map(|r| r.to_string())
                .collect(),
        ),
        verbs: ["get", "list", "watch"].iter().map(|v| v.to_string()).collect(),
        ..Default::default()
    }
}

fn role(vars: &RenderVars) -> Role {
    Role {
        metadata: meta(vars, ROLE_NAME),
        rules: Some(vec![reader_rule()]),
    }
}

fn subject(vars: &RenderVars) -> Subject {
    Subject {
        kind: "ServiceAccount".to_string(),
        name: SERVICE_ACCOUNT_NAME.to_string(),
        namespace: Some(vars.namespace.clone()),
        ..Default::default()
    }
}

fn role_binding(vars: &RenderVars) -> RoleBinding {
    RoleBinding {
        metadata: meta(vars, ROLE_NAME),
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "Role".to_string(),
            name: ROLE_NAME.to_string(),
        },
        subjects: Some(vec![subject(vars)]),
    }
}

fn cluster_role(vars: &RenderVars) -> ClusterRole {
    ClusterRole {
        metadata: cluster_meta(vars, &cluster_role_name(vars)),
        rules: Some(vec![
            PolicyRule {
                api_groups: Some(vec![String::new()]),
                resources: Some(
                    ["nodes", "nodes/metrics", "nodes/proxy", "pods"]
                        .iter()
                        .map(|r| r.to_string())
                        .collect(),
                ),
                verbs: ["get", "list", "watch"].iter().map(|v| v.to_string()).collect(),
                ..Default::default()
            },
            PolicyRule {
                non_resource_urls: Some(vec!["/metrics".to_string()]),
                verbs: vec!["get".to_string()],
                ..Default::default()
            },
        ]),
        ..Default::default()
    }
}

fn cluster_role_binding(vars: &RenderVars) -> ClusterRoleBinding {
    ClusterRoleBinding {
        metadata: cluster_meta(vars, &cluster_role_name(vars)),
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "ClusterRole".to_string(),
            name: cluster_role_name(vars),
        },
        subjects: Some(vec![subject(vars)]),
    }
}

fn deployment(vars: &RenderVars) -> Result<Deployment> {
    let selector: BTreeMap<String, String> = [("app".to_string(), METRICS_AGENT_APP.to_string())].into();
    let container = Container {
        name: METRICS_AGENT_APP.to_string(),
        image: Some(vars.image(METRICS_AGENT_APP)),
        args: Some(vec![
            format!("--promscrape.config={CONFIG_DIR}/{CONFIG_FILE}"),
            "--promscrape.configCheckInterval=10s".to_string(),
            format!("--remoteWrite.url={}", vars.metrics_remote_write_url),
        ]),
        resources: Some(resource_requirements(&vars.metrics.resources)?),
        volume_mounts: Some(vec![
            VolumeMount {
                name: "config".to_string(),
                mount_path: CONFIG_DIR.to_string(),
                read_only: Some(true),
                ..Default::default()
            },
            VolumeMount {
                name: "targets".to_string(),
                mount_path: TARGETS_DIR.to_string(),
                read_only: Some(true),
                ..Default::default()
            },
        ]),
        ..Default::default()
    };

    let anti_affinity = PodAntiAffinity {
        preferred_during_scheduling_ignored_during_execution: Some(vec![WeightedPodAffinityTerm {
            weight: 100,
            pod_affinity_term: PodAffinityTerm {
                label_selector: Some(LabelSelector {
                    match_labels: Some(selector.clone()),
                    ..Default::default()
                }),
                topology_key: "kubernetes.io/hostname".to_string(),
                ..Default::default()
            },
        }]),
        ..Default::default()
    };

    let config_volume = |name: &str, config_map: &str| Volume {
        name: name.to_string(),
        config_map: Some(ConfigMapVolumeSource {
            name: config_map.to_string(),
            ..Default::default()
        }),
        ..Default::default()
    };

    let mut pod_labels = vars.labels(METRICS_AGENT_APP);
    pod_labels.extend(selector.clone());

    Ok(Deployment {
        metadata: meta(vars, DEPLOYMENT_NAME),
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(selector),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(pod_labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    service_account_name: Some(SERVICE_ACCOUNT_NAME.to_string()),
                    image_pull_secrets: pull_secrets(vars),
                    containers: vec![container],
                    affinity: Some(Affinity {
                        pod_anti_affinity: Some(anti_affinity),
                        ..Default::default()
                    }),
                    volumes: Some(vec![
                        config_volume("config", CONFIG_MAP_NAME),
                        config_volume("targets", SCRAPE_CONFIG_MAP_NAME),
                    ]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    })
}

pub(super) fn pull_secrets(vars: &RenderVars) -> Option<Vec<LocalObjectReference>> {
    if vars.image_pull_secret.is_empty() {
        return None;
    }
    Some(vec![LocalObjectReference {
        name: vars.image_pull_secret.clone(),
    }])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::render_vars;

    #[test]
    fn test_renders_expected_objects() {
        let objects = MetricsAgent.render(&render_vars()).unwrap();
        let keys: Vec<String> = objects.iter().map(|o| o.identity_key()).collect();
        let ns = render_vars().namespace;
        assert_eq!(
            keys,
            vec![
                format!("v1/ConfigMap/{ns}/vmagent-config"),
                format!("v1/ConfigMap/{ns}/vmagent-scrape-config"),
                format!("v1/ServiceAccount/{ns}/vmagent-service-account"),
                format!("rbac.authorization.k8s.io/v1/Role/{ns}/vmagent-pod-reader"),
                format!("rbac.authorization.k8s.io/v1/RoleBinding/{ns}/vmagent-pod-reader"),
                format!("apps/v1/Deployment/{ns}/vmagent"),
            ]
        );
        assert!(objects[1].skip_patch());
    }

    #[test]
    fn test_node_metrics_adds_cluster_role_with_hash_suffix() {
        let mut vars = render_vars();
        vars.metrics.node_metrics = true;
        let objects = MetricsAgent.render(&vars).unwrap();
        let cluster_role = objects
            .iter()
            .find(|o| o.kind() == "ClusterRole")
            .unwrap();
        assert_eq!(cluster_role.name(), format!("vmagent-node-reader-{}", vars.hash_suffix));
        assert_eq!(cluster_role.namespace(), "");
        assert!(objects.iter().any(|o| o.kind() == "ClusterRoleBinding"));
    }

    #[test]
    fn test_deployment_shape() {
        let vars = render_vars();
        let objects = MetricsAgent.render(&vars).unwrap();
        let deployment = objects.last().unwrap().value();
        let container = &deployment["spec"]["template"]["spec"]["containers"][0];
        assert_eq!(container["image"], format!("{}/vmagent:{}", vars.image_prefix, vars.version));
        assert_eq!(
            container["args"][2],
            format!("--remoteWrite.url={}", vars.metrics_remote_write_url)
        );
        assert_eq!(container["resources"]["limits"], container["resources"]["requests"]);
        assert_eq!(
            deployment["spec"]["template"]["spec"]["affinity"]["podAntiAffinity"]
                ["preferredDuringSchedulingIgnoredDuringExecution"][0]["podAffinityTerm"]["topologyKey"],
            "kubernetes.io/hostname"
        );
        assert_eq!(
            deployment["spec"]["template"]["spec"]["imagePullSecrets"][0]["name"],
            vars.image_pull_secret
        );
    }

    #[test]
    fn test_scrape_config_selects_cluster_pods() {
        let vars = render_vars();
        let config: serde_yaml::Value = serde_yaml::from_str(&scrape_config(&vars).unwrap()).unwrap();
        let label = config["scrape_configs"][0]["kubernetes_sd_configs"][0]["selectors"][0]["label"]
            .as_str()
            .unwrap()
            .to_string();
        assert_eq!(
            label,
            format!("app=inference,cluster={},workspace={}", vars.cluster_name, vars.workspace)
        );
    }

    #[test]
    fn test_render_is_deterministic() {
        let a = MetricsAgent.render(&render_vars()).unwrap();
        let b = MetricsAgent.render(&render_vars()).unwrap();
        let hashes = |objects: &[DesiredObject]| objects.iter().map(|o| o.spec_hash()).collect::<Vec<_>>();
        assert_eq!(hashes(&a), hashes(&b));
    }

    #[test]
    fn test_node_metrics_scrapes_host_exporters() {
        let jobs = |vars: &RenderVars| -> Vec<String> {
            let config: serde_yaml::Value = serde_yaml::from_str(&scrape_config(vars).unwrap()).unwrap();
            config["scrape_configs"]
                .as_sequence()
                .unwrap()
                .iter()
                .map(|j| j["job_name"].as_str().unwrap().to_string())
                .collect()
        };
        let mut vars = render_vars();
        assert_eq!(jobs(&vars), vec!["inference", "scrape-targets"]);

        vars.metrics.node_metrics = true;
        assert_eq!(
            jobs(&vars),
            vec!["inference", "scrape-targets", "kubernetes-cadvisor", "node-exporter", "dcgm-exporter"]
        );
        let config: serde_yaml::Value = serde_yaml::from_str(&scrape_config(&vars).unwrap()).unwrap();
        assert_eq!(
            config["scrape_configs"][4]["relabel_configs"][0]["regex"].as_str(),
            Some("dcgm-exporter")
        );
    }
}
