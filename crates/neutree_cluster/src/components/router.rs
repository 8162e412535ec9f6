use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, PodSpec, PodTemplateSpec, Probe, Service, ServiceAccount, ServicePort,
    ServiceSpec, TCPSocketAction,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use serde_json::Value;
use std::collections::BTreeMap;

use super::metrics_agent::pull_secrets;
use super::{resource_requirements, RenderVars, SubComponent};
use crate::applier::{DesiredObject, ObjectKey, ObjectStore};
use crate::util::errors::Result;

pub const ROUTER_TAG: &str = "router";
pub const ROUTER_APP: &str = "router";
pub const ROUTER_SERVICE_NAME: &str = "router";
pub const ROUTER_SERVICE_ACCOUNT_NAME: &str = "router-service-account";
pub const ROUTER_PORT: i32 = 8000;

/// Request router in front of the inference workloads of the cluster.
pub struct Router;

impl SubComponent for Router {
    fn tag(&self) -> &'static str {
        ROUTER_TAG
    }

    fn render(&self, vars: &RenderVars) -> Result<Vec<DesiredObject>> {
        Ok(vec![
            DesiredObject::from_typed(&service_account(vars))?,
            DesiredObject::from_typed(&deployment(vars)?)?,
            DesiredObject::from_typed(&service(vars))?,
        ])
    }

    fn deployments(&self) -> Vec<&'static str> {
        vec![ROUTER_APP]
    }
}

fn meta(vars: &RenderVars, name: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(vars.namespace.clone()),
        labels: Some(vars.labels(ROUTER_APP)),
        ..Default::default()
    }
}

fn selector() -> BTreeMap<String, String> {
    [("app".to_string(), ROUTER_APP.to_string())].into()
}

fn service_account(vars: &RenderVars) -> ServiceAccount {
    ServiceAccount {
        metadata: meta(vars, ROUTER_SERVICE_ACCOUNT_NAME),
        ..Default::default()
    }
}

fn deployment(vars: &RenderVars) -> Result<Deployment> {
    let container = Container {
        name: ROUTER_APP.to_string(),
        image: Some(vars.image(ROUTER_APP)),
        args: Some(vec![
            format!("--port={ROUTER_PORT}"),
            format!("--cluster={}", vars.cluster_name),
            format!("--workspace={}", vars.workspace),
        ]),
        ports: Some(vec![ContainerPort {
            name: Some("http".to_string()),
            container_port: ROUTER_PORT,
            ..Default::default()
        }]),
        readiness_probe: Some(Probe {
            tcp_socket: Some(TCPSocketAction {
                port: IntOrString::Int(ROUTER_PORT),
                ..Default::default()
            }),
            period_seconds: Some(10),
            ..Default::default()
        }),
        resources: Some(resource_requirements(&vars.router.resources)?),
        ..Default::default()
    };

    Ok(Deployment {
        metadata: meta(vars, ROUTER_APP),
        spec: Some(DeploymentSpec {
            replicas: Some(vars.router.replicas),
            selector: LabelSelector {
                match_labels: Some(selector()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(vars.labels(ROUTER_APP)),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    service_account_name: Some(ROUTER_SERVICE_ACCOUNT_NAME.to_string()),
                    image_pull_secrets: pull_secrets(vars),
                    containers: vec![container],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    })
}

fn service(vars: &RenderVars) -> Service {
    Service {
        metadata: meta(vars, ROUTER_SERVICE_NAME),
        spec: Some(ServiceSpec {
            type_: Some(vars.router.service_type.clone()),
            selector: Some(selector()),
            ports: Some(vec![ServicePort {
                name: Some("http".to_string()),
                port: ROUTER_PORT,
                target_port: Some(IntOrString::Int(ROUTER_PORT)),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// External endpoint of the router: the load balancer ingress when one is
/// assigned, else the cluster IP. `None` until the service exists.
pub async fn route_endpoint(store: &dyn ObjectStore, namespace: &str) -> Result<Option<String>> {
    let key = ObjectKey::new("v1", "Service", namespace, ROUTER_SERVICE_NAME);
    let Some(service) = store.get(&key).await.map_err(|e| e.with_key(key.to_string()))? else {
        return Ok(None);
    };
    Ok(service_address(&service).map(|addr| format!("http://{addr}:{ROUTER_PORT}")))
}

fn service_address(service: &Value) -> Option<String> {
    let ingress = service
        .pointer("/status/loadBalancer/ingress")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .find_map(|i| {
            ["ip", "hostname"]
                .iter()
                .filter_map(|field| i.get(*field).and_then(Value::as_str))
                .find(|v| !v.is_empty())
        });
    if let Some(addr) = ingress {
        return Some(addr.to_string());
    }
    service
        .pointer("/spec/clusterIP")
        .and_then(Value::as_str)
        .filter(|ip| !ip.is_empty() && *ip != "None")
        .map(str::to_string)
}
