//! Desired child `Deployment` for a `Memcached`.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Capabilities, Container, ContainerPort, PodSecurityContext, PodSpec, PodTemplateSpec, SeccompProfile,
    SecurityContext,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::{Resource, ResourceExt};
use tether_api::Memcached;

use crate::ControllerConfig;

pub const DEFAULT_PORT: i32 = 11211;
const RUN_AS_USER: i64 = 1001;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TemplateError {
    #[error("spec.size must not be negative (got {0})")]
    NegativeSize(i32),
    #[error("container image is empty")]
    EmptyImage,
    #[error("container port {0} out of range 1..=65535")]
    InvalidPort(i32),
    #[error("{0} has no uid; cannot set owner reference")]
    Unowned(String),
}

/// Governed replica count, validated.
pub fn desired_replicas(mc: &Memcached) -> Result<i32, TemplateError> {
    match mc.spec.size {
        n if n < 0 => Err(TemplateError::NegativeSize(n)),
        n => Ok(n),
    }
}

pub fn labels_for(mc: &Memcached) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app.kubernetes.io/name".to_string(), "memcached".to_string()),
        ("app.kubernetes.io/instance".to_string(), mc.name_any()),
        ("app.kubernetes.io/managed-by".to_string(), "tether".to_string()),
    ])
}

/// Build the child with the owner's name and namespace, a controller owner
/// reference and a hardened pod template.
pub fn deployment_for(mc: &Memcached, cfg: &ControllerConfig) -> Result<Deployment, TemplateError> {
    let replicas = desired_replicas(mc)?;
    let image = mc.spec.image.as_deref().unwrap_or(&cfg.image);
    if image.trim().is_empty() {
        return Err(TemplateError::EmptyImage);
    }
    let port = mc.spec.container_port.unwrap_or(DEFAULT_PORT);
    if !(1..=65535).contains(&port) {
        return Err(TemplateError::InvalidPort(port));
    }
    let owner = mc.controller_owner_ref(&()).ok_or_else(|| TemplateError::Unowned(mc.name_any()))?;
    let labels = labels_for(mc);

    let container = Container {
        name: "memcached".to_string(),
        image: Some(image.to_string()),
        image_pull_policy: Some("IfNotPresent".to_string()),
        command: Some(["memcached", "--memory-limit=64", "-o", "modern", "-v"].map(String::from).to_vec()),
        ports: Some(vec![ContainerPort {
            container_port: port,
            name: Some("memcached".to_string()),
            ..Default::default()
        }]),
        security_context: Some(SecurityContext {
            run_as_non_root: Some(true),
            run_as_user: Some(RUN_AS_USER),
            allow_privilege_escalation: Some(false),
            capabilities: Some(Capabilities { drop: Some(vec!["ALL".to_string()]), ..Default::default() }),
            ..Default::default()
        }),
        ..Default::default()
    };

    Ok(Deployment {
        metadata: ObjectMeta {
            name: Some(mc.name_any()),
            namespace: mc.namespace(),
            labels: Some(labels.clone()),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(replicas),
            selector: LabelSelector { match_labels: Some(labels.clone()), ..Default::default() },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta { labels: Some(labels), ..Default::default() }),
                spec: Some(PodSpec {
                    security_context: Some(PodSecurityContext {
                        run_as_non_root: Some(true),
                        seccomp_profile: Some(SeccompProfile {
                            type_: "RuntimeDefault".to_string(),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }),
                    containers: vec![container],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    })
}
