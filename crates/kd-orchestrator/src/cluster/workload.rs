//! Translation of a [`Container`] into cluster objects

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, DeploymentStrategy};
use k8s_openapi::api::core::v1::{
    Container as PodContainer, ContainerPort, EmptyDirVolumeSource, EnvVar, PodSpec, PodTemplateSpec, Service,
    ServicePort, ServiceSpec, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use std::collections::{BTreeMap, BTreeSet};

use kd_core::config::DaemonConfig;
use kd_core::names::{normalize_name, parse_binds, valid_aliases, MAIN_CONTAINER, MAX_NAME_LEN, SETUP_CONTAINER};
use kd_core::types::{CONTAINER_ID_LABEL, CONTAINER_NAME_ANNOTATION, MARKER_LABEL, MARKER_VALUE};
use kd_core::Container;

/// File whose creation releases the setup init container
pub const DONE_SENTINEL: &str = "/tmp/done";

/// A bind mount realized as an ephemeral volume
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    /// Path inside the containers
    pub target: String,
    /// Local source path
    pub source: String,
    /// Volume name, a DNS label
    pub volume: String,
}

/// Bind mounts of `container` with unique volume names
pub fn mounts(container: &Container) -> Vec<Mount> {
    let mut taken = BTreeSet::new();
    parse_binds(&container.binds)
        .into_iter()
        .map(|(target, source)| {
            let volume = unique_name(normalize_name(&target), &mut taken);
            Mount { target, source, volume }
        })
        .collect()
}

fn unique_name(base: String, taken: &mut BTreeSet<String>) -> String {
    let mut name = base.clone();
    let mut n = 1;
    while !taken.insert(name.clone()) {
        let suffix = format!("-{n}");
        let keep = base.len().min(MAX_NAME_LEN - suffix.len());
        name = format!("{}{}", &base[..keep], suffix);
        n += 1;
    }
    name
}

/// Labels put on every object belonging to `container`
pub fn object_labels(container: &Container) -> BTreeMap<String, String> {
    BTreeMap::from([
        (MARKER_LABEL.to_string(), MARKER_VALUE.to_string()),
        (CONTAINER_ID_LABEL.to_string(), container.short_id().to_string()),
    ])
}

fn selector_labels(container: &Container) -> BTreeMap<String, String> {
    BTreeMap::from([(CONTAINER_ID_LABEL.to_string(), container.short_id().to_string())])
}

/// Single-replica workload running `container`
///
/// With bind mounts, a setup init container holds the pod back until the
/// sentinel file exists, and both containers mount one `emptyDir` per
/// target path.
pub fn deployment(container: &Container, config: &DaemonConfig) -> Deployment {
    let mounts = mounts(container);
    let volume_mounts: Vec<VolumeMount> = mounts
        .iter()
        .map(|m| VolumeMount {
            name: m.volume.clone(),
            mount_path: m.target.clone(),
            ..VolumeMount::default()
        })
        .collect();

    let main = PodContainer {
        name: MAIN_CONTAINER.to_string(),
        image: Some(container.image.clone()),
        image_pull_policy: Some(config.image_pull_policy.clone()),
        command: non_empty(&container.entrypoint),
        args: non_empty(&container.cmd),
        env: non_empty(&env_vars(&container.env)),
        ports: non_empty(&container_ports(container)),
        volume_mounts: non_empty(&volume_mounts),
        ..PodContainer::default()
    };

    let (init_containers, volumes) = if mounts.is_empty() {
        (None, None)
    } else {
        let setup = PodContainer {
            name: SETUP_CONTAINER.to_string(),
            image: Some(config.init_image.clone()),
            image_pull_policy: Some(config.image_pull_policy.clone()),
            command: Some(vec![
                "sh".to_string(),
                "-c".to_string(),
                format!("while [ ! -f {DONE_SENTINEL} ]; do sleep 0.1; done"),
            ]),
            volume_mounts: Some(volume_mounts),
            ..PodContainer::default()
        };
        let volumes = mounts
            .iter()
            .map(|m| Volume {
                name: m.volume.clone(),
                empty_dir: Some(EmptyDirVolumeSource::default()),
                ..Volume::default()
            })
            .collect();
        (Some(vec![setup]), Some(volumes))
    };

    let annotations = (!container.labels.is_empty()).then(|| container.labels.clone());

    Deployment {
        metadata: ObjectMeta {
            name: Some(container.short_id().to_string()),
            namespace: Some(config.namespace.clone()),
            labels: Some(object_labels(container)),
            annotations: Some(BTreeMap::from([(
                CONTAINER_NAME_ANNOTATION.to_string(),
                container.name.trim_start_matches('/').to_string(),
            )])),
            ..ObjectMeta::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            strategy: Some(DeploymentStrategy {
                type_: Some("Recreate".to_string()),
                ..DeploymentStrategy::default()
            }),
            selector: LabelSelector {
                match_labels: Some(selector_labels(container)),
                ..LabelSelector::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(object_labels(container)),
                    annotations,
                    ..ObjectMeta::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![main],
                    init_containers,
                    volumes,
                    ..PodSpec::default()
                }),
            },
            ..DeploymentSpec::default()
        }),
        ..Deployment::default()
    }
}

/// Container ports for every declared TCP port; others are skipped
fn container_ports(container: &Container) -> Vec<ContainerPort> {
    container
        .declared_ports()
        .into_iter()
        .filter(|spec| {
            if !spec.is_tcp() {
                tracing::warn!(id = %container.short_id(), port = %spec, "only tcp ports are supported, ignoring");
            }
            spec.is_tcp()
        })
        .map(|spec| ContainerPort {
            name: Some(format!("kd-tcp-{}", spec.port)),
            container_port: i32::from(spec.port),
            protocol: Some("TCP".to_string()),
            ..ContainerPort::default()
        })
        .collect()
}

fn env_vars(env: &[String]) -> Vec<EnvVar> {
    env.iter()
        .map(|entry| {
            let (name, value) = entry.split_once('=').unwrap_or((entry.as_str(), ""));
            EnvVar {
                name: name.to_string(),
                value: Some(value.to_string()),
                ..EnvVar::default()
            }
        })
        .collect()
}

/// Services for each valid network alias, exposing `ports` (source → target)
///
/// Empty when `ports` is empty.
pub fn services(container: &Container, namespace: &str, ports: &BTreeMap<u16, u16>) -> Vec<Service> {
    if ports.is_empty() {
        return Vec::new();
    }

    let service_ports: Vec<ServicePort> = ports
        .iter()
        .map(|(src, dst)| ServicePort {
            name: Some(format!("tcp-{src}-{dst}")),
            port: i32::from(*src),
            target_port: Some(IntOrString::Int(i32::from(*dst))),
            protocol: Some("TCP".to_string()),
            ..ServicePort::default()
        })
        .collect();

    valid_aliases(container)
        .into_iter()
        .map(|alias| Service {
            metadata: ObjectMeta {
                name: Some(alias),
                namespace: Some(namespace.to_string()),
                labels: Some(object_labels(container)),
                ..ObjectMeta::default()
            },
            spec: Some(ServiceSpec {
                selector: Some(selector_labels(container)),
                ports: Some(service_ports.clone()),
                ..ServiceSpec::default()
            }),
            ..Service::default()
        })
        .collect()
}

fn non_empty<T: Clone>(items: &[T]) -> Option<Vec<T>> {
    (!items.is_empty()).then(|| items.to_vec())
}
