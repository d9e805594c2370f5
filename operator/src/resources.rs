/*
Copyright 2024 The Kubernetes Authors.

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

    http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

//! Generators for the objects owned by DataPlanes and ControlPlanes, and the
//! drift checks used to keep existing objects in line with them.

use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};

use chrono::Utc;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, HTTPGetAction, ObjectFieldSelector, PodSpec,
    PodTemplateSpec, Probe, ResourceRequirements, Secret, Service, ServiceAccount, ServicePort,
    ServiceSpec, Volume,
};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::core::ObjectMeta;
use kube::{Resource, ResourceExt};

use crate::consts::*;
use crate::permissions::resolve_permissions;
use crate::types::{ControlPlane, DataPlane};
use crate::utils::label_map;
use crate::{Error, Result};

// -----------------------------------------------------------------------------
// Labels and ownership
// -----------------------------------------------------------------------------

pub fn owner_reference<K: Resource<DynamicType = ()>>(owner: &K) -> Result<OwnerReference> {
    owner.controller_owner_ref(&()).ok_or(Error::InvalidConfigError(format!(
        "{} {} has no uid yet",
        K::kind(&()),
        owner.name_any()
    )))
}

/// Labels shared by every child of a DataPlane generation.
pub fn dataplane_generation_labels(dp: &DataPlane, state: &str) -> BTreeMap<String, String> {
    label_map([
        (MANAGED_BY_LABEL, DATAPLANE_MANAGED_LABEL_VALUE),
        (APP_LABEL, &dp.name_any()),
        (DATAPLANE_GENERATION_STATE_LABEL, state),
    ])
}

pub fn dataplane_deployment_labels(dp: &DataPlane, state: &str) -> BTreeMap<String, String> {
    let mut labels = dataplane_generation_labels(dp, state);
    labels.insert(DATAPLANE_DEPLOYMENT_STATE_LABEL.to_string(), state.to_string());
    labels
}

pub fn dataplane_service_labels(
    dp: &DataPlane,
    state: &str,
    service_type: &str,
) -> BTreeMap<String, String> {
    let mut labels = dataplane_generation_labels(dp, state);
    labels.insert(DATAPLANE_SERVICE_TYPE_LABEL.to_string(), service_type.to_string());
    labels
}

pub fn controlplane_labels(cp: &ControlPlane) -> BTreeMap<String, String> {
    label_map([
        (MANAGED_BY_LABEL, CONTROLPLANE_MANAGED_LABEL_VALUE),
        (APP_LABEL, &cp.name_any()),
    ])
}

// Cluster-scoped objects cannot carry an owner reference to a namespaced
// ControlPlane, so they are tied to it by uid.
pub fn controlplane_cluster_labels(cp: &ControlPlane) -> BTreeMap<String, String> {
    label_map([
        (MANAGED_BY_LABEL, CONTROLPLANE_MANAGED_LABEL_VALUE),
        (CONTROLPLANE_OWNER_UID_LABEL, &cp.uid().unwrap_or_default()),
    ])
}

fn child_metadata<K: Resource<DynamicType = ()>>(
    owner: &K,
    prefix: &str,
    labels: BTreeMap<String, String>,
    finalizers: Option<Vec<String>>,
) -> Result<ObjectMeta> {
    Ok(ObjectMeta {
        generate_name: Some(format!("{prefix}-{}-", owner.name_any())),
        namespace: owner.namespace(),
        labels: Some(labels),
        owner_references: Some(vec![owner_reference(owner)?]),
        finalizers,
        ..Default::default()
    })
}

fn wait_for_owner() -> Option<Vec<String>> {
    Some(vec![WAIT_FOR_OWNER_FINALIZER.to_string()])
}

/// Generates a fresh pod selector value for a DataPlane generation. The value
/// is fixed once its deployment exists.
pub fn new_selector_value(owner_uid: &str, template: Option<&PodTemplateSpec>) -> String {
    let mut hasher = DefaultHasher::new();
    owner_uid.hash(&mut hasher);
    serde_json::to_string(&template).unwrap_or_default().hash(&mut hasher);
    Utc::now().timestamp_nanos_opt().hash(&mut hasher);
    format!("{:x}", hasher.finish())
}

/// Value of the selector label a deployment's pods are matched by.
pub fn deployment_selector_value(deployment: &Deployment) -> Option<&str> {
    deployment
        .spec
        .as_ref()?
        .selector
        .match_labels
        .as_ref()?
        .get(DATAPLANE_SELECTOR_LABEL)
        .map(String::as_str)
}

/// Value of the selector label a service routes to, if it routes anywhere.
pub fn service_selector_value(service: &Service) -> Option<&str> {
    service
        .spec
        .as_ref()?
        .selector
        .as_ref()?
        .get(DATAPLANE_SELECTOR_LABEL)
        .map(String::as_str)
}

pub fn selector_for(value: &str) -> BTreeMap<String, String> {
    label_map([(DATAPLANE_SELECTOR_LABEL, value)])
}

// -----------------------------------------------------------------------------
// Pod template helpers
// -----------------------------------------------------------------------------

fn tcp_port(name: &str, port: i32) -> ContainerPort {
    ContainerPort {
        name: Some(name.to_string()),
        container_port: port,
        protocol: Some("TCP".to_string()),
        ..Default::default()
    }
}

fn http_probe(path: &str, port: i32) -> Probe {
    Probe {
        http_get: Some(HTTPGetAction {
            path: Some(path.to_string()),
            port: IntOrString::Int(port),
            scheme: Some("HTTP".to_string()),
            ..Default::default()
        }),
        initial_delay_seconds: Some(5),
        timeout_seconds: Some(1),
        period_seconds: Some(10),
        success_threshold: Some(1),
        failure_threshold: Some(3),
        ..Default::default()
    }
}

/// Appends `name=value` unless the container already sets `name`.
pub fn set_env_default(container: &mut Container, name: &str, value: &str) {
    let env = container.env.get_or_insert_with(Vec::new);
    if env.iter().any(|e| e.name == name) {
        return;
    }
    env.push(EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        value_from: None,
    });
}

fn ensure_container<'a>(spec: &'a mut PodSpec, name: &str, image: &str) -> &'a mut Container {
    if !spec.containers.iter().any(|c| c.name == name) {
        spec.containers.push(Container {
            name: name.to_string(),
            ..Default::default()
        });
    }
    let index = spec
        .containers
        .iter()
        .position(|c| c.name == name)
        .unwrap_or_default();
    let container = &mut spec.containers[index];
    if container.image.as_deref().map_or(true, str::is_empty) {
        container.image = Some(image.to_string());
    }
    container
}

// -----------------------------------------------------------------------------
// DataPlane children
// -----------------------------------------------------------------------------

pub fn generate_dataplane_deployment(
    dp: &DataPlane,
    default_image: &str,
    state: &str,
    selector: &str,
) -> Result<Deployment> {
    let options = &dp.spec.options.deployment;
    let mut template = options.pod_template_spec.clone().unwrap_or_default();

    let template_meta = template.metadata.get_or_insert_with(Default::default);
    let template_labels = template_meta.labels.get_or_insert_with(BTreeMap::new);
    template_labels.insert(APP_LABEL.to_string(), dp.name_any());
    template_labels.insert(DATAPLANE_SELECTOR_LABEL.to_string(), selector.to_string());

    let pod_spec = template.spec.get_or_insert_with(Default::default);
    let proxy = ensure_container(pod_spec, DATAPLANE_PROXY_CONTAINER_NAME, default_image);
    if proxy.ports.is_none() {
        proxy.ports = Some(vec![
            tcp_port("proxy", DATAPLANE_PROXY_PORT),
            tcp_port("proxy-ssl", DATAPLANE_PROXY_SSL_PORT),
            tcp_port("admin", DATAPLANE_ADMIN_API_PORT),
            tcp_port("metrics", DATAPLANE_METRICS_PORT),
        ]);
    }
    if proxy.readiness_probe.is_none() {
        proxy.readiness_probe = Some(http_probe("/status/ready", DATAPLANE_METRICS_PORT));
    }
    let proxy_listen = format!(
        "0.0.0.0:{DATAPLANE_PROXY_PORT} reuseport backlog=16384, \
         0.0.0.0:{DATAPLANE_PROXY_SSL_PORT} http2 ssl reuseport backlog=16384"
    );
    set_env_default(proxy, "KONG_PROXY_LISTEN", &proxy_listen);
    let admin_listen = format!("0.0.0.0:{DATAPLANE_ADMIN_API_PORT} ssl reuseport backlog=16384");
    set_env_default(proxy, "KONG_ADMIN_LISTEN", &admin_listen);
    set_env_default(proxy, "KONG_STATUS_LISTEN", &format!("0.0.0.0:{DATAPLANE_METRICS_PORT}"));
    set_env_default(proxy, "KONG_DATABASE", "off");

    Ok(Deployment {
        metadata: child_metadata(
            dp,
            "dataplane",
            dataplane_deployment_labels(dp, state),
            wait_for_owner(),
        )?,
        spec: Some(DeploymentSpec {
            replicas: Some(options.replicas.unwrap_or(1)),
            selector: LabelSelector {
                match_labels: Some(selector_for(selector)),
                match_expressions: None,
            },
            template,
            ..Default::default()
        }),
        status: None,
    })
}

fn service_port(name: &str, port: i32, target: i32) -> ServicePort {
    ServicePort {
        name: Some(name.to_string()),
        port,
        target_port: Some(IntOrString::Int(target)),
        protocol: Some("TCP".to_string()),
        ..Default::default()
    }
}

/// Admin API service of a generation. A `None` selector leaves the service
/// without endpoints.
pub fn generate_dataplane_admin_service(
    dp: &DataPlane,
    state: &str,
    selector: Option<&str>,
) -> Result<Service> {
    Ok(Service {
        metadata: child_metadata(
            dp,
            "dataplane-admin",
            dataplane_service_labels(dp, state, SERVICE_TYPE_ADMIN),
            wait_for_owner(),
        )?,
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            selector: selector.map(selector_for),
            ports: Some(vec![service_port(
                "admin",
                DATAPLANE_ADMIN_API_PORT,
                DATAPLANE_ADMIN_API_PORT,
            )]),
            ..Default::default()
        }),
        status: None,
    })
}

pub fn generate_dataplane_ingress_service(
    dp: &DataPlane,
    state: &str,
    selector: Option<&str>,
) -> Result<Service> {
    let ingress_options = dp
        .spec
        .options
        .network
        .as_ref()
        .and_then(|n| n.services.as_ref())
        .and_then(|s| s.ingress.as_ref());

    let mut metadata = child_metadata(
        dp,
        "dataplane-ingress",
        dataplane_service_labels(dp, state, SERVICE_TYPE_INGRESS),
        wait_for_owner(),
    )?;
    metadata.annotations = ingress_options.and_then(|o| o.annotations.clone());

    Ok(Service {
        metadata,
        spec: Some(ServiceSpec {
            type_: Some(
                ingress_options
                    .and_then(|o| o.type_.clone())
                    .unwrap_or_else(|| "LoadBalancer".to_string()),
            ),
            selector: selector.map(selector_for),
            ports: Some(vec![
                service_port("http", 80, DATAPLANE_PROXY_PORT),
                service_port("https", 443, DATAPLANE_PROXY_SSL_PORT),
            ]),
            ..Default::default()
        }),
        status: None,
    })
}

/// Admin API TLS secret of a generation. Certificate material is issued
/// outside of this operator.
pub fn generate_dataplane_tls_secret(dp: &DataPlane, state: &str) -> Result<Secret> {
    Ok(Secret {
        metadata: child_metadata(
            dp,
            "dataplane-admin-tls",
            dataplane_generation_labels(dp, state),
            wait_for_owner(),
        )?,
        type_: Some("Opaque".to_string()),
        ..Default::default()
    })
}

// -----------------------------------------------------------------------------
// ControlPlane children
// -----------------------------------------------------------------------------

pub fn generate_controlplane_deployment(
    cp: &ControlPlane,
    default_image: &str,
    service_account: &str,
    replicas: i32,
) -> Result<Deployment> {
    let labels = controlplane_labels(cp);
    let mut template = cp
        .spec
        .options
        .deployment
        .pod_template_spec
        .clone()
        .unwrap_or_default();

    let template_meta = template.metadata.get_or_insert_with(Default::default);
    template_meta
        .labels
        .get_or_insert_with(BTreeMap::new)
        .extend(labels.clone());

    let pod_spec = template.spec.get_or_insert_with(Default::default);
    pod_spec.service_account_name = Some(service_account.to_string());
    let controller =
        ensure_container(pod_spec, CONTROLPLANE_CONTROLLER_CONTAINER_NAME, default_image);
    if controller.readiness_probe.is_none() {
        controller.readiness_probe = Some(http_probe("/readyz", 10254));
    }

    Ok(Deployment {
        metadata: child_metadata(cp, "controlplane", labels.clone(), None)?,
        spec: Some(DeploymentSpec {
            replicas: Some(replicas),
            selector: LabelSelector {
                match_labels: Some(labels),
                match_expressions: None,
            },
            template,
            ..Default::default()
        }),
        status: None,
    })
}

pub fn generate_controlplane_service_account(cp: &ControlPlane) -> Result<ServiceAccount> {
    Ok(ServiceAccount {
        metadata: child_metadata(cp, "controlplane", controlplane_labels(cp), None)?,
        ..Default::default()
    })
}

fn cluster_metadata(cp: &ControlPlane) -> ObjectMeta {
    ObjectMeta {
        generate_name: Some(format!("controlplane-{}-", cp.name_any())),
        labels: Some(controlplane_cluster_labels(cp)),
        ..Default::default()
    }
}

/// ClusterRole holding the permissions required by the control plane image.
pub fn generate_controlplane_cluster_role(cp: &ControlPlane) -> Result<ClusterRole> {
    let image = cp
        .spec
        .options
        .deployment
        .pod_template_spec
        .as_ref()
        .and_then(|t| t.spec.as_ref())
        .and_then(|s| {
            s.containers
                .iter()
                .find(|c| c.name == CONTROLPLANE_CONTROLLER_CONTAINER_NAME)
        })
        .and_then(|c| c.image.as_deref());

    let mut role = resolve_permissions(&cp.name_any(), image)?;
    role.metadata = cluster_metadata(cp);
    Ok(role)
}

pub fn generate_controlplane_cluster_role_binding(
    cp: &ControlPlane,
    role: &str,
    service_account: &str,
) -> ClusterRoleBinding {
    ClusterRoleBinding {
        metadata: cluster_metadata(cp),
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "ClusterRole".to_string(),
            name: role.to_string(),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name: service_account.to_string(),
            namespace: cp.namespace(),
            api_group: None,
        }]),
    }
}

// -----------------------------------------------------------------------------
// Quantities
// -----------------------------------------------------------------------------

// (suffix, multiplier, divisor)
const QUANTITY_SUFFIXES: [(&str, f64, f64); 15] = [
    ("Ki", 1024.0, 1.0),
    ("Mi", 1048576.0, 1.0),
    ("Gi", 1073741824.0, 1.0),
    ("Ti", 1099511627776.0, 1.0),
    ("Pi", 1125899906842624.0, 1.0),
    ("Ei", 1152921504606846976.0, 1.0),
    ("n", 1.0, 1e9),
    ("u", 1.0, 1e6),
    ("m", 1.0, 1e3),
    ("k", 1e3, 1.0),
    ("M", 1e6, 1.0),
    ("G", 1e9, 1.0),
    ("T", 1e12, 1.0),
    ("P", 1e15, 1.0),
    ("E", 1e18, 1.0),
];

/// Parses a resource quantity ("100m", "1Gi", "1e3") into its numeric value.
pub fn parse_quantity(quantity: &str) -> Option<f64> {
    let quantity = quantity.trim();
    if !quantity.starts_with(|c: char| c.is_ascii_digit() || c == '.' || c == '+' || c == '-') {
        return None;
    }
    if let Ok(value) = quantity.parse::<f64>() {
        return value.is_finite().then_some(value);
    }
    QUANTITY_SUFFIXES.iter().find_map(|(suffix, mult, div)| {
        let number = quantity.strip_suffix(suffix)?;
        let value = number.parse::<f64>().ok()?;
        value.is_finite().then(|| value * mult / div)
    })
}

pub fn quantities_equal(a: &Quantity, b: &Quantity) -> bool {
    match (parse_quantity(&a.0), parse_quantity(&b.0)) {
        (Some(x), Some(y)) => (x - y).abs() <= 1e-9 * x.abs().max(y.abs()).max(1.0),
        _ => a.0 == b.0,
    }
}

fn quantity_maps_equal(
    a: Option<&BTreeMap<String, Quantity>>,
    b: Option<&BTreeMap<String, Quantity>>,
) -> bool {
    let empty = BTreeMap::new();
    let (a, b) = (a.unwrap_or(&empty), b.unwrap_or(&empty));
    a.len() == b.len()
        && a.iter()
            .all(|(name, qa)| b.get(name).is_some_and(|qb| quantities_equal(qa, qb)))
}

/// Compares resource requirements treating equivalent quantities as equal.
pub fn resource_requirements_equal(
    a: Option<&ResourceRequirements>,
    b: Option<&ResourceRequirements>,
) -> bool {
    let default = ResourceRequirements::default();
    let (a, b) = (a.unwrap_or(&default), b.unwrap_or(&default));
    quantity_maps_equal(a.limits.as_ref(), b.limits.as_ref())
        && quantity_maps_equal(a.requests.as_ref(), b.requests.as_ref())
        && vec_equal(&a.claims, &b.claims)
}

// -----------------------------------------------------------------------------
// Drift
// -----------------------------------------------------------------------------

// An absent list equals an empty one.
fn vec_equal<T: PartialEq>(a: &Option<Vec<T>>, b: &Option<Vec<T>>) -> bool {
    a.as_deref().unwrap_or_default() == b.as_deref().unwrap_or_default()
}

fn map_equal(a: &Option<BTreeMap<String, String>>, b: &Option<BTreeMap<String, String>>) -> bool {
    let empty = BTreeMap::new();
    a.as_ref().unwrap_or(&empty) == b.as_ref().unwrap_or(&empty)
}

// Adds every desired entry missing from or differing in `existing`.
fn merge_map(
    existing: &mut Option<BTreeMap<String, String>>,
    desired: &Option<BTreeMap<String, String>>,
) -> bool {
    let Some(desired) = desired else {
        return false;
    };
    let existing = existing.get_or_insert_with(BTreeMap::new);
    let mut changed = false;
    for (k, v) in desired {
        if existing.get(k) != Some(v) {
            existing.insert(k.clone(), v.clone());
            changed = true;
        }
    }
    changed
}

/// Brings labels, annotations, finalizers and owner references of `existing`
/// in line with `desired`. Extra entries set by others are left alone.
pub fn reconcile_metadata(existing: &mut ObjectMeta, desired: &ObjectMeta) -> bool {
    let mut changed = merge_map(&mut existing.labels, &desired.labels);
    changed |= merge_map(&mut existing.annotations, &desired.annotations);

    for finalizer in desired.finalizers.iter().flatten() {
        let finalizers = existing.finalizers.get_or_insert_with(Vec::new);
        if !finalizers.contains(finalizer) {
            finalizers.push(finalizer.clone());
            changed = true;
        }
    }
    for owner in desired.owner_references.iter().flatten() {
        let owners = existing.owner_references.get_or_insert_with(Vec::new);
        if !owners.iter().any(|o| o.uid == owner.uid) {
            owners.push(owner.clone());
            changed = true;
        }
    }
    changed
}

// Mode the API server assigns to secret, config map, projected and downward
// API volumes that leave it out (0644).
const DEFAULT_VOLUME_MODE: i32 = 0o644;

fn set_probe_defaults(probe: &mut Probe) {
    if let Some(http_get) = probe.http_get.as_mut() {
        http_get.scheme.get_or_insert_with(|| "HTTP".to_string());
    }
    probe.timeout_seconds.get_or_insert(1);
    probe.period_seconds.get_or_insert(10);
    probe.success_threshold.get_or_insert(1);
    probe.failure_threshold.get_or_insert(3);
}

fn set_field_ref_defaults(field_ref: Option<&mut ObjectFieldSelector>) {
    if let Some(field_ref) = field_ref {
        field_ref.api_version.get_or_insert_with(|| "v1".to_string());
    }
}

fn set_container_defaults(container: &mut Container) {
    for port in container.ports.iter_mut().flatten() {
        port.protocol.get_or_insert_with(|| "TCP".to_string());
    }
    for env in container.env.iter_mut().flatten() {
        set_field_ref_defaults(env.value_from.as_mut().and_then(|v| v.field_ref.as_mut()));
    }
    for probe in [
        container.readiness_probe.as_mut(),
        container.liveness_probe.as_mut(),
        container.startup_probe.as_mut(),
    ]
    .into_iter()
    .flatten()
    {
        set_probe_defaults(probe);
    }
}

fn set_volume_defaults(volume: &mut Volume) {
    if let Some(secret) = volume.secret.as_mut() {
        secret.default_mode.get_or_insert(DEFAULT_VOLUME_MODE);
    }
    if let Some(config_map) = volume.config_map.as_mut() {
        config_map.default_mode.get_or_insert(DEFAULT_VOLUME_MODE);
    }
    if let Some(projected) = volume.projected.as_mut() {
        projected.default_mode.get_or_insert(DEFAULT_VOLUME_MODE);
    }
    if let Some(downward_api) = volume.downward_api.as_mut() {
        downward_api.default_mode.get_or_insert(DEFAULT_VOLUME_MODE);
        for item in downward_api.items.iter_mut().flatten() {
            set_field_ref_defaults(item.field_ref.as_mut());
        }
    }
}

/// Fills in the pod template fields the API server defaults on admission, so a
/// generated template compares equal to its stored copy. Values already set
/// are kept.
pub fn set_pod_template_defaults(template: &mut PodTemplateSpec) {
    let Some(spec) = template.spec.as_mut() else {
        return;
    };
    for container in spec.containers.iter_mut() {
        set_container_defaults(container);
    }
    for volume in spec.volumes.iter_mut().flatten() {
        set_volume_defaults(volume);
    }
}

fn container_drift(existing: &Container, desired: &Container) -> bool {
    existing.image != desired.image
        || !vec_equal(&existing.command, &desired.command)
        || !vec_equal(&existing.args, &desired.args)
        || !vec_equal(&existing.env, &desired.env)
        || !vec_equal(&existing.ports, &desired.ports)
        || existing.readiness_probe != desired.readiness_probe
        || existing.liveness_probe != desired.liveness_probe
        || existing.startup_probe != desired.startup_probe
        || !vec_equal(&existing.volume_mounts, &desired.volume_mounts)
        || !resource_requirements_equal(existing.resources.as_ref(), desired.resources.as_ref())
}

fn pod_template_drift(existing: &PodTemplateSpec, desired: &PodTemplateSpec) -> bool {
    let mut existing = existing.clone();
    set_pod_template_defaults(&mut existing);
    let mut desired = desired.clone();
    set_pod_template_defaults(&mut desired);

    let default_meta = ObjectMeta::default();
    let existing_meta = existing.metadata.as_ref().unwrap_or(&default_meta);
    let desired_meta = desired.metadata.as_ref().unwrap_or(&default_meta);
    if !map_equal(&existing_meta.labels, &desired_meta.labels)
        || !map_equal(&existing_meta.annotations, &desired_meta.annotations)
    {
        return true;
    }

    let default_spec = PodSpec::default();
    let existing_spec = existing.spec.as_ref().unwrap_or(&default_spec);
    let desired_spec = desired.spec.as_ref().unwrap_or(&default_spec);
    if !vec_equal(&existing_spec.volumes, &desired_spec.volumes)
        || existing_spec.service_account_name != desired_spec.service_account_name
        || existing_spec.containers.len() != desired_spec.containers.len()
    {
        return true;
    }
    desired_spec.containers.iter().any(|desired| {
        existing_spec
            .containers
            .iter()
            .find(|c| c.name == desired.name)
            .map_or(true, |existing| container_drift(existing, desired))
    })
}

/// Whether the pod templates of two deployments differ in a way that needs
/// new pods.
pub fn deployment_template_drift(existing: &Deployment, desired: &Deployment) -> bool {
    match (existing.spec.as_ref(), desired.spec.as_ref()) {
        (Some(e), Some(d)) => pod_template_drift(&e.template, &d.template),
        (None, None) => false,
        _ => true,
    }
}

fn replicas(deployment: &Deployment) -> i32 {
    deployment.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1)
}

/// Applies `desired` onto `existing`, keeping the immutable pod selector of
/// `existing`. Returns whether anything changed.
pub fn reconcile_deployment(existing: &mut Deployment, desired: &Deployment) -> bool {
    let mut changed = reconcile_metadata(&mut existing.metadata, &desired.metadata);
    if replicas(existing) != replicas(desired) || deployment_template_drift(existing, desired) {
        let selector = existing.spec.as_ref().map(|s| s.selector.clone());
        let mut spec = desired.spec.clone().unwrap_or_default();
        if let Some(selector) = selector {
            spec.selector = selector;
        }
        existing.spec = Some(spec);
        changed = true;
    }
    changed
}

fn ports_equal(existing: &[ServicePort], desired: &[ServicePort]) -> bool {
    existing.len() == desired.len()
        && existing.iter().zip(desired).all(|(e, d)| {
            e.name == d.name
                && e.port == d.port
                && e.target_port == d.target_port
                && e.protocol == d.protocol
        })
}

/// Applies type, selector and ports of `desired` onto `existing`, keeping the
/// fields the API server assigns (cluster IP, node ports).
pub fn reconcile_service(existing: &mut Service, desired: &Service) -> bool {
    let mut changed = reconcile_metadata(&mut existing.metadata, &desired.metadata);
    let desired_spec = desired.spec.clone().unwrap_or_default();
    let spec = existing.spec.get_or_insert_with(Default::default);

    let type_of = |s: &ServiceSpec| s.type_.clone().unwrap_or_else(|| "ClusterIP".to_string());
    if type_of(&*spec) != type_of(&desired_spec) {
        spec.type_ = desired_spec.type_.clone();
        changed = true;
    }
    if spec.selector != desired_spec.selector {
        spec.selector = desired_spec.selector.clone();
        changed = true;
    }
    if !ports_equal(
        spec.ports.as_deref().unwrap_or_default(),
        desired_spec.ports.as_deref().unwrap_or_default(),
    ) {
        spec.ports = desired_spec.ports.clone();
        changed = true;
    }
    changed
}

pub fn reconcile_secret(existing: &mut Secret, desired: &Secret) -> bool {
    reconcile_metadata(&mut existing.metadata, &desired.metadata)
}

pub fn reconcile_service_account(existing: &mut ServiceAccount, desired: &ServiceAccount) -> bool {
    reconcile_metadata(&mut existing.metadata, &desired.metadata)
}

pub fn reconcile_cluster_role(existing: &mut ClusterRole, desired: &ClusterRole) -> bool {
    let mut changed = reconcile_metadata(&mut existing.metadata, &desired.metadata);
    if !vec_equal(&existing.rules, &desired.rules) {
        existing.rules = desired.rules.clone();
        changed = true;
    }
    changed
}

/// Syncs subjects only: the role reference of a binding is immutable and a
/// changed one requires replacing the binding.
pub fn reconcile_cluster_role_binding(
    existing: &mut ClusterRoleBinding,
    desired: &ClusterRoleBinding,
) -> bool {
    let mut changed = reconcile_metadata(&mut existing.metadata, &desired.metadata);
    if !vec_equal(&existing.subjects, &desired.subjects) {
        existing.subjects = desired.subjects.clone();
        changed = true;
    }
    changed
}

/// Returns the env value of a container in a pod template.
pub fn template_env<'a>(
    template: &'a PodTemplateSpec,
    container: &str,
    name: &str,
) -> Option<&'a str> {
    template
        .spec
        .as_ref()?
        .containers
        .iter()
        .find(|c| c.name == container)?
        .env
        .as_ref()?
        .iter()
        .find(|e| e.name == name)?
        .value
        .as_deref()
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::{EnvVarSource, SecretVolumeSource};

    use super::*;
    use crate::types::DataPlaneSpec;

    fn dataplane() -> DataPlane {
        let mut dp = DataPlane::new("dp", DataPlaneSpec::default());
        dp.metadata.namespace = Some("default".to_string());
        dp.metadata.uid = Some("uid-dp".to_string());
        dp
    }

    fn live_deployment(dp: &DataPlane) -> Deployment {
        generate_dataplane_deployment(dp, DEFAULT_DATAPLANE_IMAGE, STATE_LIVE, "abc").unwrap()
    }

    fn proxy_mut(deployment: &mut Deployment) -> &mut Container {
        &mut deployment.spec.as_mut().unwrap().template.spec.as_mut().unwrap().containers[0]
    }

    fn q(s: &str) -> Quantity {
        Quantity(s.to_string())
    }

    #[test]
    fn quantities_compare_numerically() {
        assert!(quantities_equal(&q("1"), &q("1000m")));
        assert!(quantities_equal(&q("1Gi"), &q("1024Mi")));
        assert!(quantities_equal(&q("1k"), &q("1e3")));
        assert!(quantities_equal(&q("0.5"), &q("500m")));
        assert!(!quantities_equal(&q("1"), &q("1001m")));
        assert!(!quantities_equal(&q("1G"), &q("1Gi")));
        assert_eq!(parse_quantity("abc"), None);
        assert_eq!(parse_quantity("inf"), None);
    }

    #[test]
    fn resource_requirements_tolerate_equivalent_forms() {
        let a = ResourceRequirements {
            requests: Some(BTreeMap::from([
                ("cpu".to_string(), q("1")),
                ("memory".to_string(), q("1Gi")),
            ])),
            ..Default::default()
        };
        let b = ResourceRequirements {
            requests: Some(BTreeMap::from([
                ("cpu".to_string(), q("1000m")),
                ("memory".to_string(), q("1024Mi")),
            ])),
            limits: Some(BTreeMap::new()),
            ..Default::default()
        };
        assert!(resource_requirements_equal(Some(&a), Some(&b)));

        let c = ResourceRequirements {
            requests: Some(BTreeMap::from([("cpu".to_string(), q("2"))])),
            ..Default::default()
        };
        assert!(!resource_requirements_equal(Some(&a), Some(&c)));
        assert!(resource_requirements_equal(None, Some(&ResourceRequirements::default())));
    }

    #[test]
    fn dataplane_deployment_defaults() {
        let dp = dataplane();
        let deployment = live_deployment(&dp);
        let spec = deployment.spec.as_ref().unwrap();
        assert_eq!(spec.replicas, Some(1));
        assert_eq!(deployment_selector_value(&deployment), Some("abc"));

        let pod = spec.template.spec.as_ref().unwrap();
        assert_eq!(pod.containers.len(), 1);
        assert_eq!(pod.containers[0].image.as_deref(), Some(DEFAULT_DATAPLANE_IMAGE));
        assert_eq!(
            spec.template.metadata.as_ref().unwrap().labels.as_ref().unwrap()
                [DATAPLANE_SELECTOR_LABEL],
            "abc"
        );
        assert_eq!(
            deployment.metadata.finalizers,
            Some(vec![WAIT_FOR_OWNER_FINALIZER.to_string()])
        );
        assert_eq!(deployment.labels()[DATAPLANE_DEPLOYMENT_STATE_LABEL], STATE_LIVE);
        assert_eq!(deployment.owner_references()[0].uid, "uid-dp");
    }

    #[test]
    fn user_image_and_env_are_kept() {
        let mut dp = dataplane();
        dp.spec.options.deployment.pod_template_spec = Some(PodTemplateSpec {
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: DATAPLANE_PROXY_CONTAINER_NAME.to_string(),
                    image: Some("kong:3.5".to_string()),
                    env: Some(vec![EnvVar {
                        name: "KONG_DATABASE".to_string(),
                        value: Some("postgres".to_string()),
                        value_from: None,
                    }]),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            ..Default::default()
        });
        let deployment = live_deployment(&dp);
        let template = &deployment.spec.as_ref().unwrap().template;
        let proxy = &template.spec.as_ref().unwrap().containers[0];
        assert_eq!(proxy.image.as_deref(), Some("kong:3.5"));
        assert_eq!(
            template_env(template, DATAPLANE_PROXY_CONTAINER_NAME, "KONG_DATABASE"),
            Some("postgres")
        );
    }

    #[test]
    fn deployment_drift_detection() {
        let dp = dataplane();
        let desired = live_deployment(&dp);
        let mut existing = desired.clone();
        assert!(!reconcile_deployment(&mut existing, &desired));

        // Equivalent quantities are not drift.
        let mut with_resources = desired.clone();
        let mut desired_resources = desired.clone();
        for (deployment, cpu) in [(&mut with_resources, "1"), (&mut desired_resources, "1000m")] {
            proxy_mut(deployment).resources = Some(ResourceRequirements {
                limits: Some(BTreeMap::from([("cpu".to_string(), q(cpu))])),
                ..Default::default()
            });
        }
        assert!(!deployment_template_drift(&with_resources, &desired_resources));

        let mut changed_image = desired.clone();
        proxy_mut(&mut changed_image).image = Some("kong:3.6".to_string());
        assert!(deployment_template_drift(&existing, &changed_image));

        // The selector of the existing deployment survives an update.
        let other_selector =
            generate_dataplane_deployment(&dp, "kong:3.6", STATE_LIVE, "def").unwrap();
        assert!(reconcile_deployment(&mut existing, &other_selector));
        assert_eq!(deployment_selector_value(&existing), Some("abc"));
        assert_eq!(proxy_mut(&mut existing).image.as_deref(), Some("kong:3.6"));
    }

    // The stored copy carries the fields admission fills in.
    #[test]
    fn admission_defaults_are_not_drift() {
        let mut dp = dataplane();
        dp.spec.options.deployment.pod_template_spec = Some(PodTemplateSpec {
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: DATAPLANE_PROXY_CONTAINER_NAME.to_string(),
                    ports: Some(vec![ContainerPort {
                        name: Some("proxy".to_string()),
                        container_port: DATAPLANE_PROXY_PORT,
                        ..Default::default()
                    }]),
                    readiness_probe: Some(Probe {
                        http_get: Some(HTTPGetAction {
                            path: Some("/status".to_string()),
                            port: IntOrString::Int(DATAPLANE_METRICS_PORT),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }),
                    env: Some(vec![EnvVar {
                        name: "POD_NAME".to_string(),
                        value: None,
                        value_from: Some(EnvVarSource {
                            field_ref: Some(ObjectFieldSelector {
                                api_version: None,
                                field_path: "metadata.name".to_string(),
                            }),
                            ..Default::default()
                        }),
                    }]),
                    ..Default::default()
                }],
                volumes: Some(vec![Volume {
                    name: "certs".to_string(),
                    secret: Some(SecretVolumeSource {
                        secret_name: Some("certs".to_string()),
                        ..Default::default()
                    }),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        });
        let desired = live_deployment(&dp);

        let mut stored = desired.clone();
        let pod = stored.spec.as_mut().unwrap().template.spec.as_mut().unwrap();
        let proxy = &mut pod.containers[0];
        proxy.ports.as_mut().unwrap()[0].protocol = Some("TCP".to_string());
        let probe = proxy.readiness_probe.as_mut().unwrap();
        probe.http_get.as_mut().unwrap().scheme = Some("HTTP".to_string());
        probe.timeout_seconds = Some(1);
        probe.period_seconds = Some(10);
        probe.success_threshold = Some(1);
        probe.failure_threshold = Some(3);
        let env = proxy.env.as_mut().unwrap().iter_mut().find(|e| e.name == "POD_NAME").unwrap();
        let field_ref = env.value_from.as_mut().unwrap().field_ref.as_mut().unwrap();
        field_ref.api_version = Some("v1".to_string());
        pod.volumes.as_mut().unwrap()[0].secret.as_mut().unwrap().default_mode = Some(420);

        assert!(!deployment_template_drift(&stored, &desired));
        assert!(!reconcile_deployment(&mut stored, &desired));

        // An explicit value that differs from the default still counts.
        let mut stricter = desired.clone();
        proxy_mut(&mut stricter).readiness_probe.as_mut().unwrap().timeout_seconds = Some(5);
        assert!(deployment_template_drift(&stored, &stricter));
    }

    #[test]
    fn service_drift_keeps_server_assigned_fields() {
        let dp = dataplane();
        let desired = generate_dataplane_ingress_service(&dp, STATE_LIVE, Some("abc")).unwrap();
        let mut existing = desired.clone();
        let spec = existing.spec.as_mut().unwrap();
        spec.cluster_ip = Some("10.0.0.1".to_string());
        spec.ports.as_mut().unwrap()[0].node_port = Some(30080);
        assert!(!reconcile_service(&mut existing, &desired));

        let preview = generate_dataplane_ingress_service(&dp, STATE_LIVE, None).unwrap();
        assert!(reconcile_service(&mut existing, &preview));
        assert_eq!(service_selector_value(&existing), None);
        assert_eq!(existing.spec.as_ref().unwrap().cluster_ip.as_deref(), Some("10.0.0.1"));
    }

    #[test]
    fn controlplane_cluster_role_follows_image_version() {
        let mut cp = ControlPlane::new("cp", Default::default());
        cp.metadata.namespace = Some("default".to_string());
        cp.metadata.uid = Some("uid-cp".to_string());
        cp.spec.options.deployment.pod_template_spec = Some(PodTemplateSpec {
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: CONTROLPLANE_CONTROLLER_CONTAINER_NAME.to_string(),
                    image: Some("kong/kubernetes-ingress-controller:1.0".to_string()),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            ..Default::default()
        });
        assert!(matches!(
            generate_controlplane_cluster_role(&cp),
            Err(Error::Permissions(crate::PermissionsError::UnsupportedVersion(_)))
        ));

        cp.spec.options.deployment.pod_template_spec = None;
        let role = generate_controlplane_cluster_role(&cp).unwrap();
        assert_eq!(role.labels()[CONTROLPLANE_OWNER_UID_LABEL], "uid-cp");
        assert!(role.metadata.name.is_none());
    }
}
