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

//! Folds a Gateway's GatewayConfiguration and the built-in defaults into the
//! options of the DataPlane and ControlPlane generated for it.

use std::collections::BTreeSet;

use gateway_api::apis::standard::gateways::Gateway;
use k8s_openapi::api::core::v1::{Container, EnvVar};
use kube::ResourceExt;

use crate::consts::*;
use crate::types::{ControlPlaneOptions, DataPlaneOptions, GatewayConfiguration};
use crate::utils::get_pod_container_by_name_mut;

/// Options composed for one Gateway.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct GatewayOptions {
    pub dataplane: DataPlaneOptions,
    pub controlplane: ControlPlaneOptions,
    /// Env names the user set on the controller container. Defaults never
    /// replace them.
    pub dont_override: BTreeSet<String>,
}

/// Values injected into the controller container unless the user set them.
#[derive(Clone, Debug, Default)]
pub struct ControlPlaneDefaults<'a> {
    pub namespace: &'a str,
    pub dataplane_ingress_service: Option<&'a str>,
    pub dataplane_admin_service: Option<&'a str>,
    pub gateway_controller_name: Option<&'a str>,
    pub managed_by_gateway: bool,
    pub controlplane_name: Option<&'a str>,
}

/// Composes the options for `gateway` from its configuration. The
/// configuration is only read; every default lands in the returned copy.
pub fn compose_options(
    gateway: &Gateway,
    config: Option<&GatewayConfiguration>,
    default_controlplane_image: &str,
) -> GatewayOptions {
    let spec = config.map(|c| c.spec.clone()).unwrap_or_default();
    let dataplane = spec.data_plane_options.unwrap_or_default();
    let mut controlplane = spec.control_plane_options.unwrap_or_default();

    let container = controller_container(&mut controlplane, default_controlplane_image);
    let dont_override = container
        .env
        .iter()
        .flatten()
        .map(|env| env.name.clone())
        .collect();

    tracing::debug!(
        gateway = %gateway.name_any(),
        configuration = ?config.map(|c| c.name_any()),
        "composed gateway options"
    );

    GatewayOptions {
        dataplane,
        controlplane,
        dont_override,
    }
}

impl GatewayOptions {
    /// Points the control plane at `dataplane_name` (unless configured) and
    /// injects the defaults that depend on the generated objects.
    pub fn apply_controlplane_defaults(
        &mut self,
        dataplane_name: &str,
        defaults: &ControlPlaneDefaults,
    ) {
        if self.controlplane.data_plane.as_deref().map_or(true, str::is_empty) {
            self.controlplane.data_plane = Some(dataplane_name.to_string());
        }
        set_controlplane_defaults(&mut self.controlplane, &self.dont_override, defaults);
    }
}

// Returns the controller container, synthesizing it from the default image
// when the pod template has none.
pub(crate) fn controller_container<'a>(
    options: &'a mut ControlPlaneOptions,
    default_image: &str,
) -> &'a mut Container {
    let template = options
        .deployment
        .pod_template_spec
        .get_or_insert_with(Default::default);
    let spec = template.spec.get_or_insert_with(Default::default);
    if get_pod_container_by_name_mut(spec, CONTROLPLANE_CONTROLLER_CONTAINER_NAME).is_none() {
        spec.containers.push(Container {
            name: CONTROLPLANE_CONTROLLER_CONTAINER_NAME.to_string(),
            image: Some(default_image.to_string()),
            ..Default::default()
        });
    }
    let index = spec
        .containers
        .iter()
        .position(|c| c.name == CONTROLPLANE_CONTROLLER_CONTAINER_NAME)
        .unwrap_or_default();
    &mut spec.containers[index]
}

fn upsert_env(container: &mut Container, name: &str, value: String) -> bool {
    let env = container.env.get_or_insert_with(Vec::new);
    match env.iter_mut().find(|e| e.name == name) {
        Some(existing)
            if existing.value.as_deref() == Some(value.as_str()) && existing.value_from.is_none() =>
        {
            false
        }
        Some(existing) => {
            existing.value = Some(value);
            existing.value_from = None;
            true
        }
        None => {
            env.push(EnvVar {
                name: name.to_string(),
                value: Some(value),
                value_from: None,
            });
            true
        }
    }
}

/// Injects the control plane defaults into the controller container, skipping
/// every env name in `dont_override`. Returns whether anything changed.
pub fn set_controlplane_defaults(
    options: &mut ControlPlaneOptions,
    dont_override: &BTreeSet<String>,
    defaults: &ControlPlaneDefaults,
) -> bool {
    let mut changed = false;
    if options.deployment.replicas.is_none() {
        options.deployment.replicas = Some(1);
        changed = true;
    }

    let namespace = defaults.namespace;
    let mut values: Vec<(&str, String)> = vec![(ENV_POD_NAMESPACE, namespace.to_string())];
    if let Some(service) = defaults.dataplane_ingress_service {
        values.push((ENV_PUBLISH_SERVICE, format!("{namespace}/{service}")));
    }
    if let Some(service) = defaults.dataplane_admin_service {
        values.push((ENV_ADMIN_SERVICE, format!("{namespace}/{service}")));
    }
    if let Some(controller_name) = defaults.gateway_controller_name {
        values.push((ENV_GATEWAY_CONTROLLER_NAME, controller_name.to_string()));
    }
    if let Some(name) = defaults.controlplane_name {
        values.push((ENV_ELECTION_ID, format!("{name}.{OPERATOR_API_GROUP}")));
    }
    if defaults.managed_by_gateway {
        values.push((ENV_MANAGED_BY_GATEWAY, "true".to_string()));
    }

    let template = options
        .deployment
        .pod_template_spec
        .get_or_insert_with(Default::default);
    let spec = template.spec.get_or_insert_with(Default::default);
    let Some(container) =
        get_pod_container_by_name_mut(spec, CONTROLPLANE_CONTROLLER_CONTAINER_NAME)
    else {
        return changed;
    };
    for (name, value) in values {
        if dont_override.contains(name) {
            continue;
        }
        changed |= upsert_env(container, name, value);
    }
    changed
}

/// Env names already present on the controller container of `options`.
pub fn controller_env_names(options: &ControlPlaneOptions) -> BTreeSet<String> {
    options
        .deployment
        .pod_template_spec
        .as_ref()
        .and_then(|t| t.spec.as_ref())
        .and_then(|s| {
            s.containers
                .iter()
                .find(|c| c.name == CONTROLPLANE_CONTROLLER_CONTAINER_NAME)
        })
        .and_then(|c| c.env.as_ref())
        .map(|env| env.iter().map(|e| e.name.clone()).collect())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::template_env;
    use crate::types::GatewayConfigurationSpec;
    use k8s_openapi::api::core::v1::{PodSpec, PodTemplateSpec};
    use serde_json::json;

    fn gateway() -> Gateway {
        serde_json::from_value(json!({
            "apiVersion": "gateway.networking.k8s.io/v1",
            "kind": "Gateway",
            "metadata": { "name": "gw", "namespace": "default" },
            "spec": { "gatewayClassName": "kong", "listeners": [] }
        }))
        .unwrap()
    }

    fn env(name: &str, value: &str) -> EnvVar {
        EnvVar {
            name: name.to_string(),
            value: Some(value.to_string()),
            value_from: None,
        }
    }

    fn defaults() -> ControlPlaneDefaults<'static> {
        ControlPlaneDefaults {
            namespace: "default",
            dataplane_ingress_service: Some("dataplane-ingress-abc"),
            dataplane_admin_service: Some("dataplane-admin-abc"),
            gateway_controller_name: Some(DEFAULT_CONTROLLER_NAME),
            managed_by_gateway: true,
            controlplane_name: None,
        }
    }

    fn controller_template(options: &ControlPlaneOptions) -> &PodTemplateSpec {
        options.deployment.pod_template_spec.as_ref().unwrap()
    }

    #[test]
    fn missing_options_are_allocated_and_controller_synthesized() {
        let options = compose_options(&gateway(), None, DEFAULT_CONTROLPLANE_IMAGE);
        assert_eq!(options.dataplane, DataPlaneOptions::default());
        assert!(options.dont_override.is_empty());

        let template = controller_template(&options.controlplane);
        let containers = &template.spec.as_ref().unwrap().containers;
        assert_eq!(containers.len(), 1);
        assert_eq!(containers[0].name, CONTROLPLANE_CONTROLLER_CONTAINER_NAME);
        assert_eq!(containers[0].image.as_deref(), Some(DEFAULT_CONTROLPLANE_IMAGE));
    }

    #[test]
    fn user_env_wins_over_defaults() {
        let config = GatewayConfiguration::new(
            "config",
            GatewayConfigurationSpec {
                data_plane_options: None,
                control_plane_options: Some(ControlPlaneOptions {
                    deployment: crate::types::ControlPlaneDeploymentOptions {
                        replicas: Some(2),
                        pod_template_spec: Some(PodTemplateSpec {
                            metadata: None,
                            spec: Some(PodSpec {
                                containers: vec![Container {
                                    name: CONTROLPLANE_CONTROLLER_CONTAINER_NAME.to_string(),
                                    image: Some(
                                        "kong/kubernetes-ingress-controller:2.12".to_string(),
                                    ),
                                    env: Some(vec![
                                        env(ENV_POD_NAMESPACE, "custom"),
                                        env(ENV_PUBLISH_SERVICE, "other/proxy"),
                                    ]),
                                    ..Default::default()
                                }],
                                ..Default::default()
                            }),
                        }),
                    },
                    data_plane: None,
                }),
            },
        );
        let stored = config.clone();

        let mut options = compose_options(&gateway(), Some(&config), DEFAULT_CONTROLPLANE_IMAGE);
        assert_eq!(
            options.dont_override,
            BTreeSet::from([ENV_POD_NAMESPACE.to_string(), ENV_PUBLISH_SERVICE.to_string()])
        );
        options.apply_controlplane_defaults("dataplane-gw-abc", &defaults());

        let template = controller_template(&options.controlplane);
        let container = CONTROLPLANE_CONTROLLER_CONTAINER_NAME;
        assert_eq!(template_env(template, container, ENV_POD_NAMESPACE), Some("custom"));
        assert_eq!(template_env(template, container, ENV_PUBLISH_SERVICE), Some("other/proxy"));
        assert_eq!(
            template_env(template, container, ENV_ADMIN_SERVICE),
            Some("default/dataplane-admin-abc")
        );
        assert_eq!(template_env(template, container, ENV_MANAGED_BY_GATEWAY), Some("true"));
        assert_eq!(options.controlplane.data_plane.as_deref(), Some("dataplane-gw-abc"));
        assert_eq!(options.controlplane.deployment.replicas, Some(2));

        // The stored configuration is never touched.
        assert_eq!(config.spec, stored.spec);
        assert_eq!(config.metadata, stored.metadata);
    }

    #[test]
    fn defaults_are_stable() {
        let mut options = compose_options(&gateway(), None, DEFAULT_CONTROLPLANE_IMAGE);
        options.apply_controlplane_defaults("dp", &defaults());
        let first = options.controlplane.clone();

        let dont_override = controller_env_names(&first);
        let mut again = first.clone();
        assert!(!set_controlplane_defaults(&mut again, &dont_override, &defaults()));
        assert!(!set_controlplane_defaults(&mut again, &BTreeSet::new(), &defaults()));
        assert_eq!(again, first);
    }

    #[test]
    fn configured_dataplane_name_is_kept() {
        let mut options = compose_options(&gateway(), None, DEFAULT_CONTROLPLANE_IMAGE);
        options.controlplane.data_plane = Some("mine".to_string());
        options.apply_controlplane_defaults("generated", &defaults());
        assert_eq!(options.controlplane.data_plane.as_deref(), Some("mine"));
    }
}
