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

use std::collections::BTreeMap;

use crate::consts::*;
use crate::resources::{owner_reference, reconcile_metadata};
use crate::types::{
    Address, ControlPlane, ControlPlaneOptions, ControlPlaneSpec, DataPlane, DataPlaneOptions,
    DataPlaneSpec, GatewayConfiguration,
};
use crate::utils::label_map;
use crate::*;

use gateway_api::apis::standard::{
    gatewayclasses::GatewayClass,
    gateways::{Gateway, GatewayStatus, GatewayStatusAddresses},
};
use kube::{core::ObjectMeta, ResourceExt};

/// Result of resolving the GatewayConfiguration of a Gateway's class.
#[derive(Debug)]
pub enum ConfigurationLookup {
    /// The class has no parametersRef.
    NotConfigured,
    Found(GatewayConfiguration),
    /// The referenced configuration does not exist; carries `namespace/name`.
    Missing(String),
}

pub async fn lookup_gateway_configuration<S: ObjectStore>(
    store: &S,
    gateway: &Gateway,
    gateway_class: &GatewayClass,
) -> Result<ConfigurationLookup> {
    let Some(params) = gateway_class.spec.parameters_ref.as_ref() else {
        return Ok(ConfigurationLookup::NotConfigured);
    };
    let namespace = params
        .namespace
        .clone()
        .or_else(|| gateway.namespace())
        .unwrap_or_default();
    match store
        .get::<GatewayConfiguration>(Some(&namespace), &params.name)
        .await?
    {
        Some(config) => Ok(ConfigurationLookup::Found(config)),
        None => Ok(ConfigurationLookup::Missing(format!("{namespace}/{}", params.name))),
    }
}

// Labels carried by the DataPlane and ControlPlane generated for a Gateway.
pub fn gateway_labels(gateway: &Gateway) -> BTreeMap<String, String> {
    label_map([
        (MANAGED_BY_LABEL, GATEWAY_MANAGED_LABEL_VALUE),
        (GATEWAY_OWNER_LABEL, &gateway.name_any()),
    ])
}

fn owned_metadata(gateway: &Gateway) -> Result<ObjectMeta> {
    Ok(ObjectMeta {
        generate_name: Some(format!("{}-", gateway.name_any())),
        namespace: gateway.namespace(),
        labels: Some(gateway_labels(gateway)),
        owner_references: Some(vec![owner_reference(gateway)?]),
        ..Default::default()
    })
}

pub fn generate_dataplane(gateway: &Gateway, options: DataPlaneOptions) -> Result<DataPlane> {
    Ok(DataPlane {
        metadata: owned_metadata(gateway)?,
        spec: DataPlaneSpec { options },
        status: None,
    })
}

pub fn generate_controlplane(
    gateway: &Gateway,
    options: ControlPlaneOptions,
) -> Result<ControlPlane> {
    Ok(ControlPlane {
        metadata: owned_metadata(gateway)?,
        spec: ControlPlaneSpec { options },
        status: None,
    })
}

pub fn reconcile_owned_dataplane(existing: &mut DataPlane, desired: &DataPlane) -> bool {
    let mut changed = reconcile_metadata(&mut existing.metadata, &desired.metadata);
    if existing.spec != desired.spec {
        existing.spec = desired.spec.clone();
        changed = true;
    }
    changed
}

pub fn reconcile_owned_controlplane(existing: &mut ControlPlane, desired: &ControlPlane) -> bool {
    let mut changed = reconcile_metadata(&mut existing.metadata, &desired.metadata);
    if existing.spec != desired.spec {
        existing.spec = desired.spec.clone();
        changed = true;
    }
    changed
}

// Copies the DataPlane's addresses into the Gateway's status. Returns whether
// they changed.
pub fn set_gateway_status_addresses(gateway: &mut Gateway, addresses: &[Address]) -> bool {
    let desired: Vec<GatewayStatusAddresses> = addresses
        .iter()
        .map(|address| GatewayStatusAddresses {
            r#type: address.type_.clone(),
            value: address.value.clone(),
        })
        .collect();

    let status = gateway.status.get_or_insert_with(GatewayStatus::default);
    let current: Vec<(Option<String>, String)> = status
        .addresses
        .iter()
        .flatten()
        .map(|a| (a.r#type.clone(), a.value.clone()))
        .collect();
    let wanted: Vec<(Option<String>, String)> = desired
        .iter()
        .map(|a| (a.r#type.clone(), a.value.clone()))
        .collect();
    if current == wanted {
        return false;
    }
    status.addresses = Some(desired);
    true
}
