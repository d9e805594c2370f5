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

//! Custom resources owned by the operator: DataPlane, ControlPlane and
//! GatewayConfiguration.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::PodTemplateSpec;
use k8s_openapi::apimachinery::pkg::apis::meta::v1 as metav1;
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::consts::{DATAPLANE_PROMOTE_WHEN_READY_ANNOTATION, DATAPLANE_PROMOTE_WHEN_READY_TRUE};

// -----------------------------------------------------------------------------
// DataPlane
// -----------------------------------------------------------------------------

#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    group = "gateway-operator.blixt.dev",
    version = "v1beta1",
    kind = "DataPlane",
    plural = "dataplanes",
    shortname = "dp",
    namespaced,
    status = "DataPlaneStatus"
)]
pub struct DataPlaneSpec {
    #[serde(flatten)]
    pub options: DataPlaneOptions,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DataPlaneOptions {
    #[serde(default)]
    pub deployment: DataPlaneDeploymentOptions,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<DataPlaneNetworkOptions>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DataPlaneDeploymentOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_template_spec: Option<PodTemplateSpec>,
    /// Rollout strategy applied when the deployment options change.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollout: Option<Rollout>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Rollout {
    #[serde(default)]
    pub strategy: RolloutStrategy,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RolloutStrategy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blue_green: Option<BlueGreenStrategy>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BlueGreenStrategy {
    #[serde(default)]
    pub promotion: Promotion,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Promotion {
    #[serde(default)]
    pub strategy: PromotionStrategy,
}

/// How traffic is moved onto a preview generation.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum PromotionStrategy {
    /// Preview services get no endpoints until the preview is promoted.
    #[default]
    BreakBeforeMake,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DataPlaneNetworkOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub services: Option<DataPlaneServices>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DataPlaneServices {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingress: Option<ServiceOptions>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServiceOptions {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub type_: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DataPlaneStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<metav1::Condition>>,
    /// Name of the live ingress service.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub addresses: Option<Vec<Address>>,
    /// Selector value of the live pods.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
    #[serde(default)]
    pub replicas: i32,
    #[serde(default)]
    pub ready_replicas: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollout_status: Option<RolloutStatus>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Address {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub type_: Option<String>,
    pub value: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RolloutStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<metav1::Condition>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment: Option<RolloutStatusDeployment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub services: Option<RolloutStatusServices>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RolloutStatusDeployment {
    /// Selector value of the preview pods.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RolloutStatusServices {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingress: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin: Option<String>,
}

impl DataPlane {
    pub fn blue_green(&self) -> Option<&BlueGreenStrategy> {
        self.spec
            .options
            .deployment
            .rollout
            .as_ref()
            .and_then(|rollout| rollout.strategy.blue_green.as_ref())
    }

    /// Whether the promotion trigger annotation is set to its truthy value.
    pub fn promotion_requested(&self) -> bool {
        self.annotations()
            .get(DATAPLANE_PROMOTE_WHEN_READY_ANNOTATION)
            .is_some_and(|v| v == DATAPLANE_PROMOTE_WHEN_READY_TRUE)
    }
}

// -----------------------------------------------------------------------------
// ControlPlane
// -----------------------------------------------------------------------------

#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    group = "gateway-operator.blixt.dev",
    version = "v1beta1",
    kind = "ControlPlane",
    plural = "controlplanes",
    shortname = "cp",
    namespaced,
    status = "ControlPlaneStatus"
)]
pub struct ControlPlaneSpec {
    #[serde(flatten)]
    pub options: ControlPlaneOptions,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ControlPlaneOptions {
    #[serde(default)]
    pub deployment: ControlPlaneDeploymentOptions,
    /// Name of the DataPlane this ControlPlane configures.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_plane: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ControlPlaneDeploymentOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_template_spec: Option<PodTemplateSpec>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ControlPlaneStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<metav1::Condition>>,
}

// -----------------------------------------------------------------------------
// GatewayConfiguration
// -----------------------------------------------------------------------------

#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    group = "gateway-operator.blixt.dev",
    version = "v1beta1",
    kind = "GatewayConfiguration",
    plural = "gatewayconfigurations",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfigurationSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_plane_options: Option<DataPlaneOptions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_plane_options: Option<ControlPlaneOptions>,
}
