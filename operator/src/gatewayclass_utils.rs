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

use crate::consts::REASON_INVALID_PARAMETERS;
use crate::gateway_watch::GATEWAY_CONFIGURATION_KIND;
use crate::utils::{is_condition_true, new_condition, set_condition, ConditionStatus};
use crate::*;

use gateway_api::apis::standard::{
    constants::{GatewayConditionReason, GatewayConditionType},
    gatewayclasses::GatewayClass,
};
use kube::ResourceExt;

pub fn is_accepted(gateway_class: &GatewayClass) -> bool {
    is_condition_true(gateway_class, &GatewayConditionType::Accepted.to_string())
}

// Checks that the parametersRef, if any, names a GatewayConfiguration.
pub fn validate_parameters_ref(gateway_class: &GatewayClass) -> std::result::Result<(), String> {
    let Some(params) = gateway_class.spec.parameters_ref.as_ref() else {
        return Ok(());
    };
    if params.group != consts::OPERATOR_API_GROUP || params.kind != GATEWAY_CONFIGURATION_KIND {
        return Err(format!(
            "parametersRef must reference a {}.{}, got {}.{}",
            GATEWAY_CONFIGURATION_KIND,
            consts::OPERATOR_API_GROUP,
            params.kind,
            params.group
        ));
    }
    Ok(())
}

pub fn accept(gateway_class: &mut GatewayClass) -> bool {
    let accepted = new_condition(
        &GatewayConditionType::Accepted.to_string(),
        ConditionStatus::True,
        &GatewayConditionReason::Accepted.to_string(),
        format!(
            "{} accepts responsibility for this GatewayClass",
            gateway_class.spec.controller_name
        ),
        gateway_class.metadata.generation,
    );
    set_condition(gateway_class, accepted)
}

pub fn reject(gateway_class: &mut GatewayClass, message: String) -> bool {
    let rejected = new_condition(
        &GatewayConditionType::Accepted.to_string(),
        ConditionStatus::False,
        REASON_INVALID_PARAMETERS,
        message,
        gateway_class.metadata.generation,
    );
    set_condition(gateway_class, rejected)
}

// Marks the class accepted, or rejected when its parameters are invalid.
// Returns whether the status changed.
pub fn evaluate(gateway_class: &mut GatewayClass) -> bool {
    match validate_parameters_ref(gateway_class) {
        Ok(()) => accept(gateway_class),
        Err(message) => {
            tracing::info!(name = %gateway_class.name_any(), "rejecting gateway class: {message}");
            reject(gateway_class, message)
        }
    }
}
