use gateway_api::apis::standard::{gatewayclasses::GatewayClass, gateways::Gateway};
use k8s_openapi::apimachinery::pkg::apis::meta::v1 as metav1;
use kube::Resource;

use crate::types::{ControlPlane, DataPlane};

/// Capability of any object whose status carries a list of conditions.
pub trait HasConditions: Resource {
    fn get_conditions(&self) -> Option<&Vec<metav1::Condition>>;

    fn get_conditions_mut(&mut self) -> &mut Option<Vec<metav1::Condition>>;

    fn generation(&self) -> Option<i64> {
        self.meta().generation
    }
}

impl HasConditions for Gateway {
    fn get_conditions(&self) -> Option<&Vec<metav1::Condition>> {
        self.status.as_ref().and_then(|s| s.conditions.as_ref())
    }

    fn get_conditions_mut(&mut self) -> &mut Option<Vec<metav1::Condition>> {
        &mut self.status.get_or_insert_with(Default::default).conditions
    }
}

impl HasConditions for GatewayClass {
    fn get_conditions(&self) -> Option<&Vec<metav1::Condition>> {
        self.status.as_ref().and_then(|s| s.conditions.as_ref())
    }

    fn get_conditions_mut(&mut self) -> &mut Option<Vec<metav1::Condition>> {
        &mut self.status.get_or_insert_with(Default::default).conditions
    }
}

impl HasConditions for DataPlane {
    fn get_conditions(&self) -> Option<&Vec<metav1::Condition>> {
        self.status.as_ref().and_then(|s| s.conditions.as_ref())
    }

    fn get_conditions_mut(&mut self) -> &mut Option<Vec<metav1::Condition>> {
        &mut self.status.get_or_insert_with(Default::default).conditions
    }
}

impl HasConditions for ControlPlane {
    fn get_conditions(&self) -> Option<&Vec<metav1::Condition>> {
        self.status.as_ref().and_then(|s| s.conditions.as_ref())
    }

    fn get_conditions_mut(&mut self) -> &mut Option<Vec<metav1::Condition>> {
        &mut self.status.get_or_insert_with(Default::default).conditions
    }
}
