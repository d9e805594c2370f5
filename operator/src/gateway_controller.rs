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

use std::{
    ops::Sub,
    sync::Arc,
    time::Instant,
};

use crate::{
    consts::*,
    ensure::{ensure_child, list_children},
    gateway_config::{compose_options, ControlPlaneDefaults},
    gateway_watch::*,
    types::{ControlPlane, DataPlane, GatewayConfiguration},
    utils::{is_condition_true, new_condition, set_condition, ConditionStatus},
    *,
};
use gateway_utils::*;

use futures::StreamExt;
use gateway_api::apis::standard::gateways::Gateway;
use gateway_api::apis::standard::{
    constants::{GatewayConditionReason, GatewayConditionType},
    gatewayclasses::GatewayClass,
};
use kube::{
    api::{Api, ListParams},
    runtime::{controller::Action, watcher, Controller},
    Resource, ResourceExt,
};
use tracing::{debug, info};

pub async fn reconcile<S: ObjectStore>(
    gateway: Arc<Gateway>,
    ctx: Arc<Context<S>>,
) -> Result<Action> {
    let start = Instant::now();
    let store = &ctx.store;

    let name = gateway
        .metadata
        .name
        .clone()
        .ok_or(Error::InvalidConfigError("invalid name".to_string()))?;
    let ns = gateway
        .metadata
        .namespace
        .clone()
        .ok_or(Error::InvalidConfigError("invalid namespace".to_string()))?;
    let uid = gateway
        .uid()
        .ok_or(Error::InvalidConfigError("gateway has no uid".to_string()))?;

    let class_name = gateway.spec.gateway_class_name.as_str();
    let Some(gateway_class) = store.get::<GatewayClass>(None, class_name).await? else {
        let message = format!("GatewayClass {class_name} not found");
        info!(%name, %ns, "{message}");
        let mut gw = gateway.as_ref().clone();
        report_unresolved(store, &mut gw, REASON_NO_SUCH_GATEWAY_CLASS, message).await?;
        return Ok(Action::requeue(ctx.config.referential_requeue()));
    };

    // Only reconcile the Gateway object if it belongs to our controller's gateway class.
    if gateway_class.spec.controller_name != ctx.config.controller_name {
        return Ok(Action::await_change());
    }

    // Only reconcile the Gateway object if our GatewayClass has already been accepted
    if !gatewayclass_utils::is_accepted(&gateway_class) {
        debug!(class_name, "GatewayClass not yet accepted");
        return Ok(Action::await_change());
    }

    let mut gw = gateway.as_ref().clone();
    let generation = gw.meta().generation;
    let accepted_type = GatewayConditionType::Accepted.to_string();

    let config = match lookup_gateway_configuration(store, &gw, &gateway_class).await? {
        ConfigurationLookup::NotConfigured => None,
        ConfigurationLookup::Found(config) => Some(config),
        ConfigurationLookup::Missing(key) => {
            let message = format!("GatewayConfiguration {key} not found");
            info!(%name, %ns, "{message}");
            report_unresolved(store, &mut gw, REASON_INVALID_PARAMETERS, message).await?;
            return Ok(Action::requeue(ctx.config.referential_requeue()));
        }
    };

    let mut changed = set_condition(
        &mut gw,
        new_condition(
            CONDITION_SCHEDULED,
            ConditionStatus::True,
            REASON_SCHEDULED,
            "gateway scheduled",
            generation,
        ),
    );
    changed |= set_condition(
        &mut gw,
        new_condition(
            &accepted_type,
            ConditionStatus::True,
            &GatewayConditionReason::Accepted.to_string(),
            "gateway accepted",
            generation,
        ),
    );

    let mut options = compose_options(&gw, config.as_ref(), &ctx.config.controlplane_image);
    let labels = gateway_labels(&gw);

    let desired_dataplane = generate_dataplane(&gw, options.dataplane.clone())?;
    let (dataplane, dataplane_outcome) = ensure_child(
        store,
        Some(&uid),
        &labels,
        desired_dataplane,
        reconcile_owned_dataplane,
    )
    .await?;
    debug!(
        %name,
        dataplane = %dataplane.name_any(),
        outcome = ?dataplane_outcome,
        "ensured dataplane"
    );

    let (ingress_service, admin_service) =
        dataplane_controller::live_service_names(store, &dataplane).await?;
    let existing_controlplane: Option<ControlPlane> =
        list_children::<S, ControlPlane>(store, Some(&ns), &labels, Some(&uid))
            .await?
            .into_iter()
            .next();
    let controlplane_name = existing_controlplane.as_ref().map(|cp| cp.name_any());
    options.apply_controlplane_defaults(
        &dataplane.name_any(),
        &ControlPlaneDefaults {
            namespace: &ns,
            dataplane_ingress_service: ingress_service.as_deref(),
            dataplane_admin_service: admin_service.as_deref(),
            gateway_controller_name: Some(&ctx.config.controller_name),
            managed_by_gateway: true,
            controlplane_name: controlplane_name.as_deref(),
        },
    );

    let desired_controlplane = generate_controlplane(&gw, options.controlplane)?;
    let (controlplane, controlplane_outcome) = ensure_child(
        store,
        Some(&uid),
        &labels,
        desired_controlplane,
        reconcile_owned_controlplane,
    )
    .await?;
    debug!(
        %name,
        controlplane = %controlplane.name_any(),
        outcome = ?controlplane_outcome,
        "ensured controlplane"
    );

    changed |= set_dependency_conditions(&mut gw, &dataplane, &controlplane);
    let addresses = dataplane
        .status
        .as_ref()
        .and_then(|s| s.addresses.clone())
        .unwrap_or_default();
    changed |= set_gateway_status_addresses(&mut gw, &addresses);

    if changed {
        store.update_status(&gw).await?;
    }

    let duration = Instant::now().sub(start);
    info!("finished reconciling in {:?} ms", duration.as_millis());
    Ok(requeue_after_success(gateway.as_ref(), &ctx))
}

// Records a reference that could not be resolved as Scheduled=False and
// Accepted=False with the given reason.
async fn report_unresolved<S: ObjectStore>(
    store: &S,
    gw: &mut Gateway,
    reason: &str,
    message: String,
) -> Result<()> {
    let generation = gw.meta().generation;
    let accepted_type = GatewayConditionType::Accepted.to_string();
    let mut changed = set_condition(
        gw,
        new_condition(CONDITION_SCHEDULED, ConditionStatus::False, reason, &message, generation),
    );
    changed |= set_condition(
        gw,
        new_condition(&accepted_type, ConditionStatus::False, reason, message, generation),
    );
    if changed {
        store.update_status(&*gw).await?;
    }
    Ok(())
}

// Derives Provisioned, Ready and Programmed from the generated objects.
fn set_dependency_conditions(
    gw: &mut Gateway,
    dataplane: &DataPlane,
    controlplane: &ControlPlane,
) -> bool {
    let generation = gw.meta().generation;
    let provisioned = is_condition_true(dataplane, CONDITION_PROVISIONED)
        && is_condition_true(controlplane, CONDITION_PROVISIONED);
    let ready = is_condition_true(dataplane, CONDITION_READY)
        && is_condition_true(controlplane, CONDITION_READY);

    let (status, reason, message) = if provisioned {
        (ConditionStatus::True, REASON_PROVISIONED, "dataplane and controlplane provisioned")
    } else {
        (ConditionStatus::False, REASON_PROVISIONING, "waiting for dataplane and controlplane")
    };
    let mut changed = set_condition(
        gw,
        new_condition(CONDITION_PROVISIONED, status, reason, message, generation),
    );

    let (status, reason, message) = if ready {
        (ConditionStatus::True, REASON_READY, "")
    } else {
        (
            ConditionStatus::False,
            REASON_DEPENDENCIES_NOT_READY,
            "dataplane or controlplane not ready",
        )
    };
    changed |= set_condition(
        gw,
        new_condition(CONDITION_READY, status, reason, message, generation),
    );

    let (status, reason, message) = if ready {
        (
            ConditionStatus::True,
            GatewayConditionReason::Programmed,
            "dataplane configured for gateway",
        )
    } else {
        (ConditionStatus::False, GatewayConditionReason::AddressNotAssigned, "dataplane not ready")
    };
    changed |= set_condition(
        gw,
        new_condition(
            &GatewayConditionType::Programmed.to_string(),
            status,
            &reason.to_string(),
            message,
            generation,
        ),
    );
    changed
}

pub async fn controller(ctx: Context) -> Result<()> {
    let client = ctx.store.client();
    let gateway = Api::<Gateway>::all(client.clone());
    gateway
        .list(&ListParams::default().limit(1))
        .await
        .map_err(Error::CRDNotFoundError)?;

    let classes = CachedLister::spawn(Api::<GatewayClass>::all(client.clone()));
    let gateways = CachedLister::spawn(gateway.clone());
    let controller_name = ctx.config.controller_name.clone();

    let class_mapper = {
        let gateways = gateways.clone();
        let controller_name = controller_name.clone();
        move |class: GatewayClass| {
            if !gateway_class_matches_controller(&class, &controller_name) {
                return vec![];
            }
            gateways_for_gateway_class(&class, gateways.list())
        }
    };
    let config_mapper = {
        let classes = classes.clone();
        let controller_name = controller_name.clone();
        move |config: GatewayConfiguration| {
            let matches =
                gateway_configuration_matches_controller(&config, classes.list(), &controller_name);
            if !matches {
                return vec![];
            }
            gateways_for_gateway_configuration(&config, classes.list(), gateways.list())
        }
    };

    // Cheap class check against the cache before the authoritative one in reconcile.
    let reconciler = move |gw: Arc<Gateway>, ctx: Arc<Context>| {
        let cached_class = classes.get(None, &gw.spec.gateway_class_name);
        let relevant =
            gateway_has_matching_class(gw.as_ref(), cached_class, &ctx.config.controller_name);
        async move {
            if !relevant {
                debug!(name = %gw.name_any(), "dropping gateway of another controller");
                return Ok(Action::await_change());
            }
            reconcile(gw, ctx).await
        }
    };

    Controller::new(gateway, watcher::Config::default().any_semantic())
        .owns(Api::<DataPlane>::all(client.clone()), watcher::Config::default())
        .owns(Api::<ControlPlane>::all(client.clone()), watcher::Config::default())
        .watches(Api::<GatewayClass>::all(client.clone()), watcher::Config::default(), class_mapper)
        .watches(
            Api::<GatewayConfiguration>::all(client),
            watcher::Config::default(),
            config_mapper,
        )
        .shutdown_on_signal()
        .run(reconciler, error_policy::<Gateway, KubeStore>, Arc::new(ctx))
        .for_each(|res| {
            if let Err(error) = res {
                debug!("reconcile loop error: {error:?}");
            }
            futures::future::ready(())
        })
        .await;

    Ok(())
}
