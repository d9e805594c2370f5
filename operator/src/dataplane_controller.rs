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
    collections::BTreeMap,
    ops::Sub,
    sync::Arc,
    time::Instant,
};

use crate::{
    consts::*,
    dataplane_bluegreen::{reconcile_generations, Generations, PreviewGeneration, RolloutState},
    ensure::{add_finalizer, list_children, remove_finalizer},
    resources::{dataplane_service_labels, deployment_selector_value},
    store::StoredObject,
    types::{Address, DataPlane, RolloutStatus, RolloutStatusDeployment, RolloutStatusServices},
    utils::{
        is_being_deleted, is_owned_by, label_map, new_condition, set_condition, upsert_condition,
        ConditionStatus,
    },
    *,
};

use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Secret, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1 as metav1;
use kube::{
    api::{Api, ListParams},
    runtime::{controller::Action, watcher, Controller},
    Resource, ResourceExt,
};
use tracing::{debug, info};

const ADDRESS_TYPE_IP: &str = "IPAddress";
const ADDRESS_TYPE_HOSTNAME: &str = "Hostname";

pub async fn reconcile<S: ObjectStore>(
    dataplane: Arc<DataPlane>,
    ctx: Arc<Context<S>>,
) -> Result<Action> {
    let start = Instant::now();
    let store = &ctx.store;

    let name = dataplane
        .metadata
        .name
        .clone()
        .ok_or(Error::InvalidConfigError("invalid name".to_string()))?;
    let ns = dataplane
        .metadata
        .namespace
        .clone()
        .ok_or(Error::InvalidConfigError("invalid namespace".to_string()))?;

    if is_being_deleted(dataplane.as_ref()) {
        info!(%name, %ns, "dataplane is being deleted; releasing its children");
        release_children(store, dataplane.as_ref()).await?;
        remove_finalizer(store, dataplane.as_ref(), DATAPLANE_FINALIZER).await?;
        return Ok(Action::await_change());
    }

    let dp = add_finalizer(store, dataplane.as_ref(), DATAPLANE_FINALIZER).await?;
    let generations = reconcile_generations(store, &dp, &ctx.config.dataplane_image).await?;

    let mut dp = generations.dataplane.clone();
    let before = dp.status.clone();
    set_dataplane_status(&mut dp, &generations);
    if dp.status != before {
        debug!(%name, %ns, "updating dataplane status");
        store.update_status(&dp).await?;
    }

    let duration = Instant::now().sub(start);
    info!("finished reconciling in {:?} ms", duration.as_millis());
    Ok(requeue_after_success(dataplane.as_ref(), &ctx))
}

// Strips the wait-for-owner finalizer from every child, including those
// already marked for deletion, so the garbage collector can sweep them.
async fn release_children<S: ObjectStore>(store: &S, dp: &DataPlane) -> Result<()> {
    let Some(uid) = dp.uid() else {
        return Ok(());
    };
    let labels = label_map([
        (MANAGED_BY_LABEL, DATAPLANE_MANAGED_LABEL_VALUE),
        (APP_LABEL, &dp.name_any()),
    ]);
    let ns = dp.namespace();
    release::<S, Deployment>(store, ns.as_deref(), &labels, &uid).await?;
    release::<S, Service>(store, ns.as_deref(), &labels, &uid).await?;
    release::<S, Secret>(store, ns.as_deref(), &labels, &uid).await
}

async fn release<S: ObjectStore, K: StoredObject>(
    store: &S,
    namespace: Option<&str>,
    labels: &BTreeMap<String, String>,
    owner_uid: &str,
) -> Result<()> {
    let children: Vec<K> = store.list(namespace, labels).await?;
    for child in children.iter().filter(|c| is_owned_by(*c, owner_uid)) {
        remove_finalizer(store, child, WAIT_FOR_OWNER_FINALIZER).await?;
    }
    Ok(())
}

/// Names of the live ingress and admin services of a DataPlane.
pub(crate) async fn live_service_names<S: ObjectStore>(
    store: &S,
    dp: &DataPlane,
) -> Result<(Option<String>, Option<String>)> {
    let Some(uid) = dp.uid() else {
        return Ok((None, None));
    };
    let ns = dp.namespace();
    let mut names = vec![];
    for service_type in [SERVICE_TYPE_INGRESS, SERVICE_TYPE_ADMIN] {
        let labels = dataplane_service_labels(dp, STATE_LIVE, service_type);
        let services: Vec<Service> =
            list_children(store, ns.as_deref(), &labels, Some(&uid)).await?;
        names.push(services.first().map(|s| s.name_any()));
    }
    let admin = names.pop().flatten();
    let ingress = names.pop().flatten();
    Ok((ingress, admin))
}

pub(crate) fn service_addresses(service: &Service) -> Vec<Address> {
    let from_load_balancer: Vec<Address> = service
        .status
        .as_ref()
        .and_then(|s| s.load_balancer.as_ref())
        .and_then(|lb| lb.ingress.as_ref())
        .map(|ingress| {
            ingress
                .iter()
                .filter_map(|i| match (&i.ip, &i.hostname) {
                    (Some(ip), _) => Some(Address {
                        type_: Some(ADDRESS_TYPE_IP.to_string()),
                        value: ip.clone(),
                    }),
                    (None, Some(hostname)) => Some(Address {
                        type_: Some(ADDRESS_TYPE_HOSTNAME.to_string()),
                        value: hostname.clone(),
                    }),
                    (None, None) => None,
                })
                .collect()
        })
        .unwrap_or_default();
    if !from_load_balancer.is_empty() {
        return from_load_balancer;
    }

    service
        .spec
        .as_ref()
        .and_then(|s| s.cluster_ip.as_ref())
        .filter(|ip| !ip.is_empty() && ip.as_str() != "None")
        .map(|ip| {
            vec![Address {
                type_: Some(ADDRESS_TYPE_IP.to_string()),
                value: ip.clone(),
            }]
        })
        .unwrap_or_default()
}

fn rolled_out_condition(state: RolloutState, generation: Option<i64>) -> metav1::Condition {
    match state {
        RolloutState::Stable => new_condition(
            CONDITION_ROLLED_OUT,
            ConditionStatus::True,
            REASON_ROLLOUT_PROMOTION_DONE,
            "live generation is up to date",
            generation,
        ),
        RolloutState::Progressing => new_condition(
            CONDITION_ROLLED_OUT,
            ConditionStatus::False,
            REASON_ROLLOUT_PROGRESSING,
            "preview deployment is not ready yet",
            generation,
        ),
        RolloutState::AwaitingPromotion => new_condition(
            CONDITION_ROLLED_OUT,
            ConditionStatus::False,
            REASON_ROLLOUT_AWAITING_PROMOTION,
            format!(
                "preview is ready; set {DATAPLANE_PROMOTE_WHEN_READY_ANNOTATION}=\
                 {DATAPLANE_PROMOTE_WHEN_READY_TRUE} to promote it"
            ),
            generation,
        ),
        RolloutState::Promoting => new_condition(
            CONDITION_ROLLED_OUT,
            ConditionStatus::False,
            REASON_ROLLOUT_PROMOTING,
            "preview will be promoted once ready",
            generation,
        ),
    }
}

fn rollout_status(
    mut current: RolloutStatus,
    state: RolloutState,
    preview: Option<&PreviewGeneration>,
    generation: Option<i64>,
) -> RolloutStatus {
    upsert_condition(&mut current.conditions, rolled_out_condition(state, generation));
    current.deployment = preview.map(|p| RolloutStatusDeployment {
        selector: deployment_selector_value(&p.deployment).map(str::to_string),
    });
    current.services = preview.map(|p| RolloutStatusServices {
        ingress: Some(p.ingress.name_any()),
        admin: Some(p.admin.name_any()),
    });
    current
}

fn set_dataplane_status(dp: &mut DataPlane, generations: &Generations) {
    let generation = dp.meta().generation;
    let live_status = generations.live.status.clone().unwrap_or_default();
    let desired_replicas = generations
        .live
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(1);
    let ready_replicas = live_status.ready_replicas.unwrap_or(0);
    let provisioned = ready_replicas >= desired_replicas;

    let status = dp.status.get_or_insert_with(Default::default);
    status.selector = deployment_selector_value(&generations.live).map(str::to_string);
    status.replicas = live_status.replicas.unwrap_or(0);
    status.ready_replicas = ready_replicas;
    status.service = Some(generations.live_ingress.name_any());
    let addresses = service_addresses(&generations.live_ingress);
    status.addresses = (!addresses.is_empty()).then_some(addresses);
    let current = status.rollout_status.take().unwrap_or_default();
    status.rollout_status = generations
        .rollout
        .map(|state| rollout_status(current, state, generations.preview.as_ref(), generation));

    let message = format!("{ready_replicas}/{desired_replicas} pods ready");
    let (state, provisioned_reason, ready_reason, ready_message) = if provisioned {
        (ConditionStatus::True, REASON_PODS_READY, REASON_READY, String::new())
    } else {
        (ConditionStatus::False, REASON_PODS_NOT_READY, REASON_PODS_NOT_READY, message.clone())
    };
    set_condition(
        dp,
        new_condition(CONDITION_PROVISIONED, state, provisioned_reason, message, generation),
    );
    set_condition(
        dp,
        new_condition(CONDITION_READY, state, ready_reason, ready_message, generation),
    );
}

pub async fn controller(ctx: Context) -> Result<()> {
    let client = ctx.store.client();
    let dataplane = Api::<DataPlane>::all(client.clone());
    dataplane
        .list(&ListParams::default().limit(1))
        .await
        .map_err(Error::CRDNotFoundError)?;

    Controller::new(dataplane, watcher::Config::default().any_semantic())
        .owns(Api::<Deployment>::all(client.clone()), watcher::Config::default())
        .owns(Api::<Service>::all(client.clone()), watcher::Config::default())
        .owns(Api::<Secret>::all(client), watcher::Config::default())
        .shutdown_on_signal()
        .run(
            reconcile::<KubeStore>,
            error_policy::<DataPlane, KubeStore>,
            Arc::new(ctx),
        )
        .for_each(|res| {
            if let Err(error) = res {
                debug!("reconcile loop error: {error:?}");
            }
            futures::future::ready(())
        })
        .await;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{
        LoadBalancerIngress, LoadBalancerStatus, ServiceSpec, ServiceStatus,
    };

    #[test]
    fn addresses_prefer_load_balancer_ingress() {
        let mut service = Service {
            spec: Some(ServiceSpec {
                cluster_ip: Some("10.0.0.7".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(
            service_addresses(&service),
            vec![Address {
                type_: Some(ADDRESS_TYPE_IP.to_string()),
                value: "10.0.0.7".to_string()
            }]
        );

        service.status = Some(ServiceStatus {
            load_balancer: Some(LoadBalancerStatus {
                ingress: Some(vec![
                    LoadBalancerIngress {
                        ip: Some("203.0.113.4".to_string()),
                        ..Default::default()
                    },
                    LoadBalancerIngress {
                        hostname: Some("lb.example.com".to_string()),
                        ..Default::default()
                    },
                ]),
            }),
            ..Default::default()
        });
        let addresses = service_addresses(&service);
        assert_eq!(addresses.len(), 2);
        assert_eq!(addresses[0].value, "203.0.113.4");
        assert_eq!(addresses[1].type_.as_deref(), Some(ADDRESS_TYPE_HOSTNAME));
    }

    #[test]
    fn headless_service_has_no_address() {
        let service = Service {
            spec: Some(ServiceSpec {
                cluster_ip: Some("None".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(service_addresses(&service).is_empty());
    }
}
