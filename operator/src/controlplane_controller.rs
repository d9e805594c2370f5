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
    ensure::{add_finalizer, ensure_child, list_children, remove_finalizer},
    gateway_config::{
        controller_container, controller_env_names, set_controlplane_defaults, ControlPlaneDefaults,
    },
    gateway_watch::{controlplanes_for_dataplane, CachedLister},
    resources::*,
    types::{ControlPlane, DataPlane},
    utils::{is_being_deleted, new_condition, set_condition, ConditionStatus},
    *,
};

use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::ServiceAccount;
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding};
use kube::{
    api::{Api, ListParams},
    runtime::{controller::Action, watcher, Controller},
    Resource, ResourceExt,
};
use tracing::{debug, info, warn};

pub async fn reconcile<S: ObjectStore>(
    controlplane: Arc<ControlPlane>,
    ctx: Arc<Context<S>>,
) -> Result<Action> {
    let start = Instant::now();
    let store = &ctx.store;

    let name = controlplane
        .metadata
        .name
        .clone()
        .ok_or(Error::InvalidConfigError("invalid name".to_string()))?;
    let ns = controlplane
        .metadata
        .namespace
        .clone()
        .ok_or(Error::InvalidConfigError("invalid namespace".to_string()))?;

    if is_being_deleted(controlplane.as_ref()) {
        info!(%name, %ns, "controlplane is being deleted; removing cluster-wide objects");
        delete_cluster_objects(store, controlplane.as_ref()).await?;
        remove_finalizer(store, controlplane.as_ref(), CONTROLPLANE_FINALIZER).await?;
        return Ok(Action::await_change());
    }

    let mut cp = add_finalizer(store, controlplane.as_ref(), CONTROLPLANE_FINALIZER).await?;
    let uid = cp
        .uid()
        .ok_or(Error::InvalidConfigError("controlplane has no uid".to_string()))?;
    let generation = cp.meta().generation;
    let image = ctx.config.controlplane_image.as_str();

    let dataplane = match cp.spec.options.data_plane.as_deref().filter(|n| !n.is_empty()) {
        Some(dataplane_name) => store.get::<DataPlane>(Some(&ns), dataplane_name).await?,
        None => None,
    };

    // Defaults only land in the generated objects, never in the ControlPlane.
    let mut effective = cp.clone();
    controller_container(&mut effective.spec.options, image);
    if let Some(dataplane) = &dataplane {
        let (ingress, admin) = dataplane_controller::live_service_names(store, dataplane).await?;
        let dont_override = controller_env_names(&cp.spec.options);
        set_controlplane_defaults(
            &mut effective.spec.options,
            &dont_override,
            &ControlPlaneDefaults {
                namespace: &ns,
                dataplane_ingress_service: ingress.as_deref(),
                dataplane_admin_service: admin.as_deref(),
                gateway_controller_name: None,
                managed_by_gateway: false,
                controlplane_name: Some(&name),
            },
        );
    }

    let role = match generate_controlplane_cluster_role(&effective) {
        Ok(role) => role,
        Err(Error::Permissions(error)) => {
            warn!(%name, %ns, "cannot resolve permissions for the controlplane image: {error}");
            let condition = new_condition(
                CONDITION_PROVISIONED,
                ConditionStatus::False,
                REASON_UNSUPPORTED_IMAGE,
                error.to_string(),
                generation,
            );
            if set_condition(&mut cp, condition) {
                store.update_status(&cp).await?;
            }
            return Ok(Action::await_change());
        }
        Err(error) => return Err(error),
    };

    let labels = controlplane_labels(&cp);
    let (service_account, _) = ensure_child(
        store,
        Some(&uid),
        &labels,
        generate_controlplane_service_account(&cp)?,
        reconcile_service_account,
    )
    .await?;

    let cluster_labels = controlplane_cluster_labels(&cp);
    let (role, _) = ensure_child(store, None, &cluster_labels, role, reconcile_cluster_role).await?;
    let binding = generate_controlplane_cluster_role_binding(
        &cp,
        &role.name_any(),
        &service_account.name_any(),
    );
    ensure_cluster_role_binding(store, &cluster_labels, binding).await?;

    let replicas = match &dataplane {
        Some(_) => effective.spec.options.deployment.replicas.unwrap_or(1),
        None => 0,
    };
    let desired =
        generate_controlplane_deployment(&effective, image, &service_account.name_any(), replicas)?;
    let (deployment, outcome) =
        ensure_child(store, Some(&uid), &labels, desired, reconcile_deployment).await?;
    debug!(%name, deployment = %deployment.name_any(), ?outcome, "ensured controlplane deployment");

    let mut changed = false;
    match &dataplane {
        None => {
            let message = "no dataplane set or found; scaled to zero";
            for type_ in [CONDITION_SCHEDULED, CONDITION_PROVISIONED, CONDITION_READY] {
                changed |= set_condition(
                    &mut cp,
                    new_condition(
                        type_,
                        ConditionStatus::False,
                        REASON_NO_DATAPLANE,
                        message,
                        generation,
                    ),
                );
            }
        }
        Some(dataplane) => {
            changed |= set_condition(
                &mut cp,
                new_condition(
                    CONDITION_SCHEDULED,
                    ConditionStatus::True,
                    REASON_DATAPLANE_SET,
                    format!("configuring dataplane {}", dataplane.name_any()),
                    generation,
                ),
            );
            let ready_replicas = deployment
                .status
                .as_ref()
                .and_then(|s| s.ready_replicas)
                .unwrap_or(0);
            let message = format!("{ready_replicas}/{replicas} pods ready");
            let (status, reason) = if ready_replicas >= replicas {
                (ConditionStatus::True, REASON_PODS_READY)
            } else {
                (ConditionStatus::False, REASON_PODS_NOT_READY)
            };
            changed |= set_condition(
                &mut cp,
                new_condition(CONDITION_PROVISIONED, status, reason, &message, generation),
            );
            let ready_reason = if status == ConditionStatus::True {
                REASON_READY
            } else {
                REASON_PODS_NOT_READY
            };
            changed |= set_condition(
                &mut cp,
                new_condition(CONDITION_READY, status, ready_reason, message, generation),
            );
        }
    }
    if changed {
        store.update_status(&cp).await?;
    }

    let duration = Instant::now().sub(start);
    info!("finished reconciling in {:?} ms", duration.as_millis());
    Ok(requeue_after_success(controlplane.as_ref(), &ctx))
}

// The role reference of a binding is immutable, so a binding pointing at
// another role is replaced.
async fn ensure_cluster_role_binding<S: ObjectStore>(
    store: &S,
    labels: &BTreeMap<String, String>,
    desired: ClusterRoleBinding,
) -> Result<ClusterRoleBinding> {
    let existing: Vec<ClusterRoleBinding> = list_children(store, None, labels, None).await?;
    for binding in existing.iter().filter(|b| b.role_ref != desired.role_ref) {
        info!(
            binding = %binding.name_any(),
            role = %desired.role_ref.name,
            "replacing cluster role binding"
        );
        store.delete::<ClusterRoleBinding>(None, &binding.name_any()).await?;
    }
    let (binding, _) =
        ensure_child(store, None, labels, desired, reconcile_cluster_role_binding).await?;
    Ok(binding)
}

async fn delete_cluster_objects<S: ObjectStore>(store: &S, cp: &ControlPlane) -> Result<()> {
    if cp.uid().is_none() {
        return Ok(());
    }
    let labels = controlplane_cluster_labels(cp);
    for binding in store.list::<ClusterRoleBinding>(None, &labels).await? {
        store.delete::<ClusterRoleBinding>(None, &binding.name_any()).await?;
    }
    for role in store.list::<ClusterRole>(None, &labels).await? {
        store.delete::<ClusterRole>(None, &role.name_any()).await?;
    }
    Ok(())
}

pub async fn controller(ctx: Context) -> Result<()> {
    let client = ctx.store.client();
    let controlplane = Api::<ControlPlane>::all(client.clone());
    controlplane
        .list(&ListParams::default().limit(1))
        .await
        .map_err(Error::CRDNotFoundError)?;

    let controlplanes = CachedLister::spawn(controlplane.clone());

    Controller::new(controlplane, watcher::Config::default().any_semantic())
        .owns(Api::<Deployment>::all(client.clone()), watcher::Config::default())
        .owns(Api::<ServiceAccount>::all(client.clone()), watcher::Config::default())
        .watches(
            Api::<DataPlane>::all(client),
            watcher::Config::default(),
            move |dataplane: DataPlane| {
                controlplanes_for_dataplane(&dataplane, controlplanes.list())
            },
        )
        .shutdown_on_signal()
        .run(
            reconcile::<KubeStore>,
            error_policy::<ControlPlane, KubeStore>,
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
    use crate::memory_store::MemoryStore;
    use crate::traits::HasConditions;
    use crate::types::{ControlPlaneSpec, DataPlaneSpec};
    use crate::utils::get_condition;
    use k8s_openapi::api::core::v1::{Container, PodSpec, PodTemplateSpec};

    const NS: &str = "default";

    async fn setup(
        image: Option<&str>,
        dataplane: Option<&str>,
    ) -> (MemoryStore, Arc<Context<MemoryStore>>) {
        let store = MemoryStore::new();
        let mut cp = ControlPlane::new("cp", ControlPlaneSpec::default());
        cp.metadata.namespace = Some(NS.to_string());
        cp.spec.options.data_plane = dataplane.map(str::to_string);
        cp.spec.options.deployment.pod_template_spec = image.map(|image| PodTemplateSpec {
            metadata: None,
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: CONTROLPLANE_CONTROLLER_CONTAINER_NAME.to_string(),
                    image: Some(image.to_string()),
                    ..Default::default()
                }],
                ..Default::default()
            }),
        });
        store.create(&cp).await.unwrap();
        let ctx = Arc::new(Context::new(store.clone(), crate::Config::default()));
        (store, ctx)
    }

    async fn run(store: &MemoryStore, ctx: &Arc<Context<MemoryStore>>) -> Action {
        let cp: ControlPlane = store.get(Some(NS), "cp").await.unwrap().unwrap();
        reconcile(Arc::new(cp), ctx.clone()).await.unwrap()
    }

    async fn condition(store: &MemoryStore, type_: &str) -> Option<(String, String, String)> {
        let cp: ControlPlane = store.get(Some(NS), "cp").await.unwrap().unwrap();
        get_condition(cp.get_conditions(), type_)
            .map(|c| (c.status.clone(), c.reason.clone(), c.message.clone()))
    }

    fn env<'a>(deployment: &'a Deployment, name: &str) -> Option<&'a str> {
        template_env(
            &deployment.spec.as_ref().unwrap().template,
            CONTROLPLANE_CONTROLLER_CONTAINER_NAME,
            name,
        )
    }

    #[tokio::test]
    async fn missing_dataplane_scales_to_zero() {
        let (store, ctx) = setup(None, None).await;
        run(&store, &ctx).await;

        let (status, reason, _) = condition(&store, CONDITION_SCHEDULED).await.unwrap();
        assert_eq!(status, "False");
        assert_eq!(reason, REASON_NO_DATAPLANE);

        let deployments = store.all::<Deployment>(Some(NS));
        assert_eq!(deployments.len(), 1);
        assert_eq!(deployments[0].spec.as_ref().unwrap().replicas, Some(0));
        assert_eq!(store.all::<ServiceAccount>(Some(NS)).len(), 1);
        assert_eq!(store.all::<ClusterRole>(None).len(), 1);
        assert_eq!(store.all::<ClusterRoleBinding>(None).len(), 1);
    }

    #[tokio::test]
    async fn unsupported_image_is_reported_verbatim() {
        let (store, ctx) = setup(Some("kong/kubernetes-ingress-controller:1.0.0"), None).await;
        let action = run(&store, &ctx).await;
        assert_eq!(action, Action::await_change());

        let (status, reason, message) = condition(&store, CONDITION_PROVISIONED).await.unwrap();
        assert_eq!(status, "False");
        assert_eq!(reason, REASON_UNSUPPORTED_IMAGE);
        assert_eq!(message, "version 1.0.0 not supported");
        assert!(store.all::<Deployment>(Some(NS)).is_empty());
    }

    #[tokio::test]
    async fn dataplane_services_are_published() {
        let (store, ctx) = setup(None, Some("dp")).await;
        let mut dp = DataPlane::new("dp", DataPlaneSpec::default());
        dp.metadata.namespace = Some(NS.to_string());
        let dp = store.create(&dp).await.unwrap();
        crate::dataplane_controller::reconcile(Arc::new(dp.clone()), ctx.clone())
            .await
            .unwrap();
        let (ingress, admin) = crate::dataplane_controller::live_service_names(&store, &dp)
            .await
            .unwrap();

        run(&store, &ctx).await;
        let deployment = store
            .all::<Deployment>(Some(NS))
            .into_iter()
            .find(|d| {
                d.labels().get(MANAGED_BY_LABEL).map(String::as_str)
                    == Some(CONTROLPLANE_MANAGED_LABEL_VALUE)
            })
            .unwrap();
        assert_eq!(deployment.spec.as_ref().unwrap().replicas, Some(1));
        let publish_service = format!("{NS}/{}", ingress.unwrap());
        let admin_service = format!("{NS}/{}", admin.unwrap());
        let election_id = format!("cp.{OPERATOR_API_GROUP}");
        assert_eq!(env(&deployment, ENV_PUBLISH_SERVICE), Some(publish_service.as_str()));
        assert_eq!(env(&deployment, ENV_ADMIN_SERVICE), Some(admin_service.as_str()));
        assert_eq!(env(&deployment, ENV_ELECTION_ID), Some(election_id.as_str()));
        assert_eq!(env(&deployment, ENV_MANAGED_BY_GATEWAY), None);

        let (status, reason, _) = condition(&store, CONDITION_SCHEDULED).await.unwrap();
        assert_eq!(status, "True");
        assert_eq!(reason, REASON_DATAPLANE_SET);
        let (status, reason, _) = condition(&store, CONDITION_PROVISIONED).await.unwrap();
        assert_eq!(status, "False");
        assert_eq!(reason, REASON_PODS_NOT_READY);

        // The ControlPlane itself keeps its user-provided spec.
        let cp: ControlPlane = store.get(Some(NS), "cp").await.unwrap().unwrap();
        assert!(cp.spec.options.deployment.pod_template_spec.is_none());
    }

    #[tokio::test]
    async fn stale_binding_is_replaced() {
        let (store, ctx) = setup(None, None).await;
        run(&store, &ctx).await;
        let role = store.all::<ClusterRole>(None).remove(0);
        let binding = store.all::<ClusterRoleBinding>(None).remove(0);
        store.mutate::<ClusterRoleBinding>(None, &binding.name_any(), |b| {
            b.role_ref.name = "stale".to_string()
        });

        run(&store, &ctx).await;
        let bindings = store.all::<ClusterRoleBinding>(None);
        assert_eq!(bindings.len(), 1);
        assert_ne!(bindings[0].name_any(), binding.name_any());
        assert_eq!(bindings[0].role_ref.name, role.name_any());
    }

    #[tokio::test]
    async fn deletion_removes_cluster_objects() {
        let (store, ctx) = setup(Some("kong/kubernetes-ingress-controller:2.6.1"), None).await;
        run(&store, &ctx).await;
        assert_eq!(store.all::<ClusterRole>(None).len(), 1);

        store.delete::<ControlPlane>(Some(NS), "cp").await.unwrap();
        run(&store, &ctx).await;
        assert!(store.get::<ControlPlane>(Some(NS), "cp").await.unwrap().is_none());
        assert!(store.all::<ClusterRole>(None).is_empty());
        assert!(store.all::<ClusterRoleBinding>(None).is_empty());
    }
}
