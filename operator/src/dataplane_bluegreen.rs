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

//! Blue/green rollout of a DataPlane's deployment, services and TLS secret.
//!
//! A DataPlane has one `live` generation serving traffic. With the blue/green
//! strategy, a pod template change creates a `preview` generation next to it.
//! Preview services carry no selector and therefore no endpoints. Once the
//! promotion annotation is present and the preview is ready, the live services
//! are re-pointed at the preview pods, the preview deployment is relabelled as
//! live and the superseded objects are deleted.

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Secret, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;
use tracing::{debug, info, warn};

use crate::consts::*;
use crate::ensure::{delete_child, ensure_child, list_children};
use crate::resources::*;
use crate::store::{ObjectStore, StoredObject};
use crate::types::DataPlane;
use crate::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum RolloutState {
    /// Only the live generation exists and it matches the spec.
    Stable,
    /// The preview generation exists but is not ready yet.
    Progressing,
    /// The preview is ready and waits for the promotion annotation.
    AwaitingPromotion,
    /// The promotion annotation is set; the preview is promoted once ready.
    /// A request made while no preview exists is dropped.
    Promoting,
}

pub(crate) struct PreviewGeneration {
    pub deployment: Deployment,
    pub ingress: Service,
    pub admin: Service,
}

/// Children of a DataPlane after one rollout pass.
pub(crate) struct Generations {
    /// Latest copy of the DataPlane, which promotion writes to.
    pub dataplane: DataPlane,
    pub live: Deployment,
    pub live_ingress: Service,
    pub preview: Option<PreviewGeneration>,
    /// Rollout progress, for blue/green DataPlanes only.
    pub rollout: Option<RolloutState>,
}

struct Scope<'a> {
    dataplane: &'a DataPlane,
    uid: String,
    namespace: Option<String>,
}

impl Scope<'_> {
    async fn children<S: ObjectStore, K: StoredObject>(
        &self,
        store: &S,
        labels: &std::collections::BTreeMap<String, String>,
    ) -> Result<Vec<K>> {
        list_children(store, self.namespace.as_deref(), labels, Some(&self.uid)).await
    }
}

pub(crate) async fn reconcile_generations<S: ObjectStore>(
    store: &S,
    dp: &DataPlane,
    default_image: &str,
) -> Result<Generations> {
    let uid = dp
        .uid()
        .ok_or(Error::InvalidConfigError("dataplane has no uid".to_string()))?;
    let scope = Scope {
        dataplane: dp,
        uid,
        namespace: dp.namespace(),
    };
    let blue_green = dp.blue_green().is_some();
    let mut dataplane = dp.clone();

    ensure_child(
        store,
        Some(&scope.uid),
        &dataplane_generation_labels(dp, STATE_LIVE),
        generate_dataplane_tls_secret(dp, STATE_LIVE)?,
        reconcile_secret,
    )
    .await?;

    let live_ingress_services: Vec<Service> = scope
        .children(store, &dataplane_service_labels(dp, STATE_LIVE, SERVICE_TYPE_INGRESS))
        .await?;
    let live_admin_services: Vec<Service> = scope
        .children(store, &dataplane_service_labels(dp, STATE_LIVE, SERVICE_TYPE_ADMIN))
        .await?;
    let routed_selector = live_ingress_services
        .first()
        .and_then(service_selector_value)
        .map(str::to_string);

    let (mut live, superseded) =
        live_deployment(store, &scope, default_image, routed_selector.as_deref()).await?;
    if superseded {
        // A promotion was interrupted after the preview got relabelled.
        finish_promotion(store, &scope, &[]).await?;
        if dataplane.promotion_requested() {
            dataplane = clear_promotion_annotation(store, &dataplane).await?;
        }
    }

    let mut previews: Vec<Deployment> = scope
        .children(store, &dataplane_deployment_labels(dp, STATE_PREVIEW))
        .await?;
    for extra in previews.iter().skip(1) {
        warn!(name = %extra.name_any(), "deleting extra preview deployment");
        delete_child(store, extra).await?;
    }
    previews.truncate(1);
    let mut preview = previews.pop();

    let promotion_candidate = match preview.take() {
        Some(candidate) if blue_green && dataplane.promotion_requested() => Some(candidate),
        other => {
            preview = other;
            None
        }
    };
    if let Some(candidate) = promotion_candidate {
        // A live service already routing to the preview means an earlier pass
        // got past re-pointing.
        let routed = routed_selector.is_some()
            && routed_selector.as_deref() == deployment_selector_value(&candidate);
        let ready = preview_ready(
            dp,
            default_image,
            &candidate,
            live_ingress_services.first(),
            live_admin_services.first(),
        )?;
        if ready || routed {
            let live_services: Vec<&Service> =
                live_ingress_services.iter().chain(live_admin_services.first()).collect();
            let promoted = promote(store, &scope, &candidate, &live_services, &live).await?;
            dataplane = clear_promotion_annotation(store, &dataplane).await?;
            info!(
                name = %dp.name_any(),
                selector = ?deployment_selector_value(&promoted),
                "promoted preview generation"
            );
            live = promoted;
        } else {
            preview = Some(candidate);
        }
    }

    let live_selector = deployment_selector_value(&live)
        .ok_or(Error::InvalidConfigError(format!(
            "deployment {} has no selector",
            live.name_any()
        )))?
        .to_string();
    let desired_live =
        generate_dataplane_deployment(dp, default_image, STATE_LIVE, &live_selector)?;

    let mut preview_generation = None;
    let mut rollout = blue_green.then_some(RolloutState::Stable);
    if blue_green && deployment_template_drift(&live, &desired_live) {
        let mut merged = live.clone();
        if merge_replicas(&mut merged, &desired_live) {
            live = store.update(&merged).await?;
        }
        let generation = ensure_preview(store, &scope, default_image, preview).await?;
        let ready = preview_ready(
            dp,
            default_image,
            &generation.deployment,
            live_ingress_services.first(),
            live_admin_services.first(),
        )?;
        rollout = Some(if dataplane.promotion_requested() {
            RolloutState::Promoting
        } else if ready {
            RolloutState::AwaitingPromotion
        } else {
            RolloutState::Progressing
        });
        preview_generation = Some(generation);
    } else {
        let mut merged = live.clone();
        if reconcile_deployment(&mut merged, &desired_live) {
            debug!(name = %live.name_any(), "updating live deployment in place");
            live = store.update(&merged).await?;
        }
        retire_preview(store, &scope, preview.as_ref()).await?;
        if dataplane.promotion_requested() {
            debug!(name = %dp.name_any(), "no rollout in flight, dropping promotion request");
            dataplane = clear_promotion_annotation(store, &dataplane).await?;
        }
    }

    let (live_ingress, _) = ensure_child(
        store,
        Some(&scope.uid),
        &dataplane_service_labels(dp, STATE_LIVE, SERVICE_TYPE_INGRESS),
        generate_dataplane_ingress_service(dp, STATE_LIVE, Some(&live_selector))?,
        reconcile_service,
    )
    .await?;
    ensure_child(
        store,
        Some(&scope.uid),
        &dataplane_service_labels(dp, STATE_LIVE, SERVICE_TYPE_ADMIN),
        generate_dataplane_admin_service(dp, STATE_LIVE, Some(&live_selector))?,
        reconcile_service,
    )
    .await?;

    Ok(Generations {
        dataplane,
        live,
        live_ingress,
        preview: preview_generation,
        rollout,
    })
}

// Returns the live deployment, creating it when missing. When several exist,
// the one the live ingress routes to wins and the rest are deleted; the second
// value reports whether that happened.
async fn live_deployment<S: ObjectStore>(
    store: &S,
    scope: &Scope<'_>,
    default_image: &str,
    routed_selector: Option<&str>,
) -> Result<(Deployment, bool)> {
    let dp = scope.dataplane;
    let mut lives: Vec<Deployment> = scope
        .children(store, &dataplane_deployment_labels(dp, STATE_LIVE))
        .await?;

    if lives.is_empty() {
        let template = dp.spec.options.deployment.pod_template_spec.as_ref();
        let selector = new_selector_value(&scope.uid, template);
        let desired = generate_dataplane_deployment(dp, default_image, STATE_LIVE, &selector)?;
        let created = store.create(&desired).await?;
        info!(name = %created.name_any(), %selector, "created live deployment");
        return Ok((created, false));
    }
    if lives.len() == 1 {
        return Ok((lives.remove(0), false));
    }

    let keep = routed_selector
        .and_then(|selector| {
            lives
                .iter()
                .position(|d| deployment_selector_value(d) == Some(selector))
        })
        .unwrap_or(0);
    let kept = lives.remove(keep);
    for extra in &lives {
        warn!(
            name = %extra.name_any(),
            kept = %kept.name_any(),
            "deleting superseded live deployment"
        );
        delete_child(store, extra).await?;
    }
    Ok((kept, true))
}

/// Whether the preview deployment can take over: it has an available
/// replica for its current spec, matches the desired template, and the live
/// services do not route to it yet.
fn preview_ready(
    dp: &DataPlane,
    default_image: &str,
    preview: &Deployment,
    live_ingress: Option<&Service>,
    live_admin: Option<&Service>,
) -> Result<bool> {
    let Some(selector) = deployment_selector_value(preview) else {
        return Ok(false);
    };
    let status = preview.status.clone().unwrap_or_default();
    let available = status.available_replicas.unwrap_or(0) >= 1;
    let observed = match (status.observed_generation, preview.metadata.generation) {
        (Some(observed), Some(generation)) => observed >= generation,
        _ => true,
    };
    let routed = [live_ingress, live_admin]
        .into_iter()
        .flatten()
        .any(|svc| service_selector_value(svc) == Some(selector));
    let desired = generate_dataplane_deployment(dp, default_image, STATE_PREVIEW, selector)?;
    Ok(available && observed && !routed && !deployment_template_drift(preview, &desired))
}

// Creates or updates the preview deployment with its isolated services and
// secret.
async fn ensure_preview<S: ObjectStore>(
    store: &S,
    scope: &Scope<'_>,
    default_image: &str,
    existing: Option<Deployment>,
) -> Result<PreviewGeneration> {
    let dp = scope.dataplane;
    let deployment = match existing {
        None => {
            let template = dp.spec.options.deployment.pod_template_spec.as_ref();
            let selector = new_selector_value(&scope.uid, template);
            let desired =
                generate_dataplane_deployment(dp, default_image, STATE_PREVIEW, &selector)?;
            let created = store.create(&desired).await?;
            info!(name = %created.name_any(), %selector, "created preview deployment");
            created
        }
        Some(mut preview) => {
            let selector = deployment_selector_value(&preview).unwrap_or_default().to_string();
            let desired =
                generate_dataplane_deployment(dp, default_image, STATE_PREVIEW, &selector)?;
            if reconcile_deployment(&mut preview, &desired) {
                debug!(name = %preview.name_any(), "updating preview deployment");
                store.update(&preview).await?
            } else {
                preview
            }
        }
    };

    ensure_child(
        store,
        Some(&scope.uid),
        &dataplane_generation_labels(dp, STATE_PREVIEW),
        generate_dataplane_tls_secret(dp, STATE_PREVIEW)?,
        reconcile_secret,
    )
    .await?;
    let (ingress, _) = ensure_child(
        store,
        Some(&scope.uid),
        &dataplane_service_labels(dp, STATE_PREVIEW, SERVICE_TYPE_INGRESS),
        generate_dataplane_ingress_service(dp, STATE_PREVIEW, None)?,
        reconcile_service,
    )
    .await?;
    let (admin, _) = ensure_child(
        store,
        Some(&scope.uid),
        &dataplane_service_labels(dp, STATE_PREVIEW, SERVICE_TYPE_ADMIN),
        generate_dataplane_admin_service(dp, STATE_PREVIEW, None)?,
        reconcile_service,
    )
    .await?;

    Ok(PreviewGeneration {
        deployment,
        ingress,
        admin,
    })
}

async fn promote<S: ObjectStore>(
    store: &S,
    scope: &Scope<'_>,
    preview: &Deployment,
    live_services: &[&Service],
    former_live: &Deployment,
) -> Result<Deployment> {
    let selector = deployment_selector_value(preview)
        .ok_or(Error::InvalidConfigError(format!(
            "deployment {} has no selector",
            preview.name_any()
        )))?
        .to_string();

    // Traffic moves first; nothing is deleted until the store shows it moved.
    for service in live_services {
        if service_selector_value(service) != Some(selector.as_str()) {
            let mut repointed = (*service).clone();
            repointed.spec.get_or_insert_with(Default::default).selector =
                Some(selector_for(&selector));
            store.update(&repointed).await?;
            info!(service = %service.name_any(), %selector, "re-pointed live service");
        }
        let observed: Option<Service> = store
            .get(service.namespace().as_deref(), &service.name_any())
            .await?;
        if observed.as_ref().and_then(service_selector_value) != Some(selector.as_str()) {
            return Err(Error::PromotionNotObserved(service.name_any()));
        }
    }

    let mut promoted = preview.clone();
    let live_meta = ObjectMeta {
        labels: Some(dataplane_deployment_labels(scope.dataplane, STATE_LIVE)),
        ..Default::default()
    };
    reconcile_metadata(&mut promoted.metadata, &live_meta);
    let promoted = store.update(&promoted).await?;

    finish_promotion(store, scope, &[former_live]).await?;
    Ok(promoted)
}

// Deletes what a completed promotion leaves behind: the former live
// deployment and the preview services and secret.
async fn finish_promotion<S: ObjectStore>(
    store: &S,
    scope: &Scope<'_>,
    former_live: &[&Deployment],
) -> Result<()> {
    for deployment in former_live {
        delete_child(store, *deployment).await?;
    }
    let preview_labels = dataplane_generation_labels(scope.dataplane, STATE_PREVIEW);
    for service in scope.children::<S, Service>(store, &preview_labels).await? {
        delete_child(store, &service).await?;
    }
    for secret in scope.children::<S, Secret>(store, &preview_labels).await? {
        delete_child(store, &secret).await?;
    }
    Ok(())
}

// Drops a preview generation that is no longer wanted, e.g. after the spec
// was reverted to the live template.
async fn retire_preview<S: ObjectStore>(
    store: &S,
    scope: &Scope<'_>,
    preview: Option<&Deployment>,
) -> Result<()> {
    if let Some(preview) = preview {
        info!(name = %preview.name_any(), "retiring preview deployment");
        delete_child(store, preview).await?;
    }
    finish_promotion(store, scope, &[]).await
}

async fn clear_promotion_annotation<S: ObjectStore>(
    store: &S,
    dp: &DataPlane,
) -> Result<DataPlane> {
    let mut updated = dp.clone();
    updated
        .annotations_mut()
        .remove(DATAPLANE_PROMOTE_WHEN_READY_ANNOTATION);
    store.update(&updated).await
}

// Applies a replica change to `existing` without touching its pod template.
fn merge_replicas(existing: &mut Deployment, desired: &Deployment) -> bool {
    let desired_replicas = desired.spec.as_ref().and_then(|s| s.replicas);
    match existing.spec.as_mut() {
        Some(spec) if spec.replicas != desired_replicas => {
            spec.replicas = desired_replicas;
            true
        }
        _ => false,
    }
}

#[cfg(test)]
#[path = "dataplane_bluegreen_tests.rs"]
mod tests;
