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

use futures::StreamExt;
use std::{
    ops::Sub,
    sync::Arc,
    time::Instant,
};

use crate::*;
use gateway_api::apis::standard::gatewayclasses::GatewayClass;
use kube::{
    api::{Api, ListParams},
    runtime::{controller::Action, watcher, Controller},
    ResourceExt,
};

use gatewayclass_utils::*;
use tracing::*;

pub async fn reconcile<S: ObjectStore>(
    gateway_class: Arc<GatewayClass>,
    ctx: Arc<Context<S>>,
) -> Result<Action> {
    let start = Instant::now();
    let name = gateway_class
        .metadata
        .name
        .clone()
        .ok_or(Error::InvalidConfigError("invalid name".to_string()))?;

    if gateway_class.spec.controller_name != ctx.config.controller_name {
        // Not ours. A change of controllerName arrives as a new event.
        debug!(%name, "ignoring gateway class of another controller");
        return Ok(Action::await_change());
    }

    let mut gwc = gateway_class.as_ref().clone();
    if evaluate(&mut gwc) {
        info!(%name, accepted = is_accepted(&gwc), "updating gateway class status");
        ctx.store.update_status(&gwc).await?;
    }

    ctx.backoff.reset(&backoff::object_key(gateway_class.as_ref()));
    let duration = Instant::now().sub(start);
    info!("finished reconciling in {:?} ms", duration.as_millis());
    Ok(Action::await_change())
}

pub async fn controller(ctx: Context) -> Result<()> {
    let gwc_api = Api::<GatewayClass>::all(ctx.store.client());
    gwc_api
        .list(&ListParams::default().limit(1))
        .await
        .map_err(Error::CRDNotFoundError)?;

    Controller::new(gwc_api, watcher::Config::default().any_semantic())
        .shutdown_on_signal()
        .run(
            reconcile::<KubeStore>,
            error_policy::<GatewayClass, KubeStore>,
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
