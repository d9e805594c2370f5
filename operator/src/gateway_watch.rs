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

//! Event routing for the Gateway and ControlPlane controllers: predicates
//! deciding whether a watch event is relevant and mappers rekeying events on
//! auxiliary objects to the objects that must be reconciled.
//!
//! Predicates and mappers are pure functions over a snapshot read from the
//! watch caches. Each one documents what it does when that read failed.

use std::any::{type_name, Any};
use std::collections::BTreeSet;
use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::{StreamExt, TryStreamExt};
use gateway_api::apis::standard::{gatewayclasses::GatewayClass, gateways::Gateway};
use kube::{
    runtime::{
        reflector::{self, ObjectRef, Store},
        watcher, WatchStreamExt,
    },
    Api, Resource, ResourceExt,
};
use serde::de::DeserializeOwned;
use tracing::{debug, error, warn};

use crate::consts::OPERATOR_API_GROUP;
use crate::types::{ControlPlane, DataPlane, GatewayConfiguration};
use crate::{Error, Result};

pub const GATEWAY_CONFIGURATION_KIND: &str = "GatewayConfiguration";

/// Read access to a reflector cache that refuses to answer until the initial
/// list has been observed.
#[derive(Clone)]
pub struct CachedLister<K>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    reader: Store<K>,
    synced: Arc<AtomicBool>,
}

impl<K> CachedLister<K>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    /// Starts a reflector over `api` in the background.
    pub fn spawn(api: Api<K>) -> Self {
        let (reader, writer) = reflector::store();
        let synced = Arc::new(AtomicBool::new(false));
        let flag = synced.clone();
        let stream = reflector::reflector(writer, watcher(api, watcher::Config::default()))
            .default_backoff()
            .inspect_ok(move |event| {
                if matches!(event, watcher::Event::Restarted(_)) {
                    flag.store(true, Ordering::Release);
                }
            })
            .for_each(|event| {
                if let Err(error) = event {
                    warn!(kind = %K::kind(&()), "watch cache error: {error}");
                }
                futures::future::ready(())
            });
        tokio::spawn(stream);
        Self { reader, synced }
    }

    fn check_synced(&self) -> Result<()> {
        if self.synced.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(Error::CacheNotSynced(type_name::<K>()))
        }
    }

    pub fn list(&self) -> Result<Vec<K>> {
        self.check_synced()?;
        Ok(self.reader.state().iter().map(|obj| (**obj).clone()).collect())
    }

    pub fn get(&self, namespace: Option<&str>, name: &str) -> Result<Option<K>> {
        self.check_synced()?;
        let mut key = ObjectRef::<K>::new(name);
        if let Some(namespace) = namespace {
            key = key.within(namespace);
        }
        Ok(self.reader.get(&key).map(|obj| (*obj).clone()))
    }
}

// Narrows a watched object to the kind a predicate expects. Anything else is
// a wiring bug: it is logged and the event dropped.
fn expect_kind<'a, T: 'static, K: Any>(obj: &'a K, context: &str) -> Option<&'a T> {
    let narrowed = (obj as &dyn Any).downcast_ref::<T>();
    if narrowed.is_none() {
        error!(
            expected = type_name::<T>(),
            found = type_name::<K>(),
            "unexpected object in {context}"
        );
    }
    narrowed
}

fn gateway_ref(gateway: &Gateway) -> ObjectRef<Gateway> {
    ObjectRef::new(&gateway.name_any()).within(&gateway.namespace().unwrap_or_default())
}

// -----------------------------------------------------------------------------
// Predicates
// -----------------------------------------------------------------------------

/// Whether a GatewayClass is claimed by this controller. Fails closed: an
/// object of another kind is dropped.
pub fn gateway_class_matches_controller<K: Any>(obj: &K, controller_name: &str) -> bool {
    expect_kind::<GatewayClass, K>(obj, "predicate")
        .is_some_and(|class| class.spec.controller_name == controller_name)
}

/// Whether a Gateway references a GatewayClass claimed by this controller.
///
/// Only a class that is known to belong to another controller drops the
/// event. A failed lookup or a missing class enqueues it; the reconciler
/// checks the class again.
pub fn gateway_has_matching_class<K: Any>(
    obj: &K,
    class: Result<Option<GatewayClass>>,
    controller_name: &str,
) -> bool {
    let Some(gateway) = expect_kind::<Gateway, K>(obj, "predicate") else {
        return false;
    };
    match class {
        Ok(Some(class)) => class.spec.controller_name == controller_name,
        Ok(None) => true,
        Err(error) => {
            debug!(gateway = %gateway.name_any(), "enqueueing after failed class lookup: {error}");
            true
        }
    }
}

/// Whether a GatewayConfiguration can matter to this controller, that is
/// whether any GatewayClass is claimed by it. Fails open: when the classes
/// cannot be listed the event is enqueued.
pub fn gateway_configuration_matches_controller<K: Any>(
    obj: &K,
    classes: Result<Vec<GatewayClass>>,
    controller_name: &str,
) -> bool {
    let Some(config) = expect_kind::<GatewayConfiguration, K>(obj, "predicate") else {
        return false;
    };
    match classes {
        Ok(classes) => classes
            .iter()
            .any(|class| class.spec.controller_name == controller_name),
        Err(error) => {
            debug!(
                configuration = %config.name_any(),
                "enqueueing after failed class list: {error}"
            );
            true
        }
    }
}

// -----------------------------------------------------------------------------
// Mappers
// -----------------------------------------------------------------------------

/// Gateways using `class`. Empty when the Gateways cannot be listed; the
/// periodic resync covers the miss.
pub fn gateways_for_gateway_class(
    class: &GatewayClass,
    gateways: Result<Vec<Gateway>>,
) -> Vec<ObjectRef<Gateway>> {
    let gateways = match gateways {
        Ok(gateways) => gateways,
        Err(error) => {
            error!(class = %class.name_any(), "could not list gateways in map func: {error}");
            return vec![];
        }
    };
    let class_name = class.name_any();
    gateways
        .iter()
        .filter(|gateway| gateway.spec.gateway_class_name == class_name)
        .map(gateway_ref)
        .collect()
}

/// Whether `class` takes its parameters from `config`.
pub fn class_references_configuration(class: &GatewayClass, config: &GatewayConfiguration) -> bool {
    class.spec.parameters_ref.as_ref().is_some_and(|params| {
        params.group == OPERATOR_API_GROUP
            && params.kind == GATEWAY_CONFIGURATION_KIND
            && params.name == config.name_any()
    })
}

/// Gateways whose class takes its parameters from `config`, resolved in two
/// steps: first the classes referencing it, then the Gateways using one of
/// those classes. Empty when either list fails.
pub fn gateways_for_gateway_configuration(
    config: &GatewayConfiguration,
    classes: Result<Vec<GatewayClass>>,
    gateways: Result<Vec<Gateway>>,
) -> Vec<ObjectRef<Gateway>> {
    let classes = match classes {
        Ok(classes) => classes,
        Err(error) => {
            error!(
                configuration = %config.name_any(),
                "could not list gateway classes in map func: {error}"
            );
            return vec![];
        }
    };
    let matching: BTreeSet<String> = classes
        .iter()
        .filter(|class| class_references_configuration(class, config))
        .map(|class| class.name_any())
        .collect();
    if matching.is_empty() {
        return vec![];
    }

    let gateways = match gateways {
        Ok(gateways) => gateways,
        Err(error) => {
            error!(
                configuration = %config.name_any(),
                "could not list gateways in map func: {error}"
            );
            return vec![];
        }
    };
    gateways
        .iter()
        .filter(|gateway| matching.contains(&gateway.spec.gateway_class_name))
        .map(gateway_ref)
        .collect()
}

/// ControlPlanes configuring `dataplane`. Empty when they cannot be listed.
pub fn controlplanes_for_dataplane(
    dataplane: &DataPlane,
    controlplanes: Result<Vec<ControlPlane>>,
) -> Vec<ObjectRef<ControlPlane>> {
    let controlplanes = match controlplanes {
        Ok(controlplanes) => controlplanes,
        Err(error) => {
            error!(
                dataplane = %dataplane.name_any(),
                "could not list controlplanes in map func: {error}"
            );
            return vec![];
        }
    };
    let namespace = dataplane.namespace();
    let name = dataplane.name_any();
    controlplanes
        .iter()
        .filter(|cp| {
            cp.namespace() == namespace
                && cp.spec.options.data_plane.as_deref() == Some(name.as_str())
        })
        .map(|cp| ObjectRef::new(&cp.name_any()).within(&cp.namespace().unwrap_or_default()))
        .collect()
}
