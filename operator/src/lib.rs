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

use std::sync::Arc;

use kube::runtime::controller::Action;
use kube::Resource;
use thiserror::Error;
use tracing::warn;

pub use config::Config;
pub use controlplane_controller::controller as controlplane_controller;
pub use dataplane_controller::controller as dataplane_controller;
pub use gateway_controller::controller as gateway_controller;
pub use gatewayclass_controller::controller as gatewayclass_controller;
pub use permissions::PermissionsError;
pub use store::{KubeStore, ObjectStore};

pub mod backoff;
pub mod config;
pub mod consts;
mod controlplane_controller;
mod dataplane_bluegreen;
mod dataplane_controller;
pub mod ensure;
pub mod gateway_config;
mod gateway_controller;
mod gateway_utils;
pub mod gateway_watch;
mod gatewayclass_controller;
mod gatewayclass_utils;
#[cfg(test)]
mod memory_store;
pub mod permissions;
pub mod resources;
pub mod store;
pub mod traits;
pub mod types;
pub mod utils;

use backoff::{object_key, Backoff};

// Context for our reconcilers
#[derive(Clone)]
pub struct Context<S = KubeStore> {
    /// Backing object store
    pub store: S,
    pub config: Arc<Config>,
    pub backoff: Backoff,
}

impl<S: ObjectStore> Context<S> {
    pub fn new(store: S, config: Config) -> Self {
        Self {
            store,
            config: Arc::new(config),
            backoff: Backoff::default(),
        }
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("kube error: {0}")]
    KubeError(#[source] kube::Error),
    #[error("invalid configuration: `{0}`")]
    InvalidConfigError(String),
    #[error("error querying CRDs: `{0}`; are the CRDs installed?")]
    CRDNotFoundError(#[source] kube::Error),
    #[error("serialization error: {0}")]
    SerializationError(#[source] serde_json::Error),
    #[error("cache for {0} has not synced yet")]
    CacheNotSynced(&'static str),
    #[error("permissions error: {0}")]
    Permissions(#[from] PermissionsError),
    #[error("service {0} does not route to the promoted generation yet")]
    PromotionNotObserved(String),
}

impl Error {
    /// Whether retrying the same pass may succeed: write conflicts, throttling,
    /// server-side failures, transport errors, caches that are still syncing and
    /// promotions whose service update is not visible yet.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::KubeError(kube::Error::Api(response)) => {
                response.code == 409 || response.code == 429 || response.code >= 500
            }
            Error::KubeError(_) => true,
            Error::CacheNotSynced(_) | Error::PromotionNotObserved(_) => true,
            Error::InvalidConfigError(_)
            | Error::CRDNotFoundError(_)
            | Error::SerializationError(_)
            | Error::Permissions(_) => false,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

// Shared error policy: transient failures back off per object, everything else
// waits for the referential requeue interval.
pub(crate) fn error_policy<K, S>(obj: Arc<K>, error: &Error, ctx: Arc<Context<S>>) -> Action
where
    K: Resource<DynamicType = ()>,
    S: ObjectStore,
{
    let key = object_key(obj.as_ref());
    let delay = if error.is_retryable() {
        ctx.backoff.next_delay(&key)
    } else {
        ctx.config.referential_requeue()
    };
    warn!(object = %key, retryable = error.is_retryable(), "reconcile failed: {:?}", error);
    Action::requeue(delay)
}

// Requeue used after a successful pass.
pub(crate) fn requeue_after_success<K, S>(obj: &K, ctx: &Context<S>) -> Action
where
    K: Resource<DynamicType = ()>,
    S: ObjectStore,
{
    ctx.backoff.reset(&object_key(obj));
    Action::requeue(ctx.config.resync_period())
}
