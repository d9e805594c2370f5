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

//! Idempotent create-or-update of owned child objects.

use std::collections::BTreeMap;

use kube::{Resource, ResourceExt};
use tracing::{debug, error, info};

use crate::consts::WAIT_FOR_OWNER_FINALIZER;
use crate::store::{ObjectStore, StoredObject};
use crate::utils::{is_being_deleted, is_not_found, is_owned_by};
use crate::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnsureOutcome {
    Created,
    Updated,
    Noop,
}

impl EnsureOutcome {
    pub fn changed(&self) -> bool {
        !matches!(self, EnsureOutcome::Noop)
    }
}

/// Lists children matching `labels` that are owned by `owner_uid` (when
/// given) and not marked for deletion, oldest first.
pub async fn list_children<S, K>(
    store: &S,
    namespace: Option<&str>,
    labels: &BTreeMap<String, String>,
    owner_uid: Option<&str>,
) -> Result<Vec<K>>
where
    S: ObjectStore,
    K: StoredObject,
{
    let mut children: Vec<K> = store
        .list::<K>(namespace, labels)
        .await?
        .into_iter()
        .filter(|obj| owner_uid.map_or(true, |uid| is_owned_by(obj, uid)))
        .filter(|obj| !is_being_deleted(obj))
        .collect();
    children.sort_by_key(|obj| obj.meta().creation_timestamp.as_ref().map(|t| t.0));
    Ok(children)
}

/// Makes sure exactly one child matching `labels` exists and agrees with
/// `desired`.
///
/// `reconcile` applies `desired` onto the existing object and reports whether
/// it changed anything; the store is only written when it did. When more than
/// one child matches, the oldest is used and the rest are left for cleanup.
pub async fn ensure_child<S, K, F>(
    store: &S,
    owner_uid: Option<&str>,
    labels: &BTreeMap<String, String>,
    desired: K,
    reconcile: F,
) -> Result<(K, EnsureOutcome)>
where
    S: ObjectStore,
    K: StoredObject,
    F: Fn(&mut K, &K) -> bool + Send + Sync,
{
    let kind = K::kind(&()).to_string();
    let namespace = desired.namespace();
    let children: Vec<K> = list_children(store, namespace.as_deref(), labels, owner_uid).await?;
    if children.len() > 1 {
        let names: Vec<String> = children.iter().map(|c| c.name_any()).collect();
        error!(%kind, ?names, "found multiple children where one was expected");
    }

    match children.into_iter().next() {
        None => {
            let created = store.create(&desired).await?;
            info!(%kind, name = %created.name_any(), "created child");
            Ok((created, EnsureOutcome::Created))
        }
        Some(mut existing) => {
            if !reconcile(&mut existing, &desired) {
                return Ok((existing, EnsureOutcome::Noop));
            }
            debug!(%kind, name = %existing.name_any(), "drift detected; updating child");
            let updated = store.update(&existing).await?;
            Ok((updated, EnsureOutcome::Updated))
        }
    }
}

/// Removes `finalizer` from the object. Returns the updated object, or `None`
/// if it is gone, which happens once the last finalizer of an object marked for
/// deletion is removed.
pub async fn remove_finalizer<S, K>(store: &S, obj: &K, finalizer: &str) -> Result<Option<K>>
where
    S: ObjectStore,
    K: StoredObject,
{
    if !obj.finalizers().iter().any(|f| f == finalizer) {
        return Ok(Some(obj.clone()));
    }
    let mut updated = obj.clone();
    updated.finalizers_mut().retain(|f| f != finalizer);
    match store.update(&updated).await {
        Ok(updated) => {
            let name = updated.name_any();
            match store.get::<K>(updated.namespace().as_deref(), &name).await? {
                Some(current) => Ok(Some(current)),
                None => Ok(None),
            }
        }
        Err(Error::KubeError(error)) if is_not_found(&error) => Ok(None),
        Err(error) => Err(error),
    }
}

pub async fn add_finalizer<S, K>(store: &S, obj: &K, finalizer: &str) -> Result<K>
where
    S: ObjectStore,
    K: StoredObject,
{
    if obj.finalizers().iter().any(|f| f == finalizer) {
        return Ok(obj.clone());
    }
    let mut updated = obj.clone();
    updated.finalizers_mut().push(finalizer.to_string());
    store.update(&updated).await
}

/// Deletes a child, first releasing the finalizer that keeps children around
/// until their owner is gone. Deleting a missing object succeeds.
pub async fn delete_child<S, K>(store: &S, obj: &K) -> Result<()>
where
    S: ObjectStore,
    K: StoredObject,
{
    let Some(obj) = remove_finalizer(store, obj, WAIT_FOR_OWNER_FINALIZER).await? else {
        return Ok(());
    };
    info!(kind = %K::kind(&()), name = %obj.name_any(), "deleting child");
    store.delete::<K>(obj.namespace().as_deref(), &obj.name_any()).await
}
