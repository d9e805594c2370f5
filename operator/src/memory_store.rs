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

//! In-memory [`ObjectStore`] used by the test suites.
//!
//! It emulates the parts of the API server the reconcilers depend on:
//! resourceVersion conflicts, generateName, the status subresource,
//! finalizers with deletionTimestamp, and an explicit garbage-collection
//! sweep over owner references.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1 as metav1;
use kube::core::ErrorResponse;
use kube::ResourceExt;
use serde_json::Value;

use crate::store::{ObjectStore, StoredObject};
use crate::utils::labels_match;
use crate::{Error, Result};

type Key = (String, String, String);

#[derive(Default)]
struct Inner {
    objects: BTreeMap<Key, Value>,
    revision: u64,
    failing_kinds: BTreeSet<String>,
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

fn api_error(code: u16, reason: &str, message: String) -> Error {
    Error::KubeError(kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message,
        reason: reason.to_string(),
        code,
    }))
}

fn key_for<K: StoredObject>(namespace: Option<&str>, name: &str) -> Key {
    (
        K::kind(&()).to_string(),
        namespace.unwrap_or_default().to_string(),
        name.to_string(),
    )
}

fn decode<K: StoredObject>(value: &Value) -> K {
    serde_json::from_value(value.clone()).expect("stored object decodes")
}

fn encode<K: StoredObject>(obj: &K) -> Value {
    serde_json::to_value(obj).expect("object encodes")
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().expect("memory store lock")
    }

    fn check_failing<K: StoredObject>(inner: &Inner) -> Result<()> {
        let kind = K::kind(&()).to_string();
        if inner.failing_kinds.contains(&kind) {
            return Err(api_error(500, "InternalError", format!("{kind} reads are failing")));
        }
        Ok(())
    }

    /// Makes every read of `K` fail with an internal error until cleared.
    pub fn fail_reads<K: StoredObject>(&self, failing: bool) {
        let kind = K::kind(&()).to_string();
        let mut inner = self.lock();
        if failing {
            inner.failing_kinds.insert(kind);
        } else {
            inner.failing_kinds.remove(&kind);
        }
    }

    /// Mutates an object in place the way another controller would, bumping
    /// its resourceVersion but not its generation.
    pub fn mutate<K: StoredObject>(
        &self,
        namespace: Option<&str>,
        name: &str,
        f: impl FnOnce(&mut K),
    ) {
        let mut inner = self.lock();
        inner.revision += 1;
        let revision = inner.revision;
        let key = key_for::<K>(namespace, name);
        let value = inner.objects.get(&key).expect("object to mutate exists");
        let mut obj: K = decode(value);
        f(&mut obj);
        obj.meta_mut().resource_version = Some(revision.to_string());
        inner.objects.insert(key, encode(&obj));
    }

    pub fn all<K: StoredObject>(&self, namespace: Option<&str>) -> Vec<K> {
        let kind = K::kind(&()).to_string();
        self.lock()
            .objects
            .iter()
            .filter(|((k, ns, _), _)| *k == kind && namespace.map_or(true, |n| n == ns.as_str()))
            .map(|(_, v)| decode(v))
            .collect()
    }

    /// Removes every object whose owners are all gone, the way the cluster
    /// garbage collector eventually does. Objects still holding finalizers are
    /// only marked for deletion.
    pub fn collect_garbage(&self) {
        loop {
            let mut inner = self.lock();
            let uids: BTreeSet<String> = inner
                .objects
                .values()
                .filter_map(|v| v.pointer("/metadata/uid").and_then(Value::as_str))
                .map(str::to_string)
                .collect();

            let mut orphans = vec![];
            for (key, value) in inner.objects.iter() {
                let Some(owners) = value
                    .pointer("/metadata/ownerReferences")
                    .and_then(Value::as_array)
                else {
                    continue;
                };
                let has_live_owner = owners
                    .iter()
                    .filter_map(|o| o.get("uid").and_then(Value::as_str))
                    .any(|uid| uids.contains(uid));
                if !owners.is_empty() && !has_live_owner {
                    orphans.push(key.clone());
                }
            }

            let mut changed = false;
            for key in orphans {
                let value = inner.objects.get_mut(&key).expect("orphan exists");
                let has_finalizers = value
                    .pointer("/metadata/finalizers")
                    .and_then(Value::as_array)
                    .is_some_and(|f| !f.is_empty());
                if has_finalizers {
                    if value.pointer("/metadata/deletionTimestamp").is_none() {
                        value["metadata"]["deletionTimestamp"] = serde_json::json!(Utc::now());
                    }
                } else {
                    inner.objects.remove(&key);
                    changed = true;
                }
            }
            if !changed {
                return;
            }
        }
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get<K: StoredObject>(&self, namespace: Option<&str>, name: &str) -> Result<Option<K>> {
        let inner = self.lock();
        Self::check_failing::<K>(&inner)?;
        Ok(inner.objects.get(&key_for::<K>(namespace, name)).map(decode))
    }

    async fn list<K: StoredObject>(
        &self,
        namespace: Option<&str>,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<K>> {
        {
            let inner = self.lock();
            Self::check_failing::<K>(&inner)?;
        }
        Ok(self
            .all::<K>(namespace)
            .into_iter()
            .filter(|obj| labels_match(obj.labels(), labels))
            .collect())
    }

    async fn create<K: StoredObject>(&self, obj: &K) -> Result<K> {
        let mut inner = self.lock();
        inner.revision += 1;
        let revision = inner.revision;

        let mut obj = obj.clone();
        let meta = obj.meta_mut();
        if meta.name.is_none() {
            let prefix = meta.generate_name.clone().ok_or_else(|| {
                api_error(422, "Invalid", "name or generateName is required".to_string())
            })?;
            meta.name = Some(format!("{prefix}{revision:05}"));
        }
        let name = meta.name.clone().unwrap_or_default();
        let key = key_for::<K>(meta.namespace.as_deref(), &name);
        if inner.objects.contains_key(&key) {
            return Err(api_error(409, "AlreadyExists", format!("{name} already exists")));
        }
        meta.uid = Some(format!("uid-{revision}"));
        meta.resource_version = Some(revision.to_string());
        meta.generation = Some(1);
        meta.creation_timestamp = Some(metav1::Time(Utc::now()));
        meta.deletion_timestamp = None;

        inner.objects.insert(key, encode(&obj));
        Ok(obj)
    }

    async fn update<K: StoredObject>(&self, obj: &K) -> Result<K> {
        let mut inner = self.lock();
        let name = obj.name_any();
        let key = key_for::<K>(obj.namespace().as_deref(), &name);
        let existing = inner
            .objects
            .get(&key)
            .cloned()
            .ok_or_else(|| api_error(404, "NotFound", format!("{name} not found")))?;
        let existing_obj: K = decode(&existing);
        if existing_obj.meta().resource_version != obj.meta().resource_version {
            return Err(api_error(409, "Conflict", format!("{name} has been modified")));
        }

        inner.revision += 1;
        let revision = inner.revision;
        let mut updated = encode(obj);
        if let Some(status) = existing.get("status") {
            updated["status"] = status.clone();
        } else if let Some(map) = updated.as_object_mut() {
            map.remove("status");
        }
        let mut updated: K = decode(&updated);
        let meta = updated.meta_mut();
        let existing_meta = existing_obj.meta();
        meta.uid.clone_from(&existing_meta.uid);
        meta.creation_timestamp.clone_from(&existing_meta.creation_timestamp);
        meta.deletion_timestamp.clone_from(&existing_meta.deletion_timestamp);
        meta.resource_version = Some(revision.to_string());
        meta.generation = existing_meta.generation;
        if existing.get("spec") != encode(obj).get("spec") {
            meta.generation = Some(existing_meta.generation.unwrap_or(0) + 1);
        }

        if meta.deletion_timestamp.is_some()
            && meta.finalizers.as_ref().map_or(true, Vec::is_empty)
        {
            inner.objects.remove(&key);
        } else {
            inner.objects.insert(key, encode(&updated));
        }
        Ok(updated)
    }

    async fn update_status<K: StoredObject>(&self, obj: &K) -> Result<K> {
        let mut inner = self.lock();
        let name = obj.name_any();
        let key = key_for::<K>(obj.namespace().as_deref(), &name);
        let mut existing = inner
            .objects
            .get(&key)
            .cloned()
            .ok_or_else(|| api_error(404, "NotFound", format!("{name} not found")))?;
        let existing_obj: K = decode(&existing);
        if existing_obj.meta().resource_version != obj.meta().resource_version {
            return Err(api_error(409, "Conflict", format!("{name} has been modified")));
        }

        inner.revision += 1;
        existing["status"] = encode(obj).get("status").cloned().unwrap_or(Value::Null);
        existing["metadata"]["resourceVersion"] = Value::String(inner.revision.to_string());
        inner.objects.insert(key, existing.clone());
        Ok(decode(&existing))
    }

    async fn delete<K: StoredObject>(&self, namespace: Option<&str>, name: &str) -> Result<()> {
        let mut inner = self.lock();
        let key = key_for::<K>(namespace, name);
        let Some(existing) = inner.objects.get(&key).cloned() else {
            return Ok(());
        };
        let mut obj: K = decode(&existing);
        if obj.finalizers().is_empty() {
            inner.objects.remove(&key);
            return Ok(());
        }
        if obj.meta().deletion_timestamp.is_none() {
            inner.revision += 1;
            obj.meta_mut().deletion_timestamp = Some(metav1::Time(Utc::now()));
            obj.meta_mut().resource_version = Some(inner.revision.to_string());
            inner.objects.insert(key, encode(&obj));
        }
        Ok(())
    }
}
