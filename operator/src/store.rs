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

//! Read/write access to the backing object store.
//!
//! Every reconciler goes through [`ObjectStore`] so that all writes are
//! optimistic: updates carry the resourceVersion that was read and a stale
//! write is rejected by the store with a conflict.

use std::collections::BTreeMap;
use std::fmt::Debug;

use async_trait::async_trait;
use gateway_api::apis::standard::{gatewayclasses::GatewayClass, gateways::Gateway};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Secret, Service, ServiceAccount};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding};
use kube::{
    api::{Api, DeleteParams, ListParams, PostParams},
    Client, Resource, ResourceExt,
};
use serde::{de::DeserializeOwned, Serialize};

use crate::consts::OPERATOR_FIELD_MANAGER;
use crate::types::{ControlPlane, DataPlane, GatewayConfiguration};
use crate::utils::is_not_found;
use crate::{Error, Result};

/// A kind that can be read from and written to the store.
pub trait StoredObject:
    Resource<DynamicType = ()>
    + Clone
    + Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
    fn api(client: Client, namespace: Option<&str>) -> Api<Self>;
}

macro_rules! namespaced_object {
    ($($kind:ty),* $(,)?) => {
        $(
            impl StoredObject for $kind {
                fn api(client: Client, namespace: Option<&str>) -> Api<Self> {
                    match namespace {
                        Some(ns) => Api::namespaced(client, ns),
                        None => Api::all(client),
                    }
                }
            }
        )*
    };
}

macro_rules! cluster_object {
    ($($kind:ty),* $(,)?) => {
        $(
            impl StoredObject for $kind {
                fn api(client: Client, _namespace: Option<&str>) -> Api<Self> {
                    Api::all(client)
                }
            }
        )*
    };
}

namespaced_object!(
    Gateway,
    GatewayConfiguration,
    DataPlane,
    ControlPlane,
    Deployment,
    Service,
    Secret,
    ServiceAccount,
);

cluster_object!(GatewayClass, ClusterRole, ClusterRoleBinding);

#[async_trait]
pub trait ObjectStore: Clone + Send + Sync + 'static {
    /// Returns `None` when the object does not exist.
    async fn get<K: StoredObject>(&self, namespace: Option<&str>, name: &str) -> Result<Option<K>>;

    /// Lists objects carrying every label of `labels`.
    async fn list<K: StoredObject>(
        &self,
        namespace: Option<&str>,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<K>>;

    async fn create<K: StoredObject>(&self, obj: &K) -> Result<K>;

    /// Replaces the object; rejected with a conflict if its resourceVersion is stale.
    async fn update<K: StoredObject>(&self, obj: &K) -> Result<K>;

    /// Replaces the status subresource; rejected with a conflict if stale.
    async fn update_status<K: StoredObject>(&self, obj: &K) -> Result<K>;

    /// Deleting an object that does not exist is not an error.
    async fn delete<K: StoredObject>(&self, namespace: Option<&str>, name: &str) -> Result<()>;
}

pub fn label_selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

fn object_name<K: Resource>(obj: &K) -> Result<&str> {
    obj.meta()
        .name
        .as_deref()
        .ok_or(Error::InvalidConfigError("object has no name".to_string()))
}

fn post_params() -> PostParams {
    PostParams {
        dry_run: false,
        field_manager: Some(OPERATOR_FIELD_MANAGER.to_string()),
    }
}

/// [`ObjectStore`] backed by the Kubernetes API server.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub fn client(&self) -> Client {
        self.client.clone()
    }
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn get<K: StoredObject>(&self, namespace: Option<&str>, name: &str) -> Result<Option<K>> {
        K::api(self.client.clone(), namespace)
            .get_opt(name)
            .await
            .map_err(Error::KubeError)
    }

    async fn list<K: StoredObject>(
        &self,
        namespace: Option<&str>,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<K>> {
        let params = ListParams::default().labels(&label_selector(labels));
        let list = K::api(self.client.clone(), namespace)
            .list(&params)
            .await
            .map_err(Error::KubeError)?;
        Ok(list.items)
    }

    async fn create<K: StoredObject>(&self, obj: &K) -> Result<K> {
        K::api(self.client.clone(), obj.namespace().as_deref())
            .create(&post_params(), obj)
            .await
            .map_err(Error::KubeError)
    }

    async fn update<K: StoredObject>(&self, obj: &K) -> Result<K> {
        K::api(self.client.clone(), obj.namespace().as_deref())
            .replace(object_name(obj)?, &post_params(), obj)
            .await
            .map_err(Error::KubeError)
    }

    async fn update_status<K: StoredObject>(&self, obj: &K) -> Result<K> {
        let data = serde_json::to_vec(obj).map_err(Error::SerializationError)?;
        K::api(self.client.clone(), obj.namespace().as_deref())
            .replace_status(object_name(obj)?, &post_params(), data)
            .await
            .map_err(Error::KubeError)
    }

    async fn delete<K: StoredObject>(&self, namespace: Option<&str>, name: &str) -> Result<()> {
        match K::api(self.client.clone(), namespace)
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(error) if is_not_found(&error) => Ok(()),
            Err(error) => Err(Error::KubeError(error)),
        }
    }
}
