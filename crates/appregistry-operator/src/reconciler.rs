//! Generic get-or-create-or-update reconciliation
//!
//! Every managed kind goes through [`ensure_object`]. What differs between
//! kinds is captured by [`Managed`]: how drift on an existing object is
//! handled and which fields the operator owns.

use crate::error::{OperatorError, Result};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Service, ServiceAccount};
use k8s_openapi::api::rbac::v1::{Role, RoleBinding};
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, DeleteParams, PostParams};
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;
use tracing::{debug, error, info, warn};

/// Namespaced API object the reconciler can read and write
pub trait ClusterObject:
    Resource<Scope = NamespaceResourceScope, DynamicType = ()>
    + Clone
    + Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
}

impl<K> ClusterObject for K where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

/// Typed create/read/update/delete for one kind, keyed by namespace and name.
///
/// `get` returns `Ok(None)` for a missing object. `create` reports a lost
/// race as `AlreadyExists`, `replace` reports a stale resource version as
/// `Conflict` and `delete` reports a missing object as `NotFound`.
#[async_trait]
pub trait ObjectApi<K: ClusterObject>: Send + Sync {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>>;

    async fn create(&self, namespace: &str, obj: &K) -> Result<K>;

    async fn replace(&self, namespace: &str, obj: &K) -> Result<K>;

    async fn delete(&self, namespace: &str, name: &str) -> Result<()>;
}

/// Every kind a registry needs, behind one client
pub trait RegistryClient:
    ObjectApi<ServiceAccount>
    + ObjectApi<Role>
    + ObjectApi<RoleBinding>
    + ObjectApi<Deployment>
    + ObjectApi<Service>
{
}

impl<C> RegistryClient for C where
    C: ObjectApi<ServiceAccount>
        + ObjectApi<Role>
        + ObjectApi<RoleBinding>
        + ObjectApi<Deployment>
        + ObjectApi<Service>
{
}

/// What to do when the object already exists
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriftPolicy {
    /// Presence is enough; never update
    Ignore,
    /// Copy the owned fields onto the live object and replace it
    Overwrite,
    /// Delete the live object and create a fresh one
    Recreate,
}

/// Per-kind reconciliation strategy
pub trait Managed: ClusterObject {
    const DRIFT: DriftPolicy;

    /// Copy the fields owned by the operator from `desired` onto `self`
    fn overwrite_from(&mut self, _desired: &Self) {}
}

impl Managed for ServiceAccount {
    const DRIFT: DriftPolicy = DriftPolicy::Ignore;
}

impl Managed for Role {
    const DRIFT: DriftPolicy = DriftPolicy::Overwrite;

    fn overwrite_from(&mut self, desired: &Self) {
        self.rules = desired.rules.clone();
    }
}

impl Managed for RoleBinding {
    const DRIFT: DriftPolicy = DriftPolicy::Overwrite;

    fn overwrite_from(&mut self, desired: &Self) {
        self.role_ref = desired.role_ref.clone();
        self.subjects = desired.subjects.clone();
    }
}

impl Managed for Deployment {
    const DRIFT: DriftPolicy = DriftPolicy::Overwrite;

    fn overwrite_from(&mut self, desired: &Self) {
        let Some(desired_spec) = desired.spec.as_ref() else {
            return;
        };
        match self.spec.as_mut() {
            Some(spec) => spec.template = desired_spec.template.clone(),
            None => self.spec = Some(desired_spec.clone()),
        }
    }
}

impl Managed for Service {
    const DRIFT: DriftPolicy = DriftPolicy::Recreate;
}

fn object_key<K: Resource>(obj: &K) -> Result<(String, String)> {
    let meta = obj.meta();
    let name = meta
        .name
        .clone()
        .ok_or(OperatorError::MissingField(".metadata.name"))?;
    let namespace = meta
        .namespace
        .clone()
        .ok_or(OperatorError::MissingField(".metadata.namespace"))?;
    Ok((namespace, name))
}

/// Converge one object of kind `K` onto `desired`.
///
/// Returns the object as the API server last reported it. Losing a create
/// race is success; every other create, update or read failure is returned
/// unchanged.
pub async fn ensure_object<K, A>(api: &A, desired: K) -> Result<K>
where
    K: Managed,
    A: ObjectApi<K> + ?Sized,
{
    let kind = K::kind(&()).to_string();
    let (namespace, name) = object_key(&desired)?;

    let Some(mut existing) = api.get(&namespace, &name).await? else {
        return create_object(api, &namespace, desired).await;
    };

    match K::DRIFT {
        DriftPolicy::Ignore => {
            info!(kind = %kind, name = %name, "Resource is present");
            Ok(existing)
        }
        DriftPolicy::Overwrite => {
            existing.overwrite_from(&desired);
            let updated = api.replace(&namespace, &existing).await.map_err(|e| {
                error!(kind = %kind, name = %name, error = %e, "Failed to update resource");
                e
            })?;
            info!(kind = %kind, name = %name, "Updated resource");
            Ok(updated)
        }
        DriftPolicy::Recreate => {
            info!(kind = %kind, name = %name, "Resource is present, recreating");
            match api.delete(&namespace, &name).await {
                Ok(()) => info!(kind = %kind, name = %name, "Deleted resource"),
                // Best effort: the create below still runs
                Err(e) => {
                    warn!(kind = %kind, name = %name, error = %e, "Failed to delete resource")
                }
            }
            create_object(api, &namespace, desired).await
        }
    }
}

async fn create_object<K, A>(api: &A, namespace: &str, desired: K) -> Result<K>
where
    K: Managed,
    A: ObjectApi<K> + ?Sized,
{
    let kind = K::kind(&()).to_string();
    let name = desired.meta().name.clone().unwrap_or_default();

    match api.create(namespace, &desired).await {
        Ok(created) => {
            info!(kind = %kind, name = %name, "Created resource");
            Ok(created)
        }
        Err(e) if e.is_already_exists() => {
            debug!(kind = %kind, name = %name, "Resource created concurrently");
            if K::DRIFT == DriftPolicy::Recreate {
                // The caller reads server-assigned fields off the result
                Ok(api.get(namespace, &name).await?.unwrap_or(desired))
            } else {
                Ok(desired)
            }
        }
        Err(e) => {
            error!(kind = %kind, name = %name, error = %e, "Failed to create resource");
            Err(e)
        }
    }
}

/// [`ObjectApi`] backed by the Kubernetes API server
#[derive(Clone)]
pub struct KubeObjectApi {
    client: Client,
}

impl KubeObjectApi {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api<K: ClusterObject>(&self, namespace: &str) -> Api<K> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn classify<K: ClusterObject>(err: kube::Error, namespace: &str, name: &str) -> OperatorError {
    let kind = K::kind(&()).to_string();
    match err {
        kube::Error::Api(ae) if ae.code == 404 => OperatorError::NotFound {
            kind,
            name: name.to_string(),
            namespace: namespace.to_string(),
        },
        kube::Error::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists" => {
            OperatorError::AlreadyExists {
                kind,
                name: name.to_string(),
                namespace: namespace.to_string(),
            }
        }
        kube::Error::Api(ae) if ae.code == 409 => OperatorError::Conflict {
            kind,
            name: name.to_string(),
            namespace: namespace.to_string(),
        },
        e => OperatorError::from(e),
    }
}

/// A read that came back 404 is an absent object, not an error
fn absent_if_not_found<K>(result: std::result::Result<K, kube::Error>) -> Result<Option<K>> {
    match result {
        Ok(obj) => Ok(Some(obj)),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl<K: ClusterObject> ObjectApi<K> for KubeObjectApi {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>> {
        absent_if_not_found(self.api::<K>(namespace).get(name).await)
    }

    async fn create(&self, namespace: &str, obj: &K) -> Result<K> {
        let name = obj.meta().name.clone().unwrap_or_default();
        self.api::<K>(namespace)
            .create(&PostParams::default(), obj)
            .await
            .map_err(|e| classify::<K>(e, namespace, &name))
    }

    async fn replace(&self, namespace: &str, obj: &K) -> Result<K> {
        let (_, name) = object_key(obj)?;
        self.api::<K>(namespace)
            .replace(&name, &PostParams::default(), obj)
            .await
            .map_err(|e| classify::<K>(e, namespace, &name))
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<()> {
        self.api::<K>(namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(|e| classify::<K>(e, namespace, name))
    }
}
