//! In-memory API server used by the reconciliation tests
//!
//! Stores objects as JSON keyed by kind, namespace and name, assigns
//! resource versions and Service cluster IPs the way the API server does,
//! enforces optimistic concurrency on replace, and records every call.

use crate::error::{OperatorError, Result};
use crate::reconciler::{ClusterObject, ObjectApi};
use async_trait::async_trait;
use kube::core::ErrorResponse;
use kube::Resource;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    Get,
    Create,
    Replace,
    Delete,
}

/// Injected failure for one verb on one kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    /// Generic API server error (HTTP 500)
    Transport,
    /// Stale resource version (HTTP 409 Conflict)
    Conflict,
    /// Another writer creates the object first; the call reports AlreadyExists
    Race,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub verb: Verb,
    pub kind: String,
    pub name: String,
}

type Key = (String, String, String);

#[derive(Default)]
pub struct FakeCluster {
    objects: Mutex<HashMap<Key, Value>>,
    failures: Mutex<HashMap<(Verb, String), Failure>>,
    calls: Mutex<Vec<Call>>,
    versions: AtomicU64,
    cluster_ips: AtomicU64,
}

fn kind_of<K: ClusterObject>() -> String {
    K::kind(&()).to_string()
}

fn transport_error() -> OperatorError {
    OperatorError::KubeError(kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message: "injected failure".to_string(),
        reason: "InternalError".to_string(),
        code: 500,
    }))
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store an object directly, bypassing the call log
    pub fn insert<K: ClusterObject>(&self, obj: &K) {
        let mut value = serde_json::to_value(obj).expect("serializable object");
        let namespace = value["metadata"]["namespace"]
            .as_str()
            .expect("namespace")
            .to_string();
        let name = value["metadata"]["name"]
            .as_str()
            .expect("name")
            .to_string();
        self.stamp(&mut value);
        self.objects
            .lock()
            .unwrap()
            .insert((kind_of::<K>(), namespace, name), value);
    }

    /// Read an object directly, bypassing the call log
    pub fn object<K: ClusterObject>(&self, namespace: &str, name: &str) -> Option<K> {
        self.objects
            .lock()
            .unwrap()
            .get(&(kind_of::<K>(), namespace.to_string(), name.to_string()))
            .map(|v| serde_json::from_value(v.clone()).expect("stored object deserializes"))
    }

    pub fn fail(&self, verb: Verb, kind: &str, failure: Failure) {
        self.failures
            .lock()
            .unwrap()
            .insert((verb, kind.to_string()), failure);
    }

    pub fn clear_failures(&self) {
        self.failures.lock().unwrap().clear();
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    pub fn count(&self, verb: Verb, kind: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.verb == verb && c.kind == kind)
            .count()
    }

    /// Assign a new resource version, and a cluster IP to Services lacking one
    fn stamp(&self, value: &mut Value) {
        let version = self.versions.fetch_add(1, Ordering::SeqCst) + 1;
        value["metadata"]["resourceVersion"] = json!(version.to_string());
        if value["metadata"]["uid"].is_null() {
            value["metadata"]["uid"] = json!(format!("uid-{}", version));
        }
        if value["kind"] == "Service" && value["spec"]["clusterIP"].is_null() {
            let n = self.cluster_ips.fetch_add(1, Ordering::SeqCst) + 1;
            value["spec"]["clusterIP"] = json!(format!("10.96.0.{}", n));
        }
    }

    fn record(&self, verb: Verb, kind: &str, name: &str) -> Option<Failure> {
        self.calls.lock().unwrap().push(Call {
            verb,
            kind: kind.to_string(),
            name: name.to_string(),
        });
        self.failures
            .lock()
            .unwrap()
            .get(&(verb, kind.to_string()))
            .copied()
    }

    fn injected(&self, failure: Failure, kind: &str, namespace: &str, name: &str) -> OperatorError {
        match failure {
            Failure::Transport => transport_error(),
            Failure::Conflict => OperatorError::Conflict {
                kind: kind.to_string(),
                name: name.to_string(),
                namespace: namespace.to_string(),
            },
            Failure::Race => OperatorError::AlreadyExists {
                kind: kind.to_string(),
                name: name.to_string(),
                namespace: namespace.to_string(),
            },
        }
    }
}

#[async_trait]
impl<K: ClusterObject> ObjectApi<K> for FakeCluster {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>> {
        let kind = kind_of::<K>();
        if let Some(failure) = self.record(Verb::Get, &kind, name) {
            return Err(self.injected(failure, &kind, namespace, name));
        }
        Ok(self.object(namespace, name))
    }

    async fn create(&self, namespace: &str, obj: &K) -> Result<K> {
        let kind = kind_of::<K>();
        let name = obj.meta().name.clone().unwrap_or_default();
        let failure = self.record(Verb::Create, &kind, &name);

        if failure == Some(Failure::Race) {
            self.insert(obj);
        }
        if let Some(failure) = failure {
            return Err(self.injected(failure, &kind, namespace, &name));
        }

        let key = (kind.clone(), namespace.to_string(), name.clone());
        let mut objects = self.objects.lock().unwrap();
        if objects.contains_key(&key) {
            return Err(OperatorError::AlreadyExists {
                kind,
                name,
                namespace: namespace.to_string(),
            });
        }

        let mut value = serde_json::to_value(obj)?;
        value["kind"] = json!(kind);
        self.stamp(&mut value);
        objects.insert(key, value.clone());
        Ok(serde_json::from_value(value)?)
    }

    async fn replace(&self, namespace: &str, obj: &K) -> Result<K> {
        let kind = kind_of::<K>();
        let name = obj.meta().name.clone().unwrap_or_default();
        if let Some(failure) = self.record(Verb::Replace, &kind, &name) {
            return Err(self.injected(failure, &kind, namespace, &name));
        }

        let key = (kind.clone(), namespace.to_string(), name.clone());
        let mut objects = self.objects.lock().unwrap();
        let Some(current) = objects.get(&key) else {
            return Err(OperatorError::NotFound {
                kind,
                name,
                namespace: namespace.to_string(),
            });
        };

        let current_version = current["metadata"]["resourceVersion"].clone();
        if obj.meta().resource_version.as_deref() != current_version.as_str() {
            return Err(OperatorError::Conflict {
                kind,
                name,
                namespace: namespace.to_string(),
            });
        }

        let mut value = serde_json::to_value(obj)?;
        value["kind"] = json!(kind);
        self.stamp(&mut value);
        objects.insert(key, value.clone());
        Ok(serde_json::from_value(value)?)
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<()> {
        let kind = kind_of::<K>();
        if let Some(failure) = self.record(Verb::Delete, &kind, name) {
            return Err(self.injected(failure, &kind, namespace, name));
        }

        let key = (kind.clone(), namespace.to_string(), name.to_string());
        match self.objects.lock().unwrap().remove(&key) {
            Some(_) => Ok(()),
            None => Err(OperatorError::NotFound {
                kind,
                name: name.to_string(),
                namespace: namespace.to_string(),
            }),
        }
    }
}
