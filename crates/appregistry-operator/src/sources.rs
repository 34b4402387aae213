//! Package source resolution
//!
//! Maps the package ids of a `PackageRegistry` to the distinct upstream
//! `PackageSource` objects that own them. The lookup itself goes through the
//! [`PackageLookup`] seam; [`SourceIndex`] is the in-process implementation
//! the controller keeps in sync with the cluster.

use crate::crd::PackageSource;
use crate::error::{OperatorError, Result};
use kube::ResourceExt;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::fmt;
use tracing::{debug, warn};
use validator::Validate;

#[cfg(test)]
use mockall::automock;

/// Reference to one upstream source
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceRef {
    pub namespace: String,
    pub name: String,
}

impl SourceRef {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for SourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Lookup store mapping a package id to the source that owns it
#[cfg_attr(test, automock)]
pub trait PackageLookup: Send + Sync {
    /// Return the source owning `package_id`, or `PackageNotFound`
    fn read(&self, package_id: &str) -> Result<SourceRef>;
}

/// Distinct sources for a package list, in first-seen order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedSources {
    refs: Vec<SourceRef>,
}

impl ResolvedSources {
    /// Resolve every package through `lookup`.
    ///
    /// A package that fails to resolve is logged and skipped. Duplicates are
    /// detected by exact `namespace/name` equality.
    pub fn resolve<L>(lookup: &L, packages: &[String]) -> Self
    where
        L: PackageLookup + ?Sized,
    {
        let mut seen = HashSet::new();
        let mut refs = Vec::new();

        for package_id in packages {
            match lookup.read(package_id) {
                Ok(source) => {
                    if seen.insert(source.clone()) {
                        debug!(package = %package_id, source = %source, "Resolved package source");
                        refs.push(source);
                    }
                }
                Err(e) => {
                    warn!(package = %package_id, error = %e, "Failed to resolve package, skipping");
                }
            }
        }

        Self { refs }
    }

    pub fn refs(&self) -> &[SourceRef] {
        &self.refs
    }

    /// Bare source names, used to scope the access rules
    pub fn names(&self) -> Vec<String> {
        self.refs.iter().map(|r| r.name.clone()).collect()
    }

    /// `ns1/name1,ns2/name2`, the form the registry server takes for `-s`
    pub fn display_string(&self) -> String {
        self.refs
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",")
    }

    pub fn is_empty(&self) -> bool {
        self.refs.is_empty()
    }
}

/// In-process lookup store keyed by package id
///
/// Readers never observe a partially rebuilt index: every mutation happens
/// under one write lock, and [`sync`](Self::sync) builds the replacement map
/// before taking it.
#[derive(Debug, Default)]
pub struct SourceIndex {
    packages: RwLock<HashMap<String, SourceRef>>,
}

impl SourceIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `source` owns `packages`, replacing whatever it owned before
    pub fn register<I, S>(&self, source: &SourceRef, packages: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut index = self.packages.write();
        index.retain(|_, owner| owner != source);
        for package in packages {
            index.insert(package.into(), source.clone());
        }
    }

    /// Forget every package owned by `source`
    pub fn remove_source(&self, source: &SourceRef) {
        self.packages.write().retain(|_, owner| owner != source);
    }

    /// Rebuild the index from a listing of PackageSource objects.
    ///
    /// Sources without a status, or with an invalid spec, contribute nothing.
    pub fn sync(&self, sources: &[PackageSource]) {
        let mut rebuilt = HashMap::new();
        for source in sources {
            let Some(status) = source.status.as_ref() else {
                continue;
            };
            if let Err(e) = source.spec.validate() {
                warn!(source = %source.name_any(), error = %e, "Skipping invalid package source");
                continue;
            }
            let source_ref = SourceRef::new(
                source.namespace().unwrap_or_else(|| "default".to_string()),
                source.name_any(),
            );
            for package in &status.packages {
                rebuilt.insert(package.clone(), source_ref.clone());
            }
        }

        let count = rebuilt.len();
        *self.packages.write() = rebuilt;
        debug!(packages = count, "Synced package source index");
    }

    pub fn len(&self) -> usize {
        self.packages.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.packages.read().is_empty()
    }
}

impl PackageLookup for SourceIndex {
    fn read(&self, package_id: &str) -> Result<SourceRef> {
        self.packages
            .read()
            .get(package_id)
            .cloned()
            .ok_or_else(|| OperatorError::PackageNotFound(package_id.to_string()))
    }
}
