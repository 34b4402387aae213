//! Registry convergence
//!
//! [`RegistryEnsurer`] drives the five objects backing a `PackageRegistry`
//! toward their desired shape, in dependency order:
//!
//! 1. ServiceAccount (identity of the registry pod)
//! 2. Role scoped to the resolved package sources
//! 3. RoleBinding of the Role to the ServiceAccount
//! 4. Deployment running `appregistry-server`
//! 5. Service, recreated on every pass so its address is freshly reported
//!
//! The first failing step aborts the pass. Nothing is rolled back; the next
//! call picks up where this one stopped.

use crate::crd::PackageRegistry;
use crate::error::{OperatorError, Result};
use crate::reconciler::{ensure_object, RegistryClient};
use crate::resources::{registry_command, ResourceBuilder};
use crate::sources::{PackageLookup, ResolvedSources};
use k8s_openapi::api::core::v1::Service;
use kube::ResourceExt;
use std::sync::Arc;
use tracing::{info, instrument};

/// Converges the managed objects of one PackageRegistry
pub struct RegistryEnsurer<C: ?Sized> {
    client: Arc<C>,
    lookup: Arc<dyn PackageLookup>,
    registry: Arc<PackageRegistry>,
    image: String,
    address: Option<String>,
}

impl<C: RegistryClient + ?Sized> RegistryEnsurer<C> {
    pub fn new(
        client: Arc<C>,
        lookup: Arc<dyn PackageLookup>,
        registry: Arc<PackageRegistry>,
        image: impl Into<String>,
    ) -> Self {
        Self {
            client,
            lookup,
            registry,
            image: image.into(),
            address: None,
        }
    }

    /// Run one convergence pass over all managed objects
    #[instrument(skip(self), fields(name = %self.registry.name_any(), namespace = self.registry.namespace()))]
    pub async fn ensure(&mut self) -> Result<()> {
        self.address = None;

        let builder = ResourceBuilder::new(&self.registry, &self.image)?;
        let client = self.client.as_ref();
        let packages = &self.registry.spec.packages;

        let sources = ResolvedSources::resolve(self.lookup.as_ref(), packages);

        ensure_object(client, builder.build_service_account()).await?;
        ensure_object(client, builder.build_role(&sources)).await?;
        ensure_object(client, builder.build_role_binding()).await?;

        let command = registry_command(packages, &sources);
        info!(command = ?command, "Registry command");
        ensure_object(client, builder.build_deployment(command)).await?;

        let service = ensure_object(client, builder.build_service()).await?;
        let address = service_address(&service)?;
        info!(address = %address, "Registry is reachable");

        self.address = Some(address);
        Ok(())
    }

    /// `clusterIP:port` of the registry, set only by a successful [`ensure`](Self::ensure)
    pub fn address(&self) -> Option<&str> {
        self.address.as_deref()
    }
}

/// `clusterIP:port` of the first port of a freshly created Service
fn service_address(service: &Service) -> Result<String> {
    let spec = service
        .spec
        .as_ref()
        .ok_or_else(|| OperatorError::ReconcileFailed("Service has no spec".to_string()))?;

    let cluster_ip = spec
        .cluster_ip
        .as_deref()
        .filter(|ip| !ip.is_empty() && *ip != "None")
        .ok_or_else(|| {
            OperatorError::ReconcileFailed("Service has no cluster IP assigned".to_string())
        })?;

    let port = spec
        .ports
        .as_ref()
        .and_then(|ports| ports.first())
        .map(|p| p.port)
        .ok_or_else(|| OperatorError::ReconcileFailed("Service exposes no port".to_string()))?;

    Ok(format!("{}:{}", cluster_ip, port))
}
