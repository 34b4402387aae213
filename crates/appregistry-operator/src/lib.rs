//! # AppRegistry Kubernetes Operator
//!
//! Keeps a package registry server running for every `PackageRegistry`
//! custom resource. Each registry gets its own identity, a narrowly scoped
//! access role, a binding between the two, a single-replica workload running
//! `appregistry-server`, and a gRPC endpoint whose address is published in
//! the registry status.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use appregistry_operator::prelude::*;
//! use kube::Client;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let client = Client::try_default().await?;
//!     let config = OperatorConfig {
//!         registry_image: "quay.io/appregistry/registry-server:latest".to_string(),
//!     };
//!     run_controller(client, None, config).await
//! }
//! ```
//!
//! ## Architecture
//!
//! A reconciliation pass runs these steps in order and stops at the first
//! failure:
//!
//! 1. **Identity**: ServiceAccount named after the registry (never updated)
//! 2. **Access role**: Role allowing `get` on the resolved PackageSources and on secrets
//! 3. **Access binding**: RoleBinding from the Role to the ServiceAccount
//! 4. **Workload**: Deployment running the registry server with the package list
//! 5. **Endpoint**: Service on port 50051, deleted and recreated every pass
//!
//! Every step goes through [`reconciler::ensure_object`], which creates a
//! missing object, treats "already exists" as success, and otherwise applies
//! the kind's [`reconciler::DriftPolicy`].
//!
//! ## Modules
//!
//! - [`crd`] - `PackageRegistry` and `PackageSource` definitions with validation
//! - [`sources`] - Package id to source resolution
//! - [`resources`] - Desired-state builders for the five managed objects
//! - [`reconciler`] - Generic create/update/recreate strategy and the API seam
//! - [`registry`] - The ordered reconciliation pass for one registry
//! - [`controller`] - Watch loop, status reporting and retry backoff
//! - [`error`] - Error types for operator operations
//!
//! ## Example
//!
//! ```yaml
//! apiVersion: appregistry.dev/v1alpha1
//! kind: PackageRegistry
//! metadata:
//!   name: community
//!   namespace: marketplace
//! spec:
//!   packages:
//!     - etcd
//!     - prometheus
//! ```
//!
//! ## Metrics
//!
//! - `appregistry_operator_reconciliations_total` - Total reconciliation attempts
//! - `appregistry_operator_reconciliation_errors_total` - Reconciliation errors
//! - `appregistry_operator_reconciliation_duration_seconds` - Reconciliation latency

pub mod controller;
pub mod crd;
pub mod error;
pub mod reconciler;
pub mod registry;
pub mod resources;
pub mod sources;

#[cfg(test)]
mod testing;

pub mod prelude {
    //! Re-exports for convenient usage
    pub use crate::controller::{
        run_controller, ControllerContext, ControllerMetrics, OperatorConfig,
    };
    pub use crate::crd::{
        PackageRegistry, PackageRegistrySpec, PackageRegistryStatus, PackageSource,
        PackageSourceSpec, PackageSourceStatus, RegistryPhase,
    };
    pub use crate::error::{OperatorError, Result};
    pub use crate::reconciler::{ensure_object, DriftPolicy, KubeObjectApi, ObjectApi};
    pub use crate::registry::RegistryEnsurer;
    pub use crate::resources::ResourceBuilder;
    pub use crate::sources::{PackageLookup, ResolvedSources, SourceIndex, SourceRef};
}
