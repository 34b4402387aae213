//! PackageRegistry Controller
//!
//! Watches PackageRegistry objects and runs a [`RegistryEnsurer`] pass for
//! each one, then records the outcome in the object's status.

use crate::crd::{PackageRegistry, PackageRegistryStatus, PackageSource, RegistryPhase};
use crate::error::{OperatorError, Result};
use crate::reconciler::KubeObjectApi;
use crate::registry::RegistryEnsurer;
use crate::sources::SourceIndex;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher::Config;
use kube::{Client, ResourceExt};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};
use validator::Validate;

/// Field manager used for status patches
const FIELD_MANAGER: &str = "appregistry-operator";

/// Default requeue interval for successful reconciliations
const DEFAULT_REQUEUE_SECONDS: u64 = 300; // 5 minutes

/// Requeue interval for error cases (base for exponential backoff)
const ERROR_REQUEUE_SECONDS: u64 = 30;

/// Maximum requeue delay for error backoff
const MAX_ERROR_REQUEUE_SECONDS: u64 = 600;

/// Settings shared by every reconciliation
#[derive(Debug, Clone)]
pub struct OperatorConfig {
    /// Image running `appregistry-server`
    pub registry_image: String,
}

/// Context passed to the controller
pub struct ControllerContext {
    /// Kubernetes client
    pub client: Client,
    /// Operator settings
    pub config: OperatorConfig,
    /// Package id to source lookup, refreshed on every reconcile
    pub sources: Arc<SourceIndex>,
    /// Metrics recorder (optional)
    pub metrics: Option<ControllerMetrics>,
    /// Per-registry error retry counts for exponential backoff
    pub error_counts: dashmap::DashMap<String, u32>,
}

/// Metrics for the controller
#[derive(Clone)]
pub struct ControllerMetrics {
    /// Counter for reconciliation attempts
    pub reconciliations: metrics::Counter,
    /// Counter for reconciliation errors
    pub errors: metrics::Counter,
    /// Histogram for reconciliation duration
    pub duration: metrics::Histogram,
}

impl ControllerMetrics {
    /// Create new controller metrics
    pub fn new() -> Self {
        Self {
            reconciliations: metrics::counter!("appregistry_operator_reconciliations_total"),
            errors: metrics::counter!("appregistry_operator_reconciliation_errors_total"),
            duration: metrics::histogram!("appregistry_operator_reconciliation_duration_seconds"),
        }
    }
}

impl Default for ControllerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Start the PackageRegistry controller
pub async fn run_controller(
    client: Client,
    namespace: Option<String>,
    config: OperatorConfig,
) -> Result<()> {
    let registries: Api<PackageRegistry> = match &namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    };

    let ctx = Arc::new(ControllerContext {
        client: client.clone(),
        config,
        sources: Arc::new(SourceIndex::new()),
        metrics: Some(ControllerMetrics::new()),
        error_counts: dashmap::DashMap::new(),
    });

    info!(
        namespace = namespace.as_deref().unwrap_or("all"),
        image = %ctx.config.registry_image,
        "Starting PackageRegistry controller"
    );

    // Owned objects are not watched: the Service is recreated on every pass
    // and watching it would retrigger reconciliation forever.
    Controller::new(registries, Config::default())
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, action)) => {
                    debug!(
                        name = obj.name,
                        namespace = obj.namespace,
                        ?action,
                        "Reconciliation completed"
                    );
                }
                Err(e) => {
                    error!(error = %e, "Reconciliation failed");
                }
            }
        })
        .await;

    Ok(())
}

/// Main reconciliation function
#[instrument(skip(registry, ctx), fields(name = %registry.name_any(), namespace = registry.namespace()))]
async fn reconcile(registry: Arc<PackageRegistry>, ctx: Arc<ControllerContext>) -> Result<Action> {
    let start = std::time::Instant::now();

    if let Some(ref metrics) = ctx.metrics {
        metrics.reconciliations.increment(1);
    }

    let key = error_key(&registry);
    let result = apply_registry(registry, ctx.clone()).await;

    if let Some(ref metrics) = ctx.metrics {
        metrics.duration.record(start.elapsed().as_secs_f64());
    }

    match result {
        Ok(action) => {
            // Reset error backoff counter on success
            ctx.error_counts.remove(&key);
            Ok(action)
        }
        Err(e) => {
            if let Some(ref metrics) = ctx.metrics {
                metrics.errors.increment(1);
            }
            Err(e)
        }
    }
}

/// Converge the registry and record the outcome in its status
async fn apply_registry(
    registry: Arc<PackageRegistry>,
    ctx: Arc<ControllerContext>,
) -> Result<Action> {
    let name = registry.name_any();
    let namespace = registry
        .namespace()
        .ok_or(OperatorError::MissingField(".metadata.namespace"))?;

    if let Some(remaining) = converged_recently(&registry, Utc::now()) {
        debug!(name = %name, remaining_secs = remaining.as_secs(), "Registry converged recently, skipping");
        return Ok(Action::requeue(remaining));
    }

    info!(name = %name, namespace = %namespace, "Reconciling PackageRegistry");

    if let Err(errors) = registry.spec.validate() {
        let error_msg = validation_message(&errors);
        warn!(name = %name, errors = %error_msg, "Registry spec validation failed");
        let status = build_status(&registry, RegistryPhase::Failed, None, Some(error_msg.clone()));
        update_status(&ctx.client, &registry, status).await?;
        return Err(OperatorError::InvalidConfig(error_msg));
    }

    refresh_sources(&ctx).await?;

    let mut ensurer = RegistryEnsurer::new(
        Arc::new(KubeObjectApi::new(ctx.client.clone())),
        ctx.sources.clone(),
        registry.clone(),
        ctx.config.registry_image.clone(),
    );

    match ensurer.ensure().await {
        Ok(()) => {
            let address = ensurer.address().map(str::to_string);
            let status = build_status(&registry, RegistryPhase::Succeeded, address, None);
            update_status(&ctx.client, &registry, status).await?;
            info!(name = %name, "Reconciliation complete");
            Ok(Action::requeue(Duration::from_secs(DEFAULT_REQUEUE_SECONDS)))
        }
        Err(e) => {
            let status = build_status(&registry, RegistryPhase::Failed, None, Some(e.to_string()));
            if let Err(status_err) = update_status(&ctx.client, &registry, status).await {
                warn!(name = %name, error = %status_err, "Failed to record failure in status");
            }
            Err(e)
        }
    }
}

/// Rebuild the source index from every PackageSource in the cluster
async fn refresh_sources(ctx: &ControllerContext) -> Result<()> {
    let api: Api<PackageSource> = Api::all(ctx.client.clone());
    let sources = api.list(&ListParams::default()).await?;
    ctx.sources.sync(&sources.items);
    Ok(())
}

fn validation_message(errors: &validator::ValidationErrors) -> String {
    let error_messages: Vec<String> = errors
        .field_errors()
        .iter()
        .flat_map(|(field, errs)| {
            errs.iter()
                .map(move |e| format!("{}: {:?}", field, e.message))
        })
        .collect();
    error_messages.join("; ")
}

fn error_key(registry: &PackageRegistry) -> String {
    format!(
        "{}/{}",
        registry.namespace().unwrap_or_default(),
        registry.name_any()
    )
}

/// Build a registry status for the given outcome
fn build_status(
    registry: &PackageRegistry,
    phase: RegistryPhase,
    address: Option<String>,
    message: Option<String>,
) -> PackageRegistryStatus {
    PackageRegistryStatus {
        phase,
        address,
        message,
        observed_generation: registry.metadata.generation.unwrap_or(0),
        last_updated: Some(Utc::now().to_rfc3339()),
    }
}

/// Time left until the next periodic pass, if the current generation already
/// succeeded within the requeue interval.
///
/// Every successful pass recreates the Service and publishes its new address,
/// and the resulting status event must not start another pass.
fn converged_recently(registry: &PackageRegistry, now: DateTime<Utc>) -> Option<Duration> {
    let status = registry.status.as_ref()?;
    if status.phase != RegistryPhase::Succeeded
        || status.observed_generation != registry.metadata.generation.unwrap_or(0)
    {
        return None;
    }

    let updated = DateTime::parse_from_rfc3339(status.last_updated.as_deref()?).ok()?;
    let elapsed = now.signed_duration_since(updated).to_std().ok()?;
    Duration::from_secs(DEFAULT_REQUEUE_SECONDS)
        .checked_sub(elapsed)
        .filter(|remaining| !remaining.is_zero())
}

/// Whether `next` differs from the recorded status in anything but its timestamp.
///
/// Patching an unchanged status would emit a watch event and retrigger the
/// reconcile immediately.
fn status_changed(current: Option<&PackageRegistryStatus>, next: &PackageRegistryStatus) -> bool {
    match current {
        None => true,
        Some(current) => {
            current.phase != next.phase
                || current.address != next.address
                || current.message != next.message
                || current.observed_generation != next.observed_generation
        }
    }
}

/// Update the registry status subresource
async fn update_status(
    client: &Client,
    registry: &PackageRegistry,
    status: PackageRegistryStatus,
) -> Result<()> {
    let name = registry.name_any();
    if !status_changed(registry.status.as_ref(), &status) {
        debug!(name = %name, phase = ?status.phase, "Registry status unchanged");
        return Ok(());
    }

    let namespace = registry
        .namespace()
        .ok_or(OperatorError::MissingField(".metadata.namespace"))?;
    let api: Api<PackageRegistry> = Api::namespaced(client.clone(), &namespace);

    debug!(name = %name, phase = ?status.phase, "Updating registry status");

    let patch = serde_json::json!({
        "status": status
    });

    api.patch_status(&name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
        .await
        .map_err(OperatorError::from)?;

    Ok(())
}

/// Delay before retrying after the given number of consecutive failures
fn backoff_delay(error: &OperatorError, retries: u32) -> Duration {
    error.requeue_delay().unwrap_or_else(|| {
        // 30s → 60s → 120s → 240s → 480s → 600s (capped)
        let base = Duration::from_secs(ERROR_REQUEUE_SECONDS);
        let backoff = base * 2u32.saturating_pow(retries.saturating_sub(1).min(5));
        backoff.min(Duration::from_secs(MAX_ERROR_REQUEUE_SECONDS))
    })
}

/// Error policy for the controller with exponential backoff
fn error_policy(
    registry: Arc<PackageRegistry>,
    error: &OperatorError,
    ctx: Arc<ControllerContext>,
) -> Action {
    let key = error_key(&registry);
    let retries = {
        let mut entry = ctx.error_counts.entry(key.clone()).or_insert(0);
        *entry += 1;
        *entry
    };

    let delay = backoff_delay(error, retries);

    warn!(
        error = %error,
        retry = retries,
        delay_secs = delay.as_secs(),
        "Reconciliation error for '{}', will retry",
        key
    );

    Action::requeue(delay)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::PackageRegistrySpec;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn create_test_registry(packages: &[&str]) -> PackageRegistry {
        PackageRegistry {
            metadata: ObjectMeta {
                name: Some("community".to_string()),
                namespace: Some("marketplace".to_string()),
                generation: Some(4),
                ..Default::default()
            },
            spec: PackageRegistrySpec {
                packages: packages.iter().map(|p| p.to_string()).collect(),
            },
            status: None,
        }
    }

    #[test]
    fn test_build_status_succeeded() {
        let registry = create_test_registry(&["etcd"]);
        let status = build_status(
            &registry,
            RegistryPhase::Succeeded,
            Some("10.96.0.7:50051".to_string()),
            None,
        );

        assert_eq!(status.phase, RegistryPhase::Succeeded);
        assert_eq!(status.address.as_deref(), Some("10.96.0.7:50051"));
        assert_eq!(status.observed_generation, 4);
        assert!(status.last_updated.is_some());
    }

    #[test]
    fn test_build_status_failed() {
        let registry = create_test_registry(&["etcd"]);
        let status = build_status(
            &registry,
            RegistryPhase::Failed,
            None,
            Some("boom".to_string()),
        );

        assert_eq!(status.phase, RegistryPhase::Failed);
        assert!(status.address.is_none());
        assert_eq!(status.message.as_deref(), Some("boom"));
    }

    #[test]
    fn test_validation_message_names_field() {
        let registry = create_test_registry(&[]);
        let errors = registry.spec.validate().unwrap_err();
        assert!(validation_message(&errors).contains("packages"));
    }

    #[test]
    fn test_error_key() {
        let registry = create_test_registry(&["etcd"]);
        assert_eq!(error_key(&registry), "marketplace/community");
    }

    #[test]
    fn test_backoff_doubles_for_retryable_errors() {
        let err = OperatorError::ReconcileFailed("Service has no cluster IP assigned".to_string());
        assert!(err.is_retryable());
        assert_eq!(backoff_delay(&err, 1), Duration::from_secs(30));
        assert_eq!(backoff_delay(&err, 2), Duration::from_secs(60));
        assert_eq!(backoff_delay(&err, 3), Duration::from_secs(120));
        assert_eq!(backoff_delay(&err, 5), Duration::from_secs(480));
        assert_eq!(backoff_delay(&err, 6), Duration::from_secs(600));
        assert_eq!(backoff_delay(&err, 50), Duration::from_secs(600));
    }

    #[test]
    fn test_backoff_doubles_for_invalid_config() {
        let err = OperatorError::InvalidConfig("bad".to_string());
        assert_eq!(backoff_delay(&err, 1), Duration::from_secs(30));
        assert_eq!(backoff_delay(&err, 4), Duration::from_secs(240));
    }

    #[test]
    fn test_backoff_uses_fixed_delay_for_conflicts() {
        let err = OperatorError::Conflict {
            kind: "Deployment".to_string(),
            name: "community".to_string(),
            namespace: "marketplace".to_string(),
        };
        assert_eq!(backoff_delay(&err, 1), Duration::from_secs(5));
        assert_eq!(backoff_delay(&err, 6), Duration::from_secs(5));
    }

    #[test]
    fn test_status_changed_ignores_timestamp() {
        let registry = create_test_registry(&["etcd"]);
        let address = Some("10.96.0.7:50051".to_string());
        let mut current =
            build_status(&registry, RegistryPhase::Succeeded, address.clone(), None);
        current.last_updated = Some("2020-01-01T00:00:00+00:00".to_string());

        let next = build_status(&registry, RegistryPhase::Succeeded, address, None);
        assert!(!status_changed(Some(&current), &next));

        let moved = build_status(
            &registry,
            RegistryPhase::Succeeded,
            Some("10.96.0.8:50051".to_string()),
            None,
        );
        assert!(status_changed(Some(&current), &moved));

        let failed = build_status(&registry, RegistryPhase::Failed, None, Some("boom".to_string()));
        assert!(status_changed(Some(&current), &failed));
        assert!(status_changed(None, &next));
    }

    fn with_status(
        mut registry: PackageRegistry,
        phase: RegistryPhase,
        generation: i64,
        updated: DateTime<Utc>,
    ) -> PackageRegistry {
        registry.status = Some(PackageRegistryStatus {
            phase,
            address: Some("10.96.0.7:50051".to_string()),
            message: None,
            observed_generation: generation,
            last_updated: Some(updated.to_rfc3339()),
        });
        registry
    }

    #[test]
    fn test_recent_success_skips_pass() {
        let now = Utc::now();
        let registry = with_status(
            create_test_registry(&["etcd"]),
            RegistryPhase::Succeeded,
            4,
            now - chrono::Duration::seconds(60),
        );

        let remaining = converged_recently(&registry, now).unwrap();
        assert_eq!(remaining, Duration::from_secs(240));
    }

    #[test]
    fn test_stale_or_changed_registry_is_reconciled() {
        let now = Utc::now();
        let old = now - chrono::Duration::seconds(600);
        let recent = now - chrono::Duration::seconds(10);

        let expired = with_status(create_test_registry(&["etcd"]), RegistryPhase::Succeeded, 4, old);
        assert!(converged_recently(&expired, now).is_none());

        let new_generation =
            with_status(create_test_registry(&["etcd"]), RegistryPhase::Succeeded, 3, recent);
        assert!(converged_recently(&new_generation, now).is_none());

        let failed = with_status(create_test_registry(&["etcd"]), RegistryPhase::Failed, 4, recent);
        assert!(converged_recently(&failed, now).is_none());

        assert!(converged_recently(&create_test_registry(&["etcd"]), now).is_none());
    }
}
