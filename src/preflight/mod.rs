/// Preflight run orchestration
///
/// The checks are data: an ordered list of [`CheckSpec`]s walked by a small
/// driver loop. A failing check never stops the run; it is recorded and the
/// next one proceeds.
pub mod checks;
pub mod cleanup;

use anyhow::{Context, Result};
use std::fmt;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::config::RunConfig;
use crate::k8s::gateway::ClusterGateway;
use crate::k8s::naming::new_run_uid;
use crate::utils::cancel::CancelSignal;
use crate::utils::polling::Backoff;
use checks::CheckContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CheckKind {
    Kubectl,
    ClusterAccess,
    HelmVersion,
    KubernetesVersion,
    Rbac,
    StorageSnapshotClass,
    Csi,
    DnsResolution,
    VolumeSnapshot,
}

impl CheckKind {
    pub fn name(&self) -> &'static str {
        match self {
            CheckKind::Kubectl => "kubectl utility",
            CheckKind::ClusterAccess => "cluster access",
            CheckKind::HelmVersion => "helm version",
            CheckKind::KubernetesVersion => "kubernetes version",
            CheckKind::Rbac => "kubernetes RBAC",
            CheckKind::StorageSnapshotClass => "SnapshotClass",
            CheckKind::Csi => "CSI",
            CheckKind::DnsResolution => "DNS resolution",
            CheckKind::VolumeSnapshot => "volume snapshot and restore",
        }
    }

    fn start_message(&self) -> String {
        match self {
            CheckKind::HelmVersion => format!(
                "Checking for required Helm version (>= {})",
                checks::MIN_HELM_VERSION
            ),
            CheckKind::KubernetesVersion => format!(
                "Checking for required kubernetes server version (>= {})",
                checks::MIN_K8S_VERSION
            ),
            other => format!("Checking for {}", other.name()),
        }
    }
}

impl fmt::Display for CheckKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One entry of the check list
#[derive(Debug, Clone, Copy)]
pub struct CheckSpec {
    pub kind: CheckKind,
    /// Check that must have passed for this one to be attempted
    pub depends_on: Option<CheckKind>,
}

impl CheckSpec {
    pub const fn new(kind: CheckKind) -> Self {
        Self {
            kind,
            depends_on: None,
        }
    }

    pub const fn after(kind: CheckKind, dependency: CheckKind) -> Self {
        Self {
            kind,
            depends_on: Some(dependency),
        }
    }
}

/// The full check list, in execution order
pub fn default_checks() -> Vec<CheckSpec> {
    vec![
        CheckSpec::new(CheckKind::Kubectl),
        CheckSpec::new(CheckKind::ClusterAccess),
        CheckSpec::new(CheckKind::HelmVersion),
        CheckSpec::new(CheckKind::KubernetesVersion),
        CheckSpec::new(CheckKind::Rbac),
        CheckSpec::new(CheckKind::StorageSnapshotClass),
        CheckSpec::new(CheckKind::Csi),
        CheckSpec::new(CheckKind::DnsResolution),
        CheckSpec::after(CheckKind::VolumeSnapshot, CheckKind::StorageSnapshotClass),
    ]
}

/// Outcome of a single check
#[derive(Debug, Clone)]
pub struct CheckResult {
    pub kind: CheckKind,
    pub name: String,
    pub passed: bool,
    pub skipped: bool,
    pub error: Option<String>,
    pub detail: Option<String>,
}

impl CheckResult {
    fn passed(kind: CheckKind, detail: Option<String>) -> Self {
        Self {
            kind,
            name: kind.name().to_string(),
            passed: true,
            skipped: false,
            error: None,
            detail,
        }
    }

    fn failed(kind: CheckKind, error: String) -> Self {
        Self {
            kind,
            name: kind.name().to_string(),
            passed: false,
            skipped: false,
            error: Some(error),
            detail: None,
        }
    }

    fn skipped(kind: CheckKind, dependency: CheckKind) -> Self {
        Self {
            kind,
            name: kind.name().to_string(),
            passed: false,
            skipped: true,
            error: Some(format!("skipped as preflight check for {} failed", dependency)),
            detail: None,
        }
    }
}

/// Everything a run produced
#[derive(Debug)]
pub struct RunReport {
    pub uid: String,
    pub results: Vec<CheckResult>,
    pub cleanup_error: Option<String>,
}

impl RunReport {
    /// Overall verdict; a skipped check counts as a failure
    pub fn passed(&self) -> bool {
        self.results.iter().all(|r| r.passed)
    }

    pub fn result(&self, kind: CheckKind) -> Option<&CheckResult> {
        self.results.iter().find(|r| r.kind == kind)
    }

    /// Log a one-line summary per check
    pub fn log_summary(&self) {
        info!("====PREFLIGHT SUMMARY (UID {})====", self.uid);
        for result in &self.results {
            let mark = if result.passed {
                "✓"
            } else if result.skipped {
                "-"
            } else {
                "✗"
            };
            match (&result.error, &result.detail) {
                (Some(err), _) => info!("{} {}: {}", mark, result.name, err),
                (None, Some(detail)) => info!("{} {} ({})", mark, result.name, detail),
                (None, None) => info!("{} {}", mark, result.name),
            }
        }
    }
}

/// A preflight run against one cluster
pub struct Preflight {
    gateway: Arc<dyn ClusterGateway>,
    config: RunConfig,
    backoff: Backoff,
    checks: Vec<CheckSpec>,
}

impl Preflight {
    pub fn new(gateway: Arc<dyn ClusterGateway>, config: RunConfig) -> Self {
        Self {
            gateway,
            config,
            backoff: Backoff::default(),
            checks: default_checks(),
        }
    }

    pub fn with_checks(mut self, checks: Vec<CheckSpec>) -> Self {
        self.checks = checks;
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Run every check, then clean up when all passed or cleanup-on-failure is set
    ///
    /// Only a failure to generate the run UID is returned as an error; check
    /// and cleanup failures land in the report.
    pub async fn run(&self, cancel: &CancelSignal) -> Result<RunReport> {
        let uid = new_run_uid().context("Error generating resource name suffix")?;
        info!("Generated UID for preflight check - {}", uid);
        self.config.log_options();

        let ctx = CheckContext {
            gateway: self.gateway.as_ref(),
            config: &self.config,
            uid: &uid,
            backoff: &self.backoff,
            cancel,
        };

        let mut results: Vec<CheckResult> = Vec::with_capacity(self.checks.len());
        for spec in &self.checks {
            let result = self.run_spec(spec, &ctx, &results).await;
            results.push(result);
        }

        let all_passed = results.iter().all(|r| r.passed);
        if all_passed {
            info!("All preflight checks succeeded!");
        } else {
            error!("Some preflight checks failed. Check logs for more details");
        }

        let mut cleanup_error = None;
        if all_passed || self.config.cleanup_on_failure {
            info!("Cleaning up preflight resources");
            if let Err(e) =
                cleanup::cleanup_by_uid(self.gateway.as_ref(), &self.config.namespace, Some(&uid))
                    .await
            {
                warn!("✗ Failed to cleanup preflight resources :: {:#}", e);
                cleanup_error = Some(format!("{:#}", e));
            }
        } else {
            info!(
                "Leaving preflight resources for inspection; remove them with `k8s-preflight cleanup --uid {}`",
                uid
            );
        }

        Ok(RunReport {
            uid,
            results,
            cleanup_error,
        })
    }

    async fn run_spec(
        &self,
        spec: &CheckSpec,
        ctx: &CheckContext<'_>,
        prior: &[CheckResult],
    ) -> CheckResult {
        let kind = spec.kind;

        if let Some(dependency) = spec.depends_on {
            let dependency_passed = prior.iter().any(|r| r.kind == dependency && r.passed);
            if !dependency_passed {
                error!(
                    "Skipping {} check as preflight check for {} failed",
                    kind, dependency
                );
                return CheckResult::skipped(kind, dependency);
            }
        }

        if ctx.cancel.is_cancelled() {
            error!("✗ Preflight check for {} not run: run cancelled", kind);
            return CheckResult::failed(kind, "run cancelled".to_string());
        }

        info!("{}", kind.start_message());
        let check = async {
            match kind {
                CheckKind::Kubectl => checks::check_kubectl().await,
                CheckKind::ClusterAccess => checks::check_cluster_access(ctx).await,
                CheckKind::HelmVersion => checks::check_helm_version(ctx).await,
                CheckKind::KubernetesVersion => checks::check_kubernetes_version(ctx).await,
                CheckKind::Rbac => checks::check_rbac(ctx).await,
                CheckKind::StorageSnapshotClass => checks::check_storage_snapshot_class(ctx).await,
                CheckKind::Csi => checks::check_csi(ctx).await,
                CheckKind::DnsResolution => checks::check_dns_resolution(ctx).await,
                CheckKind::VolumeSnapshot => {
                    let class = prior
                        .iter()
                        .find(|r| r.kind == CheckKind::StorageSnapshotClass)
                        .and_then(|r| r.detail.clone())
                        .or_else(|| self.config.snapshot_class.clone());
                    match class {
                        Some(class) => checks::check_volume_snapshot(ctx, &class).await,
                        None => Err(anyhow::anyhow!("no volume snapshot class resolved")),
                    }
                }
            }
        };
        let outcome = match ctx.cancel.guard(check).await {
            Ok(outcome) => outcome,
            Err(cancelled) => Err(cancelled.into()),
        };

        match outcome {
            Ok(detail) => {
                info!("✓ Preflight check for {} is successful", kind);
                CheckResult::passed(kind, detail)
            }
            Err(e) => {
                error!("✗ Preflight check for {} failed :: {:#}", kind, e);
                CheckResult::failed(kind, format!("{:#}", e))
            }
        }
    }
}
