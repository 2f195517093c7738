/// Run commands inside pod containers
use anyhow::{Context, Result};
use tracing::debug;

use super::gateway::ClusterGateway;
use crate::utils::cancel::CancelSignal;

/// Target and command of a single exec call
#[derive(Debug, Clone)]
pub struct ExecOptions {
    pub namespace: String,
    pub pod_name: String,
    pub container_name: String,
    pub command: Vec<String>,
}

/// Run the command and fail unless it exits zero
///
/// Never retried here; callers retry the readiness wait instead. A cancelled
/// run abandons the exec stream.
pub async fn exec_in_pod(
    gateway: &dyn ClusterGateway,
    opts: &ExecOptions,
    cancel: &CancelSignal,
) -> Result<()> {
    let exec = gateway.exec(
        &opts.namespace,
        &opts.pod_name,
        &opts.container_name,
        &opts.command,
    );
    let output = cancel
        .guard(exec)
        .await
        .with_context(|| format!("Exec in pod {} interrupted", opts.pod_name))?
        .with_context(|| format!("Failed to exec in pod {}", opts.pod_name))?;

    if !output.stdout.trim().is_empty() {
        debug!("[{}] stdout: {}", opts.pod_name, output.stdout.trim());
    }
    if !output.stderr.trim().is_empty() {
        debug!("[{}] stderr: {}", opts.pod_name, output.stderr.trim());
    }

    if output.success {
        return Ok(());
    }

    let reason = output
        .message
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| "command exited non-zero".to_string());
    let stderr = output.stderr.trim();
    if stderr.is_empty() {
        anyhow::bail!("command {:?} in pod {} failed: {}", opts.command, opts.pod_name, reason)
    }
    anyhow::bail!(
        "command {:?} in pod {} failed: {}: {}",
        opts.command,
        opts.pod_name,
        reason,
        stderr
    )
}
