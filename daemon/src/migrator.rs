//! Move workspaces off monitors that an apply switched off or lost.

use std::collections::{BTreeMap, BTreeSet};

use common::{MonitorSnapshot, WorkspaceBinding};

use crate::backend::CompositorBackend;
use crate::error::MigrationError;

/// Result of a migration. `moved` holds the original bindings of every
/// workspace that was actually moved, in the order they were moved.
#[derive(Debug, Default)]
pub struct MigrationOutcome {
    pub moved: Vec<WorkspaceBinding>,
    pub error: Option<MigrationError>,
}

/// Workspaces that need a new home, paired with that home.
///
/// A workspace rule wins when its output is enabled. Otherwise the home is
/// `primary` if it is enabled in `after`, else the snapshot's own primary.
/// Original order is preserved.
pub fn plan(
    bindings: &[WorkspaceBinding],
    after: &MonitorSnapshot,
    primary: Option<&str>,
    rules: &BTreeMap<String, String>,
) -> Vec<(WorkspaceBinding, String)> {
    let enabled: BTreeSet<&str> = after.enabled().map(|m| m.name.as_str()).collect();
    let home = primary
        .filter(|name| enabled.contains(name))
        .or_else(|| after.primary().map(|m| m.name.as_str()));
    let Some(home) = home else {
        return Vec::new();
    };

    bindings
        .iter()
        .filter(|b| !enabled.contains(b.output.as_str()))
        .map(|b| {
            let target = rules
                .get(&b.workspace)
                .filter(|out| enabled.contains(out.as_str()))
                .cloned()
                .unwrap_or_else(|| home.to_string());
            (b.clone(), target)
        })
        .collect()
}

/// Carry out [`plan`]. Failures are collected, never fatal.
pub async fn migrate<B: CompositorBackend>(
    backend: &B,
    bindings: &[WorkspaceBinding],
    after: &MonitorSnapshot,
    primary: Option<&str>,
    rules: &BTreeMap<String, String>,
) -> MigrationOutcome {
    let mut outcome = MigrationOutcome::default();
    let mut failures = Vec::new();

    for (binding, target) in plan(bindings, after, primary, rules) {
        match backend.move_workspace(&binding.workspace, &target).await {
            Ok(()) => {
                log::info!(
                    "Moved workspace {} from {} to {}",
                    binding.workspace,
                    binding.output,
                    target
                );
                outcome.moved.push(binding);
            }
            Err(e) => failures.push(format!("{}: {}", binding.workspace, e)),
        }
    }

    if !failures.is_empty() {
        outcome.error = Some(MigrationError { failures });
    }
    outcome
}

/// Put previously moved workspaces back where they were.
pub async fn restore<B: CompositorBackend>(
    backend: &B,
    moved: &[WorkspaceBinding],
) -> Result<(), MigrationError> {
    let mut failures = Vec::new();

    for binding in moved {
        if let Err(e) = backend
            .move_workspace(&binding.workspace, &binding.output)
            .await
        {
            failures.push(format!("{}: {}", binding.workspace, e));
        }
    }

    if failures.is_empty() {
        Ok(())
    } else {
        Err(MigrationError { failures })
    }
}
