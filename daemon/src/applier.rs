//! Confirm-or-revert application of layouts.
//!
//! ```text
//! Idle ── apply ──> Applying ──ok──> Confirming(deadline) ──confirm──> Confirmed ─> Idle
//!                      │                  │
//!                      │                  └──revert / expiry──> Reverting ─> Idle
//!                      └──rejected──> Failed ─> Idle
//! ```
//!
//! The applier owns all daemon state that outlives one event: the backend,
//! the most recent snapshot, the single pending [`ApplySession`] and the
//! profile that was last confirmed.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use chrono::Utc;
use common::{
    DaemonEvent, MoniqueError, MonitorDescriptor, MonitorSnapshot, Profile, SessionInfo,
    SessionStatus, WorkspaceBinding,
};
use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::backend::CompositorBackend;
use crate::error::{BackendError, MatchNotFound};
use crate::log_and_continue;
use crate::migrator;
use crate::profile_store::{self, ProfileStore};

/// A layout waiting for the user to keep it.
#[derive(Debug)]
pub struct ApplySession {
    profile: String,
    /// Compositor state captured before the apply touched anything
    revert: MonitorSnapshot,
    target: Vec<MonitorDescriptor>,
    deadline: Instant,
    /// Original bindings of workspaces moved by the migrator
    moved: Vec<WorkspaceBinding>,
}

impl ApplySession {
    pub fn profile(&self) -> &str {
        &self.profile
    }

    #[cfg(test)]
    pub fn revert_snapshot(&self) -> &MonitorSnapshot {
        &self.revert
    }

    fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }
}

/// What an apply request led to.
#[derive(Debug, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The compositor already shows this layout; no session was opened.
    AlreadyActive,
    /// Applied; waiting for confirmation.
    Confirming,
}

pub struct ConfigApplier<B> {
    backend: B,
    store: ProfileStore,
    confirm_timeout: Duration,
    migrate_workspaces: bool,
    snapshot: MonitorSnapshot,
    session: Option<ApplySession>,
    active_profile: Option<String>,
    /// Connector set seen by the previous settle. Profiles are only matched
    /// when it changes.
    seen: Option<BTreeSet<String>>,
    events: broadcast::Sender<DaemonEvent>,
}

impl<B: CompositorBackend> ConfigApplier<B> {
    pub fn new(
        backend: B,
        store: ProfileStore,
        confirm_timeout: Duration,
        migrate_workspaces: bool,
        events: broadcast::Sender<DaemonEvent>,
    ) -> Self {
        Self {
            backend,
            store,
            confirm_timeout,
            migrate_workspaces,
            snapshot: MonitorSnapshot::default(),
            session: None,
            active_profile: None,
            seen: None,
            events,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn store(&self) -> &ProfileStore {
        &self.store
    }

    /// The most recently queried compositor state.
    pub fn snapshot(&self) -> &MonitorSnapshot {
        &self.snapshot
    }

    pub fn active_profile(&self) -> Option<&str> {
        self.active_profile.as_deref()
    }

    pub fn session(&self) -> Option<&ApplySession> {
        self.session.as_ref()
    }

    pub fn session_info(&self) -> Option<SessionInfo> {
        self.session.as_ref().map(|s| SessionInfo {
            profile: s.profile.clone(),
            status: SessionStatus::Confirming {
                remaining_ms: s.remaining().as_millis() as u64,
            },
        })
    }

    /// When the pending session expires, if there is one.
    pub fn deadline(&self) -> Option<Instant> {
        self.session.as_ref().map(|s| s.deadline)
    }

    /// Re-query the compositor and publish the result.
    pub async fn refresh(&mut self) -> Result<&MonitorSnapshot, BackendError> {
        self.snapshot = self.backend.query_state().await?;
        self.emit(DaemonEvent::Snapshot(self.snapshot.clone()));
        Ok(&self.snapshot)
    }

    /// Handle a settled burst of compositor events: re-query, and when the
    /// connector set changed and `auto_apply` is set, apply the best matching
    /// profile. Returns whether the connector set changed.
    pub async fn settle(&mut self, auto_apply: bool) -> Result<bool, BackendError> {
        self.refresh().await?;
        let connectors = self.snapshot.connectors();

        // Our own applies and reverts come back as events too
        if self.seen.as_ref() == Some(&connectors) {
            log::debug!("Connector set unchanged, not matching profiles");
            return Ok(false);
        }
        log::info!("Connected monitors: {:?}", connectors);
        self.seen = Some(connectors);

        if !auto_apply {
            return Ok(true);
        }

        let profile = match self.store.find_match(&self.snapshot) {
            Ok(profile) => profile,
            Err(MatchNotFound) => {
                log::info!("{}", MatchNotFound);
                self.emit(DaemonEvent::NoMatch);
                return Ok(true);
            }
        };

        let target = profile_store::resolve_target(&profile, &self.snapshot);
        if self.snapshot.satisfies(&target) {
            log::info!("Layout already matches '{}'", profile.name);
            if self.session.is_none() {
                self.active_profile = Some(profile.name);
            }
            return Ok(true);
        }

        log::info!("Applying matched profile '{}'", profile.name);
        log_and_continue!(self.apply_profile(&profile).await, "apply matched profile");
        Ok(true)
    }

    /// Layout to bring a monitor back with: the pending target, else the
    /// active profile resolved onto the current snapshot.
    pub fn preferred_layout(&self) -> Option<Vec<MonitorDescriptor>> {
        if let Some(ref session) = self.session {
            return Some(session.target.clone());
        }
        let name = self.active_profile.as_deref()?;
        let profile = self.store.load(name).ok()?;
        Some(profile_store::resolve_target(&profile, &self.snapshot))
    }

    /// Apply a stored profile by name.
    pub async fn apply_named(&mut self, name: &str) -> Result<ApplyOutcome, MoniqueError> {
        let profile = self.store.load(name)?;
        self.apply_profile(&profile).await
    }

    /// Apply `profile` and open a confirm window. A session still waiting for
    /// confirmation is confirmed first.
    pub async fn apply_profile(&mut self, profile: &Profile) -> Result<ApplyOutcome, MoniqueError> {
        if self.session.is_some() {
            log::info!("New apply while a session is pending, confirming it");
            self.confirm()?;
        }

        // Revert point, captured before any mutation
        let before = self.backend.query_state().await?;
        self.snapshot = before.clone();

        let target = profile_store::resolve_target(profile, &before);
        if target.is_empty() {
            return Err(MoniqueError::InvalidProfile(format!(
                "none of the monitors of '{}' are connected",
                profile.name
            )));
        }

        if before.satisfies(&target) {
            log::info!("'{}' is already in effect", profile.name);
            self.active_profile = Some(profile.name.clone());
            return Ok(ApplyOutcome::AlreadyActive);
        }

        if projected_enabled(&before, &target) == 0 {
            return Err(MoniqueError::InvalidProfile(format!(
                "'{}' would leave no monitor enabled",
                profile.name
            )));
        }

        self.emit_status(&profile.name, SessionStatus::Applying);

        let migrate = self.migrate_workspaces && self.backend.supports_workspaces();
        let bindings = if migrate {
            match self.backend.workspaces().await {
                Ok(bindings) => bindings,
                Err(e) => {
                    log::warn!("Cannot read workspaces, skipping migration: {}", e);
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };

        if let Err(e) = self.backend.apply_configuration(&target).await {
            log::error!("Compositor rejected '{}': {}", profile.name, e);
            self.emit_status(
                &profile.name,
                SessionStatus::Failed {
                    reason: e.to_string(),
                },
            );
            // Undo whatever part of the batch did land
            log_and_continue!(
                self.backend.apply_configuration(before.monitors()).await,
                "restore layout after rejected apply"
            );
            return Err(e.into());
        }

        let after = match self.refresh().await {
            Ok(snapshot) => snapshot.clone(),
            Err(e) => {
                log::warn!("Cannot query state after apply: {}", e);
                project(&before, &target)
            }
        };

        let mut moved = Vec::new();
        if migrate && !bindings.is_empty() {
            let rules = remap_rules(profile, &before);
            let primary = target
                .iter()
                .find(|m| m.primary && m.enabled)
                .map(|m| m.name.as_str());
            let outcome =
                migrator::migrate(&self.backend, &bindings, &after, primary, &rules).await;
            if let Some(e) = outcome.error {
                log::warn!("{}", e);
            }
            moved = outcome.moved;
        }

        let deadline = Instant::now() + self.confirm_timeout;
        self.session = Some(ApplySession {
            profile: profile.name.clone(),
            revert: before,
            target,
            deadline,
            moved,
        });

        log::info!(
            "Applied '{}', reverting in {:?} unless confirmed",
            profile.name,
            self.confirm_timeout
        );
        self.emit_status(
            &profile.name,
            SessionStatus::Confirming {
                remaining_ms: self.confirm_timeout.as_millis() as u64,
            },
        );

        Ok(ApplyOutcome::Confirming)
    }

    /// Keep the pending layout.
    pub fn confirm(&mut self) -> Result<(), MoniqueError> {
        let session = self.session.take().ok_or(MoniqueError::NoSession)?;

        log_and_continue!(
            self.store.mark_applied(&session.profile, Utc::now()),
            "record last-applied time"
        );
        log::info!("Confirmed '{}'", session.profile);

        self.emit_status(&session.profile, SessionStatus::Confirmed);
        self.active_profile = Some(session.profile);
        Ok(())
    }

    /// Roll back the pending session now.
    pub async fn revert(&mut self) -> Result<(), MoniqueError> {
        let session = self.session.take().ok_or(MoniqueError::NoSession)?;
        log::info!("Reverting '{}'", session.profile);
        self.emit_status(&session.profile, SessionStatus::Reverting);

        // Only touch connectors that are still there
        let now = match self.backend.query_state().await {
            Ok(now) => now,
            Err(_) => session.revert.clone(),
        };
        let connected = now.connectors();
        let mut restore: Vec<MonitorDescriptor> = session
            .revert
            .monitors()
            .iter()
            .filter(|m| connected.contains(&m.name))
            .cloned()
            .collect();

        if projected_enabled(&now, &restore) == 0 {
            log::warn!("Revert would leave no monitor lit, keeping lit monitors on");
            restore.retain(|m| m.enabled || now.get(&m.name).is_none_or(|cur| !cur.enabled));
        }

        if let Err(e) = self.backend.apply_configuration(&restore).await {
            log::error!("Revert of '{}' failed: {}", session.profile, e);
            self.emit_status(
                &session.profile,
                SessionStatus::Failed {
                    reason: e.to_string(),
                },
            );
            return Err(e.into());
        }

        // Outputs are back, so workspaces can return to them
        if let Err(e) = migrator::restore(&self.backend, &session.moved).await {
            log::warn!("{}", e);
        }

        log_and_continue!(self.refresh().await, "query state after revert");

        self.emit(DaemonEvent::Reverted {
            profile: session.profile,
        });
        Ok(())
    }

    /// Revert the pending session if its deadline has passed.
    pub async fn expire(&mut self) -> Result<(), MoniqueError> {
        match self.session {
            Some(ref session) if Instant::now() >= session.deadline => {
                log::warn!("'{}' was not confirmed in time", session.profile);
                self.revert().await
            }
            _ => Ok(()),
        }
    }

    /// Apply descriptors immediately, with no confirm window. A pending
    /// session's revert point is updated so a later revert keeps them.
    pub async fn apply_direct(&mut self, changes: &[MonitorDescriptor]) -> Result<(), MoniqueError> {
        if changes.is_empty() {
            return Ok(());
        }

        let current = self.backend.query_state().await?;
        if projected_enabled(&current, changes) == 0 {
            return Err(MoniqueError::InvalidProfile(
                "change would leave no monitor enabled".to_string(),
            ));
        }

        self.backend.apply_configuration(changes).await?;

        if let Some(ref mut session) = self.session {
            session.revert = project(&session.revert, changes);
        }

        log_and_continue!(self.refresh().await, "query state after direct apply");
        Ok(())
    }

    fn emit_status(&self, profile: &str, status: SessionStatus) {
        self.emit(DaemonEvent::Session {
            profile: profile.to_string(),
            status,
        });
    }

    fn emit(&self, event: DaemonEvent) {
        // No watchers is fine
        let _ = self.events.send(event);
    }
}

/// `base` with every connector in `changes` replaced by its new descriptor.
fn project(base: &MonitorSnapshot, changes: &[MonitorDescriptor]) -> MonitorSnapshot {
    MonitorSnapshot::new(
        base.monitors()
            .iter()
            .map(|m| {
                changes
                    .iter()
                    .find(|c| c.name == m.name)
                    .cloned()
                    .unwrap_or_else(|| m.clone())
            })
            .collect(),
    )
}

fn projected_enabled(base: &MonitorSnapshot, changes: &[MonitorDescriptor]) -> usize {
    project(base, changes).enabled().count()
}

/// Workspace rules name the profile's connectors; translate them to the
/// connectors the monitors are actually on.
fn remap_rules(profile: &Profile, snapshot: &MonitorSnapshot) -> BTreeMap<String, String> {
    let mapping = profile_store::assign(profile, snapshot).unwrap_or_default();
    profile
        .workspace_rules
        .iter()
        .map(|(ws, out)| {
            let out = mapping.get(out).cloned().unwrap_or_else(|| out.clone());
            (ws.clone(), out)
        })
        .collect()
}
