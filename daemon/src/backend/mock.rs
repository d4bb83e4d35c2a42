//! Scripted in-memory compositor for tests.

use std::cell::{Cell, RefCell};
use std::collections::BTreeSet;

use common::{MonitorDescriptor, MonitorSnapshot, WorkspaceBinding};
use tokio::sync::mpsc;

use super::{BackendKind, ChangeEvent, CompositorBackend, EventStream};
use crate::error::BackendError;

#[derive(Default)]
pub struct MockBackend {
    pub state: RefCell<MonitorSnapshot>,
    pub bindings: RefCell<Vec<WorkspaceBinding>>,
    pub applied: RefCell<Vec<Vec<MonitorDescriptor>>>,
    pub moves: RefCell<Vec<(String, String)>>,
    pub queries: Cell<usize>,
    pub reject_apply: Cell<bool>,
    pub unavailable: Cell<bool>,
    pub workspace_support: Cell<bool>,
    /// Workspaces whose moves fail
    pub stuck: RefCell<BTreeSet<String>>,
    events: RefCell<Option<mpsc::Receiver<ChangeEvent>>>,
}

impl MockBackend {
    pub fn new(monitors: Vec<MonitorDescriptor>) -> Self {
        let mock = Self::default();
        *mock.state.borrow_mut() = MonitorSnapshot::new(monitors);
        mock.workspace_support.set(true);
        mock
    }

    pub fn with_bindings(self, bindings: &[(&str, &str)]) -> Self {
        *self.bindings.borrow_mut() = bindings
            .iter()
            .map(|(ws, out)| WorkspaceBinding {
                workspace: ws.to_string(),
                output: out.to_string(),
            })
            .collect();
        self
    }

    /// Hand out a sender feeding the next `subscribe_events` stream.
    pub fn event_sender(&self) -> mpsc::Sender<ChangeEvent> {
        let (tx, rx) = mpsc::channel(64);
        *self.events.borrow_mut() = Some(rx);
        tx
    }

    pub fn snapshot(&self) -> MonitorSnapshot {
        self.state.borrow().clone()
    }

    /// Simulate a hotplug without going through an apply.
    pub fn set_monitors(&self, monitors: Vec<MonitorDescriptor>) {
        *self.state.borrow_mut() = MonitorSnapshot::new(monitors);
    }

    pub fn binding_of(&self, workspace: &str) -> Option<String> {
        self.bindings
            .borrow()
            .iter()
            .find(|b| b.workspace == workspace)
            .map(|b| b.output.clone())
    }
}

impl CompositorBackend for MockBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Hyprland
    }

    async fn detect(&self) -> bool {
        !self.unavailable.get()
    }

    async fn query_state(&self) -> Result<MonitorSnapshot, BackendError> {
        if self.unavailable.get() {
            return Err(BackendError::Unavailable("mock offline".to_string()));
        }
        self.queries.set(self.queries.get() + 1);
        Ok(self.snapshot())
    }

    async fn apply_configuration(&self, target: &[MonitorDescriptor]) -> Result<(), BackendError> {
        self.applied.borrow_mut().push(target.to_vec());
        if self.reject_apply.get() {
            return Err(BackendError::Apply("mock rejected".to_string()));
        }

        let mut monitors = self.snapshot().monitors().to_vec();
        for wanted in target {
            if let Some(current) = monitors.iter_mut().find(|m| m.name == wanted.name) {
                let identity = current.identity.clone();
                *current = wanted.clone();
                current.identity = identity;
                current.primary = false;
            }
        }
        *self.state.borrow_mut() = MonitorSnapshot::new(monitors);
        Ok(())
    }

    async fn subscribe_events(&self) -> Result<EventStream, BackendError> {
        match self.events.borrow_mut().take() {
            Some(rx) => Ok(rx),
            None => Err(BackendError::Unavailable("no mock event stream".to_string())),
        }
    }

    fn supports_workspaces(&self) -> bool {
        self.workspace_support.get()
    }

    async fn workspaces(&self) -> Result<Vec<WorkspaceBinding>, BackendError> {
        Ok(self.bindings.borrow().clone())
    }

    async fn move_workspace(&self, workspace: &str, output: &str) -> Result<(), BackendError> {
        self.moves
            .borrow_mut()
            .push((workspace.to_string(), output.to_string()));

        if self.stuck.borrow().contains(workspace) {
            return Err(BackendError::Apply(format!("cannot move {}", workspace)));
        }

        let mut bindings = self.bindings.borrow_mut();
        match bindings.iter_mut().find(|b| b.workspace == workspace) {
            Some(binding) => {
                binding.output = output.to_string();
                Ok(())
            }
            None => Err(BackendError::Apply(format!("no workspace {}", workspace))),
        }
    }
}

/// Lets a test keep poking the mock while a loop owns the "backend".
impl CompositorBackend for &MockBackend {
    fn kind(&self) -> BackendKind {
        (**self).kind()
    }

    async fn detect(&self) -> bool {
        (**self).detect().await
    }

    async fn query_state(&self) -> Result<MonitorSnapshot, BackendError> {
        (**self).query_state().await
    }

    async fn apply_configuration(&self, target: &[MonitorDescriptor]) -> Result<(), BackendError> {
        (**self).apply_configuration(target).await
    }

    async fn subscribe_events(&self) -> Result<EventStream, BackendError> {
        (**self).subscribe_events().await
    }

    fn supports_workspaces(&self) -> bool {
        (**self).supports_workspaces()
    }

    async fn workspaces(&self) -> Result<Vec<WorkspaceBinding>, BackendError> {
        (**self).workspaces().await
    }

    async fn move_workspace(&self, workspace: &str, output: &str) -> Result<(), BackendError> {
        (**self).move_workspace(workspace, output).await
    }
}
