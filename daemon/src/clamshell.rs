//! Lid-driven control of the built-in panel.
//!
//! Runs beside the apply session: it reacts only when the lid state or the
//! number of enabled external monitors changes, and its changes go straight
//! to the compositor without a confirm window.

use common::{MonitorDescriptor, MonitorSnapshot};
use serde::{Deserialize, Serialize};

use crate::lid::LidState;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClamshellMode {
    /// Follow the lid and external monitors
    Automatic,
    /// The user manages the panel; never touch it
    Manual,
    #[default]
    Off,
}

/// Whether built-in panels should be lit.
pub fn internal_enabled(lid: LidState, external_count: usize) -> bool {
    match lid {
        LidState::Open => external_count == 0,
        LidState::Closed => false,
        LidState::Absent => external_count == 0,
    }
}

#[derive(Debug)]
pub struct ClamshellController {
    mode: ClamshellMode,
    last: Option<(LidState, usize)>,
}

impl ClamshellController {
    pub fn new(mode: ClamshellMode) -> Self {
        Self { mode, last: None }
    }

    /// Feed the current lid state and snapshot. Returns the descriptors to
    /// apply when `(lid, external count)` changed and a panel needs flipping.
    ///
    /// `preferred` supplies the layout to restore a panel with, usually the
    /// active profile's target; without it the panel goes to the right of
    /// everything that is lit.
    pub fn observe(
        &mut self,
        lid: LidState,
        snapshot: &MonitorSnapshot,
        preferred: Option<&[MonitorDescriptor]>,
    ) -> Vec<MonitorDescriptor> {
        let key = (lid, snapshot.external_count());
        if self.last == Some(key) {
            return Vec::new();
        }
        self.last = Some(key);

        if self.mode != ClamshellMode::Automatic {
            return Vec::new();
        }

        let want = internal_enabled(lid, key.1);
        log::debug!(
            "Clamshell: lid {:?}, {} external, internal panel wanted {}",
            lid,
            key.1,
            if want { "on" } else { "off" }
        );

        let mut changes = Vec::new();
        let mut lit = snapshot.enabled().count();

        for panel in snapshot.monitors().iter().filter(|m| m.is_internal()) {
            if panel.enabled == want {
                continue;
            }

            if want {
                changes.push(restore_panel(panel, snapshot, preferred));
                lit += 1;
            } else if lit > 1 {
                let mut off = panel.clone();
                off.enabled = false;
                changes.push(off);
                lit -= 1;
            } else {
                log::info!("Keeping {} on, it is the only lit monitor", panel.name);
            }
        }
        changes
    }

    /// Forget the last observation so the next one is acted upon.
    pub fn reset(&mut self) {
        self.last = None;
    }
}

fn restore_panel(
    panel: &MonitorDescriptor,
    snapshot: &MonitorSnapshot,
    preferred: Option<&[MonitorDescriptor]>,
) -> MonitorDescriptor {
    if let Some(saved) = preferred
        .and_then(|target| target.iter().find(|m| m.name == panel.name && m.enabled))
    {
        return saved.clone();
    }

    let right_edge = snapshot
        .enabled()
        .map(|m| m.x + logical_width(m))
        .max()
        .unwrap_or(0);

    let mut on = panel.clone();
    on.enabled = true;
    on.x = right_edge;
    on.y = 0;
    on
}

fn logical_width(m: &MonitorDescriptor) -> i32 {
    let width = if m.transform.is_rotated() {
        m.mode.height
    } else {
        m.mode.width
    };
    (width as f64 / m.scale.max(0.1)).round() as i32
}
