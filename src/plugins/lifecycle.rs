//! Plugin lifecycle states and the transitions allowed between them.

use crate::core::error::PluginctlError;
use crate::plugins::activation::ActivationStatus;
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginState {
    Uninstalled,
    Downloading,
    Extracting,
    Installing,
    Installed,
    Upgrading,
    Reinstalling,
    Uninstalling,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Install,
    Upgrade,
    Reinstall,
    Uninstall,
}

impl PluginState {
    pub fn from_status(status: ActivationStatus) -> Self {
        match status {
            ActivationStatus::Install => PluginState::Installed,
            ActivationStatus::Uninstalled => PluginState::Uninstalled,
        }
    }

    pub fn is_transient(self) -> bool {
        !matches!(self, PluginState::Installed | PluginState::Uninstalled)
    }

    pub fn can_transition_to(self, next: PluginState) -> bool {
        use PluginState::*;
        matches!(
            (self, next),
            (Uninstalled, Downloading)
                | (Uninstalled, Installing)
                | (Downloading, Extracting)
                | (Extracting, Installing)
                | (Installing, Installed)
                | (Installed, Upgrading)
                | (Upgrading, Installed)
                | (Installed, Reinstalling)
                | (Reinstalling, Installed)
                | (Installed, Uninstalling)
                | (Uninstalling, Uninstalled)
        )
    }
}

impl Action {
    /// Stable state an action has to start from.
    pub fn required_state(self) -> PluginState {
        match self {
            Action::Install => PluginState::Uninstalled,
            Action::Upgrade | Action::Reinstall | Action::Uninstall => PluginState::Installed,
        }
    }
}

impl fmt::Display for PluginState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PluginState::Uninstalled => "uninstalled",
            PluginState::Downloading => "downloading",
            PluginState::Extracting => "extracting",
            PluginState::Installing => "installing",
            PluginState::Installed => "installed",
            PluginState::Upgrading => "upgrading",
            PluginState::Reinstalling => "reinstalling",
            PluginState::Uninstalling => "uninstalling",
        };
        f.write_str(name)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Action::Install => "install",
            Action::Upgrade => "upgrade",
            Action::Reinstall => "reinstall",
            Action::Uninstall => "uninstall",
        };
        f.write_str(name)
    }
}

/// Tracks one plugin through one operation.
#[derive(Debug, Clone)]
pub struct Lifecycle {
    plugin: String,
    state: PluginState,
    history: Vec<PluginState>,
}

impl Lifecycle {
    pub fn new(plugin: &str, state: PluginState) -> Self {
        Self {
            plugin: plugin.to_string(),
            state,
            history: vec![state],
        }
    }

    pub fn state(&self) -> PluginState {
        self.state
    }

    pub fn history(&self) -> &[PluginState] {
        &self.history
    }

    /// Check that `action` may start from the current state.
    pub fn begin(&self, action: Action) -> Result<(), PluginctlError> {
        if self.state != action.required_state() {
            return Err(PluginctlError::InvalidTransition {
                plugin: self.plugin.clone(),
                state: self.state.to_string(),
                action: action.to_string(),
            });
        }
        Ok(())
    }

    pub fn advance(&mut self, next: PluginState) -> Result<(), PluginctlError> {
        if !self.state.can_transition_to(next) {
            return Err(PluginctlError::InvalidTransition {
                plugin: self.plugin.clone(),
                state: self.state.to_string(),
                action: format!("move to {next}"),
            });
        }
        tracing::debug!(plugin = %self.plugin, from = %self.state, to = %next, "lifecycle transition");
        self.state = next;
        self.history.push(next);
        Ok(())
    }
}
