//! Plugin dependency resolution.
//!
//! Manifests declare dependencies as `(class, plugin)` pairs: "I need class X,
//! which plugin Y provides". A dependency is satisfied once some enabled class
//! registration (by name or alias) matches X.

use crate::core::error::{MissingDependency, PluginctlError};
use crate::plugins::manifest::PluginManifest;
use std::collections::BTreeSet;

/// Dependencies of `manifest` whose class is not registered, deduplicated by
/// class name and kept in manifest order. No recursion happens here.
pub fn collect_dependencies(
    manifest: &PluginManifest,
    registered: &BTreeSet<String>,
) -> Vec<MissingDependency> {
    let mut seen = BTreeSet::new();
    manifest
        .dependencies
        .iter()
        .filter(|dep| !registered.contains(&dep.class))
        .filter(|dep| seen.insert(dep.class.clone()))
        .map(|dep| MissingDependency {
            class: dep.class.clone(),
            plugin: dep.plugin.clone(),
        })
        .collect()
}

/// Order in which plugins must be installed so `target` ends up with all its
/// dependencies registered. Dependencies come first; `target` is last.
///
/// `resolve` loads a plugin's manifest. A dependency chain that comes back to a
/// plugin already on the current path is reported as
/// [`PluginctlError::DependencyCycle`].
pub fn plan_install_order<F>(
    target: &str,
    registered: &BTreeSet<String>,
    mut resolve: F,
) -> Result<Vec<String>, PluginctlError>
where
    F: FnMut(&str) -> Result<PluginManifest, PluginctlError>,
{
    let mut planner = Planner {
        available: registered.clone(),
        order: Vec::new(),
        path: Vec::new(),
    };
    planner.visit(target, &mut resolve)?;
    Ok(planner.order)
}

struct Planner {
    /// Classes registered now or by a plugin already placed in `order`.
    available: BTreeSet<String>,
    order: Vec<String>,
    path: Vec<String>,
}

impl Planner {
    fn visit<F>(&mut self, plugin: &str, resolve: &mut F) -> Result<(), PluginctlError>
    where
        F: FnMut(&str) -> Result<PluginManifest, PluginctlError>,
    {
        if self.order.iter().any(|p| p == plugin) {
            return Ok(());
        }
        if let Some(start) = self.path.iter().position(|p| p == plugin) {
            let mut cycle = self.path[start..].to_vec();
            cycle.push(plugin.to_string());
            return Err(PluginctlError::DependencyCycle(cycle));
        }

        self.path.push(plugin.to_string());
        let manifest = resolve(plugin)?;
        for dep in collect_dependencies(&manifest, &self.available) {
            if dep.plugin == plugin {
                continue;
            }
            self.visit(&dep.plugin, resolve)?;
        }
        self.path.pop();

        for class in &manifest.classes {
            self.available.insert(class.name.clone());
            if let Some(alias) = &class.alias {
                self.available.insert(alias.clone());
            }
        }
        self.order.push(plugin.to_string());
        Ok(())
    }
}
