//! Compact output rendering helpers for CLI surfaces.
//!
//! Keeps command result output bounded and readable while preserving signal.

use crate::plugins::pipeline::{LogLevel, OperationReport};
use crate::plugins::status::{PluginStatus, StatusKind};
use colored::Colorize;

/// Collapse newlines/extra whitespace and bound length for terminal display.
pub fn compact_line(input: &str, max_chars: usize) -> String {
    let collapsed = input.split_whitespace().collect::<Vec<_>>().join(" ");
    let mut chars = collapsed.chars();
    let preview: String = chars.by_ref().take(max_chars).collect();
    if chars.next().is_some() {
        format!("{}...", preview)
    } else {
        preview
    }
}

/// Render up to `max_items` messages with compact formatting.
pub fn preview_messages(messages: &[String], max_items: usize, max_chars: usize) -> String {
    if messages.is_empty() {
        return String::new();
    }
    let shown = messages
        .iter()
        .take(max_items)
        .map(|m| compact_line(m, max_chars))
        .collect::<Vec<_>>()
        .join(" | ");
    if messages.len() > max_items {
        format!("{} (+{} more)", shown, messages.len() - max_items)
    } else {
        shown
    }
}

pub fn render_report(report: &OperationReport, verbose: bool) -> String {
    let mut out = format!(
        "{} {} {} {} {}",
        "▸".bright_cyan(),
        report.action.to_string().bright_white().bold(),
        report.plugin.bright_green(),
        report.from.to_string().dimmed(),
        format!("→ {}", report.to).bright_white()
    );
    if let Some(version) = report.version {
        out.push_str(&format!(" (version {version})"));
    }
    for entry in &report.log {
        match entry.level {
            LogLevel::Warn => out.push_str(&format!(
                "\n  {} [{}] {}",
                "⚠".bright_yellow(),
                entry.step,
                compact_line(&entry.message, 120)
            )),
            LogLevel::Info if verbose => out.push_str(&format!(
                "\n    [{}] {}",
                entry.step.dimmed(),
                compact_line(&entry.message, 120)
            )),
            LogLevel::Info => {}
        }
    }
    if !verbose {
        let warnings = report.warnings();
        out.push_str(&format!(
            "\n  {} steps logged, {} warnings",
            report.log.len(),
            warnings
        ));
    }
    out
}

pub fn render_status_table(statuses: &[PluginStatus]) -> String {
    if statuses.is_empty() {
        return "No plugins found.".to_string();
    }
    let width = statuses.iter().map(|s| s.name.len()).max().unwrap_or(0);
    let mut lines = Vec::with_capacity(statuses.len());
    for status in statuses {
        let label = format!("{:<18}", status.status.to_string());
        let label = match status.status {
            StatusKind::Installed => label.bright_green(),
            StatusKind::UpgradeAvailable => label.bright_yellow(),
            StatusKind::MissingFiles => label.bright_red(),
            StatusKind::Uninstalled | StatusKind::RemoteOnly => label.normal(),
        };
        let version = match (status.installed_version, status.available_version) {
            (Some(installed), Some(available)) if available != installed => {
                format!("v{installed} (v{available} available)")
            }
            (Some(installed), _) => format!("v{installed}"),
            (None, Some(available)) => format!("v{available} available"),
            (None, None) => String::new(),
        };
        let pin = if status.persistent { " [persistent]" } else { "" };
        lines.push(format!(
            "{:<width$}  {} {}{}",
            status.name, label, version, pin
        ));
    }
    lines.join("\n")
}
