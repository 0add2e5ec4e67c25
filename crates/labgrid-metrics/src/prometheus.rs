//! Prometheus text exposition format.
//!
//! Renders every family of a [`Registry`] into the Prometheus text
//! exposition format for scraping by a Prometheus server or compatible
//! agent.

use std::fmt::Write;

use crate::registry::Registry;

/// Render all registered families into Prometheus text format.
///
/// Families are emitted in name order; each gets `# HELP` and `# TYPE`
/// lines even when it has no samples yet.
pub fn render_prometheus(registry: &Registry) -> String {
    let mut out = String::new();

    for family in registry.families() {
        let _ = writeln!(out, "# HELP {} {}", family.name, escape_help(&family.help));
        let _ = writeln!(out, "# TYPE {} {}", family.name, family.metric_type.as_str());

        for (values, sample) in family.snapshot() {
            if family.label_names.is_empty() {
                let _ = writeln!(out, "{} {}", family.name, format_value(sample));
                continue;
            }
            let labels = family
                .label_names
                .iter()
                .zip(&values)
                .map(|(name, value)| format!("{name}=\"{}\"", escape_label(value)))
                .collect::<Vec<_>>()
                .join(",");
            let _ = writeln!(out, "{}{{{}}} {}", family.name, labels, format_value(sample));
        }
    }

    out
}

fn format_value(value: f64) -> String {
    if value.is_nan() {
        "NaN".to_string()
    } else if value.is_infinite() {
        if value > 0.0 { "+Inf" } else { "-Inf" }.to_string()
    } else {
        value.to_string()
    }
}

fn escape_label(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

fn escape_help(help: &str) -> String {
    help.replace('\\', "\\\\").replace('\n', "\\n")
}
