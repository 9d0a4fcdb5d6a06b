//! Prometheus text exposition format.
//!
//! Renders metric families into the text format served on `/metrics`
//! for scraping by a Prometheus server or compatible agent.

use std::fmt::Write;

use crate::snapshot::{Labels, MetricFamily};

/// Render metric families into Prometheus text format.
///
/// Every family gets its `# HELP` and `# TYPE` lines followed by one line
/// per sample.
pub fn render_prometheus(families: &[MetricFamily]) -> String {
    let mut out = String::new();

    for family in families {
        let _ = writeln!(out, "# HELP {} {}", family.name, escape_help(&family.help));
        let _ = writeln!(out, "# TYPE {} {}", family.name, family.kind.as_str());
        for sample in &family.samples {
            let _ = writeln!(
                out,
                "{}{} {}",
                sample.series_name(family),
                format_labels(&sample.labels),
                format_value(sample.value)
            );
        }
    }

    out
}

fn format_labels(labels: &Labels) -> String {
    if labels.is_empty() {
        return String::new();
    }
    let pairs: Vec<String> = labels
        .iter()
        .map(|(k, v)| format!("{k}=\"{}\"", escape_label_value(v)))
        .collect();
    format!("{{{}}}", pairs.join(","))
}

fn format_value(value: f64) -> String {
    if value.is_nan() {
        "NaN".to_string()
    } else if value == f64::INFINITY {
        "+Inf".to_string()
    } else if value == f64::NEG_INFINITY {
        "-Inf".to_string()
    } else {
        value.to_string()
    }
}

fn escape_help(help: &str) -> String {
    help.replace('\\', "\\\\").replace('\n', "\\n")
}

fn escape_label_value(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}
