//! HTML line-chart report rendered from a summary document.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use askama::Template;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::info;

use super::TimeSeries;

const WIDTH: f64 = 720.0;
const HEIGHT: f64 = 240.0;
const PAD: f64 = 36.0;

#[derive(Debug, Error)]
pub enum ChartError {
    #[error("template rendering failed: {0}")]
    Render(#[from] askama::Error),

    #[error("failed to write chart report {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("summary document has no `{0}`")]
    MissingField(&'static str),
}

/// Per-analytic samples keyed by iteration number, null when unreadable.
pub type AnalyticsSeries = BTreeMap<String, BTreeMap<u32, Option<f64>>>;

struct PointView {
    x: String,
    y: String,
    label: String,
}

struct ChartView {
    name: String,
    polylines: Vec<String>,
    points: Vec<PointView>,
    min: String,
    mean: String,
    max: String,
}

struct IterationRow {
    number: u64,
    result: String,
    css: &'static str,
    begin: String,
    duration: String,
    exception: String,
}

#[derive(Template)]
#[template(path = "analytics_chart.html")]
struct ChartTemplate {
    title: String,
    summary: Vec<(String, String)>,
    charts: Vec<ChartView>,
    iterations: Vec<IterationRow>,
    analytics_json: String,
}

/// Collect every declared analytic across all iteration records.
pub fn analytics_series(document: &Value) -> Result<AnalyticsSeries, ChartError> {
    let names = document
        .pointer("/test_summary_record/analytics_parameters")
        .and_then(Value::as_array)
        .ok_or(ChartError::MissingField("analytics_parameters"))?;
    let records = document
        .get("list_of_iteration_records")
        .and_then(Value::as_array)
        .ok_or(ChartError::MissingField("list_of_iteration_records"))?;

    let mut series = AnalyticsSeries::new();
    for name in names.iter().filter_map(Value::as_str) {
        let samples = series.entry(name.to_string()).or_default();
        for record in records {
            let Some(n) = record.get("iteration_number").and_then(Value::as_u64) else {
                continue;
            };
            let value = record
                .pointer("/iteration_data/iteration_tc_analytics_data")
                .and_then(|a| a.get(name))
                .and_then(Value::as_f64);
            samples.insert(n as u32, value);
        }
    }
    Ok(series)
}

/// Report file name for a run: `<platform>_<commissioning_method>_line_charts.html`.
pub fn report_file_name(document: &Value) -> String {
    let field = |key: &str| {
        document
            .pointer(&format!("/test_summary_record/{key}"))
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .unwrap_or("unknown")
            .to_string()
    };
    format!(
        "{}_{}_line_charts.html",
        field("platform"),
        field("commissioning_method")
    )
}

/// Render the report for `document` into `output_dir` and return its path.
pub fn build_chart_report(document: &Value, output_dir: &Path) -> Result<PathBuf, ChartError> {
    let html = render_report(document)?;
    let path = output_dir.join(report_file_name(document));
    std::fs::write(&path, html).map_err(|source| ChartError::Write {
        path: path.display().to_string(),
        source,
    })?;
    info!(path = %path.display(), "analytics chart written");
    Ok(path)
}

pub fn render_report(document: &Value) -> Result<String, ChartError> {
    let summary = document
        .get("test_summary_record")
        .ok_or(ChartError::MissingField("test_summary_record"))?;
    let series = analytics_series(document)?;

    let title = format!(
        "{} ({})",
        summary
            .get("test_case_name")
            .and_then(Value::as_str)
            .unwrap_or("stress test"),
        summary
            .get("test_case_id")
            .and_then(Value::as_str)
            .unwrap_or("-")
    );

    let summary_rows = summary
        .as_object()
        .map(|fields| {
            fields
                .iter()
                .filter(|(_, v)| !v.is_object())
                .map(|(k, v)| (k.clone(), display_value(v)))
                .collect()
        })
        .unwrap_or_default();

    let total = summary
        .get("total_number_of_iterations")
        .and_then(Value::as_u64)
        .unwrap_or(1)
        .max(1) as u32;
    let charts = series
        .iter()
        .map(|(name, samples)| chart_view(name, samples, total))
        .collect();

    let mut embedded = summary.clone();
    if let Some(obj) = embedded.as_object_mut() {
        obj.insert("analytics".into(), json!(series));
    }
    // Keep the JSON blob from closing the script element early.
    let analytics_json = serde_json::to_string(&embedded)
        .unwrap_or_else(|_| "{}".to_string())
        .replace("</", "<\\/");

    let template = ChartTemplate {
        title,
        summary: summary_rows,
        charts,
        iterations: iteration_rows(document),
        analytics_json,
    };
    Ok(template.render()?)
}

fn chart_view(name: &str, samples: &BTreeMap<u32, Option<f64>>, total: u32) -> ChartView {
    let stats = TimeSeries::new(samples.values().flatten().copied().collect());
    let (lo, hi) = match (stats.min(), stats.max()) {
        (Some(lo), Some(hi)) if hi > lo => (lo, hi),
        (Some(v), Some(_)) => (v - 1.0, v + 1.0),
        _ => (0.0, 1.0),
    };
    let span_x = (total.saturating_sub(1)).max(1) as f64;
    let project = |n: u32, v: f64| {
        let x = PAD + (n.saturating_sub(1)) as f64 / span_x * (WIDTH - 2.0 * PAD);
        let y = HEIGHT - PAD - (v - lo) / (hi - lo) * (HEIGHT - 2.0 * PAD);
        (x, y)
    };

    let mut polylines = Vec::new();
    let mut current: Vec<String> = Vec::new();
    let mut points = Vec::new();
    for (&n, value) in samples {
        match value {
            Some(v) => {
                let (x, y) = project(n, *v);
                current.push(format!("{x:.1},{y:.1}"));
                points.push(PointView {
                    x: format!("{x:.1}"),
                    y: format!("{y:.1}"),
                    label: format!("iteration {n}: {v}"),
                });
            }
            None if !current.is_empty() => polylines.push(std::mem::take(&mut current).join(" ")),
            None => {}
        }
    }
    if !current.is_empty() {
        polylines.push(current.join(" "));
    }

    let fmt = |v: Option<f64>| v.map_or_else(|| "-".to_string(), |v| format!("{v:.3}"));
    ChartView {
        name: name.to_string(),
        polylines,
        points,
        min: fmt(stats.min()),
        mean: fmt(stats.mean()),
        max: fmt(stats.max()),
    }
}

fn iteration_rows(document: &Value) -> Vec<IterationRow> {
    let Some(records) = document
        .get("list_of_iteration_records")
        .and_then(Value::as_array)
    else {
        return Vec::new();
    };
    records
        .iter()
        .map(|record| {
            let exec = record.pointer("/iteration_data/iteration_tc_execution_data");
            let text = |key: &str| {
                exec.and_then(|e| e.get(key))
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string()
            };
            let result = text("iteration_result");
            IterationRow {
                number: record
                    .get("iteration_number")
                    .and_then(Value::as_u64)
                    .unwrap_or(0),
                css: if result == "PASS" { "pass" } else { "fail" },
                result,
                begin: text("iteration_begin_time"),
                duration: record
                    .pointer("/iteration_data/iteration_tc_analytics_data/iteration_duration")
                    .and_then(Value::as_f64)
                    .map_or_else(String::new, |d| format!("{d:.3}")),
                exception: text("exception"),
            }
        })
        .collect()
}

fn display_value(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => "-".to_string(),
        other => other.to_string(),
    }
}
