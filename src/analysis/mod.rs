//! Analytics -- declared analytics fields, the mean aggregator, and the
//! HTML chart report.

pub mod chart;
pub mod fields;

pub use fields::{AnalyticsField, AttributePath, AttributeSource};

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use serde_json::Value;
use thiserror::Error;
use tracing::{error, warn};

#[derive(Debug, Error)]
pub enum AnalyticsError {
    #[error("summary document has no `{0}`")]
    MissingField(&'static str),

    #[error("failed to read summary document {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("summary document is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// A simple series of samples for one analytics field.
pub struct TimeSeries {
    values: Vec<f64>,
}

impl TimeSeries {
    pub fn new(values: Vec<f64>) -> Self {
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn mean(&self) -> Option<f64> {
        if self.values.is_empty() {
            return None;
        }
        Some(self.values.iter().sum::<f64>() / self.values.len() as f64)
    }

    pub fn min(&self) -> Option<f64> {
        self.values.iter().copied().reduce(f64::min)
    }

    pub fn max(&self) -> Option<f64> {
        self.values.iter().copied().reduce(f64::max)
    }

    pub fn std_dev(&self) -> Option<f64> {
        let mean = self.mean()?;
        let variance = self
            .values
            .iter()
            .map(|&x| (x - mean).powi(2))
            .sum::<f64>()
            / self.values.len() as f64;
        Some(variance.sqrt())
    }
}

/// Mean of every declared analytics field over iterations that passed and
/// are not listed in `list_of_iterations_failed`.
///
/// Never fails: fields without numeric samples are skipped, and a document
/// that cannot be read yields an empty map.
pub fn mean_of_analytics(document: &Value) -> BTreeMap<String, f64> {
    match compute_means(document) {
        Ok(means) => means,
        Err(e) => {
            error!(error = %e, "failed to compute mean of analytics");
            BTreeMap::new()
        }
    }
}

/// [`mean_of_analytics`] over the summary document at `path`.
pub fn mean_of_analytics_from_file(path: &Path) -> BTreeMap<String, f64> {
    match load_document(path) {
        Ok(doc) => mean_of_analytics(&doc),
        Err(e) => {
            error!(path = %path.display(), error = %e, "failed to load summary for analytics");
            BTreeMap::new()
        }
    }
}

pub fn load_document(path: &Path) -> Result<Value, AnalyticsError> {
    let text = std::fs::read_to_string(path).map_err(|source| AnalyticsError::Read {
        path: path.display().to_string(),
        source,
    })?;
    Ok(serde_json::from_str(&text)?)
}

/// Samples of `field` from the iterations that qualify for the mean.
pub fn qualifying_samples(document: &Value, field: &str) -> Result<TimeSeries, AnalyticsError> {
    let summary = document
        .get("test_summary_record")
        .ok_or(AnalyticsError::MissingField("test_summary_record"))?;
    let failed: HashSet<u64> = summary
        .get("list_of_iterations_failed")
        .and_then(Value::as_array)
        .map(|list| list.iter().filter_map(Value::as_u64).collect())
        .unwrap_or_default();
    let records = document
        .get("list_of_iteration_records")
        .and_then(Value::as_array)
        .ok_or(AnalyticsError::MissingField("list_of_iteration_records"))?;

    let mut values = Vec::new();
    for record in records {
        let number = record.get("iteration_number").and_then(Value::as_u64);
        let data = record.get("iteration_data");
        let result = data
            .and_then(|d| d.pointer("/iteration_tc_execution_data/iteration_result"))
            .and_then(Value::as_str);
        if result != Some("PASS") || number.map_or(true, |n| failed.contains(&n)) {
            continue;
        }
        match data
            .and_then(|d| d.get("iteration_tc_analytics_data"))
            .and_then(|a| a.get(field))
        {
            None | Some(Value::Null) => {}
            Some(Value::Number(n)) => values.extend(n.as_f64()),
            Some(other) => {
                warn!(field, iteration = number, value = %other, "non-numeric analytics sample");
                return Ok(TimeSeries::new(Vec::new()));
            }
        }
    }
    Ok(TimeSeries::new(values))
}

fn compute_means(document: &Value) -> Result<BTreeMap<String, f64>, AnalyticsError> {
    let fields: Vec<String> = document
        .pointer("/test_summary_record/analytics_parameters")
        .and_then(Value::as_array)
        .ok_or(AnalyticsError::MissingField("analytics_parameters"))?
        .iter()
        .filter_map(|v| v.as_str().map(str::to_string))
        .collect();

    let mut means = BTreeMap::new();
    for field in fields {
        let series = qualifying_samples(document, &field)?;
        match series.mean() {
            Some(mean) => {
                means.insert(field, mean);
            }
            None => warn!(field = %field, "no valid samples, skipping analytics field"),
        }
    }
    Ok(means)
}
