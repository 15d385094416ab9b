//! Typed run summary, iteration records, and the persisted aggregate.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{
    CiInformation, DocId, DutInformation, HostInformation, IterationResult, RecordError,
    RunResult, RunStatus, ITERATION_DURATION,
};

/// Analytics values for one iteration; `None` when the value was unreadable.
pub type AnalyticsData = BTreeMap<String, Option<f64>>;

// ---------------------------------------------------------------------------
// Run summary
// ---------------------------------------------------------------------------

/// One per test-case execution (`test_summary_record`).
///
/// The identity fields are optional because the database copy replaces them
/// with `test_case_info_doc_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_suite_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_case_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_case_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_case_class: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_case_description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_case_info_doc_id: Option<DocId>,

    pub test_case_began_at: DateTime<Utc>,
    #[serde(default)]
    pub test_case_ended_at: Option<DateTime<Utc>>,
    pub test_case_status: RunStatus,
    pub test_case_result: RunResult,

    pub total_number_of_iterations: u32,
    #[serde(default)]
    pub number_of_iterations_completed: u32,
    #[serde(default)]
    pub number_of_iterations_passed: u32,
    #[serde(default)]
    pub number_of_iterations_failed: u32,

    #[serde(default)]
    pub platform: String,
    #[serde(default)]
    pub commissioning_method: String,
    #[serde(default)]
    pub list_of_iterations_failed: Vec<u32>,
    #[serde(default)]
    pub analytics_parameters: Vec<String>,
    #[serde(default)]
    pub mean_of_analytics: BTreeMap<String, f64>,
}

impl RunSummary {
    /// Percentage of completed iterations that passed. `None` before any
    /// iteration completed.
    pub fn pass_percentage(&self) -> Option<f64> {
        if self.number_of_iterations_completed == 0 {
            return None;
        }
        Some(
            self.number_of_iterations_passed as f64 * 100.0
                / self.number_of_iterations_completed as f64,
        )
    }

    /// Verdict for a finished run against an inclusive threshold.
    pub fn verdict(&self, pass_percentage_threshold: f64) -> RunResult {
        match self.pass_percentage() {
            Some(pct) if pct >= pass_percentage_threshold => RunResult::Pass,
            _ => RunResult::Fail,
        }
    }

    /// Drop the test-case identity, keeping only the catalog reference.
    pub fn strip_identity(&mut self, test_case_info_doc_id: DocId) {
        self.test_suite_name = None;
        self.test_case_name = None;
        self.test_case_id = None;
        self.test_case_class = None;
        self.test_case_description = None;
        self.test_case_info_doc_id = Some(test_case_info_doc_id);
    }

    pub fn validate(&self) -> Result<(), RecordError> {
        let has_identity = self.test_case_id.is_some() && self.test_case_name.is_some();
        if !has_identity && self.test_case_info_doc_id.is_none() {
            return Err(RecordError::invalid(
                "test_summary_record.test_case_id",
                "either the test case identity or test_case_info_doc_id must be present",
            ));
        }
        check_doc_id("test_summary_record.test_case_info_doc_id", self.test_case_info_doc_id)?;

        if self.total_number_of_iterations == 0 {
            return Err(RecordError::invalid(
                "test_summary_record.total_number_of_iterations",
                "must be at least 1",
            ));
        }
        if self.number_of_iterations_passed + self.number_of_iterations_failed
            != self.number_of_iterations_completed
        {
            return Err(RecordError::invalid(
                "test_summary_record.number_of_iterations_completed",
                "must equal passed + failed",
            ));
        }
        if let Some(ended) = self.test_case_ended_at {
            if ended < self.test_case_began_at {
                return Err(RecordError::invalid(
                    "test_summary_record.test_case_ended_at",
                    "must not precede test_case_began_at",
                ));
            }
        }

        let mut previous = 0;
        for &n in &self.list_of_iterations_failed {
            if n <= previous {
                return Err(RecordError::invalid(
                    "test_summary_record.list_of_iterations_failed",
                    "must be strictly ascending 1-based iteration numbers",
                ));
            }
            if n > self.total_number_of_iterations {
                return Err(RecordError::invalid(
                    "test_summary_record.list_of_iterations_failed",
                    format!(
                        "iteration {n} exceeds total_number_of_iterations {}",
                        self.total_number_of_iterations
                    ),
                ));
            }
            previous = n;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Iteration records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionData {
    pub iteration_begin_time: DateTime<Utc>,
    pub iteration_end_time: DateTime<Utc>,
    pub iteration_result: IterationResult,
    /// JSON text `{"exception_msg": ..., "traceback": ...}`.
    #[serde(default)]
    pub exception: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationData {
    pub iteration_tc_execution_data: ExecutionData,
    pub iteration_tc_analytics_data: AnalyticsData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationRecord {
    pub iteration_number: u32,
    pub iteration_data: IterationData,
}

impl IterationRecord {
    pub fn new(
        iteration_number: u32,
        begin: DateTime<Utc>,
        end: DateTime<Utc>,
        result: IterationResult,
        exception: Option<String>,
        mut analytics: AnalyticsData,
    ) -> Self {
        let end = end.max(begin);
        let duration = (end - begin).num_milliseconds() as f64 / 1000.0;
        analytics.insert(ITERATION_DURATION.to_string(), Some(duration));
        Self {
            iteration_number,
            iteration_data: IterationData {
                iteration_tc_execution_data: ExecutionData {
                    iteration_begin_time: begin,
                    iteration_end_time: end,
                    iteration_result: result,
                    exception,
                },
                iteration_tc_analytics_data: analytics,
            },
        }
    }

    pub fn result(&self) -> IterationResult {
        self.iteration_data.iteration_tc_execution_data.iteration_result
    }

    pub fn analytics(&self) -> &AnalyticsData {
        &self.iteration_data.iteration_tc_analytics_data
    }

    pub fn validate(&self) -> Result<(), RecordError> {
        if self.iteration_number == 0 {
            return Err(RecordError::invalid("iteration_number", "must be 1-based"));
        }
        let exec = &self.iteration_data.iteration_tc_execution_data;
        if exec.iteration_end_time < exec.iteration_begin_time {
            return Err(RecordError::invalid(
                "iteration_tc_execution_data.iteration_end_time",
                format!(
                    "iteration {} ends before it begins",
                    self.iteration_number
                ),
            ));
        }
        if !self
            .iteration_data
            .iteration_tc_analytics_data
            .contains_key(ITERATION_DURATION)
        {
            return Err(RecordError::invalid(
                "iteration_tc_analytics_data",
                format!("iteration {} is missing {ITERATION_DURATION}", self.iteration_number),
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Persisted aggregate
// ---------------------------------------------------------------------------

/// The durable union of summary, iteration list, and info blocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_set_id: String,
    pub test_summary_record: RunSummary,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dut_info_doc_id: Option<DocId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_info_doc_id: Option<DocId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ci_info_doc_id: Option<DocId>,

    #[serde(default)]
    pub list_of_iteration_records: Vec<IterationRecord>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dut_information_record: Option<DutInformation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_information_record: Option<HostInformation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ci_information_record: Option<CiInformation>,
}

impl RunRecord {
    pub fn new(run_set_id: impl Into<String>, summary: RunSummary) -> Self {
        Self {
            run_set_id: run_set_id.into(),
            test_summary_record: summary,
            dut_info_doc_id: None,
            host_info_doc_id: None,
            ci_info_doc_id: None,
            list_of_iteration_records: Vec::new(),
            dut_information_record: None,
            host_information_record: None,
            ci_information_record: None,
        }
    }

    /// Canonical document form.
    pub fn to_document(&self) -> Result<Value, RecordError> {
        Ok(serde_json::to_value(self)?)
    }

    /// Parse and validate a document.
    pub fn from_document(document: Value) -> Result<Self, RecordError> {
        let record: Self = serde_json::from_value(document)?;
        record.validate()?;
        Ok(record)
    }

    /// Clear every database reference id.
    pub fn without_doc_ids(mut self) -> Self {
        self.dut_info_doc_id = None;
        self.host_info_doc_id = None;
        self.ci_info_doc_id = None;
        self.test_summary_record.test_case_info_doc_id = None;
        self
    }

    /// The most recent iteration record (head of the in-memory list).
    pub fn latest_iteration(&self) -> Option<&IterationRecord> {
        self.list_of_iteration_records.first()
    }

    /// Write `record` at `iteration_number - 1`, appending when the list is
    /// shorter than that.
    pub fn splice_iteration(&mut self, record: IterationRecord) {
        let index = record.iteration_number.saturating_sub(1) as usize;
        if index < self.list_of_iteration_records.len() {
            self.list_of_iteration_records[index] = record;
        } else {
            self.list_of_iteration_records.push(record);
        }
    }

    pub fn validate(&self) -> Result<(), RecordError> {
        if uuid::Uuid::parse_str(&self.run_set_id).is_err() {
            return Err(RecordError::invalid(
                "run_set_id",
                format!("`{}` is not a UUID", self.run_set_id),
            ));
        }
        check_doc_id("dut_info_doc_id", self.dut_info_doc_id)?;
        check_doc_id("host_info_doc_id", self.host_info_doc_id)?;
        check_doc_id("ci_info_doc_id", self.ci_info_doc_id)?;
        self.test_summary_record.validate()?;

        let mut seen = BTreeSet::new();
        for iteration in &self.list_of_iteration_records {
            iteration.validate()?;
            if !seen.insert(iteration.iteration_number) {
                return Err(RecordError::invalid(
                    "list_of_iteration_records",
                    format!("iteration {} appears twice", iteration.iteration_number),
                ));
            }
        }
        Ok(())
    }
}

fn check_doc_id(field: &str, id: Option<DocId>) -> Result<(), RecordError> {
    match id {
        Some(id) if id <= 0 => Err(RecordError::invalid(field, "must be a positive id")),
        _ => Ok(()),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
