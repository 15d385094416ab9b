//! Per-iteration state handed to the test body.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tracing::{error, info};

use super::TestError;
use crate::analysis::fields::{collect_analytics, AnalyticsField};
use crate::analysis::AttributeSource;
use crate::record::model::AnalyticsData;
use crate::record::{DutInformation, ExceptionReport, IterationResult};

pub struct IterationContext {
    iteration: u32,
    total: u32,
    began_at: DateTime<Utc>,
    started: Instant,
    result: IterationResult,
    exception: Option<String>,
    analytics: AnalyticsData,
    fields: Vec<AnalyticsField>,
    iteration_dir: PathBuf,
    operation_delay: Duration,
    step: u32,
    dut_info: Option<DutInformation>,
    dut_info_fetched: bool,
}

impl IterationContext {
    pub(crate) fn new(fields: Vec<AnalyticsField>, operation_delay: Duration) -> Self {
        Self {
            iteration: 0,
            total: 0,
            began_at: Utc::now(),
            started: Instant::now(),
            result: IterationResult::Fail,
            exception: None,
            analytics: AnalyticsData::new(),
            fields,
            iteration_dir: PathBuf::new(),
            operation_delay,
            step: 0,
            dut_info: None,
            dut_info_fetched: false,
        }
    }

    /// Fail-safe defaults for a fresh iteration: result `FAIL`, every
    /// declared analytic null.
    pub(crate) fn reset(&mut self, iteration: u32, total: u32, iteration_dir: PathBuf) {
        self.iteration = iteration;
        self.total = total;
        self.began_at = Utc::now();
        self.started = Instant::now();
        self.result = IterationResult::Fail;
        self.exception = None;
        self.analytics = self
            .fields
            .iter()
            .map(|f| (f.name.clone(), None))
            .collect();
        self.iteration_dir = iteration_dir;
        self.step = 0;
    }

    pub fn iteration_number(&self) -> u32 {
        self.iteration
    }

    pub fn total_iterations(&self) -> u32 {
        self.total
    }

    pub fn began_at(&self) -> DateTime<Utc> {
        self.began_at
    }

    /// Monotonic time since the iteration began.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Directory collecting this iteration's artifacts.
    pub fn iteration_dir(&self) -> &Path {
        &self.iteration_dir
    }

    pub fn result(&self) -> IterationResult {
        self.result
    }

    pub fn update_iteration_result(&mut self, result: IterationResult) {
        self.result = result;
    }

    /// Mark the iteration failed and attach `err` to its record. The first
    /// error of an iteration is the one kept.
    pub fn record_failure(&mut self, err: &TestError) {
        self.result = IterationResult::Fail;
        if self.exception.is_none() {
            self.exception = Some(ExceptionReport::from_error(err).to_json_text());
        }
    }

    pub fn exception(&self) -> Option<&str> {
        self.exception.as_deref()
    }

    pub fn record_analytic(&mut self, name: impl Into<String>, value: Option<f64>) {
        self.analytics.insert(name.into(), value);
    }

    pub fn analytics(&self) -> &AnalyticsData {
        &self.analytics
    }

    /// Read every declared analytics field from `source`. Device information
    /// is fetched on the first call of the run.
    pub async fn fetch_analytics(&mut self, source: &(dyn AttributeSource + '_)) {
        if !self.dut_info_fetched {
            self.dut_info_fetched = true;
            match source.read_dut_information().await {
                Ok(info) => self.dut_info = info,
                Err(e) => error!(error = %e, "failed to read DUT information"),
            }
        }
        let samples = collect_analytics(&self.fields, source).await;
        self.analytics.extend(samples);
    }

    pub fn dut_information(&self) -> Option<&DutInformation> {
        self.dut_info.as_ref()
    }

    /// Log a numbered step of the iteration.
    pub fn step(&mut self, description: &str) {
        self.step += 1;
        info!(iteration = self.iteration, step = self.step, "{description}");
    }

    /// Pause for `delay_between_stress_test_operations`.
    pub async fn pause_between_operations(&self) {
        tokio::time::sleep(self.operation_delay).await;
    }

    pub(crate) fn take_outcome(&mut self) -> (IterationResult, Option<String>, AnalyticsData) {
        (
            self.result,
            self.exception.take(),
            std::mem::take(&mut self.analytics),
        )
    }
}
