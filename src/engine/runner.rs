//! The run loop.
//!
//! `start -> iterate -> finalize`, with every iteration wrapped in
//! `pre_iteration -> body -> post_iteration`. The runner owns the run record
//! and is the only writer of its counters.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::artifacts::{self, iteration_dir, iteration_log_name};
use super::context::IterationContext;
use super::{ErrorClass, IterationBody, RunError, TestError};
use crate::analysis::chart::build_chart_report;
use crate::analysis::{self, AnalyticsField};
use crate::capture::{CaptureAgent, PacketCapture};
use crate::config::{InterIterationDelay, LoggingConfig, StressConfig, TestCaseConfig};
use crate::dut::DutController;
use crate::logging::{IterationLogGuard, IterationLogRouter};
use crate::observer::ResultObservable;
use crate::record::{
    CiInformation, HostInformation, IterationRecord, IterationResult, RunRecord, RunResult,
    RunStatus, RunSummary, ITERATION_DURATION,
};

pub const SUMMARY_FILE_NAME: &str = "summary.json";

/// Everything the runner needs from configuration, already resolved.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub test_case: TestCaseConfig,
    pub platform: String,
    pub total_iterations: u32,
    pub pass_percentage_threshold: f64,
    pub delay_between_iterations: InterIterationDelay,
    pub delay_between_operations: Duration,
    pub analytics_fields: Vec<AnalyticsField>,
    pub run_set_folder: PathBuf,
    pub logging: LoggingConfig,
    pub capture_on_border_router: bool,
    /// Factory reset once before the first iteration.
    pub initial_factory_reset: bool,
    pub ci_results_path: Option<PathBuf>,
}

impl RunSettings {
    /// Minimal settings: default test case identity, no captures, no log
    /// copies and no pause between iterations.
    pub fn new(run_set_folder: impl Into<PathBuf>, total_iterations: u32) -> Self {
        Self {
            test_case: TestCaseConfig::default(),
            platform: crate::config::DEFAULT_PLATFORM.to_string(),
            total_iterations,
            pass_percentage_threshold: crate::config::DEFAULT_PASS_PERCENTAGE_THRESHOLD,
            delay_between_iterations: InterIterationDelay::Fixed(Duration::ZERO),
            delay_between_operations: Duration::ZERO,
            analytics_fields: Vec::new(),
            run_set_folder: run_set_folder.into(),
            logging: LoggingConfig {
                capture_tcpdump_on_controller: false,
                copy_var_log: false,
                ..LoggingConfig::default()
            },
            capture_on_border_router: false,
            initial_factory_reset: false,
            ci_results_path: None,
        }
    }

    /// Settings for a fresh run, placing the run set folder under the
    /// configured output directory.
    pub fn from_config(config: &StressConfig) -> Self {
        let general = &config.general;
        let run_set_folder = artifacts::run_set_folder(
            &general.output_dir,
            &config.test_case.test_case_class,
            Utc::now(),
        );
        Self {
            test_case: config.test_case.clone(),
            platform: general.platform_execution.clone(),
            total_iterations: general.number_of_iterations,
            pass_percentage_threshold: general.pass_percentage_threshold,
            delay_between_iterations: general.sleep_duration_between_iterations,
            delay_between_operations: general.delay_between_stress_test_operations,
            analytics_fields: general.analytics_parameters.clone(),
            run_set_folder,
            logging: general.logging.clone(),
            capture_on_border_router: config.otbr.capture_tcpdump_on_otbr,
            initial_factory_reset: config.test_case.perform_initial_factory_reset
                && !general.use_test_event_trigger_factory_reset,
            ci_results_path: config.ci.ci_test_results_path_in_ws.clone(),
        }
    }

    pub fn summary_path(&self) -> PathBuf {
        self.run_set_folder.join(SUMMARY_FILE_NAME)
    }

    /// Declared analytics names plus `iteration_duration`.
    pub fn analytics_parameters(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .analytics_fields
            .iter()
            .map(|f| f.name.clone())
            .collect();
        if !names.iter().any(|n| n == ITERATION_DURATION) {
            names.push(ITERATION_DURATION.to_string());
        }
        names
    }

    fn initial_summary(&self) -> RunSummary {
        let tc = &self.test_case;
        RunSummary {
            test_suite_name: Some(tc.test_suite_name.clone()),
            test_case_name: Some(tc.test_case_name.clone()),
            test_case_id: Some(tc.test_case_id.clone()),
            test_case_class: Some(tc.test_case_class.clone()),
            test_case_description: tc.test_case_description.clone(),
            test_case_info_doc_id: None,
            test_case_began_at: Utc::now(),
            test_case_ended_at: None,
            test_case_status: RunStatus::InProgress,
            test_case_result: RunResult::InProgress,
            total_number_of_iterations: self.total_iterations,
            number_of_iterations_completed: 0,
            number_of_iterations_passed: 0,
            number_of_iterations_failed: 0,
            platform: self.platform.clone(),
            commissioning_method: tc.commissioning_method.clone(),
            list_of_iterations_failed: Vec::new(),
            analytics_parameters: self.analytics_parameters(),
            mean_of_analytics: Default::default(),
        }
    }
}

/// Drives one test case execution against a DUT.
pub struct StressRunner<D: DutController> {
    settings: RunSettings,
    dut: D,
    observable: ResultObservable,
    record: RunRecord,
    ctx: IterationContext,
    cancel: CancellationToken,
    log_router: IterationLogRouter,
    log_guard: Option<IterationLogGuard>,
    controller_capture: Option<PacketCapture>,
    border_router: Option<Box<dyn CaptureAgent>>,
    next_iteration: u32,
    current_iteration: u32,
    in_flight: bool,
    finalized: bool,
}

impl<D: DutController> StressRunner<D> {
    pub fn new(settings: RunSettings, dut: D, observable: ResultObservable) -> Self {
        let record = RunRecord::new(uuid::Uuid::new_v4().to_string(), settings.initial_summary());
        let ctx = IterationContext::new(
            settings.analytics_fields.clone(),
            settings.delay_between_operations,
        );
        Self {
            settings,
            dut,
            observable,
            record,
            ctx,
            cancel: CancellationToken::new(),
            log_router: IterationLogRouter::new(),
            log_guard: None,
            controller_capture: None,
            border_router: None,
            next_iteration: 1,
            current_iteration: 0,
            in_flight: false,
            finalized: false,
        }
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Route per-iteration logs through `router` (usually the one returned
    /// by [`crate::logging::init`]).
    pub fn with_log_router(mut self, router: IterationLogRouter) -> Self {
        self.log_router = router;
        self
    }

    pub fn with_border_router(mut self, agent: Box<dyn CaptureAgent>) -> Self {
        self.border_router = Some(agent);
        self
    }

    pub fn with_host_information(mut self, host: HostInformation) -> Self {
        self.record.host_information_record = Some(host);
        self
    }

    pub fn with_ci_information(mut self, ci: CiInformation) -> Self {
        self.record.ci_information_record = (!ci.is_empty()).then_some(ci);
        self
    }

    /// Continue the run persisted at `summary_path`. Its run set id, start
    /// time, counters and iterations are kept and the loop picks up after
    /// the last recorded iteration.
    pub fn resume_from(mut self, summary_path: &Path) -> Result<Self, RunError> {
        let document = analysis::load_document(summary_path)
            .map_err(|e| RunError::Setup(anyhow::Error::new(e)))?;
        let mut previous = RunRecord::from_document(document)
            .map_err(|e| RunError::Setup(anyhow::Error::new(e)))?;

        let total = self
            .settings
            .total_iterations
            .max(previous.test_summary_record.total_number_of_iterations);
        previous.list_of_iteration_records.sort_by_key(|r| r.iteration_number);
        let last = previous
            .list_of_iteration_records
            .last()
            .map(|r| r.iteration_number)
            .unwrap_or(0);

        let summary = &mut previous.test_summary_record;
        summary.test_case_status = RunStatus::InProgress;
        summary.test_case_result = RunResult::InProgress;
        summary.test_case_ended_at = None;
        summary.total_number_of_iterations = total;
        summary.analytics_parameters = self.settings.analytics_parameters();
        summary.mean_of_analytics.clear();

        // In memory the newest iteration is at the head.
        previous.list_of_iteration_records.reverse();
        if previous.host_information_record.is_none() {
            previous.host_information_record = self.record.host_information_record.take();
        }
        if previous.ci_information_record.is_none() {
            previous.ci_information_record = self.record.ci_information_record.take();
        }

        if let Some(folder) = summary_path.parent() {
            self.settings.run_set_folder = folder.to_path_buf();
        }
        self.settings.total_iterations = total;
        info!(
            run_set_id = %previous.run_set_id,
            completed = previous.test_summary_record.number_of_iterations_completed,
            resume_at = last + 1,
            "resuming run"
        );
        self.record = previous;
        self.next_iteration = last + 1;
        self.current_iteration = last;
        Ok(self)
    }

    pub fn settings(&self) -> &RunSettings {
        &self.settings
    }

    pub fn dut(&self) -> &D {
        &self.dut
    }

    pub fn record(&self) -> &RunRecord {
        &self.record
    }

    pub fn summary(&self) -> &RunSummary {
        &self.record.test_summary_record
    }

    pub fn current_iteration(&self) -> u32 {
        self.current_iteration
    }

    pub fn summary_path(&self) -> PathBuf {
        self.settings.summary_path()
    }

    /// Run the whole test case: start, every iteration, finalize.
    pub async fn run<B>(&mut self, body: &mut B) -> Result<RunSummary, RunError>
    where
        B: IterationBody<D> + ?Sized,
    {
        self.start().await?;
        let iterations = self.settings.total_iterations;
        self.iterate(body, iterations).await?;
        self.finalize(false).await
    }

    /// Bring up the DUT and publish the `IN_PROGRESS` snapshot.
    pub async fn start(&mut self) -> Result<(), RunError> {
        std::fs::create_dir_all(&self.settings.run_set_folder).map_err(|e| {
            RunError::Setup(anyhow::anyhow!(
                "failed to create run set folder {}: {e}",
                self.settings.run_set_folder.display()
            ))
        })?;
        info!(
            run_set_id = %self.record.run_set_id,
            test_case = %self.settings.test_case.test_case_name,
            iterations = self.settings.total_iterations,
            folder = %self.settings.run_set_folder.display(),
            "starting test case"
        );

        if let Err(e) = self.dut.start_test().await {
            error!(error = %e, "DUT start_test failed");
            return Err(self.abort(RunError::Startup(e)).await);
        }
        if self.settings.initial_factory_reset && self.next_iteration == 1 {
            if let Err(e) = self.dut.factory_reset_dut().await {
                error!(error = %e, "initial factory reset failed");
                return Err(self.abort(RunError::Startup(e)).await);
            }
        }

        if let Err(e) = self.notify() {
            return Err(self.abort(e).await);
        }
        Ok(())
    }

    /// Execute iterations up to and including `iterations`, starting after
    /// the last one already recorded.
    pub async fn iterate<B>(&mut self, body: &mut B, iterations: u32) -> Result<(), RunError>
    where
        B: IterationBody<D> + ?Sized,
    {
        while self.next_iteration <= iterations {
            let n = self.next_iteration;
            if self.cancel.is_cancelled() {
                return Err(self.cancelled().await);
            }
            self.current_iteration = n;

            let outcome = match self.pre_iteration(n).await {
                Err(e) => Some(Err(e)),
                Ok(()) => tokio::select! {
                    result = body.run_iteration(&mut self.ctx, &self.dut) => Some(result),
                    _ = self.cancel.cancelled() => None,
                },
            };
            let Some(outcome) = outcome else {
                return Err(self.cancelled().await);
            };

            let returned_normally = outcome.is_ok();
            let mut stop = false;
            match outcome {
                Ok(()) => {}
                Err(e) => match e.class() {
                    ErrorClass::Recoverable => {
                        error!(iteration = n, error = %e, "iteration failed");
                        self.ctx.record_failure(&e);
                    }
                    ErrorClass::Exit => {
                        warn!(iteration = n, error = %e, "exit requested, stopping after this iteration");
                        self.ctx.record_failure(&e);
                        stop = true;
                    }
                    ErrorClass::Fatal => {
                        error!(iteration = n, error = %e, "unrecoverable error, aborting run");
                        return Err(self.abort(RunError::Aborted(e)).await);
                    }
                },
            }

            match self.post_iteration().await {
                Ok(None) => {}
                Ok(Some(e)) if e.class() == ErrorClass::Exit => stop = true,
                Ok(Some(e)) => return Err(self.abort(RunError::Aborted(e)).await),
                Err(e) => return Err(self.abort(e).await),
            }

            if stop {
                self.current_iteration = iterations;
                self.next_iteration = iterations + 1;
                break;
            }
            self.next_iteration = n + 1;

            if returned_normally && self.next_iteration <= iterations {
                let pause = self.settings.delay_between_iterations.sample();
                tokio::select! {
                    _ = tokio::time::sleep(pause) => {}
                    _ = self.cancel.cancelled() => return Err(self.cancelled().await),
                }
            }
        }
        Ok(())
    }

    /// Close out the run: final status and verdict, analytics means, the
    /// last snapshot, then the chart report and CI copies.
    pub async fn finalize(&mut self, aborted: bool) -> Result<RunSummary, RunError> {
        if self.finalized {
            return Ok(self.record.test_summary_record.clone());
        }
        self.finalized = true;
        self.stop_captures(None).await;
        self.log_guard = None;

        if aborted {
            if let Err(e) = self.dut.stop_logging().await {
                warn!(error = %e, "failed to stop DUT logging");
            }
        }
        if let Err(e) = self.dut.end_test().await {
            warn!(error = %e, "DUT end_test failed");
        }

        let summary_path = self.summary_path();
        let means = if summary_path.exists() {
            analysis::mean_of_analytics_from_file(&summary_path)
        } else {
            self.record
                .to_document()
                .map(|doc| analysis::mean_of_analytics(&doc))
                .unwrap_or_default()
        };
        let summary = &mut self.record.test_summary_record;
        summary.test_case_status = if aborted {
            RunStatus::Aborted
        } else {
            RunStatus::Completed
        };
        summary.test_case_result = summary.verdict(self.settings.pass_percentage_threshold);
        summary.test_case_ended_at = Some(Utc::now().max(summary.test_case_began_at));
        summary.mean_of_analytics = means;

        self.notify()?;
        self.publish_report(&summary_path);

        let summary = &self.record.test_summary_record;
        info!(
            status = %summary.test_case_status,
            result = %summary.test_case_result,
            completed = summary.number_of_iterations_completed,
            passed = summary.number_of_iterations_passed,
            failed = summary.number_of_iterations_failed,
            "test case finished"
        );
        Ok(summary.clone())
    }

    // -----------------------------------------------------------------------
    // Iteration phases
    // -----------------------------------------------------------------------

    async fn pre_iteration(&mut self, n: u32) -> Result<(), TestError> {
        let dir = iteration_dir(&self.settings.run_set_folder, n);
        self.ctx.reset(n, self.settings.total_iterations, dir.clone());
        self.in_flight = true;

        if self.log_guard.is_none() {
            let path = dir.join(iteration_log_name(n, Utc::now()));
            let guard = self.log_router.open(&path).map_err(|e| {
                TestError::Fatal(anyhow::anyhow!(
                    "failed to open iteration log {}: {e}",
                    path.display()
                ))
            })?;
            self.log_guard = Some(guard);
        }

        // Leftovers from an iteration that never reached teardown.
        self.stop_captures(None).await;
        if self.settings.logging.capture_tcpdump_on_controller {
            let output = dir.join(format!("controller_iteration_{n}.pcap"));
            let mut capture =
                PacketCapture::tcpdump(&self.settings.logging.tcpdump_interface, &output);
            match capture.start() {
                Ok(()) => self.controller_capture = Some(capture),
                Err(e) => warn!(error = %e, "controller packet capture not started"),
            }
        }
        if self.settings.capture_on_border_router {
            if let Some(agent) = &self.border_router {
                if let Err(e) = agent.start_capture().await {
                    warn!(error = %e, "border router capture not started");
                }
            }
        }

        info!(iteration = n, total = self.settings.total_iterations, "iteration started");
        let dut_log = dir.join(format!("dut_log_iteration_{n}.log"));
        self.dut.start_logging(&dut_log.display().to_string()).await?;
        self.dut.pre_iteration_loop().await
    }

    /// Teardown and recording. Returns a DUT hook error that should stop or
    /// abort the run; recoverable hook errors only fail the iteration.
    async fn post_iteration(&mut self) -> Result<Option<TestError>, RunError> {
        let dir = self.ctx.iteration_dir().to_path_buf();

        if self.ctx.result() == IterationResult::Fail && self.settings.logging.copy_var_log {
            artifacts::copy_var_logs(
                &self.settings.logging.var_log_dir,
                &self.settings.logging.var_log_filenames,
                &dir.join("var_logs"),
            );
        }
        self.stop_captures(Some(&dir)).await;

        let mut escalate = None;
        let post_loop = self.dut.post_iteration_loop().await;
        let stop_logging = self.dut.stop_logging().await;
        for (hook, result) in [("post_iteration_loop", post_loop), ("stop_logging", stop_logging)] {
            if let Err(e) = result {
                error!(hook, error = %e, "DUT hook failed");
                self.ctx.record_failure(&e);
                if e.class() != ErrorClass::Recoverable && escalate.is_none() {
                    escalate = Some(e);
                }
            }
        }

        self.record_iteration()?;
        Ok(escalate)
    }

    /// Fold the iteration outcome into the run record and publish it.
    fn record_iteration(&mut self) -> Result<(), RunError> {
        self.log_guard = None;
        self.in_flight = false;

        let n = self.ctx.iteration_number();
        let began_at = self.ctx.began_at();
        let dut_info = self.ctx.dut_information().cloned();
        let ended_at = chrono::Duration::from_std(self.ctx.elapsed())
            .map(|elapsed| began_at + elapsed)
            .unwrap_or_else(|_| Utc::now());
        let (result, exception, analytics) = self.ctx.take_outcome();
        let record = IterationRecord::new(n, began_at, ended_at, result, exception, analytics);

        let summary = &mut self.record.test_summary_record;
        summary.number_of_iterations_completed += 1;
        match result {
            IterationResult::Pass => summary.number_of_iterations_passed += 1,
            IterationResult::Fail => {
                summary.number_of_iterations_failed += 1;
                if summary.list_of_iterations_failed.last().map_or(true, |&last| last < n) {
                    summary.list_of_iterations_failed.push(n);
                }
            }
        }
        if dut_info.is_some() {
            self.record.dut_information_record = dut_info;
        }
        self.record.list_of_iteration_records.insert(0, record.clone());

        if let Err(e) = artifacts::write_iteration_json(self.ctx.iteration_dir(), &record) {
            warn!(iteration = n, error = %e, "failed to write iteration.json");
        }
        self.notify()?;
        info!(iteration = n, result = %result, "iteration recorded");
        Ok(())
    }

    async fn stop_captures(&mut self, save_into: Option<&Path>) {
        if let Some(mut capture) = self.controller_capture.take() {
            capture.stop().await;
        }
        if !self.settings.capture_on_border_router {
            return;
        }
        let Some(agent) = &self.border_router else {
            return;
        };
        if let Err(e) = agent.stop_capture().await {
            warn!(error = %e, "failed to stop border router capture");
        }
        if let Some(dir) = save_into {
            let dest = dir.join(format!(
                "otbr_iteration_{}.pcap",
                self.ctx.iteration_number()
            ));
            if let Err(e) = agent.save_capture(&dest).await {
                warn!(error = %e, "failed to save border router capture");
            }
        }
    }

    fn notify(&mut self) -> Result<(), RunError> {
        self.observable.notify(&self.record).map_err(RunError::from)
    }

    fn publish_report(&self, summary_path: &Path) {
        let document = match analysis::load_document(summary_path) {
            Ok(doc) => doc,
            Err(_) => match self.record.to_document() {
                Ok(doc) => doc,
                Err(e) => {
                    warn!(error = %e, "cannot build report document");
                    return;
                }
            },
        };
        let report = match build_chart_report(&document, &self.settings.run_set_folder) {
            Ok(path) => Some(path),
            Err(e) => {
                warn!(error = %e, "analytics chart report not generated");
                None
            }
        };

        let Some(ci_path) = &self.settings.ci_results_path else {
            return;
        };
        let mut files: Vec<&Path> = Vec::new();
        if summary_path.exists() {
            files.push(summary_path);
        }
        if let Some(report) = &report {
            files.push(report);
        }
        if let Err(e) = artifacts::publish_to_ci_workspace(
            ci_path,
            &self.settings.test_case.test_case_class,
            &files,
        ) {
            warn!(error = %e, "failed to publish results to CI workspace");
        }
    }

    // -----------------------------------------------------------------------
    // Abnormal endings
    // -----------------------------------------------------------------------

    /// Record the interrupted iteration, if any, then finalize as aborted.
    async fn cancelled(&mut self) -> RunError {
        warn!(iteration = self.current_iteration, "cancellation requested, aborting run");
        if self.in_flight {
            self.ctx
                .record_failure(&TestError::Iteration("interrupted by operator".into()));
            let dir = self.ctx.iteration_dir().to_path_buf();
            self.stop_captures(Some(&dir)).await;
            if let Err(e) = self.record_iteration() {
                error!(error = %e, "failed to record interrupted iteration");
            }
        }
        self.abort(RunError::Cancelled).await
    }

    /// Best-effort aborted finalize; `reason` is what the caller sees.
    async fn abort(&mut self, reason: RunError) -> RunError {
        self.in_flight = false;
        if let Err(e) = self.finalize(true).await {
            error!(error = %e, "failed to write aborted run record");
        }
        reason
    }
}
