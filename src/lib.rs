//! matter-stress -- stress and reliability test harness for Matter devices.
//!
//! A test case runs a fixed number of iterations against a device under test.
//! Every iteration is torn down and recorded even when it fails, the run
//! record is pushed to the configured result sinks after each iteration, and
//! the finished run gets a pass/fail verdict, per-field analytics means and a
//! chart report.

pub mod analysis;
pub mod capture;
pub mod config;
pub mod dut;
pub mod engine;
pub mod logging;
pub mod observer;
pub mod record;
pub mod scenario;
pub mod storage;

use std::path::Path;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::capture::CommandCaptureAgent;
use crate::config::StressConfig;
use crate::dut::CommandDut;
use crate::engine::{RunSettings, StressRunner};
use crate::logging::IterationLogRouter;
use crate::observer::{DatabaseSink, FileSink, ResultObservable};
use crate::record::RunSummary;
use crate::scenario::CommandScenario;

/// Run the configured test case to completion.
///
/// With `resume`, the run persisted in that `summary.json` is continued
/// instead of starting a new one.
pub async fn run_stress_test(
    config: &StressConfig,
    resume: Option<&Path>,
    cancel: CancellationToken,
    log_router: IterationLogRouter,
) -> Result<RunSummary> {
    let mut settings = RunSettings::from_config(config);
    if let Some(folder) = resume.and_then(Path::parent) {
        settings.run_set_folder = folder.to_path_buf();
    }

    let mut observable = ResultObservable::new();
    observable.subscribe(Box::new(FileSink::new(settings.summary_path())));

    let database = &config.general.database;
    if database.enable_database_storage {
        match DatabaseSink::open(&database.path) {
            Ok(sink) => observable.subscribe(Box::new(sink)),
            Err(e) if database.continue_on_server_connection_fail => {
                warn!(path = %database.path.display(), error = %e, "database unavailable, continuing with file results only");
            }
            Err(e) => return Err(e.context("failed to open results database")),
        }
    }

    let dut = CommandDut::new(config.dut.clone());
    let mut runner = StressRunner::new(settings, dut, observable)
        .with_cancellation(cancel)
        .with_log_router(log_router)
        .with_host_information(record::info::discover_host())
        .with_ci_information(config.ci.info.clone());
    if config.otbr.capture_tcpdump_on_otbr {
        runner = runner.with_border_router(Box::new(CommandCaptureAgent::new(config.otbr.clone())));
    }
    if let Some(summary_path) = resume {
        runner = runner.resume_from(summary_path)?;
    }

    info!(
        test_case = %config.test_case.test_case_name,
        platform = %config.general.platform_execution,
        "running stress test"
    );
    let mut scenario = CommandScenario::new(&config.test_case);
    Ok(runner.run(&mut scenario).await?)
}
