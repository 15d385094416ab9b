//! Run lifecycle against an in-process DUT.

use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use matter_stress::analysis::AnalyticsField;
use matter_stress::dut::DutController;
use matter_stress::engine::{
    IterationBody, IterationContext, RunError, RunSettings, StressRunner, TestError,
};
use matter_stress::observer::{FileSink, ResultObservable, ResultObserver, SinkError};
use matter_stress::record::{IterationResult, RunRecord, RunResult, RunStatus};
use tokio_util::sync::CancellationToken;

#[derive(Clone, Default)]
struct FakeDut {
    calls: Arc<Mutex<Vec<&'static str>>>,
    fail_post_hook_on_call: Option<u32>,
    post_calls: Arc<AtomicU32>,
}

impl FakeDut {
    fn log(&self, call: &'static str) {
        self.calls.lock().unwrap().push(call);
    }

    fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl DutController for FakeDut {
    async fn start_test(&self) -> Result<(), TestError> {
        self.log("start_test");
        Ok(())
    }
    async fn factory_reset_dut(&self) -> Result<(), TestError> {
        self.log("factory_reset");
        Ok(())
    }
    async fn reboot_dut(&self) -> Result<(), TestError> {
        self.log("reboot");
        Ok(())
    }
    async fn pre_iteration_loop(&self) -> Result<(), TestError> {
        self.log("pre_iteration");
        Ok(())
    }
    async fn post_iteration_loop(&self) -> Result<(), TestError> {
        self.log("post_iteration");
        let call = self.post_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_post_hook_on_call == Some(call) {
            return Err(TestError::DutInteraction("log collection failed".into()));
        }
        Ok(())
    }
    async fn stop_logging(&self) -> Result<(), TestError> {
        self.log("stop_logging");
        Ok(())
    }
    async fn end_test(&self) -> Result<(), TestError> {
        self.log("end_test");
        Ok(())
    }
}

/// Per-iteration behavior chosen by iteration number.
struct Scripted<F>(F);

#[async_trait::async_trait]
impl<F> IterationBody<FakeDut> for Scripted<F>
where
    F: FnMut(&mut IterationContext) -> Result<(), TestError> + Send,
{
    async fn run_iteration(
        &mut self,
        ctx: &mut IterationContext,
        _dut: &FakeDut,
    ) -> Result<(), TestError> {
        (self.0)(ctx)
    }
}

fn pass(ctx: &mut IterationContext) -> Result<(), TestError> {
    ctx.update_iteration_result(IterationResult::Pass);
    Ok(())
}

/// Keeps every snapshot it is sent.
#[derive(Clone, Default)]
struct Snapshots(Arc<Mutex<Vec<RunRecord>>>);

impl ResultObserver for Snapshots {
    fn name(&self) -> &str {
        "snapshots"
    }

    fn dispatch(&mut self, record: RunRecord) -> Result<(), SinkError> {
        self.0.lock().unwrap().push(record);
        Ok(())
    }
}

fn runner(dir: &Path, total: u32, dut: FakeDut) -> (StressRunner<FakeDut>, Snapshots) {
    runner_with(RunSettings::new(dir.join("TC_Stress"), total), dut)
}

fn runner_with(settings: RunSettings, dut: FakeDut) -> (StressRunner<FakeDut>, Snapshots) {
    let snapshots = Snapshots::default();
    let mut observable = ResultObservable::new();
    observable.subscribe(Box::new(FileSink::new(settings.summary_path())));
    observable.subscribe(Box::new(snapshots.clone()));
    (StressRunner::new(settings, dut, observable), snapshots)
}

fn persisted(runner: &StressRunner<FakeDut>) -> RunRecord {
    FileSink::new(runner.summary_path()).load().unwrap().unwrap()
}

#[tokio::test]
async fn test_snapshots_grow_monotonically() {
    let dir = tempfile::tempdir().unwrap();
    let (mut runner, snapshots) = runner(dir.path(), 3, FakeDut::default());
    runner.run(&mut Scripted(pass)).await.unwrap();

    let snapshots = snapshots.0.lock().unwrap();
    // Initial, one per iteration, final.
    assert_eq!(snapshots.len(), 5);
    let completed: Vec<u32> = snapshots
        .iter()
        .map(|r| r.test_summary_record.number_of_iterations_completed)
        .collect();
    assert_eq!(completed, vec![0, 1, 2, 3, 3]);
    assert!(snapshots
        .iter()
        .all(|r| r.run_set_id == snapshots[0].run_set_id));
    assert_eq!(snapshots[0].test_summary_record.test_case_status, RunStatus::InProgress);
    assert_eq!(snapshots[4].test_summary_record.test_case_status, RunStatus::Completed);
    assert_eq!(snapshots[4].test_summary_record.test_case_result, RunResult::Pass);
}

#[tokio::test]
async fn test_hooks_run_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let dut = FakeDut::default();
    let (mut runner, _) = runner(dir.path(), 2, dut.clone());
    runner.run(&mut Scripted(pass)).await.unwrap();
    assert_eq!(
        dut.calls(),
        vec![
            "start_test",
            "pre_iteration",
            "post_iteration",
            "stop_logging",
            "pre_iteration",
            "post_iteration",
            "stop_logging",
            "end_test",
        ]
    );
}

#[tokio::test]
async fn test_iteration_without_verdict_fails() {
    let dir = tempfile::tempdir().unwrap();
    let (mut runner, _) = runner(dir.path(), 2, FakeDut::default());
    let summary = runner
        .run(&mut Scripted(|_: &mut IterationContext| -> Result<(), TestError> { Ok(()) }))
        .await
        .unwrap();
    assert_eq!(summary.number_of_iterations_failed, 2);
    assert_eq!(summary.list_of_iterations_failed, vec![1, 2]);
    assert_eq!(summary.test_case_result, RunResult::Fail);
}

#[tokio::test]
async fn test_recoverable_error_continues() {
    let dir = tempfile::tempdir().unwrap();
    let (mut runner, _) = runner(dir.path(), 4, FakeDut::default());
    let summary = runner
        .run(&mut Scripted(|ctx: &mut IterationContext| {
            if ctx.iteration_number() == 2 {
                return Err(TestError::Commissioning("CASE session timeout".into()));
            }
            pass(ctx)
        }))
        .await
        .unwrap();

    assert_eq!(summary.number_of_iterations_completed, 4);
    assert_eq!(summary.list_of_iterations_failed, vec![2]);

    let record = persisted(&runner);
    let second = &record.list_of_iteration_records[1];
    assert_eq!(second.iteration_number, 2);
    let exception = second
        .iteration_data
        .iteration_tc_execution_data
        .exception
        .as_deref()
        .unwrap();
    assert!(exception.contains("CASE session timeout"));
}

#[tokio::test]
async fn test_exit_records_partial_run() {
    let dir = tempfile::tempdir().unwrap();
    let (mut runner, _) = runner(dir.path(), 5, FakeDut::default());
    let summary = runner
        .run(&mut Scripted(|ctx: &mut IterationContext| {
            if ctx.iteration_number() == 3 {
                return Err(TestError::Exit("unpair failed".into()));
            }
            pass(ctx)
        }))
        .await
        .unwrap();

    assert_eq!(summary.number_of_iterations_completed, 3);
    assert_eq!(summary.total_number_of_iterations, 5);
    assert_eq!(summary.list_of_iterations_failed, vec![3]);
    assert_eq!(summary.test_case_status, RunStatus::Completed);
    assert_eq!(runner.current_iteration(), 5);
    assert_eq!(persisted(&runner).list_of_iteration_records.len(), 3);
}

#[tokio::test]
async fn test_fatal_error_aborts_run() {
    let dir = tempfile::tempdir().unwrap();
    let dut = FakeDut::default();
    let (mut runner, _) = runner(dir.path(), 5, dut.clone());
    let err = runner
        .run(&mut Scripted(|ctx: &mut IterationContext| {
            if ctx.iteration_number() == 2 {
                return Err(TestError::from(anyhow::anyhow!("controller crashed")));
            }
            pass(ctx)
        }))
        .await
        .unwrap_err();

    assert!(matches!(err, RunError::Aborted(_)));
    let record = persisted(&runner);
    assert_eq!(record.test_summary_record.test_case_status, RunStatus::Aborted);
    assert_eq!(record.test_summary_record.number_of_iterations_completed, 1);
    assert!(record.test_summary_record.test_case_ended_at.is_some());
    assert!(dut.calls().ends_with(&["stop_logging", "end_test"]));
}

#[tokio::test]
async fn test_post_hook_failure_fails_iteration() {
    let dir = tempfile::tempdir().unwrap();
    let dut = FakeDut {
        fail_post_hook_on_call: Some(2),
        ..FakeDut::default()
    };
    let (mut runner, _) = runner(dir.path(), 3, dut);
    let summary = runner.run(&mut Scripted(pass)).await.unwrap();
    assert_eq!(summary.number_of_iterations_completed, 3);
    assert_eq!(summary.list_of_iterations_failed, vec![2]);
}

#[tokio::test]
async fn test_threshold_is_inclusive() {
    for (failures, expected) in [(1, RunResult::Pass), (2, RunResult::Fail)] {
        let dir = tempfile::tempdir().unwrap();
        let (mut runner, _) = runner(dir.path(), 20, FakeDut::default());
        let summary = runner
            .run(&mut Scripted(move |ctx: &mut IterationContext| {
                if ctx.iteration_number() <= failures {
                    return Ok(());
                }
                pass(ctx)
            }))
            .await
            .unwrap();
        assert_eq!(summary.test_case_result, expected, "{failures} failures of 20");
    }
}

#[tokio::test]
async fn test_means_exclude_failed_iterations() {
    let dir = tempfile::tempdir().unwrap();
    let mut settings = RunSettings::new(dir.path().join("TC_Stress"), 4);
    settings.analytics_fields.push(AnalyticsField {
        name: "pase_duration".into(),
        endpoint: 0,
        path: "GeneralDiagnostics.Attributes.UpTime".parse().unwrap(),
    });
    let (mut runner, _) = runner_with(settings, FakeDut::default());
    let summary = runner
        .run(&mut Scripted(|ctx: &mut IterationContext| {
            let n = ctx.iteration_number();
            ctx.record_analytic("pase_duration", Some(n as f64 * 10.0));
            if n == 4 {
                return Err(TestError::Assertion("OnOff mismatch".into()));
            }
            pass(ctx)
        }))
        .await
        .unwrap();
    assert_eq!(summary.mean_of_analytics["pase_duration"], 20.0);
    assert!(summary.mean_of_analytics.contains_key("iteration_duration"));
}

#[tokio::test]
async fn test_resume_continues_after_last_iteration() {
    let dir = tempfile::tempdir().unwrap();
    let (mut first, _) = runner(dir.path(), 5, FakeDut::default());
    first
        .run(&mut Scripted(|ctx: &mut IterationContext| {
            if ctx.iteration_number() == 2 {
                return Err(TestError::Exit("operator stop".into()));
            }
            pass(ctx)
        }))
        .await
        .unwrap();
    let summary_path = first.summary_path();
    let run_set_id = first.record().run_set_id.clone();

    let (second, _) = runner(dir.path(), 5, FakeDut::default());
    let mut second = second.resume_from(&summary_path).unwrap();
    assert_eq!(second.current_iteration(), 2);
    let summary = second.run(&mut Scripted(pass)).await.unwrap();

    assert_eq!(summary.number_of_iterations_completed, 5);
    assert_eq!(summary.list_of_iterations_failed, vec![2]);
    let record = persisted(&second);
    assert_eq!(record.run_set_id, run_set_id);
    let numbers: Vec<u32> = record
        .list_of_iteration_records
        .iter()
        .map(|r| r.iteration_number)
        .collect();
    assert_eq!(numbers, vec![1, 2, 3, 4, 5]);
}

#[tokio::test]
async fn test_cancellation_records_interrupted_iteration() {
    let dir = tempfile::tempdir().unwrap();
    let token = CancellationToken::new();
    let (runner, _) = runner(dir.path(), 5, FakeDut::default());
    let mut runner = runner.with_cancellation(token.clone());

    struct Hangs(CancellationToken);

    #[async_trait::async_trait]
    impl IterationBody<FakeDut> for Hangs {
        async fn run_iteration(
            &mut self,
            ctx: &mut IterationContext,
            _dut: &FakeDut,
        ) -> Result<(), TestError> {
            if ctx.iteration_number() == 2 {
                self.0.cancel();
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
            ctx.update_iteration_result(IterationResult::Pass);
            Ok(())
        }
    }

    let err = runner.run(&mut Hangs(token)).await.unwrap_err();
    assert!(matches!(err, RunError::Cancelled));

    let record = persisted(&runner);
    let summary = &record.test_summary_record;
    assert_eq!(summary.test_case_status, RunStatus::Aborted);
    assert_eq!(summary.number_of_iterations_completed, 2);
    assert_eq!(summary.list_of_iterations_failed, vec![2]);
    let exception = record.list_of_iteration_records[1]
        .iteration_data
        .iteration_tc_execution_data
        .exception
        .as_deref()
        .unwrap();
    assert!(exception.contains("interrupted"));
}
