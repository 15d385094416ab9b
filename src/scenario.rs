//! Shell-command test scenario.
//!
//! Each iteration optionally factory resets and commissions the DUT, runs
//! the configured test command, and on success samples the analytics
//! fields. A non-zero exit fails the iteration; the run carries on.

use std::time::Duration;

use tokio::process::Command;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::TestCaseConfig;
use crate::dut::DutController;
use crate::engine::commission::{self, AttemptError, Completion, RetryPolicy};
use crate::engine::{IterationBody, IterationContext, TestError};
use crate::record::IterationResult;

const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(600);

pub struct CommandScenario {
    command: Option<String>,
    commission_command: Option<String>,
    commission_check_command: Option<String>,
    commission_timeout: Duration,
    retry_policy: RetryPolicy,
    factory_reset_every_iteration: bool,
    timeout: Duration,
}

impl CommandScenario {
    pub fn new(test_case: &TestCaseConfig) -> Self {
        Self {
            command: test_case.command.clone(),
            commission_command: test_case.commission_command.clone(),
            commission_check_command: test_case.commission_check_command.clone(),
            commission_timeout: Duration::from_secs(test_case.commission_attempt_timeout_secs),
            retry_policy: RetryPolicy::default(),
            factory_reset_every_iteration: test_case.do_factory_reset_every_iteration,
            timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_commission_timeout(mut self, timeout: Duration) -> Self {
        self.commission_timeout = timeout;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Run the commissioning command, falling back to polling the check
    /// command when the attempt times out.
    async fn commission(&self, ctx: &IterationContext) -> Result<Option<u64>, TestError> {
        let Some(template) = &self.commission_command else {
            return Ok(None);
        };
        let command_line = render(template, ctx);
        let attempt_timeout = self.commission_timeout;
        let dir = existing_dir(ctx);

        let attempt = async {
            match tokio::time::timeout(attempt_timeout, shell(&command_line, &dir).output()).await {
                Err(_) => Err(AttemptError::Timeout(format!(
                    "commissioning command timed out after {attempt_timeout:?}"
                ))),
                Ok(Err(e)) => Err(AttemptError::Failed(format!(
                    "commissioning command could not be spawned: {e}"
                ))),
                Ok(Ok(output)) if output.status.success() => parse_node_id(&output.stdout)
                    .ok_or_else(|| {
                        AttemptError::Failed("commissioning command printed no node id".into())
                    }),
                Ok(Ok(output)) => Err(AttemptError::Failed(format!(
                    "commissioning command exited with {}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ))),
            }
        };

        let (tx, rx) = watch::channel::<Completion>(None);
        let mut policy = self.retry_policy;
        let poller = match &self.commission_check_command {
            Some(check) => {
                let check = render(check, ctx);
                let interval = policy.retry_interval;
                Some(tokio::spawn(poll_completion(check, dir.clone(), interval, tx)))
            }
            None => {
                policy.overall_timeout = Duration::ZERO;
                None
            }
        };

        let outcome = commission::commission_with_retry(attempt, rx, policy).await;
        if let Some(poller) = poller {
            poller.abort();
        }
        let node_id = outcome?;
        info!(node_id, "DUT commissioned");
        Ok(Some(node_id))
    }

    async fn run_command(&self, ctx: &IterationContext) -> Result<(), TestError> {
        let Some(template) = &self.command else {
            debug!("no test command configured");
            return Ok(());
        };
        let command_line = render(template, ctx);

        let output = tokio::time::timeout(
            self.timeout,
            shell(&command_line, &existing_dir(ctx)).output(),
        )
        .await
        .map_err(|_| TestError::Iteration(format!("test command timed out after {:?}", self.timeout)))?
        .map_err(|e| TestError::Iteration(format!("test command could not be spawned: {e}")))?;

        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        warn!(status = %output.status, "test command failed");
        Err(TestError::Iteration(format!(
            "test command exited with {}: {}",
            output.status,
            stderr.trim()
        )))
    }
}

fn render(template: &str, ctx: &IterationContext) -> String {
    template
        .replace("{iteration}", &ctx.iteration_number().to_string())
        .replace("{dir}", &ctx.iteration_dir().display().to_string())
}

fn shell(command_line: &str, dir: &std::path::Path) -> Command {
    let mut command = Command::new("sh");
    command
        .arg("-c")
        .arg(command_line)
        .current_dir(dir)
        .kill_on_drop(true);
    command
}

/// Last whitespace-separated token of stdout, as a node id.
fn parse_node_id(stdout: &[u8]) -> Option<u64> {
    String::from_utf8_lossy(stdout)
        .split_whitespace()
        .last()
        .and_then(|token| token.parse().ok())
}

async fn poll_completion(
    check: String,
    dir: std::path::PathBuf,
    interval: Duration,
    tx: watch::Sender<Completion>,
) {
    loop {
        match shell(&check, &dir).output().await {
            Ok(output) if output.status.success() => {
                if let Some(node_id) = parse_node_id(&output.stdout) {
                    let _ = tx.send(Some(Ok(node_id)));
                    return;
                }
            }
            Ok(_) => {}
            Err(e) => {
                let _ = tx.send(Some(Err(format!("commissioning check could not be spawned: {e}"))));
                return;
            }
        }
        tokio::time::sleep(interval).await;
    }
}

fn existing_dir(ctx: &IterationContext) -> std::path::PathBuf {
    let dir = ctx.iteration_dir();
    if dir.is_dir() {
        dir.to_path_buf()
    } else {
        std::path::PathBuf::from(".")
    }
}

#[async_trait::async_trait]
impl<D: DutController + ?Sized> IterationBody<D> for CommandScenario {
    async fn run_iteration(
        &mut self,
        ctx: &mut IterationContext,
        dut: &D,
    ) -> Result<(), TestError> {
        if self.factory_reset_every_iteration {
            ctx.step("factory reset DUT");
            dut.factory_reset_dut().await?;
            ctx.pause_between_operations().await;
        }

        if self.commission_command.is_some() {
            ctx.step("commission DUT");
            self.commission(ctx).await?;
            ctx.pause_between_operations().await;
        }

        ctx.step("run test command");
        self.run_command(ctx).await?;

        if let Some(source) = dut.attribute_source() {
            ctx.step("collect analytics");
            ctx.fetch_analytics(source).await;
        }
        ctx.update_iteration_result(IterationResult::Pass);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dut::{CommandDut, DutCommandConfig};
    use std::path::PathBuf;

    fn scenario(command: &str) -> CommandScenario {
        CommandScenario::new(&TestCaseConfig {
            command: Some(command.to_string()),
            ..TestCaseConfig::default()
        })
    }

    fn ctx(dir: PathBuf) -> IterationContext {
        let fields = vec![crate::analysis::AnalyticsField {
            name: "heap".into(),
            endpoint: 0,
            path: "SoftwareDiagnostics.Attributes.CurrentHeapUsed".parse().unwrap(),
        }];
        let mut ctx = IterationContext::new(fields, Duration::ZERO);
        ctx.reset(3, 5, dir);
        ctx
    }

    #[tokio::test]
    async fn test_success_passes_and_samples() {
        let dir = tempfile::tempdir().unwrap();
        let dut = CommandDut::new(DutCommandConfig {
            read_attribute: Some("echo {attribute}: 4096".into()),
            ..DutCommandConfig::default()
        });
        let mut ctx = ctx(dir.path().to_path_buf());
        scenario("test {iteration} -eq 3")
            .run_iteration(&mut ctx, &dut)
            .await
            .unwrap();
        assert_eq!(ctx.result(), IterationResult::Pass);
        assert_eq!(ctx.analytics()["heap"], Some(4096.0));
    }

    fn commissioning(commission: &str, check: Option<&str>) -> CommandScenario {
        CommandScenario::new(&TestCaseConfig {
            command: Some("true".into()),
            commission_command: Some(commission.to_string()),
            commission_check_command: check.map(str::to_string),
            ..TestCaseConfig::default()
        })
        .with_commission_timeout(Duration::from_millis(200))
        .with_retry_policy(RetryPolicy {
            retry_interval: Duration::from_millis(20),
            overall_timeout: Duration::from_secs(5),
        })
    }

    #[tokio::test]
    async fn test_commissioning_reports_node_id() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx(dir.path().to_path_buf());
        let node = commissioning("echo commissioned node 4660", None)
            .commission(&ctx)
            .await
            .unwrap();
        assert_eq!(node, Some(4660));
    }

    #[tokio::test]
    async fn test_commissioning_timeout_recovers_through_check() {
        let dir = tempfile::tempdir().unwrap();
        let dut = CommandDut::new(DutCommandConfig::default());
        let mut ctx = ctx(dir.path().to_path_buf());
        let mut scenario = commissioning("sleep 5", Some("echo 17"));
        scenario.run_iteration(&mut ctx, &dut).await.unwrap();
        assert_eq!(ctx.result(), IterationResult::Pass);
    }

    #[tokio::test]
    async fn test_commissioning_timeout_without_check_fails() {
        let dir = tempfile::tempdir().unwrap();
        let dut = CommandDut::new(DutCommandConfig::default());
        let mut ctx = ctx(dir.path().to_path_buf());
        let err = commissioning("sleep 5", None)
            .run_iteration(&mut ctx, &dut)
            .await
            .unwrap_err();
        assert!(matches!(err, TestError::Commissioning(_)));
        assert_eq!(ctx.result(), IterationResult::Fail);
    }

    #[test]
    fn test_node_id_is_last_token() {
        assert_eq!(parse_node_id(b"paired\nnode 12\n"), Some(12));
        assert_eq!(parse_node_id(b"no id here"), None);
    }

    #[tokio::test]
    async fn test_failure_is_recoverable() {
        let dir = tempfile::tempdir().unwrap();
        let dut = CommandDut::new(DutCommandConfig::default());
        let mut ctx = ctx(dir.path().to_path_buf());
        let err = scenario("echo broken >&2; exit 3")
            .run_iteration(&mut ctx, &dut)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("broken"));
        assert_eq!(err.class(), crate::engine::ErrorClass::Recoverable);
        assert_eq!(ctx.result(), IterationResult::Fail);
    }
}
