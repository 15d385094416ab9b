//! Shell-command DUT adapter.
//!
//! Every lifecycle hook maps to an optional command line run through the
//! configured shell. An unset hook is a no-op. Placeholders like `{name}`
//! are substituted before the command runs.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::DutController;
use crate::analysis::{AttributePath, AttributeSource};
use crate::engine::TestError;
use crate::record::DutInformation;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DutCommandConfig {
    pub shell: String,
    /// Upper bound for any single hook command, in seconds.
    pub command_timeout: f64,
    /// Settle time after a factory reset, in seconds.
    pub delay_after_factory_reset: f64,

    pub start_test: Option<String>,
    pub factory_reset: Option<String>,
    pub reboot: Option<String>,
    pub pre_iteration: Option<String>,
    pub post_iteration: Option<String>,
    /// `{name}` is replaced by the log file name.
    pub start_logging: Option<String>,
    pub stop_logging: Option<String>,
    pub end_test: Option<String>,
    /// `{cluster}`, `{attribute}` and `{endpoint}` are substituted; the last
    /// numeric token of stdout is the value.
    pub read_attribute: Option<String>,

    /// Static device information reported with the run.
    pub dut_information: Option<DutInformation>,
}

impl Default for DutCommandConfig {
    fn default() -> Self {
        Self {
            shell: "sh".into(),
            command_timeout: 120.0,
            delay_after_factory_reset: 5.0,
            start_test: None,
            factory_reset: None,
            reboot: None,
            pre_iteration: None,
            post_iteration: None,
            start_logging: None,
            stop_logging: None,
            end_test: None,
            read_attribute: None,
            dut_information: None,
        }
    }
}

pub struct CommandDut {
    config: DutCommandConfig,
}

impl CommandDut {
    pub fn new(config: DutCommandConfig) -> Self {
        Self { config }
    }

    /// Run `template` for `hook`, returning its stdout. Unset hooks yield an
    /// empty string.
    async fn run_hook(
        &self,
        hook: &'static str,
        template: Option<&String>,
        vars: &[(&str, &str)],
    ) -> Result<String, TestError> {
        let Some(template) = template else {
            debug!(hook, "no command configured, skipping");
            return Ok(String::new());
        };
        let command_line = render(template, vars);
        debug!(hook, command = %command_line, "running DUT hook");

        let timeout = Duration::try_from_secs_f64(self.config.command_timeout)
            .unwrap_or(Duration::from_secs(120));
        let output = tokio::time::timeout(
            timeout,
            Command::new(&self.config.shell)
                .arg("-c")
                .arg(&command_line)
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| {
            TestError::DutInteraction(format!("{hook} timed out after {timeout:?}"))
        })?
        .map_err(|e| TestError::DutInteraction(format!("{hook} could not be spawned: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(TestError::DutInteraction(format!(
                "{hook} exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait::async_trait]
impl DutController for CommandDut {
    async fn start_test(&self) -> Result<(), TestError> {
        self.run_hook("start_test", self.config.start_test.as_ref(), &[])
            .await
            .map(drop)
    }

    async fn factory_reset_dut(&self) -> Result<(), TestError> {
        if self.config.factory_reset.is_none() {
            return Ok(());
        }
        info!("factory resetting DUT");
        self.run_hook("factory_reset", self.config.factory_reset.as_ref(), &[])
            .await?;
        let settle = Duration::try_from_secs_f64(self.config.delay_after_factory_reset)
            .unwrap_or_default();
        tokio::time::sleep(settle).await;
        Ok(())
    }

    async fn reboot_dut(&self) -> Result<(), TestError> {
        self.run_hook("reboot", self.config.reboot.as_ref(), &[])
            .await
            .map(drop)
    }

    async fn pre_iteration_loop(&self) -> Result<(), TestError> {
        self.run_hook("pre_iteration", self.config.pre_iteration.as_ref(), &[])
            .await
            .map(drop)
    }

    async fn post_iteration_loop(&self) -> Result<(), TestError> {
        self.run_hook("post_iteration", self.config.post_iteration.as_ref(), &[])
            .await
            .map(drop)
    }

    async fn start_logging(&self, file_name: &str) -> Result<(), TestError> {
        self.run_hook(
            "start_logging",
            self.config.start_logging.as_ref(),
            &[("name", file_name)],
        )
        .await
        .map(drop)
    }

    async fn stop_logging(&self) -> Result<(), TestError> {
        self.run_hook("stop_logging", self.config.stop_logging.as_ref(), &[])
            .await
            .map(drop)
    }

    async fn end_test(&self) -> Result<(), TestError> {
        self.run_hook("end_test", self.config.end_test.as_ref(), &[])
            .await
            .map(drop)
    }

    fn attribute_source(&self) -> Option<&dyn AttributeSource> {
        Some(self)
    }
}

#[async_trait::async_trait]
impl AttributeSource for CommandDut {
    async fn read_attribute(
        &self,
        endpoint: u16,
        path: &AttributePath,
    ) -> anyhow::Result<Option<f64>> {
        if self.config.read_attribute.is_none() {
            return Ok(None);
        }
        let endpoint = endpoint.to_string();
        let stdout = self
            .run_hook(
                "read_attribute",
                self.config.read_attribute.as_ref(),
                &[
                    ("cluster", path.cluster()),
                    ("attribute", path.attribute()),
                    ("endpoint", endpoint.as_str()),
                ],
            )
            .await?;
        let value = last_number(&stdout);
        if value.is_none() {
            warn!(%path, "attribute read produced no numeric value");
        }
        Ok(value)
    }

    async fn read_dut_information(&self) -> anyhow::Result<Option<DutInformation>> {
        Ok(self.config.dut_information.clone())
    }
}

fn render(template: &str, vars: &[(&str, &str)]) -> String {
    vars.iter().fold(template.to_string(), |acc, (key, value)| {
        acc.replace(&format!("{{{key}}}"), value)
    })
}

fn last_number(output: &str) -> Option<f64> {
    output
        .split(|c: char| c.is_whitespace() || c == ',' || c == '=' || c == ':')
        .rev()
        .find_map(|token| token.parse::<f64>().ok())
}
