//! Run configuration -- TOML or JSON file, inline JSON override, and
//! per-test-case overrides, resolved against a fixed defaults table.
//!
//! Loading happens in two stages. The raw document is assembled first
//! (file, then `--override`, then `test_case_config.<Class>` folded into
//! `general_configs`), deserialized into a [`PartialConfig`] where every knob
//! is optional, and then [`resolve`]d into a fully populated
//! [`StressConfig`]. `resolve` is pure, so it can be tested without files.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::info;

use crate::analysis::fields::{AnalyticsField, PathError};
use crate::dut::DutCommandConfig;
use crate::record::CiInformation;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {message}")]
    Parse { path: String, message: String },

    #[error("invalid config override: {0}")]
    Override(#[source] serde_json::Error),

    #[error("config does not match the expected shape: {0}")]
    Shape(#[source] serde_json::Error),

    #[error("invalid value for `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("analytics parameter `{name}`: {source}")]
    AnalyticsPath {
        name: String,
        #[source]
        source: PathError,
    },

    #[error("no dut_config section for platform `{0}`")]
    UnknownPlatform(String),
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

pub const DEFAULT_PLATFORM: &str = "local";
pub const DEFAULT_NUMBER_OF_ITERATIONS: u32 = 10;
pub const DEFAULT_PASS_PERCENTAGE_THRESHOLD: f64 = 95.0;
pub const DEFAULT_SLEEP_MIN_SECS: f64 = 1.0;
pub const DEFAULT_SLEEP_MAX_SECS: f64 = 5.0;
pub const DEFAULT_DELAY_BETWEEN_OPERATIONS_SECS: f64 = 5.0;
pub const DEFAULT_DATABASE_PATH: &str = "stress_results.db";
pub const DEFAULT_TCPDUMP_INTERFACE: &str = "any";
pub const DEFAULT_VAR_LOG_DIR: &str = "/var/log";

// ---------------------------------------------------------------------------
// Resolved config
// ---------------------------------------------------------------------------

/// Fully resolved configuration for one run.
#[derive(Debug, Clone, Serialize)]
pub struct StressConfig {
    pub general: GeneralConfig,
    pub dut: DutCommandConfig,
    pub otbr: OtbrConfig,
    pub ci: CiConfig,
    pub test_case: TestCaseConfig,
}

#[derive(Debug, Clone, Serialize)]
pub struct GeneralConfig {
    pub platform_execution: String,
    pub number_of_iterations: u32,
    pub pass_percentage_threshold: f64,
    pub sleep_duration_between_iterations: InterIterationDelay,
    pub delay_between_stress_test_operations: Duration,
    pub analytics_parameters: Vec<AnalyticsField>,
    pub output_dir: PathBuf,
    pub use_test_event_trigger_factory_reset: bool,
    pub logging: LoggingConfig,
    pub database: DatabaseConfig,
}

/// Pause between iterations, applied only after a normal body return.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum InterIterationDelay {
    Fixed(Duration),
    Random { min: Duration, max: Duration },
}

impl InterIterationDelay {
    pub fn sample(&self) -> Duration {
        match *self {
            InterIterationDelay::Fixed(d) => d,
            InterIterationDelay::Random { min, max } if max > min => {
                rand::thread_rng().gen_range(min..=max)
            }
            InterIterationDelay::Random { min, .. } => min,
        }
    }
}

impl Default for InterIterationDelay {
    fn default() -> Self {
        InterIterationDelay::Random {
            min: Duration::from_secs_f64(DEFAULT_SLEEP_MIN_SECS),
            max: Duration::from_secs_f64(DEFAULT_SLEEP_MAX_SECS),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default tracing filter when `RUST_LOG` is unset.
    pub level: String,
    /// Emit console logs as JSON lines.
    pub json: bool,
    pub capture_tcpdump_on_controller: bool,
    pub tcpdump_interface: String,
    pub copy_var_log: bool,
    pub var_log_dir: PathBuf,
    pub var_log_filenames: Vec<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            json: false,
            capture_tcpdump_on_controller: true,
            tcpdump_interface: DEFAULT_TCPDUMP_INTERFACE.into(),
            copy_var_log: false,
            var_log_dir: PathBuf::from(DEFAULT_VAR_LOG_DIR),
            var_log_filenames: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub enable_database_storage: bool,
    pub path: PathBuf,
    /// Run without the database sink when it cannot be opened.
    pub continue_on_server_connection_fail: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            enable_database_storage: false,
            path: PathBuf::from(DEFAULT_DATABASE_PATH),
            continue_on_server_connection_fail: false,
        }
    }
}

/// Border router capture. Commands run on the controller host, typically
/// wrapping ssh.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OtbrConfig {
    pub capture_tcpdump_on_otbr: bool,
    pub start_capture: Option<String>,
    pub stop_capture: Option<String>,
    /// Receives the destination path through a `{path}` placeholder.
    pub save_capture: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CiConfig {
    /// Where the report and summary are copied at the end of the run.
    pub ci_test_results_path_in_ws: Option<PathBuf>,
    #[serde(flatten)]
    pub info: CiInformation,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TestCaseConfig {
    pub test_suite_name: String,
    pub test_case_name: String,
    pub test_case_id: String,
    pub test_case_class: String,
    pub test_case_description: Option<String>,
    pub commissioning_method: String,
    /// Shell command run as the iteration body by the CLI.
    pub command: Option<String>,
    /// Commissions the DUT before the test command; prints the node id.
    pub commission_command: Option<String>,
    /// Polled after a commissioning timeout; exits 0 and prints the node id
    /// once the DUT reports itself commissioned.
    pub commission_check_command: Option<String>,
    pub commission_attempt_timeout_secs: u64,
    pub do_factory_reset_every_iteration: bool,
    pub perform_initial_factory_reset: bool,
}

impl Default for TestCaseConfig {
    fn default() -> Self {
        Self {
            test_suite_name: "MatterStress".into(),
            test_case_name: "stress".into(),
            test_case_id: "TC-STRESS-1.1".into(),
            test_case_class: "TC_Stress".into(),
            test_case_description: None,
            commissioning_method: "on-network".into(),
            command: None,
            commission_command: None,
            commission_check_command: None,
            commission_attempt_timeout_secs: 60,
            do_factory_reset_every_iteration: false,
            perform_initial_factory_reset: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Partial config (as written by the user)
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct PartialConfig {
    pub general_configs: PartialGeneral,
    pub dut_config: BTreeMap<String, DutCommandConfig>,
    pub otbr_device_config: OtbrConfig,
    pub ci_config: CiConfig,
    pub test_case: TestCaseConfig,
    /// Already folded into `general_configs` by [`load`].
    pub test_case_config: BTreeMap<String, Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct PartialGeneral {
    pub platform_execution: Option<String>,
    pub number_of_iterations: Option<u32>,
    pub pass_percentage_threshold: Option<f64>,
    pub sleep_duration_between_iterations: Option<DelaySetting>,
    pub delay_between_stress_test_operations: Option<f64>,
    pub analytics_parameters: BTreeMap<String, AnalyticsParameter>,
    pub output_dir: Option<PathBuf>,
    pub logging_config: LoggingConfig,
    pub database_config: DatabaseConfig,
    pub test_event_trigger_config: TestEventTriggerConfig,
}

/// Either a fixed number of seconds or a `{ min, max }` range.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum DelaySetting {
    Fixed(f64),
    Random { min: f64, max: f64 },
}

#[derive(Debug, Clone, Deserialize)]
pub struct AnalyticsParameter {
    pub attribute: String,
    #[serde(default)]
    pub end_point: u16,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TestEventTriggerConfig {
    pub use_test_event_trigger_factory_reset: bool,
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

/// Fill every unset knob from the defaults table and validate the result.
pub fn resolve(partial: PartialConfig) -> Result<StressConfig, ConfigError> {
    let g = partial.general_configs;

    let number_of_iterations = g
        .number_of_iterations
        .unwrap_or(DEFAULT_NUMBER_OF_ITERATIONS);
    if number_of_iterations == 0 {
        return Err(ConfigError::Invalid {
            field: "number_of_iterations",
            reason: "must be at least 1".into(),
        });
    }

    let pass_percentage_threshold = g
        .pass_percentage_threshold
        .unwrap_or(DEFAULT_PASS_PERCENTAGE_THRESHOLD);
    if !(0.0..=100.0).contains(&pass_percentage_threshold) {
        return Err(ConfigError::Invalid {
            field: "pass_percentage_threshold",
            reason: format!("{pass_percentage_threshold} is outside 0-100"),
        });
    }

    let sleep = match g.sleep_duration_between_iterations {
        None => InterIterationDelay::default(),
        Some(DelaySetting::Fixed(secs)) => InterIterationDelay::Fixed(seconds(
            "sleep_duration_between_iterations",
            secs,
        )?),
        Some(DelaySetting::Random { min, max }) => {
            let min = seconds("sleep_duration_between_iterations.min", min)?;
            let max = seconds("sleep_duration_between_iterations.max", max)?;
            if max < min {
                return Err(ConfigError::Invalid {
                    field: "sleep_duration_between_iterations",
                    reason: "max is smaller than min".into(),
                });
            }
            InterIterationDelay::Random { min, max }
        }
    };

    let delay_between_stress_test_operations = seconds(
        "delay_between_stress_test_operations",
        g.delay_between_stress_test_operations
            .unwrap_or(DEFAULT_DELAY_BETWEEN_OPERATIONS_SECS),
    )?;

    let analytics_parameters = g
        .analytics_parameters
        .into_iter()
        .map(|(name, param)| {
            let path = param
                .attribute
                .parse()
                .map_err(|source| ConfigError::AnalyticsPath {
                    name: name.clone(),
                    source,
                })?;
            Ok(AnalyticsField {
                name,
                endpoint: param.end_point,
                path,
            })
        })
        .collect::<Result<Vec<_>, ConfigError>>()?;

    let platform_execution = g
        .platform_execution
        .unwrap_or_else(|| DEFAULT_PLATFORM.to_string());
    let mut dut_config = partial.dut_config;
    let dut = match dut_config.remove(&platform_execution) {
        Some(dut) => dut,
        None if platform_execution == DEFAULT_PLATFORM => DutCommandConfig::default(),
        None => return Err(ConfigError::UnknownPlatform(platform_execution)),
    };

    Ok(StressConfig {
        general: GeneralConfig {
            platform_execution,
            number_of_iterations,
            pass_percentage_threshold,
            sleep_duration_between_iterations: sleep,
            delay_between_stress_test_operations,
            analytics_parameters,
            output_dir: g.output_dir.unwrap_or_else(|| PathBuf::from(".")),
            use_test_event_trigger_factory_reset: g
                .test_event_trigger_config
                .use_test_event_trigger_factory_reset,
            logging: g.logging_config,
            database: g.database_config,
        },
        dut,
        otbr: partial.otbr_device_config,
        ci: partial.ci_config,
        test_case: partial.test_case,
    })
}

fn seconds(field: &'static str, secs: f64) -> Result<Duration, ConfigError> {
    Duration::try_from_secs_f64(secs).map_err(|_| ConfigError::Invalid {
        field,
        reason: format!("{secs} is not a valid number of seconds"),
    })
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Load `path`, apply the inline JSON override and the per-class overrides
/// for `test_case_class` (or the class named in the file), and resolve.
pub fn load(
    path: &Path,
    override_json: Option<&str>,
    test_case_class: Option<&str>,
) -> Result<StressConfig, ConfigError> {
    let mut raw = read_raw(path)?;
    if let Some(text) = override_json {
        let patch: Value = serde_json::from_str(text).map_err(ConfigError::Override)?;
        deep_merge(&mut raw, patch);
    }

    if let Some(class) = test_case_class {
        deep_merge(
            &mut raw,
            serde_json::json!({ "test_case": { "test_case_class": class } }),
        );
    }
    let class = raw
        .pointer("/test_case/test_case_class")
        .and_then(Value::as_str)
        .map(str::to_string);
    if let Some(class) = class {
        apply_test_case_overrides(&mut raw, &class);
    }

    let partial: PartialConfig = serde_json::from_value(raw).map_err(ConfigError::Shape)?;
    let config = resolve(partial)?;
    info!(
        path = %path.display(),
        platform = %config.general.platform_execution,
        iterations = config.general.number_of_iterations,
        "loaded stress configuration"
    );
    Ok(config)
}

fn read_raw(path: &Path) -> Result<Value, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    let parse_error = |message: String| ConfigError::Parse {
        path: path.display().to_string(),
        message,
    };

    let raw = if path.extension().is_some_and(|ext| ext == "json") {
        serde_json::from_str(&content).map_err(|e| parse_error(e.to_string()))?
    } else {
        let table: toml::Value = toml::from_str(&content).map_err(|e| parse_error(e.to_string()))?;
        serde_json::to_value(table).map_err(|e| parse_error(e.to_string()))?
    };
    if !raw.is_object() {
        return Err(parse_error("top level must be a table".into()));
    }
    Ok(raw)
}

/// Recursively merge `patch` into `target`; non-object values replace.
pub fn deep_merge(target: &mut Value, patch: Value) {
    match (target, patch) {
        (Value::Object(target), Value::Object(patch)) => {
            for (key, value) in patch {
                match target.get_mut(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        target.insert(key, value);
                    }
                }
            }
        }
        (target, patch) => *target = patch,
    }
}

/// Fold `test_case_config.<class>` over `general_configs`.
fn apply_test_case_overrides(raw: &mut Value, class: &str) {
    let Some(overrides) = raw
        .pointer(&format!("/test_case_config/{class}"))
        .cloned()
    else {
        return;
    };
    info!(test_case_class = class, "applying per-test-case config overrides");
    deep_merge(raw, serde_json::json!({ "general_configs": overrides }));
}
