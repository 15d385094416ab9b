//! Device-under-test seam.
//!
//! The engine drives a DUT only through [`DutController`]; how a platform
//! talks to its device (ssh, serial, a local process) stays behind it.

pub mod command;

pub use command::{CommandDut, DutCommandConfig};

use crate::analysis::AttributeSource;
use crate::engine::TestError;

/// Lifecycle hooks the engine calls at fixed points of a run.
///
/// Errors are classified at the iteration boundary like any body error:
/// recoverable variants fail the iteration, [`TestError::Exit`] stops the
/// run, anything fatal aborts it.
#[async_trait::async_trait]
pub trait DutController: Send + Sync {
    async fn start_test(&self) -> Result<(), TestError>;

    async fn factory_reset_dut(&self) -> Result<(), TestError>;

    async fn reboot_dut(&self) -> Result<(), TestError>;

    async fn pre_iteration_loop(&self) -> Result<(), TestError> {
        Ok(())
    }

    async fn post_iteration_loop(&self) -> Result<(), TestError> {
        Ok(())
    }

    /// Begin collecting device logs into `file_name`.
    async fn start_logging(&self, _file_name: &str) -> Result<(), TestError> {
        Ok(())
    }

    async fn stop_logging(&self) -> Result<(), TestError> {
        Ok(())
    }

    async fn end_test(&self) -> Result<(), TestError>;

    /// Where analytics are read from, if this DUT can serve attribute reads.
    fn attribute_source(&self) -> Option<&dyn AttributeSource> {
        None
    }
}
