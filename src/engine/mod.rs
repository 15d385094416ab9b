//! Iteration lifecycle engine.
//!
//! [`StressRunner`] drives an [`IterationBody`] through
//! `pre_iteration -> body -> post_iteration` for each iteration, folds every
//! outcome into the run record, and pushes each snapshot to the result
//! observers. The iteration boundary is the only place errors are
//! classified (see [`TestError::class`]).

pub mod artifacts;
pub mod commission;
pub mod context;
pub mod runner;

pub use context::IterationContext;
pub use runner::{RunSettings, StressRunner};

use thiserror::Error;

use crate::dut::DutController;
use crate::observer::SinkError;

/// Errors raised by test bodies and DUT hooks.
#[derive(Debug, Error)]
pub enum TestError {
    #[error("iteration failed: {0}")]
    Iteration(String),

    #[error("assertion failed: {0}")]
    Assertion(String),

    #[error("DUT interaction failed: {0}")]
    DutInteraction(String),

    #[error("SSH connection failed: {0}")]
    SshConnection(String),

    #[error("serial connection failed: {0}")]
    SerialConnection(String),

    #[error("commissioning failed: {0}")]
    Commissioning(String),

    /// Stop iterating; the current iteration is still torn down and recorded.
    #[error("test run exit requested: {0}")]
    Exit(String),

    /// Anything unclassified. Aborts the run.
    #[error(transparent)]
    Fatal(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Fail this iteration, continue with the next.
    Recoverable,
    /// Stop the loop after recording this iteration.
    Exit,
    /// Abort the run.
    Fatal,
}

impl TestError {
    pub fn class(&self) -> ErrorClass {
        match self {
            TestError::Iteration(_)
            | TestError::Assertion(_)
            | TestError::DutInteraction(_)
            | TestError::SshConnection(_)
            | TestError::SerialConnection(_)
            | TestError::Commissioning(_) => ErrorClass::Recoverable,
            TestError::Exit(_) => ErrorClass::Exit,
            TestError::Fatal(_) => ErrorClass::Fatal,
        }
    }
}

/// Why a run did not finish normally.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("failed to start the test: {0}")]
    Startup(#[source] TestError),

    #[error("run aborted: {0}")]
    Aborted(#[source] TestError),

    #[error("run cancelled by operator")]
    Cancelled,

    #[error("result sink failed: {0}")]
    Sink(#[from] SinkError),

    #[error("run setup failed: {0:#}")]
    Setup(#[from] anyhow::Error),
}

/// The user-supplied work executed once per iteration.
///
/// Record the verdict with [`IterationContext::update_iteration_result`];
/// returning without doing so leaves the iteration failed.
#[async_trait::async_trait]
pub trait IterationBody<D: DutController + ?Sized>: Send {
    async fn run_iteration(
        &mut self,
        ctx: &mut IterationContext,
        dut: &D,
    ) -> Result<(), TestError>;
}
