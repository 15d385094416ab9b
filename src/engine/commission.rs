//! Bounded retry for commissioning attempts that time out.
//!
//! A commissioning attempt that times out on the controller side may still
//! complete on the device. Instead of failing straight away the engine
//! polls the completion signal on a fixed interval until an overall
//! deadline, and only then reports a commissioning failure.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{info, warn};

use super::TestError;

pub const RETRY_INTERVAL: Duration = Duration::from_secs(1);
pub const OVERALL_TIMEOUT: Duration = Duration::from_secs(50);

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub retry_interval: Duration,
    pub overall_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retry_interval: RETRY_INTERVAL,
            overall_timeout: OVERALL_TIMEOUT,
        }
    }
}

/// How a single commissioning attempt ended.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptError {
    /// The controller gave up waiting; the device may still finish.
    Timeout(String),
    Failed(String),
}

/// Completion state of an in-flight commissioning: `None` while pending,
/// then the node id or the failure message.
pub type Completion = Option<Result<u64, String>>;

/// Run `attempt`; on timeout, poll `completion` until it resolves or the
/// policy's deadline passes.
pub async fn commission_with_retry<F>(
    attempt: F,
    mut completion: watch::Receiver<Completion>,
    policy: RetryPolicy,
) -> Result<u64, TestError>
where
    F: Future<Output = Result<u64, AttemptError>>,
{
    let message = match attempt.await {
        Ok(node_id) => return Ok(node_id),
        Err(AttemptError::Failed(msg)) => return Err(TestError::Commissioning(msg)),
        Err(AttemptError::Timeout(msg)) => msg,
    };
    warn!(error = %message, "commissioning timed out, polling for completion");

    let deadline = Instant::now() + policy.overall_timeout;
    loop {
        let state = completion.borrow_and_update().clone();
        match state {
            Some(Ok(node_id)) => {
                info!(node_id, "commissioning completed after timeout");
                return Ok(node_id);
            }
            Some(Err(msg)) => return Err(TestError::Commissioning(msg)),
            None => {}
        }
        if Instant::now() >= deadline {
            return Err(TestError::Commissioning(format!(
                "commissioning did not complete within {:?}: {message}",
                policy.overall_timeout
            )));
        }
        tokio::time::sleep(policy.retry_interval).await;
    }
}
