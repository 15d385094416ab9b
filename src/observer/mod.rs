//! Observer protocol -- fan a run record snapshot out to result sinks.
//!
//! Observers are notified synchronously in registration order. A failing
//! observer stops the fan-out: observers registered after it are not
//! notified for that snapshot, and the error goes back to the caller.

pub mod db;
pub mod file;

pub use db::DatabaseSink;
pub use file::FileSink;

use thiserror::Error;
use tracing::debug;

use crate::record::{RecordError, RunRecord};

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("sink I/O failed for {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Record(#[from] RecordError),

    #[error("document serialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("storage failure: {0:#}")]
    Storage(#[from] anyhow::Error),
}

/// A consumer of run record snapshots.
pub trait ResultObserver: Send {
    /// Short name used in logs and for `unsubscribe`.
    fn name(&self) -> &str;

    /// Persist or otherwise consume one snapshot. Each observer receives its
    /// own copy.
    fn dispatch(&mut self, record: RunRecord) -> Result<(), SinkError>;
}

#[derive(Default)]
pub struct ResultObservable {
    observers: Vec<Box<dyn ResultObserver>>,
}

impl ResultObservable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, observer: Box<dyn ResultObserver>) {
        debug!(observer = observer.name(), "observer subscribed");
        self.observers.push(observer);
    }

    /// Remove every observer called `name`. Returns how many were removed.
    pub fn unsubscribe(&mut self, name: &str) -> usize {
        let before = self.observers.len();
        self.observers.retain(|o| o.name() != name);
        before - self.observers.len()
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }

    /// Dispatch `record` to each observer in order, stopping at the first
    /// failure.
    pub fn notify(&mut self, record: &RunRecord) -> Result<(), SinkError> {
        for observer in &mut self.observers {
            debug!(observer = observer.name(), run_set_id = %record.run_set_id, "dispatching");
            observer.dispatch(record.clone())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{RunResult, RunStatus, RunSummary};
    use std::sync::{Arc, Mutex};

    struct Recorder {
        name: String,
        fail: bool,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl ResultObserver for Recorder {
        fn name(&self) -> &str {
            &self.name
        }

        fn dispatch(&mut self, _record: RunRecord) -> Result<(), SinkError> {
            self.log.lock().unwrap().push(self.name.clone());
            if self.fail {
                return Err(SinkError::Storage(anyhow::anyhow!("disk full")));
            }
            Ok(())
        }
    }

    fn record() -> RunRecord {
        RunRecord::new(
            uuid::Uuid::new_v4().to_string(),
            RunSummary {
                test_suite_name: Some("suite".into()),
                test_case_name: Some("case".into()),
                test_case_id: Some("TC-1".into()),
                test_case_class: None,
                test_case_description: None,
                test_case_info_doc_id: None,
                test_case_began_at: chrono::Utc::now(),
                test_case_ended_at: None,
                test_case_status: RunStatus::InProgress,
                test_case_result: RunResult::InProgress,
                total_number_of_iterations: 1,
                number_of_iterations_completed: 0,
                number_of_iterations_passed: 0,
                number_of_iterations_failed: 0,
                platform: String::new(),
                commissioning_method: String::new(),
                list_of_iterations_failed: vec![],
                analytics_parameters: vec![],
                mean_of_analytics: Default::default(),
            },
        )
    }

    fn recorder(name: &str, fail: bool, log: &Arc<Mutex<Vec<String>>>) -> Box<dyn ResultObserver> {
        Box::new(Recorder {
            name: name.into(),
            fail,
            log: log.clone(),
        })
    }

    #[test]
    fn test_notify_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut observable = ResultObservable::new();
        observable.subscribe(recorder("a", false, &log));
        observable.subscribe(recorder("b", false, &log));
        observable.notify(&record()).unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn test_failing_observer_stops_fan_out() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut observable = ResultObservable::new();
        observable.subscribe(recorder("a", true, &log));
        observable.subscribe(recorder("b", false, &log));
        assert!(observable.notify(&record()).is_err());
        assert_eq!(*log.lock().unwrap(), vec!["a"]);
    }

    #[test]
    fn test_unsubscribe_by_name() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut observable = ResultObservable::new();
        observable.subscribe(recorder("file", false, &log));
        observable.subscribe(recorder("db", false, &log));
        assert_eq!(observable.unsubscribe("db"), 1);
        assert_eq!(observable.len(), 1);
        observable.notify(&record()).unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["file"]);
    }
}
