//! JSON file sink -- keeps `summary.json` in the run set folder current.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use super::{ResultObserver, SinkError};
use crate::record::RunRecord;

pub struct FileSink {
    path: PathBuf,
}

impl FileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load and validate the persisted document, if one exists.
    pub fn load(&self) -> Result<Option<RunRecord>, SinkError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let text = fs::read_to_string(&self.path).map_err(|e| io_error(&self.path, e))?;
        let value: serde_json::Value = serde_json::from_str(&text)?;
        Ok(Some(RunRecord::from_document(value)?))
    }
}

impl ResultObserver for FileSink {
    fn name(&self) -> &str {
        "file"
    }

    fn dispatch(&mut self, record: RunRecord) -> Result<(), SinkError> {
        let record = record.without_doc_ids();

        let merged = match self.load()? {
            None => {
                info!(path = %self.path.display(), run_set_id = %record.run_set_id, "creating summary document");
                let mut created = record;
                let mut iterations = std::mem::take(&mut created.list_of_iteration_records);
                iterations.sort_by_key(|r| r.iteration_number);
                for iteration in iterations {
                    created.splice_iteration(iteration);
                }
                created
            }
            Some(mut existing) => {
                if let Some(latest) = record.latest_iteration() {
                    debug!(iteration = latest.iteration_number, "splicing iteration record");
                    existing.splice_iteration(latest.clone());
                }
                existing.run_set_id = record.run_set_id;
                existing.test_summary_record = record.test_summary_record;
                existing.dut_information_record = record.dut_information_record;
                existing.host_information_record = record.host_information_record;
                existing.ci_information_record = record.ci_information_record;
                existing
            }
        };

        merged.validate()?;
        write_document_atomic(&self.path, &merged.to_document()?)
    }
}

/// Write `document` as pretty JSON to a sibling temp file, then rename it
/// over `path`.
pub(crate) fn write_document_atomic(
    path: &Path,
    document: &serde_json::Value,
) -> Result<(), SinkError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| io_error(parent, e))?;
    }
    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);

    let bytes = serde_json::to_vec_pretty(document)?;
    let mut file = fs::File::create(&tmp).map_err(|e| io_error(&tmp, e))?;
    file.write_all(&bytes).map_err(|e| io_error(&tmp, e))?;
    file.sync_all().map_err(|e| io_error(&tmp, e))?;
    drop(file);
    fs::rename(&tmp, path).map_err(|e| io_error(path, e))
}

pub(crate) fn io_error(path: &Path, source: std::io::Error) -> SinkError {
    SinkError::Io {
        path: path.display().to_string(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{
        model::AnalyticsData, IterationRecord, IterationResult, RunResult, RunStatus, RunSummary,
    };
    use chrono::Utc;

    fn base_record() -> RunRecord {
        let mut record = RunRecord::new(
            uuid::Uuid::new_v4().to_string(),
            RunSummary {
                test_suite_name: Some("suite".into()),
                test_case_name: Some("case".into()),
                test_case_id: Some("TC-1".into()),
                test_case_class: Some("TC_Case".into()),
                test_case_description: None,
                test_case_info_doc_id: Some(3),
                test_case_began_at: Utc::now(),
                test_case_ended_at: None,
                test_case_status: RunStatus::InProgress,
                test_case_result: RunResult::InProgress,
                total_number_of_iterations: 3,
                number_of_iterations_completed: 0,
                number_of_iterations_passed: 0,
                number_of_iterations_failed: 0,
                platform: "local".into(),
                commissioning_method: "on-network".into(),
                list_of_iterations_failed: vec![],
                analytics_parameters: vec![],
                mean_of_analytics: Default::default(),
            },
        );
        record.dut_info_doc_id = Some(9);
        record
    }

    fn push_iteration(record: &mut RunRecord, n: u32, result: IterationResult) {
        let now = Utc::now();
        let summary = &mut record.test_summary_record;
        summary.number_of_iterations_completed += 1;
        match result {
            IterationResult::Pass => summary.number_of_iterations_passed += 1,
            IterationResult::Fail => {
                summary.number_of_iterations_failed += 1;
                summary.list_of_iterations_failed.push(n);
            }
        }
        record.list_of_iteration_records.insert(
            0,
            IterationRecord::new(n, now, now, result, None, AnalyticsData::new()),
        );
    }

    #[test]
    fn test_first_dispatch_creates_document_without_doc_ids() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run").join("summary.json");
        let mut sink = FileSink::new(&path);
        sink.dispatch(base_record()).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        assert!(!text.contains("doc_id"));
        let loaded = sink.load().unwrap().unwrap();
        assert!(loaded.list_of_iteration_records.is_empty());
        assert!(!dir.path().join("run").join("summary.json.tmp").exists());
    }

    #[test]
    fn test_iterations_land_at_their_index() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = FileSink::new(dir.path().join("summary.json"));
        let mut record = base_record();
        sink.dispatch(record.clone()).unwrap();

        push_iteration(&mut record, 1, IterationResult::Pass);
        sink.dispatch(record.clone()).unwrap();
        push_iteration(&mut record, 2, IterationResult::Fail);
        sink.dispatch(record.clone()).unwrap();

        let loaded = sink.load().unwrap().unwrap();
        let numbers: Vec<u32> = loaded
            .list_of_iteration_records
            .iter()
            .map(|r| r.iteration_number)
            .collect();
        assert_eq!(numbers, vec![1, 2]);
        assert_eq!(loaded.test_summary_record.list_of_iterations_failed, vec![2]);
    }

    #[test]
    fn test_redispatch_overwrites_slot() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = FileSink::new(dir.path().join("summary.json"));
        let mut record = base_record();
        push_iteration(&mut record, 1, IterationResult::Pass);
        push_iteration(&mut record, 2, IterationResult::Pass);
        sink.dispatch(record.clone()).unwrap();

        let mut rerun = record.list_of_iteration_records[0].clone();
        rerun.iteration_data.iteration_tc_execution_data.exception = Some("late teardown".into());
        record.list_of_iteration_records[0] = rerun.clone();
        sink.dispatch(record).unwrap();

        let loaded = sink.load().unwrap().unwrap();
        assert_eq!(loaded.list_of_iteration_records.len(), 2);
        assert_eq!(loaded.list_of_iteration_records[1], rerun);
        assert_eq!(loaded.list_of_iteration_records[0].iteration_number, 1);
    }

    #[test]
    fn test_late_subscriber_writes_iterations_by_index() {
        let dir = tempfile::tempdir().unwrap();
        let mut record = base_record();
        push_iteration(&mut record, 1, IterationResult::Pass);
        push_iteration(&mut record, 2, IterationResult::Fail);

        let mut sink = FileSink::new(dir.path().join("summary.json"));
        sink.dispatch(record.clone()).unwrap();
        sink.dispatch(record).unwrap();

        let loaded = sink.load().unwrap().unwrap();
        let numbers: Vec<u32> = loaded
            .list_of_iteration_records
            .iter()
            .map(|r| r.iteration_number)
            .collect();
        assert_eq!(numbers, vec![1, 2]);
    }

    #[test]
    fn test_clock_step_back_keeps_document_loadable() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = FileSink::new(dir.path().join("summary.json"));
        let mut record = base_record();
        sink.dispatch(record.clone()).unwrap();

        let begin = Utc::now();
        record.test_summary_record.number_of_iterations_completed += 1;
        record.test_summary_record.number_of_iterations_passed += 1;
        record.list_of_iteration_records.insert(
            0,
            IterationRecord::new(
                1,
                begin,
                begin - chrono::Duration::seconds(2),
                IterationResult::Pass,
                None,
                AnalyticsData::new(),
            ),
        );
        sink.dispatch(record.clone()).unwrap();
        push_iteration(&mut record, 2, IterationResult::Pass);
        sink.dispatch(record).unwrap();

        let loaded = sink.load().unwrap().unwrap();
        assert_eq!(loaded.list_of_iteration_records.len(), 2);
        assert_eq!(
            loaded.list_of_iteration_records[0].analytics()[crate::record::ITERATION_DURATION],
            Some(0.0)
        );
    }

    #[test]
    fn test_invalid_record_is_rejected_before_writing() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = FileSink::new(dir.path().join("summary.json"));
        let mut record = base_record();
        push_iteration(&mut record, 1, IterationResult::Pass);
        sink.dispatch(record.clone()).unwrap();

        push_iteration(&mut record, 2, IterationResult::Pass);
        let execution = &mut record.list_of_iteration_records[0]
            .iteration_data
            .iteration_tc_execution_data;
        execution.iteration_end_time = execution.iteration_begin_time - chrono::Duration::seconds(2);
        assert!(matches!(sink.dispatch(record), Err(SinkError::Record(_))));

        let loaded = sink.load().unwrap().unwrap();
        assert_eq!(loaded.list_of_iteration_records.len(), 1);
    }

    #[test]
    fn test_corrupt_document_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("summary.json");
        fs::write(&path, "{ not json").unwrap();
        let mut sink = FileSink::new(&path);
        assert!(matches!(sink.dispatch(base_record()), Err(SinkError::Json(_))));
    }
}
