//! Database sink -- normalizes run records into the document collections.
//!
//! The test case, DUT, host and CI blocks each become a reference document
//! shared across runs; the run itself lives in `test_execution_results`
//! with those blocks replaced by their ids. Reference ids are resolved once
//! per sink and cached.

use std::path::Path;

use anyhow::{anyhow, Context};
use rusqlite::Connection;
use serde_json::{json, Value};
use tracing::{debug, info};

use super::{ResultObserver, SinkError};
use crate::record::{DocId, RunRecord};
use crate::storage::{self, Collection, Pool};

pub struct DatabaseSink {
    pool: Pool,
    run_set_id: Option<String>,
    exec_doc_id: Option<DocId>,
    test_case_info_doc_id: Option<DocId>,
    dut_info_doc_id: Option<DocId>,
    host_info_doc_id: Option<DocId>,
    ci_info_doc_id: Option<DocId>,
}

impl DatabaseSink {
    /// Open the database at `path`, creating collections and indexes.
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let pool = storage::open_pool(path)?;
        info!(path = %path.display(), "database sink ready");
        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: Pool) -> Self {
        Self {
            pool,
            run_set_id: None,
            exec_doc_id: None,
            test_case_info_doc_id: None,
            dut_info_doc_id: None,
            host_info_doc_id: None,
            ci_info_doc_id: None,
        }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    fn resolve_references(&mut self, conn: &Connection, record: &RunRecord) -> anyhow::Result<()> {
        if self.test_case_info_doc_id.is_none() {
            let summary = &record.test_summary_record;
            let doc = json!({
                "test_case_id": summary.test_case_id,
                "test_suite_name": summary.test_suite_name,
                "test_case_name": summary.test_case_name,
                "test_case_class": summary.test_case_class,
                "test_case_description": summary.test_case_description,
            });
            self.test_case_info_doc_id = Some(upsert(conn, Collection::TestCaseInfo, &doc, true)?);
        }

        if self.dut_info_doc_id.is_none() {
            if let Some(dut) = &record.dut_information_record {
                let doc = serde_json::to_value(dut)?;
                self.dut_info_doc_id = Some(upsert(conn, Collection::DutInfo, &doc, true)?);
            }
        }

        if self.host_info_doc_id.is_none() {
            if let Some(host) = &record.host_information_record {
                let doc = serde_json::to_value(host)?;
                self.host_info_doc_id = Some(upsert(conn, Collection::HostInfo, &doc, false)?);
            }
        }

        if self.ci_info_doc_id.is_none() {
            if let Some(ci) = record.ci_information_record.as_ref().filter(|ci| !ci.is_empty()) {
                let doc = serde_json::to_value(ci)?;
                self.ci_info_doc_id = Some(upsert(conn, Collection::CiInfo, &doc, false)?);
            }
        }
        Ok(())
    }

    /// Shape `record` the way it is stored in `test_execution_results`.
    fn stored_form(&self, record: &RunRecord) -> anyhow::Result<RunRecord> {
        let tc_id = self
            .test_case_info_doc_id
            .ok_or_else(|| anyhow!("test case reference not resolved"))?;
        let mut stored = record.clone();
        stored.test_summary_record.strip_identity(tc_id);
        stored.dut_info_doc_id = self.dut_info_doc_id;
        stored.host_info_doc_id = self.host_info_doc_id;
        stored.ci_info_doc_id = self.ci_info_doc_id;
        stored.dut_information_record = None;
        stored.host_information_record = None;
        stored.ci_information_record = None;
        Ok(stored)
    }

    fn write_execution(&mut self, conn: &Connection, record: &RunRecord) -> Result<(), SinkError> {
        let stored = self.stored_form(record)?;

        let exec_id = match self.exec_doc_id {
            Some(id) => id,
            None => {
                let mut initial = stored.clone();
                initial.list_of_iteration_records.clear();
                let id = upsert(
                    conn,
                    Collection::TestExecutionResults,
                    &initial.to_document()?,
                    false,
                )?;
                info!(run_set_id = %record.run_set_id, doc_id = id, "execution document resolved");
                self.exec_doc_id = Some(id);
                id
            }
        };

        let current = storage::get_document(conn, Collection::TestExecutionResults, exec_id)?
            .ok_or_else(|| anyhow!("execution document {exec_id} disappeared"))?;
        let mut current = RunRecord::from_document(current)?;

        if let Some(latest) = stored.latest_iteration() {
            debug!(iteration = latest.iteration_number, "splicing iteration into execution document");
            current.splice_iteration(latest.clone());
        }
        current.test_summary_record = stored.test_summary_record;
        current.dut_info_doc_id = stored.dut_info_doc_id;
        current.host_info_doc_id = stored.host_info_doc_id;
        current.ci_info_doc_id = stored.ci_info_doc_id;
        current.validate()?;

        storage::replace_document(
            conn,
            Collection::TestExecutionResults,
            exec_id,
            &current.to_document()?,
        )?;
        Ok(())
    }
}

impl ResultObserver for DatabaseSink {
    fn name(&self) -> &str {
        "database"
    }

    fn dispatch(&mut self, record: RunRecord) -> Result<(), SinkError> {
        let conn = self
            .pool
            .get()
            .context("failed to get database connection")?;

        if self.run_set_id.as_deref() != Some(record.run_set_id.as_str()) {
            self.run_set_id = Some(record.run_set_id.clone());
            self.exec_doc_id = None;
        }

        self.resolve_references(&conn, &record)?;
        self.write_execution(&conn, &record)
    }
}

fn upsert(
    conn: &Connection,
    collection: Collection,
    document: &Value,
    update_existing: bool,
) -> anyhow::Result<DocId> {
    let query = collection.key_query(document);
    storage::find_or_update_document(conn, collection, &query, document, update_existing)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{
        model::AnalyticsData, DutInformation, HostInformation, IterationRecord, IterationResult,
        RunResult, RunStatus, RunSummary,
    };
    use chrono::Utc;

    fn record(run_set_id: &str) -> RunRecord {
        let mut record = RunRecord::new(
            run_set_id,
            RunSummary {
                test_suite_name: Some("StressSuite".into()),
                test_case_name: Some("pairing".into()),
                test_case_id: Some("TC-STRESS-1.1".into()),
                test_case_class: Some("TC_Pairing".into()),
                test_case_description: Some("pair and unpair".into()),
                test_case_info_doc_id: None,
                test_case_began_at: Utc::now(),
                test_case_ended_at: None,
                test_case_status: RunStatus::InProgress,
                test_case_result: RunResult::InProgress,
                total_number_of_iterations: 2,
                number_of_iterations_completed: 0,
                number_of_iterations_passed: 0,
                number_of_iterations_failed: 0,
                platform: "rpi".into(),
                commissioning_method: "ble-wifi".into(),
                list_of_iterations_failed: vec![],
                analytics_parameters: vec![],
                mean_of_analytics: Default::default(),
            },
        );
        record.host_information_record = Some(HostInformation {
            host_name: "bench".into(),
            ip_address: "10.0.0.2".into(),
            mac_address: "dc:a6:32:00:00:02".into(),
        });
        record.dut_information_record = Some(DutInformation {
            vendor_name: Some("Acme".into()),
            product_name: Some("Bulb".into()),
            product_id: 32769,
            vendor_id: 65521,
            software_version: None,
            hardware_version: None,
            serial_number: "SN-7".into(),
        });
        record
    }

    fn sink() -> (tempfile::TempDir, DatabaseSink) {
        let dir = tempfile::tempdir().unwrap();
        let sink = DatabaseSink::open(&dir.path().join("results.db")).unwrap();
        (dir, sink)
    }

    fn count(sink: &DatabaseSink, table: &str) -> i64 {
        sink.pool()
            .get()
            .unwrap()
            .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |r| r.get(0))
            .unwrap()
    }

    #[test]
    fn test_execution_document_references_info_blocks() {
        let (_dir, mut sink) = sink();
        let run_id = uuid::Uuid::new_v4().to_string();
        let mut rec = record(&run_id);
        sink.dispatch(rec.clone()).unwrap();

        let now = Utc::now();
        rec.test_summary_record.number_of_iterations_completed = 1;
        rec.test_summary_record.number_of_iterations_passed = 1;
        rec.list_of_iteration_records
            .insert(0, IterationRecord::new(1, now, now, IterationResult::Pass, None, AnalyticsData::new()));
        sink.dispatch(rec.clone()).unwrap();
        sink.dispatch(rec).unwrap();

        assert_eq!(count(&sink, "test_execution_results"), 1);
        assert_eq!(count(&sink, "dut_info"), 1);
        assert_eq!(count(&sink, "host_info"), 1);
        assert_eq!(count(&sink, "ci_info"), 0);

        let conn = sink.pool().get().unwrap();
        let doc = storage::get_document(&conn, Collection::TestExecutionResults, sink.exec_doc_id.unwrap())
            .unwrap()
            .unwrap();
        assert!(doc.get("dut_information_record").is_none());
        assert!(doc["dut_info_doc_id"].as_i64().unwrap() > 0);
        assert!(doc["test_summary_record"].get("test_case_name").is_none());
        assert_eq!(doc["list_of_iteration_records"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_runs_share_reference_documents() {
        let (_dir, mut first) = sink();
        first
            .dispatch(record(&uuid::Uuid::new_v4().to_string()))
            .unwrap();

        let mut second = DatabaseSink::from_pool(first.pool().clone());
        second
            .dispatch(record(&uuid::Uuid::new_v4().to_string()))
            .unwrap();

        assert_eq!(count(&first, "test_execution_results"), 2);
        assert_eq!(count(&first, "test_case_info"), 1);
        assert_eq!(count(&first, "dut_info"), 1);
        assert_eq!(first.test_case_info_doc_id, second.test_case_info_doc_id);
    }

    #[test]
    fn test_invalid_iteration_leaves_execution_document_loadable() {
        let (_dir, mut sink) = sink();
        let mut rec = record(&uuid::Uuid::new_v4().to_string());
        sink.dispatch(rec.clone()).unwrap();

        let now = Utc::now();
        rec.test_summary_record.number_of_iterations_completed = 1;
        rec.test_summary_record.number_of_iterations_passed = 1;
        let mut iteration =
            IterationRecord::new(1, now, now, IterationResult::Pass, None, AnalyticsData::new());
        iteration.iteration_data.iteration_tc_execution_data.iteration_end_time =
            now - chrono::Duration::seconds(2);
        rec.list_of_iteration_records.insert(0, iteration);
        assert!(matches!(sink.dispatch(rec), Err(SinkError::Record(_))));

        let conn = sink.pool().get().unwrap();
        let doc = storage::get_document(&conn, Collection::TestExecutionResults, sink.exec_doc_id.unwrap())
            .unwrap()
            .unwrap();
        let stored = RunRecord::from_document(doc).unwrap();
        assert!(stored.list_of_iteration_records.is_empty());
    }
}
