//! Files the engine leaves behind in the run set folder.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::record::IterationRecord;

/// `<output_dir>/<dd-mm-YYYY_HH-MM-SS-ffffff>/<test_case_class>`.
pub fn run_set_folder(output_dir: &Path, test_case_class: &str, now: DateTime<Utc>) -> PathBuf {
    output_dir
        .join(now.format("%d-%m-%Y_%H-%M-%S-%6f").to_string())
        .join(test_case_class)
}

pub fn iteration_dir(run_set_folder: &Path, iteration: u32) -> PathBuf {
    run_set_folder.join(iteration.to_string())
}

pub fn iteration_log_name(iteration: u32, now: DateTime<Utc>) -> String {
    format!(
        "controller_log_iteration_{iteration}_{}.log",
        now.format("%Y-%m-%d_%H-%M-%S")
    )
}

/// Write `record` to `<dir>/iteration.json`.
pub fn write_iteration_json(dir: &Path, record: &IterationRecord) -> Result<PathBuf> {
    fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
    let path = dir.join("iteration.json");
    let json = serde_json::to_vec_pretty(record)?;
    fs::write(&path, json).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(path)
}

/// Copy each of `names` from `src_dir` into `dest_dir`. Missing files are
/// logged and skipped. Returns the number of files copied.
pub fn copy_var_logs(src_dir: &Path, names: &[String], dest_dir: &Path) -> usize {
    if let Err(e) = fs::create_dir_all(dest_dir) {
        warn!(dir = %dest_dir.display(), error = %e, "cannot create log copy directory");
        return 0;
    }
    let mut copied = 0;
    for name in names {
        let src = src_dir.join(name);
        let Some(file_name) = src.file_name() else {
            continue;
        };
        match fs::copy(&src, dest_dir.join(file_name)) {
            Ok(_) => copied += 1,
            Err(e) => warn!(file = %src.display(), error = %e, "failed to copy log file"),
        }
    }
    info!(copied, dest = %dest_dir.display(), "copied system logs for failed iteration");
    copied
}

/// Copy the chart report and summary into
/// `<ci_path>/<test_case_class>_test_results/`.
pub fn publish_to_ci_workspace(
    ci_path: &Path,
    test_case_class: &str,
    files: &[&Path],
) -> Result<PathBuf> {
    let dest = ci_path.join(format!("{test_case_class}_test_results"));
    fs::create_dir_all(&dest).with_context(|| format!("failed to create {}", dest.display()))?;
    for file in files {
        let name = file
            .file_name()
            .with_context(|| format!("{} has no file name", file.display()))?;
        fs::copy(file, dest.join(name))
            .with_context(|| format!("failed to copy {} to {}", file.display(), dest.display()))?;
    }
    info!(dest = %dest.display(), "results published to CI workspace");
    Ok(dest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_run_set_folder_layout() {
        let now = Utc.with_ymd_and_hms(2026, 3, 9, 14, 5, 7).unwrap();
        let folder = run_set_folder(Path::new("/data"), "TC_Pair", now);
        assert_eq!(folder, PathBuf::from("/data/09-03-2026_14-05-07-000000/TC_Pair"));
        assert_eq!(iteration_dir(&folder, 3), folder.join("3"));
        assert_eq!(
            iteration_log_name(3, now),
            "controller_log_iteration_3_2026-03-09_14-05-07.log"
        );
    }

    #[test]
    fn test_copy_var_logs_skips_missing() {
        let src = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();
        fs::write(src.path().join("syslog"), "kernel: ok").unwrap();
        let copied = copy_var_logs(
            src.path(),
            &["syslog".to_string(), "kern.log".to_string()],
            &dest.path().join("var_logs"),
        );
        assert_eq!(copied, 1);
        assert!(dest.path().join("var_logs").join("syslog").exists());
    }

    #[test]
    fn test_publish_to_ci_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let summary = dir.path().join("summary.json");
        fs::write(&summary, "{}").unwrap();
        let dest = publish_to_ci_workspace(&dir.path().join("ws"), "TC_Pair", &[&summary]).unwrap();
        assert!(dest.ends_with("TC_Pair_test_results"));
        assert!(dest.join("summary.json").exists());
    }
}
