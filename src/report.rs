//! Execution Report - the persisted record of a campaign run.
//!
//! Records are listed in matrix order, never in completion order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::asset::AssetKey;
use crate::campaign::MatrixCell;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CellOutcome {
    Input,
    Cache,
    Generated,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellRecord {
    pub index: usize,
    #[serde(flatten)]
    pub cell: MatrixCell,
    pub outcome: CellOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset_key: Option<AssetKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_sha256: Option<String>,
    pub latency_ms: u64,
    /// Cost is charged to the first cell of a shared key only.
    pub cost: f64,
    pub attempts: u32,
    /// The asset came from a generation issued for another cell or run.
    #[serde(default)]
    pub deduplicated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Succeeded,
    PartiallySucceeded,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReportSummary {
    pub total_cells: usize,
    pub from_input: usize,
    pub from_cache: usize,
    pub generated: usize,
    pub failed: usize,
    /// Distinct keys this run produced (one per deduplicated request).
    pub generation_requests: usize,
    /// Service calls issued, retries included.
    pub generation_calls: u32,
    pub total_cost: f64,
    /// Share of cells served without a new generation, in percent.
    pub cache_efficiency: f64,
}

impl ReportSummary {
    pub fn from_records(records: &[CellRecord], generation_requests: usize, generation_calls: u32) -> Self {
        let count = |outcome: CellOutcome| records.iter().filter(|r| r.outcome == outcome).count();
        let total_cells = records.len();
        let from_input = count(CellOutcome::Input);
        let from_cache = count(CellOutcome::Cache);
        let cache_efficiency = if total_cells > 0 {
            (from_input + from_cache) as f64 / total_cells as f64 * 100.0
        } else {
            0.0
        };
        Self {
            total_cells,
            from_input,
            from_cache,
            generated: count(CellOutcome::Generated),
            failed: count(CellOutcome::Failed),
            generation_requests,
            generation_calls,
            total_cost: records.iter().map(|r| r.cost).sum(),
            cache_efficiency,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub run_id: Uuid,
    pub campaign_id: String,
    pub engine_version: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub status: RunStatus,
    pub worker_count: usize,
    pub locale_in_key: bool,
    pub summary: ReportSummary,
    pub records: Vec<CellRecord>,
}

impl ExecutionReport {
    pub fn failed_records(&self) -> impl Iterator<Item = &CellRecord> {
        self.records.iter().filter(|r| r.outcome == CellOutcome::Failed)
    }

    pub fn to_json_pretty(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Write `<dir>/<campaign_id>_execution.json`.
    pub fn write_json(&self, dir: &Path) -> std::io::Result<PathBuf> {
        self.write_file(dir, &format!("{}_execution.json", self.campaign_id))
    }

    /// Write `<dir>/<campaign_id>_<label>_execution.json`, next to the
    /// unlabelled report of the same campaign.
    pub fn write_json_labelled(&self, dir: &Path, label: &str) -> std::io::Result<PathBuf> {
        self.write_file(dir, &format!("{}_{}_execution.json", self.campaign_id, label))
    }

    fn write_file(&self, dir: &Path, name: &str) -> std::io::Result<PathBuf> {
        fs::create_dir_all(dir)?;
        let path = dir.join(name);
        let body = self.to_json_pretty().map_err(std::io::Error::other)?;
        fs::write(&path, body)?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::campaign::AspectRatio;

    fn record(index: usize, outcome: CellOutcome, cost: f64) -> CellRecord {
        CellRecord {
            index,
            cell: MatrixCell::new("p1", AspectRatio::Square, "en"),
            outcome,
            asset_key: None,
            content_sha256: None,
            latency_ms: 5,
            cost,
            attempts: u32::from(outcome == CellOutcome::Generated),
            deduplicated: false,
            error: None,
        }
    }

    #[test]
    fn test_summary_counts() {
        let records = vec![
            record(0, CellOutcome::Input, 0.0),
            record(1, CellOutcome::Cache, 0.0),
            record(2, CellOutcome::Generated, 0.08),
            record(3, CellOutcome::Failed, 0.08),
        ];
        let summary = ReportSummary::from_records(&records, 2, 2);
        assert_eq!(summary.total_cells, 4);
        assert_eq!(summary.generated, 1);
        assert_eq!(summary.failed, 1);
        assert!((summary.total_cost - 0.16).abs() < 1e-9);
        assert!((summary.cache_efficiency - 50.0).abs() < 1e-9);
    }

    fn report(records: Vec<CellRecord>) -> ExecutionReport {
        let now = Utc::now();
        ExecutionReport {
            run_id: Uuid::new_v4(),
            campaign_id: "summer".to_string(),
            engine_version: crate::ENGINE_VERSION.to_string(),
            started_at: now,
            finished_at: now,
            duration_ms: 0,
            status: RunStatus::Succeeded,
            worker_count: 3,
            locale_in_key: false,
            summary: ReportSummary::from_records(&records, 0, 0),
            records,
        }
    }

    #[test]
    fn test_labelled_report_does_not_replace_plain_one() {
        let dir = tempfile::tempdir().unwrap();
        let first = report(vec![record(0, CellOutcome::Generated, 0.08)]);
        let verify = report(vec![record(0, CellOutcome::Cache, 0.0)]);

        let first_path = first.write_json(dir.path()).unwrap();
        let verify_path = verify.write_json_labelled(dir.path(), "verify").unwrap();
        assert_eq!(first_path, dir.path().join("summer_execution.json"));
        assert_eq!(verify_path, dir.path().join("summer_verify_execution.json"));

        let read = |path: &Path| -> ExecutionReport {
            serde_json::from_slice(&fs::read(path).unwrap()).unwrap()
        };
        assert_eq!(read(&first_path).run_id, first.run_id);
        assert_eq!(read(&verify_path).run_id, verify.run_id);
    }

    #[test]
    fn test_write_failure_is_returned() {
        let dir = tempfile::tempdir().unwrap();
        let blocked = dir.path().join("reports");
        fs::write(&blocked, b"not a directory").unwrap();
        assert!(report(Vec::new()).write_json(&blocked).is_err());
    }

    #[test]
    fn test_record_json_shape() {
        let json = serde_json::to_value(record(0, CellOutcome::Generated, 0.04)).unwrap();
        assert_eq!(json["product_id"], "p1");
        assert_eq!(json["aspect_ratio"], "1x1");
        assert_eq!(json["outcome"], "generated");
        assert!(json.get("error").is_none());
    }
}
