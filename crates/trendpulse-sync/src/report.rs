//! Per-unit outcomes and the run-level summary.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::fs;
use trendpulse_core::UnitId;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Dictionary,
    FetchTransient,
    FetchRejected,
    Persistence,
    /// The unit's task panicked or was cancelled.
    Internal,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Dictionary => "dictionary",
            Self::FetchTransient => "fetch_transient",
            Self::FetchRejected => "fetch_rejected",
            Self::Persistence => "persistence",
            Self::Internal => "internal",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum UnitOutcome {
    Completed {
        fetched: usize,
        inserted: u64,
        skipped: u64,
        dropped: usize,
    },
    Failed {
        kind: ErrorKind,
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnitReport {
    pub index: usize,
    pub unit: UnitId,
    pub outcome: UnitOutcome,
    pub elapsed_ms: u64,
}

impl UnitReport {
    pub fn is_failed(&self) -> bool {
        matches!(self.outcome, UnitOutcome::Failed { .. })
    }

    /// Completed, but the provider returned nothing for this unit.
    pub fn is_empty(&self) -> bool {
        matches!(self.outcome, UnitOutcome::Completed { fetched: 0, .. })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunTotals {
    pub units: usize,
    pub completed: usize,
    pub empty: usize,
    pub errored: usize,
    pub inserted: u64,
    pub skipped: u64,
    pub dropped: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub totals: RunTotals,
    pub units: Vec<UnitReport>,
}

impl RunReport {
    /// Orders `units` by enumeration index and rolls up the totals.
    pub fn new(
        run_id: Uuid,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        mut units: Vec<UnitReport>,
    ) -> Self {
        units.sort_by_key(|u| u.index);

        let mut totals = RunTotals {
            units: units.len(),
            ..RunTotals::default()
        };
        for unit in &units {
            match &unit.outcome {
                UnitOutcome::Completed {
                    fetched,
                    inserted,
                    skipped,
                    dropped,
                } => {
                    totals.completed += 1;
                    if *fetched == 0 {
                        totals.empty += 1;
                    }
                    totals.inserted += inserted;
                    totals.skipped += skipped;
                    totals.dropped += dropped;
                }
                UnitOutcome::Failed { .. } => totals.errored += 1,
            }
        }

        Self {
            run_id,
            started_at,
            finished_at,
            totals,
            units,
        }
    }

    pub fn failed_units(&self) -> impl Iterator<Item = &UnitReport> {
        self.units.iter().filter(|u| u.is_failed())
    }

    pub fn has_failures(&self) -> bool {
        self.totals.errored > 0
    }

    pub fn to_markdown(&self) -> String {
        let t = &self.totals;
        let mut lines = vec![
            "# Trend Ingestion Run".to_string(),
            String::new(),
            format!("- Run ID: `{}`", self.run_id),
            format!("- Started: {}", self.started_at),
            format!("- Finished: {}", self.finished_at),
            format!(
                "- Units: {} ({} completed, {} empty, {} errored)",
                t.units, t.completed, t.empty, t.errored
            ),
            format!(
                "- Rows: {} inserted, {} skipped, {} samples dropped",
                t.inserted, t.skipped, t.dropped
            ),
            String::new(),
            "## Units".to_string(),
        ];

        for unit in &self.units {
            lines.push(match &unit.outcome {
                UnitOutcome::Completed {
                    fetched: 0,
                    ..
                } => format!("- {}: no data", unit.unit),
                UnitOutcome::Completed {
                    fetched,
                    inserted,
                    skipped,
                    dropped,
                } => format!(
                    "- {}: fetched {fetched}, inserted {inserted}, skipped {skipped}, dropped {dropped}",
                    unit.unit
                ),
                UnitOutcome::Failed { kind, message } => {
                    format!("- {}: ERROR {} ({message})", unit.unit, kind.as_str())
                }
            });
        }
        lines.push(String::new());
        lines.join("\n")
    }
}

/// Writes `run_summary.json` and `run_summary.md` under `<root>/<run_id>/`.
pub async fn write_report_files(root: &Path, report: &RunReport) -> Result<PathBuf> {
    let run_dir = root.join(report.run_id.to_string());
    fs::create_dir_all(&run_dir)
        .await
        .with_context(|| format!("creating {}", run_dir.display()))?;

    let json = serde_json::to_vec_pretty(report).context("serializing run report")?;
    fs::write(run_dir.join("run_summary.json"), json)
        .await
        .context("writing run_summary.json")?;
    fs::write(run_dir.join("run_summary.md"), report.to_markdown())
        .await
        .context("writing run_summary.md")?;

    Ok(run_dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn unit_id(country: &str) -> UnitId {
        UnitId {
            country: country.into(),
            window: "1d".into(),
            category: "shopping".into(),
        }
    }

    fn sample_report() -> RunReport {
        let at = Utc.with_ymd_and_hms(2026, 3, 9, 6, 0, 0).single().unwrap();
        RunReport::new(
            Uuid::nil(),
            at,
            at,
            vec![
                UnitReport {
                    index: 2,
                    unit: unit_id("DE"),
                    outcome: UnitOutcome::Completed {
                        fetched: 0,
                        inserted: 0,
                        skipped: 0,
                        dropped: 0,
                    },
                    elapsed_ms: 3,
                },
                UnitReport {
                    index: 1,
                    unit: unit_id("UK"),
                    outcome: UnitOutcome::Failed {
                        kind: ErrorKind::FetchTransient,
                        message: "provider still failing".into(),
                    },
                    elapsed_ms: 9,
                },
                UnitReport {
                    index: 0,
                    unit: unit_id("US"),
                    outcome: UnitOutcome::Completed {
                        fetched: 3,
                        inserted: 2,
                        skipped: 0,
                        dropped: 1,
                    },
                    elapsed_ms: 5,
                },
            ],
        )
    }

    #[test]
    fn totals_distinguish_empty_from_errored() {
        let report = sample_report();
        assert_eq!(
            report.totals,
            RunTotals {
                units: 3,
                completed: 2,
                empty: 1,
                errored: 1,
                inserted: 2,
                skipped: 0,
                dropped: 1,
            }
        );
        let order: Vec<usize> = report.units.iter().map(|u| u.index).collect();
        assert_eq!(order, vec![0, 1, 2]);
        assert_eq!(report.failed_units().count(), 1);
    }

    #[test]
    fn markdown_lists_every_unit_outcome() {
        let md = sample_report().to_markdown();
        assert!(md.contains("- Units: 3 (2 completed, 1 empty, 1 errored)"));
        assert!(md.contains("- US/1d/shopping: fetched 3, inserted 2, skipped 0, dropped 1"));
        assert!(md.contains("- UK/1d/shopping: ERROR fetch_transient"));
        assert!(md.contains("- DE/1d/shopping: no data"));
    }

    #[tokio::test]
    async fn report_files_are_written_per_run() {
        let dir = tempdir().expect("tempdir");
        let run_dir = write_report_files(dir.path(), &sample_report())
            .await
            .expect("write reports");
        let json: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(run_dir.join("run_summary.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(json["totals"]["errored"], 1);
        assert_eq!(json["units"][1]["outcome"]["status"], "failed");
        assert_eq!(json["units"][1]["outcome"]["kind"], "fetch_transient");
        assert!(run_dir.join("run_summary.md").exists());
    }
}
