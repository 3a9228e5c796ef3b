//! Run reporting - accumulates per-dimension and per-run counts and prints
//! the closing summary. The same structure is serialized into the run
//! ledger so past migrations can be audited.

use serde::Serialize;

/// Counts for one reference dimension processed during a run.
#[derive(Debug, Default, Serialize)]
pub struct DimensionReport {
    pub dimension: String,
    pub values_seen: usize,
    pub new_records: usize,
    pub superseded_duplicates: usize,
    pub description_updates: usize,
    pub parent_conflicts: u64,
    pub rows_without_value: u64,
    pub rows_unresolved: u64,
    pub fk_updates: usize,
}

/// Everything one pipeline run decided and did.
#[derive(Debug, Serialize)]
pub struct RunSummary {
    pub pipeline: String,
    pub rows_read: usize,
    pub rows_matched: usize,
    pub rows_unmatched: u64,
    pub rows_empty_key: u64,
    pub dimensions: Vec<DimensionReport>,
    pub dependents_inserted: usize,
    pub dependents_skipped: u64,
    pub value_updates: usize,
    pub warnings: Vec<String>,
}

impl RunSummary {
    pub fn new(pipeline: &str) -> RunSummary {
        RunSummary {
            pipeline: pipeline.to_string(),
            rows_read: 0,
            rows_matched: 0,
            rows_unmatched: 0,
            rows_empty_key: 0,
            dimensions: Vec::new(),
            dependents_inserted: 0,
            dependents_skipped: 0,
            value_updates: 0,
            warnings: Vec::new(),
        }
    }

    pub fn add_dimension(&mut self, report: DimensionReport) {
        self.dimensions.push(report);
    }

    /// Fold one matching pass into the run counts. The combined run
    /// resolves the sheet once per sub-pipeline, so the totals add up
    /// across passes instead of keeping only the last one.
    pub fn add_match_counts(
        &mut self,
        rows_read: usize,
        matched: usize,
        unmatched: u64,
        empty: u64,
    ) {
        self.rows_read += rows_read;
        self.rows_matched += matched;
        self.rows_unmatched += unmatched;
        self.rows_empty_key += empty;
    }

    /// Record a warning: printed immediately so it lands next to the
    /// progress output, kept for the summary and the ledger.
    pub fn warn(&mut self, message: impl Into<String>) {
        let message = message.into();
        eprintln!("WARNING: {}", message);
        self.warnings.push(message);
    }

    /// Print the closing report. Called on success and on failure alike,
    /// with whatever was accumulated up to the stopping point.
    pub fn print(&self) {
        println!();
        println!("=== Migration Summary ===");
        println!("Pipeline:        {}", self.pipeline);
        println!("Rows read:       {}", self.rows_read);
        println!(
            "Rows matched:    {} (unmatched: {}, empty key: {})",
            self.rows_matched, self.rows_unmatched, self.rows_empty_key
        );
        for report in &self.dimensions {
            println!(
                "Dimension {}: {} values, {} new, {} superseded, {} description updates, {} fk updates",
                report.dimension,
                report.values_seen,
                report.new_records,
                report.superseded_duplicates,
                report.description_updates,
                report.fk_updates
            );
            if report.rows_without_value > 0 || report.rows_unresolved > 0 {
                println!(
                    "  rows without value: {}, unresolved: {}, parent conflicts: {}",
                    report.rows_without_value, report.rows_unresolved, report.parent_conflicts
                );
            }
        }
        if self.dependents_inserted > 0 || self.dependents_skipped > 0 {
            println!(
                "Dependents:      {} inserted, {} skipped",
                self.dependents_inserted, self.dependents_skipped
            );
        }
        if self.value_updates > 0 {
            println!("Value updates:   {}", self.value_updates);
        }
        if self.warnings.is_empty() {
            println!("Warnings:        none");
        } else {
            println!("Warnings:        {}", self.warnings.len());
            for warning in &self.warnings {
                println!("  - {}", warning);
            }
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_match_counts_accumulate_across_pipelines() {
        let mut summary = RunSummary::new("all");
        summary.add_match_counts(4, 3, 1, 0);
        summary.add_match_counts(4, 2, 0, 2);

        assert_eq!(summary.rows_read, 8);
        assert_eq!(summary.rows_matched, 5);
        assert_eq!(summary.rows_unmatched, 1);
        assert_eq!(summary.rows_empty_key, 2);
    }

    #[test]
    fn test_warn_accumulates() {
        let mut summary = RunSummary::new("banks");
        summary.warn("superseded code 10 for BANCO GENERAL");
        summary.warn(format!("unresolved values: {}", 3));
        assert_eq!(summary.warnings.len(), 2);
        assert!(summary.warnings[0].contains("superseded"));
    }

    #[test]
    fn test_summary_serializes_for_ledger() {
        let mut summary = RunSummary::new("banks");
        summary.rows_read = 10;
        summary.add_dimension(DimensionReport {
            dimension: "banks".to_string(),
            values_seen: 4,
            new_records: 2,
            ..DimensionReport::default()
        });

        let value = serde_json::to_value(&summary).unwrap();
        assert_eq!(value["pipeline"], "banks");
        assert_eq!(value["rows_read"], 10);
        assert_eq!(value["dimensions"][0]["new_records"], 2);
    }
}
