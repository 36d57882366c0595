//! # Tabular Output
//!
//! Serializes the descriptive tables, the association results and the
//! exclusion tally as CSV. This stage computes nothing: every number it
//! writes was produced upstream, and numeric cells use the shortest
//! representation that parses back to the identical float, so a written
//! table re-read and re-written is byte-identical.

use crate::cohort::ExclusionTally;
use crate::estimator::{AssociationResult, ModelStatus};
use crate::tabulate::{PrevalenceCell, SummaryTable};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("IO error on '{path}': {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("association table is missing column '{0}'")]
    MissingColumn(String),
    #[error("row {row} of column '{column}' in the association table is not numeric")]
    ParseValue { column: String, row: usize },
}

fn io_error(path: &Path, source: std::io::Error) -> ReportError {
    ReportError::Io {
        path: path.display().to_string(),
        source,
    }
}

fn format_cell(value: f64) -> String {
    if value.is_nan() {
        String::new()
    } else {
        format!("{value}")
    }
}

fn format_optional(value: Option<f64>) -> String {
    value.map(|v| format_cell(v)).unwrap_or_default()
}

/// Writes a stratified summary table (baseline or components).
///
/// Layout: one row per variable with `estimate`/`se` column pairs per
/// stratum plus the overall pair, preceded by an `unweighted_n` row.
pub fn write_summary_table(table: &SummaryTable, path: &Path) -> Result<(), ReportError> {
    let mut writer = csv::Writer::from_path(path)?;
    let mut header = vec!["variable".to_string(), "kind".to_string()];
    for label in &table.stratum_labels {
        header.push(format!("{label}_estimate"));
        header.push(format!("{label}_se"));
    }
    header.push("overall_estimate".to_string());
    header.push("overall_se".to_string());
    writer.write_record(&header)?;

    let mut n_row = vec!["unweighted_n".to_string(), "count".to_string()];
    for &n in &table.unweighted_n {
        n_row.push(n.to_string());
        n_row.push(String::new());
    }
    writer.write_record(&n_row)?;

    for row in &table.rows {
        let kind = if row.is_proportion { "proportion" } else { "mean" };
        let mut cells = vec![row.variable.clone(), kind.to_string()];
        for cell in row.cells.iter().chain(std::iter::once(&row.overall)) {
            cells.push(format_cell(cell.estimate));
            cells.push(format_cell(cell.se));
        }
        writer.write_record(&cells)?;
    }
    writer.flush().map_err(|source| io_error(path, source))?;
    log::info!("Wrote summary table ({} variables) to '{}'.", table.rows.len(), path.display());
    Ok(())
}

/// Writes the outcome-by-stratum prevalence grid in long form.
pub fn write_prevalence_table(cells: &[PrevalenceCell], path: &Path) -> Result<(), ReportError> {
    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record(["outcome", "stratum", "prevalence", "se", "n"])?;
    for cell in cells {
        writer.write_record(&[
            cell.outcome.to_string(),
            format!("Q{}", cell.stratum + 1),
            format_cell(cell.estimate.estimate),
            format_cell(cell.estimate.se),
            cell.estimate.n.to_string(),
        ])?;
    }
    writer.flush().map_err(|source| io_error(path, source))?;
    Ok(())
}

/// One line of the association table: a fitted effect, or a placeholder row
/// explaining why no effect exists for this model.
#[derive(Debug, Clone, PartialEq)]
pub struct AssociationRow {
    pub outcome: String,
    pub analysis: String,
    pub model: String,
    pub predictor: String,
    pub status: String,
    pub term: String,
    pub estimate: Option<f64>,
    pub ci_lower: Option<f64>,
    pub ci_upper: Option<f64>,
    pub p_value: Option<f64>,
    pub covariates: String,
    pub fell_back: bool,
    pub n_used: usize,
    pub events: usize,
    pub note: String,
}

/// Flattens model results to rows: one per effect for fitted models, one
/// placeholder otherwise.
pub fn flatten_associations(results: &[AssociationResult]) -> Vec<AssociationRow> {
    let mut rows = Vec::new();
    for result in results {
        let base = AssociationRow {
            outcome: result.outcome.to_string(),
            analysis: result.analysis.label().to_string(),
            model: result.model.label().to_string(),
            predictor: result.predictor.label().to_string(),
            status: String::new(),
            term: String::new(),
            estimate: None,
            ci_lower: None,
            ci_upper: None,
            p_value: None,
            covariates: String::new(),
            fell_back: false,
            n_used: result.n_used,
            events: result.events,
            note: String::new(),
        };
        match &result.status {
            ModelStatus::Fitted {
                effects,
                covariates,
                fell_back,
            } => {
                for effect in effects {
                    rows.push(AssociationRow {
                        status: "fitted".to_string(),
                        term: effect.term.clone(),
                        estimate: Some(effect.estimate),
                        ci_lower: Some(effect.ci_lower),
                        ci_upper: Some(effect.ci_upper),
                        p_value: Some(effect.p_value),
                        covariates: covariates.clone(),
                        fell_back: *fell_back,
                        ..base.clone()
                    });
                }
            }
            ModelStatus::InsufficientPower { events, required } => {
                rows.push(AssociationRow {
                    status: "insufficient_power".to_string(),
                    note: format!("{events} events observed, {required} required"),
                    ..base
                });
            }
            ModelStatus::Unestimable { reason } => {
                rows.push(AssociationRow {
                    status: "unestimable".to_string(),
                    note: reason.clone(),
                    ..base
                });
            }
        }
    }
    rows
}

const ASSOCIATION_COLUMNS: &[&str] = &[
    "outcome",
    "analysis",
    "model",
    "predictor",
    "status",
    "term",
    "estimate",
    "ci_lower",
    "ci_upper",
    "p_value",
    "covariates",
    "fell_back",
    "n_used",
    "events",
    "note",
];

pub fn write_association_table(rows: &[AssociationRow], path: &Path) -> Result<(), ReportError> {
    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record(ASSOCIATION_COLUMNS)?;
    for row in rows {
        writer.write_record(&[
            row.outcome.clone(),
            row.analysis.clone(),
            row.model.clone(),
            row.predictor.clone(),
            row.status.clone(),
            row.term.clone(),
            format_optional(row.estimate),
            format_optional(row.ci_lower),
            format_optional(row.ci_upper),
            format_optional(row.p_value),
            row.covariates.clone(),
            (row.fell_back as u8).to_string(),
            row.n_used.to_string(),
            row.events.to_string(),
            row.note.clone(),
        ])?;
    }
    writer.flush().map_err(|source| io_error(path, source))?;
    log::info!("Wrote association table ({} rows) to '{}'.", rows.len(), path.display());
    Ok(())
}

/// Reads back a table written by [`write_association_table`].
pub fn read_association_table(path: &Path) -> Result<Vec<AssociationRow>, ReportError> {
    let mut reader = csv::Reader::from_path(path)?;
    let headers: Vec<String> = reader.headers()?.iter().map(|h| h.to_string()).collect();
    let index_of = |name: &str| -> Result<usize, ReportError> {
        headers
            .iter()
            .position(|h| h == name)
            .ok_or_else(|| ReportError::MissingColumn(name.to_string()))
    };
    let indices: Vec<usize> = ASSOCIATION_COLUMNS
        .iter()
        .map(|name| index_of(name))
        .collect::<Result<_, _>>()?;

    let parse_float = |cell: &str, column: usize, row: usize| -> Result<Option<f64>, ReportError> {
        if cell.is_empty() {
            Ok(None)
        } else {
            cell.parse::<f64>().map(Some).map_err(|_| ReportError::ParseValue {
                column: ASSOCIATION_COLUMNS[column].to_string(),
                row,
            })
        }
    };
    let parse_count = |cell: &str, column: usize, row: usize| -> Result<usize, ReportError> {
        cell.parse::<usize>().map_err(|_| ReportError::ParseValue {
            column: ASSOCIATION_COLUMNS[column].to_string(),
            row,
        })
    };

    let mut rows = Vec::new();
    for (row_idx, record) in reader.records().enumerate() {
        let record = record?;
        let cell = |slot: usize| record.get(indices[slot]).unwrap_or("");
        rows.push(AssociationRow {
            outcome: cell(0).to_string(),
            analysis: cell(1).to_string(),
            model: cell(2).to_string(),
            predictor: cell(3).to_string(),
            status: cell(4).to_string(),
            term: cell(5).to_string(),
            estimate: parse_float(cell(6), 6, row_idx)?,
            ci_lower: parse_float(cell(7), 7, row_idx)?,
            ci_upper: parse_float(cell(8), 8, row_idx)?,
            p_value: parse_float(cell(9), 9, row_idx)?,
            covariates: cell(10).to_string(),
            fell_back: cell(11) == "1",
            n_used: parse_count(cell(12), 12, row_idx)?,
            events: parse_count(cell(13), 13, row_idx)?,
            note: cell(14).to_string(),
        });
    }
    Ok(rows)
}

/// Writes the per-rule exclusion counts in application order.
pub fn write_exclusion_tally(tally: &ExclusionTally, path: &Path) -> Result<(), ReportError> {
    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record(["rule", "excluded"])?;
    for (rule, count) in [
        ("total_rows", tally.total),
        ("missing_age", tally.missing_age),
        ("below_min_age", tally.below_min_age),
        ("missing_component", tally.missing_component),
        ("crp_above_bound", tally.crp_above_bound),
        ("missing_weight", tally.missing_weight),
        ("eligible", tally.eligible),
    ] {
        writer.write_record(&[rule.to_string(), count.to_string()])?;
    }
    writer.flush().map_err(|source| io_error(path, source))?;
    Ok(())
}
