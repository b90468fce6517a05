//! Shared domain types.
//!
//! The canonical product table, the step status vocabulary shared with the
//! orchestrator, and the per-invocation wall-clock budget.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::{WorkerError, WorkerResult};

/// Status a step invocation reports back to the orchestrator.
///
/// `completed` is canonical; legacy checkpoints occasionally carry `success`,
/// which is accepted on read and never written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[serde(alias = "success")]
    Completed,
    InProgress,
    Finalizing,
    Failed,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Completed => "completed",
            StepStatus::InProgress => "in_progress",
            StepStatus::Finalizing => "finalizing",
            StepStatus::Failed => "failed",
        }
    }

    /// Terminal statuses are not re-invoked by the orchestrator.
    pub fn is_terminal(&self) -> bool {
        matches!(self, StepStatus::Completed | StepStatus::Failed)
    }
}

/// Header row of the canonical product table.
pub const PRODUCT_TABLE_HEADER: &str = "Matnr\tMPN\tEAN\tDesc\tStock\tLP\tCBP\tSur";

/// One surviving product after the parse-merge join.
///
/// Column order is fixed: `matnr, mpn, ean, description, stock, list_price,
/// best_price, surcharge`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductRow {
    pub matnr: String,
    pub mpn: String,
    pub ean: String,
    pub description: String,
    pub stock: i64,
    pub list_price: f64,
    pub best_price: f64,
    pub surcharge: f64,
}

impl ProductRow {
    /// Serialize as one product-table line (no trailing newline).
    pub fn to_tsv_line(&self) -> String {
        format!(
            "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
            sanitize_field(&self.matnr),
            sanitize_field(&self.mpn),
            sanitize_field(&self.ean),
            sanitize_field(&self.description),
            self.stock,
            fmt_price(self.list_price),
            fmt_price(self.best_price),
            fmt_price(self.surcharge),
        )
    }

    pub fn from_tsv_line(line: &str, line_no: usize) -> WorkerResult<Self> {
        let cols: Vec<&str> = line.split('\t').collect();
        if cols.len() != 8 {
            return Err(WorkerError::ProductTableMalformed {
                line: line_no,
                detail: format!("expected 8 columns, found {}", cols.len()),
            });
        }
        let parse_num = |idx: usize, what: &str| -> WorkerResult<f64> {
            fast_float::parse(cols[idx]).map_err(|_| WorkerError::ProductTableMalformed {
                line: line_no,
                detail: format!("invalid {what} value {:?}", cols[idx]),
            })
        };
        let stock = cols[4]
            .parse::<i64>()
            .map_err(|_| WorkerError::ProductTableMalformed {
                line: line_no,
                detail: format!("invalid stock value {:?}", cols[4]),
            })?;
        Ok(ProductRow {
            matnr: cols[0].to_string(),
            mpn: cols[1].to_string(),
            ean: cols[2].to_string(),
            description: cols[3].to_string(),
            stock,
            list_price: parse_num(5, "list price")?,
            best_price: parse_num(6, "best price")?,
            surcharge: parse_num(7, "surcharge")?,
        })
    }

    /// Price base used by pricing and exports: best price when present,
    /// list price otherwise, plus the supplier surcharge.
    pub fn price_base(&self) -> f64 {
        let p = if self.best_price > 0.0 {
            self.best_price
        } else {
            self.list_price
        };
        p + self.surcharge
    }
}

/// Parse a full product table (header plus rows, LF line endings).
pub fn read_product_table(bytes: &[u8]) -> WorkerResult<Vec<ProductRow>> {
    let text = String::from_utf8_lossy(bytes);
    let mut rows = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        if idx == 0 {
            if line != PRODUCT_TABLE_HEADER {
                return Err(WorkerError::ProductTableMalformed {
                    line: 1,
                    detail: "unexpected header row".to_string(),
                });
            }
            continue;
        }
        if line.is_empty() {
            continue;
        }
        rows.push(ProductRow::from_tsv_line(line, idx + 1)?);
    }
    Ok(rows)
}

/// Serialize a product table with header and trailing newline.
pub fn write_product_table(rows: &[ProductRow]) -> String {
    let mut out = String::with_capacity(64 + rows.len() * 64);
    out.push_str(PRODUCT_TABLE_HEADER);
    out.push('\n');
    for row in rows {
        out.push_str(&row.to_tsv_line());
        out.push('\n');
    }
    out
}

/// Tab and newline characters inside a field would shift every downstream
/// column, so they are flattened to spaces on write.
pub fn sanitize_field(value: &str) -> String {
    if value.contains(['\t', '\n', '\r']) {
        value.replace(['\t', '\n', '\r'], " ")
    } else {
        value.to_string()
    }
}

/// Shortest round-trippable decimal representation ("8", "8.5", "12.34").
pub fn fmt_price(value: f64) -> String {
    format!("{value}")
}

/// Soft wall-clock budget for one invocation.
///
/// The hard limit is enforced by the host runtime; this budget is how the
/// chunker and finalizer decide to surrender early and let the orchestrator
/// re-invoke.
#[derive(Debug, Clone, Copy)]
pub struct InvocationBudget {
    started: Instant,
    soft_limit: Duration,
}

impl InvocationBudget {
    pub const DEFAULT_SOFT_LIMIT: Duration = Duration::from_secs(8);

    pub fn new(soft_limit: Duration) -> Self {
        Self {
            started: Instant::now(),
            soft_limit,
        }
    }

    pub fn start_default() -> Self {
        Self::new(Self::DEFAULT_SOFT_LIMIT)
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn exhausted(&self) -> bool {
        self.started.elapsed() >= self.soft_limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_row() -> ProductRow {
        ProductRow {
            matnr: "M100".to_string(),
            mpn: "ABC-1".to_string(),
            ean: "0123456789012".to_string(),
            description: "USB cable".to_string(),
            stock: 7,
            list_price: 12.5,
            best_price: 9.99,
            surcharge: 0.0,
        }
    }

    #[test]
    fn product_row_round_trips() {
        let row = sample_row();
        let line = row.to_tsv_line();
        let back = ProductRow::from_tsv_line(&line, 2).unwrap();
        assert_eq!(row, back);
    }

    #[test]
    fn product_table_round_trips() {
        let rows = vec![sample_row()];
        let text = write_product_table(&rows);
        assert!(text.starts_with(PRODUCT_TABLE_HEADER));
        assert!(text.ends_with('\n'));
        let back = read_product_table(text.as_bytes()).unwrap();
        assert_eq!(back, rows);
    }

    #[test]
    fn embedded_tabs_do_not_shift_columns() {
        let mut row = sample_row();
        row.description = "tab\there".to_string();
        let line = row.to_tsv_line();
        assert_eq!(line.split('\t').count(), 8);
    }

    #[test]
    fn bad_column_count_is_categorical() {
        let err = ProductRow::from_tsv_line("a\tb", 3).unwrap_err();
        assert_eq!(err.code(), "product_table_malformed");
    }

    #[test]
    fn success_is_accepted_as_completed_alias() {
        let status: StepStatus = serde_json::from_str("\"success\"").unwrap();
        assert_eq!(status, StepStatus::Completed);
        assert_eq!(
            serde_json::to_string(&StepStatus::Completed).unwrap(),
            "\"completed\""
        );
    }

    #[test]
    fn price_base_prefers_best_price() {
        let mut row = sample_row();
        assert!((row.price_base() - 9.99).abs() < 1e-9);
        row.best_price = 0.0;
        row.surcharge = 1.5;
        assert!((row.price_base() - 14.0).abs() < 1e-9);
    }
}
