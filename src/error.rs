//! Categorical worker errors.
//!
//! Every fatal failure carries a stable snake_case identifier. The identifier
//! is what lands in the checkpoint's `last_error`, in diagnostic events, and
//! in the HTTP error response, so it must never change between releases.
//! Protocol-level evidence (HTTP status, Content-Range header, byte counts)
//! rides along in the variant fields and is rendered by `Display`.

use thiserror::Error;

pub type WorkerResult<T> = Result<T, WorkerError>;

#[derive(Debug, Error)]
pub enum WorkerError {
    /// Checkpoint write rejected because the invocation lease was reassigned.
    /// Mapped to HTTP 409; the orchestrator decides what happens next.
    #[error("lock_lost")]
    LockLost,

    /// A run-scoped artifact (index, material metadata, chunk) is gone.
    /// Recoverable exactly once during chunking via the rebuild guard.
    #[error("artifact_missing: {path}")]
    ArtifactMissing { path: String },

    #[error("content_range_mismatch: {detail}")]
    ContentRangeMismatch { detail: String },

    #[error("cursor_regression: cursor {cursor} would move to {next}")]
    CursorRegression { cursor: u64, next: u64 },

    /// Partial-line carry outgrew its bound; the input has a pathological line.
    #[error("carry_overflow: carry of {size} bytes exceeds {limit}")]
    CarryOverflow { size: usize, limit: usize },

    #[error("range_request_failed: status {status}: {detail}")]
    RangeRequestFailed { status: u16, detail: String },

    #[error("chunk_limit_exceeded: {count} chunks, limit {limit}")]
    ChunkLimitExceeded { count: u32, limit: u32 },

    #[error("table_size_exceeded: {bytes} bytes, limit {limit}")]
    TableSizeExceeded { bytes: u64, limit: u64 },

    #[error("required_column_missing: {column} in {feed} feed")]
    RequiredColumnMissing {
        feed: &'static str,
        column: &'static str,
    },

    #[error("delimiter_undetectable: {feed} feed header")]
    DelimiterUndetectable { feed: &'static str },

    #[error("feed_missing: no {feed} feed found")]
    FeedMissing { feed: &'static str },

    #[error("header_absent: {feed} feed: {detail}")]
    HeaderAbsent {
        feed: &'static str,
        detail: String,
    },

    #[error("product_table_malformed: line {line}: {detail}")]
    ProductTableMalformed { line: usize, detail: String },

    #[error("pricing_config_invalid: {summary}")]
    PricingConfigInvalid { summary: String },

    #[error("template_digest_missing: {path}")]
    TemplateDigestMissing { path: String },

    #[error("template_digest_mismatch: {path}: expected {expected}, got {actual}")]
    TemplateDigestMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("template_empty: {path}")]
    TemplateEmpty { path: String },

    #[error("required_sheet_missing: {sheet}")]
    RequiredSheetMissing { sheet: String },

    #[error("headers_modified: {detail}")]
    HeadersModified { detail: String },

    #[error("styles_mismatch: xl/styles.xml differs from template")]
    StylesMismatch,

    #[error("freeze_pane_mismatch: <sheetViews> differs from template")]
    FreezePaneMismatch,

    #[error("protected_sheet_mismatch: {sheet}")]
    ProtectedSheetMismatch { sheet: String },

    #[error("export_validation_failed: {detail}")]
    ExportValidationFailed { detail: String },

    #[error("spreadsheet_malformed: {detail}")]
    SpreadsheetMalformed { detail: String },

    #[error("storage_error: {op} {bucket}/{path}: {detail}")]
    Storage {
        op: &'static str,
        bucket: String,
        path: String,
        detail: String,
    },

    #[error("checkpoint_rpc_error: {rpc}: {detail}")]
    CheckpointRpc {
        rpc: &'static str,
        detail: String,
    },

    #[error("invalid_request: {0}")]
    InvalidRequest(String),
}

impl WorkerError {
    /// Stable identifier written to `last_error` and returned to the
    /// orchestrator. Must stay in sync with the recovery-policy table.
    pub fn code(&self) -> &'static str {
        match self {
            Self::LockLost => "lock_lost",
            Self::ArtifactMissing { .. } => "artifact_missing",
            Self::ContentRangeMismatch { .. } => "content_range_mismatch",
            Self::CursorRegression { .. } => "cursor_regression",
            Self::CarryOverflow { .. } => "carry_overflow",
            Self::RangeRequestFailed { .. } => "range_request_failed",
            Self::ChunkLimitExceeded { .. } => "chunk_limit_exceeded",
            Self::TableSizeExceeded { .. } => "table_size_exceeded",
            Self::RequiredColumnMissing { .. } => "required_column_missing",
            Self::DelimiterUndetectable { .. } => "delimiter_undetectable",
            Self::FeedMissing { .. } => "feed_missing",
            Self::HeaderAbsent { .. } => "header_absent",
            Self::ProductTableMalformed { .. } => "product_table_malformed",
            Self::PricingConfigInvalid { .. } => "pricing_config_invalid",
            Self::TemplateDigestMissing { .. } => "template_digest_missing",
            Self::TemplateDigestMismatch { .. } => "template_digest_mismatch",
            Self::TemplateEmpty { .. } => "template_empty",
            Self::RequiredSheetMissing { .. } => "required_sheet_missing",
            Self::HeadersModified { .. } => "headers_modified",
            Self::StylesMismatch => "styles_mismatch",
            Self::FreezePaneMismatch => "freeze_pane_mismatch",
            Self::ProtectedSheetMismatch { .. } => "protected_sheet_mismatch",
            Self::ExportValidationFailed { .. } => "export_validation_failed",
            Self::SpreadsheetMalformed { .. } => "spreadsheet_malformed",
            Self::Storage { .. } => "storage_error",
            Self::CheckpointRpc { .. } => "checkpoint_rpc_error",
            Self::InvalidRequest(_) => "invalid_request",
        }
    }

    /// True for the one error the chunker may recover from, exactly once,
    /// by resetting the run to `pending`.
    pub fn is_artifact_missing(&self) -> bool {
        matches!(self, Self::ArtifactMissing { .. })
    }
}
