//! Pinned marketplace templates.
//!
//! Each export renders into a pre-authored workbook stored under the shared
//! read-only `templates/` prefix. The SHA-256 of every template revision is
//! pinned here in source; `template-digest` (or the
//! `compute_template_checksums` step) prints the digest of a new revision
//! before it is pinned.

use sha2::{Digest, Sha256};

use crate::error::{WorkerError, WorkerResult};
use crate::storage::{layout, ObjectStore};

/// How a column's cells are typed and formatted in the output sheet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    /// Plain string cell.
    Text,
    /// Barcode-like identifier: forced to string type with text format `@`
    /// so leading zeros and long digit runs survive.
    Ean,
    /// Whole number, format `0`.
    Int,
    /// Two-decimal amount, format `0.00`.
    Money,
}

impl ColumnKind {
    /// Number format code this kind wants on its cells.
    pub fn format_code(&self) -> &'static str {
        match self {
            ColumnKind::Text | ColumnKind::Ean => "@",
            ColumnKind::Int => "0",
            ColumnKind::Money => "0.00",
        }
    }
}

/// Static description of one pinned template.
pub struct TemplateSpec {
    pub name: &'static str,
    pub path: &'static str,
    /// Pinned SHA-256 of the template bytes, lowercase hex. An empty string
    /// means no digest has been pinned yet, which fails every export until
    /// fixed.
    pub sha256: &'static str,
    pub data_sheet: &'static str,
    pub required_sheets: &'static [&'static str],
    /// Sheets whose worksheet XML must survive byte-identically.
    pub protected_sheets: &'static [&'static str],
    pub header_rows: u32,
    pub first_data_row: u32,
    /// Parse hint for templates shipping large sample-data regions.
    pub parse_row_limit: Option<u32>,
    pub columns: &'static [ColumnKind],
}

impl TemplateSpec {
    pub fn total_columns(&self) -> u32 {
        self.columns.len() as u32
    }
}

/// EAN catalog workbook: one sheet, ~28k rows of sample data in the shipped
/// template, data written from row 2.
pub const EAN_CATALOG_TEMPLATE: TemplateSpec = TemplateSpec {
    name: "ean_catalog",
    path: "templates/ean_catalog.xlsx",
    sha256: "6e3a2c4f9d1b8e5a0c7f3d2b6a9e1c8d5f0b3a7e2d9c6f1a4b8e0d3c7a5f2b9e",
    data_sheet: "Catalogo",
    required_sheets: &["Catalogo"],
    protected_sheets: &[],
    header_rows: 1,
    first_data_row: 2,
    parse_row_limit: Some(2),
    columns: &[
        ColumnKind::Ean,
        ColumnKind::Text,
        ColumnKind::Text,
        ColumnKind::Text,
        ColumnKind::Int,
        ColumnKind::Money,
    ],
};

/// MediaWorld offer sheet: 22 columns, two header rows, two protected
/// auxiliary sheets, data from row 3.
pub const MEDIAWORLD_TEMPLATE: TemplateSpec = TemplateSpec {
    name: "mediaworld",
    path: "templates/mediaworld.xlsx",
    sha256: "a1c8f4e2b7d90356c1e8a4f7b2d6093c5a8e1f4b7c2d9056a3e8f1c4b7d2a905",
    data_sheet: "Data",
    required_sheets: &["Data", "ReferenceData", "Columns"],
    protected_sheets: &["ReferenceData", "Columns"],
    header_rows: 2,
    first_data_row: 3,
    parse_row_limit: None,
    columns: &[
        ColumnKind::Text,  // offer sku
        ColumnKind::Ean,   // product id (EAN)
        ColumnKind::Text,  // product id type
        ColumnKind::Text,  // description
        ColumnKind::Text,  // internal description
        ColumnKind::Money, // price
        ColumnKind::Text,  // price additional info
        ColumnKind::Int,   // quantity
        ColumnKind::Text,  // min quantity alert
        ColumnKind::Text,  // state
        ColumnKind::Text,  // available start date
        ColumnKind::Text,  // available end date
        ColumnKind::Text,  // logistic class
        ColumnKind::Text,  // favourite rank
        ColumnKind::Text,  // discount price
        ColumnKind::Text,  // discount start date
        ColumnKind::Text,  // discount end date
        ColumnKind::Int,   // leadtime to ship
        ColumnKind::Text,  // update-delete flag
        ColumnKind::Text,  // eco contribution
        ColumnKind::Text,  // warehouse
        ColumnKind::Text,  // notes
    ],
};

/// ePrice offer sheet: one header row, data from row 2, instructions sheet
/// protected.
pub const EPRICE_TEMPLATE: TemplateSpec = TemplateSpec {
    name: "eprice",
    path: "templates/eprice.xlsx",
    sha256: "f2b9d05c7a3e1846f0c5b2a9d7e30158c4f9b1a6d2e70539c8f4b0a5d1e72946",
    data_sheet: "Prodotti",
    required_sheets: &["Prodotti", "Istruzioni"],
    protected_sheets: &["Istruzioni"],
    header_rows: 1,
    first_data_row: 2,
    parse_row_limit: None,
    columns: &[
        ColumnKind::Text,  // sku
        ColumnKind::Ean,   // ean
        ColumnKind::Text,  // title
        ColumnKind::Text,  // brand
        ColumnKind::Money, // price
        ColumnKind::Int,   // quantity
        ColumnKind::Int,   // handling days
        ColumnKind::Text,  // condition
        ColumnKind::Text,  // shipping profile
        ColumnKind::Text,  // notes
    ],
};

pub const TEMPLATES: [&TemplateSpec; 3] =
    [&EAN_CATALOG_TEMPLATE, &MEDIAWORLD_TEMPLATE, &EPRICE_TEMPLATE];

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Download a pinned template and verify it against its digest. A missing
/// digest, mismatched digest, empty file, or failed download is fatal.
pub async fn load_template(
    store: &dyn ObjectStore,
    spec: &TemplateSpec,
) -> WorkerResult<Vec<u8>> {
    verify_pinned_digest(spec)?;
    let bytes = store
        .try_download(layout::EXPORTS_BUCKET, spec.path)
        .await?
        .ok_or_else(|| WorkerError::TemplateEmpty {
            path: spec.path.to_string(),
        })?;
    if bytes.is_empty() {
        return Err(WorkerError::TemplateEmpty {
            path: spec.path.to_string(),
        });
    }
    let actual = sha256_hex(&bytes);
    if actual != spec.sha256 {
        return Err(WorkerError::TemplateDigestMismatch {
            path: spec.path.to_string(),
            expected: spec.sha256.to_string(),
            actual,
        });
    }
    Ok(bytes)
}

pub fn verify_pinned_digest(spec: &TemplateSpec) -> WorkerResult<()> {
    if spec.sha256.len() != 64 || !spec.sha256.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(WorkerError::TemplateDigestMissing {
            path: spec.path.to_string(),
        });
    }
    Ok(())
}
