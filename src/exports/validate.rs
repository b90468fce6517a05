//! Export validation.
//!
//! Two layers. The ZIP-level integrity check compares raw parts between the
//! template and the serialized output: styles, protected auxiliary sheets,
//! and the data sheet's `<sheetViews>` (freeze panes) must be byte-identical.
//! The lightweight validation re-reads the output workbook and checks the
//! visible contract: sheet set, header values, autofilter, column widths,
//! number formats, and EAN cell discipline.

use sha2::{Digest, Sha256};

use crate::error::{WorkerError, WorkerResult};
use crate::exports::template::{ColumnKind, TemplateSpec};
use crate::exports::xlsx::{extract_element_slice, extract_sheet_views, XlsxPackage};

/// Byte-identity of a part, with a cheap length short-circuit before the
/// digest comparison.
fn parts_identical(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    Sha256::digest(a) == Sha256::digest(b)
}

/// ZIP/XML-level integrity: what the workbook layer cannot observe.
pub fn verify_package_integrity(
    template: &XlsxPackage,
    output: &XlsxPackage,
    spec: &TemplateSpec,
) -> WorkerResult<()> {
    let template_styles = template.part("xl/styles.xml").unwrap_or_default();
    let output_styles = output.part("xl/styles.xml").unwrap_or_default();
    if !parts_identical(template_styles, output_styles) {
        return Err(WorkerError::StylesMismatch);
    }

    for sheet in spec.protected_sheets {
        let template_part = template.sheet_part(sheet)?;
        let output_part = output.sheet_part(sheet)?;
        if !parts_identical(template_part, output_part) {
            return Err(WorkerError::ProtectedSheetMismatch {
                sheet: sheet.to_string(),
            });
        }
    }

    // Only the XML prefix up to the <sheetData> sentinel is decoded; the
    // data sheet body can run to tens of megabytes.
    let template_views = extract_sheet_views(template.sheet_part(spec.data_sheet)?);
    let output_views = extract_sheet_views(output.sheet_part(spec.data_sheet)?);
    if template_views != output_views {
        return Err(WorkerError::FreezePaneMismatch);
    }
    Ok(())
}

/// Lightweight validation of the reopened output workbook.
pub fn validate_export(
    template: &XlsxPackage,
    output: &XlsxPackage,
    spec: &TemplateSpec,
    header_snapshot: &[Vec<String>],
    data_row_count: u32,
) -> WorkerResult<()> {
    if template.sheet_names() != output.sheet_names() {
        return Err(WorkerError::ExportValidationFailed {
            detail: format!(
                "sheet set changed: template {:?}, output {:?}",
                template.sheet_names(),
                output.sheet_names()
            ),
        });
    }

    let columns = spec.total_columns();
    let read_limit = spec.first_data_row + data_row_count;
    let out_sheet = output.read_sheet(spec.data_sheet, Some(read_limit))?;
    let out_headers = out_sheet.value_matrix(spec.header_rows, columns);
    if out_headers != header_snapshot {
        return Err(WorkerError::ExportValidationFailed {
            detail: "header row values differ from template".to_string(),
        });
    }

    let template_part = template.sheet_part(spec.data_sheet)?;
    let output_part = output.sheet_part(spec.data_sheet)?;
    let template_filter = extract_element_slice(template_part, b"autoFilter");
    let output_filter = extract_element_slice(output_part, b"autoFilter");
    if template_filter != output_filter {
        return Err(WorkerError::ExportValidationFailed {
            detail: "autofilter range differs from template".to_string(),
        });
    }

    let template_cols = extract_element_slice(template_part, b"cols");
    let output_cols = extract_element_slice(output_part, b"cols");
    if template_cols != output_cols {
        return Err(WorkerError::ExportValidationFailed {
            detail: "column widths differ from template".to_string(),
        });
    }
    let count_cols = |slice: Option<&[u8]>| {
        slice.map_or(0usize, |s| {
            s.windows(4).filter(|w| w == b"<col").count()
        })
    };
    if count_cols(template_cols) != count_cols(output_cols) {
        return Err(WorkerError::ExportValidationFailed {
            detail: "column count differs from template".to_string(),
        });
    }

    // Number formats per data row: the template's own first data row (when
    // the template ships sample data) is the reference.
    let styles = output.styles()?;
    let template_sheet = template.read_sheet(spec.data_sheet, Some(spec.first_data_row))?;
    let sample_row_present = template_sheet
        .rows
        .contains_key(&spec.first_data_row);
    if sample_row_present {
        for offset in 0..data_row_count {
            let row = spec.first_data_row + offset;
            for col in 1..=columns {
                let Some(out_cell) = out_sheet.cell(col, row) else {
                    continue;
                };
                let Some(sample) = template_sheet.cell(col, spec.first_data_row) else {
                    continue;
                };
                let out_fmt = out_cell.style.map_or("", |s| styles.number_format(s));
                let sample_fmt = sample.style.map_or("", |s| styles.number_format(s));
                if out_fmt != sample_fmt {
                    return Err(WorkerError::ExportValidationFailed {
                        detail: format!(
                            "number format at row {row} col {col}: {out_fmt:?} != template {sample_fmt:?}"
                        ),
                    });
                }
            }
        }
    }

    // EAN discipline: string-typed cells with 12-14 digits, always.
    for (index, kind) in spec.columns.iter().enumerate() {
        if *kind != ColumnKind::Ean {
            continue;
        }
        let col = index as u32 + 1;
        for offset in 0..data_row_count {
            let row = spec.first_data_row + offset;
            let Some(cell) = out_sheet.cell(col, row) else {
                continue;
            };
            if !matches!(cell.cell_type.as_deref(), Some("inlineStr") | Some("str") | Some("s")) {
                return Err(WorkerError::ExportValidationFailed {
                    detail: format!("EAN cell at row {row} col {col} is not string-typed"),
                });
            }
            let digits = cell.value.len();
            if !(12..=14).contains(&digits) || !cell.value.chars().all(|c| c.is_ascii_digit()) {
                return Err(WorkerError::ExportValidationFailed {
                    detail: format!(
                        "EAN cell at row {row} col {col} is not a 12-14 digit string"
                    ),
                });
            }
        }
    }

    Ok(())
}
