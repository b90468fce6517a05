//! Shared fixtures for the integration tests.
//!
//! Everything runs against the in-memory object store and checkpoint
//! backend, so whole pipeline runs execute without a network.

#![allow(dead_code)]

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use feedbridge_backend::checkpoint::{CheckpointStore, Lease, MemoryCheckpointBackend};
use feedbridge_backend::config::FeeConfig;
use feedbridge_backend::context::StepContext;
use feedbridge_backend::models::{InvocationBudget, StepStatus};
use feedbridge_backend::parse_merge;
use feedbridge_backend::storage::{layout, MemoryObjectStore};

pub struct TestHarness {
    pub store: Arc<MemoryObjectStore>,
    pub backend: Arc<MemoryCheckpointBackend>,
    pub checkpoints: CheckpointStore,
}

impl TestHarness {
    pub fn new() -> Self {
        let store = Arc::new(MemoryObjectStore::new());
        let backend = Arc::new(MemoryCheckpointBackend::new());
        let checkpoints = CheckpointStore::new(backend.clone());
        Self {
            store,
            backend,
            checkpoints,
        }
    }

    /// Fresh context for one invocation, matching the production default
    /// soft budget.
    pub fn ctx(&self, run_id: &str) -> StepContext {
        self.ctx_with_budget(run_id, Duration::from_secs(8))
    }

    pub fn ctx_with_budget(&self, run_id: &str, budget: Duration) -> StepContext {
        StepContext {
            run_id: run_id.to_string(),
            lease: Lease::new("test-lease"),
            store: self.store.clone(),
            checkpoints: self.checkpoints.clone(),
            budget: InvocationBudget::new(budget),
            fees: FeeConfig::default(),
        }
    }

    pub fn ctx_with_fees(&self, run_id: &str, fees: FeeConfig) -> StepContext {
        StepContext {
            fees,
            ..self.ctx(run_id)
        }
    }

    /// Drive parse_merge to a terminal status, one fresh invocation at a
    /// time. Panics if the run does not settle within `max_invocations`.
    pub async fn drive_parse_merge(&self, run_id: &str, max_invocations: usize) -> StepStatus {
        self.drive_parse_merge_budget(run_id, max_invocations, Duration::from_secs(8))
            .await
    }

    pub async fn drive_parse_merge_budget(
        &self,
        run_id: &str,
        max_invocations: usize,
        budget: Duration,
    ) -> StepStatus {
        for _ in 0..max_invocations {
            let ctx = self.ctx_with_budget(run_id, budget);
            let status = parse_merge::run(&ctx).await.unwrap();
            if status.is_terminal() {
                return status;
            }
        }
        panic!("parse_merge did not settle within {max_invocations} invocations");
    }

    pub fn seed_material(&self, body: &str) {
        self.store
            .put(layout::IMPORT_BUCKET, "material/latest.txt", body);
    }

    pub fn seed_stock(&self, body: &str) {
        self.store.put(layout::IMPORT_BUCKET, "stock/latest.csv", body);
    }

    pub fn seed_price(&self, body: &str) {
        self.store.put(layout::IMPORT_BUCKET, "price/latest.csv", body);
    }

    pub fn products_tsv(&self, run_id: &str) -> Option<String> {
        self.store
            .get(layout::EXPORTS_BUCKET, &layout::products_path(run_id))
            .map(|b| String::from_utf8(b).unwrap())
    }

    pub fn checkpoint_json(&self, run_id: &str) -> serde_json::Value {
        self.backend
            .step_state(run_id, "parse_merge")
            .expect("checkpoint exists")
    }
}

/// Standard three-row feed set from the happy-path scenario: `M1` and `M3`
/// survive, `M2` is dropped for low stock.
pub fn seed_small_feed_set(harness: &TestHarness) {
    harness.seed_material(
        "matnr;mpn;ean;desc\nM1;P-1;4006381333931;USB cable\nM2;P-2;4006381333948;HDMI cable\nM3;P-3;4006381333955;Power strip\n",
    );
    harness.seed_stock("matnr;stock\nM1;5\nM2;1\nM3;10\n");
    harness.seed_price("matnr;lp;cbp;sur\nM1;0;8;0\nM2;0;8;0\nM3;12;0;0\n");
}

/// Build a synthetic xlsx package from `(part_path, xml)` pairs.
pub fn build_xlsx(parts: &[(&str, &str)]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    let options =
        zip::write::FileOptions::default().compression_method(zip::CompressionMethod::Deflated);
    for (name, content) in parts {
        writer.start_file(*name, options).unwrap();
        writer.write_all(content.as_bytes()).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

/// A MediaWorld-shaped template: 22 columns, two header rows, a frozen
/// pane, one sample data row, and two protected auxiliary sheets.
pub fn mediaworld_like_template() -> Vec<u8> {
    let mut header1 = String::new();
    let mut header2 = String::new();
    for col in 1..=22u32 {
        let letter = col_letter(col);
        header1.push_str(&format!(
            r#"<c r="{letter}1" t="inlineStr"><is><t>Field {col}</t></is></c>"#
        ));
        header2.push_str(&format!(
            r#"<c r="{letter}2" t="inlineStr"><is><t>field_{col}</t></is></c>"#
        ));
    }
    let sample = concat!(
        r#"<row r="3">"#,
        r#"<c r="A3" s="1" t="inlineStr"><is><t>SKU-SAMPLE</t></is></c>"#,
        r#"<c r="B3" s="1" t="inlineStr"><is><t>4006381333931</t></is></c>"#,
        r#"<c r="F3" s="3"><v>9.99</v></c>"#,
        r#"<c r="H3" s="2"><v>5</v></c>"#,
        r#"<c r="R3" s="2"><v>2</v></c>"#,
        r#"</row>"#,
    );
    let data_sheet = format!(
        concat!(
            r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>"#,
            r#"<worksheet xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main">"#,
            r#"<dimension ref="A1:V3"/>"#,
            r#"<sheetViews><sheetView workbookViewId="0"><pane ySplit="2" topLeftCell="A3" activePane="bottomLeft" state="frozen"/></sheetView></sheetViews>"#,
            r#"<cols><col min="1" max="22" width="14.0" customWidth="1"/></cols>"#,
            r#"<sheetData><row r="1">{header1}</row><row r="2">{header2}</row>{sample}</sheetData>"#,
            r#"<autoFilter ref="A2:V2"/>"#,
            r#"</worksheet>"#,
        ),
        header1 = header1,
        header2 = header2,
        sample = sample,
    );
    let aux_sheet = |title: &str| {
        format!(
            concat!(
                r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>"#,
                r#"<worksheet xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main">"#,
                r#"<sheetData><row r="1"><c r="A1" t="inlineStr"><is><t>{title}</t></is></c></row></sheetData>"#,
                r#"</worksheet>"#,
            ),
            title = title,
        )
    };
    let workbook = concat!(
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>"#,
        r#"<workbook xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main" xmlns:r="http://schemas.openxmlformats.org/officeDocument/2006/relationships">"#,
        r#"<sheets>"#,
        r#"<sheet name="Data" sheetId="1" r:id="rId1"/>"#,
        r#"<sheet name="ReferenceData" sheetId="2" r:id="rId2"/>"#,
        r#"<sheet name="Columns" sheetId="3" r:id="rId3"/>"#,
        r#"</sheets>"#,
        r#"</workbook>"#,
    );
    let rels = concat!(
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>"#,
        r#"<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships">"#,
        r#"<Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/worksheet" Target="worksheets/sheet1.xml"/>"#,
        r#"<Relationship Id="rId2" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/worksheet" Target="worksheets/sheet2.xml"/>"#,
        r#"<Relationship Id="rId3" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/worksheet" Target="worksheets/sheet3.xml"/>"#,
        r#"</Relationships>"#,
    );
    let styles = concat!(
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>"#,
        r#"<styleSheet xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main">"#,
        r#"<cellXfs count="4">"#,
        r#"<xf numFmtId="0"/>"#,
        r#"<xf numFmtId="49" applyNumberFormat="1"/>"#,
        r#"<xf numFmtId="1" applyNumberFormat="1"/>"#,
        r#"<xf numFmtId="2" applyNumberFormat="1"/>"#,
        r#"</cellXfs>"#,
        r#"</styleSheet>"#,
    );
    let content_types = concat!(
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>"#,
        r#"<Types xmlns="http://schemas.openxmlformats.org/package/2006/content-types">"#,
        r#"<Default Extension="xml" ContentType="application/xml"/>"#,
        r#"</Types>"#,
    );
    let root_rels = concat!(
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>"#,
        r#"<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships">"#,
        r#"<Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/officeDocument" Target="xl/workbook.xml"/>"#,
        r#"</Relationships>"#,
    );

    build_xlsx(&[
        ("[Content_Types].xml", content_types),
        ("_rels/.rels", root_rels),
        ("xl/workbook.xml", workbook),
        ("xl/_rels/workbook.xml.rels", rels),
        ("xl/styles.xml", styles),
        ("xl/worksheets/sheet1.xml", &data_sheet),
        ("xl/worksheets/sheet2.xml", &aux_sheet("reference")),
        ("xl/worksheets/sheet3.xml", &aux_sheet("columns")),
    ])
}

fn col_letter(mut col: u32) -> String {
    let mut letters = Vec::new();
    while col > 0 {
        letters.push(b'A' + ((col - 1) % 26) as u8);
        col = (col - 1) / 26;
    }
    letters.reverse();
    String::from_utf8(letters).unwrap()
}
