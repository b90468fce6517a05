//! Marketplace export integrity and resolution flows.
//!
//! Templates here are synthetic but structurally faithful: frozen panes,
//! column widths, autofilter, protected auxiliary sheets, and a sample data
//! row carrying the number-format styles.

mod common;

use common::{build_xlsx, mediaworld_like_template, TestHarness};
use feedbridge_backend::config::FeeConfig;
use feedbridge_backend::exports::template::{sha256_hex, TemplateSpec, MEDIAWORLD_TEMPLATE};
use feedbridge_backend::exports::validate::verify_package_integrity;
use feedbridge_backend::exports::xlsx::{CellValue, XlsxPackage};
use feedbridge_backend::exports::{prepare_marketplace_rows, render_template_export};
use feedbridge_backend::models::StepStatus;
use feedbridge_backend::storage::layout;
use feedbridge_backend::Step;

fn test_spec(template: &[u8]) -> TemplateSpec {
    TemplateSpec {
        name: "mediaworld_test",
        path: "templates/test_mediaworld.xlsx",
        sha256: Box::leak(sha256_hex(template).into_boxed_str()),
        data_sheet: "Data",
        required_sheets: &["Data", "ReferenceData", "Columns"],
        protected_sheets: &["ReferenceData", "Columns"],
        header_rows: 2,
        first_data_row: 3,
        parse_row_limit: None,
        columns: MEDIAWORLD_TEMPLATE.columns,
    }
}

fn seed_template(harness: &TestHarness, spec: &TemplateSpec, bytes: &[u8]) {
    harness
        .store
        .put(layout::EXPORTS_BUCKET, spec.path, bytes.to_vec());
}

fn offer_cells(sku: &str, ean: &str, price: f64, qty: i64, lead: i64) -> Vec<CellValue> {
    let mut cells = vec![CellValue::Text(String::new()); 22];
    cells[0] = CellValue::Text(sku.to_string());
    cells[1] = CellValue::Text(ean.to_string());
    cells[2] = CellValue::Text("EAN".to_string());
    cells[5] = CellValue::Number(price);
    cells[7] = CellValue::Int(qty);
    cells[17] = CellValue::Int(lead);
    cells
}

#[tokio::test(flavor = "multi_thread")]
async fn empty_input_keeps_template_intact() {
    let harness = TestHarness::new();
    let template_bytes = mediaworld_like_template();
    let spec = test_spec(&template_bytes);
    seed_template(&harness, &spec, &template_bytes);

    let output = render_template_export(harness.store.as_ref(), &spec, &[])
        .await
        .unwrap();

    let template = XlsxPackage::open(&template_bytes).unwrap();
    let reopened = XlsxPackage::open(&output).unwrap();

    // Declared range spans exactly the two header rows.
    let sheet = reopened.read_sheet("Data", Some(2)).unwrap();
    assert_eq!(sheet.dimension.as_deref(), Some("A1:V2"));
    assert_eq!(sheet.value_at(1, 1), "Field 1");
    assert_eq!(sheet.value_at(22, 2), "field_22");
    // The template's sample row is cleared.
    let full = reopened.read_sheet("Data", None).unwrap();
    assert!(full.cell(1, 3).is_none());

    // styles.xml, both protected sheets, and the freeze-pane state are
    // byte-identical to the template.
    assert_eq!(
        reopened.part("xl/styles.xml").unwrap(),
        template.part("xl/styles.xml").unwrap()
    );
    for sheet_name in ["ReferenceData", "Columns"] {
        assert_eq!(
            reopened.sheet_part(sheet_name).unwrap(),
            template.sheet_part(sheet_name).unwrap()
        );
    }
    verify_package_integrity(&template, &reopened, &spec).unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn ean_cells_survive_as_strings_with_leading_zeros() {
    let harness = TestHarness::new();
    let template_bytes = mediaworld_like_template();
    let spec = test_spec(&template_bytes);
    seed_template(&harness, &spec, &template_bytes);

    let rows = vec![
        offer_cells("SKU-1", "0012345678905", 19.99, 4, 2),
        offer_cells("SKU-2", "4006381333931", 120.09, 2, 5),
    ];
    let output = render_template_export(harness.store.as_ref(), &spec, &rows)
        .await
        .unwrap();
    let reopened = XlsxPackage::open(&output).unwrap();
    let sheet = reopened.read_sheet("Data", None).unwrap();

    assert_eq!(sheet.value_at(2, 3), "0012345678905");
    assert_eq!(
        sheet.cell(2, 3).unwrap().cell_type.as_deref(),
        Some("inlineStr")
    );
    assert_eq!(sheet.value_at(8, 3), "4");
    assert_eq!(sheet.value_at(18, 4), "5");
    assert_eq!(sheet.dimension.as_deref(), Some("A1:V4"));

    // Data cells inherit the sample row's number-format styles.
    let styles = reopened.styles().unwrap();
    let price_style = sheet.cell(6, 3).unwrap().style.unwrap();
    assert_eq!(styles.number_format(price_style), "0.00");
    let qty_style = sheet.cell(8, 3).unwrap().style.unwrap();
    assert_eq!(styles.number_format(qty_style), "0");
}

#[tokio::test(flavor = "multi_thread")]
async fn exporting_twice_is_byte_identical() {
    let harness = TestHarness::new();
    let template_bytes = mediaworld_like_template();
    let spec = test_spec(&template_bytes);
    seed_template(&harness, &spec, &template_bytes);

    let rows = vec![offer_cells("SKU-1", "4006381333931", 10.0, 3, 1)];
    let first = render_template_export(harness.store.as_ref(), &spec, &rows)
        .await
        .unwrap();
    let second = render_template_export(harness.store.as_ref(), &spec, &rows)
        .await
        .unwrap();
    assert_eq!(first, second);
}

#[test]
fn tampered_parts_are_detected() {
    let template_bytes = mediaworld_like_template();
    let spec = test_spec(&template_bytes);
    let template = XlsxPackage::open(&template_bytes).unwrap();

    // Rebuild the package with one part swapped out.
    let tamper = |part: &str, content: &str| {
        let originals: Vec<(&str, String)> = [
            "[Content_Types].xml",
            "_rels/.rels",
            "xl/workbook.xml",
            "xl/_rels/workbook.xml.rels",
            "xl/styles.xml",
            "xl/worksheets/sheet1.xml",
            "xl/worksheets/sheet2.xml",
            "xl/worksheets/sheet3.xml",
        ]
        .into_iter()
        .map(|name| {
            let bytes = if name == part {
                content.as_bytes().to_vec()
            } else {
                template.part(name).unwrap().to_vec()
            };
            (name, String::from_utf8(bytes).unwrap())
        })
        .collect();
        let parts: Vec<(&str, &str)> = originals
            .iter()
            .map(|(name, content)| (*name, content.as_str()))
            .collect();
        XlsxPackage::open(&build_xlsx(&parts)).unwrap()
    };

    let styles_tampered = tamper(
        "xl/styles.xml",
        r#"<?xml version="1.0"?><styleSheet><cellXfs count="1"><xf numFmtId="0"/></cellXfs></styleSheet>"#,
    );
    assert_eq!(
        verify_package_integrity(&template, &styles_tampered, &spec)
            .unwrap_err()
            .code(),
        "styles_mismatch"
    );

    let protected_tampered = tamper(
        "xl/worksheets/sheet2.xml",
        r#"<?xml version="1.0"?><worksheet><sheetData><row r="1"><c r="A1" t="inlineStr"><is><t>edited</t></is></c></row></sheetData></worksheet>"#,
    );
    assert_eq!(
        verify_package_integrity(&template, &protected_tampered, &spec)
            .unwrap_err()
            .code(),
        "protected_sheet_mismatch"
    );

    let original_sheet =
        String::from_utf8(template.part("xl/worksheets/sheet1.xml").unwrap().to_vec()).unwrap();
    let views_tampered = tamper(
        "xl/worksheets/sheet1.xml",
        &original_sheet.replace("ySplit=\"2\"", "ySplit=\"1\""),
    );
    assert_eq!(
        verify_package_integrity(&template, &views_tampered, &spec)
            .unwrap_err()
            .code(),
        "freeze_pane_mismatch"
    );
}

fn marketplace_fee_config() -> FeeConfig {
    serde_json::from_value(serde_json::json!({
        "feeDrev": 0.05,
        "feeMkt": 0.08,
        "shippingCost": 0.0,
        "mediaworldIncludeEu": true,
        "mediaworldItPrepDays": 3,
        "mediaworldEuPrepDays": 5,
        "amazonFeeDrev": 0.05,
        "amazonFeeMkt": 0.15,
        "amazonItPrepDays": 2
    }))
    .unwrap()
}

fn seed_products(harness: &TestHarness, run_id: &str) {
    let table = concat!(
        "Matnr\tMPN\tEAN\tDesc\tStock\tLP\tCBP\tSur\n",
        "M1\tP-1\t4006381333931\tUSB cable\t5\t0\t10\t0\n",
        "M2\tP-2\t4006381333948\tHDMI cable\t2\t0\t20\t0\n",
        "M3\tP-3\t4006381333955\tPower strip\t4\t15\t0\t0\n",
    );
    harness
        .store
        .put(layout::EXPORTS_BUCKET, &layout::products_path(run_id), table);
}

#[tokio::test(flavor = "multi_thread")]
async fn marketplace_rows_resolve_stock_and_prices() {
    let harness = TestHarness::new();
    seed_products(&harness, "run-x");
    // M1: split 1 IT + 1 EU -> EU fallback, qty 2, lead 5.
    // M2: absent from the feed -> domestic fallback from the table (2).
    // M3: 4 IT but split disagrees with the table stock.
    harness.store.put(
        layout::IMPORT_BUCKET,
        &layout::stock_location_path("run-x"),
        "matnr;stock;locationid\nM1;1;4242\nM1;1;4254\nM3;3;4242\n",
    );

    let ctx = harness.ctx_with_fees("run-x", marketplace_fee_config());
    let fees = ctx
        .fees
        .resolve(feedbridge_backend::config::Marketplace::Mediaworld)
        .unwrap();
    let (rows, warnings) = prepare_marketplace_rows(&ctx, &fees).await.unwrap();

    assert_eq!(rows.len(), 3);
    let m1 = rows.iter().find(|r| r.product.matnr == "M1").unwrap();
    assert_eq!(m1.quantity, 2);
    assert_eq!(m1.lead_days, 5);
    assert_eq!(m1.source.as_str(), "EU_FALLBACK");
    // (10 + 0) * 1.05 * 1.08 = 11.34
    assert!((m1.price - 11.34).abs() < 1e-9);

    let m2 = rows.iter().find(|r| r.product.matnr == "M2").unwrap();
    assert_eq!(m2.quantity, 2);
    assert_eq!(m2.source.as_str(), "IT");

    let m3 = rows.iter().find(|r| r.product.matnr == "M3").unwrap();
    assert_eq!(m3.quantity, 3);
    assert_eq!(m3.lead_days, 3);

    assert_eq!(warnings.missing_row, 1);
    assert_eq!(warnings.split_disagreement, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn domestic_only_marketplace_skips_low_stock() {
    let harness = TestHarness::new();
    seed_products(&harness, "run-y");
    harness.store.put(
        layout::IMPORT_BUCKET,
        &layout::stock_location_path("run-y"),
        "matnr;stock;locationid\nM1;1;4242\nM1;4;4254\nM2;2;4242\nM3;4;4242\n",
    );

    let mut config = marketplace_fee_config();
    config.mediaworld_include_eu = Some(false);
    let ctx = harness.ctx_with_fees("run-y", config);
    let fees = ctx
        .fees
        .resolve(feedbridge_backend::config::Marketplace::Mediaworld)
        .unwrap();
    let (rows, _) = prepare_marketplace_rows(&ctx, &fees).await.unwrap();

    // M1 has only one domestic unit: not exported without the EU fallback.
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|r| r.product.matnr != "M1"));
}

#[tokio::test(flavor = "multi_thread")]
async fn amazon_step_writes_both_copies_and_metrics() {
    let harness = TestHarness::new();
    seed_products(&harness, "run-z");
    harness.store.put(
        layout::IMPORT_BUCKET,
        &layout::stock_location_path("run-z"),
        "matnr;stock;locationid\nM1;5;4242\nM2;2;4242\nM3;4;4242\n",
    );

    let ctx = harness.ctx_with_fees("run-z", marketplace_fee_config());
    let status = feedbridge_backend::api::routes::run_step(&ctx, Step::ExportAmazon)
        .await
        .unwrap();
    assert_eq!(status, StepStatus::Completed);

    let run_copy = harness
        .store
        .get(layout::EXPORTS_BUCKET, &layout::run_export_path("run-z", "amazon.tsv"))
        .unwrap();
    let flat_copy = harness.store.get(layout::EXPORTS_BUCKET, "amazon.tsv").unwrap();
    assert_eq!(run_copy, flat_copy);
    let text = String::from_utf8(run_copy).unwrap();
    assert!(text.starts_with("sku\tean\tquantity\tlead_days\tprice\n"));
    assert_eq!(text.lines().count(), 4);
    // Amazon prep days (2) flow into the lead column.
    assert!(text.lines().nth(1).unwrap().contains("\t2\t"));

    let metrics = harness.backend.metrics("run-z").unwrap();
    assert_eq!(metrics["amazonExported"], 3);
}

#[tokio::test(flavor = "multi_thread")]
async fn ean_tsv_step_skips_products_without_barcode() {
    let harness = TestHarness::new();
    let table = concat!(
        "Matnr\tMPN\tEAN\tDesc\tStock\tLP\tCBP\tSur\n",
        "M1\tP-1\t4006381333931\tUSB cable\t5\t0\t10\t0\n",
        "M2\tP-2\t\tNo barcode\t4\t0\t20\t0\n",
    );
    harness
        .store
        .put(layout::EXPORTS_BUCKET, &layout::products_path("run-w"), table);

    let ctx = harness.ctx("run-w");
    let status = feedbridge_backend::api::routes::run_step(&ctx, Step::ExportEan)
        .await
        .unwrap();
    assert_eq!(status, StepStatus::Completed);

    let text = String::from_utf8(
        harness
            .store
            .get(layout::EXPORTS_BUCKET, "ean_catalog.tsv")
            .unwrap(),
    )
    .unwrap();
    assert_eq!(text.lines().count(), 2);
    assert!(text.contains("4006381333931\tM1\t"));
    assert_eq!(harness.backend.metrics("run-w").unwrap()["eanExported"], 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn ean_xlsx_row_limit_ignores_sample_rows() {
    // A template whose sheet carries sample rows beyond the parse limit:
    // the snapshot and styles must come from the header region only.
    let harness = TestHarness::new();
    let template_bytes = mediaworld_like_template();
    let mut spec = test_spec(&template_bytes);
    spec.parse_row_limit = Some(3);
    seed_template(&harness, &spec, &template_bytes);

    let output = render_template_export(
        harness.store.as_ref(),
        &spec,
        &[offer_cells("SKU-9", "4006381333931", 5.0, 2, 1)],
    )
    .await
    .unwrap();
    let reopened = XlsxPackage::open(&output).unwrap();
    let sheet = reopened.read_sheet("Data", None).unwrap();
    assert_eq!(sheet.value_at(1, 3), "SKU-9");
}
