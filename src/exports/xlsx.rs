//! OOXML (xlsx) package layer.
//!
//! A workbook is treated as three observable layers: the raw ZIP part map,
//! selected XML parts as text, and parsed sheet data. Writing works by
//! splicing a regenerated `<sheetData>` element between the template part's
//! original prefix and suffix; every part that is not the data sheet is
//! carried over byte-for-byte. Marketplaces reject uploads that deviate in
//! invisible structural details (frozen panes, styles, protected sheets),
//! and the spreadsheet layer itself cannot observe those properties.

use std::collections::{BTreeMap, HashMap};
use std::io::{Cursor, Read, Write};

use quick_xml::escape::escape;
use quick_xml::events::Event;
use quick_xml::Reader;

use crate::error::{WorkerError, WorkerResult};

fn malformed(detail: impl Into<String>) -> WorkerError {
    WorkerError::SpreadsheetMalformed {
        detail: detail.into(),
    }
}

/// Value written into a data cell. EAN-like identifiers must go through
/// `Text` so they survive serialization without leading-zero loss.
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Text(String),
    Int(i64),
    Number(f64),
}

/// One generated cell: 1-based column, payload, optional style index.
#[derive(Debug, Clone)]
pub struct PreparedCell {
    pub column: u32,
    pub value: CellValue,
    pub style: Option<u32>,
}

/// One parsed cell of an existing sheet.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SheetCell {
    pub value: String,
    /// Raw `t` attribute (`s`, `str`, `inlineStr`, `n`, ...).
    pub cell_type: Option<String>,
    /// Raw `s` attribute (cell style index).
    pub style: Option<u32>,
}

/// Parsed sheet content, indexed `row → column → cell` (both 1-based).
#[derive(Debug, Default)]
pub struct SheetData {
    pub rows: BTreeMap<u32, BTreeMap<u32, SheetCell>>,
    pub dimension: Option<String>,
    /// True when a row limit stopped the parse early.
    pub truncated: bool,
}

impl SheetData {
    pub fn cell(&self, column: u32, row: u32) -> Option<&SheetCell> {
        self.rows.get(&row).and_then(|cells| cells.get(&column))
    }

    pub fn value_at(&self, column: u32, row: u32) -> &str {
        self.cell(column, row).map_or("", |c| c.value.as_str())
    }

    /// Dense value matrix of the first `rows` rows over `cols` columns,
    /// used for header snapshots.
    pub fn value_matrix(&self, rows: u32, cols: u32) -> Vec<Vec<String>> {
        (1..=rows)
            .map(|r| (1..=cols).map(|c| self.value_at(c, r).to_string()).collect())
            .collect()
    }

    /// Highest populated column in the given row.
    pub fn last_column(&self, row: u32) -> u32 {
        self.rows
            .get(&row)
            .and_then(|cells| cells.keys().next_back().copied())
            .unwrap_or(0)
    }
}

/// Number formats resolved per cell-style index.
#[derive(Debug, Default)]
pub struct StylesTable {
    formats: Vec<String>,
}

impl StylesTable {
    /// Format code of a cell style index; empty string when unknown.
    pub fn number_format(&self, style: u32) -> &str {
        self.formats
            .get(style as usize)
            .map_or("", |s| s.as_str())
    }

    /// First style index carrying exactly this format code.
    pub fn find_format(&self, code: &str) -> Option<u32> {
        self.formats.iter().position(|f| f == code).map(|i| i as u32)
    }
}

/// A workbook opened at package level.
pub struct XlsxPackage {
    part_order: Vec<String>,
    parts: HashMap<String, Vec<u8>>,
    sheet_names: Vec<String>,
    sheet_parts: HashMap<String, String>,
    shared_strings: Vec<String>,
}

impl XlsxPackage {
    pub fn open(bytes: &[u8]) -> WorkerResult<Self> {
        let mut archive = zip::ZipArchive::new(Cursor::new(bytes))
            .map_err(|e| malformed(format!("not a zip archive: {e}")))?;
        let mut part_order = Vec::with_capacity(archive.len());
        let mut parts = HashMap::with_capacity(archive.len());
        for index in 0..archive.len() {
            let mut file = archive
                .by_index(index)
                .map_err(|e| malformed(format!("zip entry {index}: {e}")))?;
            if file.is_dir() {
                continue;
            }
            let name = file.name().to_string();
            let mut buf = Vec::with_capacity(file.size() as usize);
            file.read_to_end(&mut buf)
                .map_err(|e| malformed(format!("zip entry {name}: {e}")))?;
            part_order.push(name.clone());
            parts.insert(name, buf);
        }

        let workbook = parts
            .get("xl/workbook.xml")
            .ok_or_else(|| malformed("xl/workbook.xml missing"))?;
        let sheets = parse_workbook_sheets(workbook)?;
        let rels = parts
            .get("xl/_rels/workbook.xml.rels")
            .ok_or_else(|| malformed("xl/_rels/workbook.xml.rels missing"))?;
        let rel_targets = parse_relationships(rels)?;

        let mut sheet_names = Vec::with_capacity(sheets.len());
        let mut sheet_parts = HashMap::with_capacity(sheets.len());
        for (name, rid) in sheets {
            let target = rel_targets.get(&rid).ok_or_else(|| {
                malformed(format!("sheet {name:?} references unknown relationship {rid}"))
            })?;
            let part = if let Some(stripped) = target.strip_prefix('/') {
                stripped.to_string()
            } else {
                format!("xl/{target}")
            };
            sheet_names.push(name.clone());
            sheet_parts.insert(name, part);
        }

        let shared_strings = match parts.get("xl/sharedStrings.xml") {
            Some(bytes) => parse_shared_strings(bytes)?,
            None => Vec::new(),
        };

        Ok(Self {
            part_order,
            parts,
            sheet_names,
            sheet_parts,
            shared_strings,
        })
    }

    pub fn sheet_names(&self) -> &[String] {
        &self.sheet_names
    }

    pub fn part(&self, path: &str) -> Option<&[u8]> {
        self.parts.get(path).map(|b| b.as_slice())
    }

    /// Worksheet part path for a sheet name, resolved through
    /// `xl/workbook.xml` and its relationships.
    pub fn sheet_part_path(&self, sheet: &str) -> WorkerResult<&str> {
        self.sheet_parts
            .get(sheet)
            .map(|s| s.as_str())
            .ok_or_else(|| WorkerError::RequiredSheetMissing {
                sheet: sheet.to_string(),
            })
    }

    pub fn sheet_part(&self, sheet: &str) -> WorkerResult<&[u8]> {
        let path = self.sheet_part_path(sheet)?;
        self.parts
            .get(path)
            .map(|b| b.as_slice())
            .ok_or_else(|| malformed(format!("worksheet part {path} missing")))
    }

    /// Parse one sheet's cells. `row_limit` stops the scan after that many
    /// rows so templates carrying tens of thousands of sample rows are never
    /// materialized.
    pub fn read_sheet(&self, sheet: &str, row_limit: Option<u32>) -> WorkerResult<SheetData> {
        let part = self.sheet_part(sheet)?;
        parse_sheet_data(part, &self.shared_strings, row_limit)
    }

    /// Number formats per cell-style index from `xl/styles.xml`.
    pub fn styles(&self) -> WorkerResult<StylesTable> {
        match self.parts.get("xl/styles.xml") {
            Some(bytes) => parse_styles(bytes),
            None => Ok(StylesTable::default()),
        }
    }

    /// Replace the data sheet's `<sheetData>`: the template's first
    /// `header_rows` row elements are carried over verbatim, the generated
    /// rows follow from `first_data_row` downward, and the declared
    /// dimension is updated to span exactly header plus written rows.
    pub fn replace_sheet_data(
        &mut self,
        sheet: &str,
        header_rows: u32,
        first_data_row: u32,
        rows: &[Vec<PreparedCell>],
        total_columns: u32,
    ) -> WorkerResult<()> {
        let path = self.sheet_part_path(sheet)?.to_string();
        let part = self
            .parts
            .get(&path)
            .ok_or_else(|| malformed(format!("worksheet part {path} missing")))?;

        let region = locate_sheet_data(part)?;
        let inner_base = region.inner.start;
        let header_slices = collect_row_slices(&part[region.inner.clone()], header_rows);

        let last_row = if rows.is_empty() {
            header_rows
        } else {
            first_data_row + rows.len() as u32 - 1
        };
        let dimension = format!("A1:{}{}", col_letter(total_columns), last_row.max(1));

        let mut rebuilt = Vec::with_capacity(part.len() / 2 + rows.len() * 64);
        rebuilt.extend_from_slice(&replace_dimension(&part[..region.open_start], &dimension));
        rebuilt.extend_from_slice(b"<sheetData>");
        for slice in &header_slices {
            rebuilt.extend_from_slice(&part[inner_base + slice.start..inner_base + slice.end]);
        }
        for (offset, cells) in rows.iter().enumerate() {
            let row_number = first_data_row + offset as u32;
            write_row_xml(&mut rebuilt, row_number, cells, total_columns);
        }
        rebuilt.extend_from_slice(b"</sheetData>");
        rebuilt.extend_from_slice(&part[region.suffix_start..]);

        self.parts.insert(path, rebuilt);
        Ok(())
    }

    /// Serialize back to xlsx bytes, parts in original archive order.
    pub fn to_bytes(&self) -> WorkerResult<Vec<u8>> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        let options = zip::write::FileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated);
        for name in &self.part_order {
            let bytes = self
                .parts
                .get(name)
                .ok_or_else(|| malformed(format!("part {name} vanished")))?;
            writer
                .start_file(name.as_str(), options)
                .map_err(|e| malformed(format!("zip write {name}: {e}")))?;
            writer
                .write_all(bytes)
                .map_err(|e| malformed(format!("zip write {name}: {e}")))?;
        }
        let cursor = writer
            .finish()
            .map_err(|e| malformed(format!("zip finish: {e}")))?;
        Ok(cursor.into_inner())
    }
}

/// Byte offsets of a part's `<sheetData>` element.
struct SheetDataRegion {
    open_start: usize,
    inner: std::ops::Range<usize>,
    suffix_start: usize,
}

fn locate_sheet_data(part: &[u8]) -> WorkerResult<SheetDataRegion> {
    let open_start = find_element_start(part, b"sheetData")
        .ok_or_else(|| malformed("worksheet has no <sheetData>"))?;
    let open_end = part[open_start..]
        .iter()
        .position(|&b| b == b'>')
        .map(|p| open_start + p)
        .ok_or_else(|| malformed("unterminated <sheetData> tag"))?;

    if part[open_end - 1] == b'/' {
        // Self-closing: no rows in the template.
        return Ok(SheetDataRegion {
            open_start,
            inner: open_end..open_end,
            suffix_start: open_end + 1,
        });
    }
    let close = find_subslice(part, b"</sheetData>", open_end)
        .ok_or_else(|| malformed("worksheet has no </sheetData>"))?;
    Ok(SheetDataRegion {
        open_start,
        inner: open_end + 1..close,
        suffix_start: close + b"</sheetData>".len(),
    })
}

/// Byte ranges (relative to `inner`'s base) of `<row>` elements whose `r`
/// attribute is at most `max_row`. Rows without an `r` attribute are counted
/// positionally.
fn collect_row_slices(inner: &[u8], max_row: u32) -> Vec<std::ops::Range<usize>> {
    let mut slices = Vec::new();
    let mut cursor = 0usize;
    let mut positional = 0u32;
    while let Some(start) = find_element_start_from(inner, b"row", cursor) {
        let open_end = match inner[start..].iter().position(|&b| b == b'>') {
            Some(p) => start + p,
            None => break,
        };
        let end = if inner[open_end - 1] == b'/' {
            open_end + 1
        } else {
            match find_subslice(inner, b"</row>", open_end) {
                Some(close) => close + b"</row>".len(),
                None => break,
            }
        };
        positional += 1;
        let number = row_number_attr(&inner[start..open_end]).unwrap_or(positional);
        if number <= max_row {
            slices.push(start..end);
        } else {
            break;
        }
        cursor = end;
    }
    slices
}

/// `r="N"` attribute inside a `<row ...` open tag.
fn row_number_attr(open_tag: &[u8]) -> Option<u32> {
    let text = std::str::from_utf8(open_tag).ok()?;
    let pos = text.find(" r=\"")?;
    let rest = &text[pos + 4..];
    let quote = rest.find('"')?;
    rest[..quote].parse().ok()
}

fn write_row_xml(out: &mut Vec<u8>, row: u32, cells: &[PreparedCell], total_columns: u32) {
    out.extend_from_slice(format!("<row r=\"{row}\" spans=\"1:{total_columns}\">").as_bytes());
    for cell in cells {
        let reference = cell_ref(cell.column, row);
        let style_attr = cell
            .style
            .map(|s| format!(" s=\"{s}\""))
            .unwrap_or_default();
        match &cell.value {
            CellValue::Text(value) => {
                if value.is_empty() {
                    continue;
                }
                let space = if value.trim().len() != value.len() {
                    " xml:space=\"preserve\""
                } else {
                    ""
                };
                out.extend_from_slice(
                    format!(
                        "<c r=\"{reference}\"{style_attr} t=\"inlineStr\"><is><t{space}>{}</t></is></c>",
                        escape(value.as_str())
                    )
                    .as_bytes(),
                );
            }
            CellValue::Int(value) => {
                out.extend_from_slice(
                    format!("<c r=\"{reference}\"{style_attr}><v>{value}</v></c>").as_bytes(),
                );
            }
            CellValue::Number(value) => {
                out.extend_from_slice(
                    format!("<c r=\"{reference}\"{style_attr}><v>{value}</v></c>").as_bytes(),
                );
            }
        }
    }
    out.extend_from_slice(b"</row>");
}

/// Rewrite `<dimension ref="...">` inside the worksheet prefix. Left alone
/// when the template has no dimension element.
fn replace_dimension(prefix: &[u8], dimension: &str) -> Vec<u8> {
    const NEEDLE: &[u8] = b"<dimension ref=\"";
    let Some(start) = find_subslice(prefix, NEEDLE, 0) else {
        return prefix.to_vec();
    };
    let value_start = start + NEEDLE.len();
    let Some(quote) = prefix[value_start..].iter().position(|&b| b == b'"') else {
        return prefix.to_vec();
    };
    let mut out = Vec::with_capacity(prefix.len() + dimension.len());
    out.extend_from_slice(&prefix[..value_start]);
    out.extend_from_slice(dimension.as_bytes());
    out.extend_from_slice(&prefix[value_start + quote..]);
    out
}

/// `<sheetViews>...</sheetViews>` slice of a worksheet part, located by
/// decoding only the XML prefix up to the `<sheetData` sentinel. The slice
/// carries the freeze-pane state.
pub fn extract_sheet_views(part: &[u8]) -> Option<&[u8]> {
    let sentinel = find_element_start(part, b"sheetData").unwrap_or(part.len());
    extract_element_slice(&part[..sentinel], b"sheetViews")
}

/// Raw slice of the first `<tag ...>...</tag>` (or self-closing) element.
pub fn extract_element_slice<'a>(xml: &'a [u8], tag: &[u8]) -> Option<&'a [u8]> {
    let start = find_element_start(xml, tag)?;
    let open_end = xml[start..].iter().position(|&b| b == b'>')? + start;
    if xml[open_end - 1] == b'/' {
        return Some(&xml[start..=open_end]);
    }
    let mut close_tag = Vec::with_capacity(tag.len() + 3);
    close_tag.extend_from_slice(b"</");
    close_tag.extend_from_slice(tag);
    close_tag.push(b'>');
    let close = find_subslice(xml, &close_tag, open_end)?;
    Some(&xml[start..close + close_tag.len()])
}

fn find_element_start(xml: &[u8], tag: &[u8]) -> Option<usize> {
    find_element_start_from(xml, tag, 0)
}

/// Position of `<tag` followed by a delimiter, so `<row` never matches
/// `<rowBreaks`.
fn find_element_start_from(xml: &[u8], tag: &[u8], from: usize) -> Option<usize> {
    let mut needle = Vec::with_capacity(tag.len() + 1);
    needle.push(b'<');
    needle.extend_from_slice(tag);
    let mut cursor = from;
    while let Some(pos) = find_subslice(xml, &needle, cursor) {
        let after = xml.get(pos + needle.len());
        match after {
            Some(&b) if b == b' ' || b == b'>' || b == b'/' || b == b'\t' || b == b'\r'
                || b == b'\n' =>
            {
                return Some(pos)
            }
            _ => cursor = pos + needle.len(),
        }
    }
    None
}

fn find_subslice(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if needle.is_empty() || haystack.len() < from + needle.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|p| p + from)
}

/// 1-based column index → letters (1 → A, 27 → AA).
pub fn col_letter(mut col: u32) -> String {
    let mut letters = Vec::new();
    while col > 0 {
        let rem = ((col - 1) % 26) as u8;
        letters.push(b'A' + rem);
        col = (col - 1) / 26;
    }
    letters.reverse();
    String::from_utf8(letters).unwrap_or_default()
}

pub fn cell_ref(col: u32, row: u32) -> String {
    format!("{}{row}", col_letter(col))
}

/// `BC12` → `(55, 12)`.
pub fn parse_cell_ref(reference: &str) -> Option<(u32, u32)> {
    let split = reference.find(|c: char| c.is_ascii_digit())?;
    let (letters, digits) = reference.split_at(split);
    if letters.is_empty() {
        return None;
    }
    let mut col = 0u32;
    for c in letters.chars() {
        let c = c.to_ascii_uppercase();
        if !c.is_ascii_uppercase() {
            return None;
        }
        col = col * 26 + (c as u32 - 'A' as u32 + 1);
    }
    Some((col, digits.parse().ok()?))
}

fn parse_workbook_sheets(xml: &[u8]) -> WorkerResult<Vec<(String, String)>> {
    let mut reader = Reader::from_reader(xml);
    let mut sheets = Vec::new();
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) if e.name().as_ref() == b"sheet" => {
                let mut name = None;
                let mut rid = None;
                for attr in e.attributes() {
                    let attr = attr.map_err(|e| malformed(format!("workbook.xml: {e}")))?;
                    match attr.key.as_ref() {
                        b"name" => {
                            name = Some(
                                attr.unescape_value()
                                    .map_err(|e| malformed(format!("workbook.xml: {e}")))?
                                    .into_owned(),
                            )
                        }
                        b"r:id" => {
                            rid = Some(
                                attr.unescape_value()
                                    .map_err(|e| malformed(format!("workbook.xml: {e}")))?
                                    .into_owned(),
                            )
                        }
                        _ => {}
                    }
                }
                if let (Some(name), Some(rid)) = (name, rid) {
                    sheets.push((name, rid));
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(malformed(format!("workbook.xml: {e}"))),
            _ => {}
        }
    }
    if sheets.is_empty() {
        return Err(malformed("workbook.xml declares no sheets"));
    }
    Ok(sheets)
}

fn parse_relationships(xml: &[u8]) -> WorkerResult<HashMap<String, String>> {
    let mut reader = Reader::from_reader(xml);
    let mut rels = HashMap::new();
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) | Ok(Event::Empty(e))
                if e.name().as_ref() == b"Relationship" =>
            {
                let mut id = None;
                let mut target = None;
                for attr in e.attributes() {
                    let attr = attr.map_err(|e| malformed(format!("workbook rels: {e}")))?;
                    match attr.key.as_ref() {
                        b"Id" => {
                            id = Some(
                                attr.unescape_value()
                                    .map_err(|e| malformed(format!("workbook rels: {e}")))?
                                    .into_owned(),
                            )
                        }
                        b"Target" => {
                            target = Some(
                                attr.unescape_value()
                                    .map_err(|e| malformed(format!("workbook rels: {e}")))?
                                    .into_owned(),
                            )
                        }
                        _ => {}
                    }
                }
                if let (Some(id), Some(target)) = (id, target) {
                    rels.insert(id, target);
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(malformed(format!("workbook rels: {e}"))),
            _ => {}
        }
    }
    Ok(rels)
}

fn parse_shared_strings(xml: &[u8]) -> WorkerResult<Vec<String>> {
    let mut reader = Reader::from_reader(xml);
    let mut strings = Vec::new();
    let mut current: Option<String> = None;
    let mut in_text = false;
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => match e.name().as_ref() {
                b"si" => current = Some(String::new()),
                b"t" => in_text = true,
                _ => {}
            },
            Ok(Event::Empty(e)) if e.name().as_ref() == b"si" => strings.push(String::new()),
            Ok(Event::Text(t)) if in_text => {
                if let Some(buf) = current.as_mut() {
                    buf.push_str(
                        &t.unescape()
                            .map_err(|e| malformed(format!("sharedStrings.xml: {e}")))?,
                    );
                }
            }
            Ok(Event::End(e)) => match e.name().as_ref() {
                b"t" => in_text = false,
                b"si" => {
                    if let Some(buf) = current.take() {
                        strings.push(buf);
                    }
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(malformed(format!("sharedStrings.xml: {e}"))),
            _ => {}
        }
    }
    Ok(strings)
}

/// Streaming state of one worksheet scan.
#[derive(Default)]
struct SheetScan {
    data: SheetData,
    current_row: u32,
    next_col: u32,
    cell_pos: Option<(u32, u32)>,
    cell_type: Option<String>,
    cell_style: Option<u32>,
    capture: Option<String>,
}

impl SheetScan {
    /// Handle an opening (or self-closing) tag. Returns true when the scan
    /// should stop because the row limit was reached.
    fn on_open(
        &mut self,
        e: &quick_xml::events::BytesStart<'_>,
        is_empty: bool,
        row_limit: Option<u32>,
        shared_strings: &[String],
    ) -> bool {
        match e.name().as_ref() {
            b"dimension" => {
                for attr in e.attributes().flatten() {
                    if attr.key.as_ref() == b"ref" {
                        self.data.dimension = attr.unescape_value().ok().map(|v| v.into_owned());
                    }
                }
            }
            b"row" => {
                let mut number = None;
                for attr in e.attributes().flatten() {
                    if attr.key.as_ref() == b"r" {
                        number = attr.unescape_value().ok().and_then(|v| v.parse::<u32>().ok());
                    }
                }
                self.current_row = number.unwrap_or(self.current_row + 1);
                self.next_col = 1;
                if let Some(limit) = row_limit {
                    if self.current_row > limit {
                        self.data.truncated = true;
                        return true;
                    }
                }
            }
            b"c" => {
                let mut pos = None;
                self.cell_type = None;
                self.cell_style = None;
                for attr in e.attributes().flatten() {
                    match attr.key.as_ref() {
                        b"r" => {
                            pos = attr.unescape_value().ok().and_then(|v| parse_cell_ref(&v));
                        }
                        b"t" => {
                            self.cell_type = attr.unescape_value().ok().map(|v| v.into_owned());
                        }
                        b"s" => {
                            self.cell_style =
                                attr.unescape_value().ok().and_then(|v| v.parse::<u32>().ok());
                        }
                        _ => {}
                    }
                }
                let (col, row) = pos.unwrap_or((self.next_col, self.current_row));
                self.next_col = col + 1;
                self.cell_pos = Some((col, row));
                if is_empty {
                    self.commit(String::new(), shared_strings);
                }
            }
            b"v" | b"t" => {
                if self.cell_pos.is_some() {
                    self.capture = Some(String::new());
                }
            }
            _ => {}
        }
        false
    }

    fn commit(&mut self, raw: String, shared_strings: &[String]) {
        store_cell(
            &mut self.data,
            self.cell_pos.take(),
            raw,
            self.cell_type.take(),
            self.cell_style.take(),
            shared_strings,
        );
    }
}

fn parse_sheet_data(
    part: &[u8],
    shared_strings: &[String],
    row_limit: Option<u32>,
) -> WorkerResult<SheetData> {
    let mut reader = Reader::from_reader(part);
    let mut scan = SheetScan {
        next_col: 1,
        ..SheetScan::default()
    };

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                if scan.on_open(&e, false, row_limit, shared_strings) {
                    break;
                }
            }
            Ok(Event::Empty(e)) => {
                if scan.on_open(&e, true, row_limit, shared_strings) {
                    break;
                }
            }
            Ok(Event::Text(t)) => {
                if scan.capture.is_some() {
                    let text = t
                        .unescape()
                        .map_err(|e| malformed(format!("worksheet: {e}")))?
                        .into_owned();
                    if let Some(buf) = scan.capture.as_mut() {
                        buf.push_str(&text);
                    }
                }
            }
            Ok(Event::End(e)) => match e.name().as_ref() {
                // Inline-string text commits at `</c>`; a `<v>` commits
                // immediately so the shared-string index resolves once.
                b"v" => {
                    if let Some(text) = scan.capture.take() {
                        scan.commit(text, shared_strings);
                    }
                }
                b"c" => {
                    if let Some(text) = scan.capture.take() {
                        scan.commit(text, shared_strings);
                    } else if scan.cell_pos.is_some() {
                        scan.commit(String::new(), shared_strings);
                    }
                }
                b"sheetData" => break,
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(malformed(format!("worksheet: {e}"))),
            _ => {}
        }
    }
    Ok(scan.data)
}

fn store_cell(
    data: &mut SheetData,
    pos: Option<(u32, u32)>,
    raw: String,
    cell_type: Option<String>,
    style: Option<u32>,
    shared_strings: &[String],
) {
    let Some((col, row)) = pos else { return };
    let value = match cell_type.as_deref() {
        Some("s") => raw
            .trim()
            .parse::<usize>()
            .ok()
            .and_then(|idx| shared_strings.get(idx).cloned())
            .unwrap_or_default(),
        _ => raw,
    };
    data.rows.entry(row).or_default().insert(
        col,
        SheetCell {
            value,
            cell_type,
            style,
        },
    );
}

/// Built-in OOXML number formats the exporter cares about.
fn builtin_format(id: u32) -> Option<&'static str> {
    match id {
        0 => Some("General"),
        1 => Some("0"),
        2 => Some("0.00"),
        9 => Some("0%"),
        10 => Some("0.00%"),
        49 => Some("@"),
        _ => None,
    }
}

fn parse_styles(xml: &[u8]) -> WorkerResult<StylesTable> {
    let mut reader = Reader::from_reader(xml);
    let mut custom: HashMap<u32, String> = HashMap::new();
    let mut formats = Vec::new();
    let mut in_cell_xfs = false;
    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) | Ok(Event::Empty(ref e)) => match e.name().as_ref() {
                b"numFmt" => {
                    let mut id = None;
                    let mut code = None;
                    for attr in e.attributes().flatten() {
                        match attr.key.as_ref() {
                            b"numFmtId" => {
                                id = attr
                                    .unescape_value()
                                    .ok()
                                    .and_then(|v| v.parse::<u32>().ok());
                            }
                            b"formatCode" => {
                                code = attr.unescape_value().ok().map(|v| v.into_owned());
                            }
                            _ => {}
                        }
                    }
                    if let (Some(id), Some(code)) = (id, code) {
                        custom.insert(id, code);
                    }
                }
                b"cellXfs" => in_cell_xfs = true,
                b"xf" if in_cell_xfs => {
                    let mut fmt_id = 0u32;
                    for attr in e.attributes().flatten() {
                        if attr.key.as_ref() == b"numFmtId" {
                            fmt_id = attr
                                .unescape_value()
                                .ok()
                                .and_then(|v| v.parse::<u32>().ok())
                                .unwrap_or(0);
                        }
                    }
                    let code = custom
                        .get(&fmt_id)
                        .map(|s| s.as_str())
                        .or_else(|| builtin_format(fmt_id))
                        .unwrap_or("");
                    formats.push(code.to_string());
                }
                _ => {}
            },
            Ok(Event::End(ref e)) if e.name().as_ref() == b"cellXfs" => in_cell_xfs = false,
            Ok(Event::Eof) => break,
            Err(e) => return Err(malformed(format!("styles.xml: {e}"))),
            _ => {}
        }
    }
    Ok(StylesTable { formats })
}
