//! Feed header handling.
//!
//! Supplier feeds arrive with whatever delimiter and column naming the
//! supplier's export happens to use, so the header line is scored for its
//! delimiter and every required column is resolved through a per-column
//! alias list with a substring fallback.

use std::collections::HashMap;

use crate::error::{WorkerError, WorkerResult};

/// Candidate delimiters in tie-breaking order.
pub const CANDIDATE_DELIMITERS: [char; 4] = ['\t', ';', ',', '|'];

/// One resolvable column: canonical name plus the aliases seen in the wild.
pub struct ColumnSpec {
    pub canonical: &'static str,
    pub aliases: &'static [&'static str],
    pub required: bool,
}

pub const MATERIAL_COLUMNS: &[ColumnSpec] = &[
    ColumnSpec {
        canonical: "matnr",
        aliases: &["matnr", "materialnummer", "material", "artikelnummer", "artnr"],
        required: true,
    },
    ColumnSpec {
        canonical: "mpn",
        aliases: &["mpn", "herstellernummer", "hersteller-nr", "manufacturer part", "hst-nr"],
        required: true,
    },
    ColumnSpec {
        canonical: "ean",
        aliases: &["ean", "ean13", "gtin", "barcode"],
        required: true,
    },
    ColumnSpec {
        canonical: "desc",
        aliases: &["desc", "description", "bezeichnung", "beschreibung", "artikelbezeichnung"],
        required: true,
    },
];

pub const STOCK_COLUMNS: &[ColumnSpec] = &[
    ColumnSpec {
        canonical: "matnr",
        aliases: &["matnr", "materialnummer", "material", "artikelnummer", "artnr"],
        required: true,
    },
    ColumnSpec {
        canonical: "stock",
        aliases: &["stock", "bestand", "menge", "qty", "quantity", "verfuegbar"],
        required: true,
    },
];

pub const PRICE_COLUMNS: &[ColumnSpec] = &[
    ColumnSpec {
        canonical: "matnr",
        aliases: &["matnr", "materialnummer", "material", "artikelnummer", "artnr"],
        required: true,
    },
    ColumnSpec {
        canonical: "list_price",
        aliases: &["lp", "listenpreis", "listprice", "list price", "vk"],
        required: true,
    },
    ColumnSpec {
        canonical: "best_price",
        aliases: &["cbp", "bestpreis", "bestprice", "best price", "ek"],
        required: false,
    },
    ColumnSpec {
        canonical: "surcharge",
        aliases: &["sur", "zuschlag", "surcharge", "aufschlag"],
        required: false,
    },
];

pub const EAN_MAPPING_COLUMNS: &[ColumnSpec] = &[
    ColumnSpec {
        canonical: "mpn",
        aliases: &["mpn", "herstellernummer", "manufacturer part"],
        required: true,
    },
    ColumnSpec {
        canonical: "ean",
        aliases: &["ean", "ean13", "gtin", "barcode"],
        required: true,
    },
];

pub const STOCK_LOCATION_COLUMNS: &[ColumnSpec] = &[
    ColumnSpec {
        canonical: "matnr",
        aliases: &["matnr", "materialnummer", "material"],
        required: true,
    },
    ColumnSpec {
        canonical: "stock",
        aliases: &["stock", "bestand", "menge", "qty"],
        required: true,
    },
    ColumnSpec {
        canonical: "locationid",
        aliases: &["locationid", "location", "lagerort", "lager"],
        required: true,
    },
];

/// Resolved header: the winning delimiter plus canonical-name → column index.
#[derive(Debug, Clone)]
pub struct HeaderLayout {
    pub delimiter: char,
    columns: HashMap<&'static str, usize>,
}

impl HeaderLayout {
    pub fn column(&self, canonical: &str) -> Option<usize> {
        self.columns.get(canonical).copied()
    }

    /// Index of a column that resolution guaranteed to exist.
    pub fn required_column(&self, canonical: &str) -> usize {
        self.columns[canonical]
    }
}

/// Score each candidate delimiter by occurrence count in the first line;
/// highest count wins, ties broken in candidate order.
pub fn detect_delimiter(first_line: &str, feed: &'static str) -> WorkerResult<char> {
    let mut best: Option<(char, usize)> = None;
    for candidate in CANDIDATE_DELIMITERS {
        let count = first_line.matches(candidate).count();
        if count > 0 && best.map_or(true, |(_, c)| count > c) {
            best = Some((candidate, count));
        }
    }
    best.map(|(d, _)| d)
        .ok_or(WorkerError::DelimiterUndetectable { feed })
}

/// Case-folded, trimmed form used for all header comparisons.
fn normalize(cell: &str) -> String {
    cell.trim()
        .trim_matches('"')
        .trim_start_matches('\u{feff}')
        .trim()
        .to_lowercase()
}

/// Resolve every column of `specs` against a header line: exact normalized
/// alias match first, substring containment as the fallback. A missing
/// required column is fatal for the run.
pub fn resolve_header(
    header_line: &str,
    specs: &[ColumnSpec],
    feed: &'static str,
) -> WorkerResult<HeaderLayout> {
    let delimiter = detect_delimiter(header_line, feed)?;
    let cells: Vec<String> = header_line.split(delimiter).map(|c| normalize(c)).collect();

    let mut columns = HashMap::new();
    for spec in specs {
        let exact = cells
            .iter()
            .position(|cell| spec.aliases.iter().any(|alias| cell == alias));
        let resolved = exact.or_else(|| {
            cells.iter().position(|cell| {
                !cell.is_empty() && spec.aliases.iter().any(|alias| cell.contains(alias))
            })
        });
        match resolved {
            Some(idx) => {
                columns.insert(spec.canonical, idx);
            }
            None if spec.required => {
                return Err(WorkerError::RequiredColumnMissing {
                    feed,
                    column: spec.canonical,
                });
            }
            None => {}
        }
    }
    Ok(HeaderLayout { delimiter, columns })
}

/// Strip a UTF-8 byte-order mark, if present.
pub fn strip_bom(bytes: &[u8]) -> &[u8] {
    bytes.strip_prefix(b"\xef\xbb\xbf").unwrap_or(bytes)
}

/// Normalize CRLF and lone CR line endings to LF.
pub fn normalize_line_endings(text: &str) -> String {
    if text.contains('\r') {
        text.replace("\r\n", "\n").replace('\r', "\n")
    } else {
        text.to_string()
    }
}

/// Decode feed bytes as UTF-8, retrying lossily when the supplier export is
/// not clean UTF-8. Returns the text and whether the lossy retry was used.
pub fn decode_utf8_with_fallback(bytes: &[u8]) -> (String, bool) {
    match std::str::from_utf8(bytes) {
        Ok(text) => (text.to_string(), false),
        Err(_) => (String::from_utf8_lossy(bytes).into_owned(), true),
    }
}
