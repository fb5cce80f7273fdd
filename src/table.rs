use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use scraper::{ElementRef, Html, Selector};
use tracing::debug;

use crate::config::NO_RESULTS_SENTINEL;
use crate::error::{Result, ScrapeError};

static TABLE: LazyLock<Selector> = LazyLock::new(|| Selector::parse(".tabela").unwrap());
static HEADER_CELLS: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(".titulo_cabecalho th").unwrap());
static ROW: LazyLock<Selector> = LazyLock::new(|| Selector::parse("tr").unwrap());
static TH: LazyLock<Selector> = LazyLock::new(|| Selector::parse("th").unwrap());
static TD: LazyLock<Selector> = LazyLock::new(|| Selector::parse("td").unwrap());
static ANCHOR: LazyLock<Selector> = LazyLock::new(|| Selector::parse("a[href]").unwrap());

pub const URL_KEY: &str = "url";
pub const ORG_KEY: &str = "cod_orgao_superior";
const DOCUMENT_COLUMN: &str = "Documento";

/// One `<td>`, detached from the document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawCell {
    pub text: String,
    pub href: Option<String>,
}

pub type RawRow = Vec<RawCell>;

#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Text(String),
    Amount(f64),
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Text(s) => f.write_str(s),
            FieldValue::Amount(v) => write!(f, "{:.2}", v),
        }
    }
}

/// Column label -> value, plus the derived `url` / `cod_orgao_superior` keys.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultRecord {
    fields: HashMap<String, FieldValue>,
}

impl ResultRecord {
    pub fn get(&self, key: &str) -> Option<&FieldValue> {
        self.fields.get(key)
    }

    pub fn text(&self, key: &str) -> Option<&str> {
        match self.fields.get(key)? {
            FieldValue::Text(s) => Some(s),
            FieldValue::Amount(_) => None,
        }
    }

    pub fn insert(&mut self, key: impl Into<String>, value: FieldValue) {
        self.fields.insert(key.into(), value);
    }
}

/// Locate the results table and pull out its header and rows.
///
/// `header` is reused when given; otherwise it is read from the
/// `titulo_cabecalho` row (falling back to the first row's `th` cells).
/// Returns `None` when there is no table or it has no rows.
pub fn parse_results_page(html: &str, header: Option<&[String]>) -> Option<(Vec<String>, Vec<RawRow>)> {
    let doc = Html::parse_document(html);
    let Some(table) = doc.select(&TABLE).next() else {
        debug!("Results table missing");
        return None;
    };

    let header = match header {
        Some(h) => h.to_vec(),
        None => detect_header(table)?,
    };

    let rows: Vec<RawRow> = table.select(&ROW).map(raw_row).collect();
    if rows.is_empty() {
        debug!("Results table has no rows");
        return None;
    }
    Some((header, rows))
}

fn detect_header(table: ElementRef) -> Option<Vec<String>> {
    let mut labels: Vec<String> = table.select(&HEADER_CELLS).map(header_label).collect();
    if labels.is_empty() {
        let first = table.select(&ROW).next()?;
        labels = first.select(&TH).map(header_label).collect();
    }
    (!labels.is_empty()).then_some(labels)
}

// Labels lose every space so they stay stable as CSV column names.
fn header_label(th: ElementRef) -> String {
    th.text()
        .collect::<String>()
        .replace(['\r', '\n', ' ', '\u{a0}'], "")
        .replace("&nbsp", "")
}

fn raw_row(tr: ElementRef) -> RawRow {
    tr.select(&TD)
        .map(|td| RawCell {
            text: td.text().collect(),
            href: td
                .select(&ANCHOR)
                .next()
                .and_then(|a| a.value().attr("href"))
                .map(str::to_string),
        })
        .collect()
}

/// Label each row with the header, coercing "valor" columns to amounts.
///
/// The first row repeats the header and is skipped. The `Documento`
/// column also yields the detail `url` and the organization code.
pub fn normalize_rows(
    header: &[String],
    rows: &[RawRow],
    org: &str,
    base_url: &str,
) -> Result<Vec<ResultRecord>> {
    let mut records = Vec::with_capacity(rows.len().saturating_sub(1));
    for row in rows.iter().skip(1) {
        let mut record = ResultRecord::default();
        for (label, cell) in header.iter().zip(row) {
            let text = cell.text.replace(['\n', '\r'], "").trim().to_string();
            let value = if label.to_lowercase().contains("valor") {
                FieldValue::Amount(parse_currency(label, &text)?)
            } else {
                FieldValue::Text(text)
            };
            record.insert(label.clone(), value);

            if label == DOCUMENT_COLUMN {
                if let Some(href) = &cell.href {
                    record.insert(URL_KEY, FieldValue::Text(format!("{}{}", base_url, href)));
                }
                record.insert(ORG_KEY, FieldValue::Text(org.to_string()));
            }
        }
        records.push(record);
    }
    Ok(records)
}

/// Brazilian-formatted amount, e.g. `R$ 1.234,56(*)` -> 1234.56.
pub fn parse_currency(column: &str, text: &str) -> Result<f64> {
    let cleaned = text
        .trim()
        .trim_end_matches("(*)")
        .trim()
        .trim_start_matches("R$")
        .replace([' ', '\u{a0}'], "");
    let normalized = if cleaned.contains(',') {
        cleaned.replace('.', "").replace(',', ".")
    } else {
        cleaned
    };
    normalized.parse::<f64>().map_err(|_| ScrapeError::Currency {
        column: column.to_string(),
        value: text.to_string(),
    })
}

pub fn output_name(org: &str, year: i32, month: u32, page: u32) -> String {
    format!("{}_{}{:02}_{}.csv", org, year, month, page)
}

/// Write one page of records as CSV under `dir`.
///
/// Returns `None` without touching the disk when the page only carries
/// the portal's "no document matches" sentinel.
pub fn save_results(
    dir: &Path,
    org: &str,
    year: i32,
    month: u32,
    page: u32,
    header: &[String],
    records: &[ResultRecord],
) -> Result<Option<PathBuf>> {
    let Some(first) = records.first() else {
        debug!("No records for {} page {}", org, page);
        return Ok(None);
    };
    let first_cell = header.first().and_then(|h| first.text(h)).unwrap_or_default();
    if first_cell.contains(NO_RESULTS_SENTINEL) {
        debug!("{}", NO_RESULTS_SENTINEL);
        return Ok(None);
    }

    let path = dir.join(output_name(org, year, month, page));
    let mut columns: Vec<&str> = header.iter().map(String::as_str).collect();
    columns.extend([URL_KEY, ORG_KEY]);

    let mut writer = csv::Writer::from_path(&path)?;
    writer.write_record(&columns)?;
    for record in records {
        writer.write_record(
            columns
                .iter()
                .map(|c| record.get(c).map(|v| v.to_string()).unwrap_or_default()),
        )?;
    }
    writer.flush()?;
    Ok(Some(path))
}
