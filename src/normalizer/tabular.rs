// Delimited and spreadsheet data laid out as aligned text columns

use std::io::Cursor;

use calamine::Reader;

use super::layout::COLUMNS;
use super::text::hard_split;
use crate::types::{AppError, AppResult};

/// Blanks between two columns.
const COLUMN_GAP: usize = 2;

/// One table: a CSV file or a single worksheet.
#[derive(Debug, Clone, PartialEq)]
pub struct Sheet {
    pub title: Option<String>,
    pub rows: Vec<Vec<String>>,
}

impl Sheet {
    pub fn untitled(rows: Vec<Vec<String>>) -> Self {
        Self { title: None, rows }
    }
}

/// Read delimited rows. Rows may have differing field counts; invalid UTF-8
/// is replaced rather than rejected.
pub fn read_delimited(bytes: &[u8], delimiter: u8) -> AppResult<Vec<Vec<String>>> {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(false)
        .flexible(true)
        .quoting(delimiter != b'\t')
        .from_reader(bytes);

    let mut rows = Vec::new();
    for record in reader.byte_records() {
        let record = record
            .map_err(|e| AppError::Validation(format!("Malformed delimited data: {}", e)))?;
        rows.push(
            record
                .iter()
                .map(|field| String::from_utf8_lossy(field).trim().to_string())
                .collect(),
        );
    }

    Ok(rows)
}

/// Read every worksheet of an XLSX (or legacy XLS) workbook.
pub fn read_spreadsheet(bytes: &[u8]) -> AppResult<Vec<Sheet>> {
    let mut workbook = calamine::open_workbook_auto_from_rs(Cursor::new(bytes))
        .map_err(|e| AppError::Validation(format!("Not a readable spreadsheet: {}", e)))?;

    let mut sheets = Vec::new();
    for name in workbook.sheet_names().to_vec() {
        let range = workbook
            .worksheet_range(&name)
            .map_err(|e| AppError::Validation(format!("Unreadable worksheet '{}': {}", name, e)))?;

        let rows = range
            .rows()
            .map(|row| row.iter().map(cell_text).collect::<Vec<_>>())
            .filter(|row: &Vec<String>| row.iter().any(|cell| !cell.is_empty()))
            .collect();

        sheets.push(Sheet {
            title: Some(name),
            rows,
        });
    }

    Ok(sheets)
}

fn cell_text(cell: &calamine::Data) -> String {
    match cell {
        calamine::Data::Empty => String::new(),
        calamine::Data::String(s) => s.trim().to_string(),
        calamine::Data::Float(f) => f.to_string(),
        calamine::Data::Int(i) => i.to_string(),
        calamine::Data::Bool(b) => b.to_string(),
        calamine::Data::DateTime(dt) => dt.to_string(),
        calamine::Data::DateTimeIso(s) | calamine::Data::DurationIso(s) => s.clone(),
        calamine::Data::Error(e) => format!("#{:?}", e),
    }
}

/// Lay sheets out as text lines: fields padded to their column width and
/// separated by at least two blanks, rows wider than the page wrapped.
pub fn layout_sheets(sheets: &[Sheet]) -> Vec<String> {
    let mut lines = Vec::new();

    for (index, sheet) in sheets.iter().enumerate() {
        if index > 0 {
            lines.push(String::new());
        }
        if let Some(title) = &sheet.title {
            lines.extend(hard_split(title, COLUMNS));
            lines.push(String::new());
        }

        let widths = column_widths(&sheet.rows);
        for row in &sheet.rows {
            lines.extend(hard_split(&format_row(row, &widths), COLUMNS));
        }
    }

    lines
}

fn column_widths(rows: &[Vec<String>]) -> Vec<usize> {
    let mut widths: Vec<usize> = Vec::new();
    for row in rows {
        for (i, field) in row.iter().enumerate() {
            let len = field.chars().count();
            match widths.get_mut(i) {
                Some(width) => *width = (*width).max(len),
                None => widths.push(len),
            }
        }
    }
    widths
}

fn format_row(row: &[String], widths: &[usize]) -> String {
    let mut line = String::new();
    for (i, field) in row.iter().enumerate() {
        if i > 0 {
            line.push_str(&" ".repeat(COLUMN_GAP));
        }
        line.push_str(field);
        let pad = widths.get(i).copied().unwrap_or(0).saturating_sub(field.chars().count());
        line.push_str(&" ".repeat(pad));
    }
    line.trim_end().to_string()
}
