//! Format normalization.
//!
//! Every accepted source is turned into a PDF before it reaches the parsing
//! service. PDFs pass through untouched; text, markup and tabular formats are
//! reduced to lines of text and laid out on fixed-size monospace pages.

mod layout;
mod markup;
mod tabular;
mod text;

use bytes::Bytes;
use mime::Mime;

use crate::types::{AppError, AppResult};

pub use layout::{render_pages, COLUMNS, LINES_PER_PAGE};
pub use markup::{docx_to_text, html_to_text};
pub use tabular::{layout_sheets, read_delimited, read_spreadsheet, Sheet};
pub use text::{decode, reflow};

pub const PDF_MIME: &str = "application/pdf";
pub const DOCX_MIME: &str = "application/vnd.openxmlformats-officedocument.wordprocessingml.document";
pub const XLSX_MIME: &str = "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";

/// MIME types that say nothing about the content.
const GENERIC_MIME_TYPES: &[&str] = &[
    "application/octet-stream",
    "binary/octet-stream",
    "application/x-empty",
    "application/unknown",
];

/// An in-memory file as received at intake or fetched from a URL.
#[derive(Debug, Clone)]
pub struct InputFile {
    pub name: String,
    pub mime_type: String,
    pub bytes: Bytes,
}

impl InputFile {
    pub fn new(name: impl Into<String>, mime_type: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            mime_type: mime_type.into(),
            bytes: bytes.into(),
        }
    }

    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }

    /// File name without directories or extension.
    pub fn stem(&self) -> &str {
        let base = self.name.rsplit(['/', '\\']).next().unwrap_or(&self.name);
        match base.rsplit_once('.') {
            Some((stem, _)) if !stem.is_empty() => stem,
            _ => base,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFormat {
    Pdf,
    PlainText,
    Markdown,
    Docx,
    Html,
    Csv,
    Tsv,
    Xlsx,
}

impl DocumentFormat {
    /// Resolve the format from the declared MIME type, falling back to the
    /// file extension when the declared type is generic or missing.
    pub fn resolve(mime_type: &str, filename: &str) -> AppResult<Self> {
        let declared = essence(mime_type);
        let extension = filename
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase())
            .unwrap_or_default();

        let effective = match declared.as_deref() {
            None => guess(filename),
            Some(m) if GENERIC_MIME_TYPES.contains(&m) => guess(filename),
            // Windows browsers report CSV files as Excel
            Some("application/vnd.ms-excel") if extension == "csv" => Some("text/csv".to_string()),
            Some(m) => Some(m.to_string()),
        };

        let effective = effective.ok_or_else(|| {
            AppError::UnsupportedFormat(format!("cannot determine the type of '{}'", filename))
        })?;

        Self::from_mime(&effective).ok_or(AppError::UnsupportedFormat(effective))
    }

    fn from_mime(essence: &str) -> Option<Self> {
        let format = match essence {
            PDF_MIME => DocumentFormat::Pdf,
            "text/plain" => DocumentFormat::PlainText,
            "text/markdown" | "text/x-markdown" => DocumentFormat::Markdown,
            DOCX_MIME => DocumentFormat::Docx,
            "text/html" | "application/xhtml+xml" => DocumentFormat::Html,
            "text/csv" => DocumentFormat::Csv,
            "text/tab-separated-values" => DocumentFormat::Tsv,
            XLSX_MIME | "application/vnd.ms-excel" => DocumentFormat::Xlsx,
            _ => return None,
        };
        Some(format)
    }

    /// Canonical MIME type, used for the intake allow-list.
    pub fn mime_type(&self) -> &'static str {
        match self {
            DocumentFormat::Pdf => PDF_MIME,
            DocumentFormat::PlainText => "text/plain",
            DocumentFormat::Markdown => "text/markdown",
            DocumentFormat::Docx => DOCX_MIME,
            DocumentFormat::Html => "text/html",
            DocumentFormat::Csv => "text/csv",
            DocumentFormat::Tsv => "text/tab-separated-values",
            DocumentFormat::Xlsx => XLSX_MIME,
        }
    }

    /// Source classification recorded on the Document.
    pub fn document_type(&self) -> &'static str {
        match self {
            DocumentFormat::Pdf => "pdf",
            DocumentFormat::PlainText => "txt",
            DocumentFormat::Markdown => "md",
            DocumentFormat::Docx => "docx",
            DocumentFormat::Html => "html",
            DocumentFormat::Csv => "csv",
            DocumentFormat::Tsv => "tsv",
            DocumentFormat::Xlsx => "xlsx",
        }
    }
}

fn essence(mime_type: &str) -> Option<String> {
    mime_type
        .trim()
        .parse::<Mime>()
        .ok()
        .map(|m| m.essence_str().to_ascii_lowercase())
}

fn guess(filename: &str) -> Option<String> {
    mime_guess::from_path(filename)
        .first()
        .map(|m| m.essence_str().to_ascii_lowercase())
}

/// Convert `file` to its canonical PDF form.
///
/// PDF input is returned as-is, sharing the original buffer. Unsupported
/// types fail with `UnsupportedFormat`, malformed input of a supported type
/// with `Validation`.
pub fn normalize(file: InputFile) -> AppResult<InputFile> {
    let format = DocumentFormat::resolve(&file.mime_type, &file.name)?;

    let lines = match format {
        DocumentFormat::Pdf => {
            return Ok(InputFile {
                mime_type: PDF_MIME.to_string(),
                ..file
            })
        }
        DocumentFormat::PlainText | DocumentFormat::Markdown => {
            reflow(&decode(&file.bytes), COLUMNS)
        }
        DocumentFormat::Docx => reflow(&docx_to_text(&file.bytes)?, COLUMNS),
        DocumentFormat::Html => reflow(&html_to_text(&decode(&file.bytes)), COLUMNS),
        DocumentFormat::Csv => layout_sheets(&[Sheet::untitled(read_delimited(&file.bytes, b',')?)]),
        DocumentFormat::Tsv => layout_sheets(&[Sheet::untitled(read_delimited(&file.bytes, b'\t')?)]),
        DocumentFormat::Xlsx => layout_sheets(&read_spreadsheet(&file.bytes)?),
    };

    let pdf = render_pages(&lines)?;

    tracing::debug!(
        file = %file.name,
        format = format.document_type(),
        lines = lines.len(),
        pdf_bytes = pdf.len(),
        "Normalized document to PDF"
    );

    Ok(InputFile {
        name: format!("{}.pdf", file.stem()),
        mime_type: PDF_MIME.to_string(),
        bytes: Bytes::from(pdf),
    })
}

/// [`normalize`] on the blocking pool; page layout is CPU-bound.
pub async fn normalize_async(file: InputFile) -> AppResult<InputFile> {
    tokio::task::spawn_blocking(move || normalize(file))
        .await
        .map_err(|e| AppError::Internal(format!("Normalization task failed: {}", e)))?
}
