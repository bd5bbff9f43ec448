//! Intake validation for uploads and URL sources.
//!
//! Everything here runs before any side effect: a rejected upload is never
//! stored and a rejected URL never creates a Document.

use reqwest::Url;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::normalizer::{DocumentFormat, InputFile, PDF_MIME};
use crate::types::{AppError, AppResult};

const MAX_URL_LENGTH: usize = 2048;
const MAX_STEM_LENGTH: usize = 64;

/// Check size, then type, of an uploaded file. Returns the resolved format.
pub fn validate_upload(file: &InputFile, config: &PipelineConfig) -> AppResult<DocumentFormat> {
    let size = file.size();
    if size > config.max_upload_bytes {
        return Err(AppError::FileTooLarge {
            size,
            limit: config.max_upload_bytes,
        });
    }
    if size == 0 {
        return Err(AppError::Validation(format!("File '{}' is empty", file.name)));
    }

    let format = DocumentFormat::resolve(&file.mime_type, &file.name)?;
    if !config
        .allowed_mime_types
        .iter()
        .any(|allowed| allowed.eq_ignore_ascii_case(format.mime_type()))
    {
        return Err(AppError::UnsupportedFormat(format.mime_type().to_string()));
    }

    Ok(format)
}

/// Storage path of a normalized upload:
/// `{client_id}/{content hash prefix}_{sanitized stem}.pdf`.
///
/// The hash is taken over the original bytes, so re-uploading the same file
/// maps to the same path and can be registered idempotently.
pub fn upload_object_path(client_id: Uuid, original: &InputFile) -> String {
    let digest = Sha256::digest(&original.bytes);
    let hash = hex::encode(&digest[..8]);
    format!("{}/{}_{}.pdf", client_id, hash, sanitize_stem(original.stem()))
}

/// Storage path of a URL source converted to PDF.
pub fn converted_object_path(client_id: Uuid, document_id: Uuid) -> String {
    format!("{}/{}.pdf", client_id, document_id)
}

fn sanitize_stem(stem: &str) -> String {
    let cleaned: String = stem
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .take(MAX_STEM_LENGTH)
        .collect();
    let trimmed = cleaned.trim_matches('_');
    if trimmed.is_empty() {
        "document".to_string()
    } else {
        trimmed.to_string()
    }
}

/// A URL source after validation and classification.
#[derive(Debug, Clone, PartialEq)]
pub struct UrlIntake {
    /// The URL as submitted (normalized by the URL parser).
    pub source_ref: String,
    /// Export or download URL when the source is a Google share link.
    pub canonical_ref: Option<String>,
    pub document_type: &'static str,
    pub mime_type: String,
    /// Set when the linked file must be fetched and normalized to PDF first.
    pub conversion: Option<DocumentFormat>,
}

/// Parse `raw` as an absolute `http`/`https` URL.
pub fn validate_url(raw: &str) -> AppResult<Url> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(AppError::Validation("URL is required".to_string()));
    }
    if raw.len() > MAX_URL_LENGTH {
        return Err(AppError::Validation(format!(
            "URL is longer than {} characters",
            MAX_URL_LENGTH
        )));
    }

    let url = Url::parse(raw)
        .map_err(|e| AppError::Validation(format!("Invalid URL format '{}': {}", raw, e)))?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(AppError::Validation(format!(
            "Unsupported URL scheme '{}', expected http or https",
            url.scheme()
        )));
    }
    if url.host_str().map_or(true, |h| h.is_empty()) {
        return Err(AppError::Validation(format!("URL '{}' has no host", raw)));
    }

    Ok(url)
}

/// Validate and classify a URL source.
pub fn classify_url(raw: &str) -> AppResult<UrlIntake> {
    let url = validate_url(raw)?;
    let source_ref = url.to_string();

    if let Some(export) = google_export(&url)? {
        return Ok(UrlIntake {
            source_ref,
            canonical_ref: Some(export.url),
            document_type: export.document_type,
            mime_type: export.mime_type.to_string(),
            conversion: None,
        });
    }

    let filename = url
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .unwrap_or_default();

    let intake = match DocumentFormat::resolve("", filename) {
        Ok(DocumentFormat::Pdf) => UrlIntake {
            source_ref,
            canonical_ref: None,
            document_type: DocumentFormat::Pdf.document_type(),
            mime_type: PDF_MIME.to_string(),
            conversion: None,
        },
        Ok(DocumentFormat::Html) | Err(_) => UrlIntake {
            source_ref,
            canonical_ref: None,
            document_type: "web",
            mime_type: "text/html".to_string(),
            conversion: None,
        },
        Ok(format) => UrlIntake {
            source_ref,
            canonical_ref: None,
            document_type: format.document_type(),
            mime_type: format.mime_type().to_string(),
            conversion: Some(format),
        },
    };

    Ok(intake)
}

#[derive(Debug)]
struct GoogleExport {
    url: String,
    document_type: &'static str,
    mime_type: &'static str,
}

/// Rewrite Google Drive / Docs share links to a direct download or PDF
/// export URL. Returns `None` for any other host.
fn google_export(url: &Url) -> AppResult<Option<GoogleExport>> {
    let host = url.host_str().unwrap_or_default();
    let segments: Vec<&str> = url
        .path_segments()
        .map(|s| s.filter(|p| !p.is_empty()).collect())
        .unwrap_or_default();

    match host {
        "drive.google.com" => {
            if segments.first() == Some(&"drive") && segments.contains(&"folders") {
                return Err(AppError::Validation(
                    "Google Drive folders cannot be ingested, share individual files instead"
                        .to_string(),
                ));
            }

            let file_id = id_after_d(&segments).or_else(|| {
                url.query_pairs()
                    .find(|(key, _)| key == "id")
                    .map(|(_, value)| value.into_owned())
            });

            Ok(file_id.map(|id| GoogleExport {
                url: format!("https://drive.google.com/uc?export=download&id={}", id),
                document_type: "google_drive",
                mime_type: "application/octet-stream",
            }))
        }
        "docs.google.com" => {
            let (kind, document_type) = match segments.first() {
                Some(&"document") => ("document", "google_doc"),
                Some(&"spreadsheets") => ("spreadsheets", "google_sheet"),
                Some(&"presentation") => ("presentation", "google_slides"),
                _ => return Ok(None),
            };

            Ok(id_after_d(&segments).map(|id| GoogleExport {
                url: format!("https://docs.google.com/{}/d/{}/export?format=pdf", kind, id),
                document_type,
                mime_type: PDF_MIME,
            }))
        }
        _ => Ok(None),
    }
}

/// The path segment following `d`, as in `/file/d/{id}/view`.
fn id_after_d(segments: &[&str]) -> Option<String> {
    segments
        .iter()
        .position(|s| *s == "d")
        .and_then(|i| segments.get(i + 1))
        .map(|id| id.to_string())
}
