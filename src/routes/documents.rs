use std::time::Duration;

use axum::{
    extract::{multipart::MultipartError, Multipart, Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use bytes::BytesMut;
use tracing::info;
use uuid::Uuid;

use crate::models::{
    AppState, ChunksResponse, DocumentQuery, DocumentResponse, UploadQuery, UrlSourceRequest,
};
use crate::normalizer::InputFile;
use crate::types::{AppError, AppResult};

/// Upper bound for `?wait_secs=`.
const MAX_WAIT_SECS: u64 = 60;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route(
            "/api/clients/{client_id}/documents",
            post(upload_document).get(list_documents),
        )
        .route("/api/clients/{client_id}/urls", post(add_url))
        .route("/api/documents/{id}", get(get_document).delete(delete_document))
        .route("/api/documents/{id}/chunks", get(get_chunks))
        .route("/api/documents/{id}/retry", post(retry_document))
        .with_state(state)
}

/// Body limit hits surface as a size error, anything else as a bad request.
fn multipart_error(e: MultipartError, size: u64, limit: u64, context: &str) -> AppError {
    if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
        AppError::FileTooLarge {
            size: size.max(limit.saturating_add(1)),
            limit,
        }
    } else {
        AppError::Validation(format!("{}: {}", context, e))
    }
}

fn accepted(created: bool) -> StatusCode {
    if created {
        StatusCode::ACCEPTED
    } else {
        StatusCode::OK
    }
}

async fn upload_document(
    State(state): State<AppState>,
    Path(client_id): Path<Uuid>,
    Query(query): Query<UploadQuery>,
    mut multipart: Multipart,
) -> AppResult<(StatusCode, Json<DocumentResponse>)> {
    let limit = state.pipeline.config().max_upload_bytes;
    let mut file = None;

    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|e| multipart_error(e, 0, limit, "Malformed multipart body"))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let name = field.file_name().unwrap_or("upload").to_string();
        let mime_type = field.content_type().unwrap_or_default().to_string();

        // stop reading as soon as the cap is crossed
        let mut bytes = BytesMut::new();
        while let Some(chunk) = field
            .chunk()
            .await
            .map_err(|e| multipart_error(e, bytes.len() as u64, limit, "Failed to read upload"))?
        {
            bytes.extend_from_slice(&chunk);
            if bytes.len() as u64 > limit {
                return Err(AppError::FileTooLarge {
                    size: bytes.len() as u64,
                    limit,
                });
            }
        }
        file = Some(InputFile::new(name, mime_type, bytes.freeze()));
        break;
    }

    let file = file.ok_or_else(|| AppError::Validation("Missing 'file' field".to_string()))?;
    info!(
        client_id = %client_id,
        file = %file.name,
        size = file.size(),
        "Upload received"
    );

    let idempotent = query.idempotent.unwrap_or(true);
    let (doc, created) = state
        .pipeline
        .ingest_upload(client_id, file, idempotent)
        .await?;

    Ok((accepted(created), Json(doc.into())))
}

async fn add_url(
    State(state): State<AppState>,
    Path(client_id): Path<Uuid>,
    Json(request): Json<UrlSourceRequest>,
) -> AppResult<(StatusCode, Json<DocumentResponse>)> {
    let idempotent = request.idempotent.unwrap_or(true);
    let (doc, created) = state
        .pipeline
        .ingest_url(client_id, &request.url, idempotent)
        .await?;

    Ok((accepted(created), Json(doc.into())))
}

async fn list_documents(
    State(state): State<AppState>,
    Path(client_id): Path<Uuid>,
) -> AppResult<Json<Vec<DocumentResponse>>> {
    let docs = state.pipeline.list_documents(client_id).await?;
    Ok(Json(docs.into_iter().map(DocumentResponse::from).collect()))
}

async fn get_document(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<DocumentQuery>,
) -> AppResult<Json<DocumentResponse>> {
    let wait = Duration::from_secs(query.wait_secs.unwrap_or(0).min(MAX_WAIT_SECS));
    let doc = state.pipeline.wait_for_terminal(id, wait).await?;
    Ok(Json(doc.into()))
}

async fn get_chunks(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<ChunksResponse>> {
    let chunks = state.pipeline.chunks(id).await?;
    Ok(Json(ChunksResponse {
        document_id: id,
        chunks,
    }))
}

async fn retry_document(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<(StatusCode, Json<DocumentResponse>)> {
    let doc = state.pipeline.retry_document(id).await?;
    Ok((StatusCode::ACCEPTED, Json(doc.into())))
}

async fn delete_document(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<StatusCode> {
    state.pipeline.remove_document(id).await?;
    Ok(StatusCode::NO_CONTENT)
}
