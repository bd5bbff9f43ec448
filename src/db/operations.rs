use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use super::{DocumentStore, PatchOutcome};
use crate::models::{Chunk, Document, DocumentPatch, DocumentStatus, RegisterRequest};
use crate::types::{AppError, AppResult};

// Note: runtime query_as with FromRow, no DATABASE_URL needed at compile time
#[derive(Debug, sqlx::FromRow)]
struct DocumentRow {
    id: Uuid,
    client_id: Uuid,
    source_kind: String,
    source_ref: String,
    canonical_ref: Option<String>,
    mime_type: String,
    document_type: String,
    status: String,
    content: Option<String>,
    error: Option<String>,
    job_id: Option<String>,
    attempt: i32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    heartbeat_at: Option<DateTime<Utc>>,
}

impl DocumentRow {
    fn into_document(self, chunks: Option<Vec<Chunk>>) -> AppResult<Document> {
        let source_kind = self.source_kind.parse().map_err(AppError::Internal)?;
        let status: DocumentStatus = self.status.parse().map_err(AppError::Internal)?;

        Ok(Document {
            id: self.id,
            client_id: self.client_id,
            source_kind,
            source_ref: self.source_ref,
            canonical_ref: self.canonical_ref,
            mime_type: self.mime_type,
            document_type: self.document_type,
            status,
            content: self.content,
            chunks: if status == DocumentStatus::Completed {
                Some(chunks.unwrap_or_default())
            } else {
                None
            },
            error: self.error,
            job_id: self.job_id,
            attempt: self.attempt.max(0) as u32,
            created_at: self.created_at,
            updated_at: self.updated_at,
            heartbeat_at: self.heartbeat_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ChunkRow {
    document_id: Uuid,
    position: i32,
    content: String,
}

const UPDATE_DOCUMENT: &str = r#"
    UPDATE documents SET
        status = $3,
        content = COALESCE($4, content),
        error = CASE WHEN $3 = 'failed' THEN COALESCE($5, error) ELSE NULL END,
        job_id = COALESCE($6, job_id),
        attempt = COALESCE($7, attempt),
        canonical_ref = COALESCE($8, canonical_ref),
        mime_type = COALESCE($9, mime_type),
        updated_at = NOW()
    WHERE id = $1 AND status = ANY($2) AND ($10::text IS NULL OR job_id = $10)
    RETURNING *
"#;

/// Postgres-backed content store.
#[derive(Clone)]
pub struct PgDocumentStore {
    pool: PgPool,
}

impl PgDocumentStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn load_chunks(&self, ids: &[Uuid]) -> AppResult<HashMap<Uuid, Vec<Chunk>>> {
        let mut grouped: HashMap<Uuid, Vec<Chunk>> = HashMap::new();
        if ids.is_empty() {
            return Ok(grouped);
        }

        let rows = sqlx::query_as::<_, ChunkRow>(
            "SELECT document_id, position, content FROM document_chunks
             WHERE document_id = ANY($1) ORDER BY document_id, position",
        )
        .bind(ids)
        .fetch_all(&self.pool)
        .await?;

        for row in rows {
            grouped.entry(row.document_id).or_default().push(Chunk {
                id: row.position.max(0) as usize,
                content: row.content,
            });
        }
        Ok(grouped)
    }

    async fn hydrate(&self, rows: Vec<DocumentRow>) -> AppResult<Vec<Document>> {
        let completed: Vec<Uuid> = rows
            .iter()
            .filter(|r| r.status == DocumentStatus::Completed.as_str())
            .map(|r| r.id)
            .collect();
        let mut chunks = self.load_chunks(&completed).await?;

        rows.into_iter()
            .map(|row| {
                let doc_chunks = chunks.remove(&row.id);
                row.into_document(doc_chunks)
            })
            .collect()
    }

    async fn insert_chunks(
        tx: &mut Transaction<'_, Postgres>,
        document_id: Uuid,
        chunks: &[Chunk],
    ) -> AppResult<()> {
        sqlx::query("DELETE FROM document_chunks WHERE document_id = $1")
            .bind(document_id)
            .execute(&mut **tx)
            .await?;

        let positions: Vec<i32> = chunks.iter().map(|c| c.id as i32).collect();
        let contents: Vec<String> = chunks.iter().map(|c| c.content.clone()).collect();

        sqlx::query(
            "INSERT INTO document_chunks (document_id, position, content)
             SELECT $1, position, content FROM UNNEST($2::int4[], $3::text[]) AS t(position, content)",
        )
        .bind(document_id)
        .bind(&positions)
        .bind(&contents)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl DocumentStore for PgDocumentStore {
    async fn insert(&self, request: &RegisterRequest) -> AppResult<(Document, bool)> {
        let mut tx = self.pool.begin().await?;

        if request.idempotent {
            // serializes concurrent registrations of the same source
            sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
                .bind(format!("{}:{}", request.client_id, request.source_ref))
                .execute(&mut *tx)
                .await?;

            let existing = sqlx::query_as::<_, DocumentRow>(
                "SELECT * FROM documents
                 WHERE client_id = $1 AND source_ref = $2 AND status <> 'failed'
                 ORDER BY created_at DESC LIMIT 1",
            )
            .bind(request.client_id)
            .bind(&request.source_ref)
            .fetch_optional(&mut *tx)
            .await?;

            if let Some(row) = existing {
                tx.commit().await?;
                let mut docs = self.hydrate(vec![row]).await?;
                return docs
                    .pop()
                    .map(|doc| (doc, false))
                    .ok_or_else(|| AppError::Internal("Existing document vanished".to_string()));
            }
        }

        let doc = Document::new(request);
        sqlx::query(
            "INSERT INTO documents
                (id, client_id, source_kind, source_ref, canonical_ref, mime_type,
                 document_type, status, attempt, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
        )
        .bind(doc.id)
        .bind(doc.client_id)
        .bind(doc.source_kind.as_str())
        .bind(&doc.source_ref)
        .bind(&doc.canonical_ref)
        .bind(&doc.mime_type)
        .bind(&doc.document_type)
        .bind(doc.status.as_str())
        .bind(doc.attempt as i32)
        .bind(doc.created_at)
        .bind(doc.updated_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok((doc, true))
    }

    async fn get(&self, id: Uuid) -> AppResult<Option<Document>> {
        let row = sqlx::query_as::<_, DocumentRow>("SELECT * FROM documents WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(self.hydrate(vec![row]).await?.pop()),
            None => Ok(None),
        }
    }

    async fn apply_patch(
        &self,
        id: Uuid,
        expected: &[DocumentStatus],
        patch: &DocumentPatch,
    ) -> AppResult<PatchOutcome> {
        let expected: Vec<&str> = expected.iter().map(|s| s.as_str()).collect();
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query_as::<_, DocumentRow>(UPDATE_DOCUMENT)
            .bind(id)
            .bind(&expected)
            .bind(patch.status.as_str())
            .bind(&patch.content)
            .bind(&patch.error)
            .bind(&patch.job_id)
            .bind(patch.attempt.map(|a| a as i32))
            .bind(&patch.canonical_ref)
            .bind(&patch.mime_type)
            .bind(&patch.expected_job)
            .fetch_optional(&mut *tx)
            .await?;

        let Some(row) = row else {
            let current: Option<(String, Option<String>)> =
                sqlx::query_as("SELECT status, job_id FROM documents WHERE id = $1")
                    .bind(id)
                    .fetch_optional(&mut *tx)
                    .await?;
            tx.rollback().await?;

            return match current {
                Some((status, _)) if !expected.contains(&status.as_str()) => {
                    Ok(PatchOutcome::Stale {
                        current: status.parse().map_err(AppError::Internal)?,
                    })
                }
                Some((_, current_job)) => Ok(PatchOutcome::JobReplaced { current_job }),
                None => Ok(PatchOutcome::NotFound),
            };
        };

        if let Some(chunks) = &patch.chunks {
            Self::insert_chunks(&mut tx, id, chunks).await?;
        }
        tx.commit().await?;

        let chunks = match &patch.chunks {
            Some(chunks) => Some(chunks.clone()),
            None if row.status == DocumentStatus::Completed.as_str() => {
                self.load_chunks(&[id]).await?.remove(&id)
            }
            None => None,
        };
        Ok(PatchOutcome::Applied(row.into_document(chunks)?))
    }

    async fn list_for_client(&self, client_id: Uuid) -> AppResult<Vec<Document>> {
        let rows = sqlx::query_as::<_, DocumentRow>(
            "SELECT * FROM documents WHERE client_id = $1 ORDER BY created_at DESC",
        )
        .bind(client_id)
        .fetch_all(&self.pool)
        .await?;

        self.hydrate(rows).await
    }

    async fn list_stale(
        &self,
        statuses: &[DocumentStatus],
        updated_before: DateTime<Utc>,
    ) -> AppResult<Vec<Document>> {
        let statuses: Vec<&str> = statuses.iter().map(|s| s.as_str()).collect();
        let rows = sqlx::query_as::<_, DocumentRow>(
            "SELECT * FROM documents
             WHERE status = ANY($1) AND updated_at < $2
             ORDER BY updated_at",
        )
        .bind(&statuses)
        .bind(updated_before)
        .fetch_all(&self.pool)
        .await?;

        self.hydrate(rows).await
    }

    async fn heartbeat(&self, id: Uuid, job_id: &str) -> AppResult<bool> {
        let result = sqlx::query(
            "UPDATE documents SET heartbeat_at = NOW()
             WHERE id = $1 AND status = 'processing' AND job_id = $2",
        )
        .bind(id)
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete(&self, id: Uuid) -> AppResult<bool> {
        let result = sqlx::query("DELETE FROM documents WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn source_in_use(&self, client_id: Uuid, source_ref: &str) -> AppResult<bool> {
        let in_use: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM documents WHERE client_id = $1 AND source_ref = $2)",
        )
        .bind(client_id)
        .bind(source_ref)
        .fetch_one(&self.pool)
        .await?;
        Ok(in_use)
    }

    async fn ping(&self) -> AppResult<()> {
        super::health_check(&self.pool).await?;
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "postgres"
    }
}
