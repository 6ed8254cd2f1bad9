//! Ingestion pipeline.
//!
//! Drives the archive parser, deduplicates on `raw_hash`, and persists each
//! conversation in its own transaction. FTS rows are maintained by the
//! schema's triggers inside the same transaction. A failure while writing one
//! conversation rolls back that conversation only; the import continues.
//!
//! # Deduplication
//!
//! A record whose `raw_hash` is already present is skipped unless `force` is
//! set. A record with a known conversation id but a different hash (a
//! re-export with new turns) replaces the prior rows. Replacement deletes
//! messages and chunks before rewriting, all inside the transaction, so
//! readers never observe a half-replaced conversation.

use anyhow::Result;
use sqlx::SqlitePool;
use std::path::Path;
use tracing::{info, warn};

use crate::archive::{self, ParsedConversation};

/// Totals reported by one import run.
#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct ImportReport {
    pub conversations_added: u64,
    pub messages_added: u64,
    pub skipped: u64,
    pub failed_records: u64,
}

/// Import an export archive. `force` re-ingests records whose `raw_hash` is
/// already present.
pub async fn run_import(pool: &SqlitePool, archive_path: &Path, force: bool) -> Result<ImportReport> {
    let records = archive::read_conversations(archive_path)?;

    let mut report = ImportReport::default();
    for record in &records {
        let parsed = match archive::parse_record(record) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "skipping malformed conversation record");
                report.failed_records += 1;
                continue;
            }
        };

        match ingest_conversation(pool, &parsed, force).await {
            Ok(IngestOutcome::Added { messages }) => {
                report.conversations_added += 1;
                report.messages_added += messages;
            }
            Ok(IngestOutcome::Skipped) => report.skipped += 1,
            Err(e) => {
                warn!(conversation = %parsed.id, error = %e, "conversation ingest failed");
                report.failed_records += 1;
            }
        }
    }

    Ok(report)
}

enum IngestOutcome {
    Added { messages: u64 },
    Skipped,
}

async fn ingest_conversation(
    pool: &SqlitePool,
    conv: &ParsedConversation,
    force: bool,
) -> Result<IngestOutcome> {
    let already: Option<String> =
        sqlx::query_scalar("SELECT id FROM conversations WHERE raw_hash = ?")
            .bind(&conv.raw_hash)
            .fetch_optional(pool)
            .await?;
    if already.is_some() && !force {
        info!(conversation = %conv.id, raw_hash = %conv.raw_hash, "duplicate ingest skipped");
        return Ok(IngestOutcome::Skipped);
    }

    let mut tx = pool.begin().await?;

    // Replace any prior rows for this conversation id (and the row that owned
    // this raw_hash, when a force re-import renamed the id).
    sqlx::query("DELETE FROM messages WHERE conversation_id = ?")
        .bind(&conv.id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM chunks WHERE conversation_id = ?")
        .bind(&conv.id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM conversations WHERE id = ? OR raw_hash = ?")
        .bind(&conv.id)
        .bind(&conv.raw_hash)
        .execute(&mut *tx)
        .await?;

    sqlx::query(
        r#"
        INSERT INTO conversations
            (id, title, created_at, updated_at, message_count,
             default_model_slug, gizmo_id, raw_hash, meta_json)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&conv.id)
    .bind(&conv.title)
    .bind(conv.created_at)
    .bind(conv.updated_at)
    .bind(conv.messages.len() as i64)
    .bind(&conv.default_model_slug)
    .bind(&conv.gizmo_id)
    .bind(&conv.raw_hash)
    .bind(&conv.meta_json)
    .execute(&mut *tx)
    .await?;

    for msg in &conv.messages {
        sqlx::query(
            r#"
            INSERT INTO messages
                (id, conversation_id, parent_id, role, content_type,
                 content_text, created_at, turn_index, text_hash)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&msg.id)
        .bind(&conv.id)
        .bind(&msg.parent_id)
        .bind(msg.role.as_str())
        .bind(&msg.content_type)
        .bind(&msg.content_text)
        .bind(msg.created_at)
        .bind(msg.turn_index)
        .bind(&msg.text_hash)
        .execute(&mut *tx)
        .await?;
    }

    if let Some(gizmo_id) = &conv.gizmo_id {
        let gizmo_type = conv.gizmo_type.as_deref().unwrap_or("gpt");
        sqlx::query(
            r#"
            INSERT INTO projects (gizmo_id, gizmo_type, display_name)
            VALUES (?, ?, ?)
            ON CONFLICT(gizmo_id) DO UPDATE SET gizmo_type = excluded.gizmo_type
            "#,
        )
        .bind(gizmo_id)
        .bind(gizmo_type)
        .bind(gizmo_id)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(IngestOutcome::Added {
        messages: conv.messages.len() as u64,
    })
}
