//! Query layer shared by the CLI and the HTTP server.
//!
//! Every function takes a pool handle rather than owning one, so the same
//! queries run against the read-only handle in the server and the read-write
//! handle in the CLI and worker.

use anyhow::Result;
use sqlx::{Row, SqlitePool};

use crate::models::{Conversation, Job, JobProgress, JobStatus, JobType, Message, Project, Stats};

/// Filters for the conversation listing.
#[derive(Debug, Default, Clone)]
pub struct ConversationFilter {
    pub limit: i64,
    pub offset: i64,
    /// Case-insensitive title substring.
    pub search: Option<String>,
    pub gizmo_id: Option<String>,
}

pub async fn list_conversations(
    pool: &SqlitePool,
    filter: &ConversationFilter,
) -> Result<Vec<Conversation>> {
    let limit = if filter.limit > 0 { filter.limit } else { 200 };
    let like = filter
        .search
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| format!("%{}%", s));

    let rows = sqlx::query(
        r#"
        SELECT id, title, created_at, updated_at, message_count,
               default_model_slug, gizmo_id, raw_hash
        FROM conversations
        WHERE (?1 IS NULL OR title LIKE ?1)
          AND (?2 IS NULL OR gizmo_id = ?2)
        ORDER BY updated_at DESC, id
        LIMIT ?3 OFFSET ?4
        "#,
    )
    .bind(&like)
    .bind(&filter.gizmo_id)
    .bind(limit)
    .bind(filter.offset.max(0))
    .fetch_all(pool)
    .await?;

    Ok(rows.iter().map(conversation_from_row).collect())
}

pub async fn get_conversation(pool: &SqlitePool, id: &str) -> Result<Option<Conversation>> {
    let row = sqlx::query(
        r#"
        SELECT c.id, c.title, c.created_at, c.updated_at, c.message_count,
               c.default_model_slug, c.gizmo_id, c.raw_hash,
               p.display_name AS project_name
        FROM conversations c
        LEFT JOIN projects p ON p.gizmo_id = c.gizmo_id
        WHERE c.id = ?
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|r| {
        let mut conv = conversation_from_row(&r);
        conv.project_name = r.get("project_name");
        conv
    }))
}

fn conversation_from_row(row: &sqlx::sqlite::SqliteRow) -> Conversation {
    Conversation {
        id: row.get("id"),
        title: row.get("title"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        message_count: row.get("message_count"),
        default_model_slug: row.get("default_model_slug"),
        gizmo_id: row.get("gizmo_id"),
        raw_hash: row.get("raw_hash"),
        project_name: None,
    }
}

/// Messages of one conversation, in turn order.
pub async fn get_messages(pool: &SqlitePool, conversation_id: &str) -> Result<Vec<Message>> {
    let rows = sqlx::query(
        r#"
        SELECT id, conversation_id, parent_id, role, content_type,
               content_text, created_at, turn_index, text_hash
        FROM messages
        WHERE conversation_id = ?
        ORDER BY turn_index ASC
        "#,
    )
    .bind(conversation_id)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| Message {
            id: row.get("id"),
            conversation_id: row.get("conversation_id"),
            parent_id: row.get("parent_id"),
            role: row.get("role"),
            content_type: row.get("content_type"),
            content_text: row.get("content_text"),
            created_at: row.get("created_at"),
            turn_index: row.get("turn_index"),
            text_hash: row.get("text_hash"),
        })
        .collect())
}

pub async fn stats(pool: &SqlitePool) -> Result<Stats> {
    let conversations: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM conversations")
        .fetch_one(pool)
        .await?;
    let messages: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM messages")
        .fetch_one(pool)
        .await?;
    let chunks: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
        .fetch_one(pool)
        .await?;
    let projects: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM projects")
        .fetch_one(pool)
        .await?;

    Ok(Stats {
        conversations,
        messages,
        chunks,
        projects,
    })
}

pub async fn list_projects(pool: &SqlitePool) -> Result<Vec<Project>> {
    let rows = sqlx::query(
        r#"
        SELECT p.gizmo_id, p.gizmo_type, p.display_name,
               (SELECT COUNT(*) FROM conversations c WHERE c.gizmo_id = p.gizmo_id)
                   AS conversation_count
        FROM projects p
        ORDER BY conversation_count DESC, p.gizmo_id
        "#,
    )
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| Project {
            gizmo_id: row.get("gizmo_id"),
            gizmo_type: row.get("gizmo_type"),
            display_name: row.get("display_name"),
            conversation_count: row.get("conversation_count"),
        })
        .collect())
}

// ============ Jobs ============

pub async fn get_job(pool: &SqlitePool, id: &str) -> Result<Option<Job>> {
    let row = sqlx::query(
        r#"
        SELECT id, type, target_id, target_name, pattern, status, progress,
               result_path, error, created_at, started_at, finished_at
        FROM jobs WHERE id = ?
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;

    Ok(row.as_ref().map(job_from_row))
}

pub async fn list_jobs(pool: &SqlitePool) -> Result<Vec<Job>> {
    let rows = sqlx::query(
        r#"
        SELECT id, type, target_id, target_name, pattern, status, progress,
               result_path, error, created_at, started_at, finished_at
        FROM jobs ORDER BY created_at DESC, id
        "#,
    )
    .fetch_all(pool)
    .await?;

    Ok(rows.iter().map(job_from_row).collect())
}

/// The most recent job for `(target_id, pattern)` in any of the given states.
pub async fn find_job_by_target(
    pool: &SqlitePool,
    target_id: &str,
    pattern: &str,
    statuses: &[JobStatus],
) -> Result<Option<Job>> {
    let status_list: Vec<&str> = statuses.iter().map(|s| s.as_str()).collect();
    // Small fixed set; inline the placeholders.
    let placeholders = vec!["?"; status_list.len()].join(", ");
    let sql = format!(
        "SELECT id, type, target_id, target_name, pattern, status, progress, \
                result_path, error, created_at, started_at, finished_at \
         FROM jobs \
         WHERE target_id = ? AND pattern = ? AND status IN ({}) \
         ORDER BY created_at DESC, id LIMIT 1",
        placeholders
    );

    let mut query = sqlx::query(&sql).bind(target_id).bind(pattern);
    for status in status_list {
        query = query.bind(status);
    }
    let row = query.fetch_optional(pool).await?;
    Ok(row.as_ref().map(job_from_row))
}

fn job_from_row(row: &sqlx::sqlite::SqliteRow) -> Job {
    let job_type: String = row.get("type");
    let status: String = row.get("status");
    let progress: Option<String> = row.get("progress");

    Job {
        id: row.get("id"),
        job_type: JobType::parse(&job_type).unwrap_or(JobType::Conversation),
        target_id: row.get("target_id"),
        target_name: row.get("target_name"),
        pattern: row.get("pattern"),
        status: JobStatus::parse(&status).unwrap_or(JobStatus::Failed),
        progress: progress.and_then(|p| serde_json::from_str::<JobProgress>(&p).ok()),
        result_path: row.get("result_path"),
        error: row.get("error"),
        created_at: row.get("created_at"),
        started_at: row.get("started_at"),
        finished_at: row.get("finished_at"),
    }
}
