//! Full-text retrieval over message text.
//!
//! The primary path queries the FTS5 index ranked by bm25 (lower is better).
//! FTS5 rejects some user input outright (unbalanced quotes, stray
//! operators); rather than surfacing the parse error we degrade to a
//! case-insensitive substring scan ordered by recency, reporting rank 0.0.

use anyhow::Result;
use sqlx::{Row, SqlitePool};

use crate::models::SearchHit;

/// Ranked search over message content. Never fails on odd query syntax.
pub async fn search_messages(pool: &SqlitePool, query: &str, limit: i64) -> Result<Vec<SearchHit>> {
    let trimmed = query.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }

    match fts_search(pool, &escape_query(trimmed), limit).await {
        Ok(hits) => Ok(hits),
        // The FTS query compiler rejected the input; fall back to substring.
        Err(_) => substring_search(pool, trimmed, limit).await,
    }
}

/// Escape embedded quotes so phrases survive the FTS parser.
fn escape_query(query: &str) -> String {
    query.replace('"', "\"\"")
}

async fn fts_search(pool: &SqlitePool, query: &str, limit: i64) -> Result<Vec<SearchHit>> {
    let rows = sqlx::query(
        r#"
        SELECT m.id, m.conversation_id, m.role, m.created_at,
               bm25(messages_fts) AS rank,
               snippet(messages_fts, 0, '>>>', '<<<', '...', 32) AS snippet
        FROM messages_fts
        JOIN messages m ON messages_fts.rowid = m.rowid
        WHERE messages_fts MATCH ?
        ORDER BY rank
        LIMIT ?
        "#,
    )
    .bind(query)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| SearchHit {
            message_id: row.get("id"),
            conversation_id: row.get("conversation_id"),
            role: row.get("role"),
            snippet: row.get("snippet"),
            created_at: row.get("created_at"),
            rank: row.get("rank"),
        })
        .collect())
}

async fn substring_search(pool: &SqlitePool, query: &str, limit: i64) -> Result<Vec<SearchHit>> {
    let like = format!("%{}%", query);
    let rows = sqlx::query(
        r#"
        SELECT id, conversation_id, role, content_text, created_at
        FROM messages
        WHERE content_text LIKE ?
        ORDER BY created_at DESC
        LIMIT ?
        "#,
    )
    .bind(&like)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| {
            let content: String = row.get("content_text");
            SearchHit {
                message_id: row.get("id"),
                conversation_id: row.get("conversation_id"),
                role: row.get("role"),
                snippet: truncate_snippet(&content, 160),
                created_at: row.get("created_at"),
                rank: 0.0,
            }
        })
        .collect())
}

fn truncate_snippet(text: &str, max_chars: usize) -> String {
    let flat = text.replace('\n', " ");
    let mut snippet: String = flat.chars().take(max_chars).collect();
    if flat.chars().count() > max_chars {
        snippet.push('…');
    }
    snippet
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_embedded_quotes() {
        assert_eq!(escape_query(r#"say "hi""#), r#"say ""hi"""#);
        assert_eq!(escape_query("plain"), "plain");
    }

    #[test]
    fn snippet_truncates_on_char_boundary() {
        let text = "héllo wörld ".repeat(40);
        let snippet = truncate_snippet(&text, 20);
        assert_eq!(snippet.chars().count(), 21); // 20 chars + ellipsis
        assert!(snippet.ends_with('…'));
    }

    #[test]
    fn short_text_is_untouched() {
        assert_eq!(truncate_snippet("short", 160), "short");
    }
}
