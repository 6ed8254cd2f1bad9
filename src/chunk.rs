//! Deterministic overlapping chunker.
//!
//! Renders a conversation as role-headered blocks in `turn_index` order,
//! then slides a character window of `target_size` forward by
//! `target_size - overlap`. Each chunk records the first and last turn fully
//! contained in its window. A window that would contain no complete message
//! grows to the end of the message it landed in, so every chunk carries at
//! least one full message header.
//!
//! Chunk identity is a pure function of the inputs:
//! `hex(sha256(conversation_id || start_turn || end_turn || target_size || overlap || text_hash))`
//! where `text_hash` is the SHA-256 of the chunk text. Re-running with the
//! same parameters reproduces the same rows; new parameters replace the
//! conversation's chunk set.

use anyhow::Result;
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;

use crate::models::{Chunk, Message};

#[derive(Debug, Clone, Copy)]
pub struct ChunkParams {
    pub target_size: usize,
    pub overlap: usize,
}

#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct ChunkReport {
    pub conversations: u64,
    pub chunks: u64,
}

/// Build the chunk set for one conversation. Pure: no I/O, fully determined
/// by its inputs.
pub fn build_chunks(conversation_id: &str, messages: &[Message], params: ChunkParams) -> Vec<Chunk> {
    if messages.is_empty() || params.target_size == 0 {
        return Vec::new();
    }
    let step_base = params.target_size.saturating_sub(params.overlap).max(1);

    // Render blocks and record each message's char span.
    let mut text = String::new();
    let mut spans: Vec<(usize, usize, i64)> = Vec::new(); // (start, end, turn_index) in chars
    let mut cursor = 0usize;
    for (i, msg) in messages.iter().enumerate() {
        if i > 0 {
            text.push_str("\n\n");
            cursor += 2;
        }
        let block = format!("{}:\n{}", msg.role.to_uppercase(), msg.content_text);
        let len = block.chars().count();
        spans.push((cursor, cursor + len, msg.turn_index));
        text.push_str(&block);
        cursor += len;
    }

    let chars: Vec<char> = text.chars().collect();
    let total = chars.len();

    let contained = |start: usize, end: usize| -> Vec<i64> {
        spans
            .iter()
            .filter(|(s, e, _)| *s >= start && *e <= end)
            .map(|(_, _, turn)| *turn)
            .collect()
    };

    let mut chunks = Vec::new();
    let mut pos = 0usize;
    loop {
        let mut start = pos;
        let mut end = (pos + params.target_size).min(total);

        let mut turns = contained(start, end);
        if turns.is_empty() {
            // The window landed inside a message bigger than itself; grow to
            // cover that message completely.
            if let Some((span_start, span_end, _)) = spans.iter().find(|(_, e, _)| *e > pos) {
                start = (*span_start).min(start);
                end = (*span_end).max(end).min(total);
            }
            turns = contained(start, end);
        }

        if let (Some(start_turn), Some(end_turn)) = (turns.first(), turns.last()) {
            let chunk_text: String = chars[start..end].iter().collect();
            let text_hash = sha256_hex(chunk_text.as_bytes());
            let id = chunk_id(
                conversation_id,
                *start_turn,
                *end_turn,
                params.target_size,
                params.overlap,
                &text_hash,
            );
            chunks.push(Chunk {
                id,
                conversation_id: conversation_id.to_string(),
                start_turn: *start_turn,
                end_turn: *end_turn,
                text: chunk_text,
                text_hash,
            });
        }

        if end >= total {
            break;
        }
        let next = end.saturating_sub(params.overlap);
        pos = if next > pos { next } else { pos + step_base };
    }

    chunks
}

fn chunk_id(
    conversation_id: &str,
    start_turn: i64,
    end_turn: i64,
    target_size: usize,
    overlap: usize,
    text_hash: &str,
) -> String {
    let material = format!(
        "{}:{}:{}:{}:{}:{}",
        conversation_id, start_turn, end_turn, target_size, overlap, text_hash
    );
    sha256_hex(material.as_bytes())
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Atomically replace the chunk set for a conversation.
pub async fn replace_chunks(
    pool: &SqlitePool,
    conversation_id: &str,
    chunks: &[Chunk],
) -> Result<()> {
    let mut tx = pool.begin().await?;

    sqlx::query("DELETE FROM chunks WHERE conversation_id = ?")
        .bind(conversation_id)
        .execute(&mut *tx)
        .await?;

    for chunk in chunks {
        sqlx::query(
            "INSERT OR REPLACE INTO chunks (id, conversation_id, start_turn, end_turn, text, text_hash) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&chunk.id)
        .bind(&chunk.conversation_id)
        .bind(chunk.start_turn)
        .bind(chunk.end_turn)
        .bind(&chunk.text)
        .bind(&chunk.text_hash)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(())
}

/// Chunk every conversation in the store with the given parameters.
pub async fn run_chunk(pool: &SqlitePool, params: ChunkParams) -> Result<ChunkReport> {
    let ids: Vec<String> = sqlx::query_scalar("SELECT id FROM conversations ORDER BY id")
        .fetch_all(pool)
        .await?;

    let mut report = ChunkReport::default();
    for id in &ids {
        let messages = crate::store::get_messages(pool, id).await?;
        let chunks = build_chunks(id, &messages, params);
        replace_chunks(pool, id, &chunks).await?;
        report.conversations += 1;
        report.chunks += chunks.len() as u64;
    }
    Ok(report)
}
