//! Deterministic exporters.
//!
//! Four output shapes, all byte-identical across runs on identical input:
//!
//! - per-conversation markdown document (title heading + role headings)
//! - bulk message stream, one JSON object per line
//! - training pairs (adjacent user → assistant turns)
//! - vault directory, one markdown document per conversation plus an index
//!
//! Every exporter accepts an optional redaction pass; the redactor is shared
//! across one export run so its tokens stay stable.

use anyhow::{Context, Result};
use serde::Serialize;
use sqlx::SqlitePool;
use std::io::Write;
use std::path::Path;

use crate::models::Message;
use crate::redact::Redactor;
use crate::store;

/// Render one conversation as a markdown document.
pub async fn conversation_markdown(
    pool: &SqlitePool,
    conversation_id: &str,
    redactor: Option<&mut Redactor>,
) -> Result<String> {
    let conv = store::get_conversation(pool, conversation_id)
        .await?
        .with_context(|| format!("conversation not found: {}", conversation_id))?;
    let messages = store::get_messages(pool, conversation_id).await?;
    Ok(render_markdown(&conv.title, &messages, redactor))
}

/// Pure rendering used by the exporters and the worker prompt assembly.
pub fn render_markdown(
    title: &str,
    messages: &[Message],
    mut redactor: Option<&mut Redactor>,
) -> String {
    let mut out = format!("# {}\n", title);
    for msg in messages {
        let body = match redactor.as_deref_mut() {
            Some(r) => r.redact(&msg.content_text),
            None => msg.content_text.clone(),
        };
        out.push_str("\n## ");
        out.push_str(&msg.role);
        out.push_str("\n\n");
        out.push_str(&body);
        out.push('\n');
    }
    out
}

#[derive(Serialize)]
struct ExportedMessage<'a> {
    id: &'a str,
    conversation_id: &'a str,
    role: &'a str,
    content_text: &'a str,
    created_at: i64,
    turn_index: i64,
}

/// Bulk message stream: one JSON object per line, ordered by
/// `(conversation_id, turn_index)`.
pub async fn export_messages_jsonl(pool: &SqlitePool, out: &Path, redact: bool) -> Result<u64> {
    let messages = all_messages(pool).await?;
    let mut redactor = redact.then(Redactor::new);

    let mut file = create_output(out)?;
    let mut written = 0u64;
    for msg in &messages {
        let body = match redactor.as_mut() {
            Some(r) => r.redact(&msg.content_text),
            None => msg.content_text.clone(),
        };
        let record = ExportedMessage {
            id: &msg.id,
            conversation_id: &msg.conversation_id,
            role: &msg.role,
            content_text: &body,
            created_at: msg.created_at,
            turn_index: msg.turn_index,
        };
        writeln!(file, "{}", serde_json::to_string(&record)?)?;
        written += 1;
    }
    Ok(written)
}

#[derive(Serialize)]
struct TrainingPair<'a> {
    a: &'a str,
    b: &'a str,
    meta: PairMeta<'a>,
}

#[derive(Serialize)]
struct PairMeta<'a> {
    conversation_id: &'a str,
    pair_index: i64,
}

/// Contiguous user → assistant adjacency pairs. Tool and system turns break
/// adjacency; only directly consecutive turns pair up.
pub async fn export_training_pairs(pool: &SqlitePool, out: &Path, redact: bool) -> Result<u64> {
    let messages = all_messages(pool).await?;
    let mut redactor = redact.then(Redactor::new);

    let mut file = create_output(out)?;
    let mut written = 0u64;
    let mut pair_index: i64 = 0;
    let mut current_conv = "";

    for window in messages.windows(2) {
        let (prev, cur) = (&window[0], &window[1]);
        if cur.conversation_id != current_conv {
            current_conv = &cur.conversation_id;
            pair_index = 0;
        }
        if prev.conversation_id != cur.conversation_id {
            continue;
        }
        if prev.role != "user" || cur.role != "assistant" {
            continue;
        }
        if cur.turn_index != prev.turn_index + 1 {
            continue;
        }

        let (a, b) = match redactor.as_mut() {
            Some(r) => (r.redact(&prev.content_text), r.redact(&cur.content_text)),
            None => (prev.content_text.clone(), cur.content_text.clone()),
        };
        let record = TrainingPair {
            a: &a,
            b: &b,
            meta: PairMeta {
                conversation_id: &cur.conversation_id,
                pair_index,
            },
        };
        writeln!(file, "{}", serde_json::to_string(&record)?)?;
        pair_index += 1;
        written += 1;
    }
    Ok(written)
}

/// Vault report: how many documents were written.
#[derive(Debug, Default, Clone, Serialize)]
pub struct VaultReport {
    pub conversations: u64,
    pub files_written: u64,
}

/// One markdown document per conversation, filename derived from the
/// sanitized title plus a short id prefix, with an `INDEX.md` at the root.
pub async fn export_vault(pool: &SqlitePool, out_dir: &Path, redact: bool) -> Result<VaultReport> {
    std::fs::create_dir_all(out_dir)
        .with_context(|| format!("cannot create vault directory: {}", out_dir.display()))?;

    let conversations = store::list_conversations(
        pool,
        &store::ConversationFilter {
            limit: i64::MAX,
            ..Default::default()
        },
    )
    .await?;

    let mut redactor = redact.then(Redactor::new);
    let mut index = vec![
        "# Vault".to_string(),
        String::new(),
        format!("- Conversations: {}", conversations.len()),
        String::new(),
    ];

    let mut report = VaultReport {
        conversations: conversations.len() as u64,
        ..Default::default()
    };
    for conv in &conversations {
        let messages = store::get_messages(pool, &conv.id).await?;
        let doc = render_markdown(&conv.title, &messages, redactor.as_mut());
        let filename = vault_filename(&conv.title, &conv.id);
        std::fs::write(out_dir.join(&filename), doc)?;
        index.push(format!("- [[{}]]", filename));
        report.files_written += 1;
    }

    std::fs::write(out_dir.join("INDEX.md"), index.join("\n") + "\n")?;
    Ok(report)
}

/// `<sanitized title>__<id prefix>.md`, collision-tolerant via the id prefix.
pub fn vault_filename(title: &str, id: &str) -> String {
    let cleaned: String = title
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == ' ' || *c == '_' || *c == '-')
        .collect();
    let mut safe: String = cleaned.trim().replace(' ', "_").chars().take(80).collect();
    let prefix: String = id.chars().take(8).collect();
    if safe.is_empty() {
        safe = prefix.clone();
    }
    format!("{}__{}.md", safe, prefix)
}

async fn all_messages(pool: &SqlitePool) -> Result<Vec<Message>> {
    let rows = sqlx::query_as::<_, (String,)>(
        "SELECT id FROM conversations ORDER BY id",
    )
    .fetch_all(pool)
    .await?;

    let mut all = Vec::new();
    for (id,) in rows {
        all.extend(store::get_messages(pool, &id).await?);
    }
    Ok(all)
}

fn create_output(path: &Path) -> Result<std::fs::File> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    std::fs::File::create(path).with_context(|| format!("cannot write {}", path.display()))
}
