//! Property-style tests for ingestion, chunking, and search, run directly
//! against the library with a temporary database.

use sqlx::SqlitePool;
use std::path::PathBuf;
use tempfile::TempDir;

use chatvault::chunk::{self, ChunkParams};
use chatvault::{db, ingest, migrate, search};

async fn test_pool(tmp: &TempDir) -> SqlitePool {
    let pool = db::connect(&tmp.path().join("test.sqlite3")).await.unwrap();
    migrate::run_migrations(&pool).await.unwrap();
    pool
}

fn write_fixture(tmp: &TempDir, records: &serde_json::Value) -> PathBuf {
    let path = tmp.path().join("conversations.json");
    std::fs::write(&path, serde_json::to_string(records).unwrap()).unwrap();
    path
}

fn linear_conversation(id: &str, turns: &[(&str, &str)]) -> serde_json::Value {
    let mut mapping = serde_json::Map::new();
    mapping.insert(
        "root".to_string(),
        serde_json::json!({"parent": null, "children": ["n0"], "message": null}),
    );
    for (i, (role, text)) in turns.iter().enumerate() {
        let parent = if i == 0 {
            "root".to_string()
        } else {
            format!("n{}", i - 1)
        };
        mapping.insert(
            format!("n{}", i),
            serde_json::json!({
                "parent": parent,
                "children": [],
                "message": {
                    "id": format!("{}-m{}", id, i),
                    "author": {"role": role},
                    "create_time": 1000.0 + i as f64,
                    "content": {"content_type": "text", "parts": [text]}
                }
            }),
        );
    }
    serde_json::json!({
        "id": id,
        "title": format!("Conversation {}", id),
        "create_time": 1000.0,
        "update_time": 2000.0,
        "current_node": format!("n{}", turns.len() - 1),
        "mapping": mapping
    })
}

fn sample_records() -> serde_json::Value {
    serde_json::json!([
        linear_conversation("alpha", &[("user", "hello there"), ("assistant", "general greeting")]),
        linear_conversation(
            "beta",
            &[
                ("user", "salt AND pepper"),
                ("assistant", "a classic seasoning"),
                ("user", "anything else?"),
                ("assistant", "acid brightens everything"),
            ]
        ),
    ])
}

#[tokio::test]
async fn reingest_without_force_changes_nothing() {
    let tmp = TempDir::new().unwrap();
    let pool = test_pool(&tmp).await;
    let archive = write_fixture(&tmp, &sample_records());

    let first = ingest::run_import(&pool, &archive, false).await.unwrap();
    assert_eq!(first.conversations_added, 2);
    assert_eq!(first.messages_added, 6);

    let second = ingest::run_import(&pool, &archive, false).await.unwrap();
    assert_eq!(second.conversations_added, 0);
    assert_eq!(second.skipped, 2);

    let conversations: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM conversations")
        .fetch_one(&pool)
        .await
        .unwrap();
    let messages: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM messages")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(conversations, 2);
    assert_eq!(messages, 6);
}

#[tokio::test]
async fn turn_indexes_are_dense_and_match_counts() {
    let tmp = TempDir::new().unwrap();
    let pool = test_pool(&tmp).await;
    let archive = write_fixture(&tmp, &sample_records());
    ingest::run_import(&pool, &archive, false).await.unwrap();

    let conversations: Vec<(String, i64)> =
        sqlx::query_as("SELECT id, message_count FROM conversations")
            .fetch_all(&pool)
            .await
            .unwrap();

    for (id, message_count) in conversations {
        let turns: Vec<i64> = sqlx::query_scalar(
            "SELECT turn_index FROM messages WHERE conversation_id = ? ORDER BY turn_index",
        )
        .bind(&id)
        .fetch_all(&pool)
        .await
        .unwrap();

        let expected: Vec<i64> = (0..message_count).collect();
        assert_eq!(turns, expected, "turn_index must be exactly [0..N) for {}", id);
    }
}

#[tokio::test]
async fn fts_rows_track_message_rows() {
    let tmp = TempDir::new().unwrap();
    let pool = test_pool(&tmp).await;
    let archive = write_fixture(&tmp, &sample_records());
    ingest::run_import(&pool, &archive, false).await.unwrap();

    let messages: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM messages")
        .fetch_one(&pool)
        .await
        .unwrap();
    let fts_rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM messages_fts")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(messages, fts_rows);

    // Force re-import rewrites; the trigger-driven index must follow.
    ingest::run_import(&pool, &archive, true).await.unwrap();
    let fts_after: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM messages_fts")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(fts_after, messages);
}

#[tokio::test]
async fn updated_record_replaces_prior_rows() {
    let tmp = TempDir::new().unwrap();
    let pool = test_pool(&tmp).await;

    let v1 = serde_json::json!([linear_conversation("gamma", &[("user", "draft one")])]);
    let archive = write_fixture(&tmp, &v1);
    ingest::run_import(&pool, &archive, false).await.unwrap();

    // Same conversation id, new content: a re-export with more turns.
    let v2 = serde_json::json!([linear_conversation(
        "gamma",
        &[("user", "draft one"), ("assistant", "reply")]
    )]);
    std::fs::write(&archive, serde_json::to_string(&v2).unwrap()).unwrap();
    let report = ingest::run_import(&pool, &archive, false).await.unwrap();
    assert_eq!(report.conversations_added, 1);

    let (count, message_count): (i64, i64) = sqlx::query_as(
        "SELECT (SELECT COUNT(*) FROM conversations WHERE id = 'gamma'), \
                (SELECT message_count FROM conversations WHERE id = 'gamma')",
    )
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(count, 1, "no duplicate conversation rows");
    assert_eq!(message_count, 2);

    let messages: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM messages WHERE conversation_id = 'gamma'")
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(messages, 2);
}

#[tokio::test]
async fn rechunking_reproduces_identical_rows() {
    let tmp = TempDir::new().unwrap();
    let pool = test_pool(&tmp).await;
    let archive = write_fixture(&tmp, &sample_records());
    ingest::run_import(&pool, &archive, false).await.unwrap();

    let params = ChunkParams {
        target_size: 80,
        overlap: 10,
    };
    chunk::run_chunk(&pool, params).await.unwrap();
    let first: Vec<(String, String)> =
        sqlx::query_as("SELECT id, text_hash FROM chunks ORDER BY id")
            .fetch_all(&pool)
            .await
            .unwrap();
    assert!(!first.is_empty());

    chunk::run_chunk(&pool, params).await.unwrap();
    let second: Vec<(String, String)> =
        sqlx::query_as("SELECT id, text_hash FROM chunks ORDER BY id")
            .fetch_all(&pool)
            .await
            .unwrap();
    assert_eq!(first, second, "identical parameters must reproduce identical rows");

    // New parameters replace the prior set.
    chunk::run_chunk(
        &pool,
        ChunkParams {
            target_size: 80,
            overlap: 20,
        },
    )
    .await
    .unwrap();
    let third: Vec<String> = sqlx::query_scalar("SELECT id FROM chunks ORDER BY id")
        .fetch_all(&pool)
        .await
        .unwrap();
    for (old_id, _) in &first {
        assert!(!third.contains(old_id), "old chunk ids must be gone");
    }
}

#[tokio::test]
async fn search_hits_contain_a_query_token() {
    let tmp = TempDir::new().unwrap();
    let pool = test_pool(&tmp).await;
    let archive = write_fixture(&tmp, &sample_records());
    ingest::run_import(&pool, &archive, false).await.unwrap();

    let hits = search::search_messages(&pool, "seasoning", 10).await.unwrap();
    assert!(!hits.is_empty());
    for hit in &hits {
        let content: String =
            sqlx::query_scalar("SELECT content_text FROM messages WHERE id = ?")
                .bind(&hit.message_id)
                .fetch_one(&pool)
                .await
                .unwrap();
        assert!(
            content.to_lowercase().contains("seasoning"),
            "hit {} does not contain the query token",
            hit.message_id
        );
    }
}

#[tokio::test]
async fn broken_fts_input_falls_back_to_substring() {
    let tmp = TempDir::new().unwrap();
    let pool = test_pool(&tmp).await;
    let archive = write_fixture(&tmp, &sample_records());
    ingest::run_import(&pool, &archive, false).await.unwrap();

    // "AND" alone is an FTS5 syntax error, but appears verbatim in one message.
    let hits = search::search_messages(&pool, "AND", 10).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].rank, 0.0, "fallback hits report rank 0.0");

    // Plainly broken input yields empty results, not an error.
    let hits = search::search_messages(&pool, "(((", 10).await.unwrap();
    assert!(hits.is_empty());
}

#[tokio::test]
async fn empty_query_returns_no_hits() {
    let tmp = TempDir::new().unwrap();
    let pool = test_pool(&tmp).await;
    let archive = write_fixture(&tmp, &sample_records());
    ingest::run_import(&pool, &archive, false).await.unwrap();

    let hits = search::search_messages(&pool, "   ", 10).await.unwrap();
    assert!(hits.is_empty());
}
