//! Coordinator and worker tests: deduplication, caching, deletion, recovery,
//! and the streaming contract.

use futures::StreamExt;
use sqlx::SqlitePool;
use std::path::PathBuf;
use tempfile::TempDir;

use chatvault::config::Config;
use chatvault::jobs::{self, Coordinator, JobEvent, SubmitError, SubmitRequest, WorkerSpawner};
use chatvault::models::{now_ts, JobStatus, JobType};
use chatvault::{db, ingest, migrate, store, worker};

struct Env {
    _tmp: TempDir,
    pool: SqlitePool,
    cache_dir: PathBuf,
    config: Config,
}

async fn setup() -> Env {
    let tmp = TempDir::new().unwrap();
    let db_path = tmp.path().join("test.sqlite3");
    let cache_dir = tmp.path().join("generated");

    let pool = db::connect(&db_path).await.unwrap();
    migrate::run_migrations(&pool).await.unwrap();

    let fixture = serde_json::json!([{
        "id": "conv-x",
        "title": "Target",
        "create_time": 1.0,
        "update_time": 2.0,
        "gizmo_id": "g-proj",
        "current_node": "n1",
        "mapping": {
            "root": {"parent": null, "children": ["n0"], "message": null},
            "n0": {"parent": "root", "children": ["n1"], "message": {
                "id": "m0", "author": {"role": "user"}, "create_time": 1.0,
                "content": {"content_type": "text", "parts": ["question"]}
            }},
            "n1": {"parent": "n0", "children": [], "message": {
                "id": "m1", "author": {"role": "assistant"}, "create_time": 2.0,
                "content": {"content_type": "text", "parts": ["answer"]}
            }}
        }
    }]);
    let archive = tmp.path().join("conversations.json");
    std::fs::write(&archive, serde_json::to_string(&fixture).unwrap()).unwrap();
    ingest::run_import(&pool, &archive, false).await.unwrap();

    let mut config = Config::default();
    config.db.path = db_path;
    config.cache.dir = cache_dir.clone();

    Env {
        _tmp: tmp,
        pool,
        cache_dir,
        config,
    }
}

fn coordinator(env: &Env) -> Coordinator {
    // `true` accepts any arguments and exits 0, leaving the job pending.
    let spawner = WorkerSpawner {
        program: PathBuf::from("true"),
        args: Vec::new(),
    };
    Coordinator::new(env.pool.clone(), env.cache_dir.clone(), spawner)
}

fn summarize_request() -> SubmitRequest {
    SubmitRequest {
        job_type: JobType::Conversation,
        target_id: "conv-x".to_string(),
        target_name: None,
        pattern: "summarize".to_string(),
    }
}

#[tokio::test]
async fn submit_deduplicates_live_jobs() {
    let env = setup().await;
    let coord = coordinator(&env);

    let first = coord.submit(&summarize_request()).await.unwrap();
    assert_eq!(first.status, JobStatus::Pending);
    assert_eq!(first.target_name, "Target");

    let second = coord.submit(&summarize_request()).await.unwrap();
    assert_eq!(first.id, second.id, "live job must be returned, not duplicated");

    // Invariant: at most one live job per (target_id, pattern).
    let live: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM jobs WHERE target_id = 'conv-x' AND pattern = 'summarize' \
         AND status IN ('pending', 'running')",
    )
    .fetch_one(&env.pool)
    .await
    .unwrap();
    assert_eq!(live, 1);
}

#[tokio::test]
async fn submit_rejects_unknown_pattern() {
    let env = setup().await;
    let coord = coordinator(&env);

    let err = coord
        .submit(&SubmitRequest {
            job_type: JobType::Conversation,
            target_id: "conv-x".to_string(),
            target_name: None,
            pattern: "analyze_paper".to_string(),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, SubmitError::InvalidPattern { .. }));
}

#[tokio::test]
async fn submit_rejects_missing_target() {
    let env = setup().await;
    let coord = coordinator(&env);

    let err = coord
        .submit(&SubmitRequest {
            job_type: JobType::Conversation,
            target_id: "no-such-conversation".to_string(),
            target_name: None,
            pattern: "summarize".to_string(),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, SubmitError::TargetNotFound(_)));
}

#[tokio::test]
async fn done_job_with_artifact_is_a_cache_hit() {
    let env = setup().await;
    let coord = coordinator(&env);

    let job = coord.submit(&summarize_request()).await.unwrap();

    // Complete the job by hand and materialize its artifact.
    let rel = Coordinator::artifact_rel_path(JobType::Conversation, "conv-x", "summarize");
    let abs = env.cache_dir.join(&rel);
    std::fs::create_dir_all(abs.parent().unwrap()).unwrap();
    std::fs::write(&abs, b"%PDF-stub").unwrap();
    sqlx::query("UPDATE jobs SET status = 'done', result_path = ?, finished_at = ? WHERE id = ?")
        .bind(&rel)
        .bind(now_ts())
        .bind(&job.id)
        .execute(&env.pool)
        .await
        .unwrap();

    let hit = coord.submit(&summarize_request()).await.unwrap();
    assert_eq!(hit.id, job.id, "valid done job must be returned as a cache hit");
    assert_eq!(hit.status, JobStatus::Done);

    // Deleting the artifact degrades the done row to a cache miss.
    std::fs::remove_file(&abs).unwrap();
    let miss = coord.submit(&summarize_request()).await.unwrap();
    assert_ne!(miss.id, job.id, "missing artifact must spawn a new job");
    assert_eq!(miss.status, JobStatus::Pending);
}

#[tokio::test]
async fn check_probe_reports_cache_state() {
    let env = setup().await;
    let coord = coordinator(&env);

    assert!(coord.check("conv-x", "summarize").await.unwrap().is_none());

    let job = coord.submit(&summarize_request()).await.unwrap();
    let probed = coord.check("conv-x", "summarize").await.unwrap().unwrap();
    assert_eq!(probed.id, job.id);
}

#[tokio::test]
async fn delete_removes_row_and_artifact() {
    let env = setup().await;
    let coord = coordinator(&env);

    let job = coord.submit(&summarize_request()).await.unwrap();
    let rel = Coordinator::artifact_rel_path(JobType::Conversation, "conv-x", "summarize");
    let abs = env.cache_dir.join(&rel);
    std::fs::create_dir_all(abs.parent().unwrap()).unwrap();
    std::fs::write(&abs, b"%PDF-stub").unwrap();
    sqlx::query("UPDATE jobs SET status = 'done', result_path = ? WHERE id = ?")
        .bind(&rel)
        .bind(&job.id)
        .execute(&env.pool)
        .await
        .unwrap();

    assert!(coord.delete(&job.id).await.unwrap());
    assert!(!abs.exists(), "artifact must be removed with the row");
    assert!(store::get_job(&env.pool, &job.id).await.unwrap().is_none());

    // Deleting again reports not-found.
    assert!(!coord.delete(&job.id).await.unwrap());
}

#[tokio::test]
async fn stale_jobs_are_swept_as_abandoned() {
    let env = setup().await;

    sqlx::query(
        "INSERT INTO jobs (id, type, target_id, target_name, pattern, status, created_at) \
         VALUES ('stale', 'conversation', 'conv-x', 'Target', 'summarize', 'running', ?)",
    )
    .bind(now_ts() - 3600)
    .execute(&env.pool)
    .await
    .unwrap();
    sqlx::query(
        "INSERT INTO jobs (id, type, target_id, target_name, pattern, status, created_at, last_heartbeat_at) \
         VALUES ('fresh', 'conversation', 'conv-x', 'Target', 'extract_wisdom', 'running', ?, ?)",
    )
    .bind(now_ts())
    .bind(now_ts())
    .execute(&env.pool)
    .await
    .unwrap();

    let swept = jobs::recover_abandoned(&env.pool, 300).await.unwrap();
    assert_eq!(swept, 1);

    let stale = store::get_job(&env.pool, "stale").await.unwrap().unwrap();
    assert_eq!(stale.status, JobStatus::Failed);
    assert_eq!(stale.error.as_deref(), Some("abandoned"));

    let fresh = store::get_job(&env.pool, "fresh").await.unwrap().unwrap();
    assert_eq!(fresh.status, JobStatus::Running);
}

#[tokio::test]
async fn stream_emits_exactly_one_terminal_event() {
    let env = setup().await;
    let coord = coordinator(&env);

    let job = coord.submit(&summarize_request()).await.unwrap();

    // Drive the job to done from a parallel task while the stream polls.
    let pool = env.pool.clone();
    let job_id = job.id.clone();
    let updater = tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(1500)).await;
        sqlx::query("UPDATE jobs SET status = 'done', result_path = 'x.pdf' WHERE id = ?")
            .bind(&job_id)
            .execute(&pool)
            .await
            .unwrap();
    });

    let events: Vec<JobEvent> = coord.stream(job.id.clone()).collect().await;
    updater.await.unwrap();

    assert!(
        matches!(events.first(), Some(JobEvent::Progress { status, .. }) if *status == JobStatus::Pending),
        "first event must reflect the observed pending state"
    );
    let terminal_count = events.iter().filter(|e| e.is_terminal()).count();
    assert_eq!(terminal_count, 1, "exactly one terminal event");
    assert!(
        matches!(events.last(), Some(JobEvent::Done { result_path, .. }) if result_path.as_deref() == Some("x.pdf")),
        "stream must end with the done event"
    );
}

#[tokio::test]
async fn stream_of_missing_job_closes_silently() {
    let env = setup().await;
    let coord = coordinator(&env);

    let events: Vec<JobEvent> = coord.stream("no-such-job".to_string()).collect().await;
    assert!(events.is_empty());
}

// ============ Worker ============

fn write_script(dir: &std::path::Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join(name);
    std::fs::write(&path, body).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

#[tokio::test]
async fn worker_runs_job_to_done() {
    let mut env = setup().await;

    let scripts = env._tmp.path().join("bin");
    std::fs::create_dir_all(&scripts).unwrap();
    let pattern = write_script(
        &scripts,
        "fake-pattern",
        "#!/bin/sh\ncat > /dev/null\necho 'PATTERN OUTPUT'\n",
    );
    let render = write_script(&scripts, "fake-render", "#!/bin/sh\ncat > \"$1\"\n");

    env.config.worker.pattern_command = pattern.display().to_string();
    env.config.worker.render_command = render.display().to_string();
    env.config.worker.render_args = vec!["{output}".to_string()];

    let coord = coordinator(&env);
    let job = coord.submit(&summarize_request()).await.unwrap();

    worker::run_worker(&env.config, &job.id).await.unwrap();

    let done = store::get_job(&env.pool, &job.id).await.unwrap().unwrap();
    assert_eq!(done.status, JobStatus::Done);
    assert!(done.started_at.is_some());
    assert!(done.finished_at.is_some());
    let progress = done.progress.unwrap();
    assert_eq!(progress.current, progress.total);

    let rel = done.result_path.unwrap();
    let artifact = std::fs::read_to_string(env.cache_dir.join(&rel)).unwrap();
    assert!(artifact.contains("PATTERN OUTPUT"));
}

#[tokio::test]
async fn worker_failure_lands_on_the_job_row() {
    let mut env = setup().await;
    env.config.worker.pattern_command = "false".to_string();

    let coord = coordinator(&env);
    let job = coord.submit(&summarize_request()).await.unwrap();

    let err = worker::run_worker(&env.config, &job.id).await.unwrap_err();
    assert!(err.chain().any(|c| c.downcast_ref::<worker::SubprocessError>().is_some()));

    let failed = store::get_job(&env.pool, &job.id).await.unwrap().unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
    let message = failed.error.unwrap();
    assert!(!message.is_empty());
    assert!(!message.contains('\n'), "error must be a single line");
}

#[tokio::test]
async fn project_job_with_no_conversations_fails_cleanly() {
    let env = setup().await;

    sqlx::query(
        "INSERT INTO projects (gizmo_id, gizmo_type, display_name) \
         VALUES ('g-empty', 'gpt', 'Empty project')",
    )
    .execute(&env.pool)
    .await
    .unwrap();

    let coord = coordinator(&env);
    let job = coord
        .submit(&SubmitRequest {
            job_type: JobType::Project,
            target_id: "g-empty".to_string(),
            target_name: None,
            pattern: "summarize".to_string(),
        })
        .await
        .unwrap();

    let result = worker::run_worker(&env.config, &job.id).await;
    assert!(result.is_err());

    let failed = store::get_job(&env.pool, &job.id).await.unwrap().unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
    assert!(failed.error.unwrap().contains("no conversations"));
}
