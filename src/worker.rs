//! Out-of-process job executor.
//!
//! Invoked as `chatvault worker --job-id <id>` by the coordinator. The
//! worker reads its job row, transitions it to `running`, renders the target
//! as markdown, pipes it through the external pattern tool, renders the
//! tool's output into the artifact via the configured renderer, and
//! transitions the job to `done` with the artifact's relative path. Any
//! failure lands on the job row as a one-line error; nothing propagates back
//! into the server process.
//!
//! Progress updates double as heartbeats: each write refreshes
//! `last_heartbeat_at`, which the startup sweep uses to detect dead workers.

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{error, info};

use crate::config::Config;
use crate::export;
use crate::jobs::Coordinator;
use crate::models::{now_ts, strategy_for, Job, JobType};
use crate::{db, migrate, store};

#[derive(Debug, Error)]
pub enum SubprocessError {
    #[error("failed to start {command}: {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },
    #[error("{command} exited with status {code}: {detail}")]
    Failed {
        command: String,
        code: i32,
        detail: String,
    },
    #[error("{command} timed out after {secs}s")]
    Timeout { command: String, secs: u64 },
}

pub async fn run_worker(config: &Config, job_id: &str) -> Result<()> {
    let pool = db::connect(&config.db.path).await?;
    migrate::run_migrations(&pool).await?;

    let job = store::get_job(&pool, job_id)
        .await?
        .with_context(|| format!("job not found: {}", job_id))?;

    sqlx::query(
        "UPDATE jobs SET status = 'running', started_at = ?, last_heartbeat_at = ? WHERE id = ?",
    )
    .bind(now_ts())
    .bind(now_ts())
    .bind(job_id)
    .execute(&pool)
    .await?;

    info!(job = %job.id, pattern = %job.pattern, "worker started");

    match execute(&pool, config, &job).await {
        Ok(rel_path) => {
            let updated = sqlx::query(
                "UPDATE jobs SET status = 'done', result_path = ?, finished_at = ?, \
                 last_heartbeat_at = ? WHERE id = ?",
            )
            .bind(&rel_path)
            .bind(now_ts())
            .bind(now_ts())
            .bind(job_id)
            .execute(&pool)
            .await?;

            // The job was deleted while we ran: ownership is detached, so the
            // artifact goes too.
            if updated.rows_affected() == 0 {
                let _ = std::fs::remove_file(config.cache.dir.join(&rel_path));
            }
            info!(job = %job.id, result = %rel_path, "worker finished");
            Ok(())
        }
        Err(e) => {
            let message = first_line(&e);
            error!(job = %job.id, error = %message, "worker failed");
            sqlx::query(
                "UPDATE jobs SET status = 'failed', error = ?, finished_at = ? WHERE id = ?",
            )
            .bind(&message)
            .bind(now_ts())
            .bind(job_id)
            .execute(&pool)
            .await?;
            Err(e)
        }
    }
}

async fn execute(pool: &SqlitePool, config: &Config, job: &Job) -> Result<String> {
    let rel_path = Coordinator::artifact_rel_path(job.job_type, &job.target_id, &job.pattern);
    let abs_path = config.cache.dir.join(&rel_path);

    let input = match job.job_type {
        JobType::Conversation => {
            update_progress(pool, &job.id, 0, 3, "Rendering conversation").await?;
            export::conversation_markdown(pool, &job.target_id, None).await?
        }
        JobType::Project => render_project(pool, job).await?,
    };

    update_progress(pool, &job.id, 1, 3, &format!("Running pattern {}", job.pattern)).await?;
    let pattern_output = run_pattern(config, &job.pattern, &input).await?;

    update_progress(pool, &job.id, 2, 3, "Rendering artifact").await?;
    render_artifact(config, &pattern_output, &abs_path).await?;

    update_progress(pool, &job.id, 3, 3, "Done").await?;
    Ok(rel_path)
}

/// Concatenate every conversation of a project, newest first, separated by a
/// thematic break, updating progress per conversation.
async fn render_project(pool: &SqlitePool, job: &Job) -> Result<String> {
    let ids: Vec<String> = sqlx::query_scalar(
        "SELECT id FROM conversations WHERE gizmo_id = ? ORDER BY updated_at DESC, id",
    )
    .bind(&job.target_id)
    .fetch_all(pool)
    .await?;

    if ids.is_empty() {
        anyhow::bail!("no conversations found for project {}", job.target_id);
    }

    let total = ids.len() as i64;
    let mut parts = Vec::with_capacity(ids.len());
    for (i, id) in ids.iter().enumerate() {
        update_progress(
            pool,
            &job.id,
            i as i64,
            total + 2,
            &format!("Rendering conversation {}/{}", i + 1, total),
        )
        .await?;
        parts.push(export::conversation_markdown(pool, id, None).await?);
    }
    Ok(parts.join("\n\n---\n\n"))
}

async fn update_progress(
    pool: &SqlitePool,
    job_id: &str,
    current: i64,
    total: i64,
    message: &str,
) -> Result<()> {
    let progress = serde_json::json!({
        "current": current,
        "total": total,
        "message": message,
    });
    sqlx::query("UPDATE jobs SET progress = ?, last_heartbeat_at = ? WHERE id = ?")
        .bind(progress.to_string())
        .bind(now_ts())
        .bind(job_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Run the external pattern tool with the rendered target on stdin.
async fn run_pattern(config: &Config, pattern: &str, input: &str) -> Result<String> {
    let mut args = vec!["-p".to_string(), pattern.to_string()];
    if let Some(strategy) = strategy_for(pattern) {
        args.push("--strategy".to_string());
        args.push(strategy.to_string());
    }
    args.extend(config.worker.pattern_args.iter().cloned());

    let output = run_piped(
        &config.worker.pattern_command,
        &args,
        input,
        config.worker.pattern_timeout_secs,
    )
    .await?;
    Ok(output)
}

/// Pipe the pattern output through the renderer, producing the artifact.
async fn render_artifact(config: &Config, markdown: &str, out_path: &std::path::Path) -> Result<()> {
    if let Some(parent) = out_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let args: Vec<String> = config
        .worker
        .render_args
        .iter()
        .map(|a| a.replace("{output}", &out_path.display().to_string()))
        .collect();

    run_piped(
        &config.worker.render_command,
        &args,
        markdown,
        config.worker.render_timeout_secs,
    )
    .await?;
    Ok(())
}

async fn run_piped(
    command: &str,
    args: &[String],
    input: &str,
    timeout_secs: u64,
) -> Result<String> {
    let mut child = tokio::process::Command::new(command)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| SubprocessError::Spawn {
            command: command.to_string(),
            source,
        })?;

    if let Some(mut stdin) = child.stdin.take() {
        // A fast-failing child may close stdin early; the exit status check
        // below reports the real error.
        let _ = stdin.write_all(input.as_bytes()).await;
        drop(stdin);
    }

    let output = tokio::time::timeout(
        Duration::from_secs(timeout_secs),
        child.wait_with_output(),
    )
    .await
    .map_err(|_| SubprocessError::Timeout {
        command: command.to_string(),
        secs: timeout_secs,
    })??;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(SubprocessError::Failed {
            command: command.to_string(),
            code: output.status.code().unwrap_or(-1),
            detail: stderr.lines().next().unwrap_or("").to_string(),
        }
        .into());
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

fn first_line(e: &anyhow::Error) -> String {
    let text = e.to_string();
    text.lines().next().unwrap_or("unknown error").to_string()
}
