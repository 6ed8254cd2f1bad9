//! AI-pattern job coordination.
//!
//! Jobs are persisted state plus out-of-process workers; the server never
//! holds in-memory references to running work. Every transition is
//! materialized in the `jobs` table, which makes the subsystem crash-safe:
//! stale non-terminal rows are swept to `failed` on startup.
//!
//! # Submission
//!
//! `submit` validates the pattern against the fixed enumeration for the job
//! type, honors an existing `done` row whose artifact is still on disk
//! (cache hit), returns an existing pending/running row (deduplication), and
//! otherwise inserts a `pending` row and spawns a detached worker process.
//! At most one job per `(target_id, pattern)` is ever live.
//!
//! # Streaming
//!
//! `stream` polls the store at 1 Hz and emits one event per observed change:
//! `progress` on status/progress updates, then exactly one terminal `done`
//! or `failed`, after which the stream closes. Consumers that disconnect
//! simply drop the stream; the job is unaffected.

use anyhow::Result;
use futures::Stream;
use sqlx::SqlitePool;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

use crate::models::{
    now_ts, pattern_allowed, Job, JobProgress, JobStatus, JobType,
};
use crate::store;

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("unknown pattern '{pattern}' for {job_type} jobs")]
    InvalidPattern { job_type: &'static str, pattern: String },
    #[error("target not found: {0}")]
    TargetNotFound(String),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct SubmitRequest {
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub target_id: String,
    #[serde(default)]
    pub target_name: Option<String>,
    pub pattern: String,
}

/// How to start a worker process. Tests point this at a no-op binary.
#[derive(Debug, Clone)]
pub struct WorkerSpawner {
    pub program: PathBuf,
    /// Arguments placed before `worker --job-id <id>` (config and path
    /// overrides, so the worker sees the same store and cache).
    pub args: Vec<String>,
}

impl WorkerSpawner {
    pub fn from_config(
        config: &crate::config::Config,
        config_path: Option<&Path>,
    ) -> Result<Self> {
        let program = match &config.worker.worker_bin {
            Some(bin) => PathBuf::from(bin),
            None => std::env::current_exe()?,
        };
        let mut args = Vec::new();
        if let Some(path) = config_path {
            args.push("--config".to_string());
            args.push(path.display().to_string());
        }
        args.push("--db".to_string());
        args.push(config.db.path.display().to_string());
        args.push("--cache-dir".to_string());
        args.push(config.cache.dir.display().to_string());
        Ok(Self { program, args })
    }
}

/// Events emitted by [`Coordinator::stream`].
#[derive(Debug, Clone, serde::Serialize)]
#[serde(untagged)]
pub enum JobEvent {
    Progress {
        status: JobStatus,
        progress: Option<JobProgress>,
    },
    Done {
        status: JobStatus,
        result_path: Option<String>,
    },
    Failed {
        status: JobStatus,
        error: String,
    },
}

impl JobEvent {
    pub fn name(&self) -> &'static str {
        match self {
            JobEvent::Progress { .. } => "progress",
            JobEvent::Done { .. } => "done",
            JobEvent::Failed { .. } => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobEvent::Progress { .. })
    }
}

pub struct Coordinator {
    pool: SqlitePool,
    cache_dir: PathBuf,
    spawner: WorkerSpawner,
}

impl Coordinator {
    pub fn new(pool: SqlitePool, cache_dir: PathBuf, spawner: WorkerSpawner) -> Self {
        Self {
            pool,
            cache_dir,
            spawner,
        }
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Absolute path of a job's artifact, given the stored relative path.
    pub fn artifact_path(&self, result_path: &str) -> PathBuf {
        self.cache_dir.join(result_path)
    }

    /// Relative cache path for a `(type, target, pattern)` triple. Stable, so
    /// a finished artifact doubles as the cache key.
    pub fn artifact_rel_path(job_type: JobType, target_id: &str, pattern: &str) -> String {
        let safe_target: String = target_id
            .chars()
            .map(|c| if c == '/' || c == '\\' { '_' } else { c })
            .collect();
        format!("{}s/{}/{}.pdf", job_type.as_str(), safe_target, pattern)
    }

    pub async fn submit(&self, req: &SubmitRequest) -> Result<Job, SubmitError> {
        if !pattern_allowed(req.job_type, &req.pattern) {
            return Err(SubmitError::InvalidPattern {
                job_type: req.job_type.as_str(),
                pattern: req.pattern.clone(),
            });
        }

        let target_name = self.resolve_target_name(req).await?;

        // Cache hit: a finished job whose artifact survived on disk.
        if let Some(job) = store::find_job_by_target(
            &self.pool,
            &req.target_id,
            &req.pattern,
            &[JobStatus::Done],
        )
        .await?
        {
            if let Some(rel) = &job.result_path {
                if self.artifact_path(rel).is_file() {
                    return Ok(job);
                }
            }
            // Artifact gone; the done row no longer counts.
        }

        // Deduplication: at most one live job per (target_id, pattern).
        if let Some(job) = store::find_job_by_target(
            &self.pool,
            &req.target_id,
            &req.pattern,
            &[JobStatus::Pending, JobStatus::Running],
        )
        .await?
        {
            return Ok(job);
        }

        let id = uuid::Uuid::new_v4().to_string();
        let created_at = now_ts();
        sqlx::query(
            r#"
            INSERT INTO jobs (id, type, target_id, target_name, pattern, status, created_at)
            VALUES (?, ?, ?, ?, ?, 'pending', ?)
            "#,
        )
        .bind(&id)
        .bind(req.job_type.as_str())
        .bind(&req.target_id)
        .bind(&target_name)
        .bind(&req.pattern)
        .bind(created_at)
        .execute(&self.pool)
        .await
        .map_err(anyhow::Error::from)?;

        if let Err(e) = self.spawn_worker(&id) {
            warn!(job = %id, error = %e, "failed to spawn worker");
            sqlx::query(
                "UPDATE jobs SET status = 'failed', error = ?, finished_at = ? WHERE id = ?",
            )
            .bind(format!("failed to spawn worker: {}", e))
            .bind(now_ts())
            .bind(&id)
            .execute(&self.pool)
            .await
            .map_err(anyhow::Error::from)?;
        } else {
            info!(job = %id, pattern = %req.pattern, target = %req.target_id, "job submitted");
        }

        store::get_job(&self.pool, &id)
            .await?
            .ok_or_else(|| SubmitError::Store(anyhow::anyhow!("job row vanished after insert")))
    }

    async fn resolve_target_name(&self, req: &SubmitRequest) -> Result<String, SubmitError> {
        if let Some(name) = req.target_name.as_deref().map(str::trim) {
            if !name.is_empty() {
                return Ok(name.to_string());
            }
        }
        match req.job_type {
            JobType::Conversation => store::get_conversation(&self.pool, &req.target_id)
                .await?
                .map(|c| c.title)
                .ok_or_else(|| SubmitError::TargetNotFound(req.target_id.clone())),
            JobType::Project => {
                let name: Option<String> =
                    sqlx::query_scalar("SELECT display_name FROM projects WHERE gizmo_id = ?")
                        .bind(&req.target_id)
                        .fetch_optional(&self.pool)
                        .await
                        .map_err(anyhow::Error::from)?;
                name.ok_or_else(|| SubmitError::TargetNotFound(req.target_id.clone()))
            }
        }
    }

    fn spawn_worker(&self, job_id: &str) -> std::io::Result<()> {
        let mut cmd = tokio::process::Command::new(&self.spawner.program);
        cmd.args(&self.spawner.args)
            .arg("worker")
            .arg("--job-id")
            .arg(job_id)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(false);
        cmd.spawn().map(|_| ())
    }

    /// Cache/deduplication probe: the live or validly cached job for a
    /// target/pattern pair, if any.
    pub async fn check(&self, target_id: &str, pattern: &str) -> Result<Option<Job>> {
        if let Some(job) = store::find_job_by_target(
            &self.pool,
            target_id,
            pattern,
            &[JobStatus::Pending, JobStatus::Running],
        )
        .await?
        {
            return Ok(Some(job));
        }
        if let Some(job) =
            store::find_job_by_target(&self.pool, target_id, pattern, &[JobStatus::Done]).await?
        {
            if let Some(rel) = &job.result_path {
                if self.artifact_path(rel).is_file() {
                    return Ok(Some(job));
                }
            }
        }
        Ok(None)
    }

    /// Delete a job row and its artifact. Does not signal a running worker;
    /// the worker finishes (or fails) against a row that no longer exists.
    pub async fn delete(&self, job_id: &str) -> Result<bool> {
        let job = match store::get_job(&self.pool, job_id).await? {
            Some(j) => j,
            None => return Ok(false),
        };

        if let Some(rel) = &job.result_path {
            let path = self.artifact_path(rel);
            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %e, "failed to remove artifact");
                }
            }
        }

        sqlx::query("DELETE FROM jobs WHERE id = ?")
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(true)
    }

    /// Poll-driven event stream for one job. Emits the current state
    /// immediately, then one event per change, then exactly one terminal
    /// event. Closes silently if the job row disappears.
    pub fn stream(&self, job_id: String) -> impl Stream<Item = JobEvent> {
        struct State {
            pool: SqlitePool,
            job_id: String,
            last: Option<(JobStatus, Option<JobProgress>)>,
            first: bool,
            terminal_sent: bool,
        }

        futures::stream::unfold(
            State {
                pool: self.pool.clone(),
                job_id,
                last: None,
                first: true,
                terminal_sent: false,
            },
            |mut st| async move {
                if st.terminal_sent {
                    return None;
                }
                loop {
                    if st.first {
                        st.first = false;
                    } else {
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }

                    let job = match store::get_job(&st.pool, &st.job_id).await {
                        Ok(Some(j)) => j,
                        Ok(None) | Err(_) => return None,
                    };

                    match job.status {
                        JobStatus::Done => {
                            st.terminal_sent = true;
                            return Some((
                                JobEvent::Done {
                                    status: job.status,
                                    result_path: job.result_path,
                                },
                                st,
                            ));
                        }
                        JobStatus::Failed => {
                            st.terminal_sent = true;
                            return Some((
                                JobEvent::Failed {
                                    status: job.status,
                                    error: job.error.unwrap_or_default(),
                                },
                                st,
                            ));
                        }
                        _ => {
                            let key = (job.status, job.progress.clone());
                            if st.last.as_ref() != Some(&key) {
                                st.last = Some(key);
                                return Some((
                                    JobEvent::Progress {
                                        status: job.status,
                                        progress: job.progress,
                                    },
                                    st,
                                ));
                            }
                        }
                    }
                }
            },
        )
    }
}

/// Sweep non-terminal jobs whose heartbeat went stale (dead workers, crashed
/// server). Returns the number of jobs transitioned to failed.
pub async fn recover_abandoned(pool: &SqlitePool, max_age_secs: i64) -> Result<u64> {
    let cutoff = now_ts() - max_age_secs;
    let result = sqlx::query(
        r#"
        UPDATE jobs
        SET status = 'failed', error = 'abandoned', finished_at = ?
        WHERE status IN ('pending', 'running')
          AND COALESCE(last_heartbeat_at, started_at, created_at) < ?
        "#,
    )
    .bind(now_ts())
    .bind(cutoff)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}
