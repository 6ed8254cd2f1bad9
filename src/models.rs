//! Core data models.
//!
//! These types represent the conversations, messages, chunks, projects, and
//! jobs that flow through the pipeline:
//!
//! ```text
//! archive → parse() → ParsedConversation → ingest() → Conversation/Message
//!                                                          ↓
//!                                              chunk() → Chunk
//!                                              search() → SearchHit
//!                                              submit() → Job → Worker
//! ```

use serde::{Deserialize, Serialize};

/// Author role of a linearized turn. Anything the export uses that we do not
/// recognize folds into `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
    Unknown,
}

impl Role {
    pub fn parse(s: &str) -> Self {
        match s {
            "user" => Role::User,
            "assistant" => Role::Assistant,
            "system" => Role::System,
            "tool" => Role::Tool,
            _ => Role::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
            Role::Tool => "tool",
            Role::Unknown => "unknown",
        }
    }
}

/// Conversation row as persisted.
#[derive(Debug, Clone, Serialize)]
pub struct Conversation {
    pub id: String,
    pub title: String,
    pub created_at: i64,
    pub updated_at: i64,
    pub message_count: i64,
    pub default_model_slug: Option<String>,
    pub gizmo_id: Option<String>,
    /// SHA-256 of the canonical serialization of the source record.
    pub raw_hash: String,
    /// Project display name, populated by the project join on single fetch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_name: Option<String>,
}

/// Message row as persisted. `turn_index` is dense and 0-based within its
/// conversation along the chosen linearization path.
#[derive(Debug, Clone, Serialize)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub parent_id: Option<String>,
    pub role: String,
    pub content_type: String,
    pub content_text: String,
    pub created_at: i64,
    pub turn_index: i64,
    pub text_hash: String,
}

/// Overlapping window of conversation text. The id is a pure function of
/// `(conversation_id, start_turn, end_turn, target_size, overlap, text_hash)`.
#[derive(Debug, Clone, Serialize)]
pub struct Chunk {
    pub id: String,
    pub conversation_id: String,
    pub start_turn: i64,
    pub end_turn: i64,
    pub text: String,
    pub text_hash: String,
}

/// Gizmo grouping; many conversations map to one project via `gizmo_id`.
#[derive(Debug, Clone, Serialize)]
pub struct Project {
    pub gizmo_id: String,
    pub gizmo_type: String,
    pub display_name: String,
    pub conversation_count: i64,
}

/// A ranked full-text search hit. `rank` is the bm25 score (lower is better);
/// the substring fallback reports 0.0.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub message_id: String,
    pub conversation_id: String,
    pub role: String,
    pub snippet: String,
    pub created_at: i64,
    pub rank: f64,
}

/// Corpus totals shown on the dashboard.
#[derive(Debug, Clone, Serialize)]
pub struct Stats {
    pub conversations: i64,
    pub messages: i64,
    pub chunks: i64,
    pub projects: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobType {
    Conversation,
    Project,
}

impl JobType {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "conversation" => Some(JobType::Conversation),
            "project" => Some(JobType::Project),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Conversation => "conversation",
            JobType::Project => "project",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Done,
    Failed,
}

impl JobStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "running" => Some(JobStatus::Running),
            "done" => Some(JobStatus::Done),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Done => "done",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Failed)
    }
}

/// Patterns accepted for conversation jobs.
pub const CONVERSATION_PATTERNS: &[&str] = &[
    "extract_wisdom",
    "summarize",
    "analyze_debate",
    "rate_content",
    "create_report_finding",
];

/// Patterns accepted for project jobs.
pub const PROJECT_PATTERNS: &[&str] = &["summarize", "extract_wisdom", "analyze_paper"];

pub fn pattern_allowed(job_type: JobType, pattern: &str) -> bool {
    match job_type {
        JobType::Conversation => CONVERSATION_PATTERNS.contains(&pattern),
        JobType::Project => PROJECT_PATTERNS.contains(&pattern),
    }
}

/// Reasoning strategy passed to the pattern tool, chosen per pattern.
pub fn strategy_for(pattern: &str) -> Option<&'static str> {
    match pattern {
        "extract_wisdom" => Some("cot"),
        "summarize" => Some("self-refine"),
        "analyze_debate" => Some("cot"),
        "rate_content" => Some("self-consistent"),
        "create_report_finding" => Some("self-refine"),
        "analyze_paper" => Some("cot"),
        _ => None,
    }
}

/// Worker progress blob stored in the job's `progress` column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobProgress {
    pub current: i64,
    pub total: i64,
    pub message: String,
}

/// One AI-pattern job. Every transition is materialized in the store; the
/// server never holds in-memory references to running work.
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: String,
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub target_id: String,
    pub target_name: String,
    pub pattern: String,
    pub status: JobStatus,
    pub progress: Option<JobProgress>,
    pub result_path: Option<String>,
    pub error: Option<String>,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
}

pub fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}
