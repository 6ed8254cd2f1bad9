use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub db: DbConfig,
    pub cache: CacheConfig,
    pub export: ExportConfig,
    pub chunking: ChunkingConfig,
    pub retrieval: RetrievalConfig,
    pub server: ServerConfig,
    pub worker: WorkerConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DbConfig {
    pub path: PathBuf,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("chatvault.sqlite3"),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CacheConfig {
    /// Directory holding job result artifacts. `result_path` on a job row is
    /// relative to this directory.
    pub dir: PathBuf,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("generated"),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ExportConfig {
    /// Default output directory for server-triggered bulk exports.
    pub dir: PathBuf,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("exports"),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ChunkingConfig {
    /// Target chunk size in characters.
    pub target_size: usize,
    /// Overlap between consecutive chunks in characters.
    pub overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            target_size: 2500,
            overlap: 300,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Default maximum number of search hits.
    pub limit: i64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self { limit: 50 }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:7799".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct WorkerConfig {
    /// External AI-pattern executable. Receives `-p <pattern>` plus
    /// `pattern_args`, the rendered target on stdin, and writes markdown to
    /// stdout.
    pub pattern_command: String,
    /// Extra arguments appended to every pattern invocation (model, vendor,
    /// language flags and the like).
    pub pattern_args: Vec<String>,
    /// Markdown-to-artifact renderer. `{output}` in `render_args` is replaced
    /// with the artifact path; markdown arrives on stdin.
    pub render_command: String,
    pub render_args: Vec<String>,
    /// Override for the worker executable. Defaults to the current binary.
    pub worker_bin: Option<String>,
    /// Non-terminal jobs whose heartbeat is older than this are considered
    /// abandoned at server startup.
    pub heartbeat_timeout_secs: i64,
    pub pattern_timeout_secs: u64,
    pub render_timeout_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            pattern_command: "fabric".to_string(),
            pattern_args: Vec::new(),
            render_command: "wkhtmltopdf".to_string(),
            render_args: vec![
                "--quiet".to_string(),
                "-".to_string(),
                "{output}".to_string(),
            ],
            worker_bin: None,
            heartbeat_timeout_secs: 300,
            pattern_timeout_secs: 300,
            render_timeout_secs: 120,
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

/// Load the config at `path`, falling back to defaults when the file does not
/// exist and the path was not explicitly requested.
pub fn load_or_default(path: &Path, explicit: bool) -> Result<Config> {
    if path.exists() {
        load_config(path)
    } else if explicit {
        anyhow::bail!("Config file not found: {}", path.display())
    } else {
        Ok(Config::default())
    }
}

fn validate(config: &Config) -> Result<()> {
    if config.chunking.target_size == 0 {
        anyhow::bail!("chunking.target_size must be > 0");
    }
    if config.chunking.overlap >= config.chunking.target_size {
        anyhow::bail!("chunking.overlap must be smaller than chunking.target_size");
    }
    if config.retrieval.limit < 1 {
        anyhow::bail!("retrieval.limit must be >= 1");
    }
    Ok(())
}
