//! Corpus statistics command.
//!
//! Prints the dashboard totals plus the database location and size, so a
//! quick `chatvault stats` confirms imports and chunking worked.

use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::store;

pub async fn run_stats(config: &Config, pool: &SqlitePool) -> Result<()> {
    let stats = store::stats(pool).await?;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("chatvault — store stats");
    println!("=======================");
    println!();
    println!("  Database:      {}", config.db.path.display());
    println!("  Size:          {}", format_bytes(db_size));
    println!();
    println!("  Conversations: {}", stats.conversations);
    println!("  Messages:      {}", stats.messages);
    println!("  Chunks:        {}", stats.chunks);
    println!("  Projects:      {}", stats.projects);
    println!();

    Ok(())
}

fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}
