//! The single write path used by every other component: contract, budget
//! state, breaker state, halt file, submission, and configuration
//! persistence all funnel through [`atomic_write`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;

/// `AGENT_HUB_DRY_RUN=1` suppresses writes and git mutations process-wide.
pub fn dry_run_enabled() -> bool {
    std::env::var("AGENT_HUB_DRY_RUN")
        .map(|v| v == "1")
        .unwrap_or(false)
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.push_str(".tmp");
    path.with_file_name(name)
}

/// Write `contents` to `path` atomically: write to `<path>.tmp`, fsync, then
/// rename over the target. Cleans up the temp file on any failure.
pub async fn atomic_write(path: &Path, contents: &str) -> anyhow::Result<()> {
    if dry_run_enabled() {
        tracing::info!(path = %path.display(), "dry-run: suppressing atomic_write");
        return Ok(());
    }

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating parent directory for {}", path.display()))?;
    }

    let temp_path = tmp_path(path);
    let write_result = write_and_fsync(&temp_path, contents).await;
    if let Err(err) = write_result {
        let _ = tokio::fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| format!("writing temp file for {}", path.display()));
    }

    if let Err(err) = tokio::fs::rename(&temp_path, path).await {
        let _ = tokio::fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| format!("renaming into place: {}", path.display()));
    }

    Ok(())
}

async fn write_and_fsync(temp_path: &Path, contents: &str) -> anyhow::Result<()> {
    use tokio::io::AsyncWriteExt;
    let mut file = tokio::fs::File::create(temp_path).await?;
    file.write_all(contents.as_bytes()).await?;
    file.sync_all().await?;
    Ok(())
}

/// Convenience wrapper for JSON documents, pretty-printed.
pub async fn atomic_write_json<T: serde::Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    let contents = serde_json::to_string_pretty(value)?;
    atomic_write(path, &contents).await
}

/// Reads a file, backing off briefly (up to ~600ms across bounded retries)
/// while a `.tmp` sibling exists, to avoid racing an in-progress atomic
/// write. Returns `Ok(None)` if the file does not exist.
pub async fn safe_read(path: &Path) -> anyhow::Result<Option<String>> {
    let temp_path = tmp_path(path);
    const RETRIES: u32 = 3;

    for attempt in 0..RETRIES {
        if tokio::fs::try_exists(&temp_path).await.unwrap_or(false) {
            tokio::time::sleep(Duration::from_millis(200 * (attempt as u64 + 1))).await;
            continue;
        }
        if !tokio::fs::try_exists(path).await.unwrap_or(false) {
            return Ok(None);
        }
        match tokio::fs::read_to_string(path).await {
            Ok(contents) => return Ok(Some(contents)),
            Err(err) if attempt + 1 == RETRIES => {
                return Err(err).with_context(|| format!("reading {}", path.display()))
            }
            Err(_) => tokio::time::sleep(Duration::from_millis(200 * (attempt as u64 + 1))).await,
        }
    }
    Ok(None)
}

pub async fn safe_read_json<T: serde::de::DeserializeOwned>(
    path: &Path,
) -> anyhow::Result<Option<T>> {
    match safe_read(path).await? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

/// Moves `path` into `archive_dir`, appending a numeric suffix on collision.
/// Used for post-merge task archival (`_handoff/archive/<task_id>/`).
pub async fn archive_file(path: &Path, archive_dir: &Path) -> anyhow::Result<PathBuf> {
    if dry_run_enabled() {
        tracing::info!(path = %path.display(), dest = %archive_dir.display(), "dry-run: suppressing archive_file");
        return Ok(path.to_path_buf());
    }

    tokio::fs::create_dir_all(archive_dir).await?;
    let file_name = path
        .file_name()
        .context("archived path has no file name")?
        .to_string_lossy()
        .into_owned();

    let mut target = archive_dir.join(&file_name);
    let mut counter = 1u32;
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    while tokio::fs::try_exists(&target).await.unwrap_or(false) {
        target = archive_dir.join(format!("{stem}_{counter}{ext}"));
        counter += 1;
    }

    tokio::fs::rename(path, &target).await?;
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn temp_dir() -> PathBuf {
        std::env::temp_dir().join(format!("agent-hub-storage-test-{}", Uuid::new_v4()))
    }

    #[tokio::test]
    async fn atomic_write_then_read_round_trips() {
        let dir = temp_dir();
        let path = dir.join("contract.json");
        atomic_write(&path, "{\"a\":1}").await.unwrap();
        let read_back = safe_read(&path).await.unwrap().unwrap();
        assert_eq!(read_back, "{\"a\":1}");
        tokio::fs::remove_dir_all(&dir).await.ok();
    }

    #[tokio::test]
    async fn safe_read_missing_file_returns_none() {
        let dir = temp_dir();
        let path = dir.join("missing.json");
        assert!(safe_read(&path).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn archive_file_dedupes_on_collision() {
        let dir = temp_dir();
        let archive_dir = dir.join("archive");
        let source_a = dir.join("a.json");
        let source_b = dir.join("a_dup.json");
        atomic_write(&source_a, "one").await.unwrap();
        atomic_write(&source_b, "two").await.unwrap();

        let first = archive_file(&source_a, &archive_dir).await.unwrap();
        assert_eq!(first, archive_dir.join("a.json"));

        // rename source_b to look like a second "a.json" collision
        tokio::fs::rename(&source_b, dir.join("a.json")).await.unwrap();
        let second = archive_file(&dir.join("a.json"), &archive_dir).await.unwrap();
        assert_eq!(second, archive_dir.join("a_1.json"));

        tokio::fs::remove_dir_all(&dir).await.ok();
    }

    #[tokio::test]
    async fn dry_run_suppresses_writes() {
        std::env::set_var("AGENT_HUB_DRY_RUN", "1");
        let dir = temp_dir();
        let path = dir.join("never.json");
        atomic_write(&path, "x").await.unwrap();
        assert!(!tokio::fs::try_exists(&path).await.unwrap_or(false));
        std::env::remove_var("AGENT_HUB_DRY_RUN");
    }
}
