use std::path::PathBuf;

use anyhow::Context;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

/// A fetched page written to disk for later inspection.
#[derive(Debug, Clone)]
pub struct PageSnapshot {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    /// True when an identical page was already on disk at the same path.
    pub deduplicated: bool,
}

/// Immutable, hash-addressed store of fetched search pages.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    root: PathBuf,
}

impl SnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    /// Filesystem-safe directory name for a source URL.
    pub fn source_slug(source_url: &str) -> String {
        let without_scheme = source_url
            .split_once("://")
            .map_or(source_url, |(_, rest)| rest);
        let slug = without_scheme
            .to_ascii_lowercase()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
            .collect::<String>()
            .split('-')
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("-");
        let slug: String = slug.chars().take(80).collect();
        if slug.is_empty() {
            "source".to_string()
        } else {
            slug
        }
    }

    pub fn snapshot_relative_path(&self, fetched_at: DateTime<Utc>, source_url: &str, content_hash: &str) -> PathBuf {
        PathBuf::from(fetched_at.format("%Y%m%d_%H%M%S").to_string())
            .join(Self::source_slug(source_url))
            .join(format!("{content_hash}.html"))
    }

    /// Writes the page through a temp file + rename so readers never see a
    /// partial snapshot.
    pub async fn store_page(
        &self,
        fetched_at: DateTime<Utc>,
        source_url: &str,
        markup: &str,
    ) -> anyhow::Result<PageSnapshot> {
        let bytes = markup.as_bytes();
        let content_hash = Self::sha256_hex(bytes);
        let relative_path = self.snapshot_relative_path(fetched_at, source_url, &content_hash);
        let absolute_path = self.root.join(&relative_path);
        let snapshot = |deduplicated| PageSnapshot {
            content_hash: content_hash.clone(),
            relative_path: relative_path.clone(),
            absolute_path: absolute_path.clone(),
            byte_size: bytes.len(),
            deduplicated,
        };

        let parent = absolute_path
            .parent()
            .context("snapshot path has no parent directory")?;
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating snapshot directory {}", parent.display()))?;

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking snapshot path {}", absolute_path.display()))?
        {
            return Ok(snapshot(true));
        }

        let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp snapshot {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp snapshot {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp snapshot {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &absolute_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "renaming snapshot {} -> {}",
                    temp_path.display(),
                    absolute_path.display()
                )
            });
        }
        Ok(snapshot(false))
    }
}
