//! Checkpoint artifacts live in one flat directory; the `<id>_<cp>.txt`
//! name is the only index. Mappers persist their stream cursor as ASCII,
//! reducers persist their aggregate as JSON.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Context;

pub fn file(dir: &Path, id: &str, checkpoint_id: i64) -> PathBuf {
    dir.join(format!("{id}_{checkpoint_id}.txt"))
}

pub async fn write_cursor(
    dir: &Path,
    id: &str,
    checkpoint_id: i64,
    cursor: &str,
) -> anyhow::Result<()> {
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("creating checkpoint directory {}", dir.display()))?;
    let path = file(dir, id, checkpoint_id);
    tokio::fs::write(&path, format!("{cursor}\n"))
        .await
        .with_context(|| format!("writing cursor checkpoint {}", path.display()))
}

pub async fn read_cursor(dir: &Path, id: &str, checkpoint_id: i64) -> anyhow::Result<String> {
    let path = file(dir, id, checkpoint_id);
    let raw = tokio::fs::read_to_string(&path)
        .await
        .with_context(|| format!("reading cursor checkpoint {}", path.display()))?;
    Ok(raw.trim().to_string())
}

pub async fn write_counts(
    dir: &Path,
    id: &str,
    checkpoint_id: i64,
    counts: &HashMap<String, u64>,
) -> anyhow::Result<()> {
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("creating checkpoint directory {}", dir.display()))?;
    let path = file(dir, id, checkpoint_id);
    let body = serde_json::to_vec(counts).context("serializing the aggregate")?;
    tokio::fs::write(&path, body)
        .await
        .with_context(|| format!("writing aggregate checkpoint {}", path.display()))
}

pub async fn read_counts(
    dir: &Path,
    id: &str,
    checkpoint_id: i64,
) -> anyhow::Result<HashMap<String, u64>> {
    let path = file(dir, id, checkpoint_id);
    let raw = tokio::fs::read(&path)
        .await
        .with_context(|| format!("reading aggregate checkpoint {}", path.display()))?;
    serde_json::from_slice(&raw).with_context(|| format!("parsing {}", path.display()))
}
