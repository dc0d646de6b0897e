use std::path::{Path, PathBuf};
use anyhow::Context;
use tokio::fs::{create_dir_all, rename, File};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};

pub async fn prepare_parent(path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        create_dir_all(parent)
            .await
            .with_context(|| format!("Could not create directory {}", parent.display()))?;
    }
    Ok(())
}

pub async fn read_io_file(path: &Path) -> anyhow::Result<Option<Vec<u8>>> {
    if !path.exists() {
        return Ok(None);
    }
    let mut bytes = Vec::new();
    BufReader::new(File::open(path).await?).read_to_end(&mut bytes).await?;
    Ok(Some(bytes))
}

/// Replaces `path` with `bytes`; readers see either the old or the new contents.
pub async fn write_io_file(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    prepare_parent(path).await?;
    let tmp = temp_sibling(path);
    let mut file = File::create(&tmp)
        .await
        .with_context(|| format!("Could not create {}", tmp.display()))?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    drop(file);
    rename(&tmp, path)
        .await
        .with_context(|| format!("Could not replace {}", path.display()))?;
    Ok(())
}

fn temp_sibling(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "data".into());
    name.push(".tmp");
    path.with_file_name(name)
}
