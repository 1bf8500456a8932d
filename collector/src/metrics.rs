//! The run metrics artifact: one JSON object, replaced atomically.

use common::{Result, RunMetrics, TelemetryError};
use std::path::{Path, PathBuf};
use tokio::fs;

fn temp_path(path: &Path) -> Result<PathBuf> {
    let name = path
        .file_name()
        .ok_or_else(|| {
            TelemetryError::ConfigError(format!("metrics path {} has no file name", path.display()))
        })?
        .to_string_lossy();
    Ok(path.with_file_name(format!(".{}.{}.tmp", name, std::process::id())))
}

/// Writes `metrics` to a sibling temp file and renames it over `path`, so
/// readers never observe a partial artifact.
pub async fn write_metrics(path: &Path, metrics: &RunMetrics) -> Result<()> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir).await?;
    }

    let tmp = temp_path(path)?;
    let body = serde_json::to_vec_pretty(metrics)?;
    fs::write(&tmp, body).await?;
    if let Err(e) = fs::rename(&tmp, path).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(())
}

pub async fn read_metrics(path: &Path) -> Result<RunMetrics> {
    let body = fs::read(path).await?;
    Ok(serde_json::from_slice(&body)?)
}
