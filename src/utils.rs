use crate::error::Result;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::fs;

/// 字节数 + 秒数 -> Mbps
/// 约定: 1 Mbps = 1024 bytes/s * 8 / 1000, 即 (bytes / 1024 / secs) / 128
pub fn to_mbps(bytes: u64, secs: f64) -> f64 {
    if secs <= 0.0 {
        return 0.0;
    }
    (bytes as f64 / 1024.0 / secs) / 128.0
}

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Local wall-clock timestamp used in result records.
pub fn now_timestamp() -> String {
    chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

/// 备份文件 (如果有)
/// 文件名格式: original.ext -> original.ext.bak.TIMESTAMP
pub async fn backup_file(path: &Path) -> Result<Option<PathBuf>> {
    if !fs::try_exists(path).await.unwrap_or(false) {
        return Ok(None);
    }
    let timestamp = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs();
    let file_name = path.file_name().unwrap_or_default().to_string_lossy();
    let backup_path = path.with_file_name(format!("{}.bak.{}", file_name, timestamp));

    fs::copy(path, &backup_path).await?;
    tracing::info!(?backup_path, "Backup created");
    Ok(Some(backup_path))
}

/// Spinner used by the CLI while a search is running.
pub fn search_spinner() -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    // 模板是常量，解析失败时退回默认样式
    let style = ProgressStyle::with_template("{spinner:.cyan} [{elapsed_precise}] {prefix} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner());
    pb.set_style(style);
    pb.enable_steady_tick(Duration::from_millis(120));
    pb
}
