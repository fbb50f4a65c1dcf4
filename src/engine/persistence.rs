//! 注册表持久化：原子替换写盘、加载与恢复规范化

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use tokio::sync::Mutex;

use crate::engine::entry::{part_path, ChunkState, DownloadEntry};
use crate::engine::error::EngineError;
use crate::engine::types::{ChunkStatus, DownloadId, DownloadStatus};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedChunk {
    pub id: u32,
    pub start: u64,
    pub end: u64,
    pub status: ChunkStatus,
    pub downloaded: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedEntry {
    pub id: DownloadId,
    pub url: String,
    pub filename: String,
    pub final_path: PathBuf,
    pub temp_dir: Option<PathBuf>,
    pub total_size: u64,
    pub downloaded_size: u64,
    pub status: DownloadStatus,
    pub error: Option<String>,
    pub created_at: i64,
    pub chunks: Vec<PersistedChunk>,
}

/// 存档是 (id, entry) 对的有序序列，顺序即注册顺序
pub fn load_store(path: &Path) -> Result<Vec<(DownloadId, PersistedEntry)>, EngineError> {
    let text = std::fs::read_to_string(path)?;
    let pairs = serde_json::from_str(&text)?;
    Ok(pairs)
}

/// 整体替换写入：先写同目录临时文件再改名，崩溃不会留下半截存档
pub async fn save_store(
    path: &Path,
    entries: &[(DownloadId, PersistedEntry)],
) -> Result<(), EngineError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let json = serde_json::to_string_pretty(entries)?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, json).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

/// 启动时的恢复规范化：
/// - downloading / queued / assembling 一律回到 queued（assembling 重新准入后
///   所有分块已就绪，会直接再走一次合并）；
/// - 临时目录仍在：各分块进度以磁盘上的分块文件大小为准，下载中的分块回 pending；
/// - 临时目录丢失：进度不可恢复，全部清零、回 pending；
/// - 聚合进度重新求和。
pub fn normalize_loaded(entry: &mut PersistedEntry) {
    entry.status = match entry.status {
        DownloadStatus::Downloading | DownloadStatus::Queued | DownloadStatus::Assembling => {
            DownloadStatus::Queued
        }
        other => other,
    };
    if entry.status != DownloadStatus::Complete {
        let temp_ok = entry
            .temp_dir
            .as_deref()
            .map(Path::is_dir)
            .unwrap_or(false);
        if temp_ok {
            // 上面刚校验过 temp_dir 存在
            if let Some(dir) = entry.temp_dir.as_deref() {
                for chunk in &mut entry.chunks {
                    let chunk_len = if chunk.end < chunk.start {
                        0
                    } else {
                        chunk.end - chunk.start + 1
                    };
                    let on_disk = std::fs::metadata(part_path(dir, chunk.id))
                        .map(|m| m.len())
                        .unwrap_or(0);
                    chunk.downloaded = on_disk.min(chunk_len);
                    if chunk.status == ChunkStatus::Downloading {
                        chunk.status = ChunkStatus::Pending;
                    }
                }
            }
        } else {
            for chunk in &mut entry.chunks {
                chunk.downloaded = 0;
                chunk.status = ChunkStatus::Pending;
            }
        }
    }
    entry.downloaded_size = entry.chunks.iter().map(|c| c.downloaded).sum();
}

impl DownloadEntry {
    pub(crate) fn from_persisted(p: PersistedEntry) -> Self {
        let chunks = p
            .chunks
            .into_iter()
            .map(|c| ChunkState::new(c.id, c.start, c.end, c.status, c.downloaded))
            .collect();
        Self {
            id: p.id,
            url: p.url,
            filename: p.filename,
            final_path: p.final_path,
            total_size: p.total_size,
            created_at: p.created_at,
            status: Mutex::new(p.status),
            error: Mutex::new(p.error),
            temp_dir: Mutex::new(p.temp_dir),
            chunks,
            active: Mutex::new(Default::default()),
        }
    }
}

impl PersistedEntry {
    pub(crate) async fn from_entry(entry: &DownloadEntry) -> Self {
        let status = *entry.status.lock().await;
        let error = entry.error.lock().await.clone();
        let temp_dir = entry.temp_dir.lock().await.clone();
        let mut chunks = Vec::with_capacity(entry.chunks.len());
        for c in &entry.chunks {
            chunks.push(PersistedChunk {
                id: c.index,
                start: c.start,
                end: c.end,
                status: *c.status.lock().await,
                downloaded: c.downloaded.load(Ordering::Relaxed),
            });
        }
        let downloaded_size = chunks.iter().map(|c| c.downloaded).sum();
        Self {
            id: entry.id.clone(),
            url: entry.url.clone(),
            filename: entry.filename.clone(),
            final_path: entry.final_path.clone(),
            temp_dir,
            total_size: entry.total_size,
            downloaded_size,
            status,
            error,
            created_at: entry.created_at,
            chunks,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::types::chunk_ranges;

    fn persisted(total: u64, status: DownloadStatus, temp_dir: Option<PathBuf>) -> PersistedEntry {
        let chunks = chunk_ranges(total, 8)
            .into_iter()
            .enumerate()
            .map(|(i, (start, end))| PersistedChunk {
                id: i as u32,
                start,
                end,
                status: ChunkStatus::Pending,
                downloaded: 0,
            })
            .collect();
        PersistedEntry {
            id: "1".into(),
            url: "http://host/a.bin".into(),
            filename: "a.bin".into(),
            final_path: PathBuf::from("/out/a.bin"),
            temp_dir,
            total_size: total,
            downloaded_size: 0,
            status,
            error: None,
            created_at: 0,
            chunks,
        }
    }

    #[test]
    fn interrupted_statuses_reload_as_queued() {
        for status in [
            DownloadStatus::Downloading,
            DownloadStatus::Queued,
            DownloadStatus::Assembling,
        ] {
            let mut e = persisted(1024, status, None);
            normalize_loaded(&mut e);
            assert_eq!(e.status, DownloadStatus::Queued);
        }
        let mut e = persisted(1024, DownloadStatus::Paused, None);
        normalize_loaded(&mut e);
        assert_eq!(e.status, DownloadStatus::Paused);
    }

    #[test]
    fn progress_adopts_on_disk_part_sizes() {
        let root = tempfile::tempdir().expect("tempdir");
        let temp = root.path().join("temp_1");
        std::fs::create_dir_all(&temp).expect("mkdir");
        std::fs::write(temp.join("part_0"), vec![0u8; 100]).expect("part_0");
        std::fs::write(temp.join("part_2"), vec![0u8; 128]).expect("part_2");

        let mut e = persisted(1024, DownloadStatus::Downloading, Some(temp));
        e.chunks[0].status = ChunkStatus::Downloading;
        e.chunks[0].downloaded = 999; // 内存里的数字不可信
        e.chunks[2].status = ChunkStatus::Complete;

        normalize_loaded(&mut e);
        assert_eq!(e.status, DownloadStatus::Queued);
        assert_eq!(e.chunks[0].downloaded, 100);
        assert_eq!(e.chunks[0].status, ChunkStatus::Pending);
        assert_eq!(e.chunks[2].downloaded, 128);
        assert_eq!(e.chunks[2].status, ChunkStatus::Complete);
        assert_eq!(e.chunks[1].downloaded, 0);
        assert_eq!(e.downloaded_size, 228);
    }

    #[test]
    fn missing_temp_dir_restarts_from_zero() {
        let mut e = persisted(
            1024,
            DownloadStatus::Paused,
            Some(PathBuf::from("/nonexistent/temp_1")),
        );
        e.chunks[1].downloaded = 50;
        e.chunks[1].status = ChunkStatus::Complete;
        normalize_loaded(&mut e);
        assert_eq!(e.chunks[1].downloaded, 0);
        assert_eq!(e.chunks[1].status, ChunkStatus::Pending);
        assert_eq!(e.downloaded_size, 0);
    }

    #[test]
    fn complete_entries_are_left_untouched() {
        let mut e = persisted(1024, DownloadStatus::Complete, None);
        for c in &mut e.chunks {
            c.status = ChunkStatus::Complete;
            c.downloaded = c.end - c.start + 1;
        }
        normalize_loaded(&mut e);
        assert_eq!(e.status, DownloadStatus::Complete);
        assert!(e.chunks.iter().all(|c| c.status == ChunkStatus::Complete));
        assert_eq!(e.downloaded_size, 1024);
    }

    #[tokio::test]
    async fn store_round_trips_and_leaves_no_temp_file() {
        let root = tempfile::tempdir().expect("tempdir");
        let path = root.path().join("downloads.json");
        let pairs = vec![
            ("1".to_string(), persisted(1024, DownloadStatus::Queued, None)),
            ("2".to_string(), persisted(64, DownloadStatus::Paused, None)),
        ];
        save_store(&path, &pairs).await.expect("save");
        assert!(!path.with_extension("json.tmp").exists());

        let loaded = load_store(&path).expect("load");
        assert_eq!(loaded.len(), 2);
        // 注册顺序随存档保持
        assert_eq!(loaded[0].0, "1");
        assert_eq!(loaded[1].0, "2");
        assert_eq!(loaded[1].1.total_size, 64);
        assert_eq!(loaded[1].1.status, DownloadStatus::Paused);
    }

    #[test]
    fn malformed_store_is_an_error() {
        let root = tempfile::tempdir().expect("tempdir");
        let path = root.path().join("downloads.json");
        std::fs::write(&path, "{not json").expect("write");
        assert!(load_store(&path).is_err());
    }
}
