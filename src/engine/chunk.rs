//! 分块工作器：一条 Range 请求，只追加写入自己的分块文件

use std::sync::Arc;
use std::sync::atomic::Ordering;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::engine::entry::{part_path, DownloadEntry};
use crate::engine::types::{ChunkStatus, DownloadStatus};
use crate::network;

/// 工作器终态，由监督器汇总
#[derive(Debug)]
pub(crate) enum ChunkOutcome {
    /// 区间字节已齐（含空块与进场即发现已完成）
    Completed,
    /// 被取消（暂停或整条中止），分块文件保持目标区间的有效前缀
    Cancelled,
    /// 条目已不在 downloading，未产生任何副作用
    Skipped,
    /// 请求或流中途失败；不重试，一个分块失败即整条失败
    Failed { message: String },
}

pub(crate) async fn run_chunk(
    entry: Arc<DownloadEntry>,
    index: usize,
    client: reqwest::Client,
    cancel: CancellationToken,
) -> ChunkOutcome {
    let outcome = fetch_chunk(&entry, index, &client, &cancel).await;
    entry.deregister_stream(entry.chunks[index].index).await;
    outcome
}

async fn fetch_chunk(
    entry: &DownloadEntry,
    index: usize,
    client: &reqwest::Client,
    cancel: &CancellationToken,
) -> ChunkOutcome {
    let chunk = &entry.chunks[index];
    if *entry.status.lock().await != DownloadStatus::Downloading {
        return ChunkOutcome::Skipped;
    }
    let Some(temp) = entry.temp_dir.lock().await.clone() else {
        return ChunkOutcome::Failed {
            message: "temp dir missing".to_string(),
        };
    };
    let part = part_path(&temp, chunk.index);

    // 续传位置一律以磁盘上的分块文件大小为准
    let on_disk = tokio::fs::metadata(&part)
        .await
        .map(|m| m.len())
        .unwrap_or(0);
    chunk.downloaded.store(on_disk, Ordering::Relaxed);
    chunk.begin_window(on_disk).await;
    if chunk.start + on_disk > chunk.end {
        // 空块或已拿齐：不发请求
        chunk.set_status(ChunkStatus::Complete).await;
        return ChunkOutcome::Completed;
    }

    chunk.set_status(ChunkStatus::Downloading).await;
    let mut resp = match network::open_range(client, &entry.url, chunk.start + on_disk, chunk.end).await
    {
        Ok(resp) => resp,
        Err(e) => {
            chunk.set_status(ChunkStatus::Error).await;
            chunk.reset_speed();
            return ChunkOutcome::Failed {
                message: e.to_string(),
            };
        }
    };
    let mut file = match tokio::fs::OpenOptions::new()
        .append(true)
        .create(true)
        .open(&part)
        .await
    {
        Ok(file) => file,
        Err(e) => {
            chunk.set_status(ChunkStatus::Error).await;
            chunk.reset_speed();
            return ChunkOutcome::Failed {
                message: format!("open {}: {e}", part.display()),
            };
        }
    };

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                // 暂停/中止：已写入的字节仍然有效，未写入的缓冲直接丢弃
                let _ = file.flush().await;
                {
                    let mut status = chunk.status.lock().await;
                    if *status == ChunkStatus::Downloading {
                        *status = ChunkStatus::Paused;
                    }
                }
                chunk.reset_speed();
                return ChunkOutcome::Cancelled;
            }
            read = resp.chunk() => match read {
                Ok(Some(data)) => {
                    if let Err(e) = file.write_all(&data).await {
                        chunk.set_status(ChunkStatus::Error).await;
                        chunk.reset_speed();
                        return ChunkOutcome::Failed {
                            message: format!("write {}: {e}", part.display()),
                        };
                    }
                    let total = chunk.record_bytes(data.len() as u64);
                    chunk.tick_speed(total).await;
                }
                Ok(None) => {
                    let _ = file.flush().await;
                    chunk.reset_speed();
                    if *entry.status.lock().await == DownloadStatus::Downloading {
                        chunk.set_status(ChunkStatus::Complete).await;
                        debug!(id = %entry.id, chunk = chunk.index, "chunk complete");
                    }
                    return ChunkOutcome::Completed;
                }
                Err(e) => {
                    // 流中途断开：只标记本分块，条目级判错由监督器汇总
                    chunk.set_status(ChunkStatus::Error).await;
                    chunk.reset_speed();
                    warn!(id = %entry.id, chunk = chunk.index, error = %e, "chunk stream failed");
                    return ChunkOutcome::Failed {
                        message: e.to_string(),
                    };
                }
            }
        }
    }
}
