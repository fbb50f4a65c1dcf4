//! 下载监督：扇出分块工作器、暂停、汇总终态并触发合并

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::engine::assembler;
use crate::engine::chunk::{run_chunk, ChunkOutcome};
use crate::engine::entry::DownloadEntry;
use crate::engine::events::DownloadEvent;
use crate::engine::manager::DownloadManager;
use crate::engine::types::{ChunkStatus, DownloadStatus};

/// `start_entry` 通过 `collect_outcomes` -> `try_start_queued` 间接递归调用自身；
/// 显式装箱为具名的 `Send` trait object，打破自动 trait 求解的循环。
pub(crate) fn start_entry<'a>(
    mgr: &'a DownloadManager,
    entry: &'a Arc<DownloadEntry>,
) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
    Box::pin(start_entry_inner(mgr, entry))
}

async fn start_entry_inner(mgr: &DownloadManager, entry: &Arc<DownloadEntry>) {
    let dir = {
        let mut temp = entry.temp_dir.lock().await;
        temp.get_or_insert_with(|| {
            mgr.config().temp_folder.join(format!("temp_{}", entry.id))
        })
        .clone()
    };
    if let Err(e) = tokio::fs::create_dir_all(&dir).await {
        fail_entry(mgr, entry, None, &format!("cannot create temp dir: {e}")).await;
        return;
    }

    entry.active.lock().await.clear();
    let mut workers: JoinSet<(usize, ChunkOutcome)> = JoinSet::new();
    for (index, chunk) in entry.chunks.iter().enumerate() {
        if *chunk.status.lock().await == ChunkStatus::Complete {
            continue;
        }
        let token = CancellationToken::new();
        entry.register_stream(chunk.index, token.clone()).await;
        let entry = Arc::clone(entry);
        let client = mgr.http_client();
        workers.spawn(async move { (index, run_chunk(entry, index, client, token).await) });
    }

    if workers.is_empty() {
        // 崩溃恢复后的重新准入：所有分块已就绪，直接合并
        finish_entry(mgr, entry).await;
        return;
    }
    debug!(id = %entry.id, workers = workers.len(), "chunk workers spawned");

    let mgr = mgr.clone();
    let entry = Arc::clone(entry);
    tokio::spawn(async move { collect_outcomes(mgr, entry, workers).await });
}

async fn collect_outcomes(
    mgr: DownloadManager,
    entry: Arc<DownloadEntry>,
    mut workers: JoinSet<(usize, ChunkOutcome)>,
) {
    let mut failed = false;
    while let Some(joined) = workers.join_next().await {
        match joined {
            Ok((index, ChunkOutcome::Failed { message })) => {
                // 首个失败分块立即判错并撤销其余活动流
                if !failed {
                    failed = true;
                    fail_entry(&mgr, &entry, Some(entry.chunks[index].index), &message).await;
                }
            }
            Ok(_) => {}
            Err(e) => warn!(id = %entry.id, error = %e, "chunk worker aborted"),
        }
    }
    if *entry.status.lock().await != DownloadStatus::Downloading {
        // 暂停或已判错，相应路径已各自持久化并踢过调度器
        return;
    }
    let mut all_complete = true;
    for chunk in &entry.chunks {
        if *chunk.status.lock().await != ChunkStatus::Complete {
            all_complete = false;
            break;
        }
    }
    if all_complete {
        finish_entry(&mgr, &entry).await;
    } else {
        mgr.save().await;
    }
}

/// 所有分块就绪：进入 assembling，合并产物并收尾
pub(crate) async fn finish_entry(mgr: &DownloadManager, entry: &Arc<DownloadEntry>) {
    *entry.status.lock().await = DownloadStatus::Assembling;
    mgr.save().await;
    match assembler::assemble_entry(entry).await {
        Ok(()) => {
            *entry.status.lock().await = DownloadStatus::Complete;
            *entry.error.lock().await = None;
            info!(id = %entry.id, path = %entry.final_path.display(), "download complete");
            mgr.emit(DownloadEvent::DownloadComplete {
                id: entry.id.clone(),
                file_path: entry.final_path.display().to_string(),
            });
        }
        Err(e) => {
            warn!(id = %entry.id, error = %e, "assembly failed");
            *entry.status.lock().await = DownloadStatus::Error;
            *entry.error.lock().await = Some("Failed to assemble file.".to_string());
            mgr.emit(DownloadEvent::DownloadError {
                id: Some(entry.id.clone()),
                error: "Failed to assemble file.".to_string(),
            });
        }
    }
    mgr.save().await;
    mgr.try_start_queued().await;
}

/// 暂停：撤销全部活动流，下载中的分块标记为 paused，速度清零。
/// 持久化与调度器触发由调用方统一处理。
pub(crate) async fn pause_entry(entry: &Arc<DownloadEntry>) {
    {
        let mut status = entry.status.lock().await;
        match *status {
            DownloadStatus::Downloading | DownloadStatus::Queued => {
                *status = DownloadStatus::Paused
            }
            _ => return,
        }
    }
    entry.cancel_active().await;
    for chunk in &entry.chunks {
        {
            let mut status = chunk.status.lock().await;
            if *status == ChunkStatus::Downloading {
                *status = ChunkStatus::Paused;
            }
        }
        chunk.reset_speed();
    }
    debug!(id = %entry.id, "download paused");
}

/// 分块失败导致整条判错；对同一条目只生效一次
pub(crate) async fn fail_entry(
    mgr: &DownloadManager,
    entry: &Arc<DownloadEntry>,
    chunk_index: Option<u32>,
    message: &str,
) {
    {
        let mut status = entry.status.lock().await;
        if *status != DownloadStatus::Downloading {
            return;
        }
        *status = DownloadStatus::Error;
    }
    let text = match chunk_index {
        Some(i) => format!("Chunk {i} failed: {message}"),
        None => message.to_string(),
    };
    *entry.error.lock().await = Some(text.clone());
    entry.cancel_active().await;
    for chunk in &entry.chunks {
        chunk.reset_speed();
    }
    warn!(id = %entry.id, error = %text, "download failed");
    mgr.emit(DownloadEvent::DownloadError {
        id: Some(entry.id.clone()),
        error: text,
    });
    mgr.save().await;
    mgr.try_start_queued().await;
}
