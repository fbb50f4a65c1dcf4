//! 合并：按序把 part_0..part_{n-1} 连接成最终文件，然后清理临时目录

use tracing::warn;

use crate::engine::entry::{part_path, DownloadEntry};
use crate::engine::error::EngineError;

/// 顺序拷贝所有分块文件；写入端跨全部分块保持打开，最后一块排干后才关闭。
/// 任何分块文件大小与区间不符即失败，失败时临时目录原样保留以便排查。
pub(crate) async fn assemble_entry(entry: &DownloadEntry) -> Result<(), EngineError> {
    let temp = entry.temp_dir.lock().await.clone().ok_or_else(|| {
        EngineError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "temp dir not set",
        ))
    })?;

    let mut out = tokio::fs::File::create(&entry.final_path).await?;
    for chunk in &entry.chunks {
        let expected = chunk.len();
        if expected == 0 {
            continue;
        }
        let part = part_path(&temp, chunk.index);
        let meta = tokio::fs::metadata(&part).await?;
        if meta.len() != expected {
            return Err(EngineError::PartSizeMismatch {
                path: part,
                actual: meta.len(),
                expected,
            });
        }
        let mut reader = tokio::fs::File::open(&part).await?;
        tokio::io::copy(&mut reader, &mut out).await?;
    }
    out.sync_all().await?;
    drop(out);

    // 产物已落盘，清理失败不影响完成状态
    if let Err(e) = tokio::fs::remove_dir_all(&temp).await {
        warn!(dir = %temp.display(), error = %e, "failed to remove temp dir");
    }
    *entry.temp_dir.lock().await = None;
    Ok(())
}
