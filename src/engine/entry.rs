//! 单条下载的运行期状态：分块进度、速度窗口、活动流注册表

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::engine::types::{
    ChunkSnapshot, ChunkStatus, DownloadId, DownloadSnapshot, DownloadStatus,
};

/// 速度窗口间隔：间隔内只累计字节，超过后重算一次瞬时速度
const SPEED_WINDOW_MS: u128 = 500;
/// 窗口超过该时长没有刷新则速度按 0 计
const SPEED_STALE_MS: u128 = 2_000;

#[derive(Debug)]
struct SpeedWindow {
    at: Instant,
    downloaded: u64,
}

/// 一个分块：区间两端含；end < start 表示空块（文件小于分块数时出现）
#[derive(Debug)]
pub(crate) struct ChunkState {
    pub index: u32,
    pub start: u64,
    pub end: u64,
    pub status: Mutex<ChunkStatus>,
    pub downloaded: AtomicU64,
    speed_bps: AtomicU64,
    window: Mutex<SpeedWindow>,
}

impl ChunkState {
    pub(crate) fn new(index: u32, start: u64, end: u64, status: ChunkStatus, downloaded: u64) -> Self {
        Self {
            index,
            start,
            end,
            status: Mutex::new(status),
            downloaded: AtomicU64::new(downloaded),
            speed_bps: AtomicU64::new(0),
            window: Mutex::new(SpeedWindow {
                at: Instant::now(),
                downloaded,
            }),
        }
    }

    /// 区间字节数，空块为 0
    pub fn len(&self) -> u64 {
        if self.end < self.start {
            0
        } else {
            self.end - self.start + 1
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn downloaded(&self) -> u64 {
        self.downloaded.load(Ordering::Relaxed)
    }

    pub(crate) async fn set_status(&self, status: ChunkStatus) {
        *self.status.lock().await = status;
    }

    /// 记入新到的字节数，返回累计值
    pub(crate) fn record_bytes(&self, delta: u64) -> u64 {
        self.downloaded.fetch_add(delta, Ordering::Relaxed) + delta
    }

    /// 工作器进场时重置窗口基准
    pub(crate) async fn begin_window(&self, downloaded: u64) {
        let mut w = self.window.lock().await;
        w.at = Instant::now();
        w.downloaded = downloaded;
        self.speed_bps.store(0, Ordering::Relaxed);
    }

    /// 每收到一个缓冲调用一次；窗口满 0.5s 才重算速度
    pub(crate) async fn tick_speed(&self, downloaded_now: u64) {
        let mut w = self.window.lock().await;
        let elapsed = w.at.elapsed();
        if elapsed.as_millis() >= SPEED_WINDOW_MS {
            let delta = downloaded_now.saturating_sub(w.downloaded);
            let bps = (delta as f64 / elapsed.as_secs_f64()) as u64;
            self.speed_bps.store(bps, Ordering::Relaxed);
            w.at = Instant::now();
            w.downloaded = downloaded_now;
        }
    }

    pub(crate) fn reset_speed(&self) {
        self.speed_bps.store(0, Ordering::Relaxed);
    }

    /// 瞬时速度；窗口长时间未刷新视为 0
    pub(crate) async fn current_speed(&self) -> u64 {
        let w = self.window.lock().await;
        if w.at.elapsed().as_millis() > SPEED_STALE_MS {
            0
        } else {
            self.speed_bps.load(Ordering::Relaxed)
        }
    }
}

/// 分块文件路径：tempDir/part_<i>
pub(crate) fn part_path(dir: &Path, index: u32) -> PathBuf {
    dir.join(format!("part_{index}"))
}

/// 注册表持有的下载条目；状态只经由监督器与调度器改写
#[derive(Debug)]
pub(crate) struct DownloadEntry {
    pub id: DownloadId,
    pub url: String,
    pub filename: String,
    pub final_path: PathBuf,
    pub total_size: u64,
    pub created_at: i64,
    pub status: Mutex<DownloadStatus>,
    pub error: Mutex<Option<String>>,
    /// 合并完成后清空
    pub temp_dir: Mutex<Option<PathBuf>>,
    pub chunks: Vec<ChunkState>,
    /// 活动流注册表：分块序号 -> 取消令牌，暂停时统一撤销
    pub(crate) active: Mutex<HashMap<u32, CancellationToken>>,
}

impl DownloadEntry {
    pub(crate) fn new(
        id: DownloadId,
        url: String,
        filename: String,
        final_path: PathBuf,
        temp_dir: PathBuf,
        total_size: u64,
        ranges: Vec<(u64, u64)>,
    ) -> Self {
        let chunks = ranges
            .into_iter()
            .enumerate()
            .map(|(i, (start, end))| ChunkState::new(i as u32, start, end, ChunkStatus::Pending, 0))
            .collect();
        Self {
            id,
            url,
            filename,
            final_path,
            total_size,
            created_at: chrono::Utc::now().timestamp(),
            status: Mutex::new(DownloadStatus::Queued),
            error: Mutex::new(None),
            temp_dir: Mutex::new(Some(temp_dir)),
            chunks,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// 聚合进度恒等于各分块进度之和
    pub fn downloaded_size(&self) -> u64 {
        self.chunks.iter().map(|c| c.downloaded()).sum()
    }

    pub(crate) async fn register_stream(&self, index: u32, token: CancellationToken) {
        self.active.lock().await.insert(index, token);
    }

    pub(crate) async fn deregister_stream(&self, index: u32) {
        self.active.lock().await.remove(&index);
    }

    /// 撤销所有活动流；工作器在下一个 I/O 让出点观察到取消并收尾
    pub(crate) async fn cancel_active(&self) {
        for (_, token) in self.active.lock().await.drain() {
            token.cancel();
        }
    }

    pub async fn snapshot(&self) -> DownloadSnapshot {
        let status = *self.status.lock().await;
        let error = self.error.lock().await.clone();
        let temp_dir = self.temp_dir.lock().await.clone();
        let mut chunks = Vec::with_capacity(self.chunks.len());
        let mut speed = 0u64;
        for c in &self.chunks {
            let chunk_status = *c.status.lock().await;
            let chunk_speed = c.current_speed().await;
            speed += chunk_speed;
            chunks.push(ChunkSnapshot {
                id: c.index,
                start: c.start,
                end: c.end,
                status: chunk_status,
                downloaded: c.downloaded(),
                speed_bps: chunk_speed,
            });
        }
        let downloaded_size: u64 = chunks.iter().map(|c| c.downloaded).sum();
        let eta_secs = eta_secs(self.total_size.saturating_sub(downloaded_size), speed);
        DownloadSnapshot {
            id: self.id.clone(),
            url: self.url.clone(),
            filename: self.filename.clone(),
            final_path: self.final_path.clone(),
            temp_dir,
            total_size: self.total_size,
            downloaded_size,
            status,
            current_speed: speed,
            eta_secs,
            error,
            created_at: self.created_at,
            chunks,
        }
    }
}

fn eta_secs(remaining: u64, speed_bps: u64) -> Option<u64> {
    if speed_bps == 0 {
        None
    } else {
        Some(remaining / speed_bps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::types::chunk_ranges;

    fn sample_entry(total: u64) -> DownloadEntry {
        DownloadEntry::new(
            "1".into(),
            "http://host/a.bin".into(),
            "a.bin".into(),
            PathBuf::from("/out/a.bin"),
            PathBuf::from("/tmp/temp_1"),
            total,
            chunk_ranges(total, 8),
        )
    }

    #[test]
    fn empty_chunk_has_zero_len() {
        let c = ChunkState::new(7, 10, 9, ChunkStatus::Pending, 0);
        assert!(c.is_empty());
        assert_eq!(c.len(), 0);
    }

    #[tokio::test]
    async fn snapshot_sums_chunk_progress() {
        let entry = sample_entry(1024);
        entry.chunks[0].downloaded.store(128, Ordering::Relaxed);
        entry.chunks[3].downloaded.store(40, Ordering::Relaxed);
        let snap = entry.snapshot().await;
        assert_eq!(snap.downloaded_size, 168);
        assert_eq!(snap.downloaded_size, entry.downloaded_size());
        // 无速度时不给出 eta
        assert_eq!(snap.eta_secs, None);
        assert_eq!(snap.chunks.len(), 8);
    }

    #[tokio::test]
    async fn cancel_active_drains_registry() {
        let entry = sample_entry(1024);
        let token = CancellationToken::new();
        entry.register_stream(0, token.clone()).await;
        assert!(!token.is_cancelled());
        entry.cancel_active().await;
        assert!(token.is_cancelled());
        assert!(entry.active.lock().await.is_empty());
    }
}
