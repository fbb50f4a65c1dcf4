//! 注册表与命令面：创建/暂停/恢复/移除，队列准入与周期广播

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::engine::entry::DownloadEntry;
use crate::engine::error::EngineError;
use crate::engine::events::{DownloadEvent, EventHub};
use crate::engine::persistence::{self, PersistedEntry};
use crate::engine::supervisor;
use crate::engine::types::{
    chunk_ranges, ChunkStatus, DownloadId, DownloadSnapshot, DownloadStatus, ProgressUpdate,
};
use crate::network;

/// 周期广播间隔
const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// id -> 条目映射加注册顺序；顺序即 FIFO 准入与存档顺序的依据
struct Registry {
    entries: HashMap<DownloadId, Arc<DownloadEntry>>,
    order: Vec<DownloadId>,
    next_id: u64,
}

struct EngineInner {
    config: EngineConfig,
    client: reqwest::Client,
    registry: Mutex<Registry>,
    events: EventHub,
}

/// 下载引擎句柄：独占持有注册表，所有状态改写都经过它的互斥域。
/// 克隆句柄只是增加引用，监督器与后台任务拿克隆作为回引。
#[derive(Clone)]
pub struct DownloadManager {
    inner: Arc<EngineInner>,
}

impl DownloadManager {
    /// 建目录、建客户端、加载并规范化存档。存档损坏只记日志，以空注册表启动。
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        config.ensure_dirs()?;
        let client = network::build_client()?;
        let mut registry = Registry {
            entries: HashMap::new(),
            order: Vec::new(),
            next_id: 1,
        };
        let store = config.store_path();
        if store.exists() {
            match persistence::load_store(&store) {
                Ok(pairs) => {
                    for (id, mut persisted) in pairs {
                        persistence::normalize_loaded(&mut persisted);
                        if let Ok(n) = id.parse::<u64>() {
                            registry.next_id = registry.next_id.max(n + 1);
                        }
                        let entry = Arc::new(DownloadEntry::from_persisted(persisted));
                        registry.order.push(id.clone());
                        registry.entries.insert(id, entry);
                    }
                    info!(count = registry.order.len(), "download registry loaded");
                }
                Err(e) => {
                    warn!(path = %store.display(), error = %e, "failed to load store, starting empty");
                }
            }
        }
        Ok(Self {
            inner: Arc::new(EngineInner {
                config,
                client,
                registry: Mutex::new(registry),
                events: EventHub::new(),
            }),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub(crate) fn http_client(&self) -> reqwest::Client {
        self.inner.client.clone()
    }

    pub(crate) fn emit(&self, event: DownloadEvent) {
        self.inner.events.emit(event);
    }

    /// 周期聚合广播；进场先做一次准入（恢复启动的排队条目）
    pub async fn run(self, shutdown: CancellationToken) {
        self.try_start_queued().await;
        let mut tick = tokio::time::interval(TICK_INTERVAL);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = tick.tick() => self.broadcast_progress().await,
            }
        }
        debug!("engine broadcaster stopped");
    }

    /// 创建：HEAD 探测、派生文件名、计算分块、持久化并排队。
    /// 探测失败不落任何条目，只广播一次 download-error。
    pub async fn start_download(&self, url: &str) -> Result<DownloadId, EngineError> {
        let probe = match network::probe(&self.inner.client, url).await {
            Ok(probe) => probe,
            Err(e) => {
                self.emit(DownloadEvent::DownloadError {
                    id: None,
                    error: e.to_string(),
                });
                return Err(e.into());
            }
        };
        let entry = {
            let mut registry = self.inner.registry.lock().await;
            let id = registry.next_id.to_string();
            registry.next_id += 1;
            let filename = probe
                .suggested_filename
                .clone()
                .unwrap_or_else(|| format!("download-{id}"));
            let entry = Arc::new(DownloadEntry::new(
                id.clone(),
                url.to_string(),
                filename.clone(),
                self.inner.config.download_folder.join(&filename),
                self.inner.config.temp_folder.join(format!("temp_{id}")),
                probe.total_bytes,
                chunk_ranges(probe.total_bytes, self.inner.config.num_chunks),
            ));
            registry.order.push(id.clone());
            registry.entries.insert(id, Arc::clone(&entry));
            entry
        };
        self.save().await;
        info!(id = %entry.id, url = %entry.url, size = entry.total_size, "download registered");
        self.emit(DownloadEvent::DownloadStarted(entry.snapshot().await));
        self.try_start_queued().await;
        Ok(entry.id.clone())
    }

    pub async fn pause_download(&self, id: &str) -> Result<(), EngineError> {
        let entry = self.entry(id).await?;
        supervisor::pause_entry(&entry).await;
        self.save().await;
        self.try_start_queued().await;
        Ok(())
    }

    /// 恢复：回到 queued 并清除错误；分块进度从磁盘续传
    pub async fn resume_download(&self, id: &str) -> Result<(), EngineError> {
        let entry = self.entry(id).await?;
        resume_entry(&entry).await;
        self.save().await;
        self.try_start_queued().await;
        Ok(())
    }

    pub async fn pause_all(&self) {
        for entry in self.entries_in_order().await {
            supervisor::pause_entry(&entry).await;
        }
        self.save().await;
    }

    pub async fn resume_all(&self) {
        for entry in self.entries_in_order().await {
            if *entry.status.lock().await == DownloadStatus::Paused {
                resume_entry(&entry).await;
            }
        }
        self.save().await;
        self.try_start_queued().await;
    }

    /// 移除条目：撤销活动流、从注册表摘除并尽力清理临时目录
    pub async fn remove_download(&self, id: &str) -> Result<(), EngineError> {
        let entry = {
            let mut registry = self.inner.registry.lock().await;
            let Some(entry) = registry.entries.remove(id) else {
                return Err(EngineError::UnknownId(id.to_string()));
            };
            registry.order.retain(|x| x != id);
            entry
        };
        entry.cancel_active().await;
        if let Some(dir) = entry.temp_dir.lock().await.clone() {
            if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
                debug!(dir = %dir.display(), error = %e, "temp dir cleanup failed");
            }
        }
        info!(id = %entry.id, "download removed");
        self.save().await;
        self.try_start_queued().await;
        Ok(())
    }

    /// 从注册表清掉所有已完成条目，返回清除数量
    pub async fn clear_completed(&self) -> usize {
        let removed = {
            let mut registry = self.inner.registry.lock().await;
            let mut ids = Vec::new();
            for id in registry.order.clone() {
                if let Some(entry) = registry.entries.get(&id) {
                    if *entry.status.lock().await == DownloadStatus::Complete {
                        ids.push(id);
                    }
                }
            }
            for id in &ids {
                registry.entries.remove(id);
            }
            registry.order.retain(|id| !ids.contains(id));
            ids.len()
        };
        if removed > 0 {
            self.save().await;
        }
        removed
    }

    pub async fn list_downloads(&self) -> Vec<DownloadSnapshot> {
        let entries = self.entries_in_order().await;
        let mut out = Vec::with_capacity(entries.len());
        for entry in entries {
            out.push(entry.snapshot().await);
        }
        out
    }

    pub async fn get_download(&self, id: &str) -> Option<DownloadSnapshot> {
        let entry = self.inner.registry.lock().await.entries.get(id).cloned()?;
        Some(entry.snapshot().await)
    }

    /// 新客户端接入：先广播一次全量快照，新订阅者从自己的接收端拿到它。
    /// 快照事件对已有订阅者也可见，内容幂等。
    pub async fn subscribe(&self) -> broadcast::Receiver<DownloadEvent> {
        let rx = self.inner.events.subscribe();
        self.emit(DownloadEvent::DownloadList(self.list_downloads().await));
        rx
    }

    /// 队列准入：按注册顺序把 queued 条目提升为 downloading，
    /// 使 downloading 条目数不超过 max_concurrent。
    /// 计数与提升都在注册表互斥域内完成，并发调用互相串行。
    pub(crate) async fn try_start_queued(&self) {
        let mut admitted = Vec::new();
        {
            let registry = self.inner.registry.lock().await;
            let mut active = 0usize;
            for id in &registry.order {
                if let Some(entry) = registry.entries.get(id) {
                    if *entry.status.lock().await == DownloadStatus::Downloading {
                        active += 1;
                    }
                }
            }
            let mut slots = self.inner.config.max_concurrent.saturating_sub(active);
            for id in &registry.order {
                if slots == 0 {
                    break;
                }
                let Some(entry) = registry.entries.get(id) else {
                    continue;
                };
                let mut status = entry.status.lock().await;
                if *status == DownloadStatus::Queued {
                    *status = DownloadStatus::Downloading;
                    drop(status);
                    admitted.push(Arc::clone(entry));
                    slots -= 1;
                }
            }
        }
        if admitted.is_empty() {
            return;
        }
        self.save().await;
        for entry in admitted {
            info!(id = %entry.id, "download admitted");
            supervisor::start_entry(self, &entry).await;
        }
    }

    /// 每秒一次：对每个 downloading 条目广播进度，另发一条总速度
    async fn broadcast_progress(&self) {
        let mut total_speed = 0u64;
        for entry in self.entries_in_order().await {
            let snap = entry.snapshot().await;
            if snap.status == DownloadStatus::Downloading {
                total_speed += snap.current_speed;
                self.emit(DownloadEvent::DownloadProgress(ProgressUpdate::from_snapshot(
                    &snap,
                )));
            }
        }
        self.emit(DownloadEvent::TotalSpeedUpdate { total_speed });
    }

    /// 全量快照写盘；写失败只记日志，内存状态照常推进
    pub(crate) async fn save(&self) {
        let pairs = {
            let registry = self.inner.registry.lock().await;
            let mut pairs = Vec::with_capacity(registry.order.len());
            for id in &registry.order {
                if let Some(entry) = registry.entries.get(id) {
                    pairs.push((id.clone(), PersistedEntry::from_entry(entry).await));
                }
            }
            pairs
        };
        if let Err(e) = persistence::save_store(&self.inner.config.store_path(), &pairs).await {
            warn!(error = %e, "failed to persist download registry");
        }
    }

    async fn entry(&self, id: &str) -> Result<Arc<DownloadEntry>, EngineError> {
        self.inner
            .registry
            .lock()
            .await
            .entries
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::UnknownId(id.to_string()))
    }

    async fn entries_in_order(&self) -> Vec<Arc<DownloadEntry>> {
        let registry = self.inner.registry.lock().await;
        registry
            .order
            .iter()
            .filter_map(|id| registry.entries.get(id).cloned())
            .collect()
    }
}

async fn resume_entry(entry: &DownloadEntry) {
    {
        let mut status = entry.status.lock().await;
        match *status {
            DownloadStatus::Paused | DownloadStatus::Error => *status = DownloadStatus::Queued,
            DownloadStatus::Complete => {
                // 显式恢复已完成条目等于重新下载
                *status = DownloadStatus::Queued;
                for chunk in &entry.chunks {
                    chunk.downloaded.store(0, Ordering::Relaxed);
                    chunk.set_status(ChunkStatus::Pending).await;
                }
            }
            _ => return,
        }
    }
    *entry.error.lock().await = None;
}
