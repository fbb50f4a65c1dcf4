//! 对外事件：类型化广播；掉事件不影响引擎状态

use serde::Serialize;
use tokio::sync::broadcast;

use crate::engine::types::{DownloadId, DownloadSnapshot, ProgressUpdate};

const EVENT_CAPACITY: usize = 256;

/// 出站事件；序列化后的 event 标签与传输层协议一致
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "payload", rename_all = "kebab-case")]
pub enum DownloadEvent {
    /// 新客户端接入时的全量快照
    DownloadList(Vec<DownloadSnapshot>),
    DownloadStarted(DownloadSnapshot),
    DownloadProgress(ProgressUpdate),
    DownloadComplete { id: DownloadId, file_path: String },
    /// 创建期失败时条目不存在，id 为空
    DownloadError { id: Option<DownloadId>, error: String },
    TotalSpeedUpdate { total_speed: u64 },
}

pub(crate) struct EventHub {
    tx: broadcast::Sender<DownloadEvent>,
}

impl EventHub {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    /// 尽力而为：没有订阅者时发送失败直接忽略
    pub fn emit(&self, event: DownloadEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DownloadEvent> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_tags_are_kebab_case() {
        let ev = DownloadEvent::DownloadComplete {
            id: "3".into(),
            file_path: "/out/a.bin".into(),
        };
        let json = serde_json::to_value(&ev).expect("serialize");
        assert_eq!(json["event"], "download-complete");
        assert_eq!(json["payload"]["id"], "3");

        let ev = DownloadEvent::TotalSpeedUpdate { total_speed: 42 };
        let json = serde_json::to_value(&ev).expect("serialize");
        assert_eq!(json["event"], "total-speed-update");
        assert_eq!(json["payload"]["total_speed"], 42);

        let ev = DownloadEvent::DownloadList(Vec::new());
        let json = serde_json::to_value(&ev).expect("serialize");
        assert_eq!(json["event"], "download-list");
        assert_eq!(json["payload"], serde_json::json!([]));
    }

    #[test]
    fn emit_without_subscribers_is_silent() {
        let hub = EventHub::new();
        hub.emit(DownloadEvent::TotalSpeedUpdate { total_speed: 0 });
    }

    #[tokio::test]
    async fn subscriber_receives_emitted_events() {
        let hub = EventHub::new();
        let mut rx = hub.subscribe();
        hub.emit(DownloadEvent::DownloadError {
            id: None,
            error: "boom".into(),
        });
        match rx.recv().await.expect("event") {
            DownloadEvent::DownloadError { id, error } => {
                assert!(id.is_none());
                assert_eq!(error, "boom");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
