//! 引擎配置：输出目录、临时目录、分块数与并发上限

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// 单条下载拆分的分块数
pub const DEFAULT_NUM_CHUNKS: usize = 8;
/// 同时处于 downloading 状态的条目上限
pub const DEFAULT_MAX_CONCURRENT: usize = 3;
/// 注册表存档文件名，位于下载目录内
pub const STORE_FILENAME: &str = "downloads.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct EngineConfig {
    /// 完成文件的输出目录，存档文件也放在这里
    pub download_folder: PathBuf,
    /// 各条目 temp_<id> 目录的父目录
    pub temp_folder: PathBuf,
    pub num_chunks: usize,
    pub max_concurrent: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            download_folder: PathBuf::from("./downloads"),
            temp_folder: std::env::temp_dir().join("multifetch-temp"),
            num_chunks: DEFAULT_NUM_CHUNKS,
            max_concurrent: DEFAULT_MAX_CONCURRENT,
        }
    }
}

impl EngineConfig {
    pub fn with_folders(download: impl Into<PathBuf>, temp: impl Into<PathBuf>) -> Self {
        Self {
            download_folder: download.into(),
            temp_folder: temp.into(),
            ..Self::default()
        }
    }

    pub fn store_path(&self) -> PathBuf {
        self.download_folder.join(STORE_FILENAME)
    }

    /// 两个目录缺失时在启动阶段创建
    pub(crate) fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.download_folder)?;
        std::fs::create_dir_all(&self.temp_folder)
    }
}
