//! HTTP 客户端：元数据探测与 Range 请求

mod client;

pub use client::{build_client, open_range, probe, url_path_basename, ProbeResult};
pub use client::Error as NetworkError;
