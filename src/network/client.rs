use reqwest::{header, Client};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("Invalid URL: {0}")]
    Url(String),
    #[error("{url} does not support ranged downloads")]
    RangesNotSupported { url: String },
    #[error("missing or invalid Content-Length from {url}")]
    MissingLength { url: String },
}

/// 构建共享客户端；引擎不设总超时，挂起的请求交由用户暂停处理
pub fn build_client() -> Result<Client, Error> {
    Client::builder()
        .redirect(reqwest::redirect::Policy::limited(10))
        .build()
        .map_err(Error::Request)
}

/// 探测结果：资源大小、重定向后的最终 URL、按路径推断的文件名
#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub total_bytes: u64,
    pub final_url: String,
    pub suggested_filename: Option<String>,
}

/// HEAD 探测：来源必须声明 Accept-Ranges: bytes 且带可解析的 Content-Length
pub async fn probe(client: &Client, url: &str) -> Result<ProbeResult, Error> {
    let url: reqwest::Url = url.parse().map_err(|e| Error::Url(format!("{e}")))?;

    let resp = client.head(url).send().await?.error_for_status()?;
    let final_url = resp.url().to_string();
    let suggested_filename = url_path_basename(resp.url().path());

    let accepts_ranges = resp
        .headers()
        .get(header::ACCEPT_RANGES)
        .map(|v| v.as_bytes().eq_ignore_ascii_case(b"bytes"))
        .unwrap_or(false);
    if !accepts_ranges {
        return Err(Error::RangesNotSupported { url: final_url });
    }

    let total_bytes = resp
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<u64>().ok())
        .filter(|&n| n > 0)
        .ok_or(Error::MissingLength {
            url: final_url.clone(),
        })?;

    Ok(ProbeResult {
        total_bytes,
        final_url,
        suggested_filename,
    })
}

/// 发起一段 [start, end]（两端含）的 Range 请求，返回流式响应
pub async fn open_range(
    client: &Client,
    url: &str,
    start: u64,
    end: u64,
) -> Result<reqwest::Response, Error> {
    let url: reqwest::Url = url.parse().map_err(|e| Error::Url(format!("{e}")))?;
    let resp = client
        .get(url)
        .header(header::RANGE, format!("bytes={}-{}", start, end))
        .send()
        .await?
        .error_for_status()?;
    Ok(resp)
}

/// 取 URL 路径最后一段作为文件名；为空时由调用方回退
pub fn url_path_basename(path: &str) -> Option<String> {
    let name = path.trim_end_matches('/').rsplit('/').next().unwrap_or("");
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}
