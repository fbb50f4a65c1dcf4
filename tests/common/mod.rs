//! 测试用内置 HTTP Origin：支持 HEAD 与 Range GET，可限速、可中途断开

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

#[derive(Clone)]
pub struct OriginConfig {
    pub body: Arc<Vec<u8>>,
    pub support_ranges: bool,
    /// 每次写出的字节数
    pub write_chunk: usize,
    /// 每次写出之间的延迟，用来模拟限速
    pub write_delay: Duration,
    /// Range 起点落入该区间的请求：宣称完整长度但只发一半就断开
    pub fail_range: Option<(u64, u64)>,
}

impl OriginConfig {
    pub fn new(body: Vec<u8>) -> Self {
        Self {
            body: Arc::new(body),
            support_ranges: true,
            write_chunk: 64 * 1024,
            write_delay: Duration::ZERO,
            fail_range: None,
        }
    }
}

pub struct MockOrigin {
    pub addr: SocketAddr,
    accept_loop: JoinHandle<()>,
}

impl MockOrigin {
    pub async fn start(config: OriginConfig) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind origin");
        let addr = listener.local_addr().expect("origin addr");
        let accept_loop = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let config = config.clone();
                tokio::spawn(async move {
                    let _ = serve_one(config, stream).await;
                });
            }
        });
        Self { addr, accept_loop }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }
}

impl Drop for MockOrigin {
    fn drop(&mut self) {
        self.accept_loop.abort();
    }
}

async fn serve_one(config: OriginConfig, mut stream: TcpStream) -> std::io::Result<()> {
    let mut head = Vec::new();
    let mut buf = [0u8; 1024];
    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        head.extend_from_slice(&buf[..n]);
        if head.len() > 16 * 1024 {
            return Ok(());
        }
    }
    let text = String::from_utf8_lossy(&head);
    let method = text
        .lines()
        .next()
        .and_then(|l| l.split_whitespace().next())
        .unwrap_or("")
        .to_string();
    let range = text.lines().find_map(|line| {
        let (name, value) = line.split_once(':')?;
        if !name.trim().eq_ignore_ascii_case("range") {
            return None;
        }
        let value = value.trim().strip_prefix("bytes=")?;
        let (a, b) = value.split_once('-')?;
        Some((a.parse::<u64>().ok()?, b.parse::<u64>().ok()?))
    });

    let total = config.body.len() as u64;
    let accept_ranges = if config.support_ranges { "bytes" } else { "none" };

    if method == "HEAD" {
        let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {total}\r\nAccept-Ranges: {accept_ranges}\r\nConnection: close\r\n\r\n"
        );
        stream.write_all(response.as_bytes()).await?;
        stream.shutdown().await?;
        return Ok(());
    }

    let (start, end, status, content_range) = match range {
        Some((a, b)) if config.support_ranges && a <= b && b < total => {
            (a, b, "206 Partial Content", Some(format!("bytes {a}-{b}/{total}")))
        }
        _ => (0, total.saturating_sub(1), "200 OK", None),
    };
    let upper = ((end + 1) as usize).min(config.body.len());
    let slice = &config.body[(start as usize).min(upper)..upper];
    let send_len = match config.fail_range {
        Some((fa, fb)) if start >= fa && start <= fb => slice.len() / 2,
        _ => slice.len(),
    };

    let mut response = format!(
        "HTTP/1.1 {status}\r\nContent-Length: {}\r\nAccept-Ranges: {accept_ranges}\r\nConnection: close\r\n",
        slice.len()
    );
    if let Some(content_range) = content_range {
        response.push_str(&format!("Content-Range: {content_range}\r\n"));
    }
    response.push_str("\r\n");
    stream.write_all(response.as_bytes()).await?;

    let mut sent = 0usize;
    while sent < send_len {
        let n = config.write_chunk.min(send_len - sent);
        stream.write_all(&slice[sent..sent + n]).await?;
        sent += n;
        if !config.write_delay.is_zero() {
            tokio::time::sleep(config.write_delay).await;
        }
    }
    if send_len == slice.len() {
        stream.shutdown().await?;
    }
    // 发送不完整时直接丢弃连接，模拟对端中途断开
    Ok(())
}
