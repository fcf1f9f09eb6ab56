use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time;

use ledger_node::blockchain::peers::split_port;
use ledger_node::blockchain::{Block, ChainFetcher, FetchError};

use super::handlers::ChainResponse;

/// Fetches peer chains with a plain HTTP/1.1 `GET /chain`
#[derive(Debug, Clone)]
pub struct HttpChainFetcher {
    timeout: Duration,

    /// Responses longer than this are abandoned
    max_response_bytes: usize,
}

impl HttpChainFetcher {
    pub fn new(timeout: Duration, max_response_bytes: usize) -> Self {
        HttpChainFetcher {
            timeout,
            max_response_bytes,
        }
    }

    async fn get(&self, peer: &str, path: &str) -> Result<Vec<u8>, FetchError> {
        let address = match split_port(peer) {
            Some(_) => peer.to_string(),
            None => format!("{}:80", peer),
        };

        let mut stream = TcpStream::connect(&address).await?;
        let request = format!(
            "GET {} HTTP/1.1\r\nHost: {}\r\nAccept: application/json\r\nConnection: close\r\n\r\n",
            path, peer
        );
        stream.write_all(request.as_bytes()).await?;

        // One byte past the limit tells an oversized response from an exact fit
        let limit = self.max_response_bytes as u64 + 1;
        let mut raw = Vec::new();
        stream.take(limit).read_to_end(&mut raw).await?;
        if raw.len() > self.max_response_bytes {
            return Err(malformed("response too large"));
        }

        parse_response(&raw)
    }
}

#[async_trait]
impl ChainFetcher for HttpChainFetcher {
    async fn fetch_chain(&self, peer: &str) -> Result<Vec<Block>, FetchError> {
        let body = time::timeout(self.timeout, self.get(peer, "/chain"))
            .await
            .map_err(|_| FetchError::Timeout)??;

        let response: ChainResponse = serde_json::from_slice(&body)?;
        Ok(response.chain)
    }
}

fn malformed(reason: impl Into<String>) -> FetchError {
    FetchError::Malformed(reason.into())
}

/// Extracts the body of a 200 response
fn parse_response(raw: &[u8]) -> Result<Vec<u8>, FetchError> {
    let head_end = find(raw, b"\r\n\r\n").ok_or_else(|| malformed("missing end of headers"))?;
    let head = std::str::from_utf8(&raw[..head_end]).map_err(|_| malformed("headers are not UTF-8"))?;
    let body = &raw[head_end + 4..];

    let mut lines = head.split("\r\n");
    let status_line = lines.next().unwrap_or_default();
    let status: u16 = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .ok_or_else(|| malformed(format!("bad status line {:?}", status_line)))?;

    if status != 200 {
        return Err(FetchError::Status(status));
    }

    let chunked = lines
        .filter_map(|line| line.split_once(':'))
        .any(|(name, value)| {
            name.trim().eq_ignore_ascii_case("transfer-encoding")
                && value.to_ascii_lowercase().contains("chunked")
        });

    if chunked {
        decode_chunked(body)
    } else {
        Ok(body.to_vec())
    }
}

fn decode_chunked(mut body: &[u8]) -> Result<Vec<u8>, FetchError> {
    let mut decoded = Vec::new();

    loop {
        let line_end = find(body, b"\r\n").ok_or_else(|| malformed("missing chunk size"))?;
        let size_line = std::str::from_utf8(&body[..line_end]).map_err(|_| malformed("bad chunk size"))?;
        let size_text = size_line.split(';').next().unwrap_or_default().trim();
        let size = usize::from_str_radix(size_text, 16)
            .map_err(|_| malformed(format!("bad chunk size {:?}", size_text)))?;
        body = &body[line_end + 2..];

        if size == 0 {
            return Ok(decoded);
        }
        if body.len() < size + 2 {
            return Err(malformed("truncated chunk"));
        }

        decoded.extend_from_slice(&body[..size]);
        body = &body[size + 2..];
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|window| window == needle)
}
