//! CDN IP-range acquisition from the provider API

use reqwest::Client;
use serde::Deserialize;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

pub const CF_IPS_API_URL: &str = "https://api.cloudflare.com/client/v4/ips";

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("API error: {0}")]
    Api(String),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    #[serde(default)]
    code: Option<i64>,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    success: bool,
    #[serde(default)]
    result: Option<CdnRanges>,
    #[serde(default)]
    errors: Vec<ApiMessage>,
    #[serde(default)]
    messages: Vec<ApiMessage>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct CdnRanges {
    #[serde(default)]
    pub etag: Option<String>,
    #[serde(default)]
    pub ipv4_cidrs: Vec<String>,
    #[serde(default)]
    pub ipv6_cidrs: Vec<String>,
}

fn describe(messages: &[ApiMessage]) -> String {
    messages
        .iter()
        .map(|m| match m.code {
            Some(code) => format!("{} ({})", m.message, code),
            None => m.message.clone(),
        })
        .collect::<Vec<_>>()
        .join("; ")
}

/// Parse the provider's JSON envelope
pub fn parse_response(body: &str) -> Result<CdnRanges, SourceError> {
    let response: ApiResponse = serde_json::from_str(body)?;

    if !response.success {
        let mut detail = describe(&response.errors);
        let messages = describe(&response.messages);
        if !messages.is_empty() {
            if !detail.is_empty() {
                detail.push_str("; ");
            }
            detail.push_str(&messages);
        }
        if detail.is_empty() {
            detail = "success=false".into();
        }
        return Err(SourceError::Api(detail));
    }

    response
        .result
        .ok_or_else(|| SourceError::Api("missing result".into()))
}

/// Fetch the published ranges. `networks` is passed through as the
/// provider's `networks` query parameter (e.g. `jdcloud`).
pub async fn fetch_cdn_ranges(networks: Option<&str>) -> Result<CdnRanges, SourceError> {
    info!("从 {} 获取 IP 段...", CF_IPS_API_URL);

    let client = Client::builder().timeout(Duration::from_secs(10)).build()?;
    let mut request = client.get(CF_IPS_API_URL);
    if let Some(networks) = networks {
        request = request.query(&[("networks", networks)]);
    }

    let resp = request.send().await?;
    let status = resp.status();
    let body = resp.text().await?;
    if !status.is_success() {
        warn!("API 返回状态码 {}", status);
        // Error bodies still carry the JSON envelope
        return match parse_response(&body) {
            Err(SourceError::Api(detail)) => Err(SourceError::Api(detail)),
            _ => Err(SourceError::Api(format!("HTTP {}", status))),
        };
    }

    let ranges = parse_response(&body)?;
    info!(
        "获取到 {} 个 IPv4 段, {} 个 IPv6 段 (etag: {})",
        ranges.ipv4_cidrs.len(),
        ranges.ipv6_cidrs.len(),
        ranges.etag.as_deref().unwrap_or("-")
    );
    Ok(ranges)
}

/// Write one CIDR per line, creating missing parent directories.
/// Returns the number of ranges written.
pub fn write_cidr_file(
    path: &Path,
    ranges: &CdnRanges,
    include_ipv6: bool,
) -> Result<usize, SourceError> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        if !dir.exists() {
            fs::create_dir_all(dir)?;
            info!("自动创建目录: {}", dir.display());
        }
    }

    let mut file = std::io::BufWriter::new(fs::File::create(path)?);
    let mut written = 0;
    let v6: &[String] = if include_ipv6 { &ranges.ipv6_cidrs } else { &[] };
    for cidr in ranges.ipv4_cidrs.iter().chain(v6) {
        writeln!(file, "{}", cidr)?;
        written += 1;
    }
    file.flush()?;

    info!("已写入 {} 个 IP 段到 {}", written, path.display());
    Ok(written)
}
