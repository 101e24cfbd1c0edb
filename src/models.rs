//! Data models

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::time::Duration;

/// 单次试探（一轮 TCP → TLS → TTFB → 下载）的测量值
///
/// Every stage is optional: a stage that was never reached, or that failed,
/// leaves its field as `None`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Trial {
    pub tcp_ms: Option<f64>,
    pub tls_ms: Option<f64>,
    pub ttfb_ms: Option<f64>,
    /// MiB/s measured from the first response byte
    pub throughput: Option<f64>,
    /// True when every stage ran without error (a zero-length download
    /// window still counts as completed, it just yields no throughput).
    pub completed: bool,
}

impl Trial {
    pub fn connected(&self) -> bool {
        self.tcp_ms.is_some()
    }
}

/// Aggregated measurement for one candidate address
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeResult {
    pub address: IpAddr,
    pub tcp_ms: f64,
    pub tls_ms: f64,
    pub ttfb_ms: f64,
    /// MiB/s
    pub throughput: f64,
    pub loss_ratio: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub total_candidates: usize,
    pub admitted: usize,
    /// Worker tasks that panicked or could not get a pool slot
    #[serde(default)]
    pub aborted: usize,
    #[serde(with = "duration_secs")]
    pub elapsed: Duration,
}

/// Ranked shortlist plus the run summary, as handed to the result sink
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanReport {
    pub ranked: Vec<ProbeResult>,
    pub summary: RunSummary,
}

/// Which part of a CIDR block may be sampled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RangePolicy {
    /// Every address from network to broadcast
    Full,
    /// Network and broadcast addresses excluded
    HostsOnly,
}

/// Second ranking key after the loss ratio
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum LatencyMetric {
    Tcp,
    Ttfb,
}

/// What counts as a failed trial
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// A completed TCP connect is enough; later stages are best-effort
    Tolerant,
    /// Any stage error fails the whole trial
    Strict,
}

impl FailurePolicy {
    pub fn accepts(self, trial: &Trial) -> bool {
        match self {
            FailurePolicy::Tolerant => trial.connected(),
            FailurePolicy::Strict => trial.completed,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanConfig {
    #[serde(default = "default_max_ips")]
    pub max_ips: usize,
    #[serde(default = "default_max_number")]
    pub max_number: usize,
    #[serde(default = "default_threads")]
    pub threads: usize,
    #[serde(default = "default_top_n")]
    pub top_n: usize,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_test_times")]
    pub test_times: u32,
    #[serde(default = "default_max_loss")]
    pub max_loss: f64,
    #[serde(default = "default_download_size")]
    pub download_size: usize,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_range_policy")]
    pub range_policy: RangePolicy,
    #[serde(default = "default_latency_metric")]
    pub latency_metric: LatencyMetric,
    #[serde(default = "default_failure_policy")]
    pub failure_policy: FailurePolicy,
    #[serde(default)]
    pub log_rejections: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            max_ips: default_max_ips(),
            max_number: default_max_number(),
            threads: default_threads(),
            top_n: default_top_n(),
            timeout_ms: default_timeout_ms(),
            test_times: default_test_times(),
            max_loss: default_max_loss(),
            download_size: default_download_size(),
            host: default_host(),
            port: default_port(),
            range_policy: default_range_policy(),
            latency_metric: default_latency_metric(),
            failure_policy: default_failure_policy(),
            log_rejections: false,
            seed: None,
        }
    }
}

impl ScanConfig {
    /// Clamp every field into its working range.
    pub fn normalized(mut self) -> Self {
        self.test_times = self.test_times.clamp(1, 10);
        self.threads = self.threads.max(1);
        self.timeout_ms = self.timeout_ms.max(1);
        self.download_size = self.download_size.max(1);
        self.max_loss = if self.max_loss.is_nan() {
            default_max_loss()
        } else {
            self.max_loss.clamp(0.0, 1.0)
        };
        self.host = self.host.trim().to_string();
        if self.host.is_empty() {
            self.host = default_host();
        }
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn default_max_ips() -> usize {
    5000
}
fn default_max_number() -> usize {
    100
} // 每个 CIDR 段最多抽样数
fn default_threads() -> usize {
    150
}
fn default_top_n() -> usize {
    20
}
fn default_timeout_ms() -> u64 {
    1000
} // 每个阶段的超时
fn default_test_times() -> u32 {
    2
}
fn default_max_loss() -> f64 {
    0.3
}
fn default_download_size() -> usize {
    200 * 1024
}
fn default_host() -> String {
    "speed.cloudflare.com".into()
}
fn default_port() -> u16 {
    443
}
fn default_range_policy() -> RangePolicy {
    RangePolicy::Full
}
fn default_latency_metric() -> LatencyMetric {
    LatencyMetric::Tcp
}
fn default_failure_policy() -> FailurePolicy {
    FailurePolicy::Tolerant
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Ok(Duration::from_secs_f64(secs.max(0.0)))
    }
}
