//! Ranking engine
//!
//! Orders admitted results by loss ratio, then latency, then throughput
//! (higher first). The address is the last key so the order is total and a
//! re-run over the same measurements ranks identically.

use crate::models::{LatencyMetric, ProbeResult};
use std::cmp::Ordering;

pub fn compare(a: &ProbeResult, b: &ProbeResult, metric: LatencyMetric) -> Ordering {
    let by_latency = match metric {
        LatencyMetric::Tcp => a.tcp_ms.total_cmp(&b.tcp_ms),
        LatencyMetric::Ttfb => a.ttfb_ms.total_cmp(&b.ttfb_ms),
    };

    let ordering = a
        .loss_ratio
        .total_cmp(&b.loss_ratio)
        .then(by_latency)
        .then_with(|| b.throughput.total_cmp(&a.throughput));

    // TTFB 相同时再比较握手耗时
    let ordering = match metric {
        LatencyMetric::Tcp => ordering,
        LatencyMetric::Ttfb => ordering
            .then_with(|| a.tls_ms.total_cmp(&b.tls_ms))
            .then_with(|| a.tcp_ms.total_cmp(&b.tcp_ms)),
    };

    ordering.then_with(|| a.address.cmp(&b.address))
}

/// Sort and keep the best `top_n`.
pub fn rank(mut results: Vec<ProbeResult>, metric: LatencyMetric, top_n: usize) -> Vec<ProbeResult> {
    results.sort_by(|a, b| compare(a, b, metric));
    results.truncate(top_n);
    results
}
