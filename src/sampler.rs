//! CIDR sampler
//! 把 CIDR 段展开为有上限的随机候选 IP 序列

use crate::models::RangePolicy;
use ipnetwork::IpNetwork;
use rand::Rng;
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SampleError {
    #[error("invalid range '{line}': {reason}")]
    InvalidRange { line: String, reason: String },
}

/// Inclusive integer span of the addresses that may be drawn from one range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressSpan {
    pub start: u128,
    pub end: u128,
    v6: bool,
}

impl AddressSpan {
    pub fn of(network: &IpNetwork, policy: RangePolicy) -> Self {
        match network {
            IpNetwork::V4(net) => {
                let host_bits = 32 - u32::from(net.prefix());
                let mask = if host_bits == 32 {
                    0
                } else {
                    u32::MAX << host_bits
                };
                let first = u32::from(net.ip()) & mask;
                let last = first | !mask;

                // /31 and /32 have no room to strip network + broadcast
                let (start, end) = match policy {
                    RangePolicy::HostsOnly if host_bits >= 2 => (first + 1, last - 1),
                    _ => (first, last),
                };
                Self {
                    start: start.into(),
                    end: end.into(),
                    v6: false,
                }
            }
            IpNetwork::V6(net) => {
                let host_bits = 128 - u32::from(net.prefix());
                let mask = if host_bits == 128 {
                    0
                } else {
                    u128::MAX << host_bits
                };
                let first = u128::from(net.ip()) & mask;
                let last = first | !mask;

                // IPv6 has no broadcast; only the subnet-router address is dropped
                let start = match policy {
                    RangePolicy::HostsOnly if host_bits >= 1 => first + 1,
                    _ => first,
                };
                Self {
                    start,
                    end: last,
                    v6: true,
                }
            }
        }
    }

    /// Number of addresses in the span (saturates for a whole IPv6 space)
    pub fn len(&self) -> u128 {
        (self.end - self.start).saturating_add(1)
    }

    pub fn contains(&self, ip: &IpAddr) -> bool {
        let value = match (ip, self.v6) {
            (IpAddr::V4(v4), false) => u128::from(u32::from(*v4)),
            (IpAddr::V6(v6), true) => u128::from(*v6),
            _ => return false,
        };
        (self.start..=self.end).contains(&value)
    }

    fn address(&self, value: u128) -> IpAddr {
        if self.v6 {
            IpAddr::V6(Ipv6Addr::from(value))
        } else {
            IpAddr::V4(Ipv4Addr::from(value as u32))
        }
    }
}

/// Parse one input line. Blank lines and `#` comments yield `Ok(None)`.
///
/// Host bits are allowed (`198.51.100.7/24` means the /24), and a bare
/// address is a single-address range.
pub fn parse_range(line: &str) -> Result<Option<IpNetwork>, SampleError> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return Ok(None);
    }

    trimmed
        .parse::<IpNetwork>()
        .map(Some)
        .map_err(|e| SampleError::InvalidRange {
            line: trimmed.to_string(),
            reason: e.to_string(),
        })
}

/// Draw `count` distinct addresses (or the whole span if smaller) uniformly
/// at random, keeping them in draw order.
pub fn sample_span<R: Rng + ?Sized>(span: AddressSpan, count: usize, rng: &mut R) -> Vec<IpAddr> {
    let target = (count as u128).min(span.len()) as usize;
    let mut seen = HashSet::with_capacity(target);
    let mut picked = Vec::with_capacity(target);

    while picked.len() < target {
        let value = rng.gen_range(span.start..=span.end);
        if seen.insert(value) {
            picked.push(span.address(value));
        }
    }

    picked
}

#[derive(Debug, Clone, Copy)]
pub struct Sampler {
    pub max_per_range: usize,
    pub max_total: usize,
    pub policy: RangePolicy,
}

impl Sampler {
    pub fn new(max_per_range: usize, max_total: usize, policy: RangePolicy) -> Self {
        Self {
            max_per_range,
            max_total,
            policy,
        }
    }

    /// Sample every range in input order, then keep the first `max_total`.
    ///
    /// The cut is a plain prefix, so ranges listed earlier in the input are
    /// favoured when the cap is hit. Invalid lines are skipped with a warning.
    pub fn sample<'a, I, R>(&self, lines: I, rng: &mut R) -> Vec<IpAddr>
    where
        I: IntoIterator<Item = &'a str>,
        R: Rng + ?Sized,
    {
        let mut candidates = Vec::new();
        let mut ranges = 0usize;
        let mut skipped = 0usize;

        for line in lines {
            let network = match parse_range(line) {
                Ok(Some(network)) => network,
                Ok(None) => continue,
                Err(e) => {
                    warn!("跳过无效 CIDR: {}", e);
                    skipped += 1;
                    continue;
                }
            };

            let span = AddressSpan::of(&network, self.policy);
            let picked = sample_span(span, self.max_per_range, rng);
            debug!(
                "{}: 抽取 {} 个地址 (可用 {})",
                network,
                picked.len(),
                span.len()
            );
            ranges += 1;
            candidates.extend(picked);
        }

        let sampled = candidates.len();
        candidates.truncate(self.max_total);
        info!(
            "{} 个 CIDR 段，跳过 {} 行，抽样 {} 个地址，保留 {} 个",
            ranges,
            skipped,
            sampled,
            candidates.len()
        );

        candidates
    }
}
