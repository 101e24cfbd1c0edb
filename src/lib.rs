//! edgescan - CDN edge IP preference scanner
//! 从 CIDR 段中抽样 IP，分阶段测速并排序

pub mod config;
pub mod logging;
pub mod models;
pub mod prober;
pub mod ranking;
pub mod report;
pub mod sampler;
pub mod scheduler;
pub mod sources;

use models::{RunSummary, ScanConfig, ScanReport};
use prober::{ProbeSettings, ProbeSetupError, Prober, Transport};
use rand::rngs::StdRng;
use rand::SeedableRng;
use sampler::Sampler;
use scheduler::{ProgressObserver, Scheduler};
use thiserror::Error;
use tokio::time::Instant;
use tracing::info;

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("no candidate addresses could be produced from the input")]
    NoCandidates,
    #[error(transparent)]
    Setup(#[from] ProbeSetupError),
}

/// Scan over real TCP + TLS connections
pub async fn scan<O>(config: &ScanConfig, input: &str, observer: &O) -> Result<ScanReport, ScanError>
where
    O: ProgressObserver + ?Sized,
{
    let prober = Prober::new(ProbeSettings::from(config))?;
    run_scan(config, input, prober, observer).await
}

/// Sample → probe → rank. Only an empty candidate set fails the run;
/// every per-address failure stays inside its worker.
pub async fn run_scan<T, O>(
    config: &ScanConfig,
    input: &str,
    prober: Prober<T>,
    observer: &O,
) -> Result<ScanReport, ScanError>
where
    T: Transport,
    O: ProgressObserver + ?Sized,
{
    let started = Instant::now();

    let sampler = Sampler::new(config.max_number, config.max_ips, config.range_policy);
    let mut rng = match config.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let candidates = sampler.sample(input.lines(), &mut rng);
    if candidates.is_empty() {
        return Err(ScanError::NoCandidates);
    }
    let total_candidates = candidates.len();

    let collected = Scheduler::new(prober, config.threads)
        .run(candidates, observer)
        .await;
    let admitted = collected.admitted.len();
    let ranked = ranking::rank(collected.admitted, config.latency_metric, config.top_n);

    let summary = RunSummary {
        total_candidates,
        admitted,
        aborted: collected.aborted,
        elapsed: started.elapsed(),
    };
    info!(
        "测速完成: {}/{} 可用, 用时 {:.1}s",
        admitted,
        total_candidates,
        summary.elapsed.as_secs_f64()
    );

    Ok(ScanReport { ranked, summary })
}
