//! Probe scheduler
//! 为每个候选 IP 启动一个任务，并发数由信号量限制

use crate::models::ProbeResult;
use crate::prober::{Prober, Transport};
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

/// Receives one event per finished candidate, in completion order.
pub trait ProgressObserver {
    fn on_start(&self, _total: usize) {}

    /// `admitted` is `None` for rejected candidates and aborted tasks.
    fn on_complete(&self, completed: usize, total: usize, admitted: Option<&ProbeResult>);
}

/// Observer that ignores every event
pub struct Silent;

impl ProgressObserver for Silent {
    fn on_complete(&self, _completed: usize, _total: usize, _admitted: Option<&ProbeResult>) {}
}

/// Everything the workers produced, unordered
#[derive(Debug, Default)]
pub struct Collected {
    pub admitted: Vec<ProbeResult>,
    pub rejected: usize,
    /// Tasks that panicked or never got a pool slot
    pub aborted: usize,
}

pub struct Scheduler<T: Transport> {
    prober: Prober<T>,
    concurrency: usize,
}

impl<T: Transport> Scheduler<T> {
    pub fn new(prober: Prober<T>, concurrency: usize) -> Self {
        Self {
            prober,
            concurrency: concurrency.max(1),
        }
    }

    /// Submit every candidate at once; at most `concurrency` probes run at
    /// the same time. There is no global deadline: each worker is bounded
    /// only by its own per-stage timeouts.
    pub async fn run<O>(&self, candidates: Vec<IpAddr>, observer: &O) -> Collected
    where
        O: ProgressObserver + ?Sized,
    {
        let total = candidates.len();
        info!("开始测速 {} 个 IP，并发 {}", total, self.concurrency);
        observer.on_start(total);

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut join_set = JoinSet::new();

        for ip in candidates {
            let prober = self.prober.clone();
            let permit = semaphore.clone();
            join_set.spawn(async move {
                match permit.acquire_owned().await {
                    Ok(_permit) => Some(prober.probe(ip).await.ok()),
                    Err(_) => None,
                }
            });
        }

        let mut collected = Collected::default();
        let mut completed = 0usize;

        while let Some(joined) = join_set.join_next().await {
            completed += 1;
            match joined {
                Ok(Some(Some(result))) => {
                    observer.on_complete(completed, total, Some(&result));
                    collected.admitted.push(result);
                }
                Ok(Some(None)) => {
                    collected.rejected += 1;
                    observer.on_complete(completed, total, None);
                }
                Ok(None) => {
                    error!("并发控制异常，任务未执行");
                    collected.aborted += 1;
                    observer.on_complete(completed, total, None);
                }
                Err(e) => {
                    error!("测速任务 panic: {:?}", e);
                    collected.aborted += 1;
                    observer.on_complete(completed, total, None);
                }
            }
        }

        debug!(
            "收集完成: {} 可用, {} 淘汰, {} 异常",
            collected.admitted.len(),
            collected.rejected,
            collected.aborted
        );
        collected
    }
}
