//! Result sink: CSV/JSON persistence and the ranked listing

use crate::models::{ProbeResult, ScanReport};
use csv::Writer;
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::Path;
use thiserror::Error;

pub const CSV_HEADER: [&str; 6] = ["address", "tcp_ms", "tls_ms", "ttfb_ms", "speed_mbps", "loss"];

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

fn create(path: &Path) -> Result<BufWriter<File>, ReportError> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir)?;
    }
    Ok(BufWriter::new(File::create(path)?))
}

/// One row per ranked entry; a header-only file when nothing was admitted.
pub fn write_csv(path: &Path, ranked: &[ProbeResult]) -> Result<(), ReportError> {
    let mut wtr = Writer::from_writer(create(path)?);

    wtr.write_record(CSV_HEADER)?;
    for r in ranked {
        wtr.write_record(&[
            r.address.to_string(),
            format!("{:.1}", r.tcp_ms),
            format!("{:.1}", r.tls_ms),
            format!("{:.1}", r.ttfb_ms),
            format!("{:.2}", r.throughput),
            format!("{:.2}", r.loss_ratio),
        ])?;
    }

    wtr.flush()?;
    Ok(())
}

pub fn write_json(path: &Path, report: &ScanReport) -> Result<(), ReportError> {
    let mut out = create(path)?;
    serde_json::to_writer_pretty(&mut out, report)?;
    std::io::Write::flush(&mut out)?;
    Ok(())
}

fn columns(r: &ProbeResult) -> String {
    format!(
        "TCP:{:>6.1}ms TLS:{:>6.1}ms TTFB:{:>6.1}ms SPD:{:>6.2}MB/s LOSS:{:.2}",
        r.tcp_ms, r.tls_ms, r.ttfb_ms, r.throughput, r.loss_ratio
    )
}

/// Line echoed when a probe is admitted
pub fn ok_line(r: &ProbeResult) -> String {
    format!("[OK] {:<39} {}", r.address.to_string(), columns(r))
}

/// Ranked listing followed by the run summary
pub fn listing(report: &ScanReport, output: &Path) -> Vec<String> {
    let mut lines = vec!["================ 最优 IP ================".to_string()];

    if report.ranked.is_empty() {
        lines.push(" 无可用IP".to_string());
    } else {
        for (i, r) in report.ranked.iter().enumerate() {
            lines.push(format!(
                "TOP{:<3} {:<39} {}",
                i + 1,
                r.address.to_string(),
                columns(r)
            ));
        }
    }

    let summary = &report.summary;
    lines.push("=========================================".to_string());
    lines.push(format!("完成，用时 {:.1} 秒", summary.elapsed.as_secs_f64()));
    lines.push(format!(
        "有效 IP：{} / {}",
        summary.admitted, summary.total_candidates
    ));
    if summary.aborted > 0 {
        lines.push(format!("异常任务：{}", summary.aborted));
    }
    lines.push(format!("结果已保存到：{}", output.display()));
    lines
}
