//! edgescan command line

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use edgescan_lib::config::ConfigManager;
use edgescan_lib::models::{FailurePolicy, LatencyMetric, ProbeResult, RangePolicy, ScanConfig};
use edgescan_lib::scheduler::ProgressObserver;
use edgescan_lib::{logging, report, sources, ScanError};
use indicatif::{ProgressBar, ProgressStyle};
use std::fs;
use std::path::PathBuf;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "edgescan", version)]
#[command(about = "Find the fastest CDN edge IPs from a list of CIDR ranges")]
struct Cli {
    /// Config file (default: platform config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// More log output (-v, -vv)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Only warnings and errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Sample, probe and rank addresses from a CIDR list
    #[command(alias = "s")]
    Scan(ScanArgs),
    /// Download the provider's published ranges into a CIDR list
    #[command(alias = "f")]
    Fetch(FetchArgs),
    /// Print the effective configuration
    Config {
        /// Write the defaults to the config file
        #[arg(long)]
        init: bool,
    },
}

#[derive(Args, Debug)]
struct ScanArgs {
    /// CIDR list, one range per line
    #[arg(short, long)]
    input: PathBuf,

    #[arg(short, long, default_value = "result.csv")]
    output: PathBuf,

    /// Also write the full report as JSON
    #[arg(long)]
    json: Option<PathBuf>,

    #[arg(long)]
    max_ips: Option<usize>,

    /// Per-range sample cap
    #[arg(long)]
    max_number: Option<usize>,

    #[arg(short = 't', long)]
    threads: Option<usize>,

    #[arg(long)]
    top_n: Option<usize>,

    /// Per-stage timeout
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Trials per address
    #[arg(long)]
    test_times: Option<u32>,

    #[arg(long)]
    max_loss: Option<f64>,

    /// Bytes to request from the speed-test endpoint
    #[arg(long)]
    download_size: Option<usize>,

    /// SNI / Host header
    #[arg(long)]
    host: Option<String>,

    #[arg(long)]
    port: Option<u16>,

    /// Skip network and broadcast addresses
    #[arg(long)]
    hosts_only: bool,

    #[arg(long, value_enum)]
    latency_metric: Option<LatencyMetric>,

    /// Any failing stage fails the trial
    #[arg(long)]
    strict: bool,

    /// Log every rejected address
    #[arg(long)]
    log_rejections: bool,

    /// Fixed sampling seed
    #[arg(long)]
    seed: Option<u64>,

    #[arg(long)]
    no_progress: bool,
}

#[derive(Args, Debug)]
struct FetchArgs {
    #[arg(short, long, default_value = "ip.txt")]
    output: PathBuf,

    /// Include IPv6 ranges
    #[arg(long)]
    ipv6: bool,

    /// Provider `networks` parameter (e.g. jdcloud)
    #[arg(long)]
    networks: Option<String>,
}

impl ScanArgs {
    /// CLI flags override the config file
    fn apply(&self, mut config: ScanConfig) -> ScanConfig {
        if let Some(v) = self.max_ips {
            config.max_ips = v;
        }
        if let Some(v) = self.max_number {
            config.max_number = v;
        }
        if let Some(v) = self.threads {
            config.threads = v;
        }
        if let Some(v) = self.top_n {
            config.top_n = v;
        }
        if let Some(v) = self.timeout_ms {
            config.timeout_ms = v;
        }
        if let Some(v) = self.test_times {
            config.test_times = v;
        }
        if let Some(v) = self.max_loss {
            config.max_loss = v;
        }
        if let Some(v) = self.download_size {
            config.download_size = v;
        }
        if let Some(v) = &self.host {
            config.host = v.clone();
        }
        if let Some(v) = self.port {
            config.port = v;
        }
        if self.hosts_only {
            config.range_policy = RangePolicy::HostsOnly;
        }
        if let Some(v) = self.latency_metric {
            config.latency_metric = v;
        }
        if self.strict {
            config.failure_policy = FailurePolicy::Strict;
        }
        if self.log_rejections {
            config.log_rejections = true;
        }
        if self.seed.is_some() {
            config.seed = self.seed;
        }
        config.normalized()
    }
}

/// Progress bar plus an `[OK]` line per admitted address
struct BarObserver {
    bar: ProgressBar,
}

impl BarObserver {
    fn new() -> Self {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} ({eta})")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("#>-"),
        );
        logging::attach_progress(&bar);
        Self { bar }
    }
}

impl ProgressObserver for BarObserver {
    fn on_start(&self, total: usize) {
        self.bar.set_length(total as u64);
    }

    fn on_complete(&self, completed: usize, _total: usize, admitted: Option<&ProbeResult>) {
        if let Some(result) = admitted {
            self.bar.println(report::ok_line(result));
        }
        self.bar.set_position(completed as u64);
    }
}

impl Drop for BarObserver {
    fn drop(&mut self) {
        self.bar.finish_and_clear();
        logging::detach_progress();
    }
}

struct LineObserver;

impl ProgressObserver for LineObserver {
    fn on_complete(&self, _completed: usize, _total: usize, admitted: Option<&ProbeResult>) {
        if let Some(result) = admitted {
            println!("{}", report::ok_line(result));
        }
    }
}

fn config_manager(cli: &Cli) -> ConfigManager {
    match &cli.config {
        Some(path) => ConfigManager::with_path(path.clone()),
        None => ConfigManager::new(),
    }
}

async fn run_scan(args: &ScanArgs, manager: &ConfigManager) -> Result<()> {
    let config = args.apply(manager.load()?);
    let input = fs::read_to_string(&args.input)
        .with_context(|| format!("读取 {} 失败", args.input.display()))?;

    let outcome = if args.no_progress {
        edgescan_lib::scan(&config, &input, &LineObserver).await
    } else {
        let observer = BarObserver::new();
        edgescan_lib::scan(&config, &input, &observer).await
    };

    let scan_report = match outcome {
        Ok(r) => r,
        Err(ScanError::NoCandidates) => {
            bail!("{} 中没有可用的 CIDR 段", args.input.display())
        }
        Err(e) => return Err(e.into()),
    };

    report::write_csv(&args.output, &scan_report.ranked)
        .with_context(|| format!("写入 {} 失败", args.output.display()))?;
    if let Some(path) = &args.json {
        report::write_json(path, &scan_report)
            .with_context(|| format!("写入 {} 失败", path.display()))?;
        info!("JSON 报告已保存到 {}", path.display());
    }

    println!();
    for line in report::listing(&scan_report, &args.output) {
        println!("{}", line);
    }
    Ok(())
}

async fn run_fetch(args: &FetchArgs) -> Result<()> {
    let ranges = sources::fetch_cdn_ranges(args.networks.as_deref()).await?;
    let written = sources::write_cidr_file(&args.output, &ranges, args.ipv6)?;
    println!("已写入 {} 个 IP 段到 {}", written, args.output.display());
    Ok(())
}

fn run_config(init: bool, manager: &ConfigManager) -> Result<()> {
    if init {
        manager.save(&ScanConfig::default())?;
        println!("默认配置已写入 {}", manager.path().display());
        return Ok(());
    }
    let config = manager.load()?;
    println!("# {}", manager.path().display());
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let verbosity = if cli.quiet { -1 } else { cli.verbose.min(i8::MAX as u8) as i8 };
    logging::init(verbosity);

    let manager = config_manager(&cli);
    let result = match &cli.command {
        Commands::Scan(args) => run_scan(args, &manager).await,
        Commands::Fetch(args) => run_fetch(args).await,
        Commands::Config { init } => run_config(*init, &manager),
    };

    if let Err(e) = result {
        error!("{:#}", e);
        std::process::exit(1);
    }
}
