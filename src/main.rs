mod config;
mod error;
mod network;
mod probe;
mod sampler;
mod search;
mod sink;
mod sources;
mod traits;
mod types;
mod utils;

use anyhow::{bail, Result};
use clap::{Args, Parser, Subcommand};
use config::Config;
use network::NetworkEnvironment;
use probe::HttpProbe;
use search::{SearchController, SearchEvent, StopReason};
use sink::FileSink;
use sources::locations::LocationTable;
use sources::subnets::load_subnets;
use sources::vhost::VirtualHost;
use sources::DataDir;
use std::net::IpAddr;
use std::path::PathBuf;
use traits::EndpointProbe;
use types::{AddressFamily, CandidateEndpoint, EndpointStatus, ProbeResult};

#[derive(Parser)]
#[command(name = "edgescout")]
#[command(about = "Find CDN edge addresses that meet a bandwidth target", long_about = None)]
struct Cli {
    /// Config file (default: platform config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Directory holding ips-v4.txt, ips-v6.txt, url.txt and colo.txt
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Search for endpoints (e.g., edgescout search --count 3 --location SJC)
    Search(SearchArgs),
    /// Probe a single address (e.g., edgescout check 104.16.1.1)
    Check {
        address: IpAddr,

        /// Use HTTPS instead of the configured mode
        #[arg(long, conflicts_with = "no_tls")]
        tls: bool,

        /// Use plain HTTP instead of the configured mode
        #[arg(long)]
        no_tls: bool,

        /// Only run the location probe
        #[arg(long)]
        location_only: bool,

        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show the effective configuration
    Config {
        /// Write it to the config file (an existing file is backed up first)
        #[arg(long)]
        init: bool,
    },
    /// Check data files and the network environment
    Doctor,
}

#[derive(Args)]
struct SearchArgs {
    /// Number of qualifying endpoints to find
    #[arg(long, short = 'n')]
    count: Option<usize>,

    /// Location code to require, or "any"
    #[arg(long, short)]
    location: Option<String>,

    /// Minimum average bandwidth in Mbps
    #[arg(long, short)]
    bandwidth: Option<f64>,

    /// Per-probe timeout in seconds
    #[arg(long)]
    timeout: Option<f64>,

    /// Download duration in seconds
    #[arg(long)]
    window: Option<f64>,

    #[arg(long, value_enum)]
    family: Option<AddressFamily>,

    #[arg(long, conflicts_with = "no_tls")]
    tls: bool,

    #[arg(long)]
    no_tls: bool,

    /// Location checks to run in parallel
    #[arg(long)]
    concurrency: Option<usize>,

    /// Result file
    #[arg(long, short)]
    output: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // 日志输出到 stderr, 默认只显示警告以免打乱进度条
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    // config --init 可以指向一个尚不存在的文件
    let creating = matches!(cli.command, Commands::Config { init: true })
        && cli.config.as_deref().is_some_and(|p| !p.exists());
    let mut config = if creating {
        Config::default()
    } else {
        Config::load(cli.config.as_deref()).await?
    };
    if let Some(dir) = &cli.data_dir {
        config.data.dir = dir.to_string_lossy().to_string();
    }

    match cli.command {
        Commands::Search(args) => handle_search(config, args).await?,
        Commands::Check {
            address,
            tls,
            no_tls,
            location_only,
            json,
        } => {
            apply_tls(&mut config, tls, no_tls);
            handle_check(config, address, location_only, json).await?
        }
        Commands::Config { init } => handle_config(config, cli.config, init).await?,
        Commands::Doctor => handle_doctor(config).await?,
    }

    Ok(())
}

fn apply_tls(config: &mut Config, tls: bool, no_tls: bool) {
    if tls {
        config.search.use_tls = true;
    } else if no_tls {
        config.search.use_tls = false;
    }
}

// --- Handlers ---

async fn handle_search(mut config: Config, args: SearchArgs) -> Result<()> {
    if let Some(n) = args.count {
        config.search.desired_count = n;
    }
    if let Some(l) = args.location {
        config.search.target_location = l;
    }
    if let Some(b) = args.bandwidth {
        config.search.min_bandwidth_mbps = b;
    }
    if let Some(t) = args.timeout {
        config.probe.timeout_secs = t;
    }
    if let Some(w) = args.window {
        config.probe.window_secs = w;
    }
    if let Some(f) = args.family {
        config.search.address_family = f;
    }
    if let Some(c) = args.concurrency {
        config.search.location_concurrency = c;
    }
    if let Some(o) = args.output {
        config.output.path = o.to_string_lossy().to_string();
    }
    apply_tls(&mut config, args.tls, args.no_tls);
    config.validate()?;

    let family = config.search.address_family;
    let data = DataDir::new(config.data_dir());
    let missing = data.missing_required(family);
    if !missing.is_empty() {
        let names: Vec<String> = missing.iter().map(|p| p.display().to_string()).collect();
        bail!(
            "Missing data files: {}. Download them into {:?} first.",
            names.join(", "),
            data.root()
        );
    }

    if network::check_network_environment().await == NetworkEnvironment::Proxied {
        eprintln!("Warning: traffic appears to go through a proxy; results will not reflect direct edge performance.");
    }

    let subnets = load_subnets(&data.subnets(family), family).await?;
    let vhost = VirtualHost::load(&data.vhost()).await?;
    let locations = LocationTable::load_or_empty(&data.locations()).await;

    let output_path = config.output_path();
    let probe = HttpProbe::new(vhost, config.probe_settings());
    let sink = FileSink::new(
        output_path.clone(),
        locations.clone(),
        config.ports_for(true),
        config.ports_for(false),
    );
    let params = config.search_params();
    println!(
        "Searching {} endpoint(s) >= {} Mbps at location '{}' over {} {} subnets...",
        params.desired_count,
        params.min_bandwidth_mbps,
        params.target_location,
        subnets.len(),
        family
    );

    let mut controller = SearchController::new(params, subnets, probe, sink)?;
    let Some(mut events) = controller.events() else {
        bail!("progress channel unavailable");
    };
    let cancel = controller.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    let worker = tokio::spawn(controller.run());

    let pb = utils::search_spinner();
    pb.set_prefix("0/0");
    while let Some(event) = events.recv().await {
        match event {
            SearchEvent::Status {
                address,
                status,
                result,
            } => {
                if status == EndpointStatus::Completed {
                    pb.println(format!(
                        "  {:<40} {:<10} {:>8.2} Mbps  peak {:>8.2} Mbps  {}",
                        address,
                        result.latency_display(),
                        result.avg_speed_mbps,
                        result.peak_speed_mbps,
                        result.location_code
                    ));
                } else {
                    pb.set_message(format!("{} {}", address, status));
                }
            }
            SearchEvent::Speed { address, sample } => {
                pb.set_message(format!(
                    "{} current {:.2} Mbps, peak {:.2} Mbps",
                    address, sample.current_mbps, sample.peak_mbps
                ));
            }
            SearchEvent::Progress {
                completed,
                total,
                qualified,
            } => {
                pb.set_prefix(format!("{}/{} tested, {} qualified", completed, total, qualified));
            }
            SearchEvent::Finished { .. } => {}
        }
    }
    pb.finish_and_clear();

    let outcome = worker.await??;
    println!();
    match outcome.reason {
        StopReason::Satisfied => println!("Found {} qualifying endpoint(s).", outcome.qualified.len()),
        StopReason::Cancelled => println!("Search cancelled."),
        StopReason::Exhausted => println!("Subnet list exhausted before the target was reached."),
    }
    print_table(&outcome.qualified, &locations);

    if let Some(summary) = outcome.persisted {
        println!(
            "Saved {} new record(s) to {} ({} already present).",
            summary.written,
            output_path.display(),
            summary.skipped
        );
        if summary.failed > 0 {
            eprintln!("Warning: {} record(s) could not be written.", summary.failed);
        }
    }

    Ok(())
}

fn print_table(endpoints: &[CandidateEndpoint], locations: &LocationTable) {
    if endpoints.is_empty() {
        return;
    }
    let mut sorted: Vec<&CandidateEndpoint> = endpoints.iter().collect();
    sorted.sort_by(|a, b| b.result.avg_speed_mbps.total_cmp(&a.result.avg_speed_mbps));

    println!("{}", "-".repeat(96));
    println!(
        "{:<4} {:<40} {:<10} {:>10} {:>10}  Location",
        "RANK", "ADDRESS", "LATENCY", "AVG", "PEAK"
    );
    println!("{}", "-".repeat(96));
    for (i, c) in sorted.iter().enumerate() {
        println!(
            "{:<4} {:<40} {:<10} {:>10.2} {:>10.2}  {}",
            i + 1,
            c.address,
            c.result.latency_display(),
            c.result.avg_speed_mbps,
            c.result.peak_speed_mbps,
            locations.describe(&c.result.location_code)
        );
    }
    println!("{}", "-".repeat(96));
}

async fn handle_check(config: Config, address: IpAddr, location_only: bool, json: bool) -> Result<()> {
    config.validate()?;
    let data = DataDir::new(config.data_dir());
    let vhost = VirtualHost::load(&data.vhost()).await?;
    let locations = LocationTable::load_or_empty(&data.locations()).await;
    let params = config.search_params();
    let probe = HttpProbe::new(vhost.clone(), config.probe_settings());

    if !json {
        println!("Probing {} as {} ({})...", address, vhost.host, if params.use_tls { "https" } else { "http" });
    }

    let location = probe
        .probe_location(address, params.use_tls, params.probe_timeout)
        .await;
    let throughput = if location_only || location.latency_ms.is_none() {
        Default::default()
    } else {
        probe
            .probe_throughput(
                address,
                params.use_tls,
                params.probe_timeout,
                params.throughput_window,
                None,
            )
            .await
    };
    let result = ProbeResult::merge(location, throughput);

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
        return Ok(());
    }

    println!("Latency : {}", result.latency_display());
    println!(
        "Location: {}",
        if result.location_code.is_empty() {
            "unknown".to_string()
        } else {
            locations.describe(&result.location_code)
        }
    );
    if !location_only {
        println!("Average : {:.2} Mbps", result.avg_speed_mbps);
        println!("Peak    : {:.2} Mbps", result.peak_speed_mbps);
        let verdict = if result.avg_speed_mbps >= params.min_bandwidth_mbps {
            "meets"
        } else {
            "below"
        };
        println!("Result  : {} the {} Mbps target", verdict, params.min_bandwidth_mbps);
    }
    Ok(())
}

async fn handle_config(config: Config, explicit: Option<PathBuf>, init: bool) -> Result<()> {
    let text = config.to_toml()?;
    if !init {
        print!("{}", text);
        return Ok(());
    }

    let Some(path) = explicit.or_else(Config::default_path) else {
        bail!("Cannot determine a config directory; pass --config <path>.");
    };
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    if let Some(backup) = utils::backup_file(&path).await? {
        println!("Backup created at: {:?}", backup);
    }
    tokio::fs::write(&path, text).await?;
    println!("Configuration written to {:?}", path);
    Ok(())
}

async fn handle_doctor(config: Config) -> Result<()> {
    let data = DataDir::new(config.data_dir());
    let family = config.search.address_family;
    println!("Data dir: {}", data.root().display());

    let files = [
        (data.subnets(AddressFamily::V4), family == AddressFamily::V4),
        (data.subnets(AddressFamily::V6), family == AddressFamily::V6),
        (data.vhost(), true),
        (data.locations(), false),
    ];
    for (path, required) in &files {
        let state = if path.exists() {
            "ok"
        } else if *required {
            "MISSING"
        } else {
            "absent"
        };
        println!("  {:<60} {}", path.display(), state);
    }

    if let Ok(vhost) = VirtualHost::load(&data.vhost()).await {
        println!("Virtual host: {}", vhost);
    }
    let locations = LocationTable::load_or_empty(&data.locations()).await;
    if !locations.is_empty() {
        println!("Known locations: {}", locations.codes().join(" "));
    }

    match network::check_network_environment().await {
        NetworkEnvironment::Proxied => {
            println!("Network: traffic goes through a proxy; disable it for meaningful results.")
        }
        NetworkEnvironment::Direct => println!("Network: direct"),
    }
    Ok(())
}
