use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Duration;

use netprobe_proxy::oui::DEFAULT_OUI_URL;
use netprobe_proxy::publish::{CloudflareCredentials, CLOUDFLARE_API_BASE};
use netprobe_proxy::server::{self, ServerConfig};
use netprobe_proxy::types::PortCheckReport;
use netprobe_proxy::{ports, probe, proxy};

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// netprobe-proxy: TCP probe, reverse DNS, OUI vendor and API proxy service.
#[derive(Debug, Parser)]
#[command(
    name = "netprobe-proxy",
    version,
    about = "TCP probe, reverse DNS, OUI vendor lookup and upstream API proxy over HTTP.",
    long_about = None,
    args_conflicts_with_subcommands = true
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    #[command(flatten)]
    serve: ServeArgs,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Take sequential TCP connect latency samples against host:port.
    Ping(PingArgs),
    /// Check a list of TCP ports on one host concurrently.
    Ports(PortsArgs),
}

#[derive(Debug, Clone, Args)]
struct ServeArgs {
    /// Address the HTTP server binds to.
    #[arg(long, env = "NETPROBE_BIND", default_value = "127.0.0.1:8080")]
    bind: String,

    /// CSV vendor table downloaded on the first OUI lookup.
    #[arg(long = "oui-url", env = "NETPROBE_OUI_URL", default_value = DEFAULT_OUI_URL)]
    oui_url: String,

    /// Timeout for outbound HTTP requests in milliseconds.
    #[arg(long = "upstream-timeout-ms", default_value_t = 10_000)]
    upstream_timeout_ms: u64,

    /// Add or replace a proxied upstream (repeatable).
    #[arg(long = "upstream", value_name = "NAME=URL")]
    upstreams: Vec<String>,

    /// Cloudflare API token used by dns/publish.
    #[arg(long = "cloudflare-token", env = "CLOUDFLARE_API_TOKEN", hide_env_values = true)]
    cloudflare_token: Option<String>,

    /// Cloudflare zone id used by dns/publish.
    #[arg(long = "cloudflare-zone", env = "CLOUDFLARE_ZONE_ID")]
    cloudflare_zone: Option<String>,

    /// Cloudflare API base URL.
    #[arg(long = "cloudflare-api", default_value = CLOUDFLARE_API_BASE, hide = true)]
    cloudflare_api: String,
}

#[derive(Debug, Clone, Args)]
struct PingArgs {
    host: String,

    #[arg(long, default_value_t = probe::DEFAULT_PING_PORT)]
    port: u16,

    /// Number of samples (1..=20).
    #[arg(long, default_value_t = probe::DEFAULT_PING_COUNT)]
    count: u32,

    /// Per-attempt connect timeout in milliseconds.
    #[arg(long = "timeout-ms", default_value_t = 2000)]
    timeout_ms: u64,
}

#[derive(Debug, Clone, Args)]
struct PortsArgs {
    host: String,

    /// Ports and ranges, e.g. `22,80,8000-8010`. Defaults to a common set.
    #[arg(long)]
    ports: Option<String>,

    /// File with one port or range per line.
    #[arg(long = "ports-file", conflicts_with = "ports")]
    ports_file: Option<PathBuf>,

    /// Max concurrent TCP connect attempts.
    #[arg(long, default_value_t = 64)]
    concurrency: usize,

    /// Per-port connect timeout in milliseconds.
    #[arg(long = "timeout-ms", default_value_t = 1500)]
    timeout_ms: u64,

    /// Write results as pretty JSON to this path.
    #[arg(long)]
    output: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("netprobe_proxy=info,tower_http=info")),
        )
        .with_target(false)
        .compact()
        .init();

    let cli = Cli::parse();
    match cli.command {
        Some(Command::Ping(args)) => run_ping(args).await,
        Some(Command::Ports(args)) => run_ports(args).await,
        None => run_server(cli.serve).await,
    }
}

async fn run_server(args: ServeArgs) -> Result<()> {
    let upstreams = args
        .upstreams
        .iter()
        .map(|s| proxy::parse_upstream_arg(s))
        .collect::<Result<Vec<_>>>()?;
    let cloudflare = CloudflareCredentials::from_parts(args.cloudflare_token, args.cloudflare_zone);
    if cloudflare.is_none() {
        info!("Cloudflare credentials not set; dns/publish will answer 501");
    }

    let config = ServerConfig {
        bind: args.bind,
        oui_url: args.oui_url,
        upstream_timeout: Duration::from_millis(args.upstream_timeout_ms),
        upstreams,
        cloudflare,
        cloudflare_api_base: args.cloudflare_api,
    };

    let shutdown = CancellationToken::new();
    let on_ctrl_c = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl+C received, shutting down");
        }
        on_ctrl_c.cancel();
    });

    server::spawn_server(config, shutdown).await
}

async fn run_ping(args: PingArgs) -> Result<()> {
    let report = probe::ping(
        &args.host,
        args.port,
        args.count,
        Duration::from_millis(args.timeout_ms),
    )
    .await;

    println!("{}:{}", report.host, report.port);
    for (i, v) in report.values.iter().enumerate() {
        match v {
            Some(ms) => println!("  seq={i:<2} time={ms} ms"),
            None => println!("  seq={i:<2} no connection"),
        }
    }
    println!("{}", report.note);
    Ok(())
}

async fn run_ports(args: PortsArgs) -> Result<()> {
    let list = match (&args.ports, &args.ports_file) {
        (Some(spec), _) => ports::parse_ports_str(spec)?,
        (None, Some(path)) => ports::load_ports_from_path(path)?,
        (None, None) => ports::default_ports(),
    };
    let values: Vec<Value> = list.iter().copied().map(Value::from).collect();

    let results = probe::check_ports(
        &args.host,
        &values,
        Duration::from_millis(args.timeout_ms),
        args.concurrency,
    )
    .await;
    let report = PortCheckReport { host: args.host, results };

    print_results_table(&report);
    if let Some(path) = args.output.as_deref() {
        if let Err(e) = write_results_json(path, &report) {
            warn!("failed to write JSON to {}: {e:#}", path.display());
        } else {
            println!("Wrote JSON results to {}", path.display());
        }
    }
    Ok(())
}

fn print_results_table(report: &PortCheckReport) {
    let port_w = 5usize;
    let state_w = 6usize;
    let open = report.results.iter().filter(|r| r.open).count();

    println!(
        "\n{}: {} open of {} checked",
        report.host,
        open,
        report.results.len()
    );
    println!(
        "{:>port_w$}  {:<state_w$}  reason",
        "port",
        "state",
        port_w = port_w,
        state_w = state_w
    );
    println!(
        "{:-<port_w$}  {:-<state_w$}  {:-<6}",
        "",
        "",
        "",
        port_w = port_w,
        state_w = state_w
    );
    for r in &report.results {
        let reason: String = r.reason.as_deref().unwrap_or("").chars().take(60).collect();
        println!(
            "{:>port_w$}  {:<state_w$}  {}",
            r.port.to_string(),
            if r.open { "open" } else { "closed" },
            reason,
            port_w = port_w,
            state_w = state_w
        );
    }
}

fn write_results_json(path: &Path, report: &PortCheckReport) -> Result<()> {
    let file = File::create(path)?;
    serde_json::to_writer_pretty(file, report)?;
    Ok(())
}
