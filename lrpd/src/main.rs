//! lrpd daemon: runs an LRP node on one interface.

use anyhow::Context;
use clap::Parser;
use lrpd::address::parse_subnet;
use lrpd::node::detect_interface;
use lrpd::{
    EventLoop, KernelRoutingTable, KernelTableOptions, NetlinkKernel, NftFirewall, NodeIdentity,
    NodeSockets, Observer, Role, Settings,
};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "lrpd")]
#[command(about = "LRP routing node")]
struct Args {
    /// Interface to run on (auto-detected when there is a single one)
    #[arg(short, long)]
    interface: Option<String>,

    /// Run as the sink of the network
    #[arg(long)]
    sink: bool,

    /// Network prefix of the LRP network (default: from the interface netmask)
    #[arg(long, value_parser = parse_subnet)]
    prefix: Option<lrpd::Subnet>,

    /// JSON settings file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Increase verbosity (-v info, -vv debug)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() {
    let args = Args::parse();

    let level = match args.verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Err(e) = run(args) {
        error!(error = format!("{e:#}"), "lrpd failed");
        std::process::exit(1);
    }
}

fn run(args: Args) -> anyhow::Result<()> {
    let settings = match &args.config {
        Some(path) => Settings::load(path)?,
        None => Settings::default(),
    };

    let interface = match args.interface {
        Some(interface) => interface,
        None => detect_interface()?,
    };
    let role = if args.sink { Role::Sink } else { Role::Router };
    let identity = NodeIdentity::resolve(&interface, role, args.prefix)?;

    let kernel = NetlinkKernel::connect(identity.index).context("netlink")?;
    let firewall = NftFirewall::new(
        &settings.nft_table,
        &settings.forward_chain,
        &settings.chain_name,
        settings.queue_num,
    );
    let table = KernelRoutingTable::open(
        kernel,
        firewall,
        KernelTableOptions::new(&identity, &settings),
    )?;
    let endpoints = NodeSockets::open(&identity, &settings).context("endpoints")?;

    let observer = Observer::new(settings.report_interval());
    let mut event_loop = EventLoop::new(observer, table, endpoints, identity);
    let outcome = event_loop.run();

    let (observer, table, endpoints) = event_loop.into_parts();
    drop(endpoints);
    let closed = table.close();
    info!(stats = ?observer.stats(), "lrpd stopped");
    outcome?;
    closed?;
    Ok(())
}
