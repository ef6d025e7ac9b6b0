use std::path::PathBuf;
use std::time::Duration;

use log::info;
use structopt::StructOpt;

use dme::{Config, Reactor, Supervisor, UdpNet, SUPERVISOR_ID};

#[derive(StructOpt)]
#[structopt(name = "dme-supervisor")]
struct Opt {
    /// Topology file: one `<id> <ip:port> <link-speed-bps>` line per site
    #[structopt(short = "c", long = "config")]
    config: PathBuf,

    /// Seconds between election ticks
    #[structopt(short = "p", long = "period", default_value = "5")]
    period: u64,

    /// Simulated critical-region occupancy handed to elected sites, seconds
    #[structopt(short = "o", long = "occupancy", default_value = "1")]
    occupancy: u64,

    /// Increase log verbosity (-v, -vv)
    #[structopt(short = "v", long = "verbose", parse(from_occurrences))]
    verbose: u8,
}

fn logger(verbose: u8) -> Result<(), fern::InitError> {
    let level = match verbose {
        0 => log::LevelFilter::Info,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!("[{}][{}] {}", record.level(), record.target(), message))
        })
        .level(level)
        .chain(std::io::stdout())
        .apply()?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let opt = Opt::from_args();
    logger(opt.verbose)?;

    let config = Config::load(&opt.config, SUPERVISOR_ID)?;

    let mut reactor = Reactor::new();
    Supervisor::bind(&mut reactor)?;

    let net = UdpNet::bind(config.clone()).await?;
    net.spawn_receiver(reactor.queue());

    info!(
        "supervising {} sites, election period {}s, occupancy {}s",
        config.count(),
        opt.period,
        opt.occupancy
    );

    let mut sup = Supervisor::new(
        config,
        Box::new(net),
        Duration::from_secs(opt.period),
        Duration::from_secs(opt.occupancy),
    );
    reactor.run(&mut sup).await?;
    Ok(())
}
