use std::path::PathBuf;

use log::info;
use structopt::StructOpt;

use dme::{Algorithm, Config, Peer, Reactor, SiteId, UdpNet};

#[derive(StructOpt)]
#[structopt(name = "dme-peer")]
struct Opt {
    /// Site id (1..=N; 0 is the supervisor)
    #[structopt(short = "i", long = "id")]
    id: SiteId,

    /// Topology file: one `<id> <ip:port> <link-speed-bps>` line per site
    #[structopt(short = "c", long = "config")]
    config: PathBuf,

    /// Mutual exclusion algorithm: lamport, ricart, suzuki, or singhal
    #[structopt(short = "a", long = "algorithm")]
    algorithm: Algorithm,

    /// Start holding the token (token-passing only; exactly one site)
    #[structopt(long = "token")]
    token: bool,

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

    if opt.id == dme::SUPERVISOR_ID {
        return Err("peers must have a nonzero site id".into());
    }

    let config = Config::load(&opt.config, opt.id)?;
    let policy = dme::policy::build(opt.algorithm, config.id(), config.count(), opt.token);

    let mut reactor = Reactor::new();
    Peer::bind(&mut reactor)?;

    let net = UdpNet::bind(config.clone()).await?;
    net.spawn_receiver(reactor.queue());

    info!(
        "site {} running {}{}",
        config.id(),
        opt.algorithm,
        if opt.token { " (token holder)" } else { "" }
    );

    let mut peer = Peer::new(config, policy, Box::new(net));
    reactor.run(&mut peer).await?;
    Ok(())
}
