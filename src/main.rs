use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use env_logger::Builder;

use vmdsm::proto::SERVER_PORT;
use vmdsm::Server;

#[derive(Parser, Debug)]
#[clap(version, about = "Serves a shard of guest memory to DSM clients")]
struct Args {
    /// Path to the backing image holding this node's memory contents
    #[clap(short, long, default_value = "physical_ram.img")]
    image: PathBuf,
    /// Address to bind; the DSM port itself is fixed
    #[clap(short, long, default_value = "0.0.0.0")]
    bind: IpAddr,
}

/// Initialize logging
fn init_logging() -> Result<()> {
    Builder::from_default_env()
        .default_format()
        .try_init()
        .context("Failed to init env_logger")?;

    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();

    init_logging()?;
    let server = Server::bind(SocketAddr::new(args.bind, SERVER_PORT), &args.image)?;
    server.run()
}
