use std::{error::Error, net::SocketAddr, sync::mpsc};

use clap::Parser;
use log::info;

use hcrpc::{protocol::ProtocolVersion, sim::SimServer};

#[derive(Debug, Parser)]
#[command(version, about = "Runs a simulated master server", long_about = None)]
struct Cli {
    /// Listen for new connections at address
    #[arg(default_value = "127.0.0.1:4582")]
    address: SocketAddr,
    /// Username accepted by the handshake
    #[arg(long, default_value = "admin")]
    username: String,
    /// Password accepted for the username
    #[arg(long)]
    password: String,
    /// Highest protocol version to negotiate
    #[arg(long, default_value_t = ProtocolVersion::CURRENT)]
    protocol: ProtocolVersion,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    let mut server = SimServer::builder()
        .account(cli.username, cli.password)
        .version(cli.protocol)
        .bind(cli.address)?;
    println!("listening at {}", server.local_addr());

    let (stop, stopped) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = stop.send(());
    })?;
    stopped.recv()?;

    info!(
        "served {} handshakes and {} requests",
        server.handshakes(),
        server.requests()
    );
    server.shutdown();
    Ok(())
}
