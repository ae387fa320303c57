use std::{error::Error, thread, time::Duration};

use clap::Parser;

use hcrpc::{Connector, ConnectorConfig, Credentials, config::DEFAULT_PORT};

#[derive(Debug, Parser)]
#[command(version, about = "Pings a master server", long_about = None)]
struct Cli {
    /// Master server hostname
    hostname: String,
    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,
    #[arg(long, short)]
    username: String,
    #[arg(long, short)]
    password: String,
    /// Number of pings to send
    #[arg(long, short, default_value_t = 4)]
    count: u32,
    /// Pause between pings, in milliseconds
    #[arg(long, default_value_t = 1000)]
    interval: u64,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    let config = ConnectorConfig::new(
        cli.hostname,
        cli.port,
        Credentials::new(cli.username, cli.password),
    );
    let connector = Connector::builder(config).build()?;
    connector.test_connect()?;
    if let Some(id) = connector.connector_id() {
        println!("connected as connector {id}");
    }

    for seq in 1..=cli.count {
        match connector.ping() {
            Ok(rtt) => println!("ping {seq}: {:.3} ms", rtt.as_secs_f64() * 1000.0),
            Err(e) => eprintln!("ping {seq}: {e}"),
        }
        if seq < cli.count {
            thread::sleep(Duration::from_millis(cli.interval));
        }
    }
    Ok(())
}
