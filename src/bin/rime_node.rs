use std::{error::Error, net::SocketAddr, sync::Arc};

use clap::Parser;
use log::info;
use rime::protocol::{DEFAULT_MAX_FRAME_SIZE, EchoResponder, NodeServer};
use tokio::sync::mpsc;

#[derive(Debug, Parser)]
#[command(version, about = "A protocol-speaking node that echoes queries back", long_about = None)]
struct Cli {
    /// Listen for new connections at address
    #[arg(default_value = "127.0.0.1:9042")]
    address: SocketAddr,
    /// Largest frame body accepted, in bytes
    #[arg(long, default_value_t = DEFAULT_MAX_FRAME_SIZE)]
    max_frame_size: usize,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    let (stop, mut stopped) = mpsc::unbounded_channel();
    ctrlc::set_handler(move || {
        let _ = stop.send(());
    })?;

    let server = NodeServer::bind(
        cli.address,
        Arc::new(EchoResponder::new()),
        cli.max_frame_size,
    )
    .await?;

    tokio::select! {
        result = server.listen() => result?,
        _ = stopped.recv() => info!("interrupted, shutting down"),
    }
    Ok(())
}
