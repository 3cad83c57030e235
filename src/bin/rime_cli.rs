use std::{error::Error, io, net::SocketAddr, time::Duration};

use clap::Parser;
use rime::{
    Command, Consistency, DriverConfig, Session, Statement, prompt,
    config::SpeculativeExecutionConfig,
};

#[derive(Debug, Parser)]
#[command(version, about = "Interactive client for a rime cluster", long_about = None)]
struct Cli {
    /// Addresses of the nodes to connect to
    #[arg(required = true)]
    nodes: Vec<SocketAddr>,
    /// Body compression: lz4, snappy or none
    #[arg(long)]
    compression: Option<String>,
    /// Per-request deadline in milliseconds
    #[arg(long, default_value_t = 2000)]
    timeout_ms: u64,
    /// Connections kept open per node
    #[arg(long, default_value_t = 1)]
    connections: usize,
    /// Delay between speculative executions of idempotent statements, in milliseconds
    #[arg(long)]
    speculative_delay_ms: Option<u64>,
    /// Executions per idempotent statement, the initial one included
    #[arg(long, default_value_t = 2)]
    speculative_max: usize,
}

impl Cli {
    fn config(&self) -> DriverConfig {
        let mut config = DriverConfig::default()
            .with_pool_size(self.connections, self.connections.max(2))
            .with_request_timeout(Duration::from_millis(self.timeout_ms));
        if let Some(name) = &self.compression {
            config = config.with_compression(name.clone());
        }
        if let Some(delay) = self.speculative_delay_ms {
            config = config.with_speculative_execution(SpeculativeExecutionConfig::Constant {
                delay: Duration::from_millis(delay),
                max_executions: self.speculative_max,
            });
        }
        config
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    let session = Session::builder()
        .config(cli.config())
        .known_nodes(cli.nodes.iter().copied())
        .build()
        .await?;

    let mut consistency = session.config().default_consistency;
    let mut idempotent = None;
    loop {
        let read = tokio::task::spawn_blocking(|| prompt(io::stdin().lock(), io::stdout().lock()));
        let command = match read.await? {
            Ok(command) => command,
            Err(e) => {
                eprintln!("{e}");
                continue;
            }
        };

        let statement = match command {
            Command::Exit => break,
            Command::Consistency(level) => {
                consistency = level;
                println!("consistency set to {consistency}");
                continue;
            }
            Command::Idempotent(value) => {
                idempotent = Some(value);
                continue;
            }
            Command::Metrics => {
                println!("{:?}", session.metrics());
                continue;
            }
            command => match Statement::try_from(command) {
                Ok(statement) => statement,
                Err(e) => {
                    eprintln!("error: {e}");
                    continue;
                }
            },
        };

        let statement = with_settings(statement, consistency, idempotent);
        match session.execute(&statement).await {
            Ok(result) if result.is_degraded() => {
                println!("ignored error on {}: {:?}", result.coordinator, result.ignored_error)
            }
            Ok(result) => println!(
                "{:?} from {} after {} attempt(s)",
                result.body, result.coordinator, result.attempts
            ),
            Err(e) => eprintln!("query error: {e}"),
        }
    }

    session.close();
    Ok(())
}

fn with_settings(
    statement: Statement,
    consistency: Consistency,
    idempotent: Option<bool>,
) -> Statement {
    let statement = statement.with_consistency(consistency);
    match idempotent {
        Some(idempotent) => statement.with_idempotent(idempotent),
        None => statement,
    }
}
