//! tcpover server binary
//!
//! Usage: tcpover-server [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>  Path to configuration file
//!   -g, --generate       Print a default configuration
//!   -h, --help           Print help information

use std::env;
use std::sync::Arc;

use tokio::net::TcpListener;

use tcpover::config::ServerConfig;
use tcpover::{DirectDispatcher, EchoDispatcher, MuxMetrics, ServerWorker};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Respects RUST_LOG (e.g. RUST_LOG=debug)
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_usage();
        return Ok(());
    }

    match args[1].as_str() {
        "-h" | "--help" => {
            print_usage();
        }
        "-g" | "--generate" => {
            println!("# tcpover server configuration");
            println!();
            print!("{}", ServerConfig::default().to_toml()?);
        }
        "-c" | "--config" => {
            if args.len() < 3 {
                eprintln!("Error: --config requires a file path");
                return Ok(());
            }
            run_server(&args[2]).await?;
        }
        _ => {
            eprintln!("Unknown option: {}", args[1]);
            print_usage();
        }
    }

    Ok(())
}

fn print_usage() {
    println!(
        r#"tcpover-server - multiplexed tunnel endpoint

USAGE:
    tcpover-server [OPTIONS]

OPTIONS:
    -c, --config <FILE>     Path to configuration file
    -g, --generate          Print a default configuration
    -h, --help              Print help information

EXAMPLES:
    Generate a configuration:
        tcpover-server --generate > server.toml

    Run the server:
        tcpover-server --config server.toml
"#
    );
}

async fn run_server(config_path: &str) -> anyhow::Result<()> {
    let config = ServerConfig::load(config_path)?;
    let listener = TcpListener::bind(&config.listen_addr).await?;
    let metrics = Arc::new(MuxMetrics::new());

    tracing::info!("Listening for transports on {}", listener.local_addr()?);
    if config.echo {
        tracing::info!("Echo mode: sessions are looped back");
    }

    let direct = DirectDispatcher::new(config.connect_timeout());
    let echo = EchoDispatcher::default();

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::warn!("Accept failed: {}", e);
                        continue;
                    }
                };
                if let Err(e) = stream.set_nodelay(true) {
                    tracing::debug!("set_nodelay failed for {}: {}", peer, e);
                }
                tracing::info!("Transport from {}", peer);

                let metrics = Arc::clone(&metrics);
                if config.echo {
                    ServerWorker::with_metrics(echo.clone(), stream, metrics);
                } else {
                    ServerWorker::with_metrics(direct.clone(), stream, metrics);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutting down");
                println!("{}", metrics.format_report());
                return Ok(());
            }
        }
    }
}
