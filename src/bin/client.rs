//! tcpover client binary
//!
//! Forwards every connection accepted on a local port through the mux pool.
//!
//! Usage: tcpover-client [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>  Path to configuration file
//!   -g, --generate       Print a default configuration
//!   -h, --help           Print help information

use std::env;

use tokio::net::TcpListener;

use tcpover::config::ClientConfig;
use tcpover::mux::TcpConnector;
use tcpover::ClientPool;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
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
            println!("# tcpover client configuration");
            println!();
            print!("{}", ClientConfig::default().to_toml()?);
        }
        "-c" | "--config" => {
            if args.len() < 3 {
                eprintln!("Error: --config requires a file path");
                return Ok(());
            }
            run_client(&args[2]).await?;
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
        r#"tcpover-client - local port forward over a multiplexed tunnel

USAGE:
    tcpover-client [OPTIONS]

OPTIONS:
    -c, --config <FILE>  Path to configuration file
    -g, --generate       Print a default configuration
    -h, --help           Print help information

EXAMPLES:
    Generate a configuration:
        tcpover-client --generate > client.toml

    Forward 127.0.0.1:1080 to the configured destination:
        tcpover-client --config client.toml
"#
    );
}

async fn run_client(config_path: &str) -> anyhow::Result<()> {
    let config = ClientConfig::load(config_path)?;
    let destination = config.forward_destination()?;
    let connector =
        TcpConnector::new(config.server_addr.clone()).with_timeout(config.connect_timeout());
    let pool = ClientPool::new(connector, config.pool_config());

    let listener = TcpListener::bind(&config.listen_addr).await?;
    tracing::info!("Listening on {}", listener.local_addr()?);
    tracing::info!("Forwarding to {} via {}", destination, config.server_addr);

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
                let _ = stream.set_nodelay(true);

                let pool = pool.clone();
                let destination = destination.clone();
                tokio::spawn(async move {
                    if let Err(e) = pool.dispatch(destination, stream).await {
                        tracing::warn!("Session from {} failed: {}", peer, e);
                    }
                });
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!(
                    "Shutting down ({} workers, {} sessions)",
                    pool.worker_count(),
                    pool.session_count()
                );
                println!("{}", pool.metrics().format_report());
                pool.close().await;
                return Ok(());
            }
        }
    }
}
