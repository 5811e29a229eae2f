use std::path::PathBuf;
use std::process;

use clap::Parser;
use mjpeg::{Server, ServerConfig};
use tracing::Level;

const DEFAULT_CONFIG: &str = "mjpeg_webserver.conf";

#[derive(Parser)]
#[command(
    name = "mjpeg-server",
    about = "HTTP server for JPEG snapshots and MJPEG streams"
)]
struct Args {
    /// Configuration file [default: mjpeg_webserver.conf, if present]
    #[arg(long = "config", short = 'f')]
    config: Option<PathBuf>,

    /// Listen port, overriding the configuration file
    #[arg(long, short)]
    port: Option<u16>,

    /// Log at debug level
    #[arg(long, short)]
    debug: bool,
}

fn load_config(args: &Args) -> mjpeg::Result<ServerConfig> {
    let mut config = match &args.config {
        Some(path) => ServerConfig::load(path)?,
        None => {
            let path = PathBuf::from(DEFAULT_CONFIG);
            if path.exists() {
                ServerConfig::load(&path)?
            } else {
                tracing::info!("no {DEFAULT_CONFIG} found, using defaults");
                ServerConfig::default()
            }
        }
    };
    if let Some(port) = args.port {
        config.port = port;
    }
    Ok(config)
}

fn main() {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(if args.debug { Level::DEBUG } else { Level::INFO })
        .init();

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            process::exit(1);
        }
    };

    let mut server = match Server::new(config) {
        Ok(server) => server,
        Err(e) => {
            eprintln!("Failed to set up server: {e}");
            process::exit(1);
        }
    };

    if let Err(e) = server.start() {
        eprintln!("Failed to start server: {e}");
        process::exit(1);
    }

    if let Err(e) = server.wait() {
        eprintln!("Server error: {e}");
        process::exit(1);
    }
}
