use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process;

use clap::{Parser, ValueHint};
use tracing_subscriber::EnvFilter;

use filexfer::audit::AuditLog;
use filexfer::dispatch::Server;
use filexfer::error::ServerStartupError;
use filexfer::lifecycle;

#[derive(Parser, Debug)]
#[command(version, about = "Single-file TCP transfer server")]
struct Args {
    /// Directory received files are written to (created if absent)
    #[arg(short = 'd', long = "directory", value_hint = ValueHint::DirPath, default_value = "data")]
    directory: PathBuf,

    /// IP address to bind to
    #[arg(long = "server_ip", default_value = "127.0.0.1")]
    server_ip: String,

    /// Port to bind to
    #[arg(long = "server_port", default_value_t = 12345)]
    server_port: u16,
}

fn start(args: &Args) -> Result<Server, ServerStartupError> {
    fs::create_dir_all(&args.directory).map_err(ServerStartupError::Directory)?;

    let log_path = args.directory.join("log_file.csv");
    let audit = AuditLog::open(&log_path).map_err(ServerStartupError::AuditLog)?;

    let addr: SocketAddr = format!("{}:{}", args.server_ip, args.server_port)
        .parse()
        .map_err(|_| ServerStartupError::Bind(std::io::Error::new(std::io::ErrorKind::InvalidInput, "invalid address")))?;

    lifecycle::install_signal_handlers().map_err(ServerStartupError::Bind)?;

    let server = Server::bind(addr, args.directory.clone(), audit).map_err(ServerStartupError::Bind)?;
    tracing::info!(directory = %args.directory.display(), %addr, "Working directory ready");
    Ok(server)
}

fn main() {
    tracing_subscriber::fmt()
        .compact()
        .with_target(false)
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    tracing::debug!(?args, "Parsed arguments");

    let mut server = match start(&args) {
        Ok(server) => server,
        Err(e) => {
            tracing::error!(error = %e, "server failed to start");
            process::exit(1);
        }
    };

    if let Err(e) = server.run() {
        tracing::error!(error = %e, "readiness loop exited with an error");
        process::exit(1);
    }
}
