use std::path::PathBuf;
use std::process;

use clap::{Parser, ValueHint};
use tracing_subscriber::EnvFilter;

use filexfer::error::ClientError;
use filexfer::lifecycle;
use filexfer::sender::{self, MAX_BUFFER_SIZE, MIN_BUFFER_SIZE};
use filexfer::transport::{connect_with_retry, validate_ip_port};

#[derive(Parser, Debug)]
#[command(version, about = "Single-file TCP transfer client")]
struct Args {
    /// Path to the file to upload
    #[arg(short = 'f', long = "file_name", value_hint = ValueHint::FilePath)]
    file_name: PathBuf,

    /// Server IP address
    #[arg(long = "server_ip")]
    server_ip: String,

    /// Server port
    #[arg(long = "server_port")]
    server_port: u16,

    /// Bytes read per DATA frame (1..=32768)
    #[arg(long = "buffer_size", default_value_t = 1024, value_parser = clap::value_parser!(usize).range(MIN_BUFFER_SIZE as i64..=MAX_BUFFER_SIZE as i64))]
    buffer_size: usize,
}

fn run(args: &Args) -> Result<(), ClientError> {
    if !args.file_name.exists() {
        eprintln!("File {} not found. Exiting...", args.file_name.display());
        return Err(ClientError::Validation("file not found".into()));
    }

    let addr = validate_ip_port(&args.server_ip, args.server_port)?;
    let mut stream = connect_with_retry(addr)?;
    tracing::info!(%addr, "Connected to server");

    let name = args.file_name.display().to_string();
    tracing::info!(file = %name, "Sending file");

    let result = sender::send_file(&mut stream, &args.file_name, args.buffer_size, |p| {
        tracing::debug!(sent = p.bytes_sent, total = p.total_bytes, "progress");
    });

    match result {
        Ok(()) => {
            println!("File {} sent successfully", args.file_name.display());
            Ok(())
        }
        Err(ClientError::FileAlreadyTransferring) => {
            eprintln!("File is already transferring. Exiting...");
            Err(ClientError::FileAlreadyTransferring)
        }
        Err(e) => {
            eprintln!("Failed to reconnect. Exiting...");
            Err(e)
        }
    }
}

fn main() {
    tracing_subscriber::fmt()
        .compact()
        .with_target(false)
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    if let Err(e) = lifecycle::install_signal_handlers() {
        tracing::warn!(error = %e, "failed to install signal handlers");
    }

    let args = Args::parse();
    tracing::debug!(?args, "Parsed arguments");

    match run(&args) {
        Ok(()) => process::exit(0),
        Err(e) => {
            tracing::error!(error = %e, "transfer failed");
            process::exit(1);
        }
    }
}
