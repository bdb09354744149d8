use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::info;

use tokend_core::device::HidapiBackend;
use tokend_server::{serve, ServerState, TlsPem};

/// A loopback HTTPS bridge for USB-HID security tokens.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Address to listen on.
    #[clap(long, default_value = "127.0.0.1")]
    address: IpAddr,

    /// Port to listen on.
    #[clap(long, default_value_t = 21324)]
    port: u16,

    /// Path to the server certificate, PEM-encoded.
    #[clap(long)]
    cert: PathBuf,

    /// Path to the server private key, PEM-encoded.
    #[clap(long)]
    key: PathBuf,
}

#[tokio::main]
async fn start(args: Args) -> Result<()> {
    let tls = TlsPem {
        certificate: tokio::fs::read(&args.cert)
            .await
            .with_context(|| format!("cannot read certificate {}", args.cert.display()))?,
        private_key: tokio::fs::read(&args.key)
            .await
            .with_context(|| format!("cannot read private key {}", args.key.display()))?,
    };

    let backend = Arc::new(HidapiBackend::new().context("cannot initialize HID subsystem")?);
    let state = Arc::new(ServerState::new(backend));
    let addr = SocketAddr::new(args.address, args.port);

    info!("starting server");
    let exit_signal = signal::ctrl_c();
    tokio::pin!(exit_signal);
    tokio::select! {
        result = serve(state, addr, tls) => result?,
        Ok(()) = &mut exit_signal => info!("shutting down"),
    };

    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or("info".into()))
        .with_writer(std::io::stderr)
        .init();

    match start(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{err:?}");
            ExitCode::FAILURE
        }
    }
}
