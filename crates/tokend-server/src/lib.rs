//! The tokend daemon: kernel, executors, and the HTTPS dispatcher.

#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum_server::tls_rustls::RustlsConfig;
use tracing::info;

pub mod executor;
pub mod kernel;
pub mod web;

pub use kernel::{Kernel, KernelError, SessionId};

use tokend_core::device::HidBackend;

/// Shared state of the daemon: just the kernel.
pub struct ServerState {
    /// Central session/device/config state.
    pub kernel: Kernel,
}

impl ServerState {
    /// State trusting the built-in pinned configuration keys.
    pub fn new(backend: Arc<dyn HidBackend>) -> Self {
        Self {
            kernel: Kernel::new(backend),
        }
    }
}

/// Server key and certificate, as PEM text. Fetched by the caller; the
/// daemon does not know where they come from.
pub struct TlsPem {
    pub certificate: Vec<u8>,
    pub private_key: Vec<u8>,
}

/// Bind the HTTPS server and run it until the task is dropped.
pub async fn serve(state: Arc<ServerState>, addr: SocketAddr, tls: TlsPem) -> Result<()> {
    let tls_config = RustlsConfig::from_pem(tls.certificate, tls.private_key).await?;

    info!("listening at https://{addr}");
    axum_server::bind_rustls(addr, tls_config)
        .serve(web::app(state).into_make_service())
        .await?;
    Ok(())
}
