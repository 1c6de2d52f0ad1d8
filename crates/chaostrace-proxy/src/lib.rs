//! §4.7 DB Proxy: a transparent PostgreSQL simple-query interceptor.
//! Every byte the agent sends is relayed to the sandboxed database
//! untouched, except a simple-query ('Q') message, which is parsed,
//! scored, and policed before the proxy decides whether to forward
//! it, answer with a synthesized protocol error, or silently drop it
//! to simulate a hung connection.
//!
//! Grounded on `original_source/chaostrace/db_proxy/proxy_server.py`'s
//! `DBProxyServer`/`DBProxyConnection` pair.

mod connection;
mod wire;

pub use connection::{handle_connection, ProxyPipeline};

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{error, info, warn};

/// Errors the proxy listener or one of its connections can surface.
#[derive(thiserror::Error, Debug)]
pub enum ProxyError {
    /// An I/O error on the listening socket or one of its streams.
    #[error("proxy I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Bind `listen_addr` and accept connections forever, proxying each
/// one to `upstream_addr` through `pipeline`. Returns only if the
/// listener itself fails to bind; individual connection errors are
/// logged and otherwise swallowed so one misbehaving client can't take
/// the whole proxy down (§4.7 "never lets a single connection's error
/// stop the listener").
pub async fn serve(
    listen_addr: SocketAddr,
    upstream_addr: SocketAddr,
    pipeline: Arc<ProxyPipeline>,
) -> Result<(), ProxyError> {
    let listener = TcpListener::bind(listen_addr).await?;
    info!(%listen_addr, %upstream_addr, "db proxy listening");

    loop {
        let (client, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                error!(%err, "proxy accept failed");
                continue;
            }
        };
        let pipeline = Arc::clone(&pipeline);
        tokio::spawn(async move {
            if let Err(err) = connection::handle_connection(client, upstream_addr, pipeline).await {
                warn!(%peer, %err, "proxy connection ended with an error");
            }
        });
    }
}
