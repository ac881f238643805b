//! The TCP listener and the shared stream-serving loop.
//!
//! Messages are length-prefixed with two big-endian octets (RFC 1035
//! §4.2.2).  A connection may carry any number of messages; requests on
//! one connection are processed in order, so responses are naturally
//! ordered too.  Idle connections are closed after a configurable
//! timeout.  DoT reuses the same loop over a TLS stream.

use std::net::IpAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{debug, error, info, trace};

use crate::engine::Engine;
use crate::pipeline::{self, ClientInfo, TransportKind};

/// Run the plain-TCP listener until the process exits.
pub async fn run(engine: Arc<Engine>) {
    let addr = engine.config.server.listen;
    let listener = match TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Could not bind TCP {addr}: {e}");
            return;
        }
    };
    engine.listeners.tcp.store(true, Ordering::Relaxed);
    info!("TCP listener on {addr}");

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                trace!("TCP accept error: {e}");
                continue;
            }
        };
        let engine = engine.clone();
        tokio::spawn(async move {
            serve_stream(&engine, stream, peer.ip(), TransportKind::Tcp).await;
        });
    }
}

/// Serve length-prefixed DNS messages on a connected stream until it
/// closes, errors, or idles out.
///
/// A client disconnect drops this task and with it any outstanding
/// upstream work for the connection.
pub async fn serve_stream<S>(
    engine: &Arc<Engine>,
    mut stream: S,
    peer: IpAddr,
    transport: TransportKind,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let idle = Duration::from_secs(engine.config.server.tcp_idle_secs);
    let client = ClientInfo {
        addr: peer,
        transport,
    };

    loop {
        let mut len = [0u8; 2];
        match tokio::time::timeout(idle, stream.read_exact(&mut len)).await {
            Ok(Ok(_)) => {}
            Ok(Err(_)) => return, // closed
            Err(_) => {
                debug!("Closing idle connection from {peer}");
                return;
            }
        }

        let mut wire = vec![0u8; u16::from_be_bytes(len) as usize];
        if stream.read_exact(&mut wire).await.is_err() {
            return;
        }

        let Some(response) = pipeline::handle(engine, &wire, client).await else {
            continue;
        };

        let mut framed = Vec::with_capacity(response.len() + 2);
        framed.extend_from_slice(&(response.len() as u16).to_be_bytes());
        framed.extend_from_slice(&response);
        if stream.write_all(&framed).await.is_err() {
            return;
        }
    }
}
