//! The UDP listener.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tracing::{error, info, trace};

use crate::engine::Engine;
use crate::pipeline::{self, ClientInfo, TransportKind};

/// Run the UDP listener until the process exits.
///
/// Each datagram is handled on its own task; UDP has no cancellation, so
/// a slow resolution simply times out on its own deadline.
pub async fn run(engine: Arc<Engine>) {
    let addr = engine.config.server.listen;
    let socket = match UdpSocket::bind(addr).await {
        Ok(socket) => Arc::new(socket),
        Err(e) => {
            error!("Could not bind UDP {addr}: {e}");
            return;
        }
    };
    engine.listeners.udp.store(true, Ordering::Relaxed);
    info!("UDP listener on {addr}");

    let mut buf = vec![0u8; 65535];
    loop {
        let (len, peer) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                trace!("UDP receive error: {e}");
                continue;
            }
        };

        let wire = buf[..len].to_vec();
        let engine = engine.clone();
        let socket = socket.clone();
        tokio::spawn(async move {
            let client = ClientInfo {
                addr: peer.ip(),
                transport: TransportKind::Udp,
            };
            if let Some(response) = pipeline::handle(&engine, &wire, client).await {
                if let Err(e) = socket.send_to(&response, peer).await {
                    trace!("UDP send to {peer} failed: {e}");
                }
            }
        });
    }
}
