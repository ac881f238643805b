//! The DNS-over-TLS listener.
//!
//! TCP framing over TLS (RFC 7858).  Certificate and key come from the
//! configured paths; failing to load them disables DoT without touching
//! the rest of the server.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use crate::engine::Engine;
use crate::pipeline::TransportKind;
use crate::units::tcp_server::serve_stream;

/// Run the DoT listener until the process exits.
pub async fn run(engine: Arc<Engine>) {
    let Some(acceptor) = build_acceptor(&engine) else {
        warn!("DoT disabled: no usable certificate");
        return;
    };

    let addr = engine.config.dot.listen;
    let listener = match TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Could not bind DoT {addr}: {e}");
            return;
        }
    };
    engine.listeners.dot.store(true, Ordering::Relaxed);
    info!("DoT listener on {addr}");

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                debug!("DoT accept error: {e}");
                continue;
            }
        };
        let engine = engine.clone();
        let acceptor = acceptor.clone();
        tokio::spawn(async move {
            match acceptor.accept(stream).await {
                Ok(tls) => {
                    serve_stream(&engine, tls, peer.ip(), TransportKind::Dot).await;
                }
                Err(e) => debug!("TLS handshake with {peer} failed: {e}"),
            }
        });
    }
}

/// Load the certificate chain and key; any problem means no DoT.
fn build_acceptor(engine: &Arc<Engine>) -> Option<TlsAcceptor> {
    let config = &engine.config.dot;
    let (cert_path, key_path) = match (&config.cert_path, &config.key_path) {
        (Some(cert), Some(key)) => (cert, key),
        _ => {
            warn!("DoT enabled but cert_path/key_path are not configured");
            return None;
        }
    };

    let certs: Vec<CertificateDer<'static>> = {
        let file = std::fs::File::open(cert_path.as_std_path())
            .map_err(|e| warn!("Cannot open '{cert_path}': {e}"))
            .ok()?;
        rustls_pemfile::certs(&mut std::io::BufReader::new(file))
            .collect::<Result<_, _>>()
            .map_err(|e| warn!("Cannot parse '{cert_path}': {e}"))
            .ok()?
    };

    let key: PrivateKeyDer<'static> = {
        let file = std::fs::File::open(key_path.as_std_path())
            .map_err(|e| warn!("Cannot open '{key_path}': {e}"))
            .ok()?;
        rustls_pemfile::private_key(&mut std::io::BufReader::new(file))
            .map_err(|e| warn!("Cannot parse '{key_path}': {e}"))
            .ok()??
    };

    let tls_config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| warn!("Invalid DoT certificate: {e}"))
        .ok()?;

    Some(TlsAcceptor::from(Arc::new(tls_config)))
}
