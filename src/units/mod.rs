//! The listener units.
//!
//! Each listener runs as an independent task against the shared engine:
//! plain DNS over UDP and TCP, DoT, DoH, and the HTTP admin surface.

pub mod doh_server;
pub mod dot_server;
pub mod http_server;
pub mod tcp_server;
pub mod udp_server;

use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::engine::Engine;

/// Spawn every enabled listener.
///
/// Listeners that fail to start disable themselves (visible on the
/// health endpoint) without taking the process down; the admin surface
/// always starts.
pub fn spawn(engine: &Arc<Engine>) -> Vec<JoinHandle<()>> {
    let mut handles = vec![
        tokio::spawn(udp_server::run(engine.clone())),
        tokio::spawn(tcp_server::run(engine.clone())),
        tokio::spawn(http_server::run(engine.clone())),
    ];
    if engine.config.dot.enabled {
        handles.push(tokio::spawn(dot_server::run(engine.clone())));
    }
    if engine.config.doh.enabled {
        handles.push(tokio::spawn(doh_server::run(engine.clone())));
    }
    handles
}
