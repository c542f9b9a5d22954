//! Proxy routines.
//!
//! Each configured [`RoutineSpec`] is matched here and spawned as its own
//! long-lived task over a shared [`VirtualTun`].

pub mod http;
pub mod relay;
pub mod socks5;
pub mod stdio;
pub mod tcp_tunnel;
pub mod udp_tunnel;

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::error;

use crate::config::types::RoutineSpec;
use crate::tun::VirtualTun;

use http::HttpServer;
use socks5::Socks5Server;
use stdio::StdioTunnel;
use tcp_tunnel::{TcpClientTunnel, TcpServerTunnel};
use udp_tunnel::UdpProxyTunnel;

/// Spawn every routine. Listener-level failures are fatal: the routine
/// logs and the process exits with status 1, matching the startup error
/// policy. A routine that completes normally (the stdio tunnel) just ends
/// its task.
pub fn spawn_routines(vt: Arc<VirtualTun>, specs: Vec<RoutineSpec>) -> Vec<JoinHandle<()>> {
    specs
        .into_iter()
        .map(|spec| {
            let vt = vt.clone();
            tokio::spawn(async move {
                let kind = spec.kind();
                let result = match spec {
                    RoutineSpec::Socks5 {
                        bind,
                        username,
                        password,
                    } => Socks5Server::new(bind, username, password).run(vt).await,
                    RoutineSpec::Http {
                        bind,
                        username,
                        password,
                        cert_file,
                        key_file,
                    } => {
                        HttpServer::new(bind, username, password, cert_file, key_file)
                            .run(vt)
                            .await
                    }
                    RoutineSpec::TcpClient { bind, target } => {
                        TcpClientTunnel::new(bind, target).run(vt).await
                    }
                    RoutineSpec::TcpServer {
                        listen_port,
                        target,
                    } => TcpServerTunnel::new(listen_port, target).run(vt).await,
                    RoutineSpec::UdpProxy {
                        bind,
                        target,
                        inactivity_secs,
                    } => {
                        UdpProxyTunnel::new(bind, target, inactivity_secs)
                            .run(vt)
                            .await
                    }
                    RoutineSpec::Stdio { target } => {
                        // The stdio tunnel is the one routine whose failure
                        // is not fatal: it produces a single pairing.
                        if let Err(e) = StdioTunnel::new(target).run(vt).await {
                            error!(routine = kind, error = %e, "routine failed");
                        }
                        return;
                    }
                };
                if let Err(e) = result {
                    error!(routine = kind, error = %e, "routine failed");
                    std::process::exit(1);
                }
            })
        })
        .collect()
}
