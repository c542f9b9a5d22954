//! Static TCP tunnels.
//!
//! The client tunnel listens on the host and dials the target through the
//! tunnel; the server tunnel listens inside the tunnel and dials the target
//! on the host network. Targets are re-resolved per connection so DNS
//! changes take effect without a restart.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info};

use crate::common::Address;
use crate::tun::VirtualTun;

use super::relay::{copy_pool, splice};

pub struct TcpClientTunnel {
    bind: SocketAddr,
    target: String,
}

pub struct TcpServerTunnel {
    listen_port: u16,
    target: String,
}

impl TcpClientTunnel {
    pub fn new(bind: SocketAddr, target: String) -> Self {
        Self { bind, target }
    }

    pub async fn run(self, vt: Arc<VirtualTun>) -> Result<()> {
        let listener = TcpListener::bind(self.bind)
            .await
            .with_context(|| format!("tcp client tunnel listen on {}", self.bind))?;
        info!(addr = %self.bind, target = %self.target, "tcp client tunnel listening");

        loop {
            let (conn, peer) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    error!(error = %e, "tcp client tunnel accept failed");
                    continue;
                }
            };
            let vt = vt.clone();
            let target = self.target.clone();
            tokio::spawn(async move {
                if let Err(e) = client_forward(vt, &target, conn).await {
                    error!(peer = %peer, target = %target, error = %e, "tcp client tunnel failed");
                }
            });
        }
    }
}

async fn client_forward(vt: Arc<VirtualTun>, target: &str, conn: TcpStream) -> Result<()> {
    let addr = resolve_target(&vt, target).await?;
    let remote = vt.dial_tcp(addr).await?;
    splice(conn, remote, copy_pool()).await;
    Ok(())
}

impl TcpServerTunnel {
    pub fn new(listen_port: u16, target: String) -> Self {
        Self {
            listen_port,
            target,
        }
    }

    pub async fn run(self, vt: Arc<VirtualTun>) -> Result<()> {
        let listener = vt.listen_tcp(self.listen_port);
        info!(
            port = self.listen_port,
            target = %self.target,
            "tcp server tunnel listening inside tunnel"
        );

        loop {
            let conn = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    error!(error = %e, "tcp server tunnel accept failed");
                    continue;
                }
            };
            let vt = vt.clone();
            let target = self.target.clone();
            tokio::spawn(async move {
                let result: Result<()> = async {
                    let addr = resolve_target(&vt, &target).await?;
                    // The target lives on the host network.
                    let local = TcpStream::connect(addr)
                        .await
                        .with_context(|| format!("dial {} on host network", addr))?;
                    splice(local, conn, copy_pool()).await;
                    Ok(())
                }
                .await;
                if let Err(e) = result {
                    error!(target = %target, error = %e, "tcp server tunnel failed");
                }
            });
        }
    }
}

async fn resolve_target(vt: &VirtualTun, target: &str) -> Result<SocketAddr> {
    let address = Address::parse(target)?;
    match address {
        Address::Ip(addr) => Ok(addr),
        Address::Domain(host, port) => Ok(vt.resolve_to_addr_port(&host, port).await?),
    }
}
