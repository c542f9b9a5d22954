//! Standard-stream bridge: one TCP connection through the tunnel, wired to
//! the process's stdin and stdout.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info};

use crate::common::Address;
use crate::tun::VirtualTun;

pub struct StdioTunnel {
    target: String,
}

impl StdioTunnel {
    pub fn new(target: String) -> Self {
        Self { target }
    }

    /// Produces exactly one pairing and returns when either end closes.
    pub async fn run(self, vt: Arc<VirtualTun>) -> Result<()> {
        let address = Address::parse(&self.target)?;
        let addr = match address {
            Address::Ip(addr) => addr,
            Address::Domain(host, port) => vt.resolve_to_addr_port(&host, port).await?,
        };
        let remote = vt.dial_tcp(addr).await?;
        info!(target = %addr, "stdio tunnel connected");

        // The global stdout handle may have been rebound by the logging
        // setup, so the real stream is opened by path.
        let mut stdout = tokio::fs::OpenOptions::new()
            .write(true)
            .open("/dev/stdout")
            .await
            .context("open /dev/stdout")?;
        let mut stdin = tokio::io::stdin();

        let upload = {
            let remote = remote.clone();
            tokio::spawn(async move {
                let mut buf = vec![0u8; 32 * 1024];
                loop {
                    let n = match stdin.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => n,
                    };
                    if remote.write(&buf[..n]).await.is_err() {
                        break;
                    }
                }
                remote.close().await;
            })
        };

        let download = {
            let remote = remote.clone();
            tokio::spawn(async move {
                let mut buf = vec![0u8; 32 * 1024];
                loop {
                    let n = match remote.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => n,
                    };
                    if stdout.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
                let _ = stdout.flush().await;
                remote.close().await;
            })
        };

        let _ = tokio::join!(upload, download);
        debug!("stdio tunnel closed");
        Ok(())
    }
}
