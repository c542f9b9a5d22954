//! VirtualTun — the central runtime object.
//!
//! Owns the virtual network stack, the WireGuard engine, and the device
//! configuration; every proxy routine and the health surface hold a shared
//! reference and dial through it.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::common::Error;
use crate::config::types::DeviceConfig;
use crate::dns::NameResolver;
use crate::stack::tcp::{VirtTcpListener, VirtTcpStream};
use crate::stack::udp::VirtUdpSocket;
use crate::stack::{icmp, Stack, StackHandle};
use crate::wg::{uapi, WgDevice};

/// Attempts made while waiting for the initial handshakes.
const HANDSHAKE_ATTEMPTS: u32 = 3;
const HANDSHAKE_RETRY_INTERVAL: Duration = Duration::from_secs(1);

pub struct VirtualTun {
    stack: StackHandle,
    device: WgDevice,
    conf: DeviceConfig,
    resolver: NameResolver,
    /// Unix seconds of the last successful pong, per liveness target.
    ping_record: Mutex<HashMap<String, u64>>,
}

impl std::fmt::Debug for VirtualTun {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualTun").finish_non_exhaustive()
    }
}

impl VirtualTun {
    /// Build the stack and the engine, apply the IPC request, bring the
    /// device up, and wait until every peer with an endpoint has completed
    /// its handshake.
    pub async fn new(conf: DeviceConfig) -> Result<Arc<Self>, Error> {
        let ipc_request = uapi::create_ipc_request(&conf);

        let stack = Stack::new(&conf.endpoint_addrs, conf.mtu)?;
        let device = WgDevice::new(stack.clone(), conf.listen_port, conf.mtu)?;
        device.ipc_set(&ipc_request).await?;
        device.up().await;

        for peer in &conf.peers {
            let Some(endpoint) = peer.endpoint else {
                continue;
            };
            let key_hex = hex::encode(peer.public_key);
            let mut established = false;
            for _ in 0..HANDSHAKE_ATTEMPTS {
                let dump = device.ipc_get().await;
                if peer_established(&dump, &key_hex) {
                    established = true;
                    break;
                }
                tokio::time::sleep(HANDSHAKE_RETRY_INTERVAL).await;
            }
            if !established {
                return Err(Error::HandshakeTimeout(format!(
                    "no handshake with peer at {}",
                    endpoint
                )));
            }
            info!(endpoint = %endpoint, "wireguard handshake established");
        }

        let resolver = NameResolver::new(stack.clone(), &conf.dns)?;

        let mut ping_record = HashMap::new();
        for addr in &conf.check_alive {
            ping_record.insert(addr.to_string(), 0);
        }

        Ok(Arc::new(Self {
            stack,
            device,
            conf,
            resolver,
            ping_record: Mutex::new(ping_record),
        }))
    }

    pub fn conf(&self) -> &DeviceConfig {
        &self.conf
    }

    pub fn resolver(&self) -> &NameResolver {
        &self.resolver
    }

    /// True when no DNS servers were configured and names go to the host
    /// resolver.
    pub fn system_dns(&self) -> bool {
        self.conf.dns.is_empty()
    }

    pub async fn dial_tcp(&self, addr: SocketAddr) -> Result<VirtTcpStream, Error> {
        debug!(target = %addr, "dialing tcp through tunnel");
        VirtTcpStream::connect(self.stack.clone(), addr).await
    }

    pub fn listen_tcp(&self, port: u16) -> VirtTcpListener {
        VirtTcpListener::bind(self.stack.clone(), port)
    }

    pub async fn dial_udp(&self, addr: SocketAddr) -> Result<VirtUdpSocket, Error> {
        VirtUdpSocket::connect(self.stack.clone(), addr).await
    }

    pub async fn listen_udp(&self, port: u16) -> Result<VirtUdpSocket, Error> {
        VirtUdpSocket::bind(self.stack.clone(), port).await
    }

    /// Resolve `host:port` where the host may be a name, through the
    /// configured resolver.
    pub async fn resolve_to_addr_port(&self, host: &str, port: u16) -> Result<SocketAddr, Error> {
        self.resolver.resolve_addr_port(host, port).await
    }

    pub async fn ping(&self, target: IpAddr, timeout: Duration) -> Result<(), Error> {
        icmp::ping(&self.stack, target, timeout).await
    }

    pub async fn ipc_get(&self) -> String {
        self.device.ipc_get().await
    }

    /// Record a successful pong for a liveness target.
    pub async fn record_pong(&self, target: IpAddr) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let mut record = self.ping_record.lock().await;
        let entry = record.entry(target.to_string()).or_insert(0);
        // Timestamps only move forward.
        if now > *entry {
            *entry = now;
        }
    }

    pub async fn ping_snapshot(&self) -> HashMap<String, u64> {
        self.ping_record.lock().await.clone()
    }
}

/// Scan a status dump for the given peer's section and report whether it
/// shows a completed handshake.
fn peer_established(dump: &str, public_key_hex: &str) -> bool {
    let mut in_section = false;
    for line in dump.lines() {
        if let Some(value) = line.strip_prefix("public_key=") {
            in_section = value == public_key_hex;
            continue;
        }
        if in_section && line.starts_with("last_handshake_time_sec=") {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn established_requires_handshake_line() {
        let dump = "private_key=aa\npublic_key=bb\nendpoint=1.2.3.4:51820\nrx_bytes=0\ntx_bytes=0\n";
        assert!(!peer_established(dump, "bb"));

        let dump = "public_key=bb\nlast_handshake_time_sec=1700000000\nrx_bytes=10\n";
        assert!(peer_established(dump, "bb"));
    }

    #[test]
    fn established_matches_only_named_peer() {
        let dump = "public_key=aa\nlast_handshake_time_sec=1\npublic_key=bb\nrx_bytes=0\n";
        assert!(peer_established(dump, "aa"));
        assert!(!peer_established(dump, "bb"));
    }

    #[tokio::test]
    async fn pong_record_is_monotonic() {
        let conf = DeviceConfig {
            secret_key: [1u8; 32],
            listen_port: None,
            endpoint_addrs: vec!["10.5.0.2".parse().unwrap()],
            // Tunneled resolver mode keeps the test off the host's
            // resolver configuration.
            dns: vec!["10.5.0.53".parse().unwrap()],
            mtu: 1420,
            peers: vec![],
            check_alive: vec!["10.0.0.1".parse().unwrap()],
            check_alive_interval: 5,
        };
        let stack = Stack::new(&conf.endpoint_addrs, conf.mtu).unwrap();
        let resolver = NameResolver::new(stack.clone(), &conf.dns).unwrap();
        let mut ping_record = HashMap::new();
        for addr in &conf.check_alive {
            ping_record.insert(addr.to_string(), 0);
        }
        let vt = VirtualTun {
            device: WgDevice::new(stack.clone(), None, conf.mtu).unwrap(),
            stack,
            conf,
            resolver,
            ping_record: Mutex::new(ping_record),
        };

        let target: IpAddr = "10.0.0.1".parse().unwrap();
        let snapshot = vt.ping_snapshot().await;
        assert_eq!(snapshot.get("10.0.0.1"), Some(&0));

        vt.record_pong(target).await;
        let first = *vt.ping_snapshot().await.get("10.0.0.1").unwrap();
        assert!(first > 0);

        vt.record_pong(target).await;
        let second = *vt.ping_snapshot().await.get("10.0.0.1").unwrap();
        assert!(second >= first);
    }
}
