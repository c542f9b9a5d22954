//! Shared helpers: an in-process WireGuard pair talking over localhost.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use boringtun::x25519::{PublicKey, StaticSecret};
use openwire::config::types::{DeviceConfig, PeerConfig};
use openwire::tun::VirtualTun;

pub const NODE_A_ADDR: &str = "10.99.0.1";
pub const NODE_B_ADDR: &str = "10.99.0.2";

pub fn keypair() -> (StaticSecret, PublicKey) {
    let secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
    let public = PublicKey::from(&secret);
    (secret, public)
}

/// Reserve two distinct UDP ports on loopback.
pub fn two_udp_ports() -> (u16, u16) {
    let a = std::net::UdpSocket::bind("127.0.0.1:0").expect("bind probe socket");
    let b = std::net::UdpSocket::bind("127.0.0.1:0").expect("bind probe socket");
    let pa = a.local_addr().expect("probe addr").port();
    let pb = b.local_addr().expect("probe addr").port();
    (pa, pb)
}

/// Reserve a TCP port on loopback for a proxy listener.
pub fn free_tcp_port() -> u16 {
    let probe = std::net::TcpListener::bind("127.0.0.1:0").expect("bind probe socket");
    probe.local_addr().expect("probe addr").port()
}

fn node_config(
    secret: &StaticSecret,
    peer_public: &PublicKey,
    addr: &str,
    listen_port: u16,
    peer_port: u16,
) -> DeviceConfig {
    DeviceConfig {
        secret_key: secret.to_bytes(),
        listen_port: Some(listen_port),
        endpoint_addrs: vec![addr.parse().unwrap()],
        // Non-empty so resolution stays on the tunnel path; the tests only
        // dial IP literals.
        dns: vec!["10.99.0.53".parse().unwrap()],
        mtu: 1420,
        peers: vec![PeerConfig {
            public_key: peer_public.to_bytes(),
            preshared_key: [0u8; 32],
            endpoint: Some(SocketAddr::new("127.0.0.1".parse().unwrap(), peer_port)),
            keep_alive: 25,
            allowed_ips: vec!["10.99.0.0/24".parse().unwrap()],
        }],
        check_alive: vec![],
        check_alive_interval: 1,
    }
}

/// Bring up two devices peered with each other and wait for both
/// handshakes.
pub async fn tunnel_pair() -> (Arc<VirtualTun>, Arc<VirtualTun>) {
    tunnel_pair_with(Vec::new()).await
}

/// Same, with liveness targets configured on node A.
pub async fn tunnel_pair_with(
    check_alive: Vec<std::net::IpAddr>,
) -> (Arc<VirtualTun>, Arc<VirtualTun>) {
    let (port_a, port_b) = two_udp_ports();
    let (secret_a, public_a) = keypair();
    let (secret_b, public_b) = keypair();

    let mut conf_a = node_config(&secret_a, &public_b, NODE_A_ADDR, port_a, port_b);
    conf_a.check_alive = check_alive;
    let conf_b = node_config(&secret_b, &public_a, NODE_B_ADDR, port_b, port_a);

    let (a, b) = tokio::join!(VirtualTun::new(conf_a), VirtualTun::new(conf_b));
    (a.expect("node A up"), b.expect("node B up"))
}

/// TCP echo server inside a node's stack. Accepts connections forever.
pub fn spawn_tunnel_tcp_echo(vt: Arc<VirtualTun>, port: u16) {
    tokio::spawn(async move {
        let listener = vt.listen_tcp(port);
        loop {
            let conn = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                loop {
                    let n = match conn.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => n,
                    };
                    if conn.write(&buf[..n]).await.is_err() {
                        break;
                    }
                }
                conn.close().await;
            });
        }
    });
}

/// UDP echo server inside a node's stack. Reports each sender's port on
/// the channel so tests can observe session reuse.
pub fn spawn_tunnel_udp_echo(
    vt: Arc<VirtualTun>,
    port: u16,
) -> tokio::sync::mpsc::UnboundedReceiver<u16> {
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    tokio::spawn(async move {
        let socket = vt.listen_udp(port).await.expect("bind tunnel udp echo");
        let mut buf = vec![0u8; 4096];
        loop {
            let (n, from) = match socket.recv_from(&mut buf).await {
                Ok(pair) => pair,
                Err(_) => break,
            };
            let _ = tx.send(from.port());
            if socket.send_to(&buf[..n], from).await.is_err() {
                break;
            }
        }
    });
    rx
}
