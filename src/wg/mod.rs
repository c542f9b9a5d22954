//! WireGuard engine.
//!
//! Wraps one boringtun `Tunn` per peer and pumps packets between the
//! virtual stack's TUN-like device and the real UDP endpoint socket. The
//! engine is configured through the uapi-style text channel ([`uapi`]):
//! `ipc_set` applies a serialized device configuration, `ipc_get` dumps
//! runtime status in the same shape for the health surface.

pub mod uapi;

use std::collections::HashMap;
use std::fmt::Write as _;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD as BASE64_STD;
use base64::Engine as _;
use boringtun::noise::{Tunn, TunnResult};
use boringtun::x25519::{PublicKey, StaticSecret};
use ipnet::IpNet;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

use crate::common::Error;
use crate::stack::StackHandle;

use uapi::{IpcPeer, IpcSetRequest};

/// Timer resolution for handshake retries and keepalives.
const TIMER_INTERVAL: Duration = Duration::from_millis(100);

struct PeerState {
    tunn: Tunn,
    endpoint: Option<SocketAddr>,
    config: IpcPeer,
}

impl PeerState {
    /// Abbreviated public key for log lines, wireguard-go style.
    fn short_id(&self) -> String {
        let b64 = BASE64_STD.encode(self.config.public_key);
        if b64.len() >= 8 {
            format!("({}…{})", &b64[..4], &b64[b64.len() - 4..])
        } else {
            format!("({})", b64)
        }
    }
}

#[derive(Default)]
struct PeerTable {
    peers: Vec<PeerState>,
    by_endpoint: HashMap<SocketAddr, usize>,
    /// (allowed network, peer index), searched by longest prefix.
    allowed_ips: Vec<(IpNet, usize)>,
    private_key: Option<[u8; 32]>,
    listen_port: Option<u16>,
}

impl PeerTable {
    /// Longest-prefix match over every peer's allowed networks.
    fn peer_for(&self, target: IpAddr) -> Option<usize> {
        let mut best: Option<(usize, u8)> = None;
        for (net, idx) in &self.allowed_ips {
            if net.contains(&target) {
                let prefix = net.prefix_len();
                if best.map_or(true, |(_, len)| prefix > len) {
                    best = Some((*idx, prefix));
                }
            }
        }
        best.map(|(idx, _)| idx)
    }
}

/// The engine handle shared by the runtime and the pump tasks.
#[derive(Clone)]
pub struct WgDevice {
    inner: Arc<Inner>,
}

struct Inner {
    stack: StackHandle,
    table: Mutex<PeerTable>,
    udp: Arc<UdpSocket>,
    started: AtomicBool,
    mtu: usize,
}

impl WgDevice {
    /// Create the engine on top of a virtual stack, binding the endpoint
    /// UDP socket (dual-stack, ephemeral unless `listen_port` is given).
    pub fn new(
        stack: StackHandle,
        listen_port: Option<u16>,
        mtu: usize,
    ) -> Result<Self, Error> {
        let udp = bind_udp_socket(listen_port)
            .map_err(|e| Error::Listen(format!("bind wireguard udp socket: {}", e)))?;
        Ok(Self {
            inner: Arc::new(Inner {
                stack,
                table: Mutex::new(PeerTable::default()),
                udp: Arc::new(udp),
                started: AtomicBool::new(false),
                mtu,
            }),
        })
    }

    /// Apply a uapi set-request: build one `Tunn` per peer.
    pub async fn ipc_set(&self, request: &str) -> Result<(), Error> {
        let parsed = IpcSetRequest::parse(request)?;

        let mut table = PeerTable {
            private_key: Some(parsed.private_key),
            listen_port: parsed.listen_port,
            ..Default::default()
        };

        let private_key = StaticSecret::from(parsed.private_key);
        for (idx, peer) in parsed.peers.iter().enumerate() {
            let preshared = if peer.preshared_key == [0u8; 32] {
                None
            } else {
                Some(peer.preshared_key)
            };
            let keepalive = if peer.keep_alive == 0 {
                None
            } else {
                Some(peer.keep_alive)
            };
            let index: u32 = rand::random();
            let tunn = Tunn::new(
                private_key.clone(),
                PublicKey::from(peer.public_key),
                preshared,
                keepalive,
                index,
                None,
            )
            .map_err(|e| Error::Config(format!("wireguard peer setup: {}", e)))?;

            for net in &peer.allowed_ips {
                table.allowed_ips.push((*net, idx));
            }
            if let Some(endpoint) = peer.endpoint {
                table.by_endpoint.insert(endpoint, idx);
            }
            table.peers.push(PeerState {
                tunn,
                endpoint: peer.endpoint,
                config: peer.clone(),
            });
        }

        *self.inner.table.lock().await = table;
        Ok(())
    }

    /// Bring the device up: spawn the pump loops and initiate handshakes
    /// toward every peer with a configured endpoint.
    pub async fn up(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }

        self.initiate_handshakes().await;

        let device = self.clone();
        tokio::spawn(async move { device.poll_loop().await });

        let device = self.clone();
        tokio::spawn(async move { device.udp_loop().await });

        let device = self.clone();
        tokio::spawn(async move { device.timer_loop().await });
    }

    /// Status dump in uapi shape. Key material is emitted as configured;
    /// the health surface redacts it before serving.
    pub async fn ipc_get(&self) -> String {
        let mut table = self.inner.table.lock().await;
        let mut out = String::new();

        if let Some(private_key) = table.private_key {
            let _ = writeln!(out, "private_key={}", hex::encode(private_key));
        }
        if let Some(port) = table.listen_port {
            let _ = writeln!(out, "listen_port={}", port);
        }

        for peer in &mut table.peers {
            let _ = writeln!(out, "public_key={}", hex::encode(peer.config.public_key));
            if peer.config.preshared_key != [0u8; 32] {
                let _ = writeln!(
                    out,
                    "preshared_key={}",
                    hex::encode(peer.config.preshared_key)
                );
            }
            if peer.config.keep_alive != 0 {
                let _ = writeln!(
                    out,
                    "persistent_keepalive_interval={}",
                    peer.config.keep_alive
                );
            }
            if let Some(endpoint) = peer.endpoint {
                let _ = writeln!(out, "endpoint={}", endpoint);
            }
            for net in &peer.config.allowed_ips {
                let _ = writeln!(out, "allowed_ip={}", net);
            }
            let (last_handshake, tx_bytes, rx_bytes, _, _) = peer.tunn.stats();
            if let Some(since) = last_handshake {
                if let Some(when) = SystemTime::now().checked_sub(since) {
                    if let Ok(delta) = when.duration_since(UNIX_EPOCH) {
                        let _ = writeln!(out, "last_handshake_time_sec={}", delta.as_secs());
                        let _ =
                            writeln!(out, "last_handshake_time_nsec={}", delta.subsec_nanos());
                    }
                }
            }
            let _ = writeln!(out, "rx_bytes={}", rx_bytes);
            let _ = writeln!(out, "tx_bytes={}", tx_bytes);
        }

        out
    }

    async fn initiate_handshakes(&self) {
        let datagrams = {
            let mut table = self.inner.table.lock().await;
            let mut datagrams = Vec::new();
            for peer in &mut table.peers {
                let Some(endpoint) = peer.endpoint else {
                    continue;
                };
                let mut buf = vec![0u8; 256];
                if let TunnResult::WriteToNetwork(packet) =
                    peer.tunn.format_handshake_initiation(&mut buf, false)
                {
                    debug!("peer{} - sending handshake initiation", peer.short_id());
                    datagrams.push((endpoint, packet.to_vec()));
                }
            }
            datagrams
        };
        self.send_datagrams(datagrams).await;
    }

    /// Drive the stack and encrypt whatever it emits.
    async fn poll_loop(&self) {
        loop {
            let (frames, did_work, delay) = {
                let mut state = self.inner.stack.lock().await;
                let did_work = state.poll();
                let frames = state.drain_outbound();
                let delay = state.poll_delay();
                (frames, did_work, delay)
            };

            if did_work {
                self.inner.stack.kick();
            }

            if !frames.is_empty() {
                self.send_frames(frames).await;
            }

            let sleep_duration = delay
                .filter(|d| *d > Duration::ZERO)
                .unwrap_or(Duration::from_millis(1));

            tokio::select! {
                biased;
                _ = self.inner.stack.parked() => {}
                _ = tokio::time::sleep(sleep_duration) => {}
            }
        }
    }

    /// Decrypt datagrams from the endpoint socket into the stack.
    async fn udp_loop(&self) {
        let udp = self.inner.udp.clone();
        let mut buffer = vec![0u8; 65535];
        loop {
            let (len, src) = match udp.recv_from(&mut buffer).await {
                Ok(result) => result,
                Err(e) => {
                    error!(error = %e, "wireguard udp recv error");
                    continue;
                }
            };
            // The dual-stack socket reports IPv4 peers in mapped form.
            let src = unmap_v4(src);
            self.handle_incoming(src, &buffer[..len]).await;
        }
    }

    async fn timer_loop(&self) {
        loop {
            let datagrams = {
                let mut table = self.inner.table.lock().await;
                let mut datagrams = Vec::new();
                for peer in &mut table.peers {
                    let Some(endpoint) = peer.endpoint else {
                        continue;
                    };
                    let mut buf = vec![0u8; 256];
                    match peer.tunn.update_timers(&mut buf) {
                        TunnResult::WriteToNetwork(packet) => {
                            datagrams.push((endpoint, packet.to_vec()));
                        }
                        TunnResult::Err(e) => {
                            warn!("peer{} - timer error: {:?}", peer.short_id(), e);
                        }
                        _ => {}
                    }
                }
                datagrams
            };

            self.send_datagrams(datagrams).await;
            tokio::time::sleep(TIMER_INTERVAL).await;
        }
    }

    async fn send_frames(&self, frames: Vec<Vec<u8>>) {
        let datagrams = {
            let mut table = self.inner.table.lock().await;
            let mut datagrams = Vec::new();

            for frame in frames {
                let Some(dst) = dst_ip(&frame) else {
                    warn!("dropping outbound packet without destination");
                    continue;
                };
                let Some(peer_idx) = table.peer_for(dst) else {
                    warn!(dst = %dst, "no peer for destination");
                    continue;
                };
                let peer = &mut table.peers[peer_idx];
                let Some(endpoint) = peer.endpoint else {
                    warn!("peer{} - no endpoint for outbound packet", peer.short_id());
                    continue;
                };
                let mut buf = vec![0u8; wg_buffer_size(frame.len())];
                match peer.tunn.encapsulate(&frame, &mut buf) {
                    TunnResult::WriteToNetwork(packet) => {
                        datagrams.push((endpoint, packet.to_vec()));
                    }
                    TunnResult::Err(e) => {
                        warn!("peer{} - encapsulate error: {:?}", peer.short_id(), e);
                    }
                    _ => {}
                }
            }
            datagrams
        };

        self.send_datagrams(datagrams).await;
    }

    async fn handle_incoming(&self, src: SocketAddr, data: &[u8]) {
        let (datagrams, inbound) = {
            let mut table = self.inner.table.lock().await;
            let mut datagrams = Vec::new();
            let mut inbound = Vec::new();
            let mut out_buf = vec![0u8; wg_buffer_size(self.inner.mtu)];

            if let Some(idx) = table.by_endpoint.get(&src).copied() {
                let peer = &mut table.peers[idx];
                process_datagram(peer, src, data, &mut out_buf, &mut datagrams, &mut inbound);
            } else {
                // Roaming peer: let each tunnel try; the one that accepts
                // the datagram learns the new endpoint.
                let mut learned: Option<usize> = None;
                for (idx, peer) in table.peers.iter_mut().enumerate() {
                    if process_datagram(peer, src, data, &mut out_buf, &mut datagrams, &mut inbound)
                    {
                        peer.endpoint = Some(src);
                        learned = Some(idx);
                        break;
                    }
                }
                if let Some(idx) = learned {
                    table.by_endpoint.insert(src, idx);
                }
            }

            (datagrams, inbound)
        };

        if !inbound.is_empty() {
            let mut state = self.inner.stack.lock().await;
            for packet in inbound {
                state.push_inbound(packet);
            }
        }
        self.send_datagrams(datagrams).await;
        self.inner.stack.kick();
    }

    async fn send_datagrams(&self, datagrams: Vec<(SocketAddr, Vec<u8>)>) {
        for (endpoint, packet) in datagrams {
            // The endpoint socket is v6-bound; IPv4 destinations go out in
            // mapped form.
            let endpoint = map_v4(endpoint);
            if let Err(e) = self.inner.udp.send_to(&packet, endpoint).await {
                error!(endpoint = %endpoint, error = %e, "wireguard udp send failed");
            }
        }
    }
}

/// Run one datagram through a peer's tunnel. Returns true when the peer
/// accepted it.
fn process_datagram(
    peer: &mut PeerState,
    src: SocketAddr,
    data: &[u8],
    out_buf: &mut [u8],
    datagrams: &mut Vec<(SocketAddr, Vec<u8>)>,
    inbound: &mut Vec<Vec<u8>>,
) -> bool {
    let mut handled = false;
    let reply_to = peer.endpoint.unwrap_or(src);
    let mut result = peer.tunn.decapsulate(Some(src.ip()), data, out_buf);
    loop {
        match result {
            TunnResult::WriteToNetwork(packet) => {
                datagrams.push((reply_to, packet.to_vec()));
                handled = true;
                // Flush whatever else the tunnel queued.
                result = peer.tunn.decapsulate(Some(src.ip()), &[], out_buf);
            }
            TunnResult::WriteToTunnelV4(packet, _) | TunnResult::WriteToTunnelV6(packet, _) => {
                inbound.push(packet.to_vec());
                handled = true;
                break;
            }
            TunnResult::Done => {
                handled = true;
                break;
            }
            TunnResult::Err(e) => {
                debug!("peer{} - decapsulate error: {:?}", peer.short_id(), e);
                break;
            }
        }
    }
    handled
}

fn bind_udp_socket(listen_port: Option<u16>) -> std::io::Result<UdpSocket> {
    let port = listen_port.unwrap_or(0);
    let socket = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_only_v6(false)?;
    socket.bind(&SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port).into())?;
    socket.set_nonblocking(true)?;
    UdpSocket::from_std(socket.into())
}

/// Room for the wireguard envelope; handshake messages need 148 bytes.
fn wg_buffer_size(payload_len: usize) -> usize {
    (payload_len + 32).max(148)
}

fn unmap_v4(addr: SocketAddr) -> SocketAddr {
    match addr.ip() {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => SocketAddr::new(IpAddr::V4(v4), addr.port()),
            None => addr,
        },
        IpAddr::V4(_) => addr,
    }
}

fn map_v4(addr: SocketAddr) -> SocketAddr {
    match addr.ip() {
        IpAddr::V4(v4) => SocketAddr::new(IpAddr::V6(v4.to_ipv6_mapped()), addr.port()),
        IpAddr::V6(_) => addr,
    }
}

fn dst_ip(packet: &[u8]) -> Option<IpAddr> {
    let version = packet.first()? >> 4;
    match version {
        4 if packet.len() >= 20 => {
            let octets: [u8; 4] = packet[16..20].try_into().ok()?;
            Some(IpAddr::V4(Ipv4Addr::from(octets)))
        }
        6 if packet.len() >= 40 => {
            let octets: [u8; 16] = packet[24..40].try_into().ok()?;
            Some(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        _ => None,
    }
}
