//! SOCKS5 server (RFC 1928, RFC 1929) dialing through the tunnel.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use bytes::{BufMut, BytesMut};
use subtle::ConstantTimeEq;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use crate::common::{Address, Error};
use crate::stack::udp::VirtUdpSocket;
use crate::tun::VirtualTun;

use super::relay::{socks_pool, splice};

const SOCKS_VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_USER_PASS: u8 = 0x02;
const METHOD_NO_ACCEPTABLE: u8 = 0xFF;

const CMD_CONNECT: u8 = 0x01;
const CMD_BIND: u8 = 0x02;
const CMD_UDP_ASSOCIATE: u8 = 0x03;

const REP_SUCCESS: u8 = 0x00;
const REP_HOST_UNREACHABLE: u8 = 0x04;
const REP_COMMAND_NOT_SUPPORTED: u8 = 0x07;

/// 用户名/密码凭据，常数时间比较
pub struct CredentialValidator {
    username: String,
    password: String,
}

impl CredentialValidator {
    pub fn new(username: String, password: String) -> Self {
        Self { username, password }
    }

    /// Compare both fields in constant time; the results are combined with
    /// a bitwise AND so the comparison never short-circuits.
    pub fn valid(&self, username: &str, password: &str) -> bool {
        let u = self.username.as_bytes().ct_eq(username.as_bytes());
        let p = self.password.as_bytes().ct_eq(password.as_bytes());
        bool::from(u & p)
    }
}

struct NatEntry {
    vt_socket: VirtUdpSocket,
    mapped_port: u16,
    client: SocketAddr,
}

#[derive(Default)]
struct UdpNat {
    by_src: HashMap<String, Arc<NatEntry>>,
    mapped_ports: HashMap<u16, String>,
}

pub struct Socks5Server {
    bind: SocketAddr,
    auth: Option<CredentialValidator>,
}

impl Socks5Server {
    pub fn new(bind: SocketAddr, username: Option<String>, password: Option<String>) -> Self {
        let auth = match username {
            Some(user) if !user.is_empty() => Some(CredentialValidator::new(
                user,
                password.unwrap_or_default(),
            )),
            _ => None,
        };
        Self { bind, auth }
    }

    pub async fn run(self, vt: Arc<VirtualTun>) -> Result<()> {
        let listener = TcpListener::bind(self.bind)
            .await
            .with_context(|| format!("socks5 listen on {}", self.bind))?;
        let udp = Arc::new(
            UdpSocket::bind(self.bind)
                .await
                .with_context(|| format!("socks5 udp relay on {}", self.bind))?,
        );
        info!(addr = %self.bind, "socks5 proxy listening");

        let nat: Arc<Mutex<UdpNat>> = Arc::new(Mutex::new(UdpNat::default()));

        // Shared client→tunnel datagram loop for all associations.
        {
            let udp = udp.clone();
            let nat = nat.clone();
            let vt = vt.clone();
            tokio::spawn(async move {
                udp_relay_loop(udp, nat, vt).await;
            });
        }

        let server = Arc::new(self);
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    error!(error = %e, "socks5 accept failed");
                    continue;
                }
            };
            let vt = vt.clone();
            let server = server.clone();
            let udp = udp.clone();
            let nat = nat.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle_conn(stream, peer, vt, udp, nat).await {
                    error!(peer = %peer, error = %e, "socks5 connection failed");
                }
            });
        }
    }

    async fn handle_conn(
        &self,
        mut stream: TcpStream,
        peer: SocketAddr,
        vt: Arc<VirtualTun>,
        udp: Arc<UdpSocket>,
        nat: Arc<Mutex<UdpNat>>,
    ) -> Result<()> {
        negotiate(&mut stream, &self.auth).await?;
        let (cmd, target, atyp) = read_request(&mut stream).await?;

        match cmd {
            CMD_CONNECT => {
                let addr = match resolve_target(&vt, &target).await {
                    Ok(addr) => addr,
                    Err(e) => {
                        write_reply_unreachable(&mut stream, atyp).await?;
                        bail!("cannot resolve {}: {}", target, e);
                    }
                };
                let remote = match vt.dial_tcp(addr).await {
                    Ok(remote) => remote,
                    Err(e) => {
                        write_reply_unreachable(&mut stream, atyp).await?;
                        bail!("cannot dial {}: {}", addr, e);
                    }
                };

                let bound = remote
                    .local_addr()
                    .await
                    .unwrap_or_else(|| "0.0.0.0:0".parse().expect("static addr"));
                write_reply(&mut stream, REP_SUCCESS, &Address::Ip(bound)).await?;

                debug!(peer = %peer, target = %target, "socks5 CONNECT established");
                splice(stream, remote, socks_pool()).await;
                Ok(())
            }
            CMD_UDP_ASSOCIATE => {
                self.handle_udp_associate(stream, peer, target, vt, udp, nat)
                    .await
            }
            CMD_BIND => {
                write_reply(
                    &mut stream,
                    REP_COMMAND_NOT_SUPPORTED,
                    &Address::Ip("0.0.0.0:0".parse().expect("static addr")),
                )
                .await?;
                bail!("BIND is not supported");
            }
            other => {
                write_reply(
                    &mut stream,
                    REP_COMMAND_NOT_SUPPORTED,
                    &Address::Ip("0.0.0.0:0".parse().expect("static addr")),
                )
                .await?;
                bail!("unsupported SOCKS5 command: 0x{:02x}", other);
            }
        }
    }

    /// Allocate a per-client NAT entry: a tunnel-side UDP listener on a
    /// mapped port chosen by scanning upward from the client's advertised
    /// one. The entry lives until the TCP control channel closes.
    async fn handle_udp_associate(
        &self,
        mut stream: TcpStream,
        peer: SocketAddr,
        advertised: Address,
        vt: Arc<VirtualTun>,
        udp: Arc<UdpSocket>,
        nat: Arc<Mutex<UdpNat>>,
    ) -> Result<()> {
        // Clients that do not yet know their source advertise a zero
        // address; fall back to the control channel's peer IP.
        let client = match &advertised {
            Address::Ip(addr) if !addr.ip().is_unspecified() => *addr,
            Address::Ip(addr) => SocketAddr::new(peer.ip(), addr.port()),
            Address::Domain(_, port) => SocketAddr::new(peer.ip(), *port),
        };
        let src_key = client.to_string();

        let entry = {
            let mut table = nat.lock().await;
            let mut mapped_port = if client.port() != 0 {
                client.port()
            } else {
                49152
            };
            let mut tries = 0u32;
            let vt_socket = loop {
                tries += 1;
                if tries > 65535 {
                    return Err(Error::NatFull.into());
                }
                if mapped_port != 0 && !table.mapped_ports.contains_key(&mapped_port) {
                    match vt.listen_udp(mapped_port).await {
                        Ok(socket) => break socket,
                        Err(_) => {}
                    }
                }
                mapped_port = mapped_port.wrapping_add(1);
            };

            let entry = Arc::new(NatEntry {
                vt_socket,
                mapped_port,
                client,
            });
            table.mapped_ports.insert(mapped_port, src_key.clone());
            table.by_src.insert(src_key.clone(), entry.clone());
            entry
        };

        info!(client = %client, mapped_port = entry.mapped_port, "socks5 udp associate");

        // Tunnel → client: wrap replies into SOCKS5 UDP datagrams.
        {
            let entry = entry.clone();
            let udp = udp.clone();
            tokio::spawn(async move {
                let mut buf = vec![0u8; 64 * 1024];
                loop {
                    let (n, from) = match entry.vt_socket.recv_from(&mut buf).await {
                        Ok(pair) => pair,
                        Err(_) => break,
                    };
                    let mut datagram = BytesMut::with_capacity(n + 22);
                    datagram.put_slice(&[0x00, 0x00, 0x00]);
                    Address::Ip(from).encode_socks5(&mut datagram);
                    datagram.put_slice(&buf[..n]);
                    if udp.send_to(&datagram, entry.client).await.is_err() {
                        break;
                    }
                }
            });
        }

        // Reply with the relay address the client should send datagrams to.
        let relay_addr = udp.local_addr().unwrap_or(self.bind);
        write_reply(&mut stream, REP_SUCCESS, &Address::Ip(relay_addr)).await?;

        // Hold the association open until the control channel closes.
        let mut sink = [0u8; 512];
        loop {
            match stream.read(&mut sink).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
        }

        let mut table = nat.lock().await;
        table.mapped_ports.remove(&entry.mapped_port);
        table.by_src.remove(&src_key);
        entry.vt_socket.close().await;
        debug!(client = %client, "socks5 udp associate closed");
        Ok(())
    }
}

/// Client → tunnel direction, shared across every association on this
/// server.
async fn udp_relay_loop(udp: Arc<UdpSocket>, nat: Arc<Mutex<UdpNat>>, vt: Arc<VirtualTun>) {
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let (n, src) = match udp.recv_from(&mut buf).await {
            Ok(pair) => pair,
            Err(e) => {
                error!(error = %e, "socks5 udp relay read failed");
                continue;
            }
        };

        let entry = {
            let table = nat.lock().await;
            table.by_src.get(&src.to_string()).cloned()
        };
        let Some(entry) = entry else {
            debug!(src = %src, "udp datagram from unassociated source");
            continue;
        };

        // [RSV:2][FRAG:1][ATYP][DST.ADDR][DST.PORT][DATA]
        if n < 4 || buf[2] != 0 {
            continue;
        }
        let (dest, consumed) = match Address::parse_socks5_udp_addr(&buf[3..n]) {
            Ok(parsed) => parsed,
            Err(e) => {
                debug!(src = %src, error = %e, "malformed SOCKS5 datagram");
                continue;
            }
        };
        let payload = &buf[3 + consumed..n];

        let addr = match resolve_target(&vt, &dest).await {
            Ok(addr) => addr,
            Err(e) => {
                debug!(dest = %dest, error = %e, "cannot resolve datagram destination");
                continue;
            }
        };
        if let Err(e) = entry.vt_socket.send_to(payload, addr).await {
            debug!(dest = %addr, error = %e, "udp forward failed");
        }
    }
}

async fn resolve_target(vt: &VirtualTun, target: &Address) -> Result<SocketAddr, Error> {
    match target {
        Address::Ip(addr) => Ok(*addr),
        Address::Domain(host, port) => vt.resolve_to_addr_port(host, *port).await,
    }
}

/// Method selection plus the optional username/password subnegotiation.
async fn negotiate<S>(stream: &mut S, auth: &Option<CredentialValidator>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    let ver = read_u8(stream).await?;
    if ver != SOCKS_VERSION {
        bail!("unsupported SOCKS version: 0x{:02x}", ver);
    }

    let nmethods = read_u8(stream).await? as usize;
    let mut methods = vec![0u8; nmethods];
    stream.read_exact(&mut methods).await?;

    match auth {
        Some(validator) => {
            // Only username/password is offered when credentials are set.
            if !methods.contains(&METHOD_USER_PASS) {
                stream
                    .write_all(&[SOCKS_VERSION, METHOD_NO_ACCEPTABLE])
                    .await?;
                bail!("client does not offer username/password auth");
            }
            stream.write_all(&[SOCKS_VERSION, METHOD_USER_PASS]).await?;

            // RFC 1929 subnegotiation
            let sub_ver = read_u8(stream).await?;
            if sub_ver != 0x01 {
                bail!("unsupported auth subnegotiation version: 0x{:02x}", sub_ver);
            }
            let ulen = read_u8(stream).await? as usize;
            let mut username = vec![0u8; ulen];
            stream.read_exact(&mut username).await?;
            let plen = read_u8(stream).await? as usize;
            let mut password = vec![0u8; plen];
            stream.read_exact(&mut password).await?;

            let username = String::from_utf8_lossy(&username);
            let password = String::from_utf8_lossy(&password);
            if !validator.valid(&username, &password) {
                stream.write_all(&[0x01, 0x01]).await?;
                return Err(Error::Auth(401, "invalid socks5 credentials".into()).into());
            }
            stream.write_all(&[0x01, 0x00]).await?;
        }
        None => {
            if !methods.contains(&METHOD_NO_AUTH) {
                stream
                    .write_all(&[SOCKS_VERSION, METHOD_NO_ACCEPTABLE])
                    .await?;
                bail!("client does not offer no-auth");
            }
            stream.write_all(&[SOCKS_VERSION, METHOD_NO_AUTH]).await?;
        }
    }
    Ok(())
}

/// Read the request; returns (cmd, target, atyp).
async fn read_request<S>(stream: &mut S) -> Result<(u8, Address, u8)>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    let ver = read_u8(stream).await?;
    if ver != SOCKS_VERSION {
        bail!("invalid SOCKS5 request version: 0x{:02x}", ver);
    }
    let cmd = read_u8(stream).await?;
    let _rsv = read_u8(stream).await?;
    let atyp = read_u8(stream).await?;

    let target = match atyp {
        0x01 => {
            let mut addr = [0u8; 4];
            stream.read_exact(&mut addr).await?;
            let port = read_u16_be(stream).await?;
            Address::from_socks5(0x01, &addr, port)?
        }
        0x03 => {
            let len = read_u8(stream).await? as usize;
            let mut domain = vec![0u8; len];
            stream.read_exact(&mut domain).await?;
            let port = read_u16_be(stream).await?;
            Address::from_socks5(0x03, &domain, port)?
        }
        0x04 => {
            let mut addr = [0u8; 16];
            stream.read_exact(&mut addr).await?;
            let port = read_u16_be(stream).await?;
            Address::from_socks5(0x04, &addr, port)?
        }
        _ => {
            stream
                .write_all(&[SOCKS_VERSION, 0x08, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await?;
            bail!("unsupported SOCKS5 address type: 0x{:02x}", atyp);
        }
    };

    Ok((cmd, target, atyp))
}

async fn write_reply<S>(stream: &mut S, rep: u8, bound: &Address) -> Result<()>
where
    S: AsyncWrite + Send + Unpin,
{
    let mut reply = BytesMut::with_capacity(22);
    reply.put_slice(&[SOCKS_VERSION, rep, 0x00]);
    bound.encode_socks5(&mut reply);
    stream.write_all(&reply).await?;
    Ok(())
}

/// Host-unreachable reply shaped by the request's address family: a zero
/// IPv4 for IPv4/domain requests, a zero IPv6 otherwise.
async fn write_reply_unreachable<S>(stream: &mut S, atyp: u8) -> Result<()>
where
    S: AsyncWrite + Send + Unpin,
{
    let bound = if atyp == 0x04 {
        Address::Ip("[::]:0".parse().expect("static addr"))
    } else {
        Address::Ip("0.0.0.0:0".parse().expect("static addr"))
    };
    write_reply(stream, REP_HOST_UNREACHABLE, &bound).await
}

async fn read_u8<S: AsyncRead + Unpin>(stream: &mut S) -> Result<u8> {
    let mut buf = [0u8; 1];
    stream.read_exact(&mut buf).await?;
    Ok(buf[0])
}

async fn read_u16_be<S: AsyncRead + Unpin>(stream: &mut S) -> Result<u16> {
    let mut buf = [0u8; 2];
    stream.read_exact(&mut buf).await?;
    Ok(u16::from_be_bytes(buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[test]
    fn validator_accepts_exact_match() {
        let v = CredentialValidator::new("user".into(), "pass".into());
        assert!(v.valid("user", "pass"));
    }

    #[test]
    fn validator_rejects_any_single_bit_difference() {
        let v = CredentialValidator::new("user".into(), "pass".into());
        assert!(!v.valid("user", "pasr"));
        assert!(!v.valid("uses", "pass"));
        assert!(!v.valid("user", ""));
        assert!(!v.valid("", "pass"));
        assert!(!v.valid("user", "pass "));
    }

    #[tokio::test]
    async fn negotiate_no_auth() {
        let (mut client, mut server) = duplex(256);
        let task = tokio::spawn(async move { negotiate(&mut server, &None).await });

        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0x00]);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn negotiate_requires_userpass_when_configured() {
        let (mut client, mut server) = duplex(256);
        let auth = Some(CredentialValidator::new("u".into(), "p".into()));
        let task = tokio::spawn(async move { negotiate(&mut server, &auth).await });

        // Client only offers no-auth.
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0xFF]);
        assert!(task.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn negotiate_userpass_accepts_valid_credentials() {
        let (mut client, mut server) = duplex(256);
        let auth = Some(CredentialValidator::new("user".into(), "pass".into()));
        let task = tokio::spawn(async move { negotiate(&mut server, &auth).await });

        client.write_all(&[0x05, 0x01, 0x02]).await.unwrap();
        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0x02]);

        // RFC 1929: VER ULEN user PLEN pass
        client.write_all(&[0x01, 0x04]).await.unwrap();
        client.write_all(b"user").await.unwrap();
        client.write_all(&[0x04]).await.unwrap();
        client.write_all(b"pass").await.unwrap();

        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x01, 0x00]);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn negotiate_userpass_rejects_bad_credentials() {
        let (mut client, mut server) = duplex(256);
        let auth = Some(CredentialValidator::new("user".into(), "pass".into()));
        let task = tokio::spawn(async move { negotiate(&mut server, &auth).await });

        client.write_all(&[0x05, 0x01, 0x02]).await.unwrap();
        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();

        client.write_all(&[0x01, 0x04]).await.unwrap();
        client.write_all(b"user").await.unwrap();
        client.write_all(&[0x04]).await.unwrap();
        client.write_all(b"nope").await.unwrap();

        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x01, 0x01]);
        assert!(task.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn request_parses_domain_connect() {
        let (mut client, mut server) = duplex(256);
        let task = tokio::spawn(async move { read_request(&mut server).await });

        let mut req = vec![0x05, 0x01, 0x00, 0x03, 0x0B];
        req.extend_from_slice(b"example.com");
        req.extend_from_slice(&80u16.to_be_bytes());
        client.write_all(&req).await.unwrap();

        let (cmd, target, atyp) = task.await.unwrap().unwrap();
        assert_eq!(cmd, CMD_CONNECT);
        assert_eq!(atyp, 0x03);
        assert_eq!(target, Address::Domain("example.com".to_string(), 80));
    }

    #[tokio::test]
    async fn unreachable_reply_matches_family() {
        let (mut client, mut server) = duplex(256);
        write_reply_unreachable(&mut server, 0x01).await.unwrap();
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply[..4], &[0x05, 0x04, 0x00, 0x01]);
        assert_eq!(&reply[4..], &[0u8; 6]);

        let (mut client, mut server) = duplex(256);
        write_reply_unreachable(&mut server, 0x04).await.unwrap();
        let mut reply = [0u8; 22];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply[..4], &[0x05, 0x04, 0x00, 0x04]);
        assert_eq!(&reply[4..20], &[0u8; 16]);
    }
}
