use std::net::{IpAddr, SocketAddr, ToSocketAddrs};

use base64::engine::general_purpose::STANDARD as BASE64_STD;
use base64::Engine;
use ipnet::IpNet;

use crate::common::Error;

use super::parser::IniSection;

/// Default interface MTU, matching wg-quick.
pub const DEFAULT_MTU: usize = 1420;
/// Default liveness probe interval in seconds.
pub const DEFAULT_CHECK_ALIVE_INTERVAL: u64 = 5;

/// Validated device-level configuration. Immutable after startup.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub secret_key: [u8; 32],
    pub listen_port: Option<u16>,
    /// Assigned virtual interface addresses (the `Address` key, list form).
    pub endpoint_addrs: Vec<IpAddr>,
    pub dns: Vec<IpAddr>,
    pub mtu: usize,
    pub peers: Vec<PeerConfig>,
    pub check_alive: Vec<IpAddr>,
    pub check_alive_interval: u64,
}

#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub public_key: [u8; 32],
    /// All-zero when the config did not carry one.
    pub preshared_key: [u8; 32],
    /// Resolved exactly once at config time.
    pub endpoint: Option<SocketAddr>,
    pub keep_alive: u16,
    /// Empty means the engine defaults of 0.0.0.0/0 and ::/0 apply.
    pub allowed_ips: Vec<IpNet>,
}

/// One configured proxy routine.
#[derive(Debug, Clone)]
pub enum RoutineSpec {
    Socks5 {
        bind: SocketAddr,
        username: Option<String>,
        password: Option<String>,
    },
    Http {
        bind: SocketAddr,
        username: Option<String>,
        password: Option<String>,
        cert_file: Option<String>,
        key_file: Option<String>,
    },
    TcpClient {
        bind: SocketAddr,
        target: String,
    },
    TcpServer {
        listen_port: u16,
        target: String,
    },
    UdpProxy {
        bind: SocketAddr,
        target: String,
        inactivity_secs: u64,
    },
    Stdio {
        target: String,
    },
}

impl RoutineSpec {
    pub fn kind(&self) -> &'static str {
        match self {
            RoutineSpec::Socks5 { .. } => "socks5",
            RoutineSpec::Http { .. } => "http",
            RoutineSpec::TcpClient { .. } => "tcp-client",
            RoutineSpec::TcpServer { .. } => "tcp-server",
            RoutineSpec::UdpProxy { .. } => "udp-proxy",
            RoutineSpec::Stdio { .. } => "stdio",
        }
    }
}

/// Decode a base64 WireGuard key into its 32-byte form.
pub fn decode_key(value: &str) -> Result<[u8; 32], Error> {
    let decoded = BASE64_STD
        .decode(value.trim())
        .map_err(|_| Error::InvalidKey(format!("invalid base64 string: {}", value)))?;
    let bytes: [u8; 32] = decoded
        .try_into()
        .map_err(|_| Error::InvalidKey(format!("key should be 32 bytes: {}", value)))?;
    Ok(bytes)
}

pub(super) fn required<'a>(section: &'a IniSection, key: &str) -> Result<&'a str, Error> {
    section
        .get(key)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| Error::Config(format!("{} should not be empty", key)))
}

pub(super) fn parse_port(value: &str) -> Result<u16, Error> {
    let port: u32 = value
        .parse()
        .map_err(|_| Error::Config(format!("port must be numeric: {}", value)))?;
    if port > 65535 {
        return Err(Error::Config(format!(
            "port should be >= 0 and <= 65535: {}",
            value
        )));
    }
    Ok(port as u16)
}

pub(super) fn parse_bind_addr(value: &str) -> Result<SocketAddr, Error> {
    value
        .parse()
        .map_err(|_| Error::Config(format!("invalid bind address: {}", value)))
}

/// Resolve a `host:port` endpoint to an IP literal, once, at config time.
pub(super) fn resolve_endpoint(value: &str) -> Result<SocketAddr, Error> {
    value
        .to_socket_addrs()
        .map_err(|e| Error::Config(format!("cannot resolve endpoint {}: {}", value, e)))?
        .next()
        .ok_or_else(|| Error::Config(format!("cannot resolve endpoint {}", value)))
}

/// Comma-separated IP list, each entry optionally in CIDR form; only the
/// address part is kept.
pub(super) fn parse_addr_list(value: &str) -> Result<Vec<IpAddr>, Error> {
    let mut addrs = Vec::new();
    for item in value.split(',') {
        let item = item.trim();
        if item.is_empty() {
            continue;
        }
        let host = item.split('/').next().unwrap_or(item);
        let addr: IpAddr = host
            .parse()
            .map_err(|_| Error::Config(format!("invalid address: {}", item)))?;
        addrs.push(addr);
    }
    Ok(addrs)
}

pub(super) fn parse_cidr_list(value: &str) -> Result<Vec<IpNet>, Error> {
    let mut nets = Vec::new();
    for item in value.split(',') {
        let item = item.trim();
        if item.is_empty() {
            continue;
        }
        let net: IpNet = if item.contains('/') {
            item.parse()
                .map_err(|_| Error::Config(format!("invalid CIDR: {}", item)))?
        } else {
            let addr: IpAddr = item
                .parse()
                .map_err(|_| Error::Config(format!("invalid CIDR: {}", item)))?;
            IpNet::from(addr)
        };
        nets.push(net);
    }
    Ok(nets)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_key_roundtrip() {
        // hex(base64_decode(base64(v))) == hex(v) for any 32-byte value
        for seed in 0u8..8 {
            let v: [u8; 32] = std::array::from_fn(|i| seed.wrapping_mul(31).wrapping_add(i as u8));
            let b64 = BASE64_STD.encode(v);
            assert_eq!(decode_key(&b64).unwrap(), v);
        }
    }

    #[test]
    fn decode_key_wrong_length() {
        let b64 = BASE64_STD.encode([0u8; 31]);
        assert!(matches!(decode_key(&b64), Err(Error::InvalidKey(_))));
        let b64 = BASE64_STD.encode([0u8; 33]);
        assert!(matches!(decode_key(&b64), Err(Error::InvalidKey(_))));
    }

    #[test]
    fn decode_key_bad_alphabet() {
        assert!(matches!(
            decode_key("not!!valid@@base64"),
            Err(Error::InvalidKey(_))
        ));
    }

    #[test]
    fn port_range_accepted() {
        assert_eq!(parse_port("0").unwrap(), 0);
        assert_eq!(parse_port("65535").unwrap(), 65535);
        assert!(parse_port("65536").is_err());
        assert!(parse_port("-1").is_err());
        assert!(parse_port("http").is_err());
    }

    #[test]
    fn addr_list_strips_cidr() {
        let addrs = parse_addr_list("10.5.0.2/32, 2001:db8::2/128").unwrap();
        assert_eq!(addrs.len(), 2);
        assert_eq!(addrs[0], "10.5.0.2".parse::<IpAddr>().unwrap());
        assert_eq!(addrs[1], "2001:db8::2".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn cidr_list_accepts_bare_addresses() {
        let nets = parse_cidr_list("0.0.0.0/0, ::/0, 10.0.0.1").unwrap();
        assert_eq!(nets.len(), 3);
        assert_eq!(nets[2].prefix_len(), 32);
    }
}
