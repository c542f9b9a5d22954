use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use anyhow::Result;
use bytes::{BufMut, BytesMut};

/// 代理目标地址
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    Ip(SocketAddr),
    Domain(String, u16),
}

impl Address {
    pub fn port(&self) -> u16 {
        match self {
            Address::Ip(addr) => addr.port(),
            Address::Domain(_, port) => *port,
        }
    }

    pub fn host(&self) -> String {
        match self {
            Address::Ip(addr) => addr.ip().to_string(),
            Address::Domain(domain, _) => domain.clone(),
        }
    }

    /// 解析 "host:port"（IPv6 按 "[..]:port" 处理）
    pub fn parse(s: &str) -> Result<Self> {
        if let Ok(addr) = s.parse::<SocketAddr>() {
            return Ok(Address::Ip(addr));
        }
        let (host, port_str) = s
            .rsplit_once(':')
            .ok_or_else(|| anyhow::anyhow!("invalid address: {}", s))?;
        let port: u16 = port_str
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid port in address: {}", s))?;
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(Address::Ip(SocketAddr::new(ip, port)));
        }
        Ok(Address::Domain(host.to_string(), port))
    }

    /// 编码为 SOCKS5 地址格式 [ATYP][ADDR][PORT]
    pub fn encode_socks5(&self, buf: &mut BytesMut) {
        match self {
            Address::Ip(SocketAddr::V4(addr)) => {
                buf.put_u8(0x01);
                buf.put_slice(&addr.ip().octets());
                buf.put_u16(addr.port());
            }
            Address::Ip(SocketAddr::V6(addr)) => {
                buf.put_u8(0x04);
                buf.put_slice(&addr.ip().octets());
                buf.put_u16(addr.port());
            }
            Address::Domain(domain, port) => {
                buf.put_u8(0x03);
                buf.put_u8(domain.len() as u8);
                buf.put_slice(domain.as_bytes());
                buf.put_u16(*port);
            }
        }
    }

    /// 从 SOCKS5 UDP 数据报头解析地址，返回 (Address, 消耗的字节数)
    pub fn parse_socks5_udp_addr(data: &[u8]) -> Result<(Self, usize)> {
        if data.is_empty() {
            anyhow::bail!("empty data for SOCKS5 address parsing");
        }
        let atyp = data[0];
        match atyp {
            0x01 => {
                if data.len() < 7 {
                    anyhow::bail!("insufficient data for IPv4 SOCKS5 address");
                }
                let ip = Ipv4Addr::new(data[1], data[2], data[3], data[4]);
                let port = u16::from_be_bytes([data[5], data[6]]);
                Ok((Address::Ip(SocketAddr::new(IpAddr::V4(ip), port)), 7))
            }
            0x03 => {
                if data.len() < 2 {
                    anyhow::bail!("insufficient data for domain SOCKS5 address");
                }
                let domain_len = data[1] as usize;
                let total = 2 + domain_len + 2;
                if data.len() < total {
                    anyhow::bail!("insufficient data for domain SOCKS5 address");
                }
                let domain = String::from_utf8(data[2..2 + domain_len].to_vec())?;
                let port = u16::from_be_bytes([data[2 + domain_len], data[3 + domain_len]]);
                Ok((Address::Domain(domain, port), total))
            }
            0x04 => {
                if data.len() < 19 {
                    anyhow::bail!("insufficient data for IPv6 SOCKS5 address");
                }
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&data[1..17]);
                let ip = Ipv6Addr::from(octets);
                let port = u16::from_be_bytes([data[17], data[18]]);
                Ok((Address::Ip(SocketAddr::new(IpAddr::V6(ip), port)), 19))
            }
            _ => anyhow::bail!("unsupported SOCKS5 address type: 0x{:02x}", atyp),
        }
    }

    /// 从 SOCKS5 请求解析
    /// atyp: 0x01=IPv4, 0x03=Domain, 0x04=IPv6
    pub fn from_socks5(atyp: u8, data: &[u8], port: u16) -> Result<Self> {
        match atyp {
            0x01 => {
                if data.len() < 4 {
                    anyhow::bail!("invalid IPv4 address length");
                }
                let ip = Ipv4Addr::new(data[0], data[1], data[2], data[3]);
                Ok(Address::Ip(SocketAddr::new(IpAddr::V4(ip), port)))
            }
            0x03 => {
                let domain = String::from_utf8(data.to_vec())?;
                Ok(Address::Domain(domain, port))
            }
            0x04 => {
                if data.len() < 16 {
                    anyhow::bail!("invalid IPv6 address length");
                }
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&data[..16]);
                let ip = Ipv6Addr::from(octets);
                Ok(Address::Ip(SocketAddr::new(IpAddr::V6(ip), port)))
            }
            _ => anyhow::bail!("unsupported SOCKS5 address type: 0x{:02x}", atyp),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Ip(addr) => write!(f, "{}", addr),
            Address::Domain(domain, port) => write!(f, "{}:{}", domain, port),
        }
    }
}
