//! Configuration loading.
//!
//! The on-disk format is a wg-quick style INI profile: an `[Interface]`
//! section plus one or more `[Peer]` sections describe the WireGuard device,
//! and any number of routine sections (`[Socks5]`, `[http]`,
//! `[TCPClientTunnel]`, `[TCPServerTunnel]`, `[UDPTunnel]`, `[STDIOTunnel]`)
//! describe the proxy front-ends. A root-level `WGConfig = <path>` key loads
//! the wireguard portion from a separate file.

pub mod parser;
pub mod types;

use std::net::IpAddr;
use std::path::Path;

use crate::common::Error;

use parser::{IniDocument, IniSection};
use types::{
    decode_key, parse_addr_list, parse_bind_addr, parse_cidr_list, parse_port, required,
    resolve_endpoint, DeviceConfig, PeerConfig, RoutineSpec, DEFAULT_CHECK_ALIVE_INTERVAL,
    DEFAULT_MTU,
};

/// Fully parsed configuration: the device plus the routine list.
#[derive(Debug, Clone)]
pub struct Config {
    pub device: DeviceConfig,
    pub routines: Vec<RoutineSpec>,
}

pub fn load_config(path: impl AsRef<Path>) -> Result<Config, Error> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
    let doc = IniDocument::parse(&content)?;

    // The wireguard portion may live in a separate file.
    let device = match doc.root.get("wgconfig") {
        Some(wg_path) => {
            let wg_content = std::fs::read_to_string(wg_path)
                .map_err(|e| Error::Config(format!("cannot read {}: {}", wg_path, e)))?;
            parse_device(&IniDocument::parse(&wg_content)?)?
        }
        None => parse_device(&doc)?,
    };

    let routines = parse_routines(&doc)?;

    Ok(Config { device, routines })
}

fn parse_device(doc: &IniDocument) -> Result<DeviceConfig, Error> {
    let interface = doc
        .section("interface")
        .ok_or_else(|| Error::Config("missing [Interface] section".to_string()))?;

    let secret_key = decode_key(required(interface, "privatekey")?)?;

    let endpoint_addrs = parse_addr_list(required(interface, "address")?)?;
    if endpoint_addrs.is_empty() {
        return Err(Error::Config("Address must list at least one IP".to_string()));
    }

    let dns = match interface.get("dns") {
        Some(v) => parse_addr_list(v)?,
        None => Vec::new(),
    };

    let mtu = match interface.get("mtu") {
        Some(v) => v
            .parse::<usize>()
            .map_err(|_| Error::Config(format!("invalid MTU: {}", v)))?,
        None => DEFAULT_MTU,
    };

    let listen_port = match interface.get("listenport") {
        Some(v) => Some(parse_port(v)?),
        None => None,
    };

    let check_alive = match interface.get("checkalive") {
        Some(v) => parse_addr_list(v)?,
        None => Vec::new(),
    };

    let check_alive_interval = match interface.get("checkaliveinterval") {
        Some(v) => v
            .parse::<u64>()
            .map_err(|_| Error::Config(format!("invalid CheckAliveInterval: {}", v)))?,
        None => DEFAULT_CHECK_ALIVE_INTERVAL,
    };

    let peer_sections = doc.sections_named("peer");
    if peer_sections.is_empty() {
        return Err(Error::Config("at least one [Peer] section is required".to_string()));
    }
    let mut peers = Vec::with_capacity(peer_sections.len());
    for section in peer_sections {
        peers.push(parse_peer(section)?);
    }

    Ok(DeviceConfig {
        secret_key,
        listen_port,
        endpoint_addrs,
        dns,
        mtu,
        peers,
        check_alive,
        check_alive_interval,
    })
}

fn parse_peer(section: &IniSection) -> Result<PeerConfig, Error> {
    let public_key = decode_key(required(section, "publickey")?)?;

    let preshared_key = match section.get("presharedkey") {
        Some(v) => decode_key(v)?,
        None => [0u8; 32],
    };

    let endpoint = match section.get("endpoint") {
        Some(v) => Some(resolve_endpoint(v)?),
        None => None,
    };

    let keep_alive = match section.get("persistentkeepalive") {
        Some(v) => v
            .parse::<u16>()
            .map_err(|_| Error::Config(format!("invalid PersistentKeepalive: {}", v)))?,
        None => 0,
    };

    // Shadowed AllowedIPs keys accumulate.
    let mut allowed_ips = Vec::new();
    for value in section.get_all("allowedips") {
        allowed_ips.extend(parse_cidr_list(value)?);
    }

    Ok(PeerConfig {
        public_key,
        preshared_key,
        endpoint,
        keep_alive,
        allowed_ips,
    })
}

fn parse_routines(doc: &IniDocument) -> Result<Vec<RoutineSpec>, Error> {
    let mut routines = Vec::new();

    for section in &doc.sections {
        let spec = match section.name.as_str() {
            "socks5" => RoutineSpec::Socks5 {
                bind: parse_bind_addr(required(section, "bindaddress")?)?,
                username: section.get("username").map(str::to_string),
                password: section.get("password").map(str::to_string),
            },
            "http" => RoutineSpec::Http {
                bind: parse_bind_addr(required(section, "bindaddress")?)?,
                username: section.get("username").map(str::to_string),
                password: section.get("password").map(str::to_string),
                cert_file: section.get("certfile").map(str::to_string),
                key_file: section.get("keyfile").map(str::to_string),
            },
            "tcpclienttunnel" => RoutineSpec::TcpClient {
                bind: parse_bind_addr(required(section, "bindaddress")?)?,
                target: parse_target(section)?,
            },
            "tcpservertunnel" => RoutineSpec::TcpServer {
                listen_port: parse_port(required(section, "listenport")?)?,
                target: parse_target(section)?,
            },
            "udptunnel" => RoutineSpec::UdpProxy {
                bind: parse_bind_addr(required(section, "bindaddress")?)?,
                target: parse_target(section)?,
                inactivity_secs: match section.get("inactivitytimeout") {
                    Some(v) => v.parse::<u64>().map_err(|_| {
                        Error::Config(format!("invalid InactivityTimeout: {}", v))
                    })?,
                    None => 0,
                },
            },
            "stdiotunnel" => RoutineSpec::Stdio {
                target: parse_target(section)?,
            },
            "interface" | "peer" => continue,
            other => {
                return Err(Error::Config(format!("unknown section: [{}]", other)));
            }
        };
        routines.push(spec);
    }

    Ok(routines)
}

/// Targets stay as `host:port` strings; the host may be a DNS name that is
/// resolved per-connection through the tunnel.
fn parse_target(section: &IniSection) -> Result<String, Error> {
    let target = required(section, "target")?;
    let (_, port) = target
        .rsplit_once(':')
        .ok_or_else(|| Error::Config(format!("target must be host:port: {}", target)))?;
    parse_port(port)?;
    Ok(target.to_string())
}

/// Check-only summary used by `-n`.
pub fn summarize(config: &Config) -> String {
    let device = &config.device;
    let dns: Vec<String> = device.dns.iter().map(IpAddr::to_string).collect();
    format!(
        "peers: {}\naddresses: {}\ndns: {}\nroutines: {}",
        device.peers.len(),
        device
            .endpoint_addrs
            .iter()
            .map(IpAddr::to_string)
            .collect::<Vec<_>>()
            .join(", "),
        if dns.is_empty() {
            "system".to_string()
        } else {
            dns.join(", ")
        },
        config
            .routines
            .iter()
            .map(RoutineSpec::kind)
            .collect::<Vec<_>>()
            .join(", "),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = "\
[Interface]
PrivateKey = LAr1aNSNF9d0MjwUgAVC4020T0N/E5NUtqVv5EnsSz0=
Address = 10.5.0.2
DNS = 1.1.1.1

[Peer]
PublicKey = e8LKAc+f9xEzq9Ar7+MfKRrs+gZ/4yzvpRJLRJ/VJ1w=
AllowedIPs = 0.0.0.0/0, ::/0
Endpoint = 127.0.0.1:51820
PersistentKeepalive = 25
";

    fn parse(content: &str) -> Result<Config, Error> {
        let doc = IniDocument::parse(content)?;
        Ok(Config {
            device: parse_device(&doc)?,
            routines: parse_routines(&doc)?,
        })
    }

    #[test]
    fn wireguard_conf_without_subnet() {
        let config = parse(BASE).unwrap();
        assert_eq!(config.device.peers.len(), 1);
        assert_eq!(config.device.mtu, DEFAULT_MTU);
        assert_eq!(config.device.dns.len(), 1);
        assert_eq!(config.device.peers[0].keep_alive, 25);
        assert!(config.device.peers[0].endpoint.is_some());
    }

    #[test]
    fn wireguard_conf_with_subnet() {
        let content = BASE.replace("Address = 10.5.0.2", "Address = 10.5.0.2/23");
        let config = parse(&content).unwrap();
        assert_eq!(
            config.device.endpoint_addrs,
            vec!["10.5.0.2".parse::<IpAddr>().unwrap()]
        );
    }

    #[test]
    fn wireguard_conf_with_many_addresses() {
        let content = BASE.replace(
            "Address = 10.5.0.2",
            "Address = 100.96.0.190,2606:B300:FFFF:fe8a:2ac6:c7e8:b021:6f5f/128",
        );
        let config = parse(&content).unwrap();
        assert_eq!(config.device.endpoint_addrs.len(), 2);
    }

    #[test]
    fn missing_private_key_rejected() {
        let content = BASE.replace("PrivateKey = LAr1aNSNF9d0MjwUgAVC4020T0N/E5NUtqVv5EnsSz0=", "");
        assert!(parse(&content).is_err());
    }

    #[test]
    fn truncated_key_rejected() {
        let content = BASE.replace(
            "PublicKey = e8LKAc+f9xEzq9Ar7+MfKRrs+gZ/4yzvpRJLRJ/VJ1w=",
            "PublicKey = e8LKAc+f9xEz",
        );
        assert!(matches!(parse(&content), Err(Error::InvalidKey(_))));
    }

    #[test]
    fn routine_sections_parsed_in_order() {
        let content = format!(
            "{}\n[Socks5]\nBindAddress = 127.0.0.1:1080\n\n[http]\nBindAddress = 127.0.0.1:3128\nUsername = u\nPassword = p\n\n[TCPClientTunnel]\nBindAddress = 127.0.0.1:2200\nTarget = ssh.internal:22\n\n[TCPServerTunnel]\nListenPort = 8080\nTarget = localhost:80\n\n[UDPTunnel]\nBindAddress = 127.0.0.1:5353\nTarget = 10.0.0.1:53\nInactivityTimeout = 60\n\n[STDIOTunnel]\nTarget = echo.internal:7\n",
            BASE
        );
        let config = parse(&content).unwrap();
        assert_eq!(config.routines.len(), 6);
        assert!(matches!(config.routines[0], RoutineSpec::Socks5 { .. }));
        assert!(matches!(
            config.routines[1],
            RoutineSpec::Http { username: Some(_), .. }
        ));
        assert!(matches!(config.routines[2], RoutineSpec::TcpClient { .. }));
        assert!(matches!(
            config.routines[3],
            RoutineSpec::TcpServer { listen_port: 8080, .. }
        ));
        assert!(matches!(
            config.routines[4],
            RoutineSpec::UdpProxy { inactivity_secs: 60, .. }
        ));
        assert!(matches!(config.routines[5], RoutineSpec::Stdio { .. }));
    }

    #[test]
    fn multiple_peers() {
        let content = format!(
            "{}\n[Peer]\nPublicKey = SHnh4C2aDXhp1gjIqceGhJrhOLSeNYcqWLKcYnzj00U=\nAllowedIPs = 10.10.0.0/16\n",
            BASE
        );
        let config = parse(&content).unwrap();
        assert_eq!(config.device.peers.len(), 2);
        assert!(config.device.peers[1].endpoint.is_none());
        assert_eq!(config.device.peers[1].preshared_key, [0u8; 32]);
    }

    #[test]
    fn unknown_section_rejected() {
        let content = format!("{}\n[Bogus]\nKey = value\n", BASE);
        assert!(parse(&content).is_err());
    }

    #[test]
    fn bad_target_rejected() {
        let content = format!(
            "{}\n[STDIOTunnel]\nTarget = no-port-here\n",
            BASE
        );
        assert!(parse(&content).is_err());
    }
}
