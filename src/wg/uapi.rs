//! The engine's text configuration channel.
//!
//! Set-requests are newline-delimited `key=value` documents with
//! hex-encoded keys, one device block followed by one block per peer, in
//! the order wg(8) emits them. [`create_ipc_request`] serializes a
//! [`DeviceConfig`] into that form and [`IpcSetRequest::parse`] reads it
//! back on the engine side.

use std::fmt::Write;
use std::net::SocketAddr;

use ipnet::IpNet;

use crate::common::Error;
use crate::config::types::DeviceConfig;

/// Serialize the device configuration into an IPC set-request.
///
/// Field order for the device block: `private_key`, then `listen_port` when
/// set. For each peer in config order: `public_key`,
/// `persistent_keepalive_interval`, `preshared_key`, `endpoint` when
/// present, then one `allowed_ip` per entry — or the catch-all defaults
/// when the list is empty.
pub fn create_ipc_request(conf: &DeviceConfig) -> String {
    let mut request = String::new();

    let _ = writeln!(request, "private_key={}", hex::encode(conf.secret_key));
    if let Some(port) = conf.listen_port {
        let _ = writeln!(request, "listen_port={}", port);
    }

    for peer in &conf.peers {
        let _ = writeln!(request, "public_key={}", hex::encode(peer.public_key));
        let _ = writeln!(
            request,
            "persistent_keepalive_interval={}",
            peer.keep_alive
        );
        let _ = writeln!(request, "preshared_key={}", hex::encode(peer.preshared_key));
        if let Some(endpoint) = peer.endpoint {
            let _ = writeln!(request, "endpoint={}", endpoint);
        }
        if peer.allowed_ips.is_empty() {
            let _ = writeln!(request, "allowed_ip=0.0.0.0/0");
            let _ = writeln!(request, "allowed_ip=::/0");
        } else {
            for net in &peer.allowed_ips {
                let _ = writeln!(request, "allowed_ip={}", net);
            }
        }
    }

    request
}

/// A parsed set-request, ready for the engine to apply.
#[derive(Debug, Clone)]
pub struct IpcSetRequest {
    pub private_key: [u8; 32],
    pub listen_port: Option<u16>,
    pub peers: Vec<IpcPeer>,
}

#[derive(Debug, Clone)]
pub struct IpcPeer {
    pub public_key: [u8; 32],
    pub preshared_key: [u8; 32],
    pub endpoint: Option<SocketAddr>,
    pub keep_alive: u16,
    pub allowed_ips: Vec<IpNet>,
}

impl IpcSetRequest {
    pub fn parse(text: &str) -> Result<Self, Error> {
        let mut private_key: Option<[u8; 32]> = None;
        let mut listen_port: Option<u16> = None;
        let mut peers: Vec<IpcPeer> = Vec::new();

        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| Error::Config(format!("malformed IPC line: {}", line)))?;

            match key {
                "private_key" => private_key = Some(decode_hex_key(value)?),
                "listen_port" => {
                    let port: u16 = value
                        .parse()
                        .map_err(|_| Error::Config(format!("invalid listen_port: {}", value)))?;
                    listen_port = Some(port);
                }
                "public_key" => peers.push(IpcPeer {
                    public_key: decode_hex_key(value)?,
                    preshared_key: [0u8; 32],
                    endpoint: None,
                    keep_alive: 0,
                    allowed_ips: Vec::new(),
                }),
                "preshared_key" => {
                    current_peer(&mut peers, key)?.preshared_key = decode_hex_key(value)?;
                }
                "endpoint" => {
                    let addr: SocketAddr = value
                        .parse()
                        .map_err(|_| Error::Config(format!("invalid endpoint: {}", value)))?;
                    current_peer(&mut peers, key)?.endpoint = Some(addr);
                }
                "persistent_keepalive_interval" => {
                    let secs: u16 = value.parse().map_err(|_| {
                        Error::Config(format!("invalid keepalive interval: {}", value))
                    })?;
                    current_peer(&mut peers, key)?.keep_alive = secs;
                }
                "allowed_ip" => {
                    let net: IpNet = value
                        .parse()
                        .map_err(|_| Error::Config(format!("invalid allowed_ip: {}", value)))?;
                    current_peer(&mut peers, key)?.allowed_ips.push(net);
                }
                other => {
                    return Err(Error::Config(format!("unknown IPC directive: {}", other)));
                }
            }
        }

        let private_key =
            private_key.ok_or_else(|| Error::Config("IPC request missing private_key".into()))?;
        if peers.is_empty() {
            return Err(Error::Config("IPC request carries no peers".into()));
        }

        Ok(Self {
            private_key,
            listen_port,
            peers,
        })
    }
}

fn current_peer<'a>(peers: &'a mut [IpcPeer], key: &str) -> Result<&'a mut IpcPeer, Error> {
    peers
        .last_mut()
        .ok_or_else(|| Error::Config(format!("{} before any public_key", key)))
}

fn decode_hex_key(value: &str) -> Result<[u8; 32], Error> {
    let bytes = hex::decode(value)
        .map_err(|_| Error::InvalidKey(format!("invalid hex key: {}", value)))?;
    bytes
        .try_into()
        .map_err(|_| Error::InvalidKey(format!("key should be 32 bytes: {}", value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::PeerConfig;

    fn device(peers: Vec<PeerConfig>) -> DeviceConfig {
        DeviceConfig {
            secret_key: [0x11; 32],
            listen_port: None,
            endpoint_addrs: vec!["10.5.0.2".parse().unwrap()],
            dns: vec![],
            mtu: 1420,
            peers,
            check_alive: vec![],
            check_alive_interval: 5,
        }
    }

    fn peer() -> PeerConfig {
        PeerConfig {
            public_key: [0x22; 32],
            preshared_key: [0u8; 32],
            endpoint: Some("192.0.2.1:51820".parse().unwrap()),
            keep_alive: 25,
            allowed_ips: vec!["0.0.0.0/0".parse().unwrap()],
        }
    }

    #[test]
    fn request_field_order() {
        let mut conf = device(vec![peer()]);
        conf.listen_port = Some(51820);
        let text = create_ipc_request(&conf);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], format!("private_key={}", hex::encode([0x11; 32])));
        assert_eq!(lines[1], "listen_port=51820");
        assert_eq!(lines[2], format!("public_key={}", hex::encode([0x22; 32])));
        assert_eq!(lines[3], "persistent_keepalive_interval=25");
        assert!(lines[4].starts_with("preshared_key="));
        assert_eq!(lines[5], "endpoint=192.0.2.1:51820");
        assert_eq!(lines[6], "allowed_ip=0.0.0.0/0");
    }

    #[test]
    fn line_counts_match_config_shape() {
        let mut second = peer();
        second.allowed_ips = vec![];
        second.endpoint = None;
        let conf = device(vec![peer(), second]);
        let text = create_ipc_request(&conf);

        let count = |prefix: &str| text.lines().filter(|l| l.starts_with(prefix)).count();
        assert_eq!(count("private_key="), 1);
        assert_eq!(count("public_key="), 2);
        // one explicit allowed_ip + the two defaults for the empty list
        assert_eq!(count("allowed_ip="), 3);
    }

    #[test]
    fn empty_allowed_ips_get_defaults() {
        let mut p = peer();
        p.allowed_ips = vec![];
        let text = create_ipc_request(&device(vec![p]));
        assert!(text.contains("allowed_ip=0.0.0.0/0\nallowed_ip=::/0\n"));
    }

    #[test]
    fn parse_roundtrip() {
        let mut conf = device(vec![peer()]);
        conf.listen_port = Some(7777);
        let text = create_ipc_request(&conf);
        let parsed = IpcSetRequest::parse(&text).unwrap();

        assert_eq!(parsed.private_key, conf.secret_key);
        assert_eq!(parsed.listen_port, Some(7777));
        assert_eq!(parsed.peers.len(), 1);
        assert_eq!(parsed.peers[0].public_key, [0x22; 32]);
        assert_eq!(parsed.peers[0].keep_alive, 25);
        assert_eq!(
            parsed.peers[0].endpoint,
            Some("192.0.2.1:51820".parse().unwrap())
        );
        assert_eq!(parsed.peers[0].allowed_ips.len(), 1);
    }

    #[test]
    fn parse_rejects_short_key() {
        let text = format!("private_key={}\n", hex::encode([0u8; 16]));
        assert!(matches!(
            IpcSetRequest::parse(&text),
            Err(Error::InvalidKey(_))
        ));
    }

    #[test]
    fn parse_rejects_peer_field_before_peer() {
        let text = format!(
            "private_key={}\nallowed_ip=0.0.0.0/0\n",
            hex::encode([1u8; 32])
        );
        assert!(IpcSetRequest::parse(&text).is_err());
    }

    #[test]
    fn parse_requires_a_peer() {
        let text = format!("private_key={}\n", hex::encode([1u8; 32]));
        assert!(IpcSetRequest::parse(&text).is_err());
    }
}
