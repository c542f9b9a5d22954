//! Name resolution.
//!
//! Two backends behind one interface: when the device configuration lists
//! no DNS servers, names go to the host's resolver (hickory, system
//! configuration); otherwise queries are sent over the tunnel to the
//! configured servers. Either way, when more than one address comes back
//! the result is picked uniformly at random.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::{Name, RData, RecordType};
use hickory_resolver::TokioAsyncResolver;
use rand::seq::SliceRandom;
use tracing::debug;

use crate::common::Error;
use crate::stack::udp::VirtUdpSocket;
use crate::stack::StackHandle;

const DNS_PORT: u16 = 53;
const DNS_TIMEOUT: Duration = Duration::from_secs(5);

pub struct NameResolver {
    stack: StackHandle,
    /// Tunnel-side servers; empty means system resolution.
    servers: Vec<IpAddr>,
    system: Option<TokioAsyncResolver>,
}

impl NameResolver {
    pub fn new(stack: StackHandle, dns: &[IpAddr]) -> Result<Self, Error> {
        let system = if dns.is_empty() {
            Some(
                TokioAsyncResolver::tokio_from_system_conf()
                    .map_err(|e| Error::Resolve(format!("system resolver: {}", e)))?,
            )
        } else {
            None
        };
        Ok(Self {
            stack,
            servers: dns.to_vec(),
            system,
        })
    }

    /// All addresses for a hostname.
    pub async fn lookup(&self, name: &str) -> Result<Vec<IpAddr>, Error> {
        if let Some(system) = &self.system {
            let lookup = system
                .lookup_ip(name)
                .await
                .map_err(|e| Error::Resolve(format!("{}: {}", name, e)))?;
            return Ok(lookup.iter().collect());
        }
        self.lookup_tunneled(name).await
    }

    /// One address for a hostname, picked uniformly when the backend
    /// returns several.
    pub async fn resolve(&self, name: &str) -> Result<IpAddr, Error> {
        let addrs = self.lookup(name).await?;
        pick_shuffled(&addrs).ok_or_else(|| Error::NoAddress(name.to_string()))
    }

    /// Resolve `host` (IP literal or name) and pair it with `port`.
    pub async fn resolve_addr_port(&self, host: &str, port: u16) -> Result<SocketAddr, Error> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(SocketAddr::new(ip, port));
        }
        let addr = self.resolve(host).await?;
        Ok(SocketAddr::new(addr, port))
    }

    async fn lookup_tunneled(&self, name: &str) -> Result<Vec<IpAddr>, Error> {
        let fqdn = Name::from_utf8(name)
            .map_err(|e| Error::Resolve(format!("invalid name {}: {}", name, e)))?;

        let mut last_err = None;
        for server in &self.servers {
            match self.query_server(*server, &fqdn).await {
                Ok(addrs) if !addrs.is_empty() => return Ok(addrs),
                Ok(_) => last_err = Some(Error::NoAddress(name.to_string())),
                Err(e) => {
                    debug!(server = %server, error = %e, "tunneled DNS query failed");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| Error::Resolve("no DNS servers configured".to_string())))
    }

    async fn query_server(&self, server: IpAddr, name: &Name) -> Result<Vec<IpAddr>, Error> {
        let socket =
            VirtUdpSocket::connect(self.stack.clone(), SocketAddr::new(server, DNS_PORT)).await?;

        let mut addrs = Vec::new();
        for rtype in [RecordType::A, RecordType::AAAA] {
            match self.query_once(&socket, name, rtype).await {
                Ok(found) => addrs.extend(found),
                Err(e) => {
                    // One family failing is fine as long as the other
                    // produced answers.
                    debug!(rtype = %rtype, error = %e, "DNS query failed");
                }
            }
        }
        socket.close().await;
        Ok(addrs)
    }

    async fn query_once(
        &self,
        socket: &VirtUdpSocket,
        name: &Name,
        rtype: RecordType,
    ) -> Result<Vec<IpAddr>, Error> {
        let id: u16 = rand::random();
        let mut message = Message::new();
        message
            .set_id(id)
            .set_message_type(MessageType::Query)
            .set_op_code(OpCode::Query)
            .set_recursion_desired(true)
            .add_query(Query::query(name.clone(), rtype));
        let request = message
            .to_vec()
            .map_err(|e| Error::Resolve(format!("encode query: {}", e)))?;

        socket.send(&request).await?;

        let mut buf = [0u8; 2048];
        let n = tokio::time::timeout(DNS_TIMEOUT, socket.recv(&mut buf))
            .await
            .map_err(|_| Error::Resolve(format!("DNS query for {} timed out", name)))??;

        let response = Message::from_vec(&buf[..n])
            .map_err(|e| Error::Resolve(format!("decode response: {}", e)))?;
        if response.id() != id {
            return Err(Error::Resolve("DNS response id mismatch".to_string()));
        }

        let mut addrs = Vec::new();
        for record in response.answers() {
            match record.data() {
                Some(RData::A(a)) => addrs.push(IpAddr::V4(a.0)),
                Some(RData::AAAA(aaaa)) => addrs.push(IpAddr::V6(aaaa.0)),
                _ => {}
            }
        }
        Ok(addrs)
    }
}

/// Uniform pick: shuffle and take the head.
fn pick_shuffled(addrs: &[IpAddr]) -> Option<IpAddr> {
    let mut shuffled: Vec<IpAddr> = addrs.to_vec();
    shuffled.shuffle(&mut rand::thread_rng());
    shuffled.first().copied()
}
