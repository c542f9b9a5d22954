//! Virtual network stack.
//!
//! A userspace IP/TCP/UDP/ICMP stack (smoltcp) bound to the assigned tunnel
//! addresses. The stack has no OS-facing side: packets enter and leave
//! through the queue-backed [`device::VirtDevice`], which the WireGuard
//! engine pumps. Async callers park on a shared [`Notify`] and are woken
//! whenever a poll makes progress.

pub mod device;
pub mod icmp;
pub mod tcp;
pub mod udp;

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use smoltcp::iface::{Config, Interface, SocketHandle, SocketSet};
use smoltcp::socket::AnySocket;
use smoltcp::time::Instant;
use smoltcp::wire::{HardwareAddress, IpAddress, IpCidr, Ipv4Address, Ipv6Address};
use tokio::sync::{Mutex, MutexGuard, Notify};

use crate::common::Error;

use device::VirtDevice;

/// Interface state guarded by the stack mutex.
pub struct Netstack {
    pub(crate) iface: Interface,
    pub(crate) sockets: SocketSet<'static>,
    pub(crate) device: VirtDevice,
    /// UDP ports currently bound, so routine-level NAT code can scan for a
    /// free one.
    udp_ports: HashSet<u16>,
}

impl Netstack {
    fn new(addrs: &[IpAddr], mtu: usize) -> Result<Self, Error> {
        let mut device = VirtDevice::new(mtu);
        let config = Config::new(HardwareAddress::Ip);
        let mut iface = Interface::new(config, &mut device, Instant::now());

        let mut assigned = 0usize;
        iface.update_ip_addrs(|list| {
            for addr in addrs {
                let cidr = match addr {
                    IpAddr::V4(v4) => IpCidr::new(IpAddress::Ipv4(Ipv4Address::from(*v4)), 32),
                    IpAddr::V6(v6) => IpCidr::new(IpAddress::Ipv6(Ipv6Address::from(*v6)), 128),
                };
                if list.push(cidr).is_ok() {
                    assigned += 1;
                }
            }
        });
        if assigned != addrs.len() {
            return Err(Error::Config(format!(
                "too many interface addresses: {} (assigned {})",
                addrs.len(),
                assigned
            )));
        }

        // The medium is Ip, so the gateway is never consulted for neighbor
        // discovery; a default route still has to exist for off-subnet
        // destinations.
        if let Some(IpAddr::V4(v4)) = addrs.iter().find(|a| a.is_ipv4()).copied() {
            let _ = iface
                .routes_mut()
                .add_default_ipv4_route(Ipv4Address::from(v4));
        }
        if let Some(IpAddr::V6(v6)) = addrs.iter().find(|a| a.is_ipv6()).copied() {
            let _ = iface
                .routes_mut()
                .add_default_ipv6_route(Ipv6Address::from(v6));
        }

        Ok(Self {
            iface,
            sockets: SocketSet::new(vec![]),
            device,
            udp_ports: HashSet::new(),
        })
    }

    /// Drive the interface once. Returns true when any socket made progress.
    pub fn poll(&mut self) -> bool {
        self.iface
            .poll(Instant::now(), &mut self.device, &mut self.sockets)
    }

    pub fn poll_delay(&mut self) -> Option<Duration> {
        self.iface
            .poll_delay(Instant::now(), &self.sockets)
            .map(|d| Duration::from_micros(d.total_micros()))
    }

    pub fn add_socket<T: AnySocket<'static>>(&mut self, socket: T) -> SocketHandle {
        self.sockets.add(socket)
    }

    pub fn remove_socket(&mut self, handle: SocketHandle) {
        self.sockets.remove(handle);
    }

    pub fn push_inbound(&mut self, packet: Vec<u8>) {
        self.device.push_inbound(packet);
    }

    pub fn drain_outbound(&mut self) -> Vec<Vec<u8>> {
        self.device.drain_outbound()
    }

    pub(crate) fn claim_udp_port(&mut self, port: u16) -> bool {
        self.udp_ports.insert(port)
    }

    pub(crate) fn release_udp_port(&mut self, port: u16) {
        self.udp_ports.remove(&port);
    }

    pub(crate) fn udp_port_free(&self, port: u16) -> bool {
        !self.udp_ports.contains(&port)
    }
}

/// Shared handle to the stack. Socket wrappers clone this and park on
/// `notify` between polls.
pub struct Stack {
    state: Mutex<Netstack>,
    notify: Notify,
    addrs: Vec<IpAddr>,
}

pub type StackHandle = Arc<Stack>;

impl Stack {
    pub fn new(addrs: &[IpAddr], mtu: usize) -> Result<StackHandle, Error> {
        Ok(Arc::new(Self {
            state: Mutex::new(Netstack::new(addrs, mtu)?),
            notify: Notify::new(),
            addrs: addrs.to_vec(),
        }))
    }

    pub async fn lock(&self) -> MutexGuard<'_, Netstack> {
        self.state.lock().await
    }

    /// Wake every task parked on the stack.
    pub fn kick(&self) {
        self.notify.notify_waiters();
    }

    pub async fn parked(&self) {
        self.notify.notified().await;
    }

    pub fn addrs(&self) -> &[IpAddr] {
        &self.addrs
    }
}

pub(crate) fn to_ip_address(addr: IpAddr) -> IpAddress {
    match addr {
        IpAddr::V4(v4) => IpAddress::Ipv4(Ipv4Address::from(v4)),
        IpAddr::V6(v6) => IpAddress::Ipv6(Ipv6Address::from(v6)),
    }
}

pub(crate) fn from_ip_address(addr: IpAddress) -> IpAddr {
    match addr {
        IpAddress::Ipv4(v4) => IpAddr::V4(v4.into()),
        IpAddress::Ipv6(v6) => IpAddr::V6(v6.into()),
    }
}

pub(crate) fn random_ephemeral_port() -> u16 {
    rand::thread_rng().gen_range(49152..=65535)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stack_assigns_addresses() {
        let addrs = vec![
            "10.5.0.2".parse::<IpAddr>().unwrap(),
            "2001:db8::2".parse::<IpAddr>().unwrap(),
        ];
        let stack = Stack::new(&addrs, 1420).unwrap();
        assert_eq!(stack.addrs(), &addrs[..]);
    }

    #[test]
    fn ephemeral_ports_in_dynamic_range() {
        for _ in 0..64 {
            let port = random_ephemeral_port();
            assert!((49152..=65535).contains(&port));
        }
    }

    #[tokio::test]
    async fn udp_port_claims_are_exclusive() {
        let stack = Stack::new(&["10.5.0.2".parse().unwrap()], 1420).unwrap();
        let mut state = stack.lock().await;
        assert!(state.udp_port_free(5353));
        assert!(state.claim_udp_port(5353));
        assert!(!state.claim_udp_port(5353));
        assert!(!state.udp_port_free(5353));
        state.release_udp_port(5353);
        assert!(state.udp_port_free(5353));
    }

    #[test]
    fn ip_address_conversion_roundtrip() {
        let v4: IpAddr = "192.0.2.1".parse().unwrap();
        let v6: IpAddr = "2001:db8::1".parse().unwrap();
        assert_eq!(from_ip_address(to_ip_address(v4)), v4);
        assert_eq!(from_ip_address(to_ip_address(v6)), v6);
    }
}
