//! Virtual UDP sockets.

use std::net::SocketAddr;
use std::sync::Arc;

use smoltcp::socket::udp;
use smoltcp::wire::{IpEndpoint, IpListenEndpoint};

use crate::common::Error;

use super::{from_ip_address, random_ephemeral_port, to_ip_address, StackHandle};

const UDP_RX_BUFFER: usize = 64 * 1024;
const UDP_TX_BUFFER: usize = 64 * 1024;
const UDP_PACKET_SLOTS: usize = 16;

/// A UDP socket bound inside the virtual stack. Optionally connected to a
/// fixed peer, in which case `send`/`recv` apply and datagrams from other
/// sources are discarded.
#[derive(Clone)]
pub struct VirtUdpSocket {
    stack: StackHandle,
    handle: Arc<std::sync::Mutex<Option<smoltcp::iface::SocketHandle>>>,
    port: u16,
    peer: Option<SocketAddr>,
}

impl VirtUdpSocket {
    /// Bind to `port`, or an ephemeral port when 0. Fails with `Listen` when
    /// the requested port is taken.
    pub async fn bind(stack: StackHandle, port: u16) -> Result<Self, Error> {
        let (handle, port) = {
            let mut state = stack.lock().await;

            let port = if port == 0 {
                let mut candidate = random_ephemeral_port();
                while !state.udp_port_free(candidate) {
                    candidate = random_ephemeral_port();
                }
                candidate
            } else if state.udp_port_free(port) {
                port
            } else {
                return Err(Error::Listen(format!("udp port {} in use", port)));
            };

            let rx = udp::PacketBuffer::new(
                vec![udp::PacketMetadata::EMPTY; UDP_PACKET_SLOTS],
                vec![0u8; UDP_RX_BUFFER],
            );
            let tx = udp::PacketBuffer::new(
                vec![udp::PacketMetadata::EMPTY; UDP_PACKET_SLOTS],
                vec![0u8; UDP_TX_BUFFER],
            );
            let mut socket = udp::Socket::new(rx, tx);
            socket
                .bind(IpListenEndpoint::from(port))
                .map_err(|e| Error::Listen(format!("udp bind on {}: {:?}", port, e)))?;

            state.claim_udp_port(port);
            (state.add_socket(socket), port)
        };

        stack.kick();

        Ok(Self {
            stack,
            handle: Arc::new(std::sync::Mutex::new(Some(handle))),
            port,
            peer: None,
        })
    }

    /// Bind to an ephemeral port and fix the remote peer.
    pub async fn connect(stack: StackHandle, peer: SocketAddr) -> Result<Self, Error> {
        let mut socket = Self::bind(stack, 0).await?;
        socket.peer = Some(peer);
        Ok(socket)
    }

    pub fn local_port(&self) -> u16 {
        self.port
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub async fn send_to(&self, data: &[u8], target: SocketAddr) -> Result<(), Error> {
        {
            let mut state = self.stack.lock().await;
            // Re-check under the stack lock: a clone may have closed the
            // socket and released the handle.
            let handle = match *self.handle.lock().unwrap() {
                Some(h) => h,
                None => return Err(Error::Protocol("udp socket closed".to_string())),
            };
            let socket = state.sockets.get_mut::<udp::Socket>(handle);
            socket
                .send_slice(
                    data,
                    IpEndpoint::new(to_ip_address(target.ip()), target.port()),
                )
                .map_err(|e| Error::Protocol(format!("udp send to {}: {:?}", target, e)))?;
        }
        self.stack.kick();
        Ok(())
    }

    /// Send to the connected peer.
    pub async fn send(&self, data: &[u8]) -> Result<(), Error> {
        let peer = self
            .peer
            .ok_or_else(|| Error::Protocol("udp socket is not connected".to_string()))?;
        self.send_to(data, peer).await
    }

    /// Receive one datagram. Blocks until data arrives; callers impose their
    /// own deadline with `tokio::time::timeout`.
    pub async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr), Error> {
        loop {
            let datagram = {
                let mut state = self.stack.lock().await;
                let handle = match *self.handle.lock().unwrap() {
                    Some(h) => h,
                    None => return Err(Error::Protocol("udp socket closed".to_string())),
                };
                let socket = state.sockets.get_mut::<udp::Socket>(handle);
                if socket.can_recv() {
                    let (data, meta) = socket
                        .recv()
                        .map_err(|e| Error::Protocol(format!("udp recv: {:?}", e)))?;
                    let n = data.len().min(buf.len());
                    buf[..n].copy_from_slice(&data[..n]);
                    let from =
                        SocketAddr::new(from_ip_address(meta.endpoint.addr), meta.endpoint.port);
                    Some((n, from))
                } else {
                    None
                }
            };

            if let Some((n, from)) = datagram {
                // Connected sockets drop strays.
                if let Some(peer) = self.peer {
                    if from != peer {
                        continue;
                    }
                }
                return Ok((n, from));
            }

            self.stack.parked().await;
        }
    }

    /// Receive from the connected peer.
    pub async fn recv(&self, buf: &mut [u8]) -> Result<usize, Error> {
        let (n, _) = self.recv_from(buf).await?;
        Ok(n)
    }

    pub async fn close(&self) {
        let handle = match self.handle.lock().unwrap().take() {
            Some(h) => h,
            None => return,
        };
        let mut state = self.stack.lock().await;
        {
            let socket = state.sockets.get_mut::<udp::Socket>(handle);
            socket.close();
        }
        state.remove_socket(handle);
        state.release_udp_port(self.port);
        self.stack.kick();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stack::Stack;

    #[tokio::test]
    async fn bind_claims_and_releases_port() {
        let stack = Stack::new(&["10.5.0.2".parse().unwrap()], 1420).unwrap();
        let socket = VirtUdpSocket::bind(stack.clone(), 5353).await.unwrap();
        assert_eq!(socket.local_port(), 5353);

        // Second bind on the same port fails while the first is open.
        assert!(VirtUdpSocket::bind(stack.clone(), 5353).await.is_err());

        socket.close().await;
        let reclaimed = VirtUdpSocket::bind(stack, 5353).await.unwrap();
        assert_eq!(reclaimed.local_port(), 5353);
    }

    #[tokio::test]
    async fn connect_picks_ephemeral_port_and_peer() {
        let stack = Stack::new(&["10.5.0.2".parse().unwrap()], 1420).unwrap();
        let peer: SocketAddr = "10.0.0.1:53".parse().unwrap();
        let socket = VirtUdpSocket::connect(stack, peer).await.unwrap();
        assert!(socket.local_port() >= 49152);
        assert_eq!(socket.peer(), Some(peer));
    }

    #[tokio::test]
    async fn send_queues_into_stack() {
        let stack = Stack::new(&["10.5.0.2".parse().unwrap()], 1420).unwrap();
        let socket = VirtUdpSocket::connect(stack.clone(), "10.0.0.1:53".parse().unwrap())
            .await
            .unwrap();
        socket.send(b"query").await.unwrap();

        // Polling the interface must emit an IP packet for the datagram.
        let mut state = stack.lock().await;
        state.poll();
        let frames = state.drain_outbound();
        assert_eq!(frames.len(), 1);
        // IPv4 header: protocol UDP, dst 10.0.0.1
        assert_eq!(frames[0][9], 17);
        assert_eq!(&frames[0][16..20], &[10, 0, 0, 1]);
    }
}
