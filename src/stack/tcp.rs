//! Virtual TCP sockets.
//!
//! Streams hold a socket handle into the shared [`Netstack`] and wait on the
//! stack notifier between polls. Reads and writes are explicit async
//! methods; the proxy layer splices them against host sockets.

use std::net::SocketAddr;
use std::sync::Arc;

use smoltcp::socket::tcp;
use smoltcp::wire::{IpEndpoint, IpListenEndpoint};
use tokio::time::Instant;

use crate::common::Error;

use super::{from_ip_address, random_ephemeral_port, to_ip_address, StackHandle};

const TCP_RX_BUFFER: usize = 64 * 1024;
const TCP_TX_BUFFER: usize = 64 * 1024;
const TCP_CONNECT_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

/// A TCP connection inside the virtual stack.
#[derive(Clone)]
pub struct VirtTcpStream {
    stack: StackHandle,
    handle: Arc<std::sync::Mutex<Option<smoltcp::iface::SocketHandle>>>,
}

impl std::fmt::Debug for VirtTcpStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtTcpStream").finish_non_exhaustive()
    }
}

/// A port reservation inside the virtual stack; each `accept` parks a fresh
/// listening socket on the port.
pub struct VirtTcpListener {
    stack: StackHandle,
    port: u16,
}

impl VirtTcpStream {
    /// Dial `addr` through the stack and wait for the connection to
    /// establish.
    pub async fn connect(stack: StackHandle, addr: SocketAddr) -> Result<Self, Error> {
        let handle = {
            let mut state = stack.lock().await;
            let rx = tcp::SocketBuffer::new(vec![0u8; TCP_RX_BUFFER]);
            let tx = tcp::SocketBuffer::new(vec![0u8; TCP_TX_BUFFER]);
            let mut socket = tcp::Socket::new(rx, tx);
            socket.set_nagle_enabled(false);

            let handle = state.add_socket(socket);
            let local_port = random_ephemeral_port();
            let state = &mut *state;
            let (iface, sockets) = (&mut state.iface, &mut state.sockets);
            let socket = sockets.get_mut::<tcp::Socket>(handle);
            if let Err(e) = socket.connect(
                iface.context(),
                IpEndpoint::new(to_ip_address(addr.ip()), addr.port()),
                IpListenEndpoint::from(local_port),
            ) {
                state.remove_socket(handle);
                return Err(Error::Dial(format!("tcp connect to {}: {:?}", addr, e)));
            }
            handle
        };

        stack.kick();

        let mut conn = Self {
            stack,
            handle: Arc::new(std::sync::Mutex::new(Some(handle))),
        };
        conn.wait_established(addr).await?;
        Ok(conn)
    }

    async fn wait_established(&mut self, addr: SocketAddr) -> Result<(), Error> {
        let handle = match *self.handle.lock().unwrap() {
            Some(h) => h,
            None => return Err(Error::Dial("connection already closed".to_string())),
        };
        let deadline = Instant::now() + TCP_CONNECT_TIMEOUT;
        loop {
            let mut state = self.stack.lock().await;
            let socket = state.sockets.get_mut::<tcp::Socket>(handle);
            match socket.state() {
                tcp::State::Established => return Ok(()),
                tcp::State::Closed => {
                    *self.handle.lock().unwrap() = None;
                    state.remove_socket(handle);
                    return Err(Error::Dial(format!("tcp connect to {} refused", addr)));
                }
                _ => {}
            }
            drop(state);

            if Instant::now() >= deadline {
                let mut state = self.stack.lock().await;
                let socket = state.sockets.get_mut::<tcp::Socket>(handle);
                socket.abort();
                state.remove_socket(handle);
                *self.handle.lock().unwrap() = None;
                self.stack.kick();
                return Err(Error::Dial(format!("tcp connect to {} timed out", addr)));
            }

            // Also tick on a timer so the deadline fires even when the pump
            // has nothing to report.
            tokio::select! {
                _ = self.stack.parked() => {}
                _ = tokio::time::sleep(std::time::Duration::from_millis(100)) => {}
            }
        }
    }

    /// Read into `buf`. Returns 0 at EOF.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, Error> {
        loop {
            let mut state = self.stack.lock().await;
            // Re-check under the stack lock: a clone may have closed the
            // socket and released the handle while we were parked.
            let handle = match *self.handle.lock().unwrap() {
                Some(h) => h,
                None => return Ok(0),
            };
            let socket = state.sockets.get_mut::<tcp::Socket>(handle);
            if socket.can_recv() {
                let size = socket
                    .recv_slice(buf)
                    .map_err(|e| Error::Protocol(format!("tcp recv: {:?}", e)))?;
                drop(state);
                self.stack.kick();
                return Ok(size);
            }
            if !socket.may_recv() || socket.state() == tcp::State::Closed {
                return Ok(0);
            }
            drop(state);
            self.stack.parked().await;
        }
    }

    /// Write all of `buf`.
    pub async fn write(&self, buf: &[u8]) -> Result<usize, Error> {
        let mut offset = 0;
        while offset < buf.len() {
            let mut state = self.stack.lock().await;
            let handle = match *self.handle.lock().unwrap() {
                Some(h) => h,
                None => {
                    return Err(Error::Protocol("connection already closed".to_string()));
                }
            };
            let socket = state.sockets.get_mut::<tcp::Socket>(handle);
            if !socket.may_send() {
                return Err(Error::Protocol("tcp send on closed connection".to_string()));
            }
            if socket.can_send() {
                let written = socket
                    .send_slice(&buf[offset..])
                    .map_err(|e| Error::Protocol(format!("tcp send: {:?}", e)))?;
                offset += written;
                drop(state);
                self.stack.kick();
            } else {
                drop(state);
                self.stack.parked().await;
            }
        }
        Ok(offset)
    }

    /// The stack-assigned local endpoint of an established connection.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        let mut state = self.stack.lock().await;
        let handle = (*self.handle.lock().unwrap())?;
        let socket = state.sockets.get_mut::<tcp::Socket>(handle);
        socket
            .local_endpoint()
            .map(|ep| SocketAddr::new(from_ip_address(ep.addr), ep.port))
    }

    /// Close both directions and release the socket.
    pub async fn close(&self) {
        let handle = match self.handle.lock().unwrap().take() {
            Some(h) => h,
            None => return,
        };
        let mut state = self.stack.lock().await;
        {
            let socket = state.sockets.get_mut::<tcp::Socket>(handle);
            socket.close();
        }
        state.remove_socket(handle);
        self.stack.kick();
    }
}

impl VirtTcpListener {
    pub fn bind(stack: StackHandle, port: u16) -> Self {
        Self { stack, port }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Park a listening socket on the port and wait for one peer.
    pub async fn accept(&self) -> Result<VirtTcpStream, Error> {
        let handle = {
            let mut state = self.stack.lock().await;
            let rx = tcp::SocketBuffer::new(vec![0u8; TCP_RX_BUFFER]);
            let tx = tcp::SocketBuffer::new(vec![0u8; TCP_TX_BUFFER]);
            let mut socket = tcp::Socket::new(rx, tx);
            socket
                .listen(IpListenEndpoint::from(self.port))
                .map_err(|e| Error::Listen(format!("tcp listen on {}: {:?}", self.port, e)))?;
            state.add_socket(socket)
        };

        self.stack.kick();

        loop {
            let mut state = self.stack.lock().await;
            let socket = state.sockets.get_mut::<tcp::Socket>(handle);
            match socket.state() {
                tcp::State::Established => {
                    return Ok(VirtTcpStream {
                        stack: self.stack.clone(),
                        handle: Arc::new(std::sync::Mutex::new(Some(handle))),
                    });
                }
                tcp::State::Closed => {
                    state.remove_socket(handle);
                    return Err(Error::Listen("listener closed before accept".to_string()));
                }
                _ => {}
            }
            drop(state);
            self.stack.parked().await;
        }
    }
}
