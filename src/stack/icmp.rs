//! ICMP Echo through the virtual stack.

use std::net::IpAddr;
use std::time::Duration;

use rand::RngCore;
use smoltcp::phy::ChecksumCapabilities;
use smoltcp::socket::icmp;
use smoltcp::wire::{
    Icmpv4Packet, Icmpv4Repr, Icmpv6Packet, Icmpv6Repr, IpAddress, Ipv6Address,
};
use tokio::time::Instant;

use crate::common::Error;

use super::{to_ip_address, StackHandle};

const ICMP_RX_BUFFER: usize = 512;
const ICMP_TX_BUFFER: usize = 512;
const ICMP_PACKET_SLOTS: usize = 4;
const PING_PAYLOAD_LEN: usize = 16;

/// Send one Echo Request to `target` and wait for the matching reply.
///
/// The reply must be an Echo Reply of the same family carrying the exact
/// sequence number and payload bytes that were sent.
pub async fn ping(stack: &StackHandle, target: IpAddr, timeout: Duration) -> Result<(), Error> {
    let ident: u16 = rand::random();
    let seq_no: u16 = rand::random();
    let mut payload = [0u8; PING_PAYLOAD_LEN];
    rand::thread_rng().fill_bytes(&mut payload);

    let target_addr = to_ip_address(target);

    let (handle, v6_src) = {
        let mut state = stack.lock().await;
        let rx = icmp::PacketBuffer::new(
            vec![icmp::PacketMetadata::EMPTY; ICMP_PACKET_SLOTS],
            vec![0u8; ICMP_RX_BUFFER],
        );
        let tx = icmp::PacketBuffer::new(
            vec![icmp::PacketMetadata::EMPTY; ICMP_PACKET_SLOTS],
            vec![0u8; ICMP_TX_BUFFER],
        );
        let mut socket = icmp::Socket::new(rx, tx);
        socket
            .bind(icmp::Endpoint::Ident(ident))
            .map_err(|e| Error::Liveness(format!("icmp bind: {:?}", e)))?;
        let handle = state.add_socket(socket);

        let v6_src = match target {
            IpAddr::V4(_) => {
                let repr = Icmpv4Repr::EchoRequest {
                    ident,
                    seq_no,
                    data: &payload,
                };
                let mut buf = vec![0u8; repr.buffer_len()];
                repr.emit(
                    &mut Icmpv4Packet::new_unchecked(&mut buf),
                    &ChecksumCapabilities::default(),
                );
                let socket = state.sockets.get_mut::<icmp::Socket>(handle);
                if let Err(e) = socket.send_slice(&buf, target_addr) {
                    state.remove_socket(handle);
                    return Err(Error::Liveness(format!("icmp send: {:?}", e)));
                }
                None
            }
            IpAddr::V6(dst) => {
                let dst_addr = Ipv6Address::from(dst);
                let Some(src_addr) = state.iface.get_source_address_ipv6(&dst_addr) else {
                    state.remove_socket(handle);
                    return Err(Error::Liveness(format!("no IPv6 source address for {}", dst)));
                };
                let repr = Icmpv6Repr::EchoRequest {
                    ident,
                    seq_no,
                    data: &payload,
                };
                let mut buf = vec![0u8; repr.buffer_len()];
                repr.emit(
                    &IpAddress::Ipv6(src_addr),
                    &IpAddress::Ipv6(dst_addr),
                    &mut Icmpv6Packet::new_unchecked(&mut buf),
                    &ChecksumCapabilities::default(),
                );
                let socket = state.sockets.get_mut::<icmp::Socket>(handle);
                if let Err(e) = socket.send_slice(&buf, target_addr) {
                    state.remove_socket(handle);
                    return Err(Error::Liveness(format!("icmp send: {:?}", e)));
                }
                Some(src_addr)
            }
        };

        (handle, v6_src)
    };

    stack.kick();

    let deadline = Instant::now() + timeout;
    let mut recv_buf = [0u8; 512];
    loop {
        let mut state = stack.lock().await;
        let reply = {
            let socket = state.sockets.get_mut::<icmp::Socket>(handle);
            if socket.can_recv() {
                match socket.recv_slice(&mut recv_buf) {
                    Ok((len, from)) => Some((len, from)),
                    Err(e) => {
                        state.remove_socket(handle);
                        return Err(Error::Liveness(format!("icmp recv: {:?}", e)));
                    }
                }
            } else {
                None
            }
        };

        if let Some((len, from)) = reply {
            if from == target_addr
                && match_echo_reply(&recv_buf[..len], target_addr, v6_src, ident, seq_no, &payload)
            {
                state.remove_socket(handle);
                drop(state);
                stack.kick();
                return Ok(());
            }
        }

        if Instant::now() >= deadline {
            state.remove_socket(handle);
            drop(state);
            stack.kick();
            return Err(Error::Liveness(format!("ping to {} timed out", target)));
        }

        drop(state);
        tokio::select! {
            _ = stack.parked() => {}
            _ = tokio::time::sleep(Duration::from_millis(100)) => {}
        }
    }
}

/// One matcher for both families. The IPv6 path needs the chosen source
/// address to validate the embedded checksum.
fn match_echo_reply(
    buf: &[u8],
    target: IpAddress,
    v6_src: Option<Ipv6Address>,
    ident: u16,
    seq_no: u16,
    payload: &[u8],
) -> bool {
    match target {
        IpAddress::Ipv4(_) => {
            let packet = match Icmpv4Packet::new_checked(buf) {
                Ok(packet) => packet,
                Err(_) => return false,
            };
            matches!(
                Icmpv4Repr::parse(&packet, &ChecksumCapabilities::ignored()),
                Ok(Icmpv4Repr::EchoReply {
                    ident: reply_ident,
                    seq_no: reply_seq,
                    data,
                }) if reply_ident == ident && reply_seq == seq_no && data == payload
            )
        }
        IpAddress::Ipv6(dst) => {
            let Some(src) = v6_src else {
                return false;
            };
            let packet = match Icmpv6Packet::new_checked(buf) {
                Ok(packet) => packet,
                Err(_) => return false,
            };
            matches!(
                Icmpv6Repr::parse(
                    &IpAddress::Ipv6(src),
                    &IpAddress::Ipv6(dst),
                    &packet,
                    &ChecksumCapabilities::ignored(),
                ),
                Ok(Icmpv6Repr::EchoReply {
                    ident: reply_ident,
                    seq_no: reply_seq,
                    data,
                }) if reply_ident == ident && reply_seq == seq_no && data == payload
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stack::Stack;

    fn echo_reply_v4(ident: u16, seq_no: u16, payload: &[u8]) -> Vec<u8> {
        let repr = Icmpv4Repr::EchoReply {
            ident,
            seq_no,
            data: payload,
        };
        let mut buf = vec![0u8; repr.buffer_len()];
        repr.emit(
            &mut Icmpv4Packet::new_unchecked(&mut buf),
            &ChecksumCapabilities::default(),
        );
        buf
    }

    #[test]
    fn matcher_accepts_exact_reply() {
        let payload = [7u8; 16];
        let buf = echo_reply_v4(42, 9, &payload);
        let target = to_ip_address("10.0.0.1".parse().unwrap());
        assert!(match_echo_reply(&buf, target, None, 42, 9, &payload));
    }

    #[test]
    fn matcher_rejects_wrong_seq() {
        let payload = [7u8; 16];
        let buf = echo_reply_v4(42, 9, &payload);
        let target = to_ip_address("10.0.0.1".parse().unwrap());
        assert!(!match_echo_reply(&buf, target, None, 42, 10, &payload));
    }

    #[test]
    fn matcher_rejects_wrong_payload() {
        let payload = [7u8; 16];
        let other = [8u8; 16];
        let buf = echo_reply_v4(42, 9, &payload);
        let target = to_ip_address("10.0.0.1".parse().unwrap());
        assert!(!match_echo_reply(&buf, target, None, 42, 9, &other));
    }

    #[test]
    fn matcher_rejects_garbage() {
        let target = to_ip_address("10.0.0.1".parse().unwrap());
        assert!(!match_echo_reply(&[0xFF; 4], target, None, 1, 1, &[]));
    }

    #[tokio::test]
    async fn ping_emits_echo_request_packet() {
        let stack = Stack::new(&["10.5.0.2".parse().unwrap()], 1420).unwrap();
        let pinger = {
            let stack = stack.clone();
            tokio::spawn(async move {
                ping(&stack, "10.0.0.1".parse().unwrap(), Duration::from_millis(300)).await
            })
        };

        // Give the probe a moment to queue its request, then inspect the
        // emitted frame.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let frames = {
            let mut state = stack.lock().await;
            state.poll();
            state.drain_outbound()
        };
        assert!(!frames.is_empty());
        let frame = &frames[0];
        assert_eq!(frame[9], 1); // ICMP
        assert_eq!(&frame[16..20], &[10, 0, 0, 1]);
        assert_eq!(frame[20], 8); // Echo Request

        // No reply is ever injected, so the probe must time out.
        let result = pinger.await.unwrap();
        assert!(result.is_err());
    }
}
