//! Bidirectional UDP NAT tunnel.
//!
//! Each unique local source address gets its own session holding a
//! tunnel-side UDP socket. Sessions are reused while traffic flows and a
//! janitor closes the ones that sit idle past the configured window.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::common::Address;
use crate::stack::udp::VirtUdpSocket;
use crate::tun::VirtualTun;

/// Largest datagram accepted from either side.
const MAX_DATAGRAM: usize = 64 * 1024;
/// Read deadline on the session reader; the close signal is checked
/// between attempts.
const SESSION_READ_DEADLINE: Duration = Duration::from_secs(5);
/// Janitor sweep interval.
const SWEEP_INTERVAL: Duration = Duration::from_secs(10);

struct UdpSession {
    remote_conn: VirtUdpSocket,
    last_active: Mutex<Instant>,
    close_signal: CancellationToken,
}

impl UdpSession {
    async fn touch(&self) {
        *self.last_active.lock().await = Instant::now();
    }

    async fn idle_for(&self) -> Duration {
        self.last_active.lock().await.elapsed()
    }
}

type SessionTable = Arc<Mutex<HashMap<String, Arc<UdpSession>>>>;

pub struct UdpProxyTunnel {
    bind: SocketAddr,
    target: String,
    inactivity: Duration,
}

impl UdpProxyTunnel {
    pub fn new(bind: SocketAddr, target: String, inactivity_secs: u64) -> Self {
        Self {
            bind,
            target,
            inactivity: Duration::from_secs(inactivity_secs),
        }
    }

    pub async fn run(self, vt: Arc<VirtualTun>) -> Result<()> {
        let listener = Arc::new(
            UdpSocket::bind(self.bind)
                .await
                .with_context(|| format!("udp tunnel listen on {}", self.bind))?,
        );
        info!(addr = %self.bind, target = %self.target, "udp tunnel listening");

        let sessions: SessionTable = Arc::new(Mutex::new(HashMap::new()));

        if !self.inactivity.is_zero() {
            let sessions = sessions.clone();
            let inactivity = self.inactivity;
            tokio::spawn(async move {
                janitor_loop(sessions, inactivity).await;
            });
        }

        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let (n, src) = match listener.recv_from(&mut buf).await {
                Ok(pair) => pair,
                Err(e) => {
                    error!(error = %e, "udp tunnel read failed");
                    continue;
                }
            };

            let session = match self
                .get_or_create_session(&vt, &sessions, &listener, src)
                .await
            {
                Ok(session) => session,
                Err(e) => {
                    error!(src = %src, error = %e, "udp session setup failed");
                    continue;
                }
            };

            session.touch().await;
            if let Err(e) = session.remote_conn.send(&buf[..n]).await {
                // Session stays alive; the janitor or the reader decides
                // when it dies.
                error!(target = %self.target, error = %e, "udp write to remote failed");
            }
        }
    }

    async fn get_or_create_session(
        &self,
        vt: &Arc<VirtualTun>,
        sessions: &SessionTable,
        listener: &Arc<UdpSocket>,
        src: SocketAddr,
    ) -> Result<Arc<UdpSession>> {
        let src_key = src.to_string();
        let mut table = sessions.lock().await;
        if let Some(session) = table.get(&src_key) {
            session.touch().await;
            return Ok(session.clone());
        }

        let target = Address::parse(&self.target)?;
        let addr = match target {
            Address::Ip(addr) => addr,
            Address::Domain(host, port) => vt.resolve_to_addr_port(&host, port).await?,
        };
        let remote_conn = vt.dial_udp(addr).await?;

        let session = Arc::new(UdpSession {
            remote_conn,
            last_active: Mutex::new(Instant::now()),
            close_signal: CancellationToken::new(),
        });
        table.insert(src_key.clone(), session.clone());
        debug!(src = %src, target = %addr, "udp session created");

        {
            let session = session.clone();
            let listener = listener.clone();
            let sessions = sessions.clone();
            tokio::spawn(async move {
                remote_to_local(&session, &listener, src).await;
                session.remote_conn.close().await;
                // The janitor may have already replaced this entry with a
                // fresh session for the same source; only evict our own.
                let mut table = sessions.lock().await;
                if let Some(current) = table.get(&src_key) {
                    if Arc::ptr_eq(current, &session) {
                        table.remove(&src_key);
                    }
                }
            });
        }

        Ok(session)
    }
}

/// Remote → local pump for one session. Runs until the close signal fires
/// or the remote side errors out.
async fn remote_to_local(session: &UdpSession, listener: &UdpSocket, src: SocketAddr) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        if session.close_signal.is_cancelled() {
            return;
        }

        let n = match tokio::time::timeout(
            SESSION_READ_DEADLINE,
            session.remote_conn.recv(&mut buf),
        )
        .await
        {
            // Deadline: check the close signal and keep reading.
            Err(_) => continue,
            Ok(Err(e)) => {
                error!(src = %src, error = %e, "udp read from remote failed");
                return;
            }
            Ok(Ok(n)) => n,
        };

        session.touch().await;
        if let Err(e) = listener.send_to(&buf[..n], src).await {
            error!(src = %src, error = %e, "udp write to local failed");
            return;
        }
    }
}

async fn janitor_loop(sessions: SessionTable, inactivity: Duration) {
    let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
    loop {
        ticker.tick().await;
        let mut table = sessions.lock().await;
        let mut expired = Vec::new();
        for (key, session) in table.iter() {
            if session.idle_for().await >= inactivity {
                expired.push(key.clone());
            }
        }
        for key in expired {
            if let Some(session) = table.remove(&key) {
                info!(src = %key, "closing inactive udp session");
                session.close_signal.cancel();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn make_session() -> Arc<UdpSession> {
        let stack = crate::stack::Stack::new(&["10.5.0.2".parse().unwrap()], 1420).unwrap();
        let remote_conn = VirtUdpSocket::connect(stack, "10.0.0.1:53".parse().unwrap())
            .await
            .unwrap();
        Arc::new(UdpSession {
            remote_conn,
            last_active: Mutex::new(Instant::now()),
            close_signal: CancellationToken::new(),
        })
    }

    #[tokio::test]
    async fn touch_resets_idle_clock() {
        let session = make_session().await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(session.idle_for().await >= Duration::from_millis(40));
        session.touch().await;
        assert!(session.idle_for().await < Duration::from_millis(40));
    }

    #[tokio::test]
    async fn stale_reader_does_not_evict_replacement_session() {
        let old_session = make_session().await;
        let new_session = make_session().await;
        let src_key = "127.0.0.1:5555".to_string();

        // The janitor expired the old session and a fresh datagram already
        // created a replacement under the same key.
        let sessions: SessionTable = Arc::new(Mutex::new(HashMap::new()));
        sessions
            .lock()
            .await
            .insert(src_key.clone(), new_session.clone());

        // The old session's reader wakes up late and runs its cleanup.
        {
            let mut table = sessions.lock().await;
            if let Some(current) = table.get(&src_key) {
                if Arc::ptr_eq(current, &old_session) {
                    table.remove(&src_key);
                }
            }
        }

        // The replacement stays owned by the table.
        let table = sessions.lock().await;
        assert!(Arc::ptr_eq(table.get(&src_key).unwrap(), &new_session));
    }

    #[tokio::test]
    async fn janitor_expires_idle_sessions() {
        let session = make_session().await;

        let sessions: SessionTable = Arc::new(Mutex::new(HashMap::new()));
        sessions
            .lock()
            .await
            .insert("127.0.0.1:5555".to_string(), session.clone());

        // Sweep with a zero-length inactivity window: everything expires.
        {
            let mut table = sessions.lock().await;
            let mut expired = Vec::new();
            for (key, s) in table.iter() {
                if s.idle_for().await >= Duration::ZERO {
                    expired.push(key.clone());
                }
            }
            for key in expired {
                if let Some(s) = table.remove(&key) {
                    s.close_signal.cancel();
                }
            }
        }

        assert!(sessions.lock().await.is_empty());
        assert!(session.close_signal.is_cancelled());
    }
}
